//! This module defines constants used throughout the instrumentation and
//! execution-control code. These constants are related to AFL-style coverage
//! maps, the driver's fork-server transport and the trace type that
//! instrumented modules call into.

/// The size of the shared memory map used for AFL-style coverage tracking.
/// This value (2^16) is standard for AFL.
pub const MAP_SIZE: usize = 1 << 16;

/// Mask applied to a hashed edge so it always lands inside the map.
pub const MAP_MASK: usize = MAP_SIZE - 1;

/// The environment variable the driver uses to pass the shared memory id.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// File descriptor the driver writes its per-iteration ping to.
/// The status pipe is always the next descriptor.
pub const FORKSRV_FD: i32 = 198;

/// Default upper bound for a single input read by string harnesses.
pub const DEFAULT_BUFFER_SIZE: usize = 10_000_000;

/// Name of the assembly that ships the trace type instrumented modules reference.
pub const TRACE_ASSEMBLY_NAME: &str = "IlFuzz.Common";

/// Namespace of the trace type.
pub const TRACE_NAMESPACE: &str = "IlFuzz.Common";

/// Simple name of the trace type.
pub const TRACE_TYPE_NAME: &str = "Trace";

/// Static field holding the coverage map pointer.
pub const SHARED_MEM_FIELD: &str = "SharedMem";

/// Static field holding the previous location register.
pub const PREV_LOCATION_FIELD: &str = "PrevLocation";

/// Static field holding the observer callback.
pub const ON_BRANCH_FIELD: &str = "OnBranch";

/// Probe performing the saturating-counter update.
pub const ON_BRANCH_CALL_METHOD: &str = "OnBranchCall";

/// Probe performing the bitset update.
pub const ON_BRANCH_ALTER_METHOD: &str = "OnBranchAlter";

/// The runtime's own core library. It cannot reference other assemblies, so
/// the trace type is synthesized into it instead.
pub const CORE_LIBRARY_NAME: &str = "System.Private.CoreLib";

/// Seed of the branch identifier generator.
pub const ID_SEED: u64 = 0x130f_4c29;

/// Identifier width in the default (saturating) hashing mode.
pub const DEFAULT_ID_BITS: u8 = 8;

/// Identifier width in the alternate (bitset) hashing mode.
pub const ALTERNATE_ID_BITS: u8 = 20;

/// Full name of the trace type, `Namespace.Name`.
pub fn trace_type_full_name() -> String {
    format!("{TRACE_NAMESPACE}.{TRACE_TYPE_NAME}")
}
