use crate::constants::{ALTERNATE_ID_BITS, DEFAULT_ID_BITS};

pub const ENABLE_ON_BRANCH_CALLBACK_ENV: &str = "ILFUZZ_ENABLE_ON_BRANCH_CALLBACK";
pub const ALTER_TRACE_MODE_ENV: &str = "ILFUZZ_ALTER_TRACE_MODE";
pub const PRINT_INSTRUMENTED_TYPES_ENV: &str = "ILFUZZ_PRINT_INSTRUMENTED_TYPES";
pub const INSTRUMENT_MIXED_MODE_ENV: &str = "ILFUZZ_INSTRUMENT_MIXED_MODE_ASSEMBLIES";

/// Experimental options controlling the instrumentation behavior.
///
/// Every flag is switched on by the mere presence of its environment
/// variable, the value is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Route every probe through the trace observer callback.
    pub enable_on_branch_callback: bool,
    /// Use the bitset hashing discipline and widen the identifier space.
    pub alternate_trace_mode: bool,
    /// Print the instrumented types of every module.
    pub print_instrumented_types: bool,
    /// Permit rewriting modules that are not pure bytecode.
    pub instrument_mixed_mode: bool,
    /// If set, overrides the major version of the rewritten module.
    pub new_version: Option<u16>,
}

impl Options {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var_os(name).is_some())
    }

    /// Builds options from an arbitrary presence check, keyed by the
    /// environment variable names.
    pub fn from_lookup<F>(is_set: F) -> Self
    where
        F: Fn(&str) -> bool,
    {
        Self {
            enable_on_branch_callback: is_set(ENABLE_ON_BRANCH_CALLBACK_ENV),
            alternate_trace_mode: is_set(ALTER_TRACE_MODE_ENV),
            print_instrumented_types: is_set(PRINT_INSTRUMENTED_TYPES_ENV),
            instrument_mixed_mode: is_set(INSTRUMENT_MIXED_MODE_ENV),
            new_version: None,
        }
    }

    /// Width of the branch identifiers handed out for these options.
    pub fn id_bits(&self) -> u8 {
        if self.alternate_trace_mode {
            ALTERNATE_ID_BITS
        } else {
            DEFAULT_ID_BITS
        }
    }
}
