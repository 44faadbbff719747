//! Branch coverage instrumentation for managed bytecode modules.
//!
//! The goal is to inject code into every method of a module that records the
//! edges taken between branch sites, AFL style. This is achieved by:
//! 1.  Making a trace type reachable from the module: either a reference to
//!     `IlFuzz.Common.Trace`, or (for the core library, which cannot reference
//!     anything) an equivalent type synthesized into the module itself.
//! 2.  Finding every branch site of every matched method: the method entry,
//!     each branch target, the fall-through of each conditional branch and
//!     each exception handler or filter entry.
//! 3.  Inserting a probe in front of each site and retargeting branches and
//!     handler boundaries to the probe, so that it runs on every path into
//!     the site.
//! 4.  Validating the rewritten module and only then writing it back.

use std::collections::BTreeSet;
use std::path::Path;

use crate::bytecode::{
    AssemblyRef, CodeType, FLAG_IL_LIBRARY, FieldDef, FlowControl, Instruction, MemberRef, MethodBody,
    MethodDef, Module, OpCode, Operand, ResolutionScope, TypeDef, TypeRef, Version,
};
use crate::constants::{
    CORE_LIBRARY_NAME, MAP_MASK, MAP_SIZE, ON_BRANCH_ALTER_METHOD, ON_BRANCH_CALL_METHOD,
    ON_BRANCH_FIELD, PREV_LOCATION_FIELD, SHARED_MEM_FIELD, TRACE_ASSEMBLY_NAME, TRACE_NAMESPACE,
    TRACE_TYPE_NAME, trace_type_full_name,
};
use crate::error::InstrumentationError;
use crate::id_generator::IdGenerator;
use crate::options::Options;

const PROBE_SIGNATURE: &str = "System.Void (System.Int32,System.String)";

/// The shape of the code inserted at each branch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Calls `Trace::OnBranchCall`.
    Counter,
    /// Calls `Trace::OnBranchAlter`.
    Bitset,
    /// Counter update performed directly on the trace fields, without any call.
    Inline,
    /// Bitset update performed directly on the trace fields.
    InlineBitset,
}

/// A probe template bound to the members of one trace type.
#[derive(Debug, Clone)]
pub struct Probe {
    kind: ProbeKind,
    shared_mem: MemberRef,
    prev_location: MemberRef,
    callback: Option<MemberRef>,
}

impl Probe {
    pub fn new(kind: ProbeKind, trace_type: &TypeRef) -> Self {
        let callback = match kind {
            ProbeKind::Counter => Some(ON_BRANCH_CALL_METHOD),
            ProbeKind::Bitset => Some(ON_BRANCH_ALTER_METHOD),
            ProbeKind::Inline | ProbeKind::InlineBitset => None,
        };
        Self {
            kind,
            shared_mem: member(trace_type, SHARED_MEM_FIELD, "System.Byte*"),
            prev_location: member(trace_type, PREV_LOCATION_FIELD, "System.Int32"),
            callback: callback.map(|name| member(trace_type, name, PROBE_SIGNATURE)),
        }
    }

    /// Picks the probe for a whole module.
    ///
    /// A trace type declared inside the module only carries the fields, so a
    /// callback that does not resolve there falls back to the inline update
    /// of the same discipline.
    pub fn select(options: &Options, module: &Module, trace_type: &TypeRef) -> Self {
        let requested = if options.alternate_trace_mode {
            ProbeKind::Bitset
        } else if options.enable_on_branch_callback {
            ProbeKind::Counter
        } else {
            ProbeKind::Inline
        };

        let probe = Self::new(requested, trace_type);
        match (&probe.callback, &trace_type.scope) {
            (Some(callback), ResolutionScope::Module)
                if module.resolve_method(callback).is_none() =>
            {
                log::warn!(
                    "{} declares no {}, falling back to inline probes",
                    trace_type.full_name(),
                    callback.name
                );
                let inline = match requested {
                    ProbeKind::Bitset => ProbeKind::InlineBitset,
                    _ => ProbeKind::Inline,
                };
                Self::new(inline, trace_type)
            }
            _ => probe,
        }
    }

    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    /// Extra evaluation stack slots the probe needs.
    pub fn stack_depth(&self) -> u16 {
        match self.kind {
            ProbeKind::InlineBitset => 5,
            ProbeKind::Inline => 3,
            ProbeKind::Counter | ProbeKind::Bitset => 2,
        }
    }

    fn emit(&self, id: u32, method_name: &str, out: &mut Vec<Instruction>) {
        let id = id as i32;
        if let Some(callback) = &self.callback {
            out.push(Instruction::with(OpCode::LdcI4, Operand::Int32(id)));
            out.push(Instruction::with(
                OpCode::Ldstr,
                Operand::String(method_name.to_string()),
            ));
            out.push(Instruction::with(
                OpCode::Call,
                Operand::Method(callback.clone()),
            ));
            return;
        }

        let shared_mem = Operand::Field(self.shared_mem.clone());
        let prev_location = Operand::Field(self.prev_location.clone());
        let hash = [
            Instruction::with(OpCode::LdcI4, Operand::Int32(id)),
            Instruction::with(OpCode::Ldsfld, prev_location.clone()),
            Instruction::new(OpCode::Xor),
        ];
        out.push(Instruction::with(OpCode::Ldsfld, shared_mem));
        out.extend(hash.iter().cloned());
        if self.kind == ProbeKind::InlineBitset {
            // &SharedMem[(h >> 4) & MASK]; *cell |= 1 << (h & 7)
            out.extend([
                Instruction::with(OpCode::LdcI4, Operand::Int32(4)),
                Instruction::new(OpCode::Shr),
                Instruction::with(OpCode::LdcI4, Operand::Int32(MAP_MASK as i32)),
                Instruction::new(OpCode::And),
                Instruction::new(OpCode::ConvI),
                Instruction::new(OpCode::Add),
                Instruction::new(OpCode::Dup),
                Instruction::new(OpCode::LdindU1),
                Instruction::with(OpCode::LdcI4, Operand::Int32(1)),
            ]);
            out.extend(hash);
            out.extend([
                Instruction::with(OpCode::LdcI4, Operand::Int32(7)),
                Instruction::new(OpCode::And),
                Instruction::new(OpCode::Shl),
                Instruction::new(OpCode::Or),
                Instruction::new(OpCode::StindI1),
            ]);
        } else {
            // &SharedMem[h & MASK]; ++*cell
            out.extend([
                Instruction::with(OpCode::LdcI4, Operand::Int32(MAP_MASK as i32)),
                Instruction::new(OpCode::And),
                Instruction::new(OpCode::ConvI),
                Instruction::new(OpCode::Add),
                Instruction::new(OpCode::Dup),
                Instruction::new(OpCode::LdindU1),
                Instruction::with(OpCode::LdcI4, Operand::Int32(1)),
                Instruction::new(OpCode::Add),
                Instruction::new(OpCode::StindI1),
            ]);
        }
        // PrevLocation = id >> 1
        out.extend([
            Instruction::with(OpCode::LdcI4, Operand::Int32(id >> 1)),
            Instruction::with(OpCode::Stsfld, prev_location),
        ]);
    }
}

fn member(declaring_type: &TypeRef, name: &str, signature: &str) -> MemberRef {
    MemberRef {
        declaring_type: declaring_type.clone(),
        name: name.to_string(),
        signature: signature.to_string(),
    }
}

/// Indices of the instructions that start a branch site.
pub fn branch_sites(body: &MethodBody) -> BTreeSet<usize> {
    let len = body.instructions.len();
    let mut sites = BTreeSet::new();
    if len == 0 {
        return sites;
    }

    sites.insert(0);
    for (index, instruction) in body.instructions.iter().enumerate() {
        sites.extend(instruction.targets().iter().copied());
        if instruction.opcode.flow_control() == FlowControl::CondBranch && index + 1 < len {
            sites.insert(index + 1);
        }
    }
    for handler in &body.exception_handlers {
        sites.insert(handler.handler_start);
        sites.extend(handler.filter_start);
    }
    sites
}

/// Inserts `probe` in front of every branch site of `body`, drawing one
/// identifier per site from `ids` in instruction order. Returns the number of
/// probes inserted.
///
/// The body must be valid (see [`MethodBody::validate`]).
pub fn instrument_method(
    body: &mut MethodBody,
    method_name: &str,
    probe: &Probe,
    ids: &mut IdGenerator,
) -> usize {
    let sites = branch_sites(body);
    if sites.is_empty() {
        return 0;
    }

    let original = std::mem::take(&mut body.instructions);
    let mut rewritten = Vec::with_capacity(original.len() + sites.len() * 23);
    // Old index -> new index of whatever now runs first at that position.
    let mut map = Vec::with_capacity(original.len() + 1);

    for (index, instruction) in original.into_iter().enumerate() {
        map.push(rewritten.len());
        if sites.contains(&index) {
            probe.emit(ids.next_id(), method_name, &mut rewritten);
        }
        rewritten.push(instruction);
    }
    map.push(rewritten.len());

    body.instructions = rewritten;
    body.remap_indices(&map);
    body.max_stack = body.max_stack.saturating_add(probe.stack_depth());
    sites.len()
}

/// Instruments modules one after another, sharing one identifier sequence.
#[derive(Debug)]
pub struct Instrumenter {
    options: Options,
    ids: IdGenerator,
}

impl Instrumenter {
    pub fn new(options: Options) -> Self {
        let ids = IdGenerator::new(options.id_bits());
        Self { options, ids }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Instruments the module stored at `path` in place and returns the full
    /// names of the types that received probes.
    ///
    /// The file is only overwritten once the whole module has been rewritten
    /// and validated.
    pub fn instrument_file<M>(
        &mut self,
        path: &Path,
        matcher: M,
    ) -> Result<BTreeSet<String>, InstrumentationError>
    where
        M: Fn(&str) -> bool,
    {
        let mut module = Module::load(path)?;
        let types = self.instrument_module(&mut module, matcher)?;
        let bytes = module.to_bytes()?;

        std::fs::write(path, bytes).map_err(|source| InstrumentationError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        log::info!(
            "Instrumented {} type(s) in {}",
            types.len(),
            path.display()
        );
        Ok(types)
    }

    /// Instruments `module` in memory.
    ///
    /// `matcher` is consulted once for every type that has methods and, for
    /// matched types, once for every method with a bytecode body. If an error
    /// is returned the module has not been modified.
    pub fn instrument_module<M>(
        &mut self,
        module: &mut Module,
        matcher: M,
    ) -> Result<BTreeSet<String>, InstrumentationError>
    where
        M: Fn(&str) -> bool,
    {
        let trace_name = trace_type_full_name();
        if module.find_type(&trace_name).is_some()
            || module.references_assembly(TRACE_ASSEMBLY_NAME)
        {
            return Err(InstrumentationError::AlreadyInstrumented);
        }
        if !module.is_il_only() && !self.options.instrument_mixed_mode {
            return Err(InstrumentationError::MixedMode);
        }
        module.validate()?;

        if !module.is_il_only() {
            module.flags &= !FLAG_IL_LIBRARY;
        }

        let trace_type = if module.name == CORE_LIBRARY_NAME {
            log::debug!("Synthesizing {trace_name} into {}", module.name);
            module.types.push(synthesize_trace_type());
            TypeRef {
                namespace: TRACE_NAMESPACE.to_string(),
                name: TRACE_TYPE_NAME.to_string(),
                scope: ResolutionScope::Module,
            }
        } else {
            if let Some(major) = self.options.new_version {
                module.version = Version::new(major, 0, 0, 0);
            }
            module.assembly_refs.push(AssemblyRef {
                name: TRACE_ASSEMBLY_NAME.to_string(),
                version: trace_assembly_version(),
            });
            TypeRef {
                namespace: TRACE_NAMESPACE.to_string(),
                name: TRACE_TYPE_NAME.to_string(),
                scope: ResolutionScope::Assembly(TRACE_ASSEMBLY_NAME.to_string()),
            }
        };

        let probe = Probe::select(&self.options, module, &trace_type);
        log::debug!("Using {:?} probes for {}", probe.kind(), module.name);

        let mut types = BTreeSet::new();
        for ty in &mut module.types {
            let type_name = ty.full_name();
            if type_name == trace_name || !ty.has_methods() || !matcher(&type_name) {
                continue;
            }

            for index in 0..ty.methods.len() {
                let method_name = ty.method_full_name(&ty.methods[index]);
                let method = &mut ty.methods[index];
                if !method.has_il_body() || !matcher(&method_name) {
                    continue;
                }
                if let Some(body) = method.body.as_mut() {
                    instrument_method(body, &method_name, &probe, &mut self.ids);
                    types.insert(type_name.clone());
                }
            }
        }

        module.validate()?;
        Ok(types)
    }
}

/// Instruments the module at `path` with a fresh identifier sequence.
pub fn instrument<M>(
    path: &Path,
    matcher: M,
    options: &Options,
) -> Result<BTreeSet<String>, InstrumentationError>
where
    M: Fn(&str) -> bool,
{
    Instrumenter::new(options.clone()).instrument_file(path, matcher)
}

fn trace_assembly_version() -> Version {
    Version::new(
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        0,
    )
}

/// The trace type a core library carries in place of a reference: the two
/// probe fields, the observer slot and a static constructor that allocates
/// the default map.
fn synthesize_trace_type() -> TypeDef {
    let interop = |namespace: &str, name: &str| TypeRef {
        namespace: namespace.to_string(),
        name: name.to_string(),
        scope: ResolutionScope::Module,
    };
    let static_field = |name: &str, field_type: &str| FieldDef {
        name: name.to_string(),
        field_type: field_type.to_string(),
        is_static: true,
    };
    let trace_type = interop(TRACE_NAMESPACE, TRACE_TYPE_NAME);

    let cctor = MethodDef {
        name: ".cctor".to_string(),
        return_type: "System.Void".to_string(),
        parameters: Vec::new(),
        is_static: true,
        code_type: CodeType::Il,
        body: Some(MethodBody {
            max_stack: 1,
            locals: vec!["System.IntPtr".to_string()],
            instructions: vec![
                Instruction::with(OpCode::LdcI4, Operand::Int32(MAP_SIZE as i32)),
                Instruction::with(
                    OpCode::Call,
                    Operand::Method(member(
                        &interop("System.Runtime.InteropServices", "Marshal"),
                        "AllocHGlobal",
                        "System.IntPtr (System.Int32)",
                    )),
                ),
                Instruction::with(OpCode::Stloc, Operand::Local(0)),
                Instruction::with(OpCode::Ldloca, Operand::Local(0)),
                Instruction::with(
                    OpCode::Call,
                    Operand::Method(member(
                        &interop("System", "IntPtr"),
                        "ToPointer",
                        "System.Void* ()",
                    )),
                ),
                Instruction::with(
                    OpCode::Stsfld,
                    Operand::Field(member(&trace_type, SHARED_MEM_FIELD, "System.Byte*")),
                ),
                Instruction::new(OpCode::Ret),
            ],
            exception_handlers: Vec::new(),
        }),
    };

    let mut ty = TypeDef::new(TRACE_NAMESPACE, TRACE_TYPE_NAME);
    ty.base_type = Some(interop("System", "Object"));
    ty.is_abstract = true;
    ty.is_sealed = true;
    ty.fields = vec![
        static_field(SHARED_MEM_FIELD, "System.Byte*"),
        static_field(PREV_LOCATION_FIELD, "System.Int32"),
        static_field(
            ON_BRANCH_FIELD,
            "System.Action`2<System.Int32,System.String>",
        ),
    ];
    ty.methods = vec![cctor];
    ty
}
