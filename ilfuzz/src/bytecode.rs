//! A compact object model for managed bytecode modules.
//!
//! The instrumentation only needs a handful of capabilities from a module:
//! enumerate its types and methods, read and rewrite method bodies, resolve
//! member references that point back into the module, and serialize the
//! result. Images are stored as CBOR so that rewriting the same module twice
//! yields byte-identical output.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::InstrumentationError;

/// Module flag: the image contains bytecode only.
pub const FLAG_IL_ONLY: u32 = 0x1;
/// Module flag: the image is a library that mixes native and managed code.
pub const FLAG_IL_LIBRARY: u32 = 0x4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl Version {
    pub fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyRef {
    pub name: String,
    pub version: Version,
}

/// Where a [`TypeRef`] is resolved from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionScope {
    /// Declared in the referencing module itself.
    Module,
    /// Declared in the named referenced assembly.
    Assembly(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    pub namespace: String,
    pub name: String,
    pub scope: ResolutionScope,
}

impl TypeRef {
    pub fn full_name(&self) -> String {
        join_type_name(&self.namespace, &self.name)
    }
}

/// A reference to a field or method of some type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub declaring_type: TypeRef,
    pub name: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: String,
    pub is_static: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeType {
    Il,
    Native,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub return_type: String,
    pub parameters: Vec<String>,
    pub is_static: bool,
    pub code_type: CodeType,
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// True for methods whose body is bytecode that can be rewritten.
    pub fn has_il_body(&self) -> bool {
        self.code_type == CodeType::Il && self.body.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub namespace: String,
    /// Simple name; nested types use `Outer/Inner`.
    pub name: String,
    pub base_type: Option<TypeRef>,
    pub is_abstract: bool,
    pub is_sealed: bool,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            base_type: None,
            is_abstract: false,
            is_sealed: false,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn full_name(&self) -> String {
        join_type_name(&self.namespace, &self.name)
    }

    pub fn has_methods(&self) -> bool {
        !self.methods.is_empty()
    }

    /// Full name of one of this type's methods, e.g.
    /// `System.Int32 Acme.Parser::Parse(System.String,System.Int32)`.
    pub fn method_full_name(&self, method: &MethodDef) -> String {
        format!(
            "{} {}::{}({})",
            method.return_type,
            self.full_name(),
            method.name,
            method.parameters.join(",")
        )
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn find_method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// How control leaves an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    Next,
    Call,
    Branch,
    CondBranch,
    Return,
    Throw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    Nop,
    Ldarg,
    Starg,
    Ldloc,
    Stloc,
    Ldloca,
    LdcI4,
    Ldstr,
    Ldnull,
    Ldsfld,
    Stsfld,
    Ldfld,
    Stfld,
    Call,
    Callvirt,
    Newobj,
    Ret,
    Br,
    Brtrue,
    Brfalse,
    Beq,
    BneUn,
    Blt,
    Ble,
    Bgt,
    Bge,
    Switch,
    Leave,
    Throw,
    Rethrow,
    Endfinally,
    Endfilter,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Neg,
    Not,
    Ceq,
    Cgt,
    Clt,
    Dup,
    Pop,
    ConvI,
    ConvU1,
    LdindU1,
    StindI1,
}

impl OpCode {
    pub fn flow_control(self) -> FlowControl {
        match self {
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj => FlowControl::Call,
            OpCode::Br | OpCode::Leave => FlowControl::Branch,
            OpCode::Brtrue
            | OpCode::Brfalse
            | OpCode::Beq
            | OpCode::BneUn
            | OpCode::Blt
            | OpCode::Ble
            | OpCode::Bgt
            | OpCode::Bge
            | OpCode::Switch => FlowControl::CondBranch,
            OpCode::Ret | OpCode::Endfinally | OpCode::Endfilter => FlowControl::Return,
            OpCode::Throw | OpCode::Rethrow => FlowControl::Throw,
            _ => FlowControl::Next,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    None,
    Int32(i32),
    String(String),
    Local(u16),
    Arg(u16),
    Field(MemberRef),
    Method(MemberRef),
    /// Index of the target instruction in the same body.
    Target(usize),
    Targets(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(opcode: OpCode) -> Self {
        Self {
            opcode,
            operand: Operand::None,
        }
    }

    pub fn with(opcode: OpCode, operand: Operand) -> Self {
        Self { opcode, operand }
    }

    /// Branch targets of this instruction, if any.
    pub fn targets(&self) -> &[usize] {
        match &self.operand {
            Operand::Target(target) => std::slice::from_ref(target),
            Operand::Targets(targets) => targets,
            _ => &[],
        }
    }

    fn targets_mut(&mut self) -> &mut [usize] {
        match &mut self.operand {
            Operand::Target(target) => std::slice::from_mut(target),
            Operand::Targets(targets) => targets,
            _ => &mut [],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    Catch,
    Filter,
    Finally,
    Fault,
}

/// A protected region; ends are exclusive instruction indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    pub try_start: usize,
    pub try_end: usize,
    pub handler_start: usize,
    pub handler_end: usize,
    pub filter_start: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodBody {
    pub max_stack: u16,
    pub locals: Vec<String>,
    pub instructions: Vec<Instruction>,
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Checks that every branch target and handler boundary lies inside the body.
    pub fn validate(&self, method: &str) -> Result<(), InstrumentationError> {
        let len = self.instructions.len();
        for (index, instruction) in self.instructions.iter().enumerate() {
            if let Some(&target) = instruction.targets().iter().find(|&&t| t >= len) {
                return Err(InstrumentationError::InvalidBranchTarget {
                    method: method.to_string(),
                    index,
                    target,
                });
            }
        }
        for (handler, eh) in self.exception_handlers.iter().enumerate() {
            let ordered = eh.try_start < eh.try_end
                && eh.handler_start < eh.handler_end
                && eh.try_end <= len
                && eh.handler_end <= len
                && eh.filter_start.is_none_or(|f| f < eh.handler_start);
            if !ordered {
                return Err(InstrumentationError::InvalidHandler {
                    method: method.to_string(),
                    handler,
                });
            }
        }
        Ok(())
    }

    /// Rewrites every instruction index held by branches and handlers
    /// through `map`, which must have one entry per instruction plus one
    /// for the end of the body.
    pub(crate) fn remap_indices(&mut self, map: &[usize]) {
        for instruction in &mut self.instructions {
            for target in instruction.targets_mut() {
                *target = map[*target];
            }
        }
        for eh in &mut self.exception_handlers {
            eh.try_start = map[eh.try_start];
            eh.try_end = map[eh.try_end];
            eh.handler_start = map[eh.handler_start];
            eh.handler_end = map[eh.handler_end];
            eh.filter_start = eh.filter_start.map(|f| map[f]);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub version: Version,
    pub flags: u32,
    pub assembly_refs: Vec<AssemblyRef>,
    pub types: Vec<TypeDef>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: Version::default(),
            flags: FLAG_IL_ONLY,
            assembly_refs: Vec::new(),
            types: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, InstrumentationError> {
        let bytes = std::fs::read(path).map_err(|source| InstrumentationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InstrumentationError> {
        Ok(serde_cbor::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, InstrumentationError> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn is_il_only(&self) -> bool {
        self.flags & FLAG_IL_ONLY != 0
    }

    pub fn find_type(&self, full_name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.full_name() == full_name)
    }

    pub fn references_assembly(&self, name: &str) -> bool {
        self.assembly_refs.iter().any(|r| r.name == name)
    }

    /// Resolves a member reference declared inside this module. References
    /// into other assemblies never resolve.
    pub fn resolve_method(&self, member: &MemberRef) -> Option<&MethodDef> {
        self.resolve_type(&member.declaring_type)?
            .find_method(&member.name)
    }

    pub fn resolve_field(&self, member: &MemberRef) -> Option<&FieldDef> {
        self.resolve_type(&member.declaring_type)?
            .find_field(&member.name)
    }

    fn resolve_type(&self, type_ref: &TypeRef) -> Option<&TypeDef> {
        match type_ref.scope {
            ResolutionScope::Module => self.find_type(&type_ref.full_name()),
            ResolutionScope::Assembly(_) => None,
        }
    }

    /// Validates every method body in the module.
    pub fn validate(&self) -> Result<(), InstrumentationError> {
        for ty in &self.types {
            for method in &ty.methods {
                if let Some(body) = &method.body {
                    body.validate(&ty.method_full_name(method))?;
                }
            }
        }
        Ok(())
    }
}

fn join_type_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn body(instructions: Vec<Instruction>) -> MethodBody {
        MethodBody {
            max_stack: 8,
            instructions,
            ..MethodBody::default()
        }
    }

    #[test]
    fn method_full_name_includes_signature() {
        let mut ty = TypeDef::new("Acme.Text", "Parser");
        ty.methods.push(MethodDef {
            name: "Parse".to_string(),
            return_type: "System.Int32".to_string(),
            parameters: vec!["System.String".to_string(), "System.Int32".to_string()],
            is_static: true,
            code_type: CodeType::Il,
            body: None,
        });
        assert_eq!(ty.full_name(), "Acme.Text.Parser");
        assert_eq!(
            ty.method_full_name(&ty.methods[0]),
            "System.Int32 Acme.Text.Parser::Parse(System.String,System.Int32)"
        );
        assert_eq!(TypeDef::new("", "Program").full_name(), "Program");
    }

    #[test]
    fn validate_rejects_out_of_range_branch() {
        let b = body(vec![
            Instruction::with(OpCode::Br, Operand::Target(5)),
            Instruction::new(OpCode::Ret),
        ]);
        assert_matches!(
            b.validate("M"),
            Err(InstrumentationError::InvalidBranchTarget {
                index: 0,
                target: 5,
                ..
            })
        );
    }

    #[test]
    fn validate_rejects_inverted_handler() {
        let mut b = body(vec![
            Instruction::new(OpCode::Nop),
            Instruction::with(OpCode::Leave, Operand::Target(3)),
            Instruction::new(OpCode::Endfinally),
            Instruction::new(OpCode::Ret),
        ]);
        b.exception_handlers.push(ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: 2,
            try_end: 0,
            handler_start: 2,
            handler_end: 3,
            filter_start: None,
        });
        assert_matches!(
            b.validate("M"),
            Err(InstrumentationError::InvalidHandler { handler: 0, .. })
        );
    }

    #[test]
    fn image_survives_a_trip_through_disk() {
        let mut module = Module::new("Acme");
        module.version = Version::new(1, 2, 3, 4);
        let mut ty = TypeDef::new("Acme", "Widget");
        ty.methods.push(MethodDef {
            name: "Run".to_string(),
            return_type: "System.Void".to_string(),
            parameters: vec![],
            is_static: true,
            code_type: CodeType::Il,
            body: Some(body(vec![Instruction::new(OpCode::Ret)])),
        });
        module.types.push(ty);

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), module.to_bytes().unwrap()).unwrap();
        assert_eq!(Module::load(file.path()).unwrap(), module);
    }

    #[test]
    fn garbage_is_malformed() {
        assert_matches!(
            Module::from_bytes(b"definitely not a module"),
            Err(InstrumentationError::Malformed(_))
        );
    }

    #[test]
    fn member_references_resolve_only_inside_the_module() {
        let mut module = Module::new("Acme");
        let mut ty = TypeDef::new("Acme", "Holder");
        ty.fields.push(FieldDef {
            name: "Value".to_string(),
            field_type: "System.Int32".to_string(),
            is_static: true,
        });
        module.types.push(ty);

        let local = MemberRef {
            declaring_type: TypeRef {
                namespace: "Acme".to_string(),
                name: "Holder".to_string(),
                scope: ResolutionScope::Module,
            },
            name: "Value".to_string(),
            signature: "System.Int32".to_string(),
        };
        assert!(module.resolve_field(&local).is_some());
        assert!(module.resolve_method(&local).is_none());

        let mut external = local.clone();
        external.declaring_type.scope = ResolutionScope::Assembly("Other".to_string());
        assert!(module.resolve_field(&external).is_none());
    }
}
