//! Shared module factories for the integration tests.

#![allow(dead_code)]

use std::path::Path;

use cilpatch::prelude::*;

/// `instance void (string, valuetype FileMode)` against TypeRef row 2
pub const TWO_PARAM_SIG: [u8; 6] = [0x20, 0x02, 0x01, 0x0E, 0x11, 0x09];
/// `instance void ()`
pub const VOID_SIG: [u8; 3] = [0x20, 0x00, 0x01];

/// A core library defining `System.IO.FileStream` with both constructors.
pub fn corlib(assembly_name: &str) -> Module {
    let mut corlib = Module::new(
        assembly_name,
        AssemblyVersion::new(4, 0, 0, 0),
        format!("{assembly_name}.dll"),
    );
    let stream = corlib
        .add_type_def(0x0010_2101, "System.IO", "FileStream", None)
        .unwrap();
    corlib
        .add_type_def(0x0000_0101, "System.IO", "FileMode", None)
        .unwrap();
    corlib
        .add_type_def(0x0000_0101, "System.IO", "FileAccess", None)
        .unwrap();

    // (string), (string, FileMode), (string, FileMode, FileAccess) against TypeDef rows 3 and 4
    for blob in [
        vec![0x20, 0x01, 0x01, 0x0E],
        vec![0x20, 0x02, 0x01, 0x0E, 0x11, 0x0C],
        vec![0x20, 0x03, 0x01, 0x0E, 0x11, 0x0C, 0x11, 0x10],
    ] {
        corlib
            .add_method(
                stream,
                MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME,
                ".ctor",
                blob,
                None,
            )
            .unwrap();
    }
    corlib
}

/// Save `corlib(name)` as `<dir>/<name>.dll`.
pub fn install_corlib(dir: &Path, assembly_name: &str) {
    corlib(assembly_name)
        .save(&dir.join(format!("{assembly_name}.dll")))
        .unwrap();
}

/// A game module referencing `references` in order, with `FileStream` and `FileMode`
/// TypeRefs scoped to the first one and the two-parameter constructor as MemberRef row 1.
pub struct GameBuilder {
    pub module: Module,
    pub two_param: Token,
    pub path: Token,
}

impl GameBuilder {
    pub fn new(references: &[&str]) -> Self {
        let mut module = Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.exe");
        let scopes: Vec<Token> = references
            .iter()
            .map(|name| module.add_assembly_ref(*name, AssemblyVersion::new(4, 0, 0, 0)))
            .collect();
        let stream = module
            .add_type_ref(scopes[0], "System.IO", "FileStream")
            .unwrap();
        module.add_type_ref(scopes[0], "System.IO", "FileMode").unwrap();
        let two_param = module
            .add_member_ref(stream, ".ctor", TWO_PARAM_SIG.to_vec())
            .unwrap();
        let path = module.add_user_string("Content/save.dat").unwrap();

        GameBuilder {
            module,
            two_param,
            path,
        }
    }

    /// Add a type, nested in `enclosing` if given.
    pub fn add_type(&mut self, namespace: &str, name: &str, enclosing: Option<Token>) -> Token {
        self.module
            .add_type_def(0x0010_0001, namespace, name, enclosing)
            .unwrap()
    }

    /// Add a method whose body opens `calls` files through the two-parameter constructor.
    pub fn add_opener(&mut self, owner: Token, name: &str, calls: usize) -> Token {
        let body = MethodBody::new(2, open_files(self.path, self.two_param, calls));
        self.module
            .add_method(owner, MethodAttributes::PUBLIC, name, VOID_SIG.to_vec(), Some(body))
            .unwrap()
    }

    /// Add a method with an arbitrary body.
    pub fn add_method(&mut self, owner: Token, name: &str, body: MethodBody) -> Token {
        self.module
            .add_method(owner, MethodAttributes::PUBLIC, name, VOID_SIG.to_vec(), Some(body))
            .unwrap()
    }

    /// Save the module as `<dir>/Game.exe` and return the path.
    pub fn save(&self, dir: &Path) -> std::path::PathBuf {
        let path = dir.join("Game.exe");
        self.module.save(&path).unwrap();
        path
    }
}

/// `calls` x { ldstr path; ldc.i4.3 (FileMode.Open); newobj ctor; pop }, then ret.
pub fn open_files(path: Token, ctor: Token, calls: usize) -> Vec<Instruction> {
    let mut instructions = Vec::with_capacity(calls * 4 + 1);
    for _ in 0..calls {
        instructions.push(Instruction::new(OpCode::LDSTR, Operand::Token(path)));
        instructions.push(Instruction::simple(OpCode::LDC_I4_3));
        instructions.push(Instruction::new(OpCode::NEWOBJ, Operand::Token(ctor)));
        instructions.push(Instruction::simple(OpCode::POP));
    }
    instructions.push(Instruction::simple(OpCode::RET));
    instructions
}

/// The instructions of `method`.
pub fn instructions(module: &Module, method: Token) -> Vec<Instruction> {
    module
        .method_def(method)
        .unwrap()
        .body
        .as_ref()
        .unwrap()
        .instructions()
        .to_vec()
}

/// Number of `newobj` calls in `method` to exactly `ctor`.
pub fn count_calls(module: &Module, method: Token, ctor: &ConstructorRef) -> usize {
    instructions(module, method)
        .iter()
        .filter(|instruction| instruction.opcode == OpCode::NEWOBJ)
        .filter_map(Instruction::token)
        .filter(|token| module.constructor_ref(*token).unwrap().as_ref() == Some(ctor))
        .count()
}

/// Number of `opcode` instructions in `method`.
pub fn count_opcode(module: &Module, method: Token, opcode: OpCode) -> usize {
    instructions(module, method)
        .iter()
        .filter(|instruction| instruction.opcode == opcode)
        .count()
}
