//! Finding the call sites of one constructor in method bodies.

use std::collections::HashMap;

use log::debug;

use crate::{
    assembly::OpCode,
    metadata::{module::Module, signatures::ConstructorRef, token::Token},
    Error::NotSupported,
    Result,
};

/// A `newobj` instruction selected for rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Position in the unmodified instruction sequence
    pub index: usize,
    /// The constructor token the instruction calls
    pub token: Token,
}

/// Finds `newobj` calls to exactly one constructor signature.
///
/// Only calls whose operand decodes to `wanted` match; calls to other overloads of the same
/// type, such as an already rewritten call, are ignored. Operands that cannot be decoded
/// into a plain constructor reference (generic instantiations, unsupported signature
/// encodings) never match.
pub struct Scanner<'m> {
    module: &'m Module,
    wanted: ConstructorRef,
    verdicts: HashMap<Token, bool>,
}

impl<'m> Scanner<'m> {
    /// Scan `module` for calls to `wanted`.
    #[must_use]
    pub fn new(module: &'m Module, wanted: ConstructorRef) -> Self {
        Scanner {
            module,
            wanted,
            verdicts: HashMap::new(),
        }
    }

    /// The constructor being searched for.
    #[must_use]
    pub fn wanted(&self) -> &ConstructorRef {
        &self.wanted
    }

    /// Matching call sites of `method`, in instruction order.
    ///
    /// The result is a snapshot of positions in the body as it is now.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `method` or a `newobj` operand points at a
    /// missing row, and signature decoding errors other than
    /// [`crate::Error::NotSupported`].
    pub fn scan(&mut self, method: Token) -> Result<Vec<CallSite>> {
        let module = self.module;
        let Some(body) = &module.method_def(method)?.body else {
            return Ok(Vec::new());
        };

        let mut sites = Vec::new();
        for (index, instruction) in body.instructions().iter().enumerate() {
            if instruction.opcode != OpCode::NEWOBJ {
                continue;
            }
            let Some(token) = instruction.token() else {
                continue;
            };
            if self.is_wanted(token)? {
                sites.push(CallSite { index, token });
            }
        }

        if !sites.is_empty() {
            debug!(
                "{}: {} call(s) to {}",
                method_display_name(module, method),
                sites.len(),
                self.wanted
            );
        }
        Ok(sites)
    }

    fn is_wanted(&mut self, token: Token) -> Result<bool> {
        if let Some(verdict) = self.verdicts.get(&token) {
            return Ok(*verdict);
        }

        let verdict = match self.module.constructor_ref(token) {
            Ok(Some(ctor)) => ctor == self.wanted,
            Ok(None) | Err(NotSupported) => false,
            Err(error) => return Err(error),
        };
        self.verdicts.insert(token, verdict);
        Ok(verdict)
    }
}

/// `Namespace.Type::Method` for log messages, the raw token if the rows are broken.
pub(crate) fn method_display_name(module: &Module, method: Token) -> String {
    module
        .method_def(method)
        .and_then(|def| Ok(format!("{}::{}", module.type_full_name(def.owner)?, def.name)))
        .unwrap_or_else(|_| method.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{Instruction, Operand},
        metadata::{
            method::{MethodAttributes, MethodBody},
            tables::AssemblyVersion,
        },
        patch::CtorRewrite,
    };

    /// A module whose `Worker::Run` constructs FileStreams through several overloads
    fn sample() -> (Module, Token) {
        let mut module = Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.dll");
        let corlib = module.add_assembly_ref("mscorlib", AssemblyVersion::new(4, 0, 0, 0));
        let stream = module.add_type_ref(corlib, "System.IO", "FileStream").unwrap();
        module.add_type_ref(corlib, "System.IO", "FileMode").unwrap();
        module.add_type_ref(corlib, "System.IO", "FileAccess").unwrap();
        let list = module
            .add_type_ref(corlib, "System.Collections.Generic", "List`1")
            .unwrap();

        let two = module
            .add_member_ref(stream, ".ctor", vec![0x20, 0x02, 0x01, 0x0E, 0x11, 0x09])
            .unwrap();
        let three = module
            .add_member_ref(
                stream,
                ".ctor",
                vec![0x20, 0x03, 0x01, 0x0E, 0x11, 0x09, 0x11, 0x0D],
            )
            .unwrap();
        let list_ctor = module
            .add_member_ref(list, ".ctor", vec![0x20, 0x00, 0x01])
            .unwrap();
        // Constructor on a TypeSpec parent
        let generic = module
            .add_member_ref(Token::new(0x1B00_0001), ".ctor", vec![0x20, 0x00, 0x01])
            .unwrap();
        // Varargs calling convention
        let vararg = module
            .add_member_ref(stream, ".ctor", vec![0x25, 0x00, 0x01])
            .unwrap();

        let worker = module.add_type_def(0x0010_0001, "Game", "Worker", None).unwrap();
        let path = module.add_user_string("save.dat").unwrap();
        let body = MethodBody::new(
            3,
            vec![
                Instruction::new(OpCode::LDSTR, Operand::Token(path)),
                Instruction::simple(OpCode::LDC_I4_3),
                Instruction::new(OpCode::NEWOBJ, Operand::Token(two)),
                Instruction::simple(OpCode::POP),
                Instruction::new(OpCode::NEWOBJ, Operand::Token(list_ctor)),
                Instruction::simple(OpCode::POP),
                Instruction::new(OpCode::NEWOBJ, Operand::Token(generic)),
                Instruction::simple(OpCode::POP),
                Instruction::new(OpCode::NEWOBJ, Operand::Token(vararg)),
                Instruction::simple(OpCode::POP),
                Instruction::new(OpCode::LDSTR, Operand::Token(path)),
                Instruction::simple(OpCode::LDC_I4_3),
                Instruction::simple(OpCode::LDC_I4_1),
                Instruction::new(OpCode::NEWOBJ, Operand::Token(three)),
                Instruction::simple(OpCode::POP),
                Instruction::new(OpCode::LDSTR, Operand::Token(path)),
                Instruction::simple(OpCode::LDC_I4_2),
                Instruction::new(OpCode::NEWOBJ, Operand::Token(two)),
                Instruction::simple(OpCode::RET),
            ],
        );
        let run = module
            .add_method(worker, MethodAttributes::PUBLIC, "Run", vec![0x20, 0x00, 0x01], Some(body))
            .unwrap();
        (module, run)
    }

    #[test]
    fn only_the_original_overload_matches() {
        let (module, run) = sample();
        let mut scanner = Scanner::new(&module, CtorRewrite::filestream_read_only().original_ref());

        let sites = scanner.scan(run).unwrap();
        assert_eq!(
            sites.iter().map(|site| site.index).collect::<Vec<_>>(),
            vec![2, 17]
        );
        assert!(sites.iter().all(|site| site.token == Token::new(0x0A00_0001)));
    }

    #[test]
    fn replacement_overload_is_found_separately() {
        let (module, run) = sample();
        let mut scanner =
            Scanner::new(&module, CtorRewrite::filestream_read_only().replacement_ref());

        let sites = scanner.scan(run).unwrap();
        assert_eq!(sites, vec![CallSite { index: 13, token: Token::new(0x0A00_0002) }]);
    }

    #[test]
    fn bodiless_methods_have_no_sites() {
        let (mut module, _) = sample();
        let worker = module.find_type_def("Game.Worker").unwrap();
        let abstract_method = module
            .add_method(worker, MethodAttributes::ABSTRACT, "Save", vec![0x20, 0x00, 0x01], None)
            .unwrap();

        let mut scanner = Scanner::new(&module, CtorRewrite::filestream_read_only().original_ref());
        assert!(scanner.scan(abstract_method).unwrap().is_empty());
        assert_eq!(method_display_name(&module, abstract_method), "Game.Worker::Save");
    }
}
