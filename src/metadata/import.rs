//! Importing members of a referenced module into another module.
//!
//! A constructor found in a referenced assembly cannot be used by `newobj` directly: the
//! calling module needs its own `MemberRef` row, whose parent and signature in turn point at
//! `TypeRef` rows of that module. [`Importer`] creates exactly the rows that are missing and
//! reuses existing ones, so importing the same member twice yields the same token.

use log::debug;

use crate::{
    metadata::{
        module::{Module, CONSTRUCTOR_NAME},
        signatures::encode_method_signature,
        tables::AssemblyRef,
        token::{table, Token},
    },
    Error::{InvalidToken, TypeNotResolved},
    Result,
};

/// Adds references to another module's types and constructors to a target module.
///
/// # Examples
///
/// ```rust
/// use cilpatch::metadata::{import::Importer, tables::AssemblyVersion};
/// use cilpatch::Module;
///
/// let mut corlib = Module::new("mscorlib", AssemblyVersion::new(4, 0, 0, 0), "mscorlib.dll");
/// corlib.add_type_def(0x0010_0101, "System.IO", "FileAccess", None)?;
///
/// let mut game = Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.dll");
/// let access = Importer::new(&mut game).import_type(&corlib, "System.IO.FileAccess")?;
///
/// assert_eq!(game.type_full_name(access)?, "System.IO.FileAccess");
/// assert!(game.find_assembly_ref("mscorlib").is_some());
/// # Ok::<(), cilpatch::Error>(())
/// ```
pub struct Importer<'a> {
    target: &'a mut Module,
}

impl<'a> Importer<'a> {
    /// Import into `target`.
    pub fn new(target: &'a mut Module) -> Self {
        Importer { target }
    }

    /// Make the constructor `ctor` (a `MethodDef` of `source`) callable from the target
    /// module and return the target-local `MemberRef` token.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `ctor` is not a constructor of `source`,
    /// [`crate::Error::TypeNotResolved`] if a type in its signature cannot be traced to an
    /// assembly, or the signature's decoding error.
    pub fn import_constructor(&mut self, source: &Module, ctor: Token) -> Result<Token> {
        let method = source.method_def(ctor)?;
        if method.name != CONSTRUCTOR_NAME {
            return Err(InvalidToken(ctor));
        }

        let owner = source.type_full_name(method.owner)?;
        let signature = source.method_signature(ctor)?;

        let parent = self.import_type(source, &owner)?;
        let blob = encode_method_signature(&signature, &mut |name| {
            self.import_type(source, name)
        })?;

        if let Some(existing) = self.target.find_member_ref(parent, CONSTRUCTOR_NAME, &blob) {
            return Ok(existing);
        }

        let token = self.target.add_member_ref(parent, CONSTRUCTOR_NAME, blob)?;
        debug!(
            "Imported {}::.ctor{} from {} as {}",
            owner,
            signature.param_list(),
            source.assembly_name(),
            token
        );
        Ok(token)
    }

    /// Return a target-local token for the type `full_name` as seen from `source`.
    ///
    /// Types the target defines itself resolve to their `TypeDef`. Otherwise a `TypeRef`
    /// is found or created, scoped to the assembly that defines the type: `source` itself if
    /// it has a matching definition, or the scope of `source`'s own reference to it.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotResolved`] if `source` neither defines nor references
    /// `full_name`.
    pub fn import_type(&mut self, source: &Module, full_name: &str) -> Result<Token> {
        if let Some(local) = self.target.find_type_def(full_name) {
            return Ok(local);
        }

        let (scope, namespace, name) = if let Some(def) = source.find_type_def(full_name) {
            let def = source.type_def(def)?;
            let scope = match def.enclosing {
                Some(enclosing) => self.import_type(source, &source.type_full_name(enclosing)?)?,
                None => self.assembly_scope(AssemblyRef {
                    name: source.assembly_name().to_string(),
                    version: source.version(),
                    flags: 0,
                    public_key_or_token: source.public_key_token(),
                    culture: source.culture().to_string(),
                }),
            };
            (scope, def.namespace.clone(), def.name.clone())
        } else if let Some(reference) = source.find_type_ref(full_name) {
            let reference = source.type_ref(reference)?;
            let scope = match reference.resolution_scope.table() {
                table::ASSEMBLY_REF => {
                    let assembly = source.assembly_ref(reference.resolution_scope)?;
                    self.assembly_scope(assembly.clone())
                }
                table::TYPE_REF => self.import_type(
                    source,
                    &source.type_full_name(reference.resolution_scope)?,
                )?,
                _ => return Err(InvalidToken(reference.resolution_scope)),
            };
            (scope, reference.namespace.clone(), reference.name.clone())
        } else {
            return Err(TypeNotResolved(full_name.to_string()));
        };

        if let Some(existing) = self.target.find_type_ref_in_scope(scope, &namespace, &name) {
            return Ok(existing);
        }

        let token = self.target.add_type_ref(scope, namespace, name)?;
        debug!("Added type reference {} for {}", token, full_name);
        Ok(token)
    }

    fn assembly_scope(&mut self, assembly: AssemblyRef) -> Token {
        if let Some(existing) = self.target.find_assembly_ref(&assembly.name) {
            return existing;
        }

        debug!(
            "Adding assembly reference {} {}",
            assembly.name, assembly.version
        );
        self.target.push_assembly_ref(assembly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{method::MethodAttributes, tables::AssemblyVersion},
        Error,
    };

    // (string, FileMode, FileAccess) against TypeRef rows 2 and 3
    const STRING_MODE_ACCESS: [u8; 8] = [0x20, 0x03, 0x01, 0x0E, 0x11, 0x09, 0x11, 0x0D];
    // The same signature against TypeDef rows 3 and 4
    const STRING_MODE_ACCESS_DEF: [u8; 8] = [0x20, 0x03, 0x01, 0x0E, 0x11, 0x0C, 0x11, 0x10];

    /// mscorlib with FileStream (row 2), FileMode (row 3), FileAccess (row 4)
    fn corlib() -> (Module, Token) {
        let mut corlib = Module::new("mscorlib", AssemblyVersion::new(4, 0, 0, 0), "mscorlib.dll");
        let stream = corlib
            .add_type_def(0x0010_2101, "System.IO", "FileStream", None)
            .unwrap();
        corlib
            .add_type_def(0x0000_0101, "System.IO", "FileMode", None)
            .unwrap();
        corlib
            .add_type_def(0x0000_0101, "System.IO", "FileAccess", None)
            .unwrap();
        let ctor = corlib
            .add_method(
                stream,
                MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME,
                ".ctor",
                STRING_MODE_ACCESS_DEF.to_vec(),
                None,
            )
            .unwrap();
        (corlib, ctor)
    }

    fn game() -> Module {
        let mut game = Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.dll");
        let corlib = game.add_assembly_ref("mscorlib", AssemblyVersion::new(4, 0, 0, 0));
        game.add_type_ref(corlib, "System.IO", "FileStream").unwrap();
        game.add_type_ref(corlib, "System.IO", "FileMode").unwrap();
        game
    }

    #[test]
    fn import_constructor_reuses_existing_rows() {
        let (corlib, ctor) = corlib();
        let mut game = game();

        let imported = Importer::new(&mut game).import_constructor(&corlib, ctor).unwrap();

        // Only FileAccess is new
        assert_eq!(game.assembly_refs().len(), 1);
        assert_eq!(game.type_refs().len(), 3);
        assert_eq!(game.type_full_name(Token::new(0x0100_0003)).unwrap(), "System.IO.FileAccess");

        let member = game.member_ref(imported).unwrap();
        assert_eq!(member.parent, Token::new(0x0100_0001));
        assert_eq!(member.signature, STRING_MODE_ACCESS);
        assert_eq!(
            game.constructor_ref(imported).unwrap().unwrap().to_string(),
            "System.Void System.IO.FileStream::.ctor(System.String,System.IO.FileMode,System.IO.FileAccess)"
        );
    }

    #[test]
    fn import_is_idempotent() {
        let (corlib, ctor) = corlib();
        let mut game = game();

        let first = Importer::new(&mut game).import_constructor(&corlib, ctor).unwrap();
        let rows = (game.type_refs().len(), game.member_refs().len());
        let second = Importer::new(&mut game).import_constructor(&corlib, ctor).unwrap();

        assert_eq!(first, second);
        assert_eq!(rows, (game.type_refs().len(), game.member_refs().len()));
    }

    #[test]
    fn import_nested_type_through_reference_chain() {
        let mut library = Module::new("Engine", AssemblyVersion::new(3, 7, 0, 0), "Engine.dll");
        let framework = library.add_assembly_ref("Framework", AssemblyVersion::new(2, 0, 0, 0));
        let outer = library.add_type_ref(framework, "Framework", "Storage").unwrap();
        library.add_type_ref(outer, "", "Handle").unwrap();

        let mut game = game();
        let handle = Importer::new(&mut game)
            .import_type(&library, "Framework.Storage/Handle")
            .unwrap();

        assert_eq!(game.type_full_name(handle).unwrap(), "Framework.Storage/Handle");
        let scope = game.type_ref(handle).unwrap().resolution_scope;
        assert!(scope.is_table(table::TYPE_REF));

        let framework = game.find_assembly_ref("Framework").unwrap();
        assert_eq!(
            game.assembly_ref(framework).unwrap().version,
            AssemblyVersion::new(2, 0, 0, 0)
        );
    }

    #[test]
    fn import_copies_strong_name_identity() {
        let (mut corlib, ctor) = corlib();
        corlib.set_public_key(vec![0, 0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0]);
        let mut game = Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.dll");

        Importer::new(&mut game).import_constructor(&corlib, ctor).unwrap();

        let reference = &game.assembly_refs()[0];
        assert_eq!(reference.name, "mscorlib");
        assert_eq!(reference.flags, 0);
        assert_eq!(
            reference.public_key_or_token,
            vec![0xB7, 0x7A, 0x5C, 0x56, 0x19, 0x34, 0xE0, 0x89]
        );
    }

    #[test]
    fn import_prefers_local_definitions() {
        let (corlib, _) = corlib();
        let mut game = game();
        let local = game.add_type_def(0x0010_0001, "System.IO", "FileAccess", None).unwrap();

        let token = Importer::new(&mut game)
            .import_type(&corlib, "System.IO.FileAccess")
            .unwrap();
        assert_eq!(token, local);
    }

    #[test]
    fn unknown_type_is_not_resolved() {
        let (corlib, _) = corlib();
        let mut game = game();

        assert!(matches!(
            Importer::new(&mut game).import_type(&corlib, "System.IO.Stream"),
            Err(Error::TypeNotResolved(name)) if name == "System.IO.Stream"
        ));
    }

    #[test]
    fn non_constructor_is_rejected() {
        let (mut corlib, _) = corlib();
        let stream = corlib.find_type_def("System.IO.FileStream").unwrap();
        let flush = corlib
            .add_method(stream, MethodAttributes::PUBLIC, "Flush", vec![0x20, 0x00, 0x01], None)
            .unwrap();

        let mut game = game();
        assert!(matches!(
            Importer::new(&mut game).import_constructor(&corlib, flush),
            Err(Error::InvalidToken(_))
        ));
    }
}
