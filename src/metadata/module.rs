//! The in-memory module graph.
//!
//! A [`Module`] owns the metadata tables of one compiled unit: its assembly references,
//! type references, type definitions (with their methods and bodies), member references and
//! the `#US` heap. Cross references between rows are [`Token`]s, exactly as in the
//! instruction stream, so an instruction operand can be looked up directly.
//!
//! A module is either built in memory, starting with the `<Module>` type as `TypeDef`
//! row 1, or loaded from a PE image (see [`crate::metadata::image`]). Rows are only ever
//! appended. Rows added through the `add_*` methods are validated against the rows that
//! precede them (scopes, enclosing types and owners must already exist); rows read from an
//! image are taken as they are, so name lookups bound the nesting depth they follow.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::metadata::tables::AssemblyVersion;
//! use cilpatch::Module;
//!
//! let mut module = Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.dll");
//! let outer = module.add_type_def(0x0010_0001, "Game", "Worker", None)?;
//! let inner = module.add_type_def(0x0010_0002, "", "Job", Some(outer))?;
//!
//! assert_eq!(module.type_full_name(inner)?, "Game.Worker/Job");
//! assert_eq!(module.find_type_def("Game.Worker/Job"), Some(inner));
//! # Ok::<(), cilpatch::Error>(())
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use sha1::{Digest, Sha1};

use crate::{
    metadata::{
        image::SourceImage,
        method::{MethodAttributes, MethodBody},
        signatures::{parse_method_signature, ConstructorRef, MethodSig},
        streams::heaps::{push_user_string, UserStrings},
        tables::{AssemblyRef, AssemblyVersion, MemberRef, MethodDef, TypeDef, TypeRef},
        token::{table, Token},
    },
    Error::{InvalidToken, NotSupported, RecursionLimit},
    Result,
};

/// Name shared by all instance constructors
pub const CONSTRUCTOR_NAME: &str = ".ctor";
/// Name of the type holding global members, always `TypeDef` row 1
pub const MODULE_TYPE_NAME: &str = "<Module>";
/// Deepest type nesting followed when building full names
pub const MAX_NESTING_DEPTH: usize = 64;

/// One loaded module and its metadata tables.
#[derive(Debug, Clone)]
pub struct Module {
    pub(crate) assembly_name: String,
    pub(crate) version: AssemblyVersion,
    pub(crate) name: String,
    pub(crate) public_key: Vec<u8>,
    pub(crate) culture: String,
    pub(crate) mvid: [u8; 16],
    pub(crate) assembly_refs: Vec<AssemblyRef>,
    pub(crate) type_refs: Vec<TypeRef>,
    pub(crate) type_defs: Vec<TypeDef>,
    pub(crate) method_defs: Vec<MethodDef>,
    pub(crate) member_refs: Vec<MemberRef>,
    pub(crate) user_strings: Vec<u8>,
    pub(crate) path: Option<PathBuf>,
    pub(crate) image: Option<Arc<SourceImage>>,
}

fn row_token(table: u8, len: usize) -> Token {
    // Tables are bounded by the 24-bit row id when read and grow by one row at a time
    #[allow(clippy::cast_possible_truncation)]
    Token::from_parts(table, len as u32)
}

fn row<T>(rows: &[T], token: Token, expected_table: u8) -> Result<&T> {
    if !token.is_table(expected_table) {
        return Err(InvalidToken(token));
    }
    token
        .index()
        .and_then(|index| rows.get(index))
        .ok_or(InvalidToken(token))
}

fn join_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

impl Module {
    /// Create a module for assembly `assembly_name` stored as `name`, holding only the
    /// `<Module>` type.
    pub fn new(
        assembly_name: impl Into<String>,
        version: AssemblyVersion,
        name: impl Into<String>,
    ) -> Self {
        let mut module = Module::blank(assembly_name.into(), version, name.into());
        module.type_defs.push(TypeDef {
            flags: 0,
            namespace: String::new(),
            name: MODULE_TYPE_NAME.to_string(),
            extends: None,
            enclosing: None,
            nested: Vec::new(),
            methods: Vec::new(),
        });
        module
    }

    /// A module without any rows, filled in by the image loader.
    pub(crate) fn blank(assembly_name: String, version: AssemblyVersion, name: String) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(assembly_name.as_bytes());
        hasher.update([0]);
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();
        let mut mvid = [0u8; 16];
        mvid.copy_from_slice(&digest[..16]);

        Module {
            assembly_name,
            version,
            name,
            public_key: Vec::new(),
            culture: String::new(),
            mvid,
            assembly_refs: Vec::new(),
            type_refs: Vec::new(),
            type_defs: Vec::new(),
            method_defs: Vec::new(),
            member_refs: Vec::new(),
            user_strings: vec![0],
            path: None,
            image: None,
        }
    }

    /// Module file name, e.g. `Game.dll`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the assembly this module belongs to, used to match `AssemblyRef` rows.
    #[must_use]
    pub fn assembly_name(&self) -> &str {
        &self.assembly_name
    }

    /// Version of the assembly this module belongs to.
    #[must_use]
    pub fn version(&self) -> AssemblyVersion {
        self.version
    }

    /// Culture of the assembly, empty for neutral assemblies.
    #[must_use]
    pub fn culture(&self) -> &str {
        &self.culture
    }

    /// Public key of the assembly, empty if it is not strong named.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Set the public key written into the `Assembly` row of images built from scratch.
    pub fn set_public_key(&mut self, public_key: Vec<u8>) {
        self.public_key = public_key;
    }

    /// The public key token other assemblies use to reference this one: the last eight
    /// bytes of the key's SHA-1 hash in reverse order. Empty without a public key.
    #[must_use]
    pub fn public_key_token(&self) -> Vec<u8> {
        if self.public_key.is_empty() {
            return Vec::new();
        }
        let digest = Sha1::digest(&self.public_key);
        digest[digest.len() - 8..].iter().rev().copied().collect()
    }

    /// Module version id.
    #[must_use]
    pub fn mvid(&self) -> [u8; 16] {
        self.mvid
    }

    /// The file this module was loaded from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Assembly references in table order.
    #[must_use]
    pub fn assembly_refs(&self) -> &[AssemblyRef] {
        &self.assembly_refs
    }

    /// Type references in table order.
    #[must_use]
    pub fn type_refs(&self) -> &[TypeRef] {
        &self.type_refs
    }

    /// Type definitions in table order, nested types included.
    #[must_use]
    pub fn type_defs(&self) -> &[TypeDef] {
        &self.type_defs
    }

    /// Method definitions in table order.
    #[must_use]
    pub fn method_defs(&self) -> &[MethodDef] {
        &self.method_defs
    }

    /// Member references in table order.
    #[must_use]
    pub fn member_refs(&self) -> &[MemberRef] {
        &self.member_refs
    }

    /// Tokens of all assembly references, in table order.
    pub fn assembly_ref_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        (1..=self.assembly_refs.len()).map(|rid| row_token(table::ASSEMBLY_REF, rid))
    }

    /// Tokens of all types that are not nested in another type, in table order.
    pub fn top_level_types(&self) -> impl Iterator<Item = Token> + '_ {
        self.type_defs
            .iter()
            .enumerate()
            .filter(|(_, def)| def.enclosing.is_none())
            .map(|(index, _)| row_token(table::TYPE_DEF, index + 1))
    }

    /// Look up an `AssemblyRef` row.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `token` does not name an existing row.
    pub fn assembly_ref(&self, token: Token) -> Result<&AssemblyRef> {
        row(&self.assembly_refs, token, table::ASSEMBLY_REF)
    }

    /// Look up a `TypeRef` row.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `token` does not name an existing row.
    pub fn type_ref(&self, token: Token) -> Result<&TypeRef> {
        row(&self.type_refs, token, table::TYPE_REF)
    }

    /// Look up a `TypeDef` row.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `token` does not name an existing row.
    pub fn type_def(&self, token: Token) -> Result<&TypeDef> {
        row(&self.type_defs, token, table::TYPE_DEF)
    }

    /// Look up a `MethodDef` row.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `token` does not name an existing row.
    pub fn method_def(&self, token: Token) -> Result<&MethodDef> {
        row(&self.method_defs, token, table::METHOD_DEF)
    }

    /// Mutable access to a `MethodDef` row.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `token` does not name an existing row.
    pub fn method_def_mut(&mut self, token: Token) -> Result<&mut MethodDef> {
        if !token.is_table(table::METHOD_DEF) {
            return Err(InvalidToken(token));
        }
        token
            .index()
            .and_then(|index| self.method_defs.get_mut(index))
            .ok_or(InvalidToken(token))
    }

    /// Look up a `MemberRef` row.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `token` does not name an existing row.
    pub fn member_ref(&self, token: Token) -> Result<&MemberRef> {
        row(&self.member_refs, token, table::MEMBER_REF)
    }

    /// Look up a user string by its `ldstr` token.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `token` does not point into the `#US`
    /// heap, or the entry's decoding error.
    pub fn user_string(&self, token: Token) -> Result<String> {
        let offset = token.row() as usize;
        if !token.is_table(table::USER_STRING) || offset == 0 || offset >= self.user_strings.len()
        {
            return Err(InvalidToken(token));
        }
        UserStrings::from(&self.user_strings).get(offset)
    }

    /// Append an `AssemblyRef` row.
    pub fn add_assembly_ref(&mut self, name: impl Into<String>, version: AssemblyVersion) -> Token {
        self.push_assembly_ref(AssemblyRef::new(name, version))
    }

    /// Append a fully specified `AssemblyRef` row.
    pub fn push_assembly_ref(&mut self, assembly_ref: AssemblyRef) -> Token {
        self.assembly_refs.push(assembly_ref);
        row_token(table::ASSEMBLY_REF, self.assembly_refs.len())
    }

    /// Append a `TypeRef` row.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] unless `resolution_scope` is an existing
    /// `AssemblyRef` or `TypeRef`.
    pub fn add_type_ref(
        &mut self,
        resolution_scope: Token,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Token> {
        match resolution_scope.table() {
            table::ASSEMBLY_REF => {
                self.assembly_ref(resolution_scope)?;
            }
            table::TYPE_REF => {
                self.type_ref(resolution_scope)?;
            }
            _ => return Err(InvalidToken(resolution_scope)),
        }

        self.type_refs.push(TypeRef {
            resolution_scope,
            namespace: namespace.into(),
            name: name.into(),
        });
        Ok(row_token(table::TYPE_REF, self.type_refs.len()))
    }

    /// Append a `TypeDef` row, nested in `enclosing` if given.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `enclosing` is not an existing type.
    pub fn add_type_def(
        &mut self,
        flags: u32,
        namespace: impl Into<String>,
        name: impl Into<String>,
        enclosing: Option<Token>,
    ) -> Result<Token> {
        if let Some(enclosing) = enclosing {
            self.type_def(enclosing)?;
        }

        self.type_defs.push(TypeDef {
            flags,
            namespace: namespace.into(),
            name: name.into(),
            extends: None,
            enclosing,
            nested: Vec::new(),
            methods: Vec::new(),
        });
        let token = row_token(table::TYPE_DEF, self.type_defs.len());

        if let Some(parent) = enclosing.and_then(|enclosing| enclosing.index()) {
            self.type_defs[parent].nested.push(token);
        }
        Ok(token)
    }

    /// Append a `MethodDef` row owned by `owner`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if `owner` is not an existing type.
    pub fn add_method(
        &mut self,
        owner: Token,
        flags: MethodAttributes,
        name: impl Into<String>,
        signature: Vec<u8>,
        body: Option<MethodBody>,
    ) -> Result<Token> {
        self.type_def(owner)?;

        self.method_defs.push(MethodDef {
            owner,
            flags,
            impl_flags: 0,
            name: name.into(),
            signature,
            body,
        });
        let token = row_token(table::METHOD_DEF, self.method_defs.len());

        if let Some(owner) = owner.index() {
            self.type_defs[owner].methods.push(token);
        }
        Ok(token)
    }

    /// Append a `MemberRef` row.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] unless `parent` is an existing `TypeRef` or
    /// `TypeDef`, or any `TypeSpec`.
    pub fn add_member_ref(
        &mut self,
        parent: Token,
        name: impl Into<String>,
        signature: Vec<u8>,
    ) -> Result<Token> {
        match parent.table() {
            table::TYPE_REF => {
                self.type_ref(parent)?;
            }
            table::TYPE_DEF => {
                self.type_def(parent)?;
            }
            table::TYPE_SPEC => {}
            _ => return Err(InvalidToken(parent)),
        }

        self.member_refs.push(MemberRef {
            parent,
            name: name.into(),
            signature,
        });
        Ok(row_token(table::MEMBER_REF, self.member_refs.len()))
    }

    /// Append a string to the `#US` heap and return its `ldstr` token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] once the heap outgrows the token range.
    pub fn add_user_string(&mut self, value: &str) -> Result<Token> {
        push_user_string(&mut self.user_strings, value)
    }

    /// Full name of a `TypeDef` or `TypeRef`: `Namespace.Name`, nested types as
    /// `Namespace.Outer/Inner`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] for missing rows,
    /// [`crate::Error::NotSupported`] for `TypeSpec` tokens and
    /// [`crate::Error::RecursionLimit`] for nesting deeper than [`MAX_NESTING_DEPTH`].
    pub fn type_full_name(&self, token: Token) -> Result<String> {
        self.full_name_at(token, 0)
    }

    fn full_name_at(&self, token: Token, depth: usize) -> Result<String> {
        if depth > MAX_NESTING_DEPTH {
            return Err(RecursionLimit(MAX_NESTING_DEPTH));
        }

        match token.table() {
            table::TYPE_DEF => {
                let def = self.type_def(token)?;
                match def.enclosing {
                    Some(enclosing) => Ok(format!(
                        "{}/{}",
                        self.full_name_at(enclosing, depth + 1)?,
                        join_name(&def.namespace, &def.name)
                    )),
                    None => Ok(join_name(&def.namespace, &def.name)),
                }
            }
            table::TYPE_REF => {
                let type_ref = self.type_ref(token)?;
                if type_ref.resolution_scope.is_table(table::TYPE_REF) {
                    Ok(format!(
                        "{}/{}",
                        self.full_name_at(type_ref.resolution_scope, depth + 1)?,
                        join_name(&type_ref.namespace, &type_ref.name)
                    ))
                } else {
                    Ok(join_name(&type_ref.namespace, &type_ref.name))
                }
            }
            table::TYPE_SPEC => Err(NotSupported),
            _ => Err(InvalidToken(token)),
        }
    }

    /// Find a type definition by full name.
    #[must_use]
    pub fn find_type_def(&self, full_name: &str) -> Option<Token> {
        (1..=self.type_defs.len())
            .map(|rid| row_token(table::TYPE_DEF, rid))
            .find(|token| {
                self.type_full_name(*token)
                    .is_ok_and(|name| name == full_name)
            })
    }

    /// Find a type reference by full name, the first one if there are several.
    #[must_use]
    pub fn find_type_ref(&self, full_name: &str) -> Option<Token> {
        (1..=self.type_refs.len())
            .map(|rid| row_token(table::TYPE_REF, rid))
            .find(|token| {
                self.type_full_name(*token)
                    .is_ok_and(|name| name == full_name)
            })
    }

    /// Find a type reference with exactly this scope, namespace and name.
    #[must_use]
    pub fn find_type_ref_in_scope(
        &self,
        resolution_scope: Token,
        namespace: &str,
        name: &str,
    ) -> Option<Token> {
        self.type_refs
            .iter()
            .position(|type_ref| {
                type_ref.resolution_scope == resolution_scope
                    && type_ref.namespace == namespace
                    && type_ref.name == name
            })
            .map(|index| row_token(table::TYPE_REF, index + 1))
    }

    /// Find an assembly reference by simple name.
    #[must_use]
    pub fn find_assembly_ref(&self, name: &str) -> Option<Token> {
        self.assembly_refs
            .iter()
            .position(|assembly_ref| assembly_ref.name == name)
            .map(|index| row_token(table::ASSEMBLY_REF, index + 1))
    }

    /// Find a member reference with this parent, name and signature blob.
    #[must_use]
    pub fn find_member_ref(&self, parent: Token, name: &str, signature: &[u8]) -> Option<Token> {
        self.member_refs
            .iter()
            .position(|member| {
                member.parent == parent && member.name == name && member.signature == signature
            })
            .map(|index| row_token(table::MEMBER_REF, index + 1))
    }

    /// Decode a signature blob of this module.
    ///
    /// # Errors
    /// See [`crate::metadata::signatures::SignatureParser::parse_method_signature`].
    pub fn parse_signature(&self, blob: &[u8]) -> Result<MethodSig> {
        parse_method_signature(blob, &|token| self.type_full_name(token))
    }

    /// Decode the signature of a method definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] for missing rows, or the signature's decoding
    /// error.
    pub fn method_signature(&self, token: Token) -> Result<MethodSig> {
        self.parse_signature(&self.method_def(token)?.signature)
    }

    /// Describe the constructor a `newobj` operand refers to.
    ///
    /// Returns `None` if `token` names a method that is not an instance constructor.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] for tokens that are not `MemberRef` or
    /// `MethodDef` rows, and [`crate::Error::NotSupported`] for constructors of generic
    /// instantiations or with unsupported signatures.
    pub fn constructor_ref(&self, token: Token) -> Result<Option<ConstructorRef>> {
        let (declaring_type, name, signature) = match token.table() {
            table::MEMBER_REF => {
                let member = self.member_ref(token)?;
                (member.parent, &member.name, &member.signature)
            }
            table::METHOD_DEF => {
                let method = self.method_def(token)?;
                (method.owner, &method.name, &method.signature)
            }
            _ => return Err(InvalidToken(token)),
        };

        if name != CONSTRUCTOR_NAME {
            return Ok(None);
        }

        let signature = self.parse_signature(signature)?;
        if !signature.has_this() {
            return Ok(None);
        }

        Ok(Some(ConstructorRef {
            declaring_type: self.type_full_name(declaring_type)?,
            signature,
        }))
    }
}
