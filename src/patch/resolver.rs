//! Resolving types and constructors through a module's assembly references.
//!
//! [`AssemblyResolver`] turns an `AssemblyRef` row into the referenced module, either by
//! searching directories ([`DirectoryResolver`]) or from a fixed set of modules
//! ([`InMemoryResolver`]). [`ReferenceResolver`] walks the references of the module being
//! patched in table order and returns the first referenced module that defines the wanted
//! type, then picks the one constructor whose signature matches exactly.
//!
//! Every referenced module is indexed once ([`MetadataIndex`]): type full name to
//! definition, and per type the decoded constructor signatures.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use log::{debug, warn};

use crate::{
    metadata::{
        image::LoadOptions,
        module::{Module, CONSTRUCTOR_NAME},
        signatures::{ConstructorRef, MethodSig},
        tables::AssemblyRef,
        token::{table, Token},
    },
    Error::{AmbiguousConstructor, ConstructorNotFound, NotSupported, TypeNotResolved},
    Result,
};

/// Locates the module an assembly reference points at.
pub trait AssemblyResolver {
    /// Return the module for `reference`, or `None` if it cannot be found.
    ///
    /// # Errors
    /// Returns an error if a candidate was found but could not be loaded.
    fn resolve(&mut self, reference: &AssemblyRef) -> Result<Option<Arc<Module>>>;
}

/// Looks for `<name>.dll` and `<name>.exe` module images in a list of directories.
///
/// The first existing candidate whose assembly name matches the reference is loaded,
/// metadata only. Results, including misses, are cached by assembly name.
#[derive(Debug, Default)]
pub struct DirectoryResolver {
    search_dirs: Vec<PathBuf>,
    cache: HashMap<String, Option<Arc<Module>>>,
}

impl DirectoryResolver {
    /// Search `search_dirs` in order.
    #[must_use]
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        DirectoryResolver {
            search_dirs,
            cache: HashMap::new(),
        }
    }

    /// The directories searched, in order.
    #[must_use]
    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    fn locate(&self, reference: &AssemblyRef) -> Result<Option<Arc<Module>>> {
        for dir in &self.search_dirs {
            for extension in ["dll", "exe"] {
                let candidate = dir.join(format!("{}.{}", reference.name, extension));
                if !candidate.is_file() {
                    continue;
                }

                let module = Module::from_file_with(&candidate, LoadOptions::metadata_only())?;
                if module.assembly_name() != reference.name {
                    warn!(
                        "{} defines assembly '{}', not '{}' - skipped",
                        candidate.display(),
                        module.assembly_name(),
                        reference.name
                    );
                    continue;
                }
                if module.version() != reference.version {
                    debug!(
                        "Using {} {} for reference to version {}",
                        candidate.display(),
                        module.version(),
                        reference.version
                    );
                }
                return Ok(Some(Arc::new(module)));
            }
        }
        Ok(None)
    }
}

impl AssemblyResolver for DirectoryResolver {
    fn resolve(&mut self, reference: &AssemblyRef) -> Result<Option<Arc<Module>>> {
        if let Some(cached) = self.cache.get(&reference.name) {
            return Ok(cached.clone());
        }

        let module = self.locate(reference)?;
        self.cache.insert(reference.name.clone(), module.clone());
        Ok(module)
    }
}

/// Resolves references against modules registered up front, keyed by assembly name.
#[derive(Debug, Default, Clone)]
pub struct InMemoryResolver {
    modules: HashMap<String, Arc<Module>>,
}

impl InMemoryResolver {
    /// An empty resolver.
    #[must_use]
    pub fn new() -> Self {
        InMemoryResolver::default()
    }

    /// Register `module` under its assembly name, replacing an earlier one.
    pub fn add(&mut self, module: Module) {
        self.modules
            .insert(module.assembly_name().to_string(), Arc::new(module));
    }

    /// Builder form of [`InMemoryResolver::add`].
    #[must_use]
    pub fn with_module(mut self, module: Module) -> Self {
        self.add(module);
        self
    }
}

impl AssemblyResolver for InMemoryResolver {
    fn resolve(&mut self, reference: &AssemblyRef) -> Result<Option<Arc<Module>>> {
        Ok(self.modules.get(&reference.name).cloned())
    }
}

/// Lookup tables over one module's type definitions and constructors.
#[derive(Debug, Default)]
pub struct MetadataIndex {
    types: HashMap<String, Token>,
    constructors: HashMap<Token, Vec<(MethodSig, Token)>>,
}

impl MetadataIndex {
    /// Index every type and instance constructor of `module`.
    ///
    /// Constructors with signatures that cannot be decoded are left out; they can never
    /// match an exact signature anyway.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] for dangling rows, or a signature's decoding
    /// error other than [`crate::Error::NotSupported`].
    pub fn build(module: &Module) -> Result<Self> {
        let mut index = MetadataIndex::default();

        for rid in 1..=module.type_defs().len() {
            let rid = u32::try_from(rid).map_err(|_| NotSupported)?;
            let type_token = Token::from_parts(table::TYPE_DEF, rid);
            index
                .types
                .entry(module.type_full_name(type_token)?)
                .or_insert(type_token);

            for method in module.type_def(type_token)?.methods() {
                if module.method_def(*method)?.name != CONSTRUCTOR_NAME {
                    continue;
                }
                match module.method_signature(*method) {
                    Ok(signature) if signature.has_this() => index
                        .constructors
                        .entry(type_token)
                        .or_default()
                        .push((signature, *method)),
                    Ok(_) | Err(NotSupported) => {}
                    Err(error) => return Err(error),
                }
            }
        }

        Ok(index)
    }

    /// The definition of the type named `full_name`.
    #[must_use]
    pub fn find_type(&self, full_name: &str) -> Option<Token> {
        self.types.get(full_name).copied()
    }

    /// Number of indexed types.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// The single constructor of `type_token` whose signature equals `wanted`'s.
    ///
    /// # Errors
    /// Returns [`crate::Error::ConstructorNotFound`] if there is none and
    /// [`crate::Error::AmbiguousConstructor`] if there are several.
    pub fn find_constructor(&self, type_token: Token, wanted: &ConstructorRef) -> Result<Token> {
        let matches: Vec<Token> = self
            .constructors
            .get(&type_token)
            .into_iter()
            .flatten()
            .filter(|(signature, _)| {
                signature.generic_param_count == wanted.signature.generic_param_count
                    && signature.return_type == wanted.signature.return_type
                    && signature.params == wanted.signature.params
            })
            .map(|(_, token)| *token)
            .collect();

        match matches.as_slice() {
            [token] => Ok(*token),
            [] => Err(ConstructorNotFound {
                type_name: wanted.declaring_type.clone(),
                signature: wanted.to_string(),
            }),
            _ => Err(AmbiguousConstructor(wanted.to_string())),
        }
    }
}

struct IndexedModule {
    module: Arc<Module>,
    index: MetadataIndex,
}

/// A constructor found in a referenced module.
#[derive(Debug, Clone)]
pub struct ResolvedConstructor {
    /// The module defining the constructor
    pub module: Arc<Module>,
    /// `MethodDef` token of the constructor in `module`
    pub token: Token,
}

/// Resolves constructors through the assembly references of the module being patched.
pub struct ReferenceResolver<'r> {
    assemblies: &'r mut dyn AssemblyResolver,
    indexed: HashMap<String, Option<IndexedModule>>,
}

impl<'r> ReferenceResolver<'r> {
    /// Use `assemblies` to locate referenced modules.
    pub fn new(assemblies: &'r mut dyn AssemblyResolver) -> Self {
        ReferenceResolver {
            assemblies,
            indexed: HashMap::new(),
        }
    }

    /// Find `wanted` in the first assembly referenced by `module` that defines its
    /// declaring type.
    ///
    /// References that cannot be located are skipped with a warning.
    ///
    /// # Errors
    /// Returns [`crate::Error::TypeNotResolved`] if no referenced assembly defines the type,
    /// [`crate::Error::ConstructorNotFound`] or [`crate::Error::AmbiguousConstructor`] if the
    /// defining assembly has no single exact match, and load errors of referenced modules.
    pub fn resolve_constructor(
        &mut self,
        module: &Module,
        wanted: &ConstructorRef,
    ) -> Result<ResolvedConstructor> {
        for reference in module.assembly_refs() {
            self.load(reference)?;

            let Some(Some(entry)) = self.indexed.get(&reference.name) else {
                continue;
            };
            let Some(type_token) = entry.index.find_type(&wanted.declaring_type) else {
                continue;
            };

            let token = entry.index.find_constructor(type_token, wanted)?;
            debug!(
                "Resolved {} in {} {} as {}",
                wanted,
                reference.name,
                entry.module.version(),
                token
            );
            return Ok(ResolvedConstructor {
                module: Arc::clone(&entry.module),
                token,
            });
        }

        Err(TypeNotResolved(wanted.declaring_type.clone()))
    }

    fn load(&mut self, reference: &AssemblyRef) -> Result<()> {
        if self.indexed.contains_key(&reference.name) {
            return Ok(());
        }

        let entry = match self.assemblies.resolve(reference)? {
            Some(module) => {
                let index = MetadataIndex::build(&module)?;
                debug!(
                    "Indexed {} {} ({} types)",
                    reference.name,
                    module.version(),
                    index.type_count()
                );
                Some(IndexedModule { module, index })
            }
            None => {
                warn!(
                    "Could not locate referenced assembly {} {}",
                    reference.name, reference.version
                );
                None
            }
        };

        self.indexed.insert(reference.name.clone(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{method::MethodAttributes, signatures::TypeSig, tables::AssemblyVersion},
        patch::CtorRewrite,
        Error,
    };

    fn library(name: &str, ctors: &[&[u8]]) -> Module {
        let mut module = Module::new(name, AssemblyVersion::new(4, 0, 0, 0), format!("{name}.dll"));
        let stream = module
            .add_type_def(0x0010_2101, "System.IO", "FileStream", None)
            .unwrap();
        module.add_type_def(0x101, "System.IO", "FileMode", None).unwrap();
        module.add_type_def(0x101, "System.IO", "FileAccess", None).unwrap();
        for blob in ctors {
            module
                .add_method(stream, MethodAttributes::PUBLIC, ".ctor", blob.to_vec(), None)
                .unwrap();
        }
        module
    }

    fn game(references: &[&str]) -> Module {
        let mut module = Module::new("Game", AssemblyVersion::new(1, 0, 0, 0), "Game.dll");
        for name in references {
            module.add_assembly_ref(*name, AssemblyVersion::new(4, 0, 0, 0));
        }
        module
    }

    // FileMode and FileAccess are TypeDef rows 3 and 4, after <Module> and FileStream
    const TWO: &[u8] = &[0x20, 0x02, 0x01, 0x0E, 0x11, 0x0C];
    const THREE: &[u8] = &[0x20, 0x03, 0x01, 0x0E, 0x11, 0x0C, 0x11, 0x10];
    // (string, FileMode, int32)
    const THREE_INT: &[u8] = &[0x20, 0x03, 0x01, 0x0E, 0x11, 0x0C, 0x08];

    #[test]
    fn index_finds_exact_constructor() {
        let module = library("mscorlib", &[TWO, THREE_INT, THREE]);
        let index = MetadataIndex::build(&module).unwrap();

        let stream = index.find_type("System.IO.FileStream").unwrap();
        let wanted = CtorRewrite::filestream_read_only().replacement_ref();
        assert_eq!(
            index.find_constructor(stream, &wanted).unwrap(),
            Token::new(0x0600_0003)
        );
        assert!(index.find_type("System.IO.Stream").is_none());
    }

    #[test]
    fn missing_and_ambiguous_constructors() {
        let wanted = CtorRewrite::filestream_read_only().replacement_ref();

        let module = library("mscorlib", &[TWO]);
        let index = MetadataIndex::build(&module).unwrap();
        let stream = index.find_type("System.IO.FileStream").unwrap();
        assert!(matches!(
            index.find_constructor(stream, &wanted),
            Err(Error::ConstructorNotFound { type_name, .. }) if type_name == "System.IO.FileStream"
        ));

        let module = library("mscorlib", &[THREE, THREE]);
        let index = MetadataIndex::build(&module).unwrap();
        assert!(matches!(
            index.find_constructor(stream, &wanted),
            Err(Error::AmbiguousConstructor(_))
        ));
    }

    #[test]
    fn first_reference_defining_the_type_wins() {
        let mut assemblies = InMemoryResolver::new()
            .with_module(library("System.Runtime", &[THREE]))
            .with_module(library("mscorlib", &[THREE]));
        let wanted = CtorRewrite::filestream_read_only().replacement_ref();

        for _ in 0..3 {
            let mut resolver = ReferenceResolver::new(&mut assemblies);
            let found = resolver
                .resolve_constructor(&game(&["Missing", "mscorlib", "System.Runtime"]), &wanted)
                .unwrap();
            assert_eq!(found.module.assembly_name(), "mscorlib");
        }
    }

    #[test]
    fn unresolvable_type() {
        let mut assemblies = InMemoryResolver::new().with_module(library("mscorlib", &[THREE]));
        let mut resolver = ReferenceResolver::new(&mut assemblies);
        let wanted = ConstructorRef::new("System.IO.MemoryStream", vec![TypeSig::I4]);

        assert!(matches!(
            resolver.resolve_constructor(&game(&["mscorlib"]), &wanted),
            Err(Error::TypeNotResolved(name)) if name == "System.IO.MemoryStream"
        ));
        assert!(matches!(
            resolver.resolve_constructor(&game(&[]), &wanted),
            Err(Error::TypeNotResolved(_))
        ));
    }

    #[test]
    fn directory_resolver_loads_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        library("mscorlib", &[THREE])
            .save(&dir.path().join("mscorlib.dll"))
            .unwrap();
        // Wrong assembly behind the expected file name
        library("Impostor", &[THREE])
            .save(&dir.path().join("System.dll"))
            .unwrap();

        let mut resolver = DirectoryResolver::new(vec![dir.path().to_path_buf()]);
        let corlib = AssemblyRef::new("mscorlib", AssemblyVersion::new(2, 0, 5, 0));
        let system = AssemblyRef::new("System", AssemblyVersion::new(4, 0, 0, 0));

        let first = resolver.resolve(&corlib).unwrap().unwrap();
        std::fs::remove_file(dir.path().join("mscorlib.dll")).unwrap();
        let second = resolver.resolve(&corlib).unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.method_defs().iter().all(|method| method.body.is_none()));
        assert!(resolver.resolve(&system).unwrap().is_none());
    }

    #[test]
    fn directory_resolver_reads_compiled_libraries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Worker.dll"),
            include_bytes!("../../tests/fixtures/Worker.dll"),
        )
        .unwrap();

        let mut resolver = DirectoryResolver::new(vec![dir.path().to_path_buf()]);
        let worker = resolver
            .resolve(&AssemblyRef::new("Worker", AssemblyVersion::new(1, 0, 0, 0)))
            .unwrap()
            .unwrap();
        assert_eq!(worker.path(), Some(dir.path().join("Worker.dll").as_path()));

        let index = MetadataIndex::build(&worker).unwrap();
        let job = index.find_type("Game.Worker/Job").unwrap();
        let ctor = index
            .find_constructor(job, &ConstructorRef::new("Game.Worker/Job", vec![]))
            .unwrap();
        assert_eq!(ctor, Token::new(0x0600_0005));
    }

    #[test]
    fn directory_resolver_propagates_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mscorlib.dll"), b"MZ not an image").unwrap();

        let mut resolver = DirectoryResolver::new(vec![dir.path().to_path_buf()]);
        let corlib = AssemblyRef::new("mscorlib", AssemblyVersion::new(4, 0, 0, 0));
        assert!(matches!(
            resolver.resolve(&corlib),
            Err(Error::GoblinErr(_))
        ));
    }
}
