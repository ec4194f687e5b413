//! Loading modules from PE images.
//!
//! A managed module is a PE file whose CLR data directory points at the CLI header, which
//! in turn locates the metadata root and its streams. Loading walks that chain
//! (PE headers via goblin, [`Cor20Header`], [`Root`], [`TablesStream`] and the heaps) and
//! decodes the tables the patcher works with into a [`Module`]:
//!
//! - `Module` and `Assembly` for the module's own identity
//! - `AssemblyRef`, `TypeRef`, `MemberRef` as they are
//! - `TypeDef` with its methods (from the `MethodList` ranges) and nesting (from
//!   `NestedClass`)
//! - `MethodDef` with its IL body, unless only metadata was requested
//!
//! Everything else stays in the raw tables kept in the module's [`SourceImage`], from which
//! the writer rebuilds the metadata when the module is saved.

use std::{path::Path, sync::Arc};

use log::debug;
use strum::EnumCount;

use crate::{
    file::{pe::PeLayout, File},
    metadata::{
        cor20header::{Cor20Header, COR20_HEADER_SIZE},
        method::{MethodAttributes, MethodBody},
        module::Module,
        root::Root,
        streams::{
            heaps::{Blob, Guids, Strings},
            schema::{CodedIndexType, TableId},
            tablesheader::{RawTable, TablesStream},
        },
        tables::{AssemblyRef, AssemblyVersion, MemberRef, MethodDef, TypeDef, TypeRef},
        token::Token,
    },
    Error::{NotSupported, OutOfBounds},
    Result,
};

/// `MethodImplAttributes` code type mask; 0 is IL
const CODE_TYPE_MASK: u16 = 0x0003;

/// What to decode when loading a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Decode IL method bodies
    pub method_bodies: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            method_bodies: true,
        }
    }
}

impl LoadOptions {
    /// Tables only, for modules that are inspected but never patched.
    #[must_use]
    pub fn metadata_only() -> Self {
        LoadOptions {
            method_bodies: false,
        }
    }
}

/// The image a module was loaded from, kept for writing it back.
#[derive(Debug)]
pub struct SourceImage {
    pub(crate) data: Vec<u8>,
    pub(crate) layout: PeLayout,
    pub(crate) cor20_offset: usize,
    pub(crate) cor20: Cor20Header,
    pub(crate) root: Root,
    pub(crate) metadata_offset: usize,
    pub(crate) tables: TablesStream,
    pub(crate) strings: Vec<u8>,
    pub(crate) blobs: Vec<u8>,
    pub(crate) guids: Vec<u8>,
    pub(crate) user_strings_len: usize,
    pub(crate) counts: [u32; TableId::COUNT],
}

impl SourceImage {
    /// Rows `table` had when the image was loaded.
    #[must_use]
    pub fn rows(&self, table: TableId) -> usize {
        self.counts[table as usize] as usize
    }

    /// The raw bytes of a metadata stream, if the image has it.
    pub(crate) fn stream(&self, name: &str) -> Option<&[u8]> {
        let header = self.root.stream(name)?;
        let start = self.metadata_offset + header.offset as usize;
        self.data.get(start..start + header.size as usize)
    }
}

fn short(value: u32) -> u16 {
    // U16 columns are read from two bytes
    #[allow(clippy::cast_possible_truncation)]
    let value = value as u16;
    value
}

fn rid(table: TableId, index: usize) -> Token {
    // Row counts come from 32-bit fields
    #[allow(clippy::cast_possible_truncation)]
    let row = index as u32 + 1;
    table.token(row)
}

fn column(table: &RawTable, index: usize) -> Result<&[u32]> {
    table
        .row(index)
        .ok_or_else(|| malformed_error!("Row {} is missing", index + 1))
}

impl Module {
    /// Load a module from a PE image on disk.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened,
    /// [`crate::Error::Empty`] for empty files, [`crate::Error::GoblinErr`] if it is not a
    /// PE image, and [`crate::Error::Malformed`], [`crate::Error::OutOfBounds`] or
    /// [`crate::Error::NotSupported`] if its metadata cannot be decoded.
    pub fn from_file(path: &Path) -> Result<Module> {
        Module::from_file_with(path, LoadOptions::default())
    }

    /// Load a module from disk, decoding only what `options` asks for.
    ///
    /// # Errors
    /// See [`Module::from_file`].
    pub fn from_file_with(path: &Path, options: LoadOptions) -> Result<Module> {
        let file = File::from_file(path)?;
        let mut module = Module::load(&file, options)?;
        module.path = Some(path.to_path_buf());
        Ok(module)
    }

    /// Load a module from a PE image in memory.
    ///
    /// # Errors
    /// See [`Module::from_file`].
    pub fn from_mem(data: Vec<u8>) -> Result<Module> {
        let file = File::from_mem(data)?;
        Module::load(&file, LoadOptions::default())
    }

    fn load(file: &File, options: LoadOptions) -> Result<Module> {
        let (clr_rva, clr_size) = file.clr();
        if (clr_size as usize) < COR20_HEADER_SIZE {
            return Err(malformed_error!("CLI header of {} bytes", clr_size));
        }
        let cor20_offset = file.rva_to_offset(clr_rva)?;
        let cor20 = Cor20Header::read(file.data_slice(cor20_offset, COR20_HEADER_SIZE)?)?;

        let metadata_offset = file.rva_to_offset(cor20.meta_data_rva)?;
        let metadata = file.data_slice(metadata_offset, cor20.meta_data_size as usize)?;
        let root = Root::read(metadata)?;

        if root.stream("#-").is_some() {
            return Err(NotSupported);
        }
        let stream = |name: &str| {
            root.stream(name).map(|header| {
                let start = header.offset as usize;
                &metadata[start..start + header.size as usize]
            })
        };

        let Some(tables_data) = stream("#~") else {
            return Err(malformed_error!("Metadata has no #~ stream"));
        };
        let tables = TablesStream::read(tables_data)?;
        let strings_data = stream("#Strings").unwrap_or(&[0]);
        let blob_data = stream("#Blob").unwrap_or(&[0]);
        let guid_data = stream("#GUID").unwrap_or(&[]);
        let user_strings = stream("#US").unwrap_or(&[0]);

        let strings = Strings::from(strings_data)?;
        let blobs = Blob::from(blob_data)?;
        let guids = Guids::from(guid_data);

        if !tables.table(TableId::MethodPtr).is_empty()
            || !tables.table(TableId::FieldPtr).is_empty()
        {
            return Err(NotSupported);
        }

        let module_table = tables.table(TableId::Module);
        let module_row = column(module_table, 0)?;
        let module_name = strings.get(module_row[1] as usize)?.to_string();

        let assembly_table = tables.table(TableId::Assembly);
        let mut module = match assembly_table.row(0) {
            Some(row) => {
                let version = AssemblyVersion::new(
                    short(row[1]),
                    short(row[2]),
                    short(row[3]),
                    short(row[4]),
                );
                let mut module =
                    Module::blank(strings.get(row[7] as usize)?.to_string(), version, module_name);
                module.public_key = blobs.get(row[6] as usize)?.to_vec();
                module.culture = strings.get(row[8] as usize)?.to_string();
                module
            }
            None => {
                let assembly_name = Path::new(&module_name)
                    .file_stem()
                    .map_or_else(|| module_name.clone(), |stem| stem.to_string_lossy().into_owned());
                Module::blank(assembly_name, AssemblyVersion::default(), module_name)
            }
        };
        module.mvid = guids.get(module_row[2] as usize)?;

        let assembly_refs = tables.table(TableId::AssemblyRef);
        for index in 0..assembly_refs.len() {
            let row = column(assembly_refs, index)?;
            module.assembly_refs.push(AssemblyRef {
                version: AssemblyVersion::new(
                    short(row[0]),
                    short(row[1]),
                    short(row[2]),
                    short(row[3]),
                ),
                flags: row[4],
                public_key_or_token: blobs.get(row[5] as usize)?.to_vec(),
                name: strings.get(row[6] as usize)?.to_string(),
                culture: strings.get(row[7] as usize)?.to_string(),
            });
        }

        let type_refs = tables.table(TableId::TypeRef);
        for index in 0..type_refs.len() {
            let row = column(type_refs, index)?;
            module.type_refs.push(TypeRef {
                resolution_scope: CodedIndexType::ResolutionScope.decode(row[0])?,
                name: strings.get(row[1] as usize)?.to_string(),
                namespace: strings.get(row[2] as usize)?.to_string(),
            });
        }

        let type_defs = tables.table(TableId::TypeDef);
        let method_count = tables.table(TableId::MethodDef).len();
        let mut method_owners = vec![None; method_count];
        for index in 0..type_defs.len() {
            let row = column(type_defs, index)?;
            let extends = CodedIndexType::TypeDefOrRef.decode(row[3])?;

            let start = row[5] as usize;
            let end = match type_defs.row(index + 1) {
                Some(next) => next[5] as usize,
                None => method_count + 1,
            };
            if start == 0 || start > end || end > method_count + 1 {
                return Err(malformed_error!(
                    "TypeDef row {} has an invalid method list {}..{}",
                    index + 1,
                    start,
                    end
                ));
            }

            let owner = rid(TableId::TypeDef, index);
            let mut methods = Vec::with_capacity(end - start);
            for method in start..end {
                method_owners[method - 1] = Some(owner);
                methods.push(rid(TableId::MethodDef, method - 1));
            }

            module.type_defs.push(TypeDef {
                flags: row[0],
                name: strings.get(row[1] as usize)?.to_string(),
                namespace: strings.get(row[2] as usize)?.to_string(),
                extends: (!extends.is_null()).then_some(extends),
                enclosing: None,
                nested: Vec::new(),
                methods,
            });
        }

        let nested_classes = tables.table(TableId::NestedClass);
        for index in 0..nested_classes.len() {
            let row = column(nested_classes, index)?;
            let (nested, enclosing) = (row[0] as usize, row[1] as usize);
            if nested == 0
                || enclosing == 0
                || nested > module.type_defs.len()
                || enclosing > module.type_defs.len()
            {
                return Err(malformed_error!(
                    "NestedClass row {} names a missing type",
                    index + 1
                ));
            }
            module.type_defs[nested - 1].enclosing = Some(rid(TableId::TypeDef, enclosing - 1));
            module.type_defs[enclosing - 1]
                .nested
                .push(rid(TableId::TypeDef, nested - 1));
        }
        for type_def in &mut module.type_defs {
            type_def.nested.sort();
        }

        let method_defs = tables.table(TableId::MethodDef);
        for (index, owner) in method_owners.into_iter().enumerate() {
            let row = column(method_defs, index)?;
            let Some(owner) = owner else {
                return Err(malformed_error!(
                    "MethodDef row {} is not owned by any type",
                    index + 1
                ));
            };

            let (rva, impl_flags) = (row[0], short(row[1]));
            let body = if options.method_bodies && rva != 0 && impl_flags & CODE_TYPE_MASK == 0 {
                let offset = file.rva_to_offset(rva)?;
                let Some(data) = file.data().get(offset..) else {
                    return Err(OutOfBounds);
                };
                Some(MethodBody::parse(data)?)
            } else {
                None
            };

            module.method_defs.push(MethodDef {
                owner,
                flags: MethodAttributes::from_bits_retain(short(row[2])),
                impl_flags,
                name: strings.get(row[3] as usize)?.to_string(),
                signature: blobs.get(row[4] as usize)?.to_vec(),
                body,
            });
        }

        let member_refs = tables.table(TableId::MemberRef);
        for index in 0..member_refs.len() {
            let row = column(member_refs, index)?;
            module.member_refs.push(MemberRef {
                parent: CodedIndexType::MemberRefParent.decode(row[0])?,
                name: strings.get(row[1] as usize)?.to_string(),
                signature: blobs.get(row[2] as usize)?.to_vec(),
            });
        }

        module.user_strings = user_strings.to_vec();

        debug!(
            "Loaded {} ({} types, {} methods, {} member references)",
            module.name,
            module.type_defs.len(),
            module.method_defs.len(),
            module.member_refs.len()
        );

        let counts = tables.row_counts();
        module.image = Some(Arc::new(SourceImage {
            data: file.data().to_vec(),
            layout: file.layout().clone(),
            cor20_offset,
            cor20,
            root,
            metadata_offset,
            tables,
            strings: strings_data.to_vec(),
            blobs: blob_data.to_vec(),
            guids: guid_data.to_vec(),
            user_strings_len: user_strings.len(),
            counts,
        }));

        Ok(module)
    }
}
