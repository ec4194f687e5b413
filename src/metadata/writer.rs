//! Writing modules back to PE images.
//!
//! There are two ways a module becomes bytes:
//!
//! - A module loaded from an image is written as that image plus one appended section. The
//!   new section holds every edited or added method body followed by a rebuilt metadata
//!   block, and the CLI header is pointed at the new metadata. The original sections are
//!   left byte for byte as they were, so RVAs used by unmodified bodies, resources and
//!   native code stay valid. A module without any change is written as the original bytes.
//! - A module built in memory is written as a minimal IL-only PE32 image with a single
//!   `.text` section holding the CLI header, method bodies and metadata.
//!
//! The rebuilt metadata starts from the raw tables and heaps of the source image and appends
//! the rows the module gained since it was loaded. Rows that existed already are kept as
//! they were read, except for the RVA of methods whose body was edited.

use std::path::Path;

use log::{debug, warn};

use crate::{
    file::{
        io::{push_le, read_le_at, write_le_at, CilIO},
        output::Output,
        pe::{
            align_up, align_up_u32, pe_checksum, DATA_DIRECTORY_COUNT, DIRECTORY_CERTIFICATE,
            DIRECTORY_CLR, MAGIC_PE32, SIZEOF_DATA_DIRECTORY, SIZEOF_SECTION_HEADER,
        },
    },
    metadata::{
        cor20header::{Cor20Header, COR20_HEADER_SIZE, METADATA_DIRECTORY_OFFSET},
        image::SourceImage,
        module::Module,
        root::{Root, DEFAULT_RUNTIME_VERSION},
        streams::{
            heaps::{BlobBuilder, StringsBuilder},
            schema::{heap_sizes, CodedIndexType, TableId},
            tablesheader::TablesStream,
        },
    },
    Error::NotSupported,
    Result,
};

/// Name of the section appended to loaded images
const PATCH_SECTION_NAME: [u8; 8] = *b".patch\0\0";
/// `IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ`
const PATCH_SECTION_CHARACTERISTICS: u32 = 0x4000_0040;
/// `IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ`
const TEXT_SECTION_CHARACTERISTICS: u32 = 0x6000_0020;
/// `AssemblyFlags.PublicKey`
const ASSEMBLY_FLAG_PUBLIC_KEY: u32 = 0x0001;
/// `AssemblyHashAlgorithm.SHA1`
const HASH_ALGORITHM_SHA1: u32 = 0x8004;
/// Sorted tables of images written from scratch, as compilers mark them
const SORTED_TABLES: u64 = 0x0000_1600_3301_FA00;

const DOS_PE_POINTER: usize = 0x80;
const FRESH_FILE_ALIGNMENT: u32 = 0x200;
const FRESH_SECTION_ALIGNMENT: u32 = 0x2000;
const FRESH_TEXT_RVA: u32 = 0x2000;
const FRESH_SIZE_OF_HEADERS: u32 = 0x200;
const PE32_OPTIONAL_HEADER_SIZE: u16 = 0xE0;
/// `IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_32BIT_MACHINE`
const CHARACTERISTICS_EXE: u16 = 0x0102;
/// `CHARACTERISTICS_EXE | IMAGE_FILE_DLL`
const CHARACTERISTICS_DLL: u16 = 0x2102;
/// Dynamic base, NX compatible, no SEH, terminal server aware
const DLL_CHARACTERISTICS: u16 = 0x8540;

fn put<T: CilIO>(data: &mut [u8], offset: usize, value: T) -> Result<()> {
    let mut offset = offset;
    write_le_at(data, &mut offset, value)
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Image of {} bytes is too large", value))
}

/// Section contents laid out from a base RVA, every item 4-byte aligned.
struct Payload {
    base_rva: u32,
    data: Vec<u8>,
}

impl Payload {
    fn new(base_rva: u32) -> Self {
        Payload {
            base_rva,
            data: Vec::new(),
        }
    }

    fn append(&mut self, bytes: &[u8]) -> Result<u32> {
        self.data.resize(align_up(self.data.len(), 4), 0);
        let Some(rva) = self.base_rva.checked_add(to_u32(self.data.len())?) else {
            return Err(malformed_error!("Section at {:#x} is too large", self.base_rva));
        };
        self.data.extend_from_slice(bytes);
        Ok(rva)
    }
}

impl Module {
    /// Serialize the module as a PE image.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] if the source image has no room for another
    /// section header or new methods are not owned by new types in table order, and
    /// [`crate::Error::Malformed`] if a row or heap exceeds what the format can hold.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match &self.image {
            Some(image) if self.is_unchanged(image) => Ok(image.data.clone()),
            Some(image) => self.write_patch_section(image),
            None => self.write_image(),
        }
    }

    /// Serialize the module and atomically replace `path` with it.
    ///
    /// # Errors
    /// Returns the errors of [`Module::to_bytes`], and [`crate::Error::WriteFailed`] if the
    /// file cannot be written. `path` is left untouched on error.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = self.to_bytes()?;
        let mut output = Output::create(path)?;
        output.write_all(&data)?;
        output.finalize()?;

        debug!("Wrote {} ({} bytes) to {}", self.name, data.len(), path.display());
        Ok(())
    }

    fn is_unchanged(&self, image: &SourceImage) -> bool {
        image.rows(TableId::AssemblyRef) == self.assembly_refs.len()
            && image.rows(TableId::TypeRef) == self.type_refs.len()
            && image.rows(TableId::TypeDef) == self.type_defs.len()
            && image.rows(TableId::MethodDef) == self.method_defs.len()
            && image.rows(TableId::MemberRef) == self.member_refs.len()
            && image.user_strings_len == self.user_strings.len()
            && self
                .method_defs
                .iter()
                .all(|method| method.body.as_ref().is_none_or(|body| !body.is_modified()))
    }

    /// Place bodies of methods from `first` on, and edited bodies before it. `None` keeps
    /// the RVA the row already has.
    fn place_bodies(&self, payload: &mut Payload, first: usize) -> Result<Vec<Option<u32>>> {
        let mut rvas = Vec::with_capacity(self.method_defs.len());
        for (index, method) in self.method_defs.iter().enumerate() {
            let rva = match &method.body {
                Some(body) if index >= first || body.is_modified() => {
                    Some(payload.append(&body.to_bytes()?)?)
                }
                _ => None,
            };
            rvas.push(rva);
        }
        Ok(rvas)
    }

    fn write_patch_section(&self, image: &SourceImage) -> Result<Vec<u8>> {
        let layout = &image.layout;
        let mut data = image.data.clone();

        if let Some(certificate) = layout.certificate.filter(|directory| directory.size > 0) {
            warn!(
                "{}: dropping the Authenticode signature, it does not cover the patched image",
                self.name
            );
            let start = certificate.virtual_address as usize;
            if start.saturating_add(certificate.size as usize) == data.len() {
                data.truncate(start);
            }
            let offset = layout.data_directory_offset(DIRECTORY_CERTIFICATE);
            put(&mut data, offset, 0u32)?;
            put(&mut data, offset + 4, 0u32)?;
        }
        if image.cor20.is_strong_name_signed() {
            warn!(
                "{}: the strong name signature is invalidated by patching and must be re-signed",
                self.name
            );
        }

        let header_offset = layout.section_table_end();
        let header_end = header_offset + SIZEOF_SECTION_HEADER;
        if header_end > layout.first_section_data()
            || data
                .get(header_offset..header_end)
                .is_none_or(|slack| slack.iter().any(|byte| *byte != 0))
        {
            return Err(NotSupported);
        }

        let virtual_address = layout.next_section_rva();
        let mut payload = Payload::new(virtual_address);
        let rvas = self.place_bodies(&mut payload, image.rows(TableId::MethodDef))?;
        let metadata = self.build_metadata(Some(image), &rvas)?;
        let metadata_rva = payload.append(&metadata)?;
        let virtual_size = payload.data.len();

        let raw_offset = align_up(data.len(), layout.file_alignment as usize);
        let raw_size = align_up(virtual_size, layout.file_alignment as usize);
        data.resize(raw_offset, 0);
        data.extend_from_slice(&payload.data);
        data.resize(raw_offset + raw_size, 0);

        data[header_offset..header_offset + PATCH_SECTION_NAME.len()]
            .copy_from_slice(&PATCH_SECTION_NAME);
        let mut offset = header_offset + PATCH_SECTION_NAME.len();
        let header = &mut data[..];
        write_le_at(header, &mut offset, to_u32(virtual_size)?)?;
        write_le_at(header, &mut offset, virtual_address)?;
        write_le_at(header, &mut offset, to_u32(raw_size)?)?;
        write_le_at(header, &mut offset, to_u32(raw_offset)?)?;
        write_le_at(header, &mut offset, 0u32)?;
        write_le_at(header, &mut offset, 0u32)?;
        write_le_at(header, &mut offset, 0u16)?;
        write_le_at(header, &mut offset, 0u16)?;
        write_le_at(header, &mut offset, PATCH_SECTION_CHARACTERISTICS)?;

        let mut offset = layout.number_of_sections_offset();
        let sections = read_le_at::<u16>(&data, &mut offset)?;
        put(&mut data, layout.number_of_sections_offset(), sections + 1)?;

        let mut offset = layout.size_of_initialized_data_offset();
        let initialized = read_le_at::<u32>(&data, &mut offset)?;
        put(
            &mut data,
            layout.size_of_initialized_data_offset(),
            initialized.wrapping_add(to_u32(raw_size)?),
        )?;

        let image_end = virtual_address.saturating_add(to_u32(virtual_size)?);
        put(
            &mut data,
            layout.size_of_image_offset(),
            align_up_u32(image_end, layout.section_alignment),
        )?;

        let directory = image.cor20_offset + METADATA_DIRECTORY_OFFSET;
        put(&mut data, directory, metadata_rva)?;
        put(&mut data, directory + 4, to_u32(metadata.len())?)?;

        if layout.check_sum != 0 {
            let offset = layout.check_sum_offset();
            put(&mut data, offset, 0u32)?;
            let check_sum = pe_checksum(&data, offset);
            put(&mut data, offset, check_sum)?;
        }

        debug!(
            "{}: appended section at {:#x} with {} bytes of bodies and metadata",
            self.name, virtual_address, virtual_size
        );
        Ok(data)
    }

    fn write_image(&self) -> Result<Vec<u8>> {
        let is_exe = Path::new(&self.name)
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case("exe"));

        let mut payload = Payload::new(FRESH_TEXT_RVA);
        payload.append(&[0; COR20_HEADER_SIZE])?;
        let rvas = self.place_bodies(&mut payload, 0)?;
        let metadata = self.build_metadata(None, &rvas)?;
        let metadata_rva = payload.append(&metadata)?;
        let cor20 = Cor20Header::il_only(metadata_rva, to_u32(metadata.len())?);
        payload.data[..COR20_HEADER_SIZE].copy_from_slice(&cor20.to_bytes());

        let virtual_size = to_u32(payload.data.len())?;
        let raw_size = align_up_u32(virtual_size, FRESH_FILE_ALIGNMENT);
        let size_of_image = align_up_u32(FRESH_TEXT_RVA + virtual_size, FRESH_SECTION_ALIGNMENT);

        let mut data = Vec::with_capacity(FRESH_SIZE_OF_HEADERS as usize + raw_size as usize);
        data.extend_from_slice(b"MZ");
        data.resize(0x3C, 0);
        push_le(&mut data, to_u32(DOS_PE_POINTER)?);
        data.resize(DOS_PE_POINTER, 0);
        data.extend_from_slice(b"PE\0\0");

        // COFF header
        push_le(&mut data, 0x014Cu16);
        push_le(&mut data, 1u16);
        push_le(&mut data, 0u32);
        push_le(&mut data, 0u32);
        push_le(&mut data, 0u32);
        push_le(&mut data, PE32_OPTIONAL_HEADER_SIZE);
        push_le(&mut data, if is_exe { CHARACTERISTICS_EXE } else { CHARACTERISTICS_DLL });

        // Optional header, standard fields
        let optional_header_offset = data.len();
        push_le(&mut data, MAGIC_PE32);
        push_le(&mut data, 8u8);
        push_le(&mut data, 0u8);
        push_le(&mut data, raw_size);
        push_le(&mut data, 0u32);
        push_le(&mut data, 0u32);
        push_le(&mut data, 0u32);
        push_le(&mut data, FRESH_TEXT_RVA);
        push_le(&mut data, 0u32);

        // Windows fields
        push_le(&mut data, if is_exe { 0x0040_0000u32 } else { 0x1000_0000 });
        push_le(&mut data, FRESH_SECTION_ALIGNMENT);
        push_le(&mut data, FRESH_FILE_ALIGNMENT);
        push_le(&mut data, 4u16);
        push_le(&mut data, 0u16);
        push_le(&mut data, 0u16);
        push_le(&mut data, 0u16);
        push_le(&mut data, 4u16);
        push_le(&mut data, 0u16);
        push_le(&mut data, 0u32);
        push_le(&mut data, size_of_image);
        push_le(&mut data, FRESH_SIZE_OF_HEADERS);
        let check_sum_offset = data.len();
        push_le(&mut data, 0u32);
        push_le(&mut data, 3u16);
        push_le(&mut data, DLL_CHARACTERISTICS);
        push_le(&mut data, 0x0010_0000u32);
        push_le(&mut data, 0x1000u32);
        push_le(&mut data, 0x0010_0000u32);
        push_le(&mut data, 0x1000u32);
        push_le(&mut data, 0u32);
        push_le(&mut data, to_u32(DATA_DIRECTORY_COUNT)?);

        for index in 0..DATA_DIRECTORY_COUNT {
            if index == DIRECTORY_CLR {
                push_le(&mut data, FRESH_TEXT_RVA);
                push_le(&mut data, to_u32(COR20_HEADER_SIZE)?);
            } else {
                data.extend_from_slice(&[0; SIZEOF_DATA_DIRECTORY]);
            }
        }
        debug_assert_eq!(
            data.len() - optional_header_offset,
            usize::from(PE32_OPTIONAL_HEADER_SIZE)
        );

        data.extend_from_slice(b".text\0\0\0");
        push_le(&mut data, virtual_size);
        push_le(&mut data, FRESH_TEXT_RVA);
        push_le(&mut data, raw_size);
        push_le(&mut data, FRESH_SIZE_OF_HEADERS);
        push_le(&mut data, 0u32);
        push_le(&mut data, 0u32);
        push_le(&mut data, 0u16);
        push_le(&mut data, 0u16);
        push_le(&mut data, TEXT_SECTION_CHARACTERISTICS);

        data.resize(FRESH_SIZE_OF_HEADERS as usize, 0);
        data.extend_from_slice(&payload.data);
        data.resize(FRESH_SIZE_OF_HEADERS as usize + raw_size as usize, 0);

        let check_sum = pe_checksum(&data, check_sum_offset);
        put(&mut data, check_sum_offset, check_sum)?;
        Ok(data)
    }

    /// The metadata block: the source image's tables and heaps with this module's new rows
    /// appended, or all rows of a module built in memory.
    fn build_metadata(&self, image: Option<&SourceImage>, rvas: &[Option<u32>]) -> Result<Vec<u8>> {
        let base = |table: TableId| image.map_or(0, |image| image.rows(table));

        let (mut tables, mut strings, mut blobs, mut guids) = match image {
            Some(image) => (
                image.tables.clone(),
                StringsBuilder::new(&image.strings),
                BlobBuilder::new(&image.blobs),
                image.guids.clone(),
            ),
            None => (
                TablesStream::default(),
                StringsBuilder::new(&[]),
                BlobBuilder::new(&[]),
                Vec::new(),
            ),
        };

        if image.is_none() {
            tables.sorted = SORTED_TABLES;
            guids.extend_from_slice(&self.mvid);
            let name = strings.intern(&self.name)?;
            tables
                .table_mut(TableId::Module)
                .push(&[0, name, 1, 0, 0])?;

            let flags = if self.public_key.is_empty() {
                0
            } else {
                ASSEMBLY_FLAG_PUBLIC_KEY
            };
            let row = [
                HASH_ALGORITHM_SHA1,
                u32::from(self.version.major),
                u32::from(self.version.minor),
                u32::from(self.version.build),
                u32::from(self.version.revision),
                flags,
                blobs.push(&self.public_key)?,
                strings.intern(&self.assembly_name)?,
                strings.intern(&self.culture)?,
            ];
            tables.table_mut(TableId::Assembly).push(&row)?;
        }

        let method_table = tables.table_mut(TableId::MethodDef);
        for (index, rva) in rvas.iter().enumerate().take(base(TableId::MethodDef)) {
            if let Some(rva) = rva {
                let Some(row) = method_table.row_mut(index) else {
                    return Err(malformed_error!("MethodDef row {} is missing", index + 1));
                };
                row[0] = *rva;
            }
        }

        for assembly_ref in self.assembly_refs.iter().skip(base(TableId::AssemblyRef)) {
            let version = assembly_ref.version;
            let row = [
                u32::from(version.major),
                u32::from(version.minor),
                u32::from(version.build),
                u32::from(version.revision),
                assembly_ref.flags,
                blobs.push(&assembly_ref.public_key_or_token)?,
                strings.intern(&assembly_ref.name)?,
                strings.intern(&assembly_ref.culture)?,
                0,
            ];
            tables.table_mut(TableId::AssemblyRef).push(&row)?;
        }

        for type_ref in self.type_refs.iter().skip(base(TableId::TypeRef)) {
            let row = [
                CodedIndexType::ResolutionScope.encode(type_ref.resolution_scope)?,
                strings.intern(&type_ref.name)?,
                strings.intern(&type_ref.namespace)?,
            ];
            tables.table_mut(TableId::TypeRef).push(&row)?;
        }

        let field_list = to_u32(tables.table(TableId::Field).len() + 1)?;
        let mut next_method = base(TableId::MethodDef);
        let mut nested_classes = Vec::new();
        for (index, type_def) in self.type_defs.iter().enumerate().skip(base(TableId::TypeDef)) {
            let method_list = to_u32(next_method + 1)?;
            for method in &type_def.methods {
                if method.index() != Some(next_method) {
                    return Err(NotSupported);
                }
                next_method += 1;
            }

            let extends = match type_def.extends {
                Some(extends) => CodedIndexType::TypeDefOrRef.encode(extends)?,
                None => 0,
            };
            let row = [
                type_def.flags,
                strings.intern(&type_def.name)?,
                strings.intern(&type_def.namespace)?,
                extends,
                field_list,
                method_list,
            ];
            tables.table_mut(TableId::TypeDef).push(&row)?;

            if let Some(enclosing) = type_def.enclosing {
                nested_classes.push([to_u32(index + 1)?, enclosing.row()]);
            }
        }
        if next_method != self.method_defs.len() {
            return Err(NotSupported);
        }

        let param_list = to_u32(tables.table(TableId::Param).len() + 1)?;
        for (index, method) in self
            .method_defs
            .iter()
            .enumerate()
            .skip(base(TableId::MethodDef))
        {
            let row = [
                rvas.get(index).copied().flatten().unwrap_or(0),
                u32::from(method.impl_flags),
                u32::from(method.flags.bits()),
                strings.intern(&method.name)?,
                blobs.push(&method.signature)?,
                param_list,
            ];
            tables.table_mut(TableId::MethodDef).push(&row)?;
        }

        for member_ref in self.member_refs.iter().skip(base(TableId::MemberRef)) {
            let row = [
                CodedIndexType::MemberRefParent.encode(member_ref.parent)?,
                strings.intern(&member_ref.name)?,
                blobs.push(&member_ref.signature)?,
            ];
            tables.table_mut(TableId::MemberRef).push(&row)?;
        }

        for row in &nested_classes {
            tables.table_mut(TableId::NestedClass).push(row)?;
        }

        let mut heap_size_flags = 0;
        if strings.len() > 0xFFFF {
            heap_size_flags |= heap_sizes::LARGE_STRINGS;
        }
        if guids.len() / 16 > 0xFFFF {
            heap_size_flags |= heap_sizes::LARGE_GUID;
        }
        if blobs.len() > 0xFFFF {
            heap_size_flags |= heap_sizes::LARGE_BLOB;
        }

        let tables = tables.write(heap_size_flags)?;
        let strings = strings.into_bytes();
        let blobs = blobs.into_bytes();
        let mut streams: Vec<(&str, &[u8])> = vec![
            ("#~", tables.as_slice()),
            ("#Strings", strings.as_slice()),
            ("#US", self.user_strings.as_slice()),
            ("#GUID", guids.as_slice()),
            ("#Blob", blobs.as_slice()),
        ];

        let version = match image {
            Some(image) => {
                for header in &image.root.stream_headers {
                    let known = streams.iter().any(|(name, _)| *name == header.name);
                    if let (false, Some(data)) = (known, image.stream(&header.name)) {
                        streams.push((header.name.as_str(), data));
                    }
                }
                image.root.version.as_str()
            }
            None => DEFAULT_RUNTIME_VERSION,
        };

        Root::write(version, &streams)
    }
}
