//! Row layouts of the `#~` tables.
//!
//! Every table is described by its column kinds ([`Column`]). The byte width of a column
//! depends on the module: heap indices are 2 or 4 bytes depending on the heap size flags,
//! table indices grow to 4 bytes once the target table exceeds 65535 rows, and coded
//! indices grow once the largest of their target tables no longer fits beside the tag.
//! [`TableInfo`] captures those widths for one module.
//!
//! # Reference
//! - ECMA-335 6th Edition, Partition II, Section 22 - Metadata logical format: tables
//! - ECMA-335 6th Edition, Partition II, Section 24.2.6 - #~ stream

use strum::{EnumCount, EnumIter, FromRepr, IntoEnumIterator};

use crate::{
    metadata::token::Token,
    Error::{InvalidToken, NotSupported},
    Result,
};

/// The metadata tables of a module, by table id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TableId {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRva = 0x1D,
    EncLog = 0x1E,
    EncMap = 0x1F,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOs = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOs = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
}

/// Kind of a table column, which determines its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// Fixed two-byte value
    U16,
    /// Fixed four-byte value
    U32,
    /// Index into `#Strings`
    Str,
    /// Index into `#GUID`
    Guid,
    /// Index into `#Blob`
    Blob,
    /// Row index into one table
    Table(TableId),
    /// Coded index into one of several tables
    Coded(CodedIndexType),
}

impl TableId {
    /// The columns of a row of this table, in storage order.
    #[must_use]
    pub fn columns(self) -> &'static [Column] {
        use CodedIndexType as C;
        use Column::{Blob, Coded, Guid, Str, Table, U16, U32};

        match self {
            TableId::Module => &[U16, Str, Guid, Guid, Guid],
            TableId::TypeRef => &[Coded(C::ResolutionScope), Str, Str],
            TableId::TypeDef => &[
                U32,
                Str,
                Str,
                Coded(C::TypeDefOrRef),
                Table(TableId::Field),
                Table(TableId::MethodDef),
            ],
            TableId::FieldPtr => &[Table(TableId::Field)],
            TableId::Field => &[U16, Str, Blob],
            TableId::MethodPtr => &[Table(TableId::MethodDef)],
            TableId::MethodDef => &[U32, U16, U16, Str, Blob, Table(TableId::Param)],
            TableId::ParamPtr => &[Table(TableId::Param)],
            TableId::Param => &[U16, U16, Str],
            TableId::InterfaceImpl => &[Table(TableId::TypeDef), Coded(C::TypeDefOrRef)],
            TableId::MemberRef => &[Coded(C::MemberRefParent), Str, Blob],
            // Type and padding byte read as one value
            TableId::Constant => &[U16, Coded(C::HasConstant), Blob],
            TableId::CustomAttribute => &[
                Coded(C::HasCustomAttribute),
                Coded(C::CustomAttributeType),
                Blob,
            ],
            TableId::FieldMarshal => &[Coded(C::HasFieldMarshal), Blob],
            TableId::DeclSecurity => &[U16, Coded(C::HasDeclSecurity), Blob],
            TableId::ClassLayout => &[U16, U32, Table(TableId::TypeDef)],
            TableId::FieldLayout => &[U32, Table(TableId::Field)],
            TableId::StandAloneSig => &[Blob],
            TableId::EventMap => &[Table(TableId::TypeDef), Table(TableId::Event)],
            TableId::EventPtr => &[Table(TableId::Event)],
            TableId::Event => &[U16, Str, Coded(C::TypeDefOrRef)],
            TableId::PropertyMap => &[Table(TableId::TypeDef), Table(TableId::Property)],
            TableId::PropertyPtr => &[Table(TableId::Property)],
            TableId::Property => &[U16, Str, Blob],
            TableId::MethodSemantics => {
                &[U16, Table(TableId::MethodDef), Coded(C::HasSemantics)]
            }
            TableId::MethodImpl => &[
                Table(TableId::TypeDef),
                Coded(C::MethodDefOrRef),
                Coded(C::MethodDefOrRef),
            ],
            TableId::ModuleRef => &[Str],
            TableId::TypeSpec => &[Blob],
            TableId::ImplMap => &[
                U16,
                Coded(C::MemberForwarded),
                Str,
                Table(TableId::ModuleRef),
            ],
            TableId::FieldRva => &[U32, Table(TableId::Field)],
            TableId::EncLog => &[U32, U32],
            TableId::EncMap => &[U32],
            TableId::Assembly => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
            TableId::AssemblyProcessor => &[U32],
            TableId::AssemblyOs => &[U32, U32, U32],
            TableId::AssemblyRef => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
            TableId::AssemblyRefProcessor => &[U32, Table(TableId::AssemblyRef)],
            TableId::AssemblyRefOs => &[U32, U32, U32, Table(TableId::AssemblyRef)],
            TableId::File => &[U32, Str, Blob],
            TableId::ExportedType => &[U32, U32, Str, Str, Coded(C::Implementation)],
            TableId::ManifestResource => &[U32, U32, Str, Coded(C::Implementation)],
            TableId::NestedClass => &[Table(TableId::TypeDef), Table(TableId::TypeDef)],
            TableId::GenericParam => &[U16, U16, Coded(C::TypeOrMethodDef), Str],
            TableId::MethodSpec => &[Coded(C::MethodDefOrRef), Blob],
            TableId::GenericParamConstraint => {
                &[Table(TableId::GenericParam), Coded(C::TypeDefOrRef)]
            }
        }
    }

    /// The token of row `row` of this table.
    #[must_use]
    pub fn token(self, row: u32) -> Token {
        Token::from_parts(self as u8, row)
    }
}

/// Sets of tables a coded index can point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
#[allow(missing_docs)]
pub enum CodedIndexType {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl CodedIndexType {
    /// Target tables in tag order.
    #[must_use]
    pub fn tables(self) -> &'static [TableId] {
        match self {
            CodedIndexType::TypeDefOrRef => {
                &[TableId::TypeDef, TableId::TypeRef, TableId::TypeSpec]
            }
            CodedIndexType::HasConstant => &[TableId::Field, TableId::Param, TableId::Property],
            CodedIndexType::HasCustomAttribute => &[
                TableId::MethodDef,
                TableId::Field,
                TableId::TypeRef,
                TableId::TypeDef,
                TableId::Param,
                TableId::InterfaceImpl,
                TableId::MemberRef,
                TableId::Module,
                TableId::DeclSecurity,
                TableId::Property,
                TableId::Event,
                TableId::StandAloneSig,
                TableId::ModuleRef,
                TableId::TypeSpec,
                TableId::Assembly,
                TableId::AssemblyRef,
                TableId::File,
                TableId::ExportedType,
                TableId::ManifestResource,
                TableId::GenericParam,
                TableId::GenericParamConstraint,
                TableId::MethodSpec,
            ],
            CodedIndexType::HasFieldMarshal => &[TableId::Field, TableId::Param],
            CodedIndexType::HasDeclSecurity => {
                &[TableId::TypeDef, TableId::MethodDef, TableId::Assembly]
            }
            CodedIndexType::MemberRefParent => &[
                TableId::TypeDef,
                TableId::TypeRef,
                TableId::ModuleRef,
                TableId::MethodDef,
                TableId::TypeSpec,
            ],
            CodedIndexType::HasSemantics => &[TableId::Event, TableId::Property],
            CodedIndexType::MethodDefOrRef => &[TableId::MethodDef, TableId::MemberRef],
            CodedIndexType::MemberForwarded => &[TableId::Field, TableId::MethodDef],
            CodedIndexType::Implementation => {
                &[TableId::File, TableId::AssemblyRef, TableId::ExportedType]
            }
            // Tags 0, 1 and 4 are unused
            CodedIndexType::CustomAttributeType => &[
                TableId::MethodDef,
                TableId::MethodDef,
                TableId::MethodDef,
                TableId::MemberRef,
                TableId::MemberRef,
            ],
            CodedIndexType::ResolutionScope => &[
                TableId::Module,
                TableId::ModuleRef,
                TableId::AssemblyRef,
                TableId::TypeRef,
            ],
            CodedIndexType::TypeOrMethodDef => &[TableId::TypeDef, TableId::MethodDef],
        }
    }

    /// Number of low bits holding the tag.
    #[must_use]
    pub fn tag_bits(self) -> u32 {
        let tags = self.tables().len() as u32;
        u32::BITS - (tags - 1).leading_zeros()
    }

    /// Decode a raw coded index into a token. Row 0 yields a null token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for tags outside the table set.
    pub fn decode(self, value: u32) -> Result<Token> {
        let bits = self.tag_bits();
        let tag = (value & ((1 << bits) - 1)) as usize;
        let Some(table) = self.tables().get(tag) else {
            return Err(malformed_error!(
                "Invalid {:?} coded index - {:#x}",
                self,
                value
            ));
        };
        Ok(table.token(value >> bits))
    }

    /// Encode a token as a raw coded index.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidToken`] if the token's table is not part of this set.
    pub fn encode(self, token: Token) -> Result<u32> {
        let tag = match self {
            CodedIndexType::CustomAttributeType => match TableId::from_repr(token.table()) {
                Some(TableId::MethodDef) => Some(2),
                Some(TableId::MemberRef) => Some(3),
                _ => None,
            },
            _ => self
                .tables()
                .iter()
                .position(|table| *table as u8 == token.table()),
        };

        match tag {
            Some(tag) => Ok(token.row() << self.tag_bits() | tag as u32),
            None => Err(InvalidToken(token)),
        }
    }
}

/// Heap index width flags of the `#~` header.
pub mod heap_sizes {
    /// `#Strings` indices are 4 bytes
    pub const LARGE_STRINGS: u8 = 0x01;
    /// `#GUID` indices are 4 bytes
    pub const LARGE_GUID: u8 = 0x02;
    /// `#Blob` indices are 4 bytes
    pub const LARGE_BLOB: u8 = 0x04;
    /// Four extra bytes follow the row counts
    pub const EXTRA_DATA: u8 = 0x40;
}

/// Column widths of one module's tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    rows: [u32; TableId::COUNT],
    large_str: bool,
    large_guid: bool,
    large_blob: bool,
}

impl TableInfo {
    /// Widths for the given row counts (indexed by table id) and heap size flags.
    #[must_use]
    pub fn new(rows: [u32; TableId::COUNT], heap_sizes: u8) -> Self {
        TableInfo {
            rows,
            large_str: heap_sizes & heap_sizes::LARGE_STRINGS != 0,
            large_guid: heap_sizes & heap_sizes::LARGE_GUID != 0,
            large_blob: heap_sizes & heap_sizes::LARGE_BLOB != 0,
        }
    }

    /// Row count of `table`.
    #[must_use]
    pub fn rows(&self, table: TableId) -> u32 {
        self.rows[table as usize]
    }

    /// Width of one column in bytes, 2 or 4.
    #[must_use]
    pub fn column_size(&self, column: Column) -> usize {
        let large = match column {
            Column::U16 => false,
            Column::U32 => true,
            Column::Str => self.large_str,
            Column::Guid => self.large_guid,
            Column::Blob => self.large_blob,
            Column::Table(table) => self.rows(table) > u32::from(u16::MAX),
            Column::Coded(coded) => {
                let limit = 1u32 << (16 - coded.tag_bits());
                coded.tables().iter().any(|table| self.rows(*table) >= limit)
            }
        };

        if large {
            4
        } else {
            2
        }
    }

    /// Size of one row of `table` in bytes.
    #[must_use]
    pub fn row_size(&self, table: TableId) -> usize {
        table
            .columns()
            .iter()
            .map(|column| self.column_size(*column))
            .sum()
    }
}

/// Table id of a valid-mask bit, refusing tables this crate has no layout for.
///
/// # Errors
/// Returns [`crate::Error::NotSupported`] for bits above the last known table.
pub fn table_for_bit(bit: u32) -> Result<TableId> {
    u8::try_from(bit)
        .ok()
        .and_then(TableId::from_repr)
        .ok_or(NotSupported)
}

/// All tables in id order.
pub fn all_tables() -> impl Iterator<Item = TableId> {
    TableId::iter()
}
