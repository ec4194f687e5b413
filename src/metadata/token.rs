//! Metadata tokens.
//!
//! A token names one row of one metadata table: the high byte selects the table, the low
//! 24 bits hold the 1-based row id. Instructions carry tokens as operands (`newobj`,
//! `call`, `ldstr`), so every cross reference inside a module goes through this type.

use std::fmt;

/// Table identifiers used in the high byte of a [`Token`].
pub mod table {
    /// `TypeRef` - types defined in other assemblies
    pub const TYPE_REF: u8 = 0x01;
    /// `TypeDef` - types defined in this module
    pub const TYPE_DEF: u8 = 0x02;
    /// `MethodDef` - methods defined in this module
    pub const METHOD_DEF: u8 = 0x06;
    /// `MemberRef` - methods and fields referenced from other assemblies
    pub const MEMBER_REF: u8 = 0x0A;
    /// `TypeSpec` - constructed types (only produced by signature coded indices)
    pub const TYPE_SPEC: u8 = 0x1B;
    /// `AssemblyRef` - external assembly dependencies
    pub const ASSEMBLY_REF: u8 = 0x23;
    /// User string heap offset, used by `ldstr`
    pub const USER_STRING: u8 = 0x70;
}

/// A metadata token referencing a table row.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Creates a token from its raw 32-bit value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table id and a row id. Rows beyond 24 bits are truncated.
    #[must_use]
    pub fn from_parts(table: u8, row: u32) -> Self {
        Token(u32::from(table) << 24 | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The table id (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The row id (low 24 bits)
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if the row id is 0, which never names a row.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.row() == 0
    }

    /// Returns true if the token points into `table`.
    #[must_use]
    pub fn is_table(&self, table: u8) -> bool {
        self.table() == table
    }

    /// Zero-based index of the row within its table, `None` for null tokens.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        (self.row() as usize).checked_sub(1)
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
