//! Low-level byte stream parser for module images, method bodies and signature blobs.
//!
//! [`Parser`] is a cursor over a borrowed byte slice. Every read is bounds-checked and
//! advances the cursor; failures surface as [`crate::Error::OutOfBounds`] or
//! [`crate::Error::Malformed`] instead of panics, so truncated or corrupt input is always
//! reported as a load error.
//!
//! # Usage Examples
//!
//! ```rust
//! use cilpatch::Parser;
//!
//! let data = [0x01, 0x02, 0x03, 0x04];
//! let mut parser = Parser::new(&data);
//!
//! let value = parser.read_le::<u16>()?;
//! assert_eq!(value, 0x0201);
//! assert_eq!(parser.pos(), 2);
//! # Ok::<(), cilpatch::Error>(())
//! ```

use widestring::U16String;

use crate::{
    file::io::{read_le_at, CilIO},
    Error::OutOfBounds,
    Result,
};

/// A cursor-based binary data parser.
///
/// The parser maintains an internal position and validates every access against the
/// length of the underlying data.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`Parser`] from a byte slice.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the parser has no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there are bytes left after the current position.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Number of bytes left after the current position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Move the cursor to an absolute position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` lies beyond the end of the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(OutOfBounds);
        }

        self.position = pos;
        Ok(())
    }

    /// Current cursor position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Peek at the current byte without advancing.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] at the end of the data.
    pub fn peek_byte(&self) -> Result<u8> {
        self.data.get(self.position).copied().ok_or(OutOfBounds)
    }

    /// Advance the cursor to the next multiple of `alignment`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the aligned position lies beyond the data.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = (alignment - (self.position % alignment)) % alignment;
        self.seek(self.position + padding)
    }

    /// Read a value of type `T` in little-endian byte order.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if there are not enough bytes left.
    pub fn read_le<T: CilIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Read a compressed unsigned integer as defined in ECMA-335 II.23.2.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length or
    /// [`crate::Error::Malformed`] for an invalid leading byte.
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let first_byte = self.read_le::<u8>()?;

        // 1-byte encoding: 0xxxxxxx
        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        // 2-byte encoding: 10xxxxxx xxxxxxxx
        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_le::<u8>()?;
            let value = ((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte);
            return Ok(value);
        }

        // 4-byte encoding: 110xxxxx xxxxxxxx xxxxxxxx xxxxxxxx
        if (first_byte & 0xE0) == 0xC0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            let value = ((u32::from(first_byte) & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3;
            return Ok(value);
        }

        Err(malformed_error!("Invalid compressed uint - {}", first_byte))
    }

    /// Read `length` raw bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if there are not enough bytes left.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let Some(end) = self.position.checked_add(length) else {
            return Err(OutOfBounds);
        };
        if end > self.data.len() {
            return Err(OutOfBounds);
        }

        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Read a blob prefixed with its compressed length.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the blob extends beyond the data.
    pub fn read_prefixed_bytes(&mut self) -> Result<&'a [u8]> {
        let length = self.read_compressed_uint()? as usize;
        self.read_bytes(length)
    }

    /// Read a `#US` heap entry: a compressed byte length, UTF-16LE code units and, for odd
    /// lengths, one trailing flag byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the entry extends beyond the data, or
    /// [`crate::Error::Malformed`] if it holds invalid UTF-16.
    pub fn read_user_string(&mut self) -> Result<String> {
        let start = self.position;
        let bytes = self.read_prefixed_bytes()?;
        let text = &bytes[..bytes.len() & !1];

        let units: Vec<u16> = text
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        U16String::from_vec(units)
            .to_string()
            .map_err(|_| malformed_error!("Invalid UTF-16 user string at offset {}", start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_read_compressed_uint() {
        let test_cases = vec![
            (vec![0x03], 3),                             // 1-byte format
            (vec![0x7F], 0x7F),                          // 1-byte format, max value
            (vec![0x80, 0x80], 0x80),                    // 2-byte format, min value
            (vec![0xBF, 0xFF], 0x3FFF),                  // 2-byte format, max value
            (vec![0xC0, 0x00, 0x40, 0x00], 0x4000),      // 4-byte format
            (vec![0xDF, 0xFF, 0xFF, 0xFF], 0x1FFF_FFFF), // 4-byte format, max value
        ];

        for (input, expected) in test_cases {
            let mut parser = Parser::new(&input);
            assert_eq!(parser.read_compressed_uint().unwrap(), expected);
            assert!(!parser.has_more_data());
        }
    }

    #[test]
    fn test_read_compressed_uint_invalid() {
        let mut parser = Parser::new(&[0xE0]);
        assert!(matches!(
            parser.read_compressed_uint(),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_seek_and_align() {
        let data = [0u8; 8];
        let mut parser = Parser::new(&data);
        parser.seek(1).unwrap();
        parser.align(4).unwrap();
        assert_eq!(parser.pos(), 4);
        parser.align(4).unwrap();
        assert_eq!(parser.pos(), 4);
        assert!(matches!(parser.seek(9), Err(Error::OutOfBounds)));
    }

    #[test]
    fn test_user_strings() {
        let data = [
            0x05, b'h', 0x00, b'i', 0x00, 0x00, // "hi" with its flag byte
            0x04, 0x3C, 0xD8, 0xAE, 0xDF, // surrogate pair, no flag byte
            0x01, 0x00, // empty string
        ];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_user_string().unwrap(), "hi");
        assert_eq!(parser.read_user_string().unwrap(), "\u{1F3AE}");
        assert_eq!(parser.read_user_string().unwrap(), "");
        assert_eq!(parser.remaining(), 0);

        let mut parser = Parser::new(&[0x03, 0x00, 0xD8, 0x00]);
        assert!(matches!(
            parser.read_user_string(),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_read_bytes_out_of_bounds() {
        let data = [0x05, 0x01, 0x02];
        let mut parser = Parser::new(&data);
        assert!(matches!(
            parser.read_prefixed_bytes(),
            Err(Error::OutOfBounds)
        ));
    }
}
