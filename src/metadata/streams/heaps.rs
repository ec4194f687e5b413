//! The `#Strings`, `#Blob`, `#GUID` and `#US` heaps.
//!
//! Readers borrow the heap bytes of a loaded image. Builders start from a copy of those
//! bytes and only ever append, so every offset that existing rows and `ldstr` operands hold
//! stays valid.

use std::{collections::HashMap, ffi::CStr};

use crate::{
    file::{
        io::{push_compressed_uint, push_prefixed_bytes},
        parser::Parser,
    },
    metadata::token::{table, Token},
    Error::OutOfBounds,
    Result,
};

/// Read access to the `#Strings` heap.
pub struct Strings<'a> {
    data: &'a [u8],
}

impl<'a> Strings<'a> {
    /// Wrap the heap bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the heap does not start with the empty string.
    pub fn from(data: &'a [u8]) -> Result<Strings<'a>> {
        if data.first() != Some(&0) {
            return Err(malformed_error!("Provided #Strings heap is empty"));
        }
        Ok(Strings { data })
    }

    /// The string starting at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] past the end of the heap and
    /// [`crate::Error::Malformed`] for unterminated or invalid UTF-8 strings.
    pub fn get(&self, index: usize) -> Result<&'a str> {
        if index >= self.data.len() {
            return Err(OutOfBounds);
        }

        match CStr::from_bytes_until_nul(&self.data[index..]) {
            Ok(result) => result
                .to_str()
                .map_err(|_| malformed_error!("Invalid string at index - {}", index)),
            Err(_) => Err(malformed_error!("Invalid string at index - {}", index)),
        }
    }
}

/// Read access to the `#Blob` heap.
pub struct Blob<'a> {
    data: &'a [u8],
}

impl<'a> Blob<'a> {
    /// Wrap the heap bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the heap does not start with the empty blob.
    pub fn from(data: &'a [u8]) -> Result<Blob<'a>> {
        if data.first() != Some(&0) {
            return Err(malformed_error!("Invalid memory for #Blob heap"));
        }
        Ok(Blob { data })
    }

    /// The blob starting at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the blob extends beyond the heap.
    pub fn get(&self, index: usize) -> Result<&'a [u8]> {
        if index >= self.data.len() {
            return Err(OutOfBounds);
        }

        let mut parser = Parser::new(&self.data[index..]);
        parser.read_prefixed_bytes()
    }
}

/// Read access to the `#GUID` heap.
pub struct Guids<'a> {
    data: &'a [u8],
}

impl<'a> Guids<'a> {
    /// Wrap the heap bytes.
    #[must_use]
    pub fn from(data: &'a [u8]) -> Guids<'a> {
        Guids { data }
    }

    /// Number of GUIDs in the heap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len() / 16
    }

    /// Returns `true` if the heap holds no GUID.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The GUID with the one-based `index`, all zero for index 0.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] past the last GUID.
    pub fn get(&self, index: usize) -> Result<[u8; 16]> {
        let Some(start) = index.checked_sub(1) else {
            return Ok([0; 16]);
        };
        let start = start * 16;
        self.data
            .get(start..start + 16)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(OutOfBounds)
    }
}

/// Read access to the `#US` heap.
pub struct UserStrings<'a> {
    data: &'a [u8],
}

impl<'a> UserStrings<'a> {
    /// Wrap the heap bytes.
    #[must_use]
    pub fn from(data: &'a [u8]) -> UserStrings<'a> {
        UserStrings { data }
    }

    /// The string starting at `index`, as addressed by an `ldstr` token.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the entry extends beyond the heap and
    /// [`crate::Error::Malformed`] for invalid UTF-16.
    pub fn get(&self, index: usize) -> Result<String> {
        if index >= self.data.len() {
            return Err(OutOfBounds);
        }

        let mut parser = Parser::new(&self.data[index..]);
        parser.read_user_string()
    }
}

fn heap_offset(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| malformed_error!("Heap of {} bytes is too large", len))
}

/// Appends strings to a `#Strings` heap, reusing identical entries.
pub struct StringsBuilder {
    data: Vec<u8>,
    known: HashMap<String, u32>,
}

impl StringsBuilder {
    /// Start from an existing heap, which may be empty.
    #[must_use]
    pub fn new(existing: &[u8]) -> Self {
        let mut data = existing.to_vec();
        if data.is_empty() {
            data.push(0);
        }

        let mut known = HashMap::new();
        let mut start = 1;
        while start < data.len() {
            let end = data[start..]
                .iter()
                .position(|byte| *byte == 0)
                .map_or(data.len(), |length| start + length);
            if let (Ok(value), Ok(offset)) =
                (std::str::from_utf8(&data[start..end]), u32::try_from(start))
            {
                known.entry(value.to_string()).or_insert(offset);
            }
            start = end + 1;
        }

        StringsBuilder { data, known }
    }

    /// Offset of `value`, appending it if the heap does not hold it yet.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the heap grows beyond 4 GiB.
    pub fn intern(&mut self, value: &str) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if let Some(offset) = self.known.get(value) {
            return Ok(*offset);
        }

        let offset = heap_offset(self.data.len())?;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.known.insert(value.to_string(), offset);
        Ok(offset)
    }

    /// Size of the heap so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if only the empty string is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() <= 1
    }

    /// The heap bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Appends blobs to a `#Blob` heap.
pub struct BlobBuilder {
    data: Vec<u8>,
    added: HashMap<Vec<u8>, u32>,
}

impl BlobBuilder {
    /// Start from an existing heap, which may be empty.
    #[must_use]
    pub fn new(existing: &[u8]) -> Self {
        let mut data = existing.to_vec();
        if data.is_empty() {
            data.push(0);
        }
        BlobBuilder {
            data,
            added: HashMap::new(),
        }
    }

    /// Offset of a blob holding `value`; empty blobs share offset 0.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the blob or the heap is too large.
    pub fn push(&mut self, value: &[u8]) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if let Some(offset) = self.added.get(value) {
            return Ok(*offset);
        }

        let offset = heap_offset(self.data.len())?;
        push_prefixed_bytes(&mut self.data, value)?;
        self.added.insert(value.to_vec(), offset);
        Ok(offset)
    }

    /// Size of the heap so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if only the empty blob is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() <= 1
    }

    /// The heap bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Whether a `#US` entry needs its trailing flag byte set to 1.
fn needs_special_handling(units: &[u16]) -> bool {
    units.iter().any(|unit| {
        *unit > 0xFF
            || matches!(*unit, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D | 0x7F)
    })
}

/// Append `value` to a `#US` heap and return its `ldstr` token.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] once the heap offset no longer fits a token.
pub fn push_user_string(heap: &mut Vec<u8>, value: &str) -> Result<Token> {
    if heap.is_empty() {
        heap.push(0);
    }

    let offset = heap_offset(heap.len())?;
    if offset > 0x00FF_FFFF {
        return Err(malformed_error!(
            "#US heap offset {:#x} exceeds the token range",
            offset
        ));
    }

    let units: Vec<u16> = value.encode_utf16().collect();
    let length = heap_offset(units.len() * 2 + 1)?;
    push_compressed_uint(heap, length)?;
    for unit in &units {
        heap.extend_from_slice(&unit.to_le_bytes());
    }
    heap.push(u8::from(needs_special_handling(&units)));

    Ok(Token::from_parts(table::USER_STRING, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn strings() {
        let data = b"\0<Module>\0Game.dll\0System\0";
        let strings = Strings::from(data).unwrap();
        assert_eq!(strings.get(0).unwrap(), "");
        assert_eq!(strings.get(1).unwrap(), "<Module>");
        assert_eq!(strings.get(15).unwrap(), "dll");
        assert!(matches!(strings.get(data.len()), Err(Error::OutOfBounds)));
        assert!(Strings::from(b"abc\0").is_err());
        assert!(matches!(
            Strings::from(b"\0abc").unwrap().get(1),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn strings_builder_reuses_entries() {
        let mut builder = StringsBuilder::new(b"\0<Module>\0System.IO\0");
        assert_eq!(builder.intern("System.IO").unwrap(), 10);
        assert_eq!(builder.intern("").unwrap(), 0);

        let offset = builder.intern("FileAccess").unwrap();
        assert_eq!(offset, 20);
        assert_eq!(builder.intern("FileAccess").unwrap(), offset);

        let data = builder.into_bytes();
        assert_eq!(Strings::from(&data).unwrap().get(20).unwrap(), "FileAccess");
    }

    #[test]
    fn blobs() {
        let mut builder = BlobBuilder::new(&[]);
        assert_eq!(builder.push(&[]).unwrap(), 0);
        let ctor = builder.push(&[0x20, 0x02, 0x01, 0x0E, 0x11, 0x0C]).unwrap();
        assert_eq!(ctor, 1);
        assert_eq!(builder.push(&[0x20, 0x02, 0x01, 0x0E, 0x11, 0x0C]).unwrap(), 1);

        let data = builder.into_bytes();
        let blob = Blob::from(&data).unwrap();
        assert_eq!(blob.get(1).unwrap(), &[0x20, 0x02, 0x01, 0x0E, 0x11, 0x0C]);
        assert!(blob.get(0).unwrap().is_empty());
        assert!(Blob::from(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn guids() {
        let mut data = vec![0u8; 32];
        data[16] = 0xAA;
        let guids = Guids::from(&data);
        assert_eq!(guids.len(), 2);
        assert_eq!(guids.get(0).unwrap(), [0; 16]);
        assert_eq!(guids.get(2).unwrap()[0], 0xAA);
        assert!(guids.get(3).is_err());
    }

    #[test]
    fn user_strings() {
        let mut heap = Vec::new();
        let first = push_user_string(&mut heap, "save.dat").unwrap();
        let second = push_user_string(&mut heap, "it's").unwrap();
        assert_eq!(first, Token::new(0x7000_0001));
        assert_eq!(second.row() as usize, 1 + 1 + 16 + 1);

        // Plain ASCII clears the flag byte, an apostrophe sets it
        assert_eq!(heap[18], 0);
        assert_eq!(*heap.last().unwrap(), 1);

        let strings = UserStrings::from(&heap);
        assert_eq!(strings.get(1).unwrap(), "save.dat");
        assert_eq!(strings.get(second.row() as usize).unwrap(), "it's");
        assert!(strings.get(heap.len()).is_err());
    }
}
