//! The metadata root.
//!
//! The CLI header points at this structure: a signature, the runtime version string and a
//! directory of named streams (`#~`, `#Strings`, `#US`, `#GUID`, `#Blob`), each given as an
//! offset and size relative to the root.
//!
//! # Reference
//! - ECMA-335 6th Edition, Partition II, Section 24.2.1 - Metadata root
//! - ECMA-335 6th Edition, Partition II, Section 24.2.2 - Stream header

use crate::{
    file::{io::push_le, parser::Parser, pe::align_up},
    Result,
};

/// Signature of the metadata root, `BSJB`
pub const CIL_HEADER_MAGIC: u32 = 0x424A_5342;
/// Version string written into images built from scratch
pub const DEFAULT_RUNTIME_VERSION: &str = "v4.0.30319";

/// Longest stream name, terminator included
const MAX_STREAM_NAME: usize = 32;

/// One entry of the stream directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Offset of the stream relative to the metadata root
    pub offset: u32,
    /// Size of the stream in bytes
    pub size: u32,
    /// Stream name, e.g. `#Strings`
    pub name: String,
}

/// The metadata root of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    /// Major version, always 1
    pub major_version: u16,
    /// Minor version, always 1
    pub minor_version: u16,
    /// Runtime version string, e.g. `v4.0.30319`
    pub version: String,
    /// Reserved, always 0
    pub flags: u16,
    /// The stream directory
    pub stream_headers: Vec<StreamHeader>,
}

impl Root {
    /// Parse the root at the start of `data`, which must span the whole metadata.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a bad signature, an unterminated stream name
    /// or a stream that extends beyond `data`.
    pub fn read(data: &[u8]) -> Result<Root> {
        let mut parser = Parser::new(data);

        let signature = parser.read_le::<u32>()?;
        if signature != CIL_HEADER_MAGIC {
            return Err(malformed_error!(
                "Invalid metadata signature - {:#x}",
                signature
            ));
        }

        let major_version = parser.read_le::<u16>()?;
        let minor_version = parser.read_le::<u16>()?;
        parser.read_le::<u32>()?;

        let length = parser.read_le::<u32>()? as usize;
        let version_bytes = parser.read_bytes(length)?;
        let version_end = version_bytes
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(version_bytes.len());
        let version = String::from_utf8_lossy(&version_bytes[..version_end]).into_owned();

        let flags = parser.read_le::<u16>()?;
        let stream_count = parser.read_le::<u16>()?;

        let mut stream_headers = Vec::with_capacity(usize::from(stream_count));
        for _ in 0..stream_count {
            let offset = parser.read_le::<u32>()?;
            let size = parser.read_le::<u32>()?;

            let name_start = parser.pos();
            let mut name = Vec::new();
            loop {
                let byte = parser.read_le::<u8>()?;
                if byte == 0 {
                    break;
                }
                name.push(byte);
                if name.len() >= MAX_STREAM_NAME {
                    return Err(malformed_error!(
                        "Stream name at offset {} is not terminated",
                        name_start
                    ));
                }
            }
            parser.align(4)?;

            let end = u64::from(offset) + u64::from(size);
            if end > data.len() as u64 {
                return Err(malformed_error!(
                    "Stream {} ({:#x}+{:#x}) extends beyond the metadata",
                    String::from_utf8_lossy(&name),
                    offset,
                    size
                ));
            }

            stream_headers.push(StreamHeader {
                offset,
                size,
                name: String::from_utf8_lossy(&name).into_owned(),
            });
        }

        Ok(Root {
            major_version,
            minor_version,
            version,
            flags,
            stream_headers,
        })
    }

    /// Find a stream by name.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamHeader> {
        self.stream_headers.iter().find(|header| header.name == name)
    }

    /// Lay out a complete metadata block: the root for `version` followed by `streams`,
    /// each padded to 4 bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the version string or a stream name is too
    /// long, or the metadata exceeds 4 GiB.
    pub fn write(version: &str, streams: &[(&str, &[u8])]) -> Result<Vec<u8>> {
        let version_length = align_up(version.len() + 1, 4);
        if version_length > 255 {
            return Err(malformed_error!("Runtime version '{}' is too long", version));
        }

        let mut header_size = 16 + version_length + 4;
        for (name, _) in streams {
            if name.len() + 1 > MAX_STREAM_NAME {
                return Err(malformed_error!("Stream name '{}' is too long", name));
            }
            header_size += 8 + align_up(name.len() + 1, 4);
        }

        let mut buffer = Vec::new();
        push_le(&mut buffer, CIL_HEADER_MAGIC);
        push_le(&mut buffer, 1u16);
        push_le(&mut buffer, 1u16);
        push_le(&mut buffer, 0u32);
        push_le(&mut buffer, to_u32(version_length)?);
        buffer.extend_from_slice(version.as_bytes());
        buffer.resize(16 + version_length, 0);
        push_le(&mut buffer, 0u16);
        let Ok(stream_count) = u16::try_from(streams.len()) else {
            return Err(malformed_error!("Too many streams - {}", streams.len()));
        };
        push_le(&mut buffer, stream_count);

        let mut offset = header_size;
        for (name, data) in streams {
            let size = align_up(data.len(), 4);
            push_le(&mut buffer, to_u32(offset)?);
            push_le(&mut buffer, to_u32(size)?);
            buffer.extend_from_slice(name.as_bytes());
            buffer.push(0);
            buffer.resize(align_up(buffer.len(), 4), 0);
            offset += size;
        }

        for (_, data) in streams {
            buffer.extend_from_slice(data);
            buffer.resize(align_up(buffer.len(), 4), 0);
        }

        Ok(buffer)
    }
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Metadata of {} bytes is too large", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn write_then_read() {
        let strings = b"\0Game\0".to_vec();
        let blob = vec![0u8, 3, 0x20, 0x00, 0x01];
        let data = Root::write(
            DEFAULT_RUNTIME_VERSION,
            &[("#~", &[0u8; 24]), ("#Strings", &strings), ("#Blob", &blob)],
        )
        .unwrap();

        let root = Root::read(&data).unwrap();
        assert_eq!(root.version, "v4.0.30319");
        assert_eq!(root.stream_headers.len(), 3);

        let header = root.stream("#Strings").unwrap();
        assert_eq!(header.size, 8);
        let start = header.offset as usize;
        assert_eq!(&data[start..start + strings.len()], strings.as_slice());

        let header = root.stream("#Blob").unwrap();
        assert_eq!(header.offset % 4, 0);
        assert_eq!(&data[header.offset as usize..][..5], blob.as_slice());
        assert!(root.stream("#US").is_none());
    }

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let data = [
            0x42, 0x53, 0x4A, 0x42, // BSJB
            0x01, 0x00, 0x01, 0x00, // version 1.1
            0x00, 0x00, 0x00, 0x00, // reserved
            0x04, 0x00, 0x00, 0x00, // version length
            b'v', b'2', 0x00, 0x00,
            0x00, 0x00, // flags
            0x01, 0x00, // one stream
            0x20, 0x00, 0x00, 0x00, // offset
            0x04, 0x00, 0x00, 0x00, // size
            b'#', b'U', b'S', 0x00,
            0x00, 0x00, 0x00, 0x00,
        ];

        let root = Root::read(&data).unwrap();
        assert_eq!(root.version, "v2");
        assert_eq!(
            root.stream_headers,
            vec![StreamHeader { offset: 0x20, size: 4, name: "#US".to_string() }]
        );
    }

    #[test]
    fn invalid() {
        assert!(matches!(
            Root::read(&[0x42, 0x53, 0x4A, 0x43, 0, 0, 0, 0]),
            Err(Error::Malformed { .. })
        ));

        let mut data = Root::write("v4.0.30319", &[("#US", &[0u8; 4])]).unwrap();
        // Stream size beyond the metadata
        let size_offset = 16 + 12 + 4 + 4;
        data[size_offset] = 0x40;
        assert!(matches!(Root::read(&data), Err(Error::Malformed { .. })));
    }
}
