//! The CLI header.
//!
//! Every managed PE image points its CLR data directory at this 72-byte header, which in
//! turn locates the metadata root, the strong name signature and the entry point.
//!
//! # Reference
//! - ECMA-335 6th Edition, Partition II, Section 25.3.3 - CLI header

use crate::{
    file::{io::push_le, parser::Parser},
    Error::OutOfBounds,
    Result,
};

/// Size of the CLI header in bytes
pub const COR20_HEADER_SIZE: usize = 72;
/// Offset of the metadata directory inside the header
pub const METADATA_DIRECTORY_OFFSET: usize = 8;

/// `COMIMAGE_FLAGS_ILONLY`
pub const FLAG_IL_ONLY: u32 = 0x0000_0001;
/// `COMIMAGE_FLAGS_STRONGNAMESIGNED`
pub const FLAG_STRONG_NAME_SIGNED: u32 = 0x0000_0008;

/// The CLI header of a managed image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cor20Header {
    /// Size of header in bytes
    pub cb: u32,
    /// The minimum version of runtime required to run this program
    pub major_runtime_version: u16,
    /// The minor portion of the version
    pub minor_runtime_version: u16,
    /// RVA of the metadata root
    pub meta_data_rva: u32,
    /// Size of the metadata
    pub meta_data_size: u32,
    /// Flags describing this runtime image
    pub flags: u32,
    /// Token of the entry point `MethodDef` or `File`
    pub entry_point_token: u32,
    /// RVA of implementation specific resources
    pub resource_rva: u32,
    /// Size of implementation specific resources
    pub resource_size: u32,
    /// RVA of the strong name signature
    pub strong_name_signature_rva: u32,
    /// Size of the strong name signature
    pub strong_name_signature_size: u32,
    /// Always 0
    pub code_manager_table_rva: u32,
    /// Always 0
    pub code_manager_table_size: u32,
    /// RVA of the vtable fixups
    pub vtable_fixups_rva: u32,
    /// Size of the vtable fixups
    pub vtable_fixups_size: u32,
    /// Always 0
    pub export_address_table_jmp_rva: u32,
    /// Always 0
    pub export_address_table_jmp_size: u32,
    /// Always 0
    pub managed_native_header_rva: u32,
    /// Always 0
    pub managed_native_header_size: u32,
}

impl Cor20Header {
    /// A header for an IL-only image with metadata at `meta_data_rva`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn il_only(meta_data_rva: u32, meta_data_size: u32) -> Self {
        Cor20Header {
            cb: COR20_HEADER_SIZE as u32,
            major_runtime_version: 2,
            minor_runtime_version: 5,
            meta_data_rva,
            meta_data_size,
            flags: FLAG_IL_ONLY,
            ..Cor20Header::default()
        }
    }

    /// Read a CLI header from the start of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than the header and
    /// [`crate::Error::Malformed`] if the size field or the metadata directory is invalid.
    pub fn read(data: &[u8]) -> Result<Cor20Header> {
        if data.len() < COR20_HEADER_SIZE {
            return Err(OutOfBounds);
        }

        let mut parser = Parser::new(data);

        let cb = parser.read_le::<u32>()?;
        if cb as usize != COR20_HEADER_SIZE {
            return Err(malformed_error!(
                "Invalid CLR header size: expected 72, got {}",
                cb
            ));
        }

        let header = Cor20Header {
            cb,
            major_runtime_version: parser.read_le::<u16>()?,
            minor_runtime_version: parser.read_le::<u16>()?,
            meta_data_rva: parser.read_le::<u32>()?,
            meta_data_size: parser.read_le::<u32>()?,
            flags: parser.read_le::<u32>()?,
            entry_point_token: parser.read_le::<u32>()?,
            resource_rva: parser.read_le::<u32>()?,
            resource_size: parser.read_le::<u32>()?,
            strong_name_signature_rva: parser.read_le::<u32>()?,
            strong_name_signature_size: parser.read_le::<u32>()?,
            code_manager_table_rva: parser.read_le::<u32>()?,
            code_manager_table_size: parser.read_le::<u32>()?,
            vtable_fixups_rva: parser.read_le::<u32>()?,
            vtable_fixups_size: parser.read_le::<u32>()?,
            export_address_table_jmp_rva: parser.read_le::<u32>()?,
            export_address_table_jmp_size: parser.read_le::<u32>()?,
            managed_native_header_rva: parser.read_le::<u32>()?,
            managed_native_header_size: parser.read_le::<u32>()?,
        };

        if header.meta_data_rva == 0 || header.meta_data_size == 0 {
            return Err(malformed_error!("CLR header has no metadata directory"));
        }

        Ok(header)
    }

    /// Whether the image claims a strong name signature.
    #[must_use]
    pub fn is_strong_name_signed(&self) -> bool {
        self.flags & FLAG_STRONG_NAME_SIGNED != 0
    }

    /// Encode the header.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(COR20_HEADER_SIZE);
        push_le(&mut buffer, self.cb);
        push_le(&mut buffer, self.major_runtime_version);
        push_le(&mut buffer, self.minor_runtime_version);
        for value in [
            self.meta_data_rva,
            self.meta_data_size,
            self.flags,
            self.entry_point_token,
            self.resource_rva,
            self.resource_size,
            self.strong_name_signature_rva,
            self.strong_name_signature_size,
            self.code_manager_table_rva,
            self.code_manager_table_size,
            self.vtable_fixups_rva,
            self.vtable_fixups_size,
            self.export_address_table_jmp_rva,
            self.export_address_table_jmp_size,
            self.managed_native_header_rva,
            self.managed_native_header_size,
        ] {
            push_le(&mut buffer, value);
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let header_bytes = [
            0x48, 0x00, 0x00, 0x00, // cb
            0x02, 0x00, // major
            0x05, 0x00, // minor
            0x50, 0x20, 0x00, 0x00, // metadata rva
            0x00, 0x10, 0x00, 0x00, // metadata size
            0x09, 0x00, 0x00, 0x00, // flags
            0x01, 0x00, 0x00, 0x06, // entry point
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // resources
            0x00, 0x30, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, // strong name
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        let header = Cor20Header::read(&header_bytes).unwrap();
        assert_eq!(header.meta_data_rva, 0x2050);
        assert_eq!(header.meta_data_size, 0x1000);
        assert_eq!(header.entry_point_token, 0x0600_0001);
        assert_eq!(header.strong_name_signature_size, 0x80);
        assert!(header.is_strong_name_signed());
        assert_eq!(header.to_bytes(), header_bytes);
    }

    #[test]
    fn il_only_roundtrip() {
        let header = Cor20Header::il_only(0x2048, 0x200);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), COR20_HEADER_SIZE);
        assert_eq!(Cor20Header::read(&bytes).unwrap(), header);
        assert!(!header.is_strong_name_signed());
    }

    #[test]
    fn invalid() {
        assert!(matches!(Cor20Header::read(&[0x48; 10]), Err(Error::OutOfBounds)));

        let mut bytes = Cor20Header::il_only(0x2048, 0x200).to_bytes();
        bytes[0] = 0x40;
        assert!(matches!(Cor20Header::read(&bytes), Err(Error::Malformed { .. })));

        let bytes = Cor20Header::il_only(0, 0).to_bytes();
        assert!(matches!(Cor20Header::read(&bytes), Err(Error::Malformed { .. })));
    }
}
