//! PE container layout.
//!
//! [`PeLayout`] is an owned summary of the PE headers of a managed module: where the COFF
//! and optional headers live, the section table, the file and section alignment, and the
//! two data directories the metadata writer has to touch (CLI header and certificate
//! table). It is extracted once from goblin's parse so that nothing borrows the input
//! buffer afterwards.
//!
//! The writer uses the recorded header offsets to patch fields in place
//! ([`PeLayout::size_of_image_offset`], [`PeLayout::data_directory_offset`], ...), and
//! [`pe_checksum`] to refresh the image checksum.
//!
//! # References
//! - Microsoft PE/COFF Specification
//! - ECMA-335 6th Edition, Partition II, Section 25 - File format extensions to PE

use goblin::pe::{section_table::SectionTable, PE};

use crate::{Error::GoblinErr, Result};

/// Size of the `PE\0\0` signature
pub const SIZEOF_PE_MAGIC: usize = 4;
/// Size of the COFF file header
pub const SIZEOF_COFF_HEADER: usize = 20;
/// Size of one section table entry
pub const SIZEOF_SECTION_HEADER: usize = 40;
/// Size of one data directory entry
pub const SIZEOF_DATA_DIRECTORY: usize = 8;
/// Optional header magic of PE32 images
pub const MAGIC_PE32: u16 = 0x010B;
/// Optional header magic of PE32+ images
pub const MAGIC_PE32_PLUS: u16 = 0x020B;

/// Index of the certificate table data directory
pub const DIRECTORY_CERTIFICATE: usize = 4;
/// Index of the CLI header data directory
pub const DIRECTORY_CLR: usize = 14;
/// Number of data directories in images written from scratch
pub const DATA_DIRECTORY_COUNT: usize = 16;

/// An RVA and size pair from the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Directory {
    /// RVA of the data (a file offset for the certificate table)
    pub virtual_address: u32,
    /// Size of the data in bytes
    pub size: u32,
}

/// Header layout of a parsed PE image.
#[derive(Debug, Clone)]
pub struct PeLayout {
    /// PE32+ (64-bit optional header) instead of PE32
    pub is_pe32_plus: bool,
    /// File offset of the COFF header
    pub coff_offset: usize,
    /// File offset of the optional header
    pub optional_header_offset: usize,
    /// File offset of the first section table entry
    pub section_table_offset: usize,
    /// COFF characteristics
    pub characteristics: u16,
    /// Alignment of section data in the file
    pub file_alignment: u32,
    /// Alignment of sections in memory
    pub section_alignment: u32,
    /// Size of all headers, rounded to the file alignment
    pub size_of_headers: u32,
    /// Checksum stored in the optional header
    pub check_sum: u32,
    /// Number of data directory entries
    pub data_directory_count: usize,
    /// The section table
    pub sections: Vec<SectionTable>,
    /// The CLI header directory
    pub clr: Directory,
    /// The certificate table (Authenticode signatures), if present
    pub certificate: Option<Directory>,
}

impl PeLayout {
    /// Parse the PE headers of `data` and make sure it carries a CLI header.
    ///
    /// # Errors
    /// Returns [`crate::Error::GoblinErr`] if goblin rejects the PE structure and
    /// [`crate::Error::Malformed`] if the optional header or the CLI header directory is
    /// missing.
    pub fn parse(data: &[u8]) -> Result<PeLayout> {
        let pe = PE::parse(data).map_err(GoblinErr)?;
        let Some(optional_header) = pe.header.optional_header else {
            return Err(malformed_error!("File does not have an OptionalHeader"));
        };

        let directories = &optional_header.data_directories;
        let Some(clr) = directories.get_clr_runtime_header() else {
            return Err(malformed_error!(
                "File does not have a CLR runtime header directory"
            ));
        };
        let clr = Directory {
            virtual_address: clr.virtual_address,
            size: clr.size,
        };
        let certificate = directories
            .get_certificate_table()
            .map(|certificate| Directory {
                virtual_address: certificate.virtual_address,
                size: certificate.size,
            });

        let coff_offset = pe.header.dos_header.pe_pointer as usize + SIZEOF_PE_MAGIC;
        let optional_header_offset = coff_offset + SIZEOF_COFF_HEADER;
        let section_table_offset = optional_header_offset
            + usize::from(pe.header.coff_header.size_of_optional_header);

        let is_pe32_plus = optional_header.standard_fields.magic == MAGIC_PE32_PLUS;
        let directory_start = if is_pe32_plus { 112 } else { 96 };
        let data_directory_count = (usize::from(pe.header.coff_header.size_of_optional_header)
            .saturating_sub(directory_start))
            / SIZEOF_DATA_DIRECTORY;

        Ok(PeLayout {
            is_pe32_plus,
            coff_offset,
            optional_header_offset,
            section_table_offset,
            characteristics: pe.header.coff_header.characteristics,
            file_alignment: optional_header.windows_fields.file_alignment,
            section_alignment: optional_header.windows_fields.section_alignment,
            size_of_headers: optional_header.windows_fields.size_of_headers,
            check_sum: optional_header.windows_fields.check_sum,
            data_directory_count,
            sections: pe.sections,
            clr,
            certificate,
        })
    }

    /// Convert an RVA to a file offset through the section table.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no section maps `rva`.
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        for section in &self.sections {
            let mapped = section.virtual_size.max(section.size_of_raw_data);
            let Some(section_max) = section.virtual_address.checked_add(mapped) else {
                return Err(malformed_error!(
                    "Section malformed, causing integer overflow - {} + {}",
                    section.virtual_address,
                    mapped
                ));
            };

            if section.virtual_address <= rva && rva < section_max {
                return Ok((rva - section.virtual_address) as usize
                    + section.pointer_to_raw_data as usize);
            }
        }

        Err(malformed_error!(
            "RVA could not be converted to offset - {:#x}",
            rva
        ))
    }

    /// First RVA past every section, aligned to the section alignment.
    #[must_use]
    pub fn next_section_rva(&self) -> u32 {
        let end = self
            .sections
            .iter()
            .map(|section| {
                section
                    .virtual_address
                    .saturating_add(section.virtual_size.max(section.size_of_raw_data))
            })
            .max()
            .unwrap_or(self.size_of_headers);
        align_up_u32(end, self.section_alignment)
    }

    /// File offset where the section table ends.
    #[must_use]
    pub fn section_table_end(&self) -> usize {
        self.section_table_offset + SIZEOF_SECTION_HEADER * self.sections.len()
    }

    /// Lowest file offset of any section's raw data, bounded by the header size.
    #[must_use]
    pub fn first_section_data(&self) -> usize {
        self.sections
            .iter()
            .filter(|section| section.size_of_raw_data > 0)
            .map(|section| section.pointer_to_raw_data as usize)
            .min()
            .unwrap_or(usize::MAX)
            .min(self.size_of_headers as usize)
    }

    /// File offset of the `NumberOfSections` field.
    #[must_use]
    pub fn number_of_sections_offset(&self) -> usize {
        self.coff_offset + 2
    }

    /// File offset of the `SizeOfInitializedData` field.
    #[must_use]
    pub fn size_of_initialized_data_offset(&self) -> usize {
        self.optional_header_offset + 8
    }

    /// File offset of the `SizeOfImage` field.
    #[must_use]
    pub fn size_of_image_offset(&self) -> usize {
        self.optional_header_offset + 56
    }

    /// File offset of the `CheckSum` field.
    #[must_use]
    pub fn check_sum_offset(&self) -> usize {
        self.optional_header_offset + 64
    }

    /// File offset of data directory entry `index`.
    #[must_use]
    pub fn data_directory_offset(&self, index: usize) -> usize {
        let start = if self.is_pe32_plus { 112 } else { 96 };
        self.optional_header_offset + start + index * SIZEOF_DATA_DIRECTORY
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two, or 0 for none).
#[must_use]
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// [`align_up`] for 32-bit header fields.
#[must_use]
pub fn align_up_u32(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment).saturating_mul(alignment)
}

/// Compute the PE image checksum, skipping the checksum field at `check_sum_offset`.
///
/// 16-bit words are summed with end-around carry and the file length is added, as the
/// Windows image loader expects.
#[must_use]
pub fn pe_checksum(data: &[u8], check_sum_offset: usize) -> u32 {
    let mut sum: u64 = 0;
    for (index, word) in data.chunks(2).enumerate() {
        let offset = index * 2;
        if offset == check_sum_offset || offset == check_sum_offset + 2 {
            continue;
        }
        let low = u64::from(word[0]);
        let high = u64::from(word.get(1).copied().unwrap_or(0));
        sum += high << 8 | low;
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum = (sum & 0xFFFF) + (sum >> 16);

    // The folded sum fits 16 bits and images are bounded by the 32-bit size fields
    #[allow(clippy::cast_possible_truncation)]
    let (sum, length) = (sum as u32, data.len() as u32);
    sum.wrapping_add(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 0x200), 0);
        assert_eq!(align_up(1, 0x200), 0x200);
        assert_eq!(align_up(0x200, 0x200), 0x200);
        assert_eq!(align_up(0x201, 4), 0x204);
        assert_eq!(align_up(7, 0), 7);
        assert_eq!(align_up_u32(0x2001, 0x2000), 0x4000);
    }

    #[test]
    fn checksum_skips_its_own_field() {
        let mut data = vec![0u8; 16];
        data[0] = 0x01;
        data[2] = 0x02;
        data[8..12].copy_from_slice(&[0xFF; 4]);

        // 0x0001 + 0x0002 + length 16
        assert_eq!(pe_checksum(&data, 8), 0x13);

        data[8..12].copy_from_slice(&[0; 4]);
        assert_eq!(pe_checksum(&data, 8), 0x13);
    }

    #[test]
    fn checksum_folds_carries_and_odd_lengths() {
        let data = [0xFF, 0xFF, 0x02, 0x00, 0x01];
        // 0xFFFF + 0x0002 folds to 0x0002, plus the trailing 0x0001 and length 5
        assert_eq!(pe_checksum(&data, 0x100), 0x08);
    }

    #[test]
    fn rejects_non_pe() {
        assert!(PeLayout::parse(b"\x7fELF\x02\x01").is_err());
        assert!(matches!(
            PeLayout::parse(b"MZ\x90\x00\x03\x00"),
            Err(crate::Error::GoblinErr(_))
        ));
    }
}
