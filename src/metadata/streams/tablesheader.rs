//! The `#~` stream: header, row counts and raw table rows.
//!
//! Rows are kept as plain column values (`u32` each, heap offsets and row ids unresolved),
//! so an image can be read, extended with new rows and written back with freshly computed
//! column widths without interpreting tables this crate does not model.

use strum::EnumCount;

use crate::{
    file::{io::push_le, parser::Parser},
    metadata::streams::schema::{all_tables, heap_sizes, table_for_bit, TableId, TableInfo},
    Result,
};

/// The rows of one table as raw column values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    table: TableId,
    values: Vec<u32>,
}

impl RawTable {
    /// An empty table.
    #[must_use]
    pub fn new(table: TableId) -> Self {
        RawTable {
            table,
            values: Vec::new(),
        }
    }

    /// Number of columns per row.
    #[must_use]
    pub fn width(&self) -> usize {
        self.table.columns().len()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len() / self.width()
    }

    /// Returns `true` if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Columns of the zero-based row `index`.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[u32]> {
        let width = self.width();
        self.values.get(index * width..(index + 1) * width)
    }

    /// Mutable columns of the zero-based row `index`.
    pub fn row_mut(&mut self, index: usize) -> Option<&mut [u32]> {
        let width = self.width();
        self.values.get_mut(index * width..(index + 1) * width)
    }

    /// Append a row.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `row` does not have one value per column.
    pub fn push(&mut self, row: &[u32]) -> Result<()> {
        if row.len() != self.width() {
            return Err(malformed_error!(
                "{:?} row with {} columns, expected {}",
                self.table,
                row.len(),
                self.width()
            ));
        }
        self.values.extend_from_slice(row);
        Ok(())
    }
}

/// A decoded `#~` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablesStream {
    /// Major schema version, 2
    pub major_version: u8,
    /// Minor schema version, 0
    pub minor_version: u8,
    /// Bit vector of sorted tables
    pub sorted: u64,
    tables: Vec<RawTable>,
}

impl Default for TablesStream {
    fn default() -> Self {
        TablesStream {
            major_version: 2,
            minor_version: 0,
            sorted: 0,
            tables: all_tables().map(RawTable::new).collect(),
        }
    }
}

impl TablesStream {
    /// Parse a `#~` stream.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] for tables without a known layout and
    /// [`crate::Error::Malformed`] if no table is present or the rows extend beyond `data`.
    pub fn read(data: &[u8]) -> Result<TablesStream> {
        let mut parser = Parser::new(data);
        parser.read_le::<u32>()?;
        let major_version = parser.read_le::<u8>()?;
        let minor_version = parser.read_le::<u8>()?;
        let heap_size_flags = parser.read_le::<u8>()?;
        parser.read_le::<u8>()?;
        let valid = parser.read_le::<u64>()?;
        let sorted = parser.read_le::<u64>()?;

        if valid == 0 {
            return Err(malformed_error!("No valid rows in any of the tables"));
        }

        let mut rows = [0u32; TableId::COUNT];
        for bit in 0..u64::BITS {
            if valid & (1 << bit) == 0 {
                continue;
            }
            let table = table_for_bit(bit)?;
            rows[table as usize] = parser.read_le::<u32>()?;
        }
        if heap_size_flags & heap_sizes::EXTRA_DATA != 0 {
            parser.read_le::<u32>()?;
        }

        let info = TableInfo::new(rows, heap_size_flags);
        let mut tables = Vec::with_capacity(TableId::COUNT);
        for table in all_tables() {
            let count = info.rows(table) as usize;
            let Some(size) = count.checked_mul(info.row_size(table)) else {
                return Err(malformed_error!("{:?} table is too large", table));
            };
            if size > parser.remaining() {
                return Err(malformed_error!(
                    "{:?} table of {} rows extends beyond the #~ stream",
                    table,
                    count
                ));
            }

            let mut raw = RawTable::new(table);
            raw.values.reserve(count * table.columns().len());
            for _ in 0..count {
                for column in table.columns() {
                    let value = if info.column_size(*column) == 4 {
                        parser.read_le::<u32>()?
                    } else {
                        u32::from(parser.read_le::<u16>()?)
                    };
                    raw.values.push(value);
                }
            }
            tables.push(raw);
        }

        Ok(TablesStream {
            major_version,
            minor_version,
            sorted,
            tables,
        })
    }

    /// The rows of `table`.
    #[must_use]
    pub fn table(&self, table: TableId) -> &RawTable {
        &self.tables[table as usize]
    }

    /// Mutable rows of `table`.
    pub fn table_mut(&mut self, table: TableId) -> &mut RawTable {
        &mut self.tables[table as usize]
    }

    /// Row count of every table, indexed by table id.
    #[must_use]
    pub fn row_counts(&self) -> [u32; TableId::COUNT] {
        let mut rows = [0u32; TableId::COUNT];
        for (count, table) in rows.iter_mut().zip(&self.tables) {
            // Bounded by the 24-bit row ids tokens can carry
            #[allow(clippy::cast_possible_truncation)]
            let len = table.len() as u32;
            *count = len;
        }
        rows
    }

    /// Encode the stream. Column widths are derived from the current row counts and
    /// `heap_size_flags`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a table exceeds the token range or a value
    /// does not fit its column.
    pub fn write(&self, heap_size_flags: u8) -> Result<Vec<u8>> {
        let rows = self.row_counts();
        let heap_size_flags = heap_size_flags & !heap_sizes::EXTRA_DATA;
        let info = TableInfo::new(rows, heap_size_flags);

        let mut valid = 0u64;
        for table in all_tables() {
            let count = info.rows(table);
            if count > 0x00FF_FFFF {
                return Err(malformed_error!(
                    "{:?} table with {} rows exceeds the token range",
                    table,
                    count
                ));
            }
            if count > 0 {
                valid |= 1 << (table as u8);
            }
        }

        let mut buffer = Vec::new();
        push_le(&mut buffer, 0u32);
        push_le(&mut buffer, self.major_version);
        push_le(&mut buffer, self.minor_version);
        push_le(&mut buffer, heap_size_flags);
        push_le(&mut buffer, 1u8);
        push_le(&mut buffer, valid);
        push_le(&mut buffer, self.sorted);
        for count in rows.iter().filter(|count| **count > 0) {
            push_le(&mut buffer, *count);
        }

        for raw in &self.tables {
            let columns = raw.table.columns();
            for row in raw.values.chunks_exact(columns.len()) {
                for (column, value) in columns.iter().zip(row) {
                    if info.column_size(*column) == 4 {
                        push_le(&mut buffer, *value);
                    } else {
                        let Ok(value) = u16::try_from(*value) else {
                            return Err(malformed_error!(
                                "Value {:#x} does not fit a {:?} column of {:?}",
                                value,
                                column,
                                raw.table
                            ));
                        };
                        push_le(&mut buffer, value);
                    }
                }
            }
        }

        buffer.resize(buffer.len().div_ceil(4) * 4, 0);
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn sample() -> TablesStream {
        let mut stream = TablesStream::default();
        stream
            .table_mut(TableId::Module)
            .push(&[0, 1, 1, 0, 0])
            .unwrap();
        stream
            .table_mut(TableId::AssemblyRef)
            .push(&[4, 0, 0, 0, 0, 0, 10, 0, 0])
            .unwrap();
        stream
            .table_mut(TableId::TypeRef)
            .push(&[0x06, 20, 30])
            .unwrap();
        stream
    }

    #[test]
    fn write_then_read() {
        let stream = sample();
        let data = stream.write(0).unwrap();

        // header, three row counts, Module 10 bytes, TypeRef 6 bytes, AssemblyRef 20 bytes
        assert_eq!(data.len(), (24 + 12 + 10 + 6 + 20usize).div_ceil(4) * 4);
        assert_eq!(data[8], 0x03);
        assert_eq!(data[12], 0x08);

        let read = TablesStream::read(&data).unwrap();
        assert_eq!(read, stream);
        assert_eq!(read.table(TableId::TypeRef).row(0), Some(&[0x06, 20, 30][..]));
        assert_eq!(read.table(TableId::TypeDef).len(), 0);
    }

    #[test]
    fn widths_follow_heap_flags() {
        let stream = sample();
        let narrow = stream.write(0).unwrap();
        let wide = stream.write(heap_sizes::LARGE_STRINGS).unwrap();
        assert!(wide.len() > narrow.len());
        assert_eq!(TablesStream::read(&wide).unwrap(), stream);
    }

    #[test]
    fn values_must_fit() {
        let mut stream = sample();
        stream.table_mut(TableId::TypeRef).row_mut(0).unwrap()[1] = 0x1_0000;
        assert!(matches!(stream.write(0), Err(Error::Malformed { .. })));
        assert!(stream.write(heap_sizes::LARGE_STRINGS).is_ok());
    }

    #[test]
    fn rejects_unknown_tables_and_truncation() {
        let mut data = sample().write(0).unwrap();
        data[14] |= 0x01;
        assert!(matches!(TablesStream::read(&data), Err(Error::NotSupported)));

        let data = sample().write(0).unwrap();
        assert!(TablesStream::read(&data[..40]).is_err());

        let mut stream = sample();
        assert!(stream.table_mut(TableId::TypeRef).push(&[1, 2]).is_err());
    }
}
