use super::Backend;
use crate::{Error::OutOfBounds, Result};

/// Input file backed by Memory
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Create a new memory backend
    ///
    /// ## Arguments
    /// * 'data' - The data buffer to consume
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(OutOfBounds);
        };

        if offset_end > self.data.len() {
            return Err(OutOfBounds);
        }

        Ok(&self.data[offset..offset_end])
    }

    fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_slices() {
        let memory = Memory::new(vec![0x17, 0x73, 0x01, 0x00, 0x00, 0x0A]);

        assert_eq!(memory.len(), 6);
        assert_eq!(memory.data_slice(1, 5).unwrap(), &[0x73, 0x01, 0x00, 0x00, 0x0A]);
        assert!(memory.data_slice(5, 2).is_err());
        assert!(matches!(memory.data_slice(usize::MAX, 1), Err(OutOfBounds)));
    }
}
