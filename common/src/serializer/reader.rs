use crate::crypto::{Hash, HASH_SIZE};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Not enough bytes available")]
    InvalidSize,
    #[error("Invalid value encountered")]
    InvalidValue,
    #[error("Invalid hex string")]
    InvalidHex,
    #[error("Invalid UTF-8 string")]
    InvalidString,
}

/// Cursor over a byte slice with checked, typed reads.
/// Every read advances the cursor; running past the end is an error,
/// never a panic.
pub struct Reader<'a> {
    bytes: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, total: 0 }
    }

    pub fn read_bytes_ref(&mut self, n: usize) -> Result<&'a [u8], ReaderError> {
        if n > self.bytes.len() {
            return Err(ReaderError::InvalidSize);
        }
        let (bytes, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        self.total += n;
        Ok(bytes)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ReaderError> {
        Ok(self.read_bytes_ref(n)?.to_vec())
    }

    pub fn read_bytes_32(&mut self) -> Result<[u8; 32], ReaderError> {
        let bytes = self.read_bytes_ref(32)?;
        let mut array = [0u8; 32];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    pub fn read_bytes_64(&mut self) -> Result<[u8; 64], ReaderError> {
        let bytes = self.read_bytes_ref(64)?;
        let mut array = [0u8; 64];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        let bytes = self.read_bytes_ref(1)?;
        Ok(bytes[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ReaderError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        let bytes = self.read_bytes_ref(2)?;
        Ok(u16::from_be_bytes(
            bytes.try_into().map_err(|_| ReaderError::InvalidSize)?,
        ))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReaderError> {
        let bytes = self.read_bytes_ref(4)?;
        Ok(u32::from_be_bytes(
            bytes.try_into().map_err(|_| ReaderError::InvalidSize)?,
        ))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        let bytes = self.read_bytes_ref(8)?;
        Ok(u64::from_be_bytes(
            bytes.try_into().map_err(|_| ReaderError::InvalidSize)?,
        ))
    }

    pub fn read_hash(&mut self) -> Result<Hash, ReaderError> {
        let bytes = self.read_bytes_ref(HASH_SIZE)?;
        let mut array = [0u8; HASH_SIZE];
        array.copy_from_slice(bytes);
        Ok(Hash::new(array))
    }

    // Strings are length-prefixed with a u16
    pub fn read_string(&mut self) -> Result<String, ReaderError> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| ReaderError::InvalidString)
    }

    // Remaining bytes available
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn total_read(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_past_end() {
        let mut reader = Reader::new(&[1, 2, 3]);
        assert!(reader.read_u64().is_err());
        // A failed read must not consume anything
        assert_eq!(reader.size(), 3);
    }

    #[test]
    fn test_read_bool_rejects_garbage() {
        let mut reader = Reader::new(&[2]);
        assert!(matches!(reader.read_bool(), Err(ReaderError::InvalidValue)));
    }
}
