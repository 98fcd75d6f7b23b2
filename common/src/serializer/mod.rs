mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

/// Deterministic wire codec used for everything that crosses the network
/// or lands in the database. Byte order is fixed (big endian) so two nodes
/// on different architectures produce identical encodings.
pub trait Serializer {
    fn write(&self, writer: &mut Writer);

    fn read(reader: &mut Reader) -> Result<Self, ReaderError>
    where
        Self: Sized;

    // Exact encoded size in bytes, used for block size accounting
    fn size(&self) -> usize {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.total_write()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.bytes()
    }

    fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError>
    where
        Self: Sized,
    {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        // Trailing garbage means the encoding was not canonical
        if reader.total_read() != bytes.len() {
            return Err(ReaderError::InvalidSize);
        }
        Ok(value)
    }

    fn from_hex(hex: &str) -> Result<Self, ReaderError>
    where
        Self: Sized,
    {
        let bytes = hex::decode(hex).map_err(|_| ReaderError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }
}

impl Serializer for u8 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u8()
    }

    fn size(&self) -> usize {
        1
    }
}

impl Serializer for u16 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u16(self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u16()
    }

    fn size(&self) -> usize {
        2
    }
}

impl Serializer for u32 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u32()
    }

    fn size(&self) -> usize {
        4
    }
}

impl Serializer for u64 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u64()
    }

    fn size(&self) -> usize {
        8
    }
}

impl Serializer for bool {
    fn write(&self, writer: &mut Writer) {
        writer.write_bool(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_bool()
    }

    fn size(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_roundtrip() {
        let mut writer = Writer::new();
        writer.write_u8(7);
        writer.write_u16(&513);
        writer.write_u32(&70_000);
        writer.write_u64(&u64::MAX);
        writer.write_bool(true);

        let bytes = writer.bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u16().unwrap(), 513);
        assert_eq!(reader.read_u32().unwrap(), 70_000);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.size(), 0);
    }

    #[test]
    fn test_from_bytes_rejects_trailing_data() {
        let mut bytes = 42u64.to_bytes();
        bytes.push(0);
        assert!(matches!(
            u64::from_bytes(&bytes),
            Err(ReaderError::InvalidSize)
        ));
    }

    #[test]
    fn test_big_endian_encoding() {
        let bytes = 1u64.to_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
