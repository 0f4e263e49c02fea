use crate::{BitStream, StreamError};

impl BitStream {
    fn write_compressed_bytes(&mut self, bytes: &[u8]) {
        // `bytes` is little-endian; walk from the most significant end.
        let mut top = bytes.len() - 1;
        while top > 0 {
            if bytes[top] != 0 {
                self.write_bit(false);
                for &byte in bytes[..=top].iter().rev() {
                    self.write_u8(byte);
                }
                return;
            }
            self.write_bit(true);
            top -= 1;
        }
        let low = bytes[0];
        if low & 0xF0 == 0 {
            self.write_bit(true);
            self.write_bits(low as u64, 4);
        } else {
            self.write_bit(false);
            self.write_u8(low);
        }
    }

    fn read_compressed_bytes(&mut self, out: &mut [u8]) -> Result<(), StreamError> {
        let mut top = out.len() - 1;
        while top > 0 {
            if !self.read_bit()? {
                for slot in out[..=top].iter_mut().rev() {
                    *slot = self.read_u8()?;
                }
                return Ok(());
            }
            out[top] = 0;
            top -= 1;
        }
        out[0] = if self.read_bit()? {
            self.read_bits(4)? as u8
        } else {
            self.read_u8()?
        };
        Ok(())
    }

    pub fn write_compressed_u16(&mut self, value: u16) {
        self.write_compressed_bytes(&value.to_le_bytes());
    }

    pub fn write_compressed_u32(&mut self, value: u32) {
        self.write_compressed_bytes(&value.to_le_bytes());
    }

    pub fn write_compressed_u64(&mut self, value: u64) {
        self.write_compressed_bytes(&value.to_le_bytes());
    }

    pub fn write_compressed_i32(&mut self, value: i32) {
        self.write_compressed_u32(((value << 1) ^ (value >> 31)) as u32);
    }

    pub fn read_compressed_u16(&mut self) -> Result<u16, StreamError> {
        let mut bytes = [0u8; 2];
        self.read_compressed_bytes(&mut bytes)?;
        Ok(u16::from_le_bytes(bytes))
    }

    pub fn read_compressed_u32(&mut self) -> Result<u32, StreamError> {
        let mut bytes = [0u8; 4];
        self.read_compressed_bytes(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_compressed_u64(&mut self) -> Result<u64, StreamError> {
        let mut bytes = [0u8; 8];
        self.read_compressed_bytes(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_compressed_i32(&mut self) -> Result<i32, StreamError> {
        let raw = self.read_compressed_u32()?;
        Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_take_few_bits() {
        let mut stream = BitStream::new();
        stream.write_compressed_u32(5);
        // three leading zero bytes, then a short low byte
        assert_eq!(stream.bits_written(), 3 + 1 + 4);

        let mut stream = BitStream::new();
        stream.write_compressed_u16(0x00F0);
        assert_eq!(stream.bits_written(), 1 + 1 + 8);
    }

    #[test]
    fn unsigned_boundaries() {
        let values = [0u32, 1, 15, 16, 255, 256, 65_535, 65_536, 0x00FF_FFFF, u32::MAX];
        let mut stream = BitStream::new();
        for value in values {
            stream.write_compressed_u32(value);
        }
        for value in values {
            assert_eq!(stream.read_compressed_u32().unwrap(), value);
        }
    }

    #[test]
    fn signed_values_zigzag() {
        let values = [0i32, -1, 1, -64, 63, i32::MIN, i32::MAX];
        let mut stream = BitStream::new();
        for value in values {
            stream.write_compressed_i32(value);
        }
        for value in values {
            assert_eq!(stream.read_compressed_i32().unwrap(), value);
        }

        let mut stream = BitStream::new();
        stream.write_compressed_i32(-1);
        assert_eq!(stream.bits_written(), 3 + 1 + 4);
    }

    #[test]
    fn wide_values() {
        let mut stream = BitStream::new();
        stream.write_compressed_u64(u64::MAX - 7);
        stream.write_compressed_u16(u16::MAX);
        assert_eq!(stream.read_compressed_u64().unwrap(), u64::MAX - 7);
        assert_eq!(stream.read_compressed_u16().unwrap(), u16::MAX);
    }
}
