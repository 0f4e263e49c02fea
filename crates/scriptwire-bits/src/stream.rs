use crate::StreamError;

/// Growable bit buffer with separate read and write cursors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitStream {
    data: Vec<u8>,
    write_bits: usize,
    read_bits: usize,
}

impl BitStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap received bytes for reading. Every bit of `data` is readable.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let write_bits = data.len() * 8;
        Self {
            data,
            write_bits,
            read_bits: 0,
        }
    }

    /// The written bytes. A trailing partial byte is zero-padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of bits written so far.
    pub fn bits_written(&self) -> usize {
        self.write_bits
    }

    /// Number of bits left to read.
    pub fn bits_remaining(&self) -> usize {
        self.write_bits.saturating_sub(self.read_bits)
    }

    pub fn can_read_bytes(&self, count: usize) -> bool {
        count
            .checked_mul(8)
            .is_some_and(|bits| bits <= self.bits_remaining())
    }

    /// Rewind the read cursor to the start of the buffer.
    pub fn reset_read(&mut self) {
        self.read_bits = 0;
    }

    // ========================================================================
    // Writing
    // ========================================================================

    pub fn write_bit(&mut self, bit: bool) {
        let byte = self.write_bits / 8;
        if byte == self.data.len() {
            self.data.push(0);
        }
        if bit {
            self.data[byte] |= 0x80 >> (self.write_bits % 8);
        }
        self.write_bits += 1;
    }

    /// Write the low `count` bits of `value`, most significant first.
    pub fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64);
        for shift in (0..count).rev() {
            self.write_bit((value >> shift) & 1 == 1);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.write_bits % 8 == 0 {
            self.data.truncate(self.write_bits / 8);
            self.data.extend_from_slice(bytes);
            self.write_bits += bytes.len() * 8;
            return;
        }
        for &byte in bytes {
            self.write_bits(byte as u64, 8);
        }
    }

    /// Pad the write cursor with zero bits up to the next byte boundary.
    pub fn align_write(&mut self) {
        let pad = (8 - self.write_bits % 8) % 8;
        self.write_bits += pad;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(value as u64, 8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_bytes(&value.to_le_bytes());
    }

    // ========================================================================
    // Reading
    // ========================================================================

    fn ensure(&self, bits: usize) -> Result<(), StreamError> {
        let have = self.bits_remaining();
        if bits > have {
            return Err(StreamError::Exhausted { need: bits, have });
        }
        Ok(())
    }

    pub fn read_bit(&mut self) -> Result<bool, StreamError> {
        self.ensure(1)?;
        let byte = self.data[self.read_bits / 8];
        let bit = byte & (0x80 >> (self.read_bits % 8)) != 0;
        self.read_bits += 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, count: u32) -> Result<u64, StreamError> {
        if count > 64 {
            return Err(StreamError::TooManyBits(count));
        }
        self.ensure(count as usize)?;
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, StreamError> {
        let bits = count.checked_mul(8).ok_or(StreamError::Exhausted {
            need: usize::MAX,
            have: self.bits_remaining(),
        })?;
        self.ensure(bits)?;
        if self.read_bits % 8 == 0 {
            let start = self.read_bits / 8;
            self.read_bits += bits;
            return Ok(self.data[start..start + count].to_vec());
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_bits(8)? as u8);
        }
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], StreamError> {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.read_bytes(N)?);
        Ok(out)
    }

    /// Skip the read cursor forward to the next byte boundary.
    pub fn align_read(&mut self) {
        let pad = (8 - self.read_bits % 8) % 8;
        self.read_bits = (self.read_bits + pad).min(self.write_bits);
    }

    pub fn read_u8(&mut self) -> Result<u8, StreamError> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16, StreamError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, StreamError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, StreamError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, StreamError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, StreamError> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_pack_msb_first() {
        let mut stream = BitStream::new();
        stream.write_bit(true);
        stream.write_bit(false);
        stream.write_bit(true);
        assert_eq!(stream.as_bytes(), &[0b1010_0000]);
        assert_eq!(stream.bits_written(), 3);
    }

    #[test]
    fn unaligned_bytes_read_back() {
        let mut stream = BitStream::new();
        stream.write_bit(true);
        stream.write_bytes(b"abc");
        stream.write_u32(0xDEADBEEF);

        assert!(stream.read_bit().unwrap());
        assert_eq!(stream.read_bytes(3).unwrap(), b"abc");
        assert_eq!(stream.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(stream.bits_remaining(), 0);
    }

    #[test]
    fn align_pads_both_cursors() {
        let mut stream = BitStream::new();
        stream.write_bits(0b101, 3);
        stream.align_write();
        stream.write_u8(0x7F);
        assert_eq!(stream.as_bytes(), &[0b1010_0000, 0x7F]);

        assert_eq!(stream.read_bits(3).unwrap(), 0b101);
        stream.align_read();
        assert_eq!(stream.read_u8().unwrap(), 0x7F);
    }

    #[test]
    fn exhausted_stream_reports_shortfall() {
        let mut stream = BitStream::from_bytes(vec![0xFF]);
        let err = stream.read_u16().unwrap_err();
        assert_eq!(err, StreamError::Exhausted { need: 16, have: 8 });
    }

    #[test]
    fn floats_survive_unaligned() {
        let mut stream = BitStream::new();
        stream.write_bits(0b11, 2);
        stream.write_f32(1.5);
        stream.write_f64(-0.1);
        stream.read_bits(2).unwrap();
        assert_eq!(stream.read_f32().unwrap(), 1.5);
        assert_eq!(stream.read_f64().unwrap(), -0.1);
    }
}
