//! Bit-oriented wire stream.
//!
//! A single growable buffer with an independent write cursor and read cursor,
//! measured in bits. Bits are packed most-significant first within each byte,
//! and multi-byte primitives are written little-endian.
//!
//! # Compressed integers
//!
//! Unsigned integers are written from the most significant byte down. Each
//! leading zero byte costs a single `1` bit. The first non-zero byte is
//! announced with a `0` bit and is followed by every remaining byte verbatim.
//! The lowest byte is special-cased: when its upper nibble is empty only the
//! low four bits are written.
//!
//! Signed integers are zigzag-mapped first, so small negative numbers stay
//! small on the wire.

mod compressed;
mod stream;

pub use stream::BitStream;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Stream exhausted: need {need} bits, have {have}")]
    Exhausted { need: usize, have: usize },

    #[error("Bit count {0} exceeds 64")]
    TooManyBits(u32),
}
