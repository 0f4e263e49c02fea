//! Codec configuration.

use serde::{Deserialize, Serialize};

/// Size and depth bounds shared by the codecs and the sandbox bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Longest string written with a 16-bit length on the binary wire.
    /// Longer strings take the long-string path.
    pub max_short_string: usize,
    /// Longest string the binary decoder accepts on the long-string path.
    pub max_long_string: usize,
    /// Longest string the text codec accepts in either direction.
    pub max_text_string: usize,
    /// Largest element count accepted for one list or table body.
    pub max_sequence_len: usize,
    /// Deepest table nesting accepted before a value is rejected.
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_short_string: u16::MAX as usize,
            max_long_string: 16 * 1024 * 1024,
            max_text_string: u16::MAX as usize,
            max_sequence_len: 1_000_000,
            max_depth: 128,
        }
    }
}

/// Options for the text codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextOptions {
    /// Persisted form: entities are embedded as `^E^<id>` sentinels.
    /// Without it only resource sentinels are accepted.
    pub serialize: bool,
    /// Indent the rendered document.
    pub pretty: bool,
}

impl TextOptions {
    pub fn serialized() -> Self {
        Self {
            serialize: true,
            pretty: false,
        }
    }
}
