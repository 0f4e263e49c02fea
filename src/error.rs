use scriptwire_bits::StreamError;
use thiserror::Error;

use crate::value::ResourceId;

/// Failure of a codec entry point. Value-level problems never surface here;
/// they are recorded in the operation's [`Report`](crate::codec::Report).
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Invalid value tag: {0}")]
    InvalidTag(u8),

    #[error("Sequence too large: {len} elements, limit {max}")]
    SequenceTooLong { len: usize, max: usize },

    #[error("Nesting deeper than {0} levels")]
    TooDeep(usize),

    #[error("String too large: {len} bytes, limit {max}")]
    StringTooLong { len: usize, max: usize },

    #[error("Invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("Malformed document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Document root must be an array")]
    NotAnArray,
}

/// Failure to invoke a [`Callable`](crate::Callable).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("{0} is not running")]
    ResourceInactive(ResourceId),

    #[error("{0} has no {1} runtime")]
    NoRuntime(ResourceId, &'static str),

    #[error("Function reference is no longer valid")]
    StaleReference,

    #[error("Sandbox is busy")]
    Busy,

    #[error("{0}")]
    Raised(String),
}
