//! Wire and text codecs for [`ValueList`](crate::ValueList).
//!
//! Both codecs deduplicate tables per call: the first occurrence of a table
//! is written in full, later occurrences as a back-reference to its registry
//! index. A value that cannot be represented is replaced by a placeholder and
//! recorded in the call's [`Report`]; sibling values are unaffected.

pub mod binary;
pub mod text;

pub use binary::BinaryCodec;
pub use text::TextCodec;

use thiserror::Error;
use tracing::warn;

use crate::value::ValueKind;

/// A value-level failure. The offending value was skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    #[error("string of {len} bytes exceeds limit of {max}")]
    Overflow { len: usize, max: usize },

    #[error("broken reference {0}")]
    BrokenReference(String),

    #[error("{0} values cannot be encoded here")]
    Unsupported(ValueKind),

    #[error("invalid {what}: {detail}")]
    Invalid { what: &'static str, detail: String },

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
}

/// Value-level failures collected during one codec call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub failures: Vec<Failure>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn record(&mut self, failure: Failure) {
        warn!(%failure, "value skipped");
        self.failures.push(failure);
    }
}
