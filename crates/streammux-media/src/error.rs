//! Error types for streammux-media.
//!
//! Running out of input is not an error: parsers report "nothing yet" and
//! keep the unconsumed bytes for the next push. The variants here cover
//! structurally broken data, unsupported combinations and broken internal
//! invariants.

use thiserror::Error;

/// Result type for streammux-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for streammux-media operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed container or bitstream data.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Unsupported container, codec or combination of the two.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A block timestamp does not fit the signed 16-bit cluster delta.
    #[error("Timestamp delta {delta} of track {track} does not fit in a cluster")]
    TimestampOverflow { track: u32, delta: i64 },

    /// An internal precondition was violated by the caller.
    #[error("Invariant violated: {0}")]
    Invariant(&'static str),

    /// A bit or byte reader ran past the end of its input.
    #[error("Truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

impl Error {
    /// Create an invalid data error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidData(msg.into())
    }

    /// Create an unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::invalid("bad vint").to_string(), "Invalid data: bad vint");
        assert_eq!(
            Error::TimestampOverflow {
                track: 2,
                delta: 40000
            }
            .to_string(),
            "Timestamp delta 40000 of track 2 does not fit in a cluster"
        );
        assert_eq!(
            Error::Truncated { need: 4, have: 1 }.to_string(),
            "Truncated: need 4 bytes, have 1"
        );
    }
}
