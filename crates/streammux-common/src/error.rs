//! Error types for streammux-common.

use thiserror::Error;

/// Result type for streammux-common operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for streammux-common operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A number did not fit the requested width.
    #[error("Integer of {0} bytes does not fit in 64 bits")]
    TooWide(usize),

    /// A rational with a zero denominator was requested.
    #[error("Zero denominator")]
    ZeroDenominator,
}
