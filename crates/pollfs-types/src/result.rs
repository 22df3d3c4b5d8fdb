//! Result type alias for pollfs operations

use crate::Error;

/// Result type alias for pollfs operations
pub type Result<T> = std::result::Result<T, Error>;
