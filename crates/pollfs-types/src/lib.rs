//! Core type system and error handling for pollfs
//!
//! This crate provides the types shared by every pollfs crate:
//!
//! - **Error handling**: [`Error`] with a stable numeric code and [`ErrorResult`]
//! - **Requests**: read, write and append requests borrowing caller buffers
//! - **Traits**: the single-step engine contract, the byte allocator and host services
//! - **Configuration**: validated newtypes for tunables
//!
//! # Features
//!
//! - `std` (default): Enable standard library features
//! - `serde`: Enable serialization support
//!
//! # Examples
//!
//! ```rust
//! use pollfs_types::{FileMode, ReadRequest, Result};
//!
//! fn build() -> Result<()> {
//!     let mut buffer = [0u8; 7];
//!     let request = ReadRequest::new("notes.txt", &mut buffer)
//!         .with_offset(6)
//!         .with_mode(FileMode::Mmap);
//!     request.validate()
//! }
//! # build().unwrap();
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod result;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{Alignment, PollInterval, QueueDepth};
pub use error::{Error, ErrorKind, ErrorResult};
pub use result::Result;
pub use traits::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_result_round_trip() {
        let error = Error::Cancelled;
        let result = ErrorResult::from(&error);
        assert_eq!(result.code, error.code());
        assert_eq!(result.message(), "Operation cancelled");
    }

    #[test]
    fn test_default_mode_is_auto() {
        assert_eq!(FileMode::default(), FileMode::Auto);
    }
}
