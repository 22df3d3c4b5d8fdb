//! Error types and handling for pollfs
//!
//! Every engine reports failures through [`Error`]. Each variant maps to a stable,
//! byte-sized [`Error::code`] so an operation's outcome can be flattened into an
//! [`ErrorResult`] (`code == 0` means no error) for callers that only want the
//! numeric taxonomy.

use std::path::{Path, PathBuf};

/// Error category, used to group variants for callers that do not care about details
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// A required argument was missing
    NullArgument,
    /// An argument was present but unusable
    InvalidArgument,
    /// Errors reported by the operating system
    Os,
    /// The exact-bytes contract could not be honoured
    ExactBytes,
    /// The strategy is not available on this platform
    Unsupported,
    /// The operation was cancelled before reaching a terminal state
    Cancelled,
    /// Another holder owns the lock
    Locked,
    /// Configuration problems
    Config,
    /// Internal resource errors (ring, allocator)
    Resource,
}

/// Main error type for pollfs operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error {
    /// A required path or buffer was missing
    #[error("Missing required argument: {name}")]
    NullArgument {
        /// Name of the missing argument
        name: String,
    },

    /// An argument could not be used as given
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Why the argument was rejected
        message: String,
    },

    /// File not found
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path to the file that was not found
        path: PathBuf,
        /// Raw platform error code, when the platform reported one
        os_code: Option<i32>,
    },

    /// Permission denied
    #[error("Permission denied: {path}")]
    PermissionDenied {
        /// Path to the file with permission issues
        path: PathBuf,
        /// Raw platform error code, when the platform reported one
        os_code: Option<i32>,
    },

    /// I/O operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
        /// Raw platform error code, when the platform reported one
        os_code: Option<i32>,
    },

    /// The requested range cannot be transferred in full
    #[error("Exact-bytes contract violated: requested {requested} bytes, {available} available")]
    ExactBytes {
        /// Bytes requested by the caller
        requested: u64,
        /// Bytes that could actually be transferred
        available: u64,
    },

    /// The selected strategy is not supported here
    #[error("Unsupported: {message}")]
    Unsupported {
        /// What is unsupported
        message: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The file is locked by another holder
    #[error("File is locked: {path}")]
    Locked {
        /// Path of the locked file
        path: PathBuf,
    },

    /// Submission/completion queue failure
    #[error("Ring error: {message}")]
    Ring {
        /// Error message describing the queue failure
        message: String,
    },

    /// Allocation failure
    #[error("Allocation error: {message}")]
    Allocation {
        /// Error message describing the allocation failure
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl Error {
    /// Numeric code carried by [`ErrorResult`]; never 0
    pub fn code(&self) -> u8 {
        match self {
            Self::NullArgument { .. } => 1,
            Self::InvalidArgument { .. } => 2,
            Self::FileNotFound { .. } => 3,
            Self::PermissionDenied { .. } => 4,
            Self::Io { .. } => 5,
            Self::ExactBytes { .. } => 6,
            Self::Unsupported { .. } => 7,
            Self::Cancelled => 8,
            Self::Locked { .. } => 9,
            Self::Ring { .. } => 10,
            Self::Allocation { .. } => 11,
            Self::Config { .. } => 12,
        }
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NullArgument { .. } => ErrorKind::NullArgument,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::FileNotFound { .. } | Self::PermissionDenied { .. } | Self::Io { .. } => {
                ErrorKind::Os
            }
            Self::ExactBytes { .. } => ErrorKind::ExactBytes,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::Config { .. } => ErrorKind::Config,
            Self::Ring { .. } | Self::Allocation { .. } => ErrorKind::Resource,
        }
    }

    /// Raw OS error code, if this error came from the platform
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::FileNotFound { os_code, .. }
            | Self::PermissionDenied { os_code, .. }
            | Self::Io { os_code, .. } => *os_code,
            _ => None,
        }
    }

    /// Translate an OS error raised while touching `path`
    ///
    /// Not-found and permission errors get their own variants; everything else is
    /// passed through verbatim. Every variant keeps the platform's code.
    pub fn from_io(error: std::io::Error, path: &Path) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound {
                path: path.to_path_buf(),
                os_code: error.raw_os_error(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
                os_code: error.raw_os_error(),
            },
            _ => Self::Io {
                message: format!("{}: {}", path.display(), error),
                os_code: error.raw_os_error(),
            },
        }
    }

    /// Create a new missing-argument error
    pub fn null_argument<S: Into<String>>(name: S) -> Self {
        Self::NullArgument { name: name.into() }
    }

    /// Create a new invalid-argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a new unsupported error
    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create a new ring error
    pub fn ring<S: Into<String>>(message: S) -> Self {
        Self::Ring {
            message: message.into(),
        }
    }

    /// Create a new allocation error
    pub fn allocation<S: Into<String>>(message: S) -> Self {
        Self::Allocation {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
            os_code: error.raw_os_error(),
        }
    }
}

/// Flattened outcome: a byte-sized code plus an optional message
///
/// `code == 0` is consistent with any non-failed status; a nonzero code implies the
/// operation failed. Copied by value, never aliased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorResult {
    /// Numeric code, 0 when there is no error
    pub code: u8,
    /// Human readable message
    pub message: Option<String>,
}

impl ErrorResult {
    /// Code reported when nothing went wrong
    pub const NO_ERROR: u8 = 0;

    /// The "no error" value
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether this result carries an error
    pub fn is_error(&self) -> bool {
        self.code != Self::NO_ERROR
    }

    /// Message, or a placeholder when none was recorded
    pub fn message(&self) -> &str {
        self.message
            .as_deref()
            .unwrap_or("No error message provided")
    }
}

impl From<&Error> for ErrorResult {
    fn from(error: &Error) -> Self {
        Self {
            code: error.code(),
            message: Some(error.to_string()),
        }
    }
}

impl From<Error> for ErrorResult {
    fn from(error: Error) -> Self {
        Self::from(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    proptest! {
        #[test]
        fn test_error_result_code_is_never_zero(message in ".*") {
            let errors = vec![
                Error::null_argument(message.clone()),
                Error::invalid_argument(message.clone()),
                Error::Io { message: message.clone(), os_code: None },
                Error::unsupported(message.clone()),
                Error::ring(message.clone()),
                Error::allocation(message.clone()),
                Error::config(message.clone()),
            ];

            for error in errors {
                let result = ErrorResult::from(&error);
                prop_assert!(result.is_error());
                prop_assert_eq!(result.code, error.code());
                prop_assert!(result.message().contains(&message));
            }
        }
    }

    #[rstest]
    #[case(std::io::ErrorKind::NotFound, ErrorKind::Os, 3)]
    #[case(std::io::ErrorKind::PermissionDenied, ErrorKind::Os, 4)]
    #[case(std::io::ErrorKind::InvalidData, ErrorKind::Os, 5)]
    fn test_from_io_with_path(
        #[case] io_kind: std::io::ErrorKind,
        #[case] kind: ErrorKind,
        #[case] code: u8,
    ) {
        let path = Path::new("/data/blob.bin");
        let error = Error::from_io(std::io::Error::new(io_kind, "boom"), path);

        assert_eq!(error.kind(), kind);
        assert_eq!(error.code(), code);
        assert!(error.to_string().contains("/data/blob.bin"));
    }

    // ENOENT, EACCES and EIO
    #[cfg(unix)]
    #[rstest]
    #[case(2, 3)]
    #[case(13, 4)]
    #[case(5, 5)]
    fn test_from_io_keeps_os_code(#[case] raw: i32, #[case] code: u8) {
        let path = Path::new("/data/blob.bin");
        let error = Error::from_io(std::io::Error::from_raw_os_error(raw), path);

        assert_eq!(error.code(), code);
        assert_eq!(error.os_code(), Some(raw));
        assert_eq!(ErrorResult::from(&error).code, code);
    }

    #[test]
    fn test_io_error_keeps_os_code() {
        let error = Error::from(std::io::Error::from_raw_os_error(5));
        assert_eq!(error.os_code(), Some(5));
        assert_eq!(error.kind(), ErrorKind::Os);
    }

    #[test]
    fn test_exact_bytes_message() {
        let error = Error::ExactBytes {
            requested: 12,
            available: 7,
        };
        assert_eq!(error.kind(), ErrorKind::ExactBytes);
        assert!(error.to_string().contains("requested 12"));
        assert!(error.to_string().contains("7 available"));
    }

    #[test]
    fn test_no_error_result() {
        let result = ErrorResult::none();
        assert!(!result.is_error());
        assert_eq!(result.code, ErrorResult::NO_ERROR);
        assert_eq!(result.message(), "No error message provided");
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            Error::null_argument("path"),
            Error::invalid_argument("x"),
            Error::FileNotFound { path: PathBuf::new(), os_code: None },
            Error::PermissionDenied { path: PathBuf::new(), os_code: None },
            Error::Io { message: String::new(), os_code: None },
            Error::ExactBytes { requested: 1, available: 0 },
            Error::unsupported("x"),
            Error::Cancelled,
            Error::Locked { path: PathBuf::new() },
            Error::ring("x"),
            Error::allocation("x"),
            Error::config("x"),
        ];
        let mut codes: Vec<u8> = errors.iter().map(Error::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&0));
    }
}
