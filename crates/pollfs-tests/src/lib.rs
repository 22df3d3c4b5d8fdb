//! pollfs integration testing suite
//!
//! Shared helpers for the cross-crate integration tests and benchmarks.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Unified test utilities
///
/// This module provides common utilities used across all test files
/// to ensure consistency and reduce code duplication.
pub mod test_utils;
