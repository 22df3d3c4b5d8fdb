//! Unified test utilities for pollfs tests and benchmarks

use anyhow::Context;
use pollfs_config::Config;
use pollfs_engine::FileIo;
use pollfs_io::{await_op, AsyncOperation};
use pollfs_types::FileMode;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Test data generation patterns
#[derive(Debug, Clone, Copy)]
pub enum TestDataPattern {
    /// All zeros
    Zeros,
    /// Deterministic pseudo-random bytes
    Random,
    /// Short repeating structure, like text
    Realistic,
}

/// Generate test data with specified pattern
pub fn generate_test_data(size: usize, pattern: TestDataPattern) -> Vec<u8> {
    match pattern {
        TestDataPattern::Zeros => vec![0u8; size],
        TestDataPattern::Random => {
            // xorshift keeps runs reproducible
            let mut state = 0x2545_F491_4F6C_DD1Du64;
            (0..size)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    (state >> 24) as u8
                })
                .collect()
        }
        TestDataPattern::Realistic => (0..size).map(|i| ((i * 7 + 13) % 256) as u8).collect(),
    }
}

/// Create a temporary file with test data
pub fn create_test_file(
    temp_dir: &TempDir,
    name: &str,
    size: usize,
    pattern: TestDataPattern,
) -> anyhow::Result<PathBuf> {
    let file_path = temp_dir.path().join(name);
    fs::write(&file_path, generate_test_data(size, pattern))
        .with_context(|| format!("failed to write {}", file_path.display()))?;
    Ok(file_path)
}

/// Common file sizes for tests and benchmarks
pub struct CommonFileSizes;

impl CommonFileSizes {
    /// 1KB
    pub const TINY: usize = 1024;
    /// 4KB, one page on most systems
    pub const SMALL: usize = 4 * 1024;
    /// 64KB
    pub const MEDIUM: usize = 64 * 1024;
    /// 1MB
    pub const LARGE: usize = 1024 * 1024;

    /// Get all standard test sizes
    pub fn all() -> Vec<(&'static str, usize)> {
        vec![
            ("1KB", Self::TINY),
            ("4KB", Self::SMALL),
            ("64KB", Self::MEDIUM),
            ("1MB", Self::LARGE),
        ]
    }
}

/// Facade with a small buffer pool, suited to tests
pub fn test_io() -> FileIo {
    let mut config = Config::default();
    config.io.pool_block_size = 256 * 1024;
    config.io.pool_max_blocks = 4;
    FileIo::with_config(config)
}

/// Every concrete strategy usable on this machine
pub fn concrete_modes(io: &FileIo) -> Vec<FileMode> {
    FileMode::CONCRETE
        .iter()
        .copied()
        .filter(|mode| io.engine(*mode).is_available())
        .collect()
}

/// Poll an operation to completion and surface its error
pub fn drive(op: &mut AsyncOperation<'_>) -> anyhow::Result<()> {
    await_op(op);
    op.result()
        .with_context(|| format!("{} operation failed", op.mode()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_test_data_patterns() {
        let size = 1024;

        let zeros = generate_test_data(size, TestDataPattern::Zeros);
        assert_eq!(zeros.len(), size);
        assert!(zeros.iter().all(|&b| b == 0));

        let random = generate_test_data(size, TestDataPattern::Random);
        assert_eq!(random, generate_test_data(size, TestDataPattern::Random));
        assert!(random.iter().any(|&b| b != random[0]));

        let realistic = generate_test_data(size, TestDataPattern::Realistic);
        assert_eq!(realistic[0], 13);
    }

    #[test]
    fn test_create_test_file() {
        let temp_dir = TempDir::new().unwrap();
        let file_path =
            create_test_file(&temp_dir, "test.dat", 1024, TestDataPattern::Zeros).unwrap();

        assert!(file_path.exists());
        assert_eq!(fs::metadata(&file_path).unwrap().len(), 1024);
    }

    #[test]
    fn test_concrete_modes_never_include_auto() {
        let io = test_io();
        let modes = concrete_modes(&io);
        assert!(!modes.contains(&FileMode::Auto));
        assert!(modes.contains(&FileMode::Mmap));
        assert!(modes.contains(&FileMode::Standard));
    }
}
