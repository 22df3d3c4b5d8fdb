//! Core data types for pollfs
//!
//! Requests, status values, strategy identifiers and the per-target access profile
//! used by automatic mode selection.

use crate::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Unique identifier for operations
pub type OperationId = uuid::Uuid;

/// Status of a pollable operation
///
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AsyncStatus {
    /// More steps remain
    Pending,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl AsyncStatus {
    /// Whether no further steps may run
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Result of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The step made progress and more steps remain
    Pending,
    /// The operation is finished
    Done,
}

/// I/O strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FileMode {
    /// Pick a strategy from the target's access profile
    #[default]
    Auto,
    /// Synchronous positional reads and writes
    Standard,
    /// Memory-mapped views
    Mmap,
    /// Shared submission/completion queue
    RingBased,
    /// Unbuffered I/O through aligned bounce buffers
    Direct,
}

impl FileMode {
    /// All concrete (non-`Auto`) strategies
    pub const CONCRETE: [FileMode; 4] = [
        FileMode::Standard,
        FileMode::Mmap,
        FileMode::RingBased,
        FileMode::Direct,
    ];

    /// Lowercase name used in configuration files
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Standard => "standard",
            Self::Mmap => "mmap",
            Self::RingBased => "ring_based",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "standard" | "stdio" | "std" => Ok(Self::Standard),
            "mmap" => Ok(Self::Mmap),
            "ring_based" | "ring-based" | "ringbased" | "ring" => Ok(Self::RingBased),
            "direct" => Ok(Self::Direct),
            other => Err(Error::invalid_argument(format!("unknown file mode '{}'", other))),
        }
    }
}

/// Reject paths that can never be opened
pub fn validate_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::null_argument("path"));
    }
    if path.as_os_str().to_string_lossy().contains('\0') {
        return Err(Error::invalid_argument(format!(
            "path '{}' contains a NUL byte",
            path.display()
        )));
    }
    Ok(())
}

fn validate_buffer(buffer_len: usize, byte_count: u64, name: &str) -> Result<()> {
    if byte_count > buffer_len as u64 {
        return Err(Error::invalid_argument(format!(
            "{} holds {} bytes but {} were requested",
            name, buffer_len, byte_count
        )));
    }
    Ok(())
}

/// Read `byte_count` bytes at `offset` into a caller-owned buffer
#[derive(Debug)]
pub struct ReadRequest<'a> {
    /// File to read
    pub path: &'a Path,
    /// Destination; must hold at least `byte_count` bytes
    pub buffer: &'a mut [u8],
    /// Exact number of bytes to deliver
    pub byte_count: u64,
    /// Starting offset in the file
    pub offset: u64,
    /// Strategy
    pub mode: FileMode,
}

impl<'a> ReadRequest<'a> {
    /// Read `buffer.len()` bytes from the start of the file
    pub fn new<P: AsRef<Path> + ?Sized>(path: &'a P, buffer: &'a mut [u8]) -> Self {
        let byte_count = buffer.len() as u64;
        Self {
            path: path.as_ref(),
            buffer,
            byte_count,
            offset: 0,
            mode: FileMode::Auto,
        }
    }

    /// Set the number of bytes to read
    pub fn with_count(mut self, byte_count: u64) -> Self {
        self.byte_count = byte_count;
        self
    }

    /// Set the starting offset
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Set the strategy
    pub fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    /// Check arguments before any resource is touched
    pub fn validate(&self) -> Result<()> {
        validate_path(self.path)?;
        validate_buffer(self.buffer.len(), self.byte_count, "output buffer")
    }

    /// Access descriptor for profiling
    pub fn access(&self) -> Access {
        Access::new(self.path, AccessKind::Read, self.offset, self.byte_count)
    }
}

/// Where a write lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePosition {
    /// At a fixed offset
    At(u64),
    /// At the end of file observed when the operation resolves its range
    End,
}

/// Write `byte_count` bytes from a caller-owned buffer
#[derive(Debug)]
pub struct WriteRequest<'a> {
    /// File to write; created if absent
    pub path: &'a Path,
    /// Source; must hold at least `byte_count` bytes
    pub buffer: &'a [u8],
    /// Exact number of bytes to write
    pub byte_count: u64,
    /// Target position
    pub position: WritePosition,
    /// Strategy
    pub mode: FileMode,
}

impl<'a> WriteRequest<'a> {
    /// Write the whole buffer at offset 0
    pub fn new<P: AsRef<Path> + ?Sized>(path: &'a P, buffer: &'a [u8]) -> Self {
        Self {
            path: path.as_ref(),
            buffer,
            byte_count: buffer.len() as u64,
            position: WritePosition::At(0),
            mode: FileMode::Auto,
        }
    }

    /// Set the number of bytes to write
    pub fn with_count(mut self, byte_count: u64) -> Self {
        self.byte_count = byte_count;
        self
    }

    /// Set the target offset
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.position = WritePosition::At(offset);
        self
    }

    /// Set the strategy
    pub fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this write appends
    pub fn is_append(&self) -> bool {
        self.position == WritePosition::End
    }

    /// Check arguments before any resource is touched
    pub fn validate(&self) -> Result<()> {
        validate_path(self.path)?;
        validate_buffer(self.buffer.len(), self.byte_count, "input buffer")
    }

    /// Bytes that will be written
    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[..self.byte_count as usize]
    }

    /// Access descriptor for profiling; appends report offset 0 until resolved
    pub fn access(&self) -> Access {
        match self.position {
            WritePosition::At(offset) => {
                Access::new(self.path, AccessKind::Write, offset, self.byte_count)
            }
            WritePosition::End => Access::new(self.path, AccessKind::Append, 0, self.byte_count),
        }
    }
}

/// Write `byte_count` bytes at the current end of file
#[derive(Debug)]
pub struct AppendRequest<'a> {
    /// File to append to; created if absent
    pub path: &'a Path,
    /// Source; must hold at least `byte_count` bytes
    pub buffer: &'a [u8],
    /// Exact number of bytes to append
    pub byte_count: u64,
    /// Strategy
    pub mode: FileMode,
}

impl<'a> AppendRequest<'a> {
    /// Append the whole buffer
    pub fn new<P: AsRef<Path> + ?Sized>(path: &'a P, buffer: &'a [u8]) -> Self {
        Self {
            path: path.as_ref(),
            buffer,
            byte_count: buffer.len() as u64,
            mode: FileMode::Auto,
        }
    }

    /// Set the number of bytes to append
    pub fn with_count(mut self, byte_count: u64) -> Self {
        self.byte_count = byte_count;
        self
    }

    /// Set the strategy
    pub fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }
}

impl<'a> From<AppendRequest<'a>> for WriteRequest<'a> {
    fn from(request: AppendRequest<'a>) -> Self {
        Self {
            path: request.path,
            buffer: request.buffer,
            byte_count: request.byte_count,
            position: WritePosition::End,
            mode: request.mode,
        }
    }
}

/// Kind of access, for profiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Read
    Read,
    /// Positioned write
    Write,
    /// Write at end of file
    Append,
}

/// One access as seen by mode selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    /// Target file
    pub path: PathBuf,
    /// Kind of access
    pub kind: AccessKind,
    /// Starting offset
    pub offset: u64,
    /// Length in bytes
    pub byte_count: u64,
}

impl Access {
    /// Create a new access descriptor
    pub fn new(path: &Path, kind: AccessKind, offset: u64, byte_count: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            kind,
            offset,
            byte_count,
        }
    }

    /// First offset past the accessed range
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.byte_count)
    }
}

/// Rolling access statistics for one target
#[derive(Debug, Clone)]
pub struct IoProfile {
    /// Running average of |offset − previous offset| between consecutive operations
    pub avg_offset_delta: u64,
    /// Span between the lowest and highest byte touched so far
    pub working_set_size: u64,
    /// Operations observed during the last second
    pub iops: u32,
    /// Whether operations mostly continue where the previous one ended
    pub is_sequential: bool,
    samples: u64,
    last_offset: Option<u64>,
    last_end: Option<u64>,
    low_water: u64,
    high_water: u64,
    transitions: VecDeque<bool>,
    recent: VecDeque<Instant>,
}

impl IoProfile {
    /// Transitions remembered for the sequential classification
    pub const HISTORY: usize = 16;
    /// Minimum transitions before a target can be called sequential
    pub const MIN_SEQUENTIAL_SAMPLES: usize = 4;
    /// Share of contiguous transitions required for the sequential flag
    pub const SEQUENTIAL_RATIO: f64 = 0.75;
    /// Window over which operations-per-second is estimated
    pub const IOPS_WINDOW: Duration = Duration::from_secs(1);

    /// Empty profile
    pub fn new() -> Self {
        Self {
            avg_offset_delta: 0,
            working_set_size: 0,
            iops: 0,
            is_sequential: false,
            samples: 0,
            last_offset: None,
            last_end: None,
            low_water: u64::MAX,
            high_water: 0,
            transitions: VecDeque::with_capacity(Self::HISTORY),
            recent: VecDeque::new(),
        }
    }

    /// Number of operations recorded
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// End of the most recent operation, where a contiguous successor would start
    pub fn last_end(&self) -> Option<u64> {
        self.last_end
    }

    /// Fold one operation into the profile
    pub fn record(&mut self, offset: u64, byte_count: u64, now: Instant) {
        let end = offset.saturating_add(byte_count);

        if let Some(last_offset) = self.last_offset {
            let delta = offset.abs_diff(last_offset);
            // samples >= 1 here, so this is the (n+1)-th delta over n transitions
            let n = u128::from(self.samples);
            let total = u128::from(self.avg_offset_delta) * (n - 1) + u128::from(delta);
            self.avg_offset_delta = (total / n) as u64;
        }

        if let Some(last_end) = self.last_end {
            if self.transitions.len() == Self::HISTORY {
                self.transitions.pop_front();
            }
            self.transitions.push_back(offset == last_end);
        }

        self.low_water = self.low_water.min(offset);
        self.high_water = self.high_water.max(end);
        self.working_set_size = self.high_water - self.low_water;

        self.recent.push_back(now);
        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) > Self::IOPS_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.iops = self.recent.len().min(u32::MAX as usize) as u32;

        self.is_sequential = self.transitions.len() >= Self::MIN_SEQUENTIAL_SAMPLES && {
            let contiguous = self.transitions.iter().filter(|t| **t).count();
            contiguous as f64 / self.transitions.len() as f64 >= Self::SEQUENTIAL_RATIO
        };

        self.samples += 1;
        self.last_offset = Some(offset);
        self.last_end = Some(end);
    }
}

impl Default for IoProfile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("auto", FileMode::Auto)]
    #[case("stdio", FileMode::Standard)]
    #[case("MMAP", FileMode::Mmap)]
    #[case("ring", FileMode::RingBased)]
    #[case("ring_based", FileMode::RingBased)]
    #[case(" direct ", FileMode::Direct)]
    fn test_file_mode_parse(#[case] input: &str, #[case] expected: FileMode) {
        assert_eq!(input.parse::<FileMode>().unwrap(), expected);
    }

    #[test]
    fn test_file_mode_parse_rejects_unknown() {
        assert!("turbo".parse::<FileMode>().is_err());
        for mode in FileMode::CONCRETE {
            assert_eq!(mode.as_str().parse::<FileMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_read_request_validation() {
        let mut buffer = [0u8; 4];
        assert!(ReadRequest::new("data.bin", &mut buffer).validate().is_ok());

        let mut buffer = [0u8; 4];
        let error = ReadRequest::new("", &mut buffer).validate().unwrap_err();
        assert!(matches!(error, Error::NullArgument { .. }));

        let mut buffer = [0u8; 4];
        let error = ReadRequest::new("data.bin", &mut buffer)
            .with_count(8)
            .validate()
            .unwrap_err();
        assert!(matches!(error, Error::InvalidArgument { .. }));

        let mut buffer = [0u8; 4];
        let error = ReadRequest::new("bad\0name", &mut buffer)
            .validate()
            .unwrap_err();
        assert!(matches!(error, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_append_converts_to_end_position() {
        let data = b"tail";
        let write: WriteRequest<'_> = AppendRequest::new("log.txt", data).into();
        assert!(write.is_append());
        assert_eq!(write.byte_count, 4);
        assert_eq!(write.payload(), b"tail");
        assert_eq!(write.access().kind, AccessKind::Append);
    }

    #[test]
    fn test_profile_sequential_scan() {
        let mut profile = IoProfile::new();
        let now = Instant::now();
        for i in 0..8u64 {
            profile.record(i * 4096, 4096, now);
        }

        assert!(profile.is_sequential);
        assert_eq!(profile.working_set_size, 8 * 4096);
        assert_eq!(profile.avg_offset_delta, 4096);
        assert_eq!(profile.iops, 8);
        assert_eq!(profile.samples(), 8);
    }

    #[test]
    fn test_profile_random_access() {
        let mut profile = IoProfile::new();
        let now = Instant::now();
        for offset in [0u64, 1 << 20, 4096, 1 << 24, 8192, 1 << 22] {
            profile.record(offset, 512, now);
        }

        assert!(!profile.is_sequential);
        assert_eq!(profile.working_set_size, (1 << 24) + 512);
        assert!(profile.avg_offset_delta > 4096);
    }

    #[test]
    fn test_profile_iops_window_expires() {
        let mut profile = IoProfile::new();
        let start = Instant::now();
        profile.record(0, 1, start);
        profile.record(1, 1, start);
        profile.record(2, 1, start + Duration::from_secs(2));
        assert_eq!(profile.iops, 1);
    }

    #[test]
    fn test_profile_needs_enough_samples() {
        let mut profile = IoProfile::new();
        let now = Instant::now();
        profile.record(0, 10, now);
        profile.record(10, 10, now);
        assert!(!profile.is_sequential);
    }

    #[test]
    fn test_async_status_terminal() {
        assert!(!AsyncStatus::Pending.is_terminal());
        assert!(AsyncStatus::Completed.is_terminal());
        assert!(AsyncStatus::Failed.is_terminal());
    }
}
