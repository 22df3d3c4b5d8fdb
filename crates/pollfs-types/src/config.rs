//! Validated configuration values
//!
//! Newtypes that can only hold values the engines accept.

use std::time::Duration;

/// Number of entries in the submission queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u32", into = "u32"))]
pub struct QueueDepth(u32);

impl QueueDepth {
    /// Minimum queue depth
    pub const MIN: u32 = 1;
    /// Maximum queue depth
    pub const MAX: u32 = 4096;
    /// Default queue depth
    pub const DEFAULT: u32 = 256;

    /// Create a new queue depth with validation
    pub fn new(depth: u32) -> Result<Self, String> {
        if depth < Self::MIN {
            Err(format!("Queue depth {} is below minimum {}", depth, Self::MIN))
        } else if depth > Self::MAX {
            Err(format!("Queue depth {} exceeds maximum {}", depth, Self::MAX))
        } else if !depth.is_power_of_two() {
            Err(format!("Queue depth {} must be a power of two", depth))
        } else {
            Ok(Self(depth))
        }
    }

    /// Get the queue depth value
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for QueueDepth {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<u32> for QueueDepth {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, String> {
        Self::new(value)
    }
}

impl From<QueueDepth> for u32 {
    fn from(depth: QueueDepth) -> Self {
        depth.0
    }
}

/// Block alignment for unbuffered I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "usize", into = "usize"))]
pub struct Alignment(usize);

impl Alignment {
    /// Minimum alignment (one legacy sector)
    pub const MIN: usize = 512;
    /// Maximum alignment
    pub const MAX: usize = 64 * 1024;
    /// Default alignment
    pub const DEFAULT: usize = 4096;

    /// Create a new alignment with validation
    pub fn new(alignment: usize) -> Result<Self, String> {
        if alignment < Self::MIN {
            Err(format!("Alignment {} is below minimum {}", alignment, Self::MIN))
        } else if alignment > Self::MAX {
            Err(format!("Alignment {} exceeds maximum {}", alignment, Self::MAX))
        } else if !alignment.is_power_of_two() {
            Err(format!("Alignment {} must be a power of two", alignment))
        } else {
            Ok(Self(alignment))
        }
    }

    /// Get the alignment value
    pub fn get(self) -> usize {
        self.0
    }

    /// Round `value` down to a multiple of this alignment
    pub fn align_down(self, value: u64) -> u64 {
        value & !(self.0 as u64 - 1)
    }

    /// Round `value` up to a multiple of this alignment
    pub fn align_up(self, value: u64) -> u64 {
        let mask = self.0 as u64 - 1;
        value.saturating_add(mask) & !mask
    }
}

impl Default for Alignment {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<usize> for Alignment {
    type Error = String;

    fn try_from(value: usize) -> Result<Self, String> {
        Self::new(value)
    }
}

impl From<Alignment> for usize {
    fn from(alignment: Alignment) -> Self {
        alignment.0
    }
}

/// Interval between polls of watched files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PollInterval(Duration);

impl PollInterval {
    /// Shortest allowed interval
    pub const MIN: Duration = Duration::from_millis(10);
    /// Default interval
    pub const DEFAULT: Duration = Duration::from_millis(500);

    /// Create a new poll interval with validation
    pub fn new(interval: Duration) -> Result<Self, String> {
        if interval < Self::MIN {
            Err(format!(
                "Poll interval {:?} is below minimum {:?}",
                interval,
                Self::MIN
            ))
        } else {
            Ok(Self(interval))
        }
    }

    /// Get the interval
    pub fn get(self) -> Duration {
        self.0
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}
