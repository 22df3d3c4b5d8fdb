//! Strategy selection for file operations
//!
//! A [`ModeSelector`] turns an [`Access`] into a concrete [`FileMode`]. The
//! [`ExplicitSelector`] always answers with one mode; the [`AdaptiveSelector`]
//! keeps an [`IoProfile`] per path and classifies each access against the
//! thresholds in [`SelectionConfig`]:
//!
//! 1. requests below `small_io_threshold` use plain positional I/O
//! 2. random access at or above `ring_iops_threshold` goes to the ring, when available
//! 3. sequential streams whose working set reaches `direct_working_set_threshold`
//!    bypass the page cache
//! 4. everything else is memory mapped

use pollfs_config::SelectionConfig;
use pollfs_types::{Access, AccessKind, FileMode, IoProfile};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Chooses a concrete strategy for each access
pub trait ModeSelector: Send + Sync + fmt::Debug {
    /// Pick a concrete mode; never returns [`FileMode::Auto`]
    fn select(&self, access: &Access) -> FileMode;

    /// Fold a started access into whatever history the selector keeps
    fn record(&self, access: &Access);

    /// Selections made so far
    fn stats(&self) -> SelectionStats;
}

/// Selection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SelectionStats {
    /// Total number of selections
    pub total_selections: u64,
    /// Number of times positional buffered I/O was selected
    pub standard_selections: u64,
    /// Number of times memory mapping was selected
    pub mmap_selections: u64,
    /// Number of times the ring was selected
    pub ring_selections: u64,
    /// Number of times unbuffered I/O was selected
    pub direct_selections: u64,
}

impl SelectionStats {
    /// Count one selection
    pub fn count(&mut self, mode: FileMode) {
        self.total_selections += 1;
        match mode {
            FileMode::Standard => self.standard_selections += 1,
            FileMode::Mmap | FileMode::Auto => self.mmap_selections += 1,
            FileMode::RingBased => self.ring_selections += 1,
            FileMode::Direct => self.direct_selections += 1,
        }
    }

    /// Selections of `mode`
    pub fn selections(&self, mode: FileMode) -> u64 {
        match mode {
            FileMode::Auto => self.total_selections,
            FileMode::Standard => self.standard_selections,
            FileMode::Mmap => self.mmap_selections,
            FileMode::RingBased => self.ring_selections,
            FileMode::Direct => self.direct_selections,
        }
    }

    /// Share of selections that picked `mode`, in percent
    pub fn percentage(&self, mode: FileMode) -> f64 {
        if self.total_selections == 0 {
            0.0
        } else {
            self.selections(mode) as f64 / self.total_selections as f64 * 100.0
        }
    }
}

/// Always answers with the same strategy
#[derive(Debug)]
pub struct ExplicitSelector {
    mode: FileMode,
    stats: Mutex<SelectionStats>,
}

impl ExplicitSelector {
    /// Select `mode` for every access; `Auto` means memory mapping
    pub fn new(mode: FileMode) -> Self {
        let mode = match mode {
            FileMode::Auto => FileMode::Mmap,
            other => other,
        };
        Self {
            mode,
            stats: Mutex::new(SelectionStats::default()),
        }
    }

    /// The fixed strategy
    pub fn mode(&self) -> FileMode {
        self.mode
    }
}

impl ModeSelector for ExplicitSelector {
    fn select(&self, _access: &Access) -> FileMode {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count(self.mode);
        self.mode
    }

    fn record(&self, _access: &Access) {}

    fn stats(&self) -> SelectionStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Profile-driven selector
pub struct AdaptiveSelector {
    config: SelectionConfig,
    ring_available: bool,
    profiles: Mutex<HashMap<PathBuf, IoProfile>>,
    stats: Mutex<SelectionStats>,
}

impl AdaptiveSelector {
    /// Create a selector; `ring_available` gates the ring rule
    pub fn new(config: SelectionConfig, ring_available: bool) -> Self {
        Self {
            config,
            ring_available,
            profiles: Mutex::new(HashMap::new()),
            stats: Mutex::new(SelectionStats::default()),
        }
    }

    /// Thresholds in use
    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Whether the ring rule can fire
    pub fn ring_available(&self) -> bool {
        self.ring_available
    }

    /// Snapshot of the profile kept for `path`
    pub fn profile(&self, path: &Path) -> Option<IoProfile> {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// Drop the history of `path`; returns whether there was any
    pub fn forget(&self, path: &Path) -> bool {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
    }

    /// Number of paths with a profile
    pub fn tracked_paths(&self) -> usize {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Record an access observed at `now`
    pub fn record_at(&self, access: &Access, now: Instant) {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        let profile = profiles.entry(access.path.clone()).or_default();
        // Appends continue where the previous operation on the path ended
        let offset = match access.kind {
            AccessKind::Append => profile.last_end().unwrap_or(0),
            AccessKind::Read | AccessKind::Write => access.offset,
        };
        profile.record(offset, access.byte_count, now);
    }

    fn classify(&self, access: &Access, profile: Option<&IoProfile>) -> (FileMode, &'static str) {
        if access.byte_count < self.config.small_io_threshold {
            return (FileMode::Standard, "small request");
        }

        let Some(profile) = profile else {
            return (FileMode::Mmap, "no history");
        };

        if self.ring_available
            && profile.iops >= self.config.ring_iops_threshold
            && !profile.is_sequential
        {
            return (FileMode::RingBased, "high-rate random access");
        }

        if profile.is_sequential
            && profile.working_set_size >= self.config.direct_working_set_threshold
        {
            return (FileMode::Direct, "large sequential stream");
        }

        (FileMode::Mmap, "default")
    }
}

impl ModeSelector for AdaptiveSelector {
    fn select(&self, access: &Access) -> FileMode {
        let (mode, reason) = {
            let profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
            self.classify(access, profiles.get(&access.path))
        };

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count(mode);

        debug!(
            "Selected {} for {} bytes at {} of {} ({})",
            mode,
            access.byte_count,
            access.offset,
            access.path.display(),
            reason
        );
        mode
    }

    fn record(&self, access: &Access) {
        self.record_at(access, Instant::now());
    }

    fn stats(&self) -> SelectionStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for AdaptiveSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveSelector")
            .field("config", &self.config)
            .field("ring_available", &self.ring_available)
            .field("tracked_paths", &self.tracked_paths())
            .finish_non_exhaustive()
    }
}
