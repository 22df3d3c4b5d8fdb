//! Core traits for pollfs
//!
//! These are the seams between the polling runtime and the engines behind it: a
//! single step of work, the byte allocator engines draw buffers from, and the two
//! host services (locking and change notification).

use crate::{Error, Progress, Result};
use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

/// One unit of forward progress for an engine
///
/// The owning operation calls `step` only while it is pending and drops the
/// implementor as soon as a step returns `Done` or an error. Dropping must release
/// every resource acquired so far.
pub trait IoStep: Send {
    /// Perform exactly one stage of work
    fn step(&mut self) -> Result<Progress>;

    /// Name of the stage the next `step` call will run
    fn stage(&self) -> &'static str;
}

/// A block of bytes handed out by an [`Allocator`]
///
/// Derefs to the usable window, which may start past the beginning of the backing
/// storage when the block was allocated with an alignment.
#[derive(Debug)]
pub struct MemoryBlock {
    bytes: BytesMut,
    start: usize,
    len: usize,
}

impl MemoryBlock {
    /// Wrap a buffer; the whole buffer is usable
    pub fn new(bytes: BytesMut) -> Self {
        let len = bytes.len();
        Self {
            bytes,
            start: 0,
            len,
        }
    }

    /// Wrap a buffer exposing only `start..start + len`
    pub fn with_window(bytes: BytesMut, start: usize, len: usize) -> Result<Self> {
        if start.checked_add(len).map_or(true, |end| end > bytes.len()) {
            return Err(Error::allocation(format!(
                "window {}..{}+{} exceeds backing storage of {} bytes",
                start,
                start,
                len,
                bytes.len()
            )));
        }
        Ok(Self { bytes, start, len })
    }

    /// Usable length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the usable window is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length of the backing storage, window padding included
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Give back the backing storage
    pub fn into_inner(self) -> BytesMut {
        self.bytes
    }
}

impl Deref for MemoryBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes[self.start..self.start + self.len]
    }
}

impl DerefMut for MemoryBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.start..self.start + self.len]
    }
}

/// Byte allocator capability
///
/// Engines never allocate I/O buffers directly; they receive an allocator and go
/// through it, so hosts can swap in pooling or instrumentation.
pub trait Allocator: Send + Sync + std::fmt::Debug {
    /// Allocate a zeroed block of `size` bytes
    fn allocate(&self, size: usize) -> Result<MemoryBlock>;

    /// Return a block to the allocator
    fn free(&self, block: MemoryBlock);

    /// Allocate a zeroed block whose usable window starts on an `alignment` boundary
    fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<MemoryBlock> {
        if !alignment.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }
        let padded = size
            .checked_add(alignment)
            .ok_or_else(|| Error::allocation("aligned size overflows usize"))?;
        let raw = self.allocate(padded)?.into_inner();
        let start = raw.as_ptr().align_offset(alignment);
        MemoryBlock::with_window(raw, start, size)
    }

    /// Resize a block, keeping the common prefix
    fn reallocate(&self, block: MemoryBlock, new_size: usize) -> Result<MemoryBlock> {
        let mut grown = self.allocate(new_size)?;
        let keep = block.len().min(new_size);
        grown[..keep].copy_from_slice(&block[..keep]);
        self.free(block);
        Ok(grown)
    }

    /// Set every usable byte to `value`
    fn fill(&self, block: &mut MemoryBlock, value: u8) {
        block.fill(value);
    }

    /// Copy `source` into the start of `destination`
    fn copy(&self, source: &[u8], destination: &mut MemoryBlock) -> Result<()> {
        if source.len() > destination.len() {
            return Err(Error::invalid_argument(format!(
                "cannot copy {} bytes into a {} byte block",
                source.len(),
                destination.len()
            )));
        }
        destination[..source.len()].copy_from_slice(source);
        Ok(())
    }

    /// Usable size of a block
    fn size(&self, block: &MemoryBlock) -> usize {
        block.len()
    }
}

/// Proof of an acquired lock; hand it back to [`FileLockService::release`]
#[derive(Debug, PartialEq, Eq)]
pub struct LockToken {
    /// The locked file
    pub path: PathBuf,
    /// Unique id of this acquisition
    pub id: uuid::Uuid,
}

/// Exclusive advisory locks on files
pub trait FileLockService: Send + Sync {
    /// Take the lock for `path`, failing with [`Error::Locked`] if it is held
    fn acquire(&self, path: &Path) -> Result<LockToken>;

    /// Release a lock previously returned by `acquire`
    fn release(&self, token: LockToken) -> Result<()>;

    /// Whether someone currently holds the lock for `path`
    fn is_locked(&self, path: &Path) -> bool;
}

/// Identifier returned by [`ChangeNotifier::subscribe`]
pub type SubscriptionId = uuid::Uuid;

/// What happened to a watched file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChangeKind {
    /// The file appeared
    Created,
    /// Content or length changed
    Modified,
    /// The file disappeared
    Removed,
}

/// A change event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Watched path
    pub path: PathBuf,
    /// Kind of change
    pub kind: ChangeKind,
}

/// Callback invoked for each change
pub type ChangeCallback = Box<dyn Fn(&FileChange) + Send + Sync + 'static>;

/// File change notifications
pub trait ChangeNotifier: Send + Sync {
    /// Start watching `path`
    fn subscribe(&self, path: &Path, callback: ChangeCallback) -> Result<SubscriptionId>;

    /// Stop a subscription
    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}
