//! Submission/completion queue engine
//!
//! A [`RingContext`] is the reactor: it owns the kernel queue (Linux io_uring),
//! hands out request ids and routes completions back to the operation that
//! submitted them. Operations never block. They submit once and then check for
//! their own completion on every poll.
//!
//! The bounce buffer and the file of every submitted request live in the context's
//! in-flight table until the kernel reports completion, so an operation that is
//! dropped mid-flight cannot leave the kernel writing into freed memory. Dropping
//! the context waits for every outstanding completion.

use crate::engine::FileEngine;
use crate::memory_map::check_range;
use crate::AsyncOperation;
use pollfs_types::{
    Allocator, Error, FileMode, IoStep, MemoryBlock, Progress, QueueDepth, ReadRequest, Result,
    WritePosition, WriteRequest,
};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[cfg(target_os = "linux")]
use {
    io_uring::{opcode, squeue, types, IoUring},
    once_cell::sync::OnceCell,
    std::collections::HashMap,
    std::os::unix::io::AsRawFd,
    std::sync::{Mutex, MutexGuard, PoisonError},
    tracing::warn,
};

/// Counters kept by a ring context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Requests pushed to the submission queue
    pub submitted: u64,
    /// Completions taken off the completion queue
    pub completed: u64,
    /// Requests whose owner went away before completion
    pub abandoned: u64,
}

/// A finished request handed back to its owner
#[derive(Debug)]
pub struct Completion {
    result: i32,
    buffer: MemoryBlock,
    file: File,
}

impl Completion {
    /// Raw kernel result: bytes transferred, or a negated errno
    pub fn result(&self) -> i32 {
        self.result
    }

    /// Bytes transferred, or the OS error the request failed with
    pub fn transferred(&self, path: &Path) -> Result<u64> {
        if self.result < 0 {
            Err(Error::from_io(
                std::io::Error::from_raw_os_error(-self.result),
                path,
            ))
        } else {
            Ok(self.result as u64)
        }
    }

    /// Bounce buffer of the request
    pub fn buffer(&self) -> &MemoryBlock {
        &self.buffer
    }

    /// Split into buffer and file
    pub fn into_parts(self) -> (MemoryBlock, File) {
        (self.buffer, self.file)
    }
}

#[cfg(target_os = "linux")]
struct InFlight {
    buffer: MemoryBlock,
    file: File,
    abandoned: bool,
}

#[cfg(target_os = "linux")]
struct RingQueue {
    ring: IoUring,
    in_flight: HashMap<u64, InFlight>,
    // Results waiting for their owner to reap them
    completions: HashMap<u64, i32>,
}

#[cfg(target_os = "linux")]
impl RingQueue {
    /// Move every available completion into the routing table
    ///
    /// Completions that did not fit the completion queue sit in the kernel's
    /// overflow list until the next `io_uring_enter` with `GETEVENTS`, so the
    /// queue is re-entered whenever the overflow flag is raised.
    fn drain(&mut self, allocator: &dyn Allocator, stats: &AtomicU64) -> Result<()> {
        self.route_ready(allocator, stats);
        if !self.ring.submission().cq_overflow() {
            return Ok(());
        }

        trace!("Completion queue overflowed, flushing through the kernel");
        match self.ring.submitter().submit_and_wait(0) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::ring(format!("overflow flush failed: {}", e))),
        }
        self.route_ready(allocator, stats);
        Ok(())
    }

    fn route_ready(&mut self, allocator: &dyn Allocator, stats: &AtomicU64) {
        let entries: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        for (id, result) in entries {
            stats.fetch_add(1, Ordering::Relaxed);
            let abandoned = self.in_flight.get(&id).map_or(false, |entry| entry.abandoned);
            if abandoned {
                if let Some(entry) = self.in_flight.remove(&id) {
                    allocator.free(entry.buffer);
                }
                trace!("Discarded completion {} of an abandoned request", id);
            } else {
                trace!("Routed completion {} (result {})", id, result);
                self.completions.insert(id, result);
            }
        }
    }

    fn push(&mut self, entry: &squeue::Entry) -> Result<()> {
        // SAFETY: the buffer and file referenced by the entry are stored in the
        // in-flight table before the push and stay there until completion.
        if unsafe { self.ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }
        // Queue full: hand the pending entries to the kernel and retry once
        self.ring
            .submit()
            .map_err(|e| Error::ring(format!("submit failed: {}", e)))?;
        // SAFETY: as above
        unsafe { self.ring.submission().push(entry) }
            .map_err(|_| Error::ring("submission queue is full"))
    }
}

/// Explicit reactor shared by ring-based operations
pub struct RingContext {
    queue_depth: QueueDepth,
    allocator: Arc<dyn Allocator>,
    next_id: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    #[cfg(target_os = "linux")]
    queue: OnceCell<Mutex<RingQueue>>,
}

impl fmt::Debug for RingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingContext")
            .field("queue_depth", &self.queue_depth)
            .field("allocator", &self.allocator)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl RingContext {
    /// Create a context; the kernel queue is set up on first use
    pub fn new(queue_depth: QueueDepth, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            queue_depth,
            allocator,
            next_id: AtomicU64::new(1),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            #[cfg(target_os = "linux")]
            queue: OnceCell::new(),
        }
    }

    /// Queue depth requested for the kernel queue
    pub fn queue_depth(&self) -> QueueDepth {
        self.queue_depth
    }

    /// Counters so far
    pub fn stats(&self) -> RingStats {
        RingStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Whether the kernel queue can be used
    pub fn is_supported(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.queue().is_ok()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Return a bounce buffer to the allocator
    pub fn recycle(&self, buffer: MemoryBlock) {
        self.allocator.free(buffer);
    }

    #[cfg(target_os = "linux")]
    fn queue(&self) -> Result<MutexGuard<'_, RingQueue>> {
        let queue = self.queue.get_or_try_init(|| {
            let ring = IoUring::new(self.queue_depth.get())
                .map_err(|e| Error::unsupported(format!("io_uring is unavailable: {}", e)))?;
            debug!("Initialised io_uring with {} entries", self.queue_depth.get());
            Ok::<_, Error>(Mutex::new(RingQueue {
                ring,
                in_flight: HashMap::new(),
                completions: HashMap::new(),
            }))
        })?;
        queue
            .lock()
            .map_err(|_| Error::ring("ring queue lock poisoned"))
    }

    /// Submit a read of `len` bytes at `offset`; the file moves into the context
    #[cfg(target_os = "linux")]
    pub fn submit_read(&self, file: File, len: u32, offset: u64) -> Result<u64> {
        let mut buffer = self.allocator.allocate(len as usize)?;
        let id = self.next_id();
        let entry = opcode::Read::new(types::Fd(file.as_raw_fd()), buffer.as_mut_ptr(), len)
            .offset(offset)
            .build()
            .user_data(id);
        self.submit(id, entry, buffer, file)
    }

    /// Submit a write of `data` at `offset`; the file moves into the context
    #[cfg(target_os = "linux")]
    pub fn submit_write(&self, file: File, data: &[u8], offset: u64) -> Result<u64> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::invalid_argument("ring writes are limited to u32::MAX bytes"))?;
        let mut buffer = self.allocator.allocate(data.len())?;
        self.allocator.copy(data, &mut buffer)?;
        let id = self.next_id();
        let entry = opcode::Write::new(types::Fd(file.as_raw_fd()), buffer.as_ptr(), len)
            .offset(offset)
            .build()
            .user_data(id);
        self.submit(id, entry, buffer, file)
    }

    #[cfg(target_os = "linux")]
    fn submit(&self, id: u64, entry: squeue::Entry, buffer: MemoryBlock, file: File) -> Result<u64> {
        let mut queue = self.queue()?;
        queue.in_flight.insert(
            id,
            InFlight {
                buffer,
                file,
                abandoned: false,
            },
        );
        if let Err(error) = queue.push(&entry) {
            // Never reached the kernel, safe to release now
            if let Some(entry) = queue.in_flight.remove(&id) {
                self.allocator.free(entry.buffer);
            }
            return Err(error);
        }
        if let Err(e) = queue.ring.submit() {
            // The entry may still be picked up later; let the drain path clean it up
            if let Some(entry) = queue.in_flight.get_mut(&id) {
                entry.abandoned = true;
            }
            self.abandoned.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ring(format!("submit failed: {}", e)));
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        trace!("Submitted request {}", id);
        Ok(id)
    }

    /// Take the completion of `id` if it has arrived
    #[cfg(target_os = "linux")]
    pub fn reap(&self, id: u64) -> Result<Option<Completion>> {
        let mut queue = self.queue()?;
        queue.drain(self.allocator.as_ref(), &self.completed)?;

        let Some(result) = queue.completions.remove(&id) else {
            return Ok(None);
        };
        let entry = queue
            .in_flight
            .remove(&id)
            .ok_or_else(|| Error::ring(format!("completion {} has no in-flight entry", id)))?;
        Ok(Some(Completion {
            result,
            buffer: entry.buffer,
            file: entry.file,
        }))
    }

    /// Give up on `id`; its resources are released once the kernel is done with them
    #[cfg(target_os = "linux")]
    pub fn abandon(&self, id: u64) {
        let Ok(mut queue) = self.queue() else {
            return;
        };
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        if queue.completions.remove(&id).is_some() {
            if let Some(entry) = queue.in_flight.remove(&id) {
                self.allocator.free(entry.buffer);
            }
        } else if let Some(entry) = queue.in_flight.get_mut(&id) {
            entry.abandoned = true;
        }
        debug!("Request {} abandoned by its owner", id);
    }

    /// Submit a read of `len` bytes at `offset`; the file moves into the context
    #[cfg(not(target_os = "linux"))]
    pub fn submit_read(&self, _file: File, _len: u32, _offset: u64) -> Result<u64> {
        Err(Self::unsupported())
    }

    /// Submit a write of `data` at `offset`; the file moves into the context
    #[cfg(not(target_os = "linux"))]
    pub fn submit_write(&self, _file: File, _data: &[u8], _offset: u64) -> Result<u64> {
        Err(Self::unsupported())
    }

    /// Take the completion of `id` if it has arrived
    #[cfg(not(target_os = "linux"))]
    pub fn reap(&self, _id: u64) -> Result<Option<Completion>> {
        Err(Self::unsupported())
    }

    /// Give up on `id`
    #[cfg(not(target_os = "linux"))]
    pub fn abandon(&self, _id: u64) {}

    #[cfg(not(target_os = "linux"))]
    fn unsupported() -> Error {
        Error::unsupported("ring-based I/O requires Linux io_uring")
    }
}

#[cfg(target_os = "linux")]
impl Drop for RingContext {
    fn drop(&mut self) {
        let Some(queue) = self.queue.get_mut() else {
            return;
        };
        let queue = queue.get_mut().unwrap_or_else(PoisonError::into_inner);
        while !queue.in_flight.is_empty() {
            let outstanding = queue.in_flight.len().saturating_sub(queue.completions.len());
            if outstanding == 0 {
                break;
            }
            match queue.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The kernel may still write into these buffers; leak them
                    warn!("Leaking {} in-flight ring requests: {}", outstanding, e);
                    for (_, entry) in queue.in_flight.drain() {
                        std::mem::forget(entry);
                    }
                    return;
                }
            }
            if let Err(e) = queue.drain(self.allocator.as_ref(), &self.completed) {
                warn!("Failed to drain ring completions on drop: {}", e);
            }
        }
    }
}

/// Ring-based strategy backed by a shared context
#[derive(Debug, Clone)]
pub struct RingEngine {
    context: Arc<RingContext>,
}

impl RingEngine {
    /// Wrap a shared context
    pub fn new(context: Arc<RingContext>) -> Self {
        Self { context }
    }

    /// The shared context
    pub fn context(&self) -> &Arc<RingContext> {
        &self.context
    }
}

impl FileEngine for RingEngine {
    fn mode(&self) -> FileMode {
        FileMode::RingBased
    }

    fn is_available(&self) -> bool {
        self.context.is_supported()
    }

    fn read<'a>(&self, request: ReadRequest<'a>) -> AsyncOperation<'a> {
        let validation = request.validate();
        let byte_count = request.byte_count;
        let context = Arc::clone(&self.context);
        AsyncOperation::start(FileMode::RingBased, validation, byte_count, || {
            RingRead::new(context, request)
        })
    }

    fn write<'a>(&self, request: WriteRequest<'a>) -> AsyncOperation<'a> {
        let validation = request.validate();
        let byte_count = request.byte_count;
        let context = Arc::clone(&self.context);
        AsyncOperation::start(FileMode::RingBased, validation, byte_count, || {
            RingWrite::new(context, request)
        })
    }
}

fn ring_length(byte_count: u64) -> Result<u32> {
    u32::try_from(byte_count).map_err(|_| {
        Error::invalid_argument(format!(
            "ring transfers are limited to {} bytes, {} requested",
            u32::MAX,
            byte_count
        ))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingStage {
    Open,
    Submit,
    Reap,
    Sync,
}

impl RingStage {
    fn name(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Submit => "Submit",
            Self::Reap => "Reap",
            Self::Sync => "Sync",
        }
    }
}

/// State of one ring-based read
#[derive(Debug)]
struct RingRead<'a> {
    context: Arc<RingContext>,
    path: &'a Path,
    buffer: &'a mut [u8],
    byte_count: u64,
    offset: u64,
    stage: RingStage,
    file: Option<File>,
    request: Option<u64>,
}

impl<'a> RingRead<'a> {
    fn new(context: Arc<RingContext>, request: ReadRequest<'a>) -> Self {
        Self {
            context,
            path: request.path,
            buffer: request.buffer,
            byte_count: request.byte_count,
            offset: request.offset,
            stage: RingStage::Open,
            file: None,
            request: None,
        }
    }

    fn finish(&mut self, completion: Completion) -> Result<()> {
        let transferred = completion.transferred(self.path);
        let outcome = transferred.and_then(|read| {
            if read < self.byte_count {
                return Err(Error::ExactBytes {
                    requested: self.byte_count,
                    available: read,
                });
            }
            let count = self.byte_count as usize;
            self.buffer[..count].copy_from_slice(&completion.buffer()[..count]);
            Ok(())
        });
        let (buffer, _file) = completion.into_parts();
        self.context.recycle(buffer);
        outcome
    }
}

impl IoStep for RingRead<'_> {
    fn step(&mut self) -> Result<Progress> {
        match self.stage {
            RingStage::Open => {
                ring_length(self.byte_count)?;
                let file = File::open(self.path).map_err(|e| Error::from_io(e, self.path))?;
                let len = file
                    .metadata()
                    .map_err(|e| Error::from_io(e, self.path))?
                    .len();
                check_range(len, self.offset, self.byte_count)?;
                self.file = Some(file);
                self.stage = RingStage::Submit;
            }
            RingStage::Submit => {
                let file = self
                    .file
                    .take()
                    .ok_or_else(|| Error::invalid_argument("file is not open"))?;
                let id = self.context.submit_read(
                    file,
                    ring_length(self.byte_count)?,
                    self.offset,
                )?;
                self.request = Some(id);
                self.stage = RingStage::Reap;
            }
            RingStage::Reap | RingStage::Sync => {
                let id = self
                    .request
                    .ok_or_else(|| Error::ring("read was never submitted"))?;
                let Some(completion) = self.context.reap(id)? else {
                    return Ok(Progress::Pending);
                };
                self.request = None;
                self.finish(completion)?;
                return Ok(Progress::Done);
            }
        }
        Ok(Progress::Pending)
    }

    fn stage(&self) -> &'static str {
        self.stage.name()
    }
}

impl Drop for RingRead<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.request.take() {
            self.context.abandon(id);
        }
    }
}

/// State of one ring-based write or append
#[derive(Debug)]
struct RingWrite<'a> {
    context: Arc<RingContext>,
    path: &'a Path,
    payload: &'a [u8],
    position: WritePosition,
    offset: u64,
    stage: RingStage,
    file: Option<File>,
    request: Option<u64>,
}

impl<'a> RingWrite<'a> {
    fn new(context: Arc<RingContext>, request: WriteRequest<'a>) -> Self {
        let offset = match request.position {
            WritePosition::At(offset) => offset,
            WritePosition::End => 0,
        };
        Self {
            context,
            path: request.path,
            payload: request.payload(),
            position: request.position,
            offset,
            stage: RingStage::Open,
            file: None,
            request: None,
        }
    }

    fn open(&mut self) -> Result<()> {
        ring_length(self.payload.len() as u64)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path)
            .map_err(|e| Error::from_io(e, self.path))?;
        if self.position == WritePosition::End {
            self.offset = file
                .metadata()
                .map_err(|e| Error::from_io(e, self.path))?
                .len();
        }
        self.offset
            .checked_add(self.payload.len() as u64)
            .ok_or_else(|| Error::invalid_argument("write range overflows u64"))?;
        self.file = Some(file);
        Ok(())
    }
}

impl IoStep for RingWrite<'_> {
    fn step(&mut self) -> Result<Progress> {
        match self.stage {
            RingStage::Open => {
                self.open()?;
                self.stage = RingStage::Submit;
            }
            RingStage::Submit => {
                let file = self
                    .file
                    .take()
                    .ok_or_else(|| Error::invalid_argument("file is not open"))?;
                let id = self.context.submit_write(file, self.payload, self.offset)?;
                self.request = Some(id);
                self.stage = RingStage::Reap;
            }
            RingStage::Reap => {
                let id = self
                    .request
                    .ok_or_else(|| Error::ring("write was never submitted"))?;
                let Some(completion) = self.context.reap(id)? else {
                    return Ok(Progress::Pending);
                };
                self.request = None;
                let written = completion.transferred(self.path);
                let (buffer, file) = completion.into_parts();
                self.context.recycle(buffer);
                let written = written?;
                if written < self.payload.len() as u64 {
                    return Err(Error::ExactBytes {
                        requested: self.payload.len() as u64,
                        available: written,
                    });
                }
                self.file = Some(file);
                self.stage = RingStage::Sync;
            }
            RingStage::Sync => {
                let file = self
                    .file
                    .take()
                    .ok_or_else(|| Error::invalid_argument("file is not open"))?;
                file.sync_all().map_err(|e| Error::from_io(e, self.path))?;
                debug!(
                    "Ring wrote {} bytes to {} at offset {}",
                    self.payload.len(),
                    self.path.display(),
                    self.offset
                );
                return Ok(Progress::Done);
            }
        }
        Ok(Progress::Pending)
    }

    fn stage(&self) -> &'static str {
        self.stage.name()
    }
}

impl Drop for RingWrite<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.request.take() {
            self.context.abandon(id);
        }
    }
}
