//! Positional engine serving the `Standard` and `Direct` strategies
//!
//! `Standard` issues plain positional reads and writes through the page cache.
//! `Direct` bypasses the cache where the platform allows it: transfers go through an
//! aligned bounce buffer covering whole blocks, and writes read-modify-write the
//! partial blocks at either end. Filesystems that refuse unbuffered I/O fall back to
//! buffered transfers with a warning.

use crate::buffer::SystemAllocator;
use crate::engine::FileEngine;
use crate::memory_map::check_range;
use crate::AsyncOperation;
use pollfs_types::{
    Alignment, Allocator, Error, FileMode, IoStep, MemoryBlock, Progress, ReadRequest, Result,
    WritePosition, WriteRequest,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

/// Read until `buf` is full or EOF; returns the bytes read
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match read_at(file, &mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut total = 0;
    while total < buf.len() {
        match write_at(file, &buf[total..], offset + total as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "positional write made no progress",
                ))
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn request_unbuffered(options: &mut OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    options.custom_flags(libc::O_DIRECT);
}

#[cfg(windows)]
fn request_unbuffered(options: &mut OpenOptions) {
    use std::os::windows::fs::OpenOptionsExt;
    use windows::Win32::Storage::FileSystem::FILE_FLAG_NO_BUFFERING;
    options.custom_flags(FILE_FLAG_NO_BUFFERING.0);
}

#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
fn request_unbuffered(_options: &mut OpenOptions) {}

#[cfg(target_os = "macos")]
fn after_open_unbuffered(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and stays open for the call
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(target_os = "macos"))]
fn after_open_unbuffered(_file: &File) -> io::Result<()> {
    Ok(())
}

/// An open file and whether the cache is bypassed
#[derive(Debug)]
struct Handle {
    file: File,
    unbuffered: bool,
}

/// Open `path`, trying unbuffered I/O first when asked to
fn open_handle(path: &Path, write: bool, unbuffered: bool) -> Result<Handle> {
    let mut options = OpenOptions::new();
    options.read(true);
    if write {
        options.write(true).create(true).truncate(false);
    }

    if unbuffered {
        let mut direct = options.clone();
        request_unbuffered(&mut direct);
        match direct.open(path) {
            Ok(file) => {
                after_open_unbuffered(&file).map_err(|e| Error::from_io(e, path))?;
                return Ok(Handle {
                    file,
                    unbuffered: true,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                warn!(
                    "Unbuffered I/O not supported for {}, falling back to buffered: {}",
                    path.display(),
                    e
                );
            }
            Err(e) => return Err(Error::from_io(e, path)),
        }
    }

    let file = options.open(path).map_err(|e| Error::from_io(e, path))?;
    Ok(Handle {
        file,
        unbuffered: false,
    })
}

/// Run `transfer` on the handle, reopening buffered once if unbuffered I/O is refused
fn with_fallback<T>(
    handle: &mut Option<Handle>,
    path: &Path,
    write: bool,
    mut transfer: impl FnMut(&File) -> io::Result<T>,
) -> Result<T> {
    let current = handle
        .as_ref()
        .ok_or_else(|| Error::invalid_argument("file is not open"))?;
    match transfer(&current.file) {
        Err(e) if e.kind() == io::ErrorKind::InvalidInput && current.unbuffered => {
            warn!(
                "Unbuffered transfer on {} rejected, retrying buffered: {}",
                path.display(),
                e
            );
            let reopened = open_handle(path, write, false)?;
            let outcome = transfer(&reopened.file);
            *handle = Some(reopened);
            outcome.map_err(|e| Error::from_io(e, path))
        }
        other => other.map_err(|e| Error::from_io(e, path)),
    }
}

/// Aligned block window covering `byte_count` bytes at `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockSpan {
    start: u64,
    len: usize,
    delta: usize,
}

impl BlockSpan {
    fn new(offset: u64, byte_count: u64, alignment: Alignment) -> Result<Self> {
        let start = alignment.align_down(offset);
        let end = offset
            .checked_add(byte_count)
            .map(|end| alignment.align_up(end))
            .ok_or_else(|| Error::invalid_argument("transfer range overflows u64"))?;
        let len = usize::try_from(end - start)
            .map_err(|_| Error::invalid_argument("transfer does not fit in memory"))?;
        Ok(Self {
            start,
            len,
            delta: (offset - start) as usize,
        })
    }
}

/// Settings for the `Direct` strategy
#[derive(Debug, Clone)]
struct DirectIo {
    allocator: Arc<dyn Allocator>,
    alignment: Alignment,
}

/// Positional strategy, buffered or direct
#[derive(Debug, Clone)]
pub struct PositionalEngine {
    direct: Option<DirectIo>,
}

impl PositionalEngine {
    /// Engine for the `Standard` strategy
    pub fn standard() -> Self {
        Self { direct: None }
    }

    /// Engine for the `Direct` strategy
    pub fn direct(allocator: Arc<dyn Allocator>, alignment: Alignment) -> Self {
        Self {
            direct: Some(DirectIo {
                allocator,
                alignment,
            }),
        }
    }
}

impl Default for PositionalEngine {
    fn default() -> Self {
        Self::standard()
    }
}

impl FileEngine for PositionalEngine {
    fn mode(&self) -> FileMode {
        if self.direct.is_some() {
            FileMode::Direct
        } else {
            FileMode::Standard
        }
    }

    fn read<'a>(&self, request: ReadRequest<'a>) -> AsyncOperation<'a> {
        let validation = request.validate();
        let byte_count = request.byte_count;
        let direct = self.direct.clone();
        AsyncOperation::start(self.mode(), validation, byte_count, || {
            PositionalRead::new(request, direct)
        })
    }

    fn write<'a>(&self, request: WriteRequest<'a>) -> AsyncOperation<'a> {
        let validation = request.validate();
        let byte_count = request.byte_count;
        let direct = self.direct.clone();
        AsyncOperation::start(self.mode(), validation, byte_count, || {
            PositionalWrite::new(request, direct)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStage {
    Open,
    Transfer,
}

/// State of one positional read
#[derive(Debug)]
struct PositionalRead<'a> {
    path: &'a Path,
    buffer: &'a mut [u8],
    byte_count: u64,
    offset: u64,
    stage: ReadStage,
    handle: Option<Handle>,
    direct: Option<DirectIo>,
}

impl<'a> PositionalRead<'a> {
    fn new(request: ReadRequest<'a>, direct: Option<DirectIo>) -> Self {
        Self {
            path: request.path,
            buffer: request.buffer,
            byte_count: request.byte_count,
            offset: request.offset,
            stage: ReadStage::Open,
            handle: None,
            direct,
        }
    }

    fn open(&mut self) -> Result<()> {
        let handle = open_handle(self.path, false, self.direct.is_some())?;
        let len = handle
            .file
            .metadata()
            .map_err(|e| Error::from_io(e, self.path))?
            .len();
        check_range(len, self.offset, self.byte_count)?;
        debug!(
            "Opened {} for positional read (unbuffered: {})",
            self.path.display(),
            handle.unbuffered
        );
        self.handle = Some(handle);
        Ok(())
    }

    fn transfer_buffered(&mut self) -> Result<()> {
        let count = self.byte_count as usize;
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("file is not open"))?;
        let read = read_full_at(&handle.file, &mut self.buffer[..count], self.offset)
            .map_err(|e| Error::from_io(e, self.path))?;
        if read < count {
            return Err(Error::ExactBytes {
                requested: self.byte_count,
                available: read as u64,
            });
        }
        Ok(())
    }

    fn transfer_direct(&mut self, direct: &DirectIo) -> Result<()> {
        let span = BlockSpan::new(self.offset, self.byte_count, direct.alignment)?;
        let mut block = direct
            .allocator
            .allocate_aligned(span.len, direct.alignment.get())?;
        let outcome = self.fill_block(&mut block, span);
        if outcome.is_ok() {
            let count = self.byte_count as usize;
            self.buffer[..count].copy_from_slice(&block[span.delta..span.delta + count]);
        }
        direct.allocator.free(block);
        outcome
    }

    fn fill_block(&mut self, block: &mut MemoryBlock, span: BlockSpan) -> Result<()> {
        let read = with_fallback(&mut self.handle, self.path, false, |file| {
            read_full_at(file, &mut block[..], span.start)
        })?;

        let needed = span.delta + self.byte_count as usize;
        if read < needed {
            return Err(Error::ExactBytes {
                requested: self.byte_count,
                available: read.saturating_sub(span.delta) as u64,
            });
        }
        Ok(())
    }
}

impl IoStep for PositionalRead<'_> {
    fn step(&mut self) -> Result<Progress> {
        match self.stage {
            ReadStage::Open => {
                self.open()?;
                self.stage = ReadStage::Transfer;
                Ok(Progress::Pending)
            }
            ReadStage::Transfer => {
                match self.direct.clone() {
                    Some(direct) => self.transfer_direct(&direct)?,
                    None => self.transfer_buffered()?,
                }
                self.handle = None;
                Ok(Progress::Done)
            }
        }
    }

    fn stage(&self) -> &'static str {
        match self.stage {
            ReadStage::Open => "Open",
            ReadStage::Transfer => "Transfer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStage {
    Open,
    Resolve,
    Load,
    Transfer,
    Sync,
}

/// State of one positional write or append
#[derive(Debug)]
struct PositionalWrite<'a> {
    path: &'a Path,
    payload: &'a [u8],
    position: WritePosition,
    offset: u64,
    original_size: u64,
    stage: WriteStage,
    handle: Option<Handle>,
    direct: Option<DirectIo>,
    block: Option<(MemoryBlock, BlockSpan)>,
}

impl<'a> PositionalWrite<'a> {
    fn new(request: WriteRequest<'a>, direct: Option<DirectIo>) -> Self {
        let offset = match request.position {
            WritePosition::At(offset) => offset,
            WritePosition::End => 0,
        };
        Self {
            path: request.path,
            payload: request.payload(),
            position: request.position,
            offset,
            original_size: 0,
            stage: WriteStage::Open,
            handle: None,
            direct,
            block: None,
        }
    }

    fn file(&self) -> Result<&File> {
        self.handle
            .as_ref()
            .map(|handle| &handle.file)
            .ok_or_else(|| Error::invalid_argument("file is not open"))
    }

    fn resolve(&mut self) -> Result<()> {
        let size = self
            .file()?
            .metadata()
            .map_err(|e| Error::from_io(e, self.path))?
            .len();
        self.original_size = size;
        if self.position == WritePosition::End {
            self.offset = size;
        }
        self.offset
            .checked_add(self.payload.len() as u64)
            .ok_or_else(|| Error::invalid_argument("write range overflows u64"))?;
        Ok(())
    }

    /// Read the blocks the write partially covers
    fn load(&mut self, direct: &DirectIo) -> Result<()> {
        let span = BlockSpan::new(self.offset, self.payload.len() as u64, direct.alignment)?;
        let mut block = direct
            .allocator
            .allocate_aligned(span.len, direct.alignment.get())?;
        if span.start < self.original_size {
            let loaded = with_fallback(&mut self.handle, self.path, true, |file| {
                read_full_at(file, &mut block[..], span.start)
            });
            if let Err(error) = loaded {
                direct.allocator.free(block);
                return Err(error);
            }
        }
        self.block = Some((block, span));
        Ok(())
    }

    fn transfer(&mut self) -> Result<()> {
        let Some((mut block, span)) = self.block.take() else {
            let payload = self.payload;
            let offset = self.offset;
            return with_fallback(&mut self.handle, self.path, true, |file| {
                write_all_at(file, payload, offset)
            });
        };

        let end = self.offset + self.payload.len() as u64;
        block[span.delta..span.delta + self.payload.len()].copy_from_slice(self.payload);
        let written = with_fallback(&mut self.handle, self.path, true, |file| {
            write_all_at(file, &block, span.start)
        });
        if let Some(direct) = &self.direct {
            direct.allocator.free(block);
        }
        written?;

        // Whole blocks may have been written past the logical end
        let size = self.original_size.max(end);
        if span.start + span.len as u64 > size {
            self.file()?
                .set_len(size)
                .map_err(|e| Error::from_io(e, self.path))?;
        }
        Ok(())
    }
}

impl IoStep for PositionalWrite<'_> {
    fn step(&mut self) -> Result<Progress> {
        match self.stage {
            WriteStage::Open => {
                let handle = open_handle(self.path, true, self.direct.is_some())?;
                debug!(
                    "Opened {} for positional write (unbuffered: {})",
                    self.path.display(),
                    handle.unbuffered
                );
                self.handle = Some(handle);
                self.stage = WriteStage::Resolve;
            }
            WriteStage::Resolve => {
                self.resolve()?;
                self.stage = if self.direct.is_some() {
                    WriteStage::Load
                } else {
                    WriteStage::Transfer
                };
            }
            WriteStage::Load => {
                if let Some(direct) = self.direct.clone() {
                    self.load(&direct)?;
                }
                self.stage = WriteStage::Transfer;
            }
            WriteStage::Transfer => {
                self.transfer()?;
                self.stage = WriteStage::Sync;
            }
            WriteStage::Sync => {
                self.file()?
                    .sync_all()
                    .map_err(|e| Error::from_io(e, self.path))?;
                debug!(
                    "Wrote {} bytes to {} at offset {}",
                    self.payload.len(),
                    self.path.display(),
                    self.offset
                );
                self.handle = None;
                return Ok(Progress::Done);
            }
        }
        Ok(Progress::Pending)
    }

    fn stage(&self) -> &'static str {
        match self.stage {
            WriteStage::Open => "Open",
            WriteStage::Resolve => "Resolve",
            WriteStage::Load => "Load",
            WriteStage::Transfer => "Transfer",
            WriteStage::Sync => "Sync",
        }
    }
}

impl Drop for PositionalWrite<'_> {
    fn drop(&mut self) {
        if let (Some((block, _)), Some(direct)) = (self.block.take(), &self.direct) {
            direct.allocator.free(block);
        }
    }
}

/// Direct engine over the global heap with the default alignment
impl From<Alignment> for PositionalEngine {
    fn from(alignment: Alignment) -> Self {
        Self::direct(Arc::new(SystemAllocator), alignment)
    }
}
