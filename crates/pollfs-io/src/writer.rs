//! Memory-mapped write engine
//!
//! Stages: open (create, never truncate), extend the file when the write ends past
//! it, map, map an aligned read-write view, copy, flush the view, flush the file.
//! An operation only reports `Completed` once both flushes succeeded.
//!
//! If a step fails after `Transfer` but before both flushes, the content of the
//! written range on disk is undefined: the copy may or may not have reached storage.

use crate::memory_map::{MappedResources, Mapping, View, ViewRange};
use crate::AsyncOperation;
use pollfs_types::{Error, FileMode, IoStep, Progress, Result, WritePosition, WriteRequest};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStage {
    Open,
    Extend,
    Map,
    View,
    Transfer,
    FlushView,
    FlushFile,
}

/// State of one memory-mapped write or append
#[derive(Debug)]
pub struct MmapWriter<'a> {
    path: &'a Path,
    payload: &'a [u8],
    position: WritePosition,
    stage: WriteStage,
    offset: u64,
    original_size: u64,
    extended: bool,
    range: Option<ViewRange>,
    resources: MappedResources,
}

impl<'a> MmapWriter<'a> {
    /// Build the state for a validated request
    pub fn new(request: WriteRequest<'a>) -> Self {
        let offset = match request.position {
            WritePosition::At(offset) => offset,
            WritePosition::End => 0,
        };
        Self {
            path: request.path,
            payload: request.payload(),
            position: request.position,
            stage: WriteStage::Open,
            offset,
            original_size: 0,
            extended: false,
            range: None,
            resources: MappedResources::new(),
        }
    }

    /// Start a write, validating the request first
    pub fn start(request: WriteRequest<'a>) -> AsyncOperation<'a> {
        let validation = request.validate();
        let byte_count = request.byte_count;
        AsyncOperation::start(FileMode::Mmap, validation, byte_count, || {
            Self::new(request)
        })
    }

    /// File size observed before the write
    pub fn original_size(&self) -> u64 {
        self.original_size
    }

    /// Whether the file had to grow
    pub fn extended(&self) -> bool {
        self.extended
    }

    fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path)
            .map_err(|e| Error::from_io(e, self.path))?;
        debug!("Opened {} for mapped write", self.path.display());
        self.resources.set_file(file);
        Ok(())
    }

    fn extend(&mut self) -> Result<()> {
        let file = self.resources.file()?;
        let size = file.metadata().map_err(|e| Error::from_io(e, self.path))?.len();
        self.original_size = size;
        if self.position == WritePosition::End {
            self.offset = size;
        }

        let end = self
            .offset
            .checked_add(self.payload.len() as u64)
            .ok_or_else(|| Error::invalid_argument("write range overflows u64"))?;
        if end > size && !self.extended {
            file.set_len(end).map_err(|e| Error::from_io(e, self.path))?;
            self.extended = true;
            debug!(
                "Extended {} from {} to {} bytes",
                self.path.display(),
                size,
                end
            );
        }
        Ok(())
    }

    fn map(&mut self) -> Result<()> {
        let mapping = Mapping::create(self.resources.file()?, self.path, true)?;
        mapping.check_range(self.offset, self.payload.len() as u64)?;
        self.resources.set_mapping(mapping);
        Ok(())
    }

    fn map_view(&mut self) -> Result<()> {
        let range = ViewRange::for_request(self.offset, self.payload.len() as u64)?;
        let view = View::map_mut(self.resources.file()?, &range, self.path)?;
        self.resources.set_view(view);
        self.range = Some(range);
        Ok(())
    }

    fn transfer(&mut self) -> Result<()> {
        let range = self
            .range
            .ok_or_else(|| Error::invalid_argument("view range not computed"))?;
        let target = self.resources.view_mut()?.as_mut_slice()?;
        target[range.delta..range.delta + self.payload.len()].copy_from_slice(self.payload);
        Ok(())
    }

    fn flush_view(&mut self) -> Result<()> {
        self.resources
            .view()?
            .flush()
            .map_err(|e| Error::Io {
                message: format!("Failed to flush view of {}: {}", self.path.display(), e),
                os_code: e.os_code(),
            })
    }

    fn flush_file(&mut self) -> Result<()> {
        self.resources
            .file()?
            .sync_all()
            .map_err(|e| Error::from_io(e, self.path))
    }
}

impl IoStep for MmapWriter<'_> {
    fn step(&mut self) -> Result<Progress> {
        match self.stage {
            WriteStage::Open => {
                self.open()?;
                self.stage = WriteStage::Extend;
            }
            WriteStage::Extend => {
                self.extend()?;
                self.stage = WriteStage::Map;
            }
            WriteStage::Map => {
                self.map()?;
                self.stage = WriteStage::View;
            }
            WriteStage::View => {
                self.map_view()?;
                self.stage = WriteStage::Transfer;
            }
            WriteStage::Transfer => {
                self.transfer()?;
                self.stage = WriteStage::FlushView;
            }
            WriteStage::FlushView => {
                self.flush_view()?;
                self.stage = WriteStage::FlushFile;
            }
            WriteStage::FlushFile => {
                self.flush_file()?;
                debug!(
                    "Wrote {} bytes to {} at offset {}",
                    self.payload.len(),
                    self.path.display(),
                    self.offset
                );
                self.resources.release();
                return Ok(Progress::Done);
            }
        }
        Ok(Progress::Pending)
    }

    fn stage(&self) -> &'static str {
        match self.stage {
            WriteStage::Open => "Open",
            WriteStage::Extend => "Extend",
            WriteStage::Map => "Map",
            WriteStage::View => "View",
            WriteStage::Transfer => "Transfer",
            WriteStage::FlushView => "FlushView",
            WriteStage::FlushFile => "FlushFile",
        }
    }
}
