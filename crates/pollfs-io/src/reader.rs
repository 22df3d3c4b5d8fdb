//! Memory-mapped read engine
//!
//! One stage per poll: open the file, create the mapping and check the requested
//! range against it, map an aligned view, copy the bytes out.

use crate::memory_map::{MappedResources, Mapping, View, ViewRange};
use crate::AsyncOperation;
use pollfs_types::{Error, FileMode, IoStep, Progress, ReadRequest, Result};
use std::fs::File;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStage {
    Open,
    Map,
    View,
    Transfer,
}

/// State of one memory-mapped read
#[derive(Debug)]
pub struct MmapReader<'a> {
    path: &'a Path,
    buffer: &'a mut [u8],
    byte_count: u64,
    offset: u64,
    stage: ReadStage,
    range: Option<ViewRange>,
    resources: MappedResources,
}

impl<'a> MmapReader<'a> {
    /// Build the state for a validated request
    pub fn new(request: ReadRequest<'a>) -> Self {
        Self {
            path: request.path,
            buffer: request.buffer,
            byte_count: request.byte_count,
            offset: request.offset,
            stage: ReadStage::Open,
            range: None,
            resources: MappedResources::new(),
        }
    }

    /// Start a read, validating the request first
    pub fn start(request: ReadRequest<'a>) -> AsyncOperation<'a> {
        let validation = request.validate();
        let byte_count = request.byte_count;
        AsyncOperation::start(FileMode::Mmap, validation, byte_count, || {
            Self::new(request)
        })
    }

    fn open(&mut self) -> Result<()> {
        let file = File::open(self.path).map_err(|e| Error::from_io(e, self.path))?;
        debug!("Opened {} for mapped read", self.path.display());
        self.resources.set_file(file);
        Ok(())
    }

    fn map(&mut self) -> Result<()> {
        let mapping = Mapping::create(self.resources.file()?, self.path, false)?;
        mapping.check_range(self.offset, self.byte_count)?;
        self.resources.set_mapping(mapping);
        Ok(())
    }

    fn map_view(&mut self) -> Result<()> {
        let range = ViewRange::for_request(self.offset, self.byte_count)?;
        let view = View::map(self.resources.file()?, &range, self.path)?;
        debug!(
            "Mapped {} bytes of {} at aligned offset {}",
            range.view_len,
            self.path.display(),
            range.aligned_offset
        );
        self.resources.set_view(view);
        self.range = Some(range);
        Ok(())
    }

    fn transfer(&mut self) -> Result<()> {
        let range = self
            .range
            .ok_or_else(|| Error::invalid_argument("view range not computed"))?;
        let count = self.byte_count as usize;
        let source = &self.resources.view()?.as_slice()[range.delta..range.delta + count];
        self.buffer[..count].copy_from_slice(source);
        Ok(())
    }
}

impl IoStep for MmapReader<'_> {
    fn step(&mut self) -> Result<Progress> {
        match self.stage {
            ReadStage::Open => {
                self.open()?;
                self.stage = ReadStage::Map;
            }
            ReadStage::Map => {
                self.map()?;
                self.stage = ReadStage::View;
            }
            ReadStage::View => {
                self.map_view()?;
                self.stage = ReadStage::Transfer;
            }
            ReadStage::Transfer => {
                self.transfer()?;
                self.resources.release();
                return Ok(Progress::Done);
            }
        }
        Ok(Progress::Pending)
    }

    fn stage(&self) -> &'static str {
        match self.stage {
            ReadStage::Open => "Open",
            ReadStage::Map => "Map",
            ReadStage::View => "View",
            ReadStage::Transfer => "Transfer",
        }
    }
}
