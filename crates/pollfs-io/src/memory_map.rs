//! Memory-mapping plumbing shared by the mmap engines
//!
//! Views must start on a multiple of the system allocation granularity, so a
//! request at an arbitrary offset maps a slightly larger window starting at the
//! aligned offset below it and addresses the caller's bytes at `delta` inside it.

use memmap2::{Mmap, MmapMut, MmapOptions};
use once_cell::sync::OnceCell;
use pollfs_types::{Error, Result};
use std::fs::File;
use std::path::Path;
use tracing::{debug, trace};

static GRANULARITY: OnceCell<u64> = OnceCell::new();

/// Granularity that view offsets must be aligned to
///
/// Queried from the OS once and cached.
pub fn allocation_granularity() -> u64 {
    *GRANULARITY.get_or_init(|| {
        let granularity = query_granularity();
        debug!("System allocation granularity: {} bytes", granularity);
        granularity
    })
}

#[cfg(unix)]
fn query_granularity() -> u64 {
    // SAFETY: sysconf has no preconditions and only reads system configuration
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        page_size as u64
    } else {
        4096
    }
}

#[cfg(windows)]
fn query_granularity() -> u64 {
    use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    let mut info = SYSTEM_INFO::default();
    // SAFETY: GetSystemInfo fills the provided, properly sized struct and cannot fail
    unsafe { GetSystemInfo(&mut info) };
    match u64::from(info.dwAllocationGranularity) {
        0 => 64 * 1024,
        granularity => granularity,
    }
}

#[cfg(not(any(unix, windows)))]
fn query_granularity() -> u64 {
    4096
}

/// Placement of a view covering `byte_count` bytes at `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewRange {
    /// Largest multiple of the granularity not above the requested offset
    pub aligned_offset: u64,
    /// Requested offset minus aligned offset
    pub delta: usize,
    /// Bytes to map: byte count plus delta
    pub view_len: usize,
}

impl ViewRange {
    /// Compute the view for `byte_count` bytes at `offset`
    pub fn new(offset: u64, byte_count: u64, granularity: u64) -> Result<Self> {
        if granularity == 0 {
            return Err(Error::invalid_argument("allocation granularity must be nonzero"));
        }
        let aligned_offset = offset / granularity * granularity;
        let delta = offset - aligned_offset;
        let view_len = byte_count
            .checked_add(delta)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "{} bytes at offset {} do not fit in the address space",
                    byte_count, offset
                ))
            })?;

        Ok(Self {
            aligned_offset,
            delta: delta as usize,
            view_len,
        })
    }

    /// Compute the view using the system granularity
    pub fn for_request(offset: u64, byte_count: u64) -> Result<Self> {
        Self::new(offset, byte_count, allocation_granularity())
    }
}

/// Size snapshot taken when the mapping stage runs
///
/// Every view is checked against this length before it is mapped, so a view
/// never extends past the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Length of the mapped file
    pub len: u64,
    /// Whether views may be written
    pub writable: bool,
}

impl Mapping {
    /// Capture the current size of `file`
    pub fn create(file: &File, path: &Path, writable: bool) -> Result<Self> {
        let len = file.metadata().map_err(|e| Error::from_io(e, path))?.len();
        trace!("Mapping {} ({} bytes, writable: {})", path.display(), len, writable);
        Ok(Self { len, writable })
    }

    /// Fail unless `byte_count` bytes at `offset` lie inside the mapping
    pub fn check_range(&self, offset: u64, byte_count: u64) -> Result<()> {
        check_range(self.len, offset, byte_count)
    }
}

/// Fail with [`Error::ExactBytes`] unless `byte_count` bytes at `offset` fit in `len`
pub fn check_range(len: u64, offset: u64, byte_count: u64) -> Result<()> {
    let end = offset.checked_add(byte_count);
    if end.map_or(true, |end| end > len) {
        return Err(Error::ExactBytes {
            requested: byte_count,
            available: len.saturating_sub(offset),
        });
    }
    Ok(())
}

/// A mapped view
#[derive(Debug)]
pub enum View {
    /// Read-only view
    Read(Mmap),
    /// Read-write view
    Write(MmapMut),
}

impl View {
    /// Map a read-only view
    pub fn map(file: &File, range: &ViewRange, path: &Path) -> Result<Self> {
        // SAFETY: the range was checked against the file length, so the view never
        // covers bytes past EOF. Concurrent truncation by another process is outside
        // the contract of the engines.
        let mmap = unsafe {
            MmapOptions::new()
                .offset(range.aligned_offset)
                .len(range.view_len)
                .map(file)
                .map_err(|e| Error::from_io(e, path))?
        };
        Ok(Self::Read(mmap))
    }

    /// Map a read-write view
    pub fn map_mut(file: &File, range: &ViewRange, path: &Path) -> Result<Self> {
        // SAFETY: as for `map`; the file was extended to cover the range beforehand
        let mmap = unsafe {
            MmapOptions::new()
                .offset(range.aligned_offset)
                .len(range.view_len)
                .map_mut(file)
                .map_err(|e| Error::from_io(e, path))?
        };
        Ok(Self::Write(mmap))
    }

    /// Bytes of the view
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Read(mmap) => &mmap[..],
            Self::Write(mmap) => &mmap[..],
        }
    }

    /// Writable bytes of the view
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        match self {
            Self::Read(_) => Err(Error::invalid_argument("view is read-only")),
            Self::Write(mmap) => Ok(&mut mmap[..]),
        }
    }

    /// Synchronously flush dirty pages of the view
    pub fn flush(&self) -> Result<()> {
        match self {
            Self::Read(_) => Ok(()),
            Self::Write(mmap) => mmap.flush().map_err(Error::from),
        }
    }
}

/// Scope-guarded resources of one mmap operation
///
/// Whatever has been acquired is released when the guard drops: the view first,
/// then the mapping, then the file.
#[derive(Debug, Default)]
pub struct MappedResources {
    view: Option<View>,
    mapping: Option<Mapping>,
    file: Option<File>,
}

impl MappedResources {
    /// Empty guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of the opened file
    pub fn set_file(&mut self, file: File) {
        self.file = Some(file);
    }

    /// The opened file
    pub fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("file is not open"))
    }

    /// Record the mapping
    pub fn set_mapping(&mut self, mapping: Mapping) {
        self.mapping = Some(mapping);
    }

    /// The mapping
    pub fn mapping(&self) -> Result<&Mapping> {
        self.mapping
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("file is not mapped"))
    }

    /// Take ownership of a view
    pub fn set_view(&mut self, view: View) {
        self.view = Some(view);
    }

    /// The mapped view
    pub fn view(&self) -> Result<&View> {
        self.view
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("view is not mapped"))
    }

    /// The mapped view, mutably
    pub fn view_mut(&mut self) -> Result<&mut View> {
        self.view
            .as_mut()
            .ok_or_else(|| Error::invalid_argument("view is not mapped"))
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.view.is_none() && self.mapping.is_none() && self.file.is_none()
    }

    /// Release everything held, in reverse acquisition order
    pub fn release(&mut self) {
        if self.is_empty() {
            return;
        }
        drop(self.view.take());
        drop(self.mapping.take());
        drop(self.file.take());
        trace!("Released mapped resources");
    }
}

impl Drop for MappedResources {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    proptest! {
        #[test]
        fn test_view_range_alignment_law(
            offset in 0u64..(1 << 40),
            count in 0u64..(1 << 20),
            shift in 9u32..17,
        ) {
            let granularity = 1u64 << shift;
            let range = ViewRange::new(offset, count, granularity).unwrap();

            prop_assert_eq!(range.aligned_offset % granularity, 0);
            prop_assert!(range.aligned_offset <= offset);
            prop_assert!(offset - range.aligned_offset < granularity);
            prop_assert_eq!(range.delta as u64, offset - range.aligned_offset);
            prop_assert_eq!(range.view_len as u64, count + range.delta as u64);
        }
    }

    #[test]
    fn test_granularity_is_power_of_two() {
        let granularity = allocation_granularity();
        assert!(granularity >= 4096);
        assert!(granularity.is_power_of_two());
        assert_eq!(granularity, allocation_granularity());
    }

    #[test]
    fn test_range_check() {
        let mapping = Mapping {
            len: 16,
            writable: false,
        };
        assert!(mapping.check_range(0, 16).is_ok());
        assert!(mapping.check_range(16, 0).is_ok());
        assert_eq!(
            mapping.check_range(10, 10).unwrap_err(),
            Error::ExactBytes {
                requested: 10,
                available: 6
            }
        );
        assert_eq!(
            mapping.check_range(40, 1).unwrap_err(),
            Error::ExactBytes {
                requested: 1,
                available: 0
            }
        );
        assert!(mapping.check_range(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_map_view_at_unaligned_offset() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        temp_file.write_all(&data).unwrap();
        temp_file.flush().unwrap();

        let file = File::open(temp_file.path()).unwrap();
        let range = ViewRange::for_request(5_000, 100).unwrap();
        let view = View::map(&file, &range, temp_file.path()).unwrap();

        assert_eq!(view.as_slice().len(), range.view_len);
        assert_eq!(
            &view.as_slice()[range.delta..range.delta + 100],
            &data[5_000..5_100]
        );
    }

    #[test]
    fn test_read_view_rejects_writes() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"abc").unwrap();
        let file = File::open(temp_file.path()).unwrap();
        let range = ViewRange::for_request(0, 3).unwrap();
        let mut view = View::map(&file, &range, temp_file.path()).unwrap();
        assert!(view.as_mut_slice().is_err());
        assert!(view.flush().is_ok());
    }

    #[test]
    fn test_resources_release_in_order() {
        let temp_file = NamedTempFile::new().unwrap();
        let file = File::open(temp_file.path()).unwrap();

        let mut resources = MappedResources::new();
        assert!(resources.is_empty());
        assert!(resources.file().is_err());

        let mapping = Mapping::create(&file, temp_file.path(), false).unwrap();
        resources.set_file(file);
        resources.set_mapping(mapping);
        assert_eq!(resources.mapping().unwrap().len, 0);

        resources.release();
        assert!(resources.is_empty());
        assert!(resources.view().is_err());
    }
}
