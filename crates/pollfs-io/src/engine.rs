//! Strategy-level engine interface

use crate::reader::MmapReader;
use crate::writer::MmapWriter;
use crate::AsyncOperation;
use pollfs_types::{AppendRequest, FileMode, ReadRequest, WriteRequest};
use std::fmt;

/// A strategy able to start read and write operations
pub trait FileEngine: Send + Sync + fmt::Debug {
    /// Strategy implemented by this engine
    fn mode(&self) -> FileMode;

    /// Whether operations can succeed on this platform
    fn is_available(&self) -> bool {
        true
    }

    /// Start a read
    fn read<'a>(&self, request: ReadRequest<'a>) -> AsyncOperation<'a>;

    /// Start a positioned write
    fn write<'a>(&self, request: WriteRequest<'a>) -> AsyncOperation<'a>;

    /// Start an append
    fn append<'a>(&self, request: AppendRequest<'a>) -> AsyncOperation<'a> {
        self.write(request.into())
    }
}

/// Memory-mapped strategy
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapEngine;

impl FileEngine for MmapEngine {
    fn mode(&self) -> FileMode {
        FileMode::Mmap
    }

    fn read<'a>(&self, request: ReadRequest<'a>) -> AsyncOperation<'a> {
        MmapReader::start(request)
    }

    fn write<'a>(&self, request: WriteRequest<'a>) -> AsyncOperation<'a> {
        MmapWriter::start(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::await_all;
    use pollfs_types::AsyncStatus;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_mmap_engine_append_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");
        fs::write(&path, b"head|").unwrap();

        let engine = MmapEngine;
        assert_eq!(engine.mode(), FileMode::Mmap);
        assert!(engine.is_available());

        let mut ops = vec![engine.append(AppendRequest::new(&path, b"tail"))];
        await_all(&mut ops);
        assert_eq!(ops[0].status(), AsyncStatus::Completed);
        drop(ops);

        let mut buffer = [0u8; 9];
        let mut ops = vec![engine.read(ReadRequest::new(&path, &mut buffer))];
        await_all(&mut ops);
        assert_eq!(ops[0].status(), AsyncStatus::Completed);
        drop(ops);
        assert_eq!(&buffer, b"head|tail");
    }
}
