//! Property-based tests for pollfs-io engines

use crate::buffer::{PooledAllocator, SystemAllocator};
use crate::engine::{FileEngine, MmapEngine};
use crate::executor::{await_all, await_op};
use crate::positional::PositionalEngine;
use pollfs_types::{
    Alignment, Allocator, AppendRequest, AsyncStatus, ReadRequest, WriteRequest,
};
use proptest::prelude::*;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

/// Engines that work on every platform
fn engine_strategy() -> impl Strategy<Value = usize> {
    0usize..3
}

fn engine(index: usize) -> Box<dyn FileEngine> {
    match index {
        0 => Box::new(MmapEngine),
        1 => Box::new(PositionalEngine::standard()),
        _ => Box::new(PositionalEngine::direct(
            Arc::new(PooledAllocator::new(256 * 1024, 4)),
            Alignment::new(512).unwrap(),
        )),
    }
}

/// File content plus a valid range inside it
fn content_and_range() -> impl Strategy<Value = (Vec<u8>, u64, u64)> {
    prop::collection::vec(any::<u8>(), 1..20_000).prop_flat_map(|content| {
        let len = content.len() as u64;
        (Just(content), 0..len).prop_flat_map(move |(content, offset)| {
            (Just(content), Just(offset), 1..=len - offset)
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Reading any in-bounds range returns exactly the file's bytes
    #[test]
    fn test_read_returns_file_bytes(
        index in engine_strategy(),
        (content, offset, count) in content_and_range(),
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, &content).unwrap();

        let mut buffer = vec![0u8; count as usize];
        let mut op = engine(index).read(
            ReadRequest::new(&path, &mut buffer).with_offset(offset),
        );
        prop_assert_eq!(await_op(&mut op), AsyncStatus::Completed);
        drop(op);
        prop_assert_eq!(&buffer[..], &content[offset as usize..(offset + count) as usize]);
    }

    /// Writing then reading the same range round-trips, and the size is max(old, end)
    #[test]
    fn test_write_then_read_round_trip(
        index in engine_strategy(),
        initial in prop::collection::vec(any::<u8>(), 0..8_192),
        payload in prop::collection::vec(any::<u8>(), 1..8_192),
        offset in 0u64..12_288,
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, &initial).unwrap();
        let engine = engine(index);

        let mut op = engine.write(WriteRequest::new(&path, &payload).with_offset(offset));
        prop_assert_eq!(await_op(&mut op), AsyncStatus::Completed);

        let end = offset + payload.len() as u64;
        let size = fs::metadata(&path).unwrap().len();
        prop_assert_eq!(size, (initial.len() as u64).max(end));

        let mut buffer = vec![0u8; payload.len()];
        let mut op = engine.read(ReadRequest::new(&path, &mut buffer).with_offset(offset));
        prop_assert_eq!(await_op(&mut op), AsyncStatus::Completed);
        drop(op);
        prop_assert_eq!(&buffer, &payload);

        // Bytes outside the written range are untouched
        let content = fs::read(&path).unwrap();
        let keep = (offset as usize).min(initial.len());
        prop_assert_eq!(&content[..keep], &initial[..keep]);
    }

    /// Appends grow the file by exactly the appended bytes
    #[test]
    fn test_append_grows_by_payload(
        index in engine_strategy(),
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..600), 1..5),
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("append.bin");
        let engine = engine(index);

        let mut expected = Vec::new();
        for chunk in &chunks {
            let mut op = engine.append(AppendRequest::new(&path, chunk));
            prop_assert_eq!(await_op(&mut op), AsyncStatus::Completed);
            expected.extend_from_slice(chunk);
            prop_assert_eq!(fs::metadata(&path).unwrap().len(), expected.len() as u64);
        }
        prop_assert_eq!(fs::read(&path).unwrap(), expected);
    }

    /// await_all leaves nothing pending regardless of the operation mix
    #[test]
    fn test_await_all_terminates(sizes in prop::collection::vec(0usize..2_048, 1..8)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source.bin");
        fs::write(&path, vec![1u8; 1_024]).unwrap();

        let mut buffers: Vec<Vec<u8>> = sizes.iter().map(|size| vec![0u8; *size]).collect();
        let mut ops: Vec<_> = buffers
            .iter_mut()
            .enumerate()
            .map(|(i, buffer)| engine(i % 3).read(ReadRequest::new(&path, buffer)))
            .collect();
        await_all(&mut ops);

        for (op, size) in ops.iter().zip(&sizes) {
            let expected = if *size <= 1_024 {
                AsyncStatus::Completed
            } else {
                AsyncStatus::Failed
            };
            prop_assert_eq!(op.status(), expected);
        }
    }

    /// Aligned allocations honour any power-of-two alignment
    #[test]
    fn test_aligned_allocation(size in 0usize..10_000, shift in 0u32..13) {
        let alignment = 1usize << shift;
        let allocators: [Box<dyn Allocator>; 2] = [
            Box::new(SystemAllocator),
            Box::new(PooledAllocator::new(4_096, 2)),
        ];
        for allocator in allocators {
            let block = allocator.allocate_aligned(size, alignment).unwrap();
            prop_assert_eq!(block.len(), size);
            prop_assert_eq!(block.as_ptr() as usize % alignment, 0);
            allocator.free(block);
        }
    }
}
