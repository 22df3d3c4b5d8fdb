//! Poll-driven file I/O engines for pollfs
//!
//! Every operation is a small state machine behind an [`AsyncOperation`] handle.
//! A driver advances it one stage per poll until it is `Completed` or `Failed`:
//!
//! - **Memory mapping**: [`MmapReader`] and [`MmapWriter`] map aligned views
//! - **Positional I/O**: [`PositionalEngine`] serves buffered and direct transfers
//! - **Ring**: [`RingContext`] submits to the kernel queue and routes completions
//! - **Drivers**: [`await_op`] and [`await_all`], or `.await` from any async runtime
//!
//! # Examples
//!
//! ```rust,no_run
//! use pollfs_io::{await_op, FileEngine, MmapEngine};
//! use pollfs_types::{AsyncStatus, ReadRequest};
//!
//! let mut buffer = [0u8; 7];
//! let mut op = MmapEngine.read(ReadRequest::new("notes.txt", &mut buffer).with_offset(6));
//! assert_eq!(await_op(&mut op), AsyncStatus::Completed);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod engine;
pub mod executor;
pub mod memory_map;
pub mod operation;
pub mod positional;
pub mod reader;
pub mod ring;
pub mod writer;

#[cfg(test)]
mod property_tests;

pub use buffer::{PoolStats, PooledAllocator, SystemAllocator};
pub use engine::{FileEngine, MmapEngine};
pub use executor::{await_all, await_op, Executor, ExecutorStats, SpinPolicy};
pub use memory_map::{allocation_granularity, MappedResources, ViewRange};
pub use operation::AsyncOperation;
pub use positional::PositionalEngine;
pub use reader::MmapReader;
pub use ring::{Completion, RingContext, RingEngine, RingStats};
pub use writer::MmapWriter;
