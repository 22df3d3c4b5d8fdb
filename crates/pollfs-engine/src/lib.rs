//! Mode selection, file I/O facade and host services for pollfs
//!
//! This crate ties the engines from `pollfs-io` together behind [`FileIo`]:
//!
//! - **Mode selection**: [`AdaptiveSelector`] profiles each path and picks a strategy
//! - **Facade**: [`FileIo`] routes reads, writes and appends to the chosen engine
//! - **Locking**: [`LockFileService`] guards files with `<path>.lock` sidecars
//! - **Change notification**: [`PollingWatcher`] reports created, modified and removed files
//! - **Logging**: [`init_logging`] installs a `tracing` subscriber from configuration
//!
//! # Examples
//!
//! ```rust,no_run
//! use pollfs_engine::FileIo;
//! use pollfs_io::await_op;
//! use pollfs_types::{AsyncStatus, ReadRequest};
//!
//! # fn example() -> pollfs_types::Result<()> {
//! let io = FileIo::new()?;
//! let mut buffer = [0u8; 7];
//! let mut op = io.read(ReadRequest::new("notes.txt", &mut buffer).with_offset(6));
//! assert_eq!(await_op(&mut op), AsyncStatus::Completed);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod lock;
pub mod logging;
pub mod selector;
pub mod watch;

pub use engine::{FileIo, FileIoBuilder};
pub use lock::LockFileService;
pub use logging::init_logging;
pub use selector::{AdaptiveSelector, ExplicitSelector, ModeSelector, SelectionStats};
pub use watch::PollingWatcher;
