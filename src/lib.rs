//! An embeddable, append-only, memory-mapped message log for a single
//! process with many concurrent producers and consumers.
//!
//! # Design
//!
//! Four pieces, leaves first: [`frame`] defines the 12-byte wire header
//! every record is wrapped in; [`segment`] is a fixed-size mmap'd
//! data+index file pair supporting lock-free concurrent appends;
//! [`index`] is a monotonic, append-only B+ tree mapping a segment's
//! base offset to its handle; [`Log`] stitches segments together,
//! rolling over on end-of-segment and rebuilding from directory
//! contents on open.
//!
//! # Example
//!
//! ```no_run
//! use mlog::{Log, OpenFlags, DEFAULT_SEGMENT_SIZE};
//!
//! let log = Log::open("/tmp/mlog-example", DEFAULT_SEGMENT_SIZE, OpenFlags::ReadDirty)?;
//! log.write(b"hello")?;
//! let frame = log.read(0)?;
//! assert_eq!(frame.payload(), b"hello");
//! # Ok::<(), mlog::Error>(())
//! ```

pub mod error;
pub mod frame;
pub mod index;
pub mod log;
pub mod mmap;
pub mod segment;
mod util;

pub use error::{Error, Result};
pub use log::{Log, LogFrame, DEFAULT_SEGMENT_SIZE};
pub use segment::OpenFlags;
