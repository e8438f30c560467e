//! Queue bytes for protocol parsers without copying them.
//!
//! [ByteBuffer] is an ordered byte queue stored as a chain of extents. Bytes
//! are appended at the back (copied into an open extent, or linked in without
//! a copy when handed over as [bytes::Bytes]) and consumed from the front.
//! Parsers can traverse the queued extents in place through [ByteBuffer::foreach]
//! or a [ScatterGather] view, and only pay for a copy when they actually
//! remove bytes.
//!
//! # Status
//!
//! `libight-buffer` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

mod buffer;
pub use buffer::{ByteBuffer, ReadLine, Reservation, EXTENT_SIZE};
mod view;
pub use view::{ScatterGather, ScatterGatherMut};

use thiserror::Error;

/// Errors that can occur when interacting with a [ByteBuffer].
#[derive(Error, Debug)]
pub enum Error {
    #[error("allocation failed: {0} bytes")]
    AllocationFailed(usize),
    #[error("index out of range: {index} >= {count}")]
    OutOfRange { index: usize, count: usize },
    #[error("drain failed: requested {requested} bytes, {available} available")]
    DrainFailed { requested: usize, available: usize },
    #[error("commit exceeds reservation: requested {requested} bytes, {reserved} reserved")]
    CommitTooLarge { requested: usize, reserved: usize },
    #[error("reservation short: requested {requested} bytes, filled {filled}")]
    ReservationShort { requested: usize, filled: usize },
    #[error("random source failed: {0}")]
    RandomFailed(rand::Error),
    #[error("invalid utf-8")]
    InvalidUtf8,
}
