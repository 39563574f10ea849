//! Error taxonomy for the capture path.
//!
//! Transient conditions (`WouldBlock`, `EINTR`) never show up here: the
//! driver retries interrupted calls and the ring reports "not ready" as a
//! regular value. Diagnostics (format adjusted, incomplete frame) are logged,
//! not returned. Everything below aborts the affected session.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::capture::ring::SlotState;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device {path} unavailable: {source}")]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("format negotiation failed: {0}")]
    FormatRejected(#[source] io::Error),

    #[error("buffer request failed: {0}")]
    BufferRequest(#[source] io::Error),

    #[error("insufficient buffer memory: requested {requested}, granted {granted}")]
    InsufficientBuffers { requested: u32, granted: u32 },

    #[error("failed to map buffer {index}: {source}")]
    MappingFailed {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to unmap buffer {index}: {source}")]
    UnmapFailed {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("stream on failed: {0}")]
    StreamOn(#[source] io::Error),

    #[error("stream off failed: {0}")]
    StreamOff(#[source] io::Error),

    #[error("driver fault: {0}")]
    DriverFault(#[source] io::Error),

    #[error("buffer {index} is {state:?}, operation needs the other owner")]
    OwnershipViolation { index: u32, state: SlotState },

    #[error("driver returned buffer index {index} outside ring of {len}")]
    UnknownSlot { index: u32, len: usize },

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("frame channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Pixel conversion failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("packed 4:2:2 needs an even width, got {0}")]
    OddWidth(u32),

    #[error("conversion from {0} is not supported")]
    Unsupported(crate::capture::PixelFormat),

    #[error("sample window contains no pixels")]
    EmptySample,
}

/// Consumer-side failures; local to the consumer that hit them.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Convert(#[from] ConvertError),
}
