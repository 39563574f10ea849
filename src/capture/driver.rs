//! Kernel seam: every ioctl the capture path needs, behind one trait.

use std::io;
use std::time::Duration;

use bytes::Bytes;

use super::frame::{AcceptedFormat, PixelFormat};

/// A buffer returned by the driver's dequeue primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Option<Duration>,
}

/// Memory of one mapped buffer.
///
/// Implementations only ever get read through `copy_prefix`, and the ring
/// calls it only while the slot is user-owned.
pub trait SlotMapping: Send {
    /// Length of the mapping as reported by the driver.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the first `len` bytes (clamped to the mapping) into an owned buffer.
    fn copy_prefix(&self, len: usize) -> Bytes;
}

/// Operations a capture device has to support.
///
/// Methods return plain `io::Result`; the ring and session translate
/// failures into [`crate::CaptureError`]. Implementations retry `EINTR`
/// themselves.
pub trait Driver: Send {
    type Mapping: SlotMapping;

    /// Human readable identity (card and driver name).
    fn describe(&self) -> String;

    /// Issue a format-set request with field order "any" and return what
    /// the driver accepted.
    fn set_format(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> io::Result<AcceptedFormat>;

    /// Request `count` memory-mapped buffers; returns the granted count.
    /// A count of 0 frees previously granted buffers.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    fn map_buffer(&mut self, index: u32) -> io::Result<Self::Mapping>;

    fn unmap_buffer(&mut self, mapping: Self::Mapping) -> io::Result<()>;

    fn queue(&mut self, index: u32) -> io::Result<()>;

    /// `Ok(None)` when no filled buffer is ready.
    fn dequeue(&mut self) -> io::Result<Option<DriverBuffer>>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    /// Wait up to `timeout` for a filled buffer. Returns whether one is ready.
    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool>;

    fn close(&mut self) -> io::Result<()>;
}

/// Run `op` until it stops failing with `EINTR`.
pub(crate) fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
