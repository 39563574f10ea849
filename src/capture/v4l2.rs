//! V4L2 driver: device handle and format negotiation through the `v4l`
//! crate, buffer ring ioctls and mappings through `nix`.

use std::ffi::c_void;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::format::FieldOrder;
use v4l::memory::Memory;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::driver::{retry_interrupted, Driver, DriverBuffer, SlotMapping};
use super::frame::{AcceptedFormat, PixelFormat};

mod ioctl {
    use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};

    nix::ioctl_readwrite!(reqbufs, b'V', 8, v4l2_requestbuffers);
    nix::ioctl_readwrite!(querybuf, b'V', 9, v4l2_buffer);
    nix::ioctl_readwrite!(qbuf, b'V', 15, v4l2_buffer);
    nix::ioctl_readwrite!(dqbuf, b'V', 17, v4l2_buffer);
    nix::ioctl_write_ptr!(streamon, b'V', 18, libc::c_int);
    nix::ioctl_write_ptr!(streamoff, b'V', 19, libc::c_int);
}

const BUF_TYPE: u32 = Type::VideoCapture as u32;
const MEMORY: u32 = Memory::Mmap as u32;

/// Retry on `EINTR`, hand everything else back as `io::Error`.
fn xioctl(mut op: impl FnMut() -> nix::Result<libc::c_int>) -> Result<(), Errno> {
    loop {
        match op() {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno),
        }
    }
}

fn zeroed_buffer(index: u32) -> v4l2_buffer {
    // SAFETY: v4l2_buffer is a plain C struct; all-zero is its documented initial state.
    let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
    buf.type_ = BUF_TYPE;
    buf.memory = MEMORY;
    buf.index = index;
    buf
}

/// Open V4L2 capture device.
pub struct V4l2Driver {
    device: Option<Device>,
    fd: RawFd,
    identity: String,
}

impl V4l2Driver {
    /// Open the node read-write and non-blocking, and check it can stream video.
    #[instrument]
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "device doesn't support video capture",
            ));
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "device doesn't support streaming i/o",
            ));
        }

        let fd = device.handle().fd();
        Ok(Self {
            device: Some(device),
            fd,
            identity: format!("{} ({})", caps.card, caps.driver),
        })
    }

    fn device(&self) -> io::Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn fd(&self) -> io::Result<BorrowedFd<'_>> {
        self.device()?;
        // SAFETY: the descriptor belongs to `self.device`, which outlives the borrow.
        Ok(unsafe { BorrowedFd::borrow_raw(self.fd) })
    }

    fn stream_toggle(
        &mut self,
        op: unsafe fn(libc::c_int, *const libc::c_int) -> nix::Result<libc::c_int>,
    ) -> io::Result<()> {
        let fd = self.fd()?;
        let kind = BUF_TYPE as libc::c_int;
        // SAFETY: `kind` outlives the call and matches the ioctl's argument type.
        xioctl(|| unsafe { op(fd.as_raw_fd(), &kind) })?;
        Ok(())
    }
}

impl Driver for V4l2Driver {
    type Mapping = V4l2Mapping;

    fn describe(&self) -> String {
        self.identity.clone()
    }

    fn set_format(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> io::Result<AcceptedFormat> {
        let device = self.device()?;
        let mut fmt = retry_interrupted(|| device.format())?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = FourCC::new(&format.fourcc());
        fmt.field_order = FieldOrder::Any;

        let accepted = retry_interrupted(|| device.set_format(&fmt))?;
        Ok(AcceptedFormat {
            width: accepted.width,
            height: accepted.height,
            format: PixelFormat::from_fourcc(accepted.fourcc.repr),
            bytes_per_line: accepted.stride,
            size_image: accepted.size,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let fd = self.fd()?.as_raw_fd();
        // SAFETY: zero is the documented initial state of the request.
        let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = BUF_TYPE;
        req.memory = MEMORY;

        // SAFETY: `req` is a valid, exclusively borrowed request struct.
        xioctl(|| unsafe { ioctl::reqbufs(fd, &mut req) })?;
        debug!(requested = count, granted = req.count, "buffers requested");
        Ok(req.count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<V4l2Mapping> {
        let fd = self.fd()?;
        let mut buf = zeroed_buffer(index);
        // SAFETY: `buf` is a valid, exclusively borrowed buffer struct.
        xioctl(|| unsafe { ioctl::querybuf(fd.as_raw_fd(), &mut buf) })?;

        let len = NonZeroUsize::new(buf.length as usize).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "driver reported empty buffer")
        })?;
        // SAFETY: for MMAP buffers QUERYBUF fills the `offset` member of the union.
        let offset = unsafe { buf.m.offset };

        // SAFETY: offset and length come straight from QUERYBUF for this fd.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        }?;

        Ok(V4l2Mapping {
            ptr,
            len: len.get(),
        })
    }

    fn unmap_buffer(&mut self, mapping: V4l2Mapping) -> io::Result<()> {
        // SAFETY: the mapping was produced by `map_buffer` and is consumed here.
        unsafe { munmap(mapping.ptr, mapping.len) }?;
        Ok(())
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        let fd = self.fd()?.as_raw_fd();
        let mut buf = zeroed_buffer(index);
        // SAFETY: `buf` is a valid, exclusively borrowed buffer struct.
        xioctl(|| unsafe { ioctl::qbuf(fd, &mut buf) })?;
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<Option<DriverBuffer>> {
        let fd = self.fd()?.as_raw_fd();
        let mut buf = zeroed_buffer(0);
        // SAFETY: `buf` is a valid, exclusively borrowed buffer struct.
        match xioctl(|| unsafe { ioctl::dqbuf(fd, &mut buf) }) {
            Ok(()) => {}
            Err(Errno::EAGAIN) => return Ok(None),
            Err(errno) => return Err(errno.into()),
        }

        let secs = buf.timestamp.tv_sec.max(0) as u64;
        let micros = buf.timestamp.tv_usec.max(0) as u64;
        let timestamp = (secs != 0 || micros != 0)
            .then(|| Duration::from_secs(secs) + Duration::from_micros(micros));

        Ok(Some(DriverBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp,
        }))
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.stream_toggle(ioctl::streamon)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.stream_toggle(ioctl::streamoff)
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool> {
        let fd = self.fd()?;
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(ready) => Ok(ready > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(errno) => Err(errno.into()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.device.take().is_some() {
            debug!(fd = self.fd, "device closed");
        }
        Ok(())
    }
}

/// One buffer of kernel memory mapped into this process.
pub struct V4l2Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; the ring serializes access.
unsafe impl Send for V4l2Mapping {}

impl SlotMapping for V4l2Mapping {
    fn len(&self) -> usize {
        self.len
    }

    fn copy_prefix(&self, len: usize) -> Bytes {
        let len = len.min(self.len);
        // SAFETY: `ptr..ptr+len` lies inside a live mapping, and the ring only
        // calls this while the slot is user-owned, so the kernel is not writing.
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), len) };
        Bytes::copy_from_slice(bytes)
    }
}
