use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Owned copy of one dequeued buffer. Never aliases ring memory.
#[derive(Clone)]
pub struct Frame {
    /// Valid byte range copied out of the slot
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// False when the driver filled fewer bytes than the format requires.
    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.meta.expected_size
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("len", &self.data.len())
            .field("expected", &self.meta.expected_size)
            .field("format", &self.meta.format)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    /// Bytes a complete frame occupies for `format`; 0 when variable (MJPEG)
    pub expected_size: usize,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 4:2:2, `Y0 U Y1 V` per pixel pair
    Yuyv,
    Mjpeg,
    Rgb24,
    /// A driver-chosen format this crate does not interpret
    #[serde(skip)]
    Other([u8; 4]),
}

impl PixelFormat {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Yuyv => *b"YUYV",
            Self::Mjpeg => *b"MJPG",
            Self::Rgb24 => *b"RGB3",
            Self::Other(code) => code,
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Self {
        match &code {
            b"YUYV" => Self::Yuyv,
            b"MJPG" => Self::Mjpeg,
            b"RGB3" => Self::Rgb24,
            _ => Self::Other(code),
        }
    }

    /// Bytes per pixel for uncompressed layouts.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::Yuyv => Some(2),
            Self::Rgb24 => Some(3),
            Self::Mjpeg | Self::Other(_) => None,
        }
    }

    /// File extension used for raw dumps.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Yuyv => "yuv",
            Self::Mjpeg => "jpg",
            Self::Rgb24 => "rgb",
            Self::Other(_) => "raw",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        for byte in code {
            let c = if byte.is_ascii_graphic() { byte as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Format the driver actually accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub bytes_per_line: u32,
    /// Driver-reported image size in bytes
    pub size_image: u32,
}

impl AcceptedFormat {
    /// Format with sizes derived from the pixel layout, for drivers that report none.
    pub fn packed(width: u32, height: u32, format: PixelFormat) -> Self {
        let bpp = format.bytes_per_pixel().unwrap_or(0) as u32;
        let bytes_per_line = width.saturating_mul(bpp);
        Self {
            width,
            height,
            format,
            bytes_per_line,
            size_image: bytes_per_line.saturating_mul(height),
        }
    }

    /// Bytes a complete frame occupies. YUYV and RGB24 are derived from
    /// the geometry, using the driver's line pitch when it pads rows; MJPEG
    /// is variable so any length counts as complete.
    pub fn expected_frame_size(&self) -> usize {
        match self.format.bytes_per_pixel() {
            Some(bpp) => {
                let row = (self.width as usize * bpp).max(self.bytes_per_line as usize);
                row * self.height as usize
            }
            None => 0,
        }
    }

    pub fn matches(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}
