//! Binary portable pixmap output for converted frames.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::FrameSink;
use crate::capture::Frame;
use crate::convert;
use crate::error::SinkError;

/// Write `rgb` as a `P6` image: `P6\n<w> <h>\n255\n` then the raw bytes.
pub fn write_ppm<W: Write>(mut out: W, width: u32, height: u32, rgb: &[u8]) -> io::Result<()> {
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("expected {expected} rgb bytes, got {}", rgb.len()),
        ));
    }
    write!(out, "P6\n{width} {height}\n255\n")?;
    out.write_all(rgb)?;
    out.flush()
}

/// Converts complete frames to RGB and saves them as `frame_<seq>.ppm`.
pub struct PpmSink {
    dir: PathBuf,
}

impl PpmSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("frame_{sequence}.ppm"))
    }
}

fn save(path: &Path, width: u32, height: u32, rgb: &[u8]) -> io::Result<()> {
    let file = File::create(path)?;
    write_ppm(BufWriter::new(file), width, height, rgb)
}

impl FrameSink for PpmSink {
    fn name(&self) -> &'static str {
        "ppm"
    }

    fn consume(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let meta = &frame.meta;
        if !frame.is_complete() {
            warn!(
                "Frame {} has incorrect size ({}), expected {}. Skip RGB conversion.",
                meta.sequence,
                frame.len(),
                meta.expected_size
            );
            return Ok(());
        }

        let rgb = convert::to_rgb(
            &frame.data,
            meta.width,
            meta.height,
            meta.stride,
            meta.format,
        )?;
        let path = self.path_for(meta.sequence);
        save(&path, meta.width, meta.height, &rgb).map_err(|source| SinkError::Write {
            path: path.clone(),
            source,
        })?;

        debug!(
            "Saved RGB image to {} ({}x{})",
            path.display(),
            meta.width,
            meta.height
        );
        Ok(())
    }
}
