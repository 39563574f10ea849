//! Raw dumps in the source pixel encoding.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use super::FrameSink;
use crate::capture::Frame;
use crate::error::SinkError;

/// Writes each frame's bytes untouched to `frame_<w>x<h>_<seq>.<ext>`,
/// partial frames included.
pub struct RawSink {
    dir: PathBuf,
}

impl RawSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, frame: &Frame) -> PathBuf {
        let meta = &frame.meta;
        self.dir.join(format!(
            "frame_{}x{}_{}.{}",
            meta.width,
            meta.height,
            meta.sequence,
            meta.format.extension()
        ))
    }
}

impl FrameSink for RawSink {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn consume(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let path = self.path_for(frame);
        fs::write(&path, &frame.data).map_err(|source| SinkError::Write {
            path: path.clone(),
            source,
        })?;
        debug!("Saved frame to {} ({} bytes)", path.display(), frame.len());
        Ok(())
    }
}
