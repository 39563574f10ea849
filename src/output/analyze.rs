use tracing::info;

use super::FrameSink;
use crate::capture::Frame;
use crate::convert::{self, FrameSummary};
use crate::error::SinkError;

/// Logs centered-window statistics for every `every`th frame.
pub struct AnalyzeSink {
    window: u32,
    every: u64,
    last: Option<FrameSummary>,
}

impl AnalyzeSink {
    pub fn new(window: u32, every: u64) -> Self {
        Self {
            window,
            every: every.max(1),
            last: None,
        }
    }

    /// Most recent summary produced by this sink.
    pub fn last(&self) -> Option<&FrameSummary> {
        self.last.as_ref()
    }
}

impl FrameSink for AnalyzeSink {
    fn name(&self) -> &'static str {
        "analyze"
    }

    fn consume(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let meta = &frame.meta;
        if meta.sequence % self.every != 0 {
            return Ok(());
        }
        let summary = convert::summarize(
            &frame.data,
            meta.width,
            meta.height,
            meta.stride,
            meta.format,
            self.window,
        )?;
        info!(
            sequence = meta.sequence,
            bytes = frame.len(),
            expected = meta.expected_size,
            "{}",
            summary
        );
        self.last = Some(summary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use bytes::Bytes;

    use super::*;
    use crate::capture::mock::generate_test_frame;
    use crate::capture::{FrameMetadata, PixelFormat, TestPattern};

    fn frame(sequence: u64) -> Frame {
        let data = generate_test_frame(8, 8, TestPattern::Solid(16, 128, 128));
        Frame {
            meta: Arc::new(FrameMetadata {
                sequence,
                width: 8,
                height: 8,
                stride: 16,
                format: PixelFormat::Yuyv,
                expected_size: data.len(),
                device_timestamp: None,
            }),
            data: Bytes::from(data),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn keeps_the_latest_sampled_summary() {
        let mut sink = AnalyzeSink::new(4, 2);
        assert!(sink.last().is_none());

        sink.consume(&frame(0)).unwrap();
        let y = sink.last().and_then(|s| s.component('Y')).unwrap();
        assert_eq!((y.min, y.max, y.samples), (16, 16, 16));
        assert_eq!(sink.last().unwrap().window, (2, 2, 4, 4));

        // Frame 1 falls between samples and leaves the summary alone
        let mut odd = frame(1);
        odd.data = Bytes::from_static(&[0u8; 3]);
        sink.consume(&odd).unwrap();
        assert_eq!(sink.last().unwrap().window, (2, 2, 4, 4));
    }

    #[test]
    fn short_frames_still_summarize() {
        let mut sink = AnalyzeSink::new(100, 1);
        let mut short = frame(0);
        short.data = short.data.slice(..64);
        sink.consume(&short).unwrap();
        assert!(sink.last().is_some());
    }
}
