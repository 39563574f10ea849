//! Consumers draining the frame channel.

pub mod analyze;
pub mod ppm;
pub mod raw;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::capture::{Frame, PixelFormat};
use crate::error::SinkError;
use crate::pipeline::FrameReceiver;

pub use analyze::AnalyzeSink;
pub use ppm::{write_ppm, PpmSink};
pub use raw::RawSink;

/// Something a consumer does with each frame.
pub trait FrameSink: Send {
    fn name(&self) -> &'static str;

    fn consume(&mut self, frame: &Frame) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Dump source bytes
    Raw,
    /// Convert to RGB and write a PPM
    Ppm,
    /// Log sample-window statistics
    Analyze,
}

/// Build the sinks one consumer runs per frame. PPM output is skipped for
/// encodings that cannot be converted to RGB.
pub fn build_sinks(
    kinds: &[SinkKind],
    format: PixelFormat,
    dir: &Path,
    sample_window: u32,
    analyze_every: u64,
) -> Vec<Box<dyn FrameSink>> {
    let convertible = matches!(format, PixelFormat::Yuyv | PixelFormat::Rgb24);
    kinds
        .iter()
        .filter_map(|kind| -> Option<Box<dyn FrameSink>> {
            match kind {
                SinkKind::Raw => Some(Box::new(RawSink::new(dir))),
                SinkKind::Ppm if !convertible => {
                    warn!("No RGB conversion for {}, PPM output disabled", format);
                    None
                }
                SinkKind::Ppm => Some(Box::new(PpmSink::new(dir))),
                SinkKind::Analyze if !convertible => None,
                SinkKind::Analyze => {
                    Some(Box::new(AnalyzeSink::new(sample_window, analyze_every)))
                }
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub id: usize,
    pub frames: u64,
    pub errors: u64,
}

/// One consumer role: pops frames until the channel closes and runs every
/// sink on each. Sink failures are logged and counted, never propagated.
pub struct Consumer {
    id: usize,
    rx: FrameReceiver,
    sinks: Vec<Box<dyn FrameSink>>,
}

impl Consumer {
    pub fn new(id: usize, rx: FrameReceiver, sinks: Vec<Box<dyn FrameSink>>) -> Self {
        Self { id, rx, sinks }
    }

    pub fn run(mut self) -> ConsumerReport {
        let mut report = ConsumerReport {
            id: self.id,
            ..Default::default()
        };
        debug!(consumer = self.id, sinks = self.sinks.len(), "consumer started");

        while let Some(frame) = self.rx.pop() {
            report.frames += 1;
            for sink in &mut self.sinks {
                if let Err(e) = sink.consume(&frame) {
                    error!(
                        consumer = self.id,
                        sink = sink.name(),
                        sequence = frame.sequence(),
                        "{}",
                        e
                    );
                    metrics::counter!("consumer_errors").increment(1);
                    report.errors += 1;
                }
            }
        }

        info!(
            "Consumer {} finished: {} frames, {} errors",
            self.id, report.frames, report.errors
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameMetadata;
    use crate::pipeline::{Backpressure, FrameChannel};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Instant;

    struct Failing;

    impl FrameSink for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn consume(&mut self, _frame: &Frame) -> Result<(), SinkError> {
            Err(SinkError::Write {
                path: "/nowhere".into(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            })
        }
    }

    fn frame(sequence: u64, len: usize) -> Frame {
        Frame {
            data: Bytes::from(vec![128u8; len]),
            meta: Arc::new(FrameMetadata {
                sequence,
                width: 4,
                height: 2,
                stride: 8,
                format: PixelFormat::Yuyv,
                expected_size: 16,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn sink_errors_stay_local() {
        let (tx, rx) = FrameChannel::new(Some(4), Backpressure::Block);
        for i in 0..3 {
            tx.push(frame(i, 16)).unwrap();
        }
        drop(tx);

        let report = Consumer::new(0, rx, vec![Box::new(Failing)]).run();
        assert_eq!(report.frames, 3);
        assert_eq!(report.errors, 3);
    }

    #[test]
    fn sinks_write_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = FrameChannel::new(None, Backpressure::Block);
        tx.push(frame(0, 16)).unwrap();
        tx.push(frame(1, 10)).unwrap();
        drop(tx);

        let sinks = build_sinks(
            &[SinkKind::Raw, SinkKind::Ppm, SinkKind::Analyze],
            PixelFormat::Yuyv,
            dir.path(),
            100,
            1,
        );
        let report = Consumer::new(0, rx, sinks).run();
        assert_eq!(report.errors, 0);

        let raw0 = std::fs::read(dir.path().join("frame_4x2_0.yuv")).unwrap();
        assert_eq!(raw0.len(), 16);
        // Incomplete frames are dumped raw but not converted
        assert_eq!(
            std::fs::read(dir.path().join("frame_4x2_1.yuv")).unwrap().len(),
            10
        );
        assert!(!dir.path().join("frame_1.ppm").exists());

        let ppm = std::fs::read(dir.path().join("frame_0.ppm")).unwrap();
        assert!(ppm.starts_with(b"P6\n4 2\n255\n"));
        assert_eq!(ppm.len(), 11 + 4 * 2 * 3);
    }

    #[test]
    fn mjpeg_gets_raw_only() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = build_sinks(
            &[SinkKind::Raw, SinkKind::Ppm, SinkKind::Analyze],
            PixelFormat::Mjpeg,
            dir.path(),
            100,
            1,
        );
        let names: Vec<_> = sinks.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["raw"]);
    }
}
