//! Dequeue/copy/requeue cycle feeding the frame channel.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::driver::Driver;
use super::frame::{AcceptedFormat, Frame, FrameMetadata};
use super::ring::{BufferRing, Dequeued};
use crate::convert::{self, DEFAULT_SAMPLE_WINDOW};
use crate::error::{CaptureError, ConvertError, Result};
use crate::pipeline::{FrameSender, Push};
use crate::StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Streaming,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Stop after this many captured frames
    pub max_frames: Option<u64>,
    /// Stop once streaming has lasted this long
    pub max_duration: Option<Duration>,
    /// Upper bound on one readiness wait
    pub poll_interval: Duration,
    pub summarize_first_frame: bool,
    pub sample_window: u32,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_frames: None,
            max_duration: None,
            poll_interval: Duration::from_millis(100),
            summarize_first_frame: true,
            sample_window: DEFAULT_SAMPLE_WINDOW,
        }
    }
}

/// Totals for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CaptureReport {
    pub frames: u64,
    pub incomplete: u64,
    /// Frames the channel did not deliver
    pub dropped: u64,
    pub would_block: u64,
    pub elapsed: Duration,
}

impl CaptureReport {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for CaptureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames in {:.2} s ({:.1} FPS)",
            self.frames,
            self.elapsed.as_secs_f64(),
            self.fps()
        )
    }
}

enum StopReason {
    FrameTarget,
    Duration,
    Signal,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FrameTarget => "frame target reached",
            Self::Duration => "duration elapsed",
            Self::Signal => "stop requested",
        })
    }
}

/// Drives one streaming run over a prepared ring.
pub struct CaptureLoop<'s, D: Driver> {
    ring: BufferRing<'s, D>,
    format: AcceptedFormat,
    options: LoopOptions,
    state: LoopState,
    sequence: u64,
    report: CaptureReport,
}

impl<'s, D: Driver> CaptureLoop<'s, D> {
    /// Take over a ring that has been allocated, mapped and enqueued.
    pub fn new(ring: BufferRing<'s, D>, options: LoopOptions) -> Result<Self> {
        let format = ring
            .format()
            .ok_or(CaptureError::InvalidState("format not negotiated"))?;
        Ok(Self {
            ring,
            format,
            options,
            state: LoopState::Idle,
            sequence: 0,
            report: CaptureReport::default(),
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn ring(&self) -> &BufferRing<'s, D> {
        &self.ring
    }

    pub fn format(&self) -> AcceptedFormat {
        self.format
    }

    /// Sequence number the next captured frame will carry.
    pub fn next_sequence(&self) -> u64 {
        self.sequence
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != LoopState::Idle {
            return Err(CaptureError::InvalidState("capture already running"));
        }
        if self.ring.is_released() {
            return Err(CaptureError::InvalidState("buffer ring released"));
        }
        self.ring.stream_on()?;
        self.state = LoopState::Streaming;
        Ok(())
    }

    /// One dequeue/copy/requeue cycle. `Ok(None)` means no buffer was ready
    /// and the readiness wait has already happened.
    pub fn capture_one(&mut self) -> Result<Option<Frame>> {
        if self.state != LoopState::Streaming {
            return Err(CaptureError::InvalidState("capture not streaming"));
        }

        let slot = match self.ring.dequeue()? {
            Dequeued::Ready(slot) => slot,
            Dequeued::WouldBlock => {
                self.report.would_block += 1;
                self.ring.wait_ready(self.options.poll_interval)?;
                return Ok(None);
            }
        };
        let timestamp = Instant::now();

        let copy_start = Instant::now();
        let data = self.ring.copy_out(&slot)?;
        // The copy is owned now; the slot can go straight back to the device
        self.ring.requeue(slot.index)?;
        metrics::histogram!("copy_time_us").record(copy_start.elapsed().as_micros() as f64);

        let sequence = self.sequence;
        self.sequence += 1;
        let frame = Frame {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width: self.format.width,
                height: self.format.height,
                stride: self.format.bytes_per_line,
                format: self.format.format,
                expected_size: self.format.expected_frame_size(),
                device_timestamp: slot.device_timestamp,
            }),
            timestamp,
        };

        self.report.frames += 1;
        metrics::counter!("frames_captured").increment(1);

        if frame.is_complete() {
            debug!(
                sequence,
                driver_sequence = slot.driver_sequence,
                index = slot.index,
                bytes = frame.len(),
                "frame captured"
            );
        } else {
            self.report.incomplete += 1;
            metrics::counter!("frames_incomplete").increment(1);
            warn!(
                "Incomplete frame {}: {} bytes, expected {}",
                sequence,
                frame.len(),
                frame.meta.expected_size
            );
        }

        if sequence == 0 && self.options.summarize_first_frame {
            self.summarize_first(&frame);
        }
        Ok(Some(frame))
    }

    fn summarize_first(&self, frame: &Frame) {
        let meta = &frame.meta;
        info!(
            "First frame: {} bytes (expected {})",
            frame.len(),
            meta.expected_size
        );
        match convert::summarize(
            &frame.data,
            meta.width,
            meta.height,
            meta.stride,
            meta.format,
            self.options.sample_window,
        ) {
            Ok(summary) => info!("{}", summary),
            Err(ConvertError::Unsupported(_)) => {}
            Err(e) => warn!("First frame not summarized: {}", e),
        }
    }

    fn stop_reason(&self, started: Instant, stop: &StopSignal) -> Option<StopReason> {
        if stop.is_raised() {
            return Some(StopReason::Signal);
        }
        if self.options.max_frames.is_some_and(|max| self.report.frames >= max) {
            return Some(StopReason::FrameTarget);
        }
        if self
            .options
            .max_duration
            .is_some_and(|max| started.elapsed() >= max)
        {
            return Some(StopReason::Duration);
        }
        None
    }

    /// Stream until a stop condition holds, pushing every frame into `tx`.
    /// The ring is streamed off and released before returning, on success
    /// and on error alike. Dropping `tx` on return closes the channel.
    ///
    /// Must be called on an idle loop; a loop started by hand is left as is.
    #[instrument(skip_all, fields(device = %self.ring.session().path().display()))]
    pub fn run(&mut self, tx: FrameSender, stop: &StopSignal) -> Result<CaptureReport> {
        if self.state != LoopState::Idle {
            return Err(CaptureError::InvalidState("capture already running"));
        }
        if let Err(e) = self.start() {
            if let Err(cleanup) = self.shutdown() {
                warn!("Cleanup after failed start: {}", cleanup);
            }
            return Err(e);
        }

        let started = Instant::now();
        let streamed = self.stream(&tx, stop, started);
        drop(tx);
        self.report.elapsed = started.elapsed();

        let cleanup = self.shutdown();
        match (streamed, cleanup) {
            (Err(e), cleanup) => {
                if let Err(c) = cleanup {
                    warn!("Cleanup after capture failure: {}", c);
                }
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => {
                info!("Capture completed: {}", self.report);
                Ok(self.report)
            }
        }
    }

    fn stream(&mut self, tx: &FrameSender, stop: &StopSignal, started: Instant) -> Result<()> {
        loop {
            if let Some(reason) = self.stop_reason(started, stop) {
                info!("Stopping capture: {}", reason);
                return Ok(());
            }
            let Some(frame) = self.capture_one()? else {
                continue;
            };
            let sequence = frame.sequence();
            match tx.push_until(frame, stop) {
                Ok(Push::Delivered) => {}
                Ok(outcome) => {
                    self.report.dropped += 1;
                    debug!(sequence, ?outcome, "frame not delivered");
                }
                Err(CaptureError::ChannelClosed) => {
                    info!("All consumers gone, stopping capture");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream off and release the ring. Release is skipped when stream-off
    /// fails; the ring's drop unmaps what is left.
    fn shutdown(&mut self) -> Result<()> {
        self.state = LoopState::Stopping;
        let result = self.ring.stream_off().and_then(|()| self.ring.release_all());
        self.state = LoopState::Idle;
        result
    }

    /// Totals so far.
    pub fn report(&self) -> CaptureReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::{generate_test_frame, MockDriver, TestPattern, SCRIBBLE};
    use crate::capture::{DeviceSession, PixelFormat, SlotState};
    use crate::pipeline::{Backpressure, FrameChannel};

    fn session(driver: MockDriver, width: u32, height: u32) -> DeviceSession<MockDriver> {
        let mut session = DeviceSession::with_driver("mock", driver);
        session.negotiate(width, height, PixelFormat::Yuyv).unwrap();
        session
    }

    fn frames(max: u64) -> LoopOptions {
        LoopOptions {
            max_frames: Some(max),
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn three_frames_at_vga() {
        let mut session = session(MockDriver::new(), 640, 480);
        let ring = BufferRing::prepare(&mut session, 4).unwrap();
        assert_eq!(ring.len(), 4);
        let mut capture = CaptureLoop::new(ring, frames(3)).unwrap();
        capture.start().unwrap();
        assert_eq!(capture.state(), LoopState::Streaming);

        for expected in 0..3 {
            let frame = capture.capture_one().unwrap().unwrap();
            assert_eq!(frame.sequence(), expected);
            assert!(frame.len() <= 614_400);
            assert!(frame.is_complete());
            assert_eq!(capture.ring().ownership(), (4, 0));
            for index in 0..4 {
                assert_eq!(capture.ring().slot_state(index), Some(SlotState::KernelOwned));
            }
        }
    }

    #[test]
    fn run_stops_at_frame_target_and_releases() {
        let mut session = session(MockDriver::new(), 64, 48);
        let (tx, rx) = FrameChannel::new(None, Backpressure::Block);
        {
            let ring = BufferRing::prepare(&mut session, 4).unwrap();
            let mut capture = CaptureLoop::new(ring, frames(5)).unwrap();
            let report = capture.run(tx, &StopSignal::new()).unwrap();
            assert_eq!(report.frames, 5);
            assert_eq!(report.incomplete, 0);
            assert_eq!(capture.state(), LoopState::Idle);
            assert!(capture.ring().is_released());
        }

        let sequences: Vec<_> = std::iter::from_fn(|| rx.pop()).map(|f| f.sequence()).collect();
        assert_eq!(sequences, [0, 1, 2, 3, 4]);
        assert!(!session.driver().is_streaming());
        assert_eq!(session.driver().granted(), 0);
        assert_eq!(session.driver().live_mappings(), 0);
    }

    #[test]
    fn frame_survives_kernel_overwrite() {
        let mut session = session(
            MockDriver::new()
                .with_pattern(TestPattern::Gradient)
                .with_overwrite_on_queue(),
            32,
            8,
        );
        let ring = BufferRing::prepare(&mut session, 2).unwrap();
        let mut capture = CaptureLoop::new(ring, frames(1)).unwrap();
        capture.start().unwrap();

        let frame = capture.capture_one().unwrap().unwrap();
        assert_eq!(&frame.data[..], &generate_test_frame(32, 8, TestPattern::Gradient)[..]);
        assert!(frame.data.iter().any(|&b| b != SCRIBBLE));
    }

    #[test]
    fn partial_frames_are_flagged_not_fatal() {
        let mut session = session(MockDriver::new().with_short_frame_every(2), 16, 4);
        let (tx, rx) = FrameChannel::new(None, Backpressure::Block);
        let ring = BufferRing::prepare(&mut session, 3).unwrap();
        let mut capture = CaptureLoop::new(ring, frames(4)).unwrap();
        let report = capture.run(tx, &StopSignal::new()).unwrap();
        assert_eq!(report.frames, 4);
        assert_eq!(report.incomplete, 2);

        let complete: Vec<_> = std::iter::from_fn(|| rx.pop()).map(|f| f.is_complete()).collect();
        assert_eq!(complete, [true, false, true, false]);
    }

    #[test]
    fn would_block_is_retried_without_gaps() {
        let mut session = session(MockDriver::new().with_would_block_every(2), 16, 4);
        let (tx, rx) = FrameChannel::new(None, Backpressure::Block);
        let ring = BufferRing::prepare(&mut session, 2).unwrap();
        let mut capture = CaptureLoop::new(ring, frames(6)).unwrap();
        let report = capture.run(tx, &StopSignal::new()).unwrap();
        assert_eq!(report.frames, 6);
        assert!(report.would_block > 0);

        let sequences: Vec<_> = std::iter::from_fn(|| rx.pop()).map(|f| f.sequence()).collect();
        assert_eq!(sequences, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn raised_signal_stops_before_first_frame() {
        let mut session = session(MockDriver::new(), 16, 4);
        let (tx, _rx) = FrameChannel::new(None, Backpressure::Block);
        let stop = StopSignal::new();
        stop.raise();
        let ring = BufferRing::prepare(&mut session, 2).unwrap();
        let mut capture = CaptureLoop::new(ring, LoopOptions::default()).unwrap();
        let report = capture.run(tx, &stop).unwrap();
        assert_eq!(report.frames, 0);
        assert!(capture.ring().is_released());
    }

    #[test]
    fn closed_channel_ends_capture() {
        let mut session = session(MockDriver::new(), 16, 4);
        let (tx, rx) = FrameChannel::new(Some(2), Backpressure::Block);
        drop(rx);
        let ring = BufferRing::prepare(&mut session, 2).unwrap();
        let mut capture = CaptureLoop::new(ring, LoopOptions::default()).unwrap();
        let report = capture.run(tx, &StopSignal::new()).unwrap();
        assert_eq!(report.frames, 1);
    }

    #[test]
    fn drop_newest_counts_dropped_frames() {
        let mut session = session(MockDriver::new(), 16, 4);
        let (tx, rx) = FrameChannel::new(Some(1), Backpressure::DropNewest);
        let ring = BufferRing::prepare(&mut session, 2).unwrap();
        let mut capture = CaptureLoop::new(ring, frames(5)).unwrap();
        let report = capture.run(tx, &StopSignal::new()).unwrap();
        assert_eq!(report.frames, 5);
        assert_eq!(report.dropped, 4);
        assert_eq!(rx.pop().map(|f| f.sequence()), Some(0));
        assert!(rx.pop().is_none());
    }

    #[test]
    fn stream_on_failure_cleans_up() {
        let mut session = session(MockDriver::new().with_stream_on_failure(), 16, 4);
        let (tx, _rx) = FrameChannel::new(None, Backpressure::Block);
        {
            let ring = BufferRing::prepare(&mut session, 2).unwrap();
            let mut capture = CaptureLoop::new(ring, LoopOptions::default()).unwrap();
            let err = capture.run(tx, &StopSignal::new()).unwrap_err();
            assert!(matches!(err, CaptureError::StreamOn(_)));
            assert_eq!(capture.state(), LoopState::Idle);
        }
        assert_eq!(session.driver().granted(), 0);
        assert_eq!(session.driver().live_mappings(), 0);
    }

    #[test]
    fn run_on_started_loop_leaves_ring_streaming() {
        let mut session = session(MockDriver::new(), 16, 4);
        let (tx, _rx) = FrameChannel::new(None, Backpressure::Block);
        let ring = BufferRing::prepare(&mut session, 2).unwrap();
        let mut capture = CaptureLoop::new(ring, frames(2)).unwrap();
        capture.start().unwrap();

        let err = capture.run(tx, &StopSignal::new()).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidState(_)));
        assert_eq!(capture.state(), LoopState::Streaming);
        assert!(capture.ring().is_streaming());
        assert!(!capture.ring().is_released());
        assert_eq!(capture.capture_one().unwrap().map(|f| f.sequence()), Some(0));
    }

    #[test]
    fn padded_rows_convert_like_packed_frames() {
        let driver = MockDriver::new()
            .with_pattern(TestPattern::Gradient)
            .with_row_padding(32);
        let mut session = session(driver, 16, 4);
        let ring = BufferRing::prepare(&mut session, 2).unwrap();
        let mut capture = CaptureLoop::new(ring, frames(1)).unwrap();
        assert_eq!(capture.format().bytes_per_line, 64);
        capture.start().unwrap();

        let frame = capture.capture_one().unwrap().unwrap();
        let meta = &frame.meta;
        assert_eq!(meta.stride, 64);
        assert_eq!(meta.expected_size, 64 * 4);
        assert_eq!(frame.len(), 64 * 4);
        assert!(frame.is_complete());

        let packed = generate_test_frame(16, 4, TestPattern::Gradient);
        let rgb = convert::to_rgb(&frame.data, 16, 4, meta.stride, meta.format).unwrap();
        assert_eq!(rgb, convert::to_rgb(&packed, 16, 4, 0, PixelFormat::Yuyv).unwrap());

        let summary = convert::summarize(&frame.data, 16, 4, meta.stride, meta.format, 8);
        let expected = convert::summarize(&packed, 16, 4, 0, PixelFormat::Yuyv, 8);
        assert_eq!(summary.unwrap(), expected.unwrap());
    }

    #[test]
    fn capture_requires_start() {
        let mut session = session(MockDriver::new(), 16, 4);
        let ring = BufferRing::prepare(&mut session, 2).unwrap();
        let mut capture = CaptureLoop::new(ring, LoopOptions::default()).unwrap();
        assert!(matches!(
            capture.capture_one(),
            Err(CaptureError::InvalidState(_))
        ));
    }

    #[test]
    fn report_fps() {
        let report = CaptureReport {
            frames: 30,
            elapsed: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(report.fps(), 15.0);
        assert_eq!(report.to_string(), "30 frames in 2.00 s (15.0 FPS)");
        assert_eq!(CaptureReport::default().fps(), 0.0);
    }
}
