//! Frame handoff from the capture role to consumers.
//!
//! Frames are moved, never shared: each pushed frame reaches at most one
//! consumer. What happens when a bounded channel is full is decided by an
//! explicit [`Backpressure`] policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{RecvTimeoutError, SendTimeoutError, TrySendError};
use serde::{Deserialize, Serialize};

use crate::capture::Frame;
use crate::error::{CaptureError, Result};
use crate::StopSignal;

/// What a full bounded channel does with a new frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backpressure {
    /// The producer waits for room (capture stalls, the kernel ring keeps buffering).
    Block,
    /// Evict the oldest queued frame to make room.
    DropOldest,
    /// Discard the frame being pushed.
    DropNewest,
}

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Delivered,
    /// Queued after evicting the oldest frame.
    DroppedOldest,
    /// The pushed frame was discarded.
    DroppedNewest,
    /// Stop was requested while waiting for room; the frame was discarded.
    Cancelled,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
}

pub struct FrameChannel;

impl FrameChannel {
    /// `capacity: None` gives an unbounded channel, which never drops.
    pub fn new(capacity: Option<usize>, policy: Backpressure) -> (FrameSender, FrameReceiver) {
        let (tx, rx) = match capacity {
            Some(cap) => flume::bounded(cap.max(1)),
            None => flume::unbounded(),
        };
        let stats = Arc::new(CachePadded::new(Stats::default()));
        let sender = FrameSender {
            tx,
            evict: (policy == Backpressure::DropOldest && capacity.is_some()).then(|| rx.clone()),
            policy,
            poll: Duration::from_millis(10),
            stats: stats.clone(),
        };
        (sender, FrameReceiver { rx, stats })
    }
}

/// Producer end. Dropping it closes the channel once queued frames drain.
pub struct FrameSender {
    tx: flume::Sender<Frame>,
    // Receiver used only to evict under DropOldest
    evict: Option<flume::Receiver<Frame>>,
    policy: Backpressure,
    poll: Duration,
    stats: Arc<CachePadded<Stats>>,
}

impl FrameSender {
    /// How often a blocked push re-checks the stop signal.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll.max(Duration::from_millis(1));
        self
    }

    pub fn policy(&self) -> Backpressure {
        self.policy
    }

    /// Push without observing cancellation.
    pub fn push(&self, frame: Frame) -> Result<Push> {
        self.push_until(frame, &StopSignal::new())
    }

    /// Push a frame according to the configured policy. A `Block` push
    /// re-checks `stop` every poll interval and gives up when it is raised.
    pub fn push_until(&self, frame: Frame, stop: &StopSignal) -> Result<Push> {
        if self.consumers() == 0 {
            return Err(CaptureError::ChannelClosed);
        }
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.policy {
            Backpressure::Block => self.push_blocking(frame, stop)?,
            Backpressure::DropNewest => match self.tx.try_send(frame) {
                Ok(()) => Push::Delivered,
                Err(TrySendError::Full(_)) => Push::DroppedNewest,
                Err(TrySendError::Disconnected(_)) => return Err(CaptureError::ChannelClosed),
            },
            Backpressure::DropOldest => self.push_evicting(frame)?,
        };

        if matches!(
            outcome,
            Push::DroppedOldest | Push::DroppedNewest | Push::Cancelled
        ) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_dropped").increment(1);
        }
        Ok(outcome)
    }

    fn push_blocking(&self, mut frame: Frame, stop: &StopSignal) -> Result<Push> {
        loop {
            match self.tx.send_timeout(frame, self.poll) {
                Ok(()) => return Ok(Push::Delivered),
                Err(SendTimeoutError::Timeout(back)) => {
                    if stop.is_raised() {
                        return Ok(Push::Cancelled);
                    }
                    frame = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(CaptureError::ChannelClosed),
            }
        }
    }

    fn push_evicting(&self, mut frame: Frame) -> Result<Push> {
        let mut evicted = false;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => {
                    return Ok(if evicted {
                        Push::DroppedOldest
                    } else {
                        Push::Delivered
                    })
                }
                Err(TrySendError::Full(back)) => {
                    frame = back;
                    // A consumer may win the race for the head; then there is room anyway.
                    if let Some(evict) = &self.evict {
                        if evict.try_recv().is_ok() {
                            evicted = true;
                        }
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(CaptureError::ChannelClosed),
            }
        }
    }

    /// Receivers still attached, not counting the eviction handle.
    pub fn consumers(&self) -> usize {
        let own = usize::from(self.evict.is_some());
        self.tx.receiver_count().saturating_sub(own)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn stats(&self) -> ChannelStats {
        snapshot(&self.stats)
    }
}

/// Consumer end. Clone it to add consumers; each frame goes to one of them.
#[derive(Clone)]
pub struct FrameReceiver {
    rx: flume::Receiver<Frame>,
    stats: Arc<CachePadded<Stats>>,
}

impl FrameReceiver {
    /// Wait for the next frame. `None` once the sender is gone and the
    /// queue is drained.
    pub fn pop(&self) -> Option<Frame> {
        let frame = self.rx.recv().ok()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`. The outer
    /// `None` means closed; `Some(None)` means nothing arrived in time.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Option<Frame>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                Some(Some(frame))
            }
            Err(RecvTimeoutError::Timeout) => Some(None),
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub async fn pop_async(&self) -> Option<Frame> {
        let frame = self.rx.recv_async().await.ok()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn try_pop(&self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// True once the sender is dropped; frames may still be queued.
    pub fn is_closed(&self) -> bool {
        self.rx.is_disconnected()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> ChannelStats {
        snapshot(&self.stats)
    }
}

fn snapshot(stats: &Stats) -> ChannelStats {
    ChannelStats {
        pushed: stats.pushed.load(Ordering::Relaxed),
        popped: stats.popped.load(Ordering::Relaxed),
        dropped: stats.dropped.load(Ordering::Relaxed),
    }
}
