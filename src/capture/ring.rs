//! Fixed ring of kernel-mapped capture buffers.
//!
//! Each slot carries an ownership tag. While a slot is [`SlotState::KernelOwned`]
//! the device may DMA into it at any moment, so the ring refuses to read it;
//! while it is [`SlotState::UserOwned`] the process may copy it out. The only
//! transitions are `enqueue_all`/`requeue` (user to kernel), `dequeue`
//! (kernel to user) and `stream_off` (everything back to user).

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::device::DeviceSession;
use super::driver::{Driver, SlotMapping};
use super::frame::AcceptedFormat;
use crate::error::{CaptureError, Result};

/// Smallest ring that can stream: one slot being filled, one being read.
pub const MIN_BUFFERS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Queued to the device; DMA target, must not be read.
    KernelOwned,
    /// Dequeued (or not yet queued); readable by the process.
    UserOwned,
}

struct Slot<M> {
    mapping: Option<M>,
    state: SlotState,
}

/// A filled slot handed back by [`BufferRing::dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedSlot {
    pub index: u32,
    /// Valid bytes in the slot, clamped to the mapping length.
    pub bytes_used: usize,
    pub driver_sequence: u32,
    pub device_timestamp: Option<std::time::Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dequeued {
    Ready(DequeuedSlot),
    /// No filled buffer yet. Expected in non-blocking mode; poll and retry.
    WouldBlock,
}

/// Buffer pool borrowed from one device session.
pub struct BufferRing<'s, D: Driver> {
    session: &'s mut DeviceSession<D>,
    requested: u32,
    slots: Vec<Slot<D::Mapping>>,
    enqueued: bool,
    streaming: bool,
    released: bool,
}

impl<'s, D: Driver> BufferRing<'s, D> {
    /// Request `count` memory-mapped buffers. Fewer than [`MIN_BUFFERS`]
    /// granted is fatal; any smaller grant above that is honored.
    pub fn allocate(session: &'s mut DeviceSession<D>, count: u32) -> Result<Self> {
        if session.is_closed() {
            return Err(CaptureError::InvalidState("session is closed"));
        }
        let granted = session
            .driver_mut()
            .request_buffers(count)
            .map_err(CaptureError::BufferRequest)?;

        if granted < MIN_BUFFERS {
            if granted > 0 {
                if let Err(e) = session.driver_mut().request_buffers(0) {
                    warn!("Failed to free {} buffers: {}", granted, e);
                }
            }
            return Err(CaptureError::InsufficientBuffers {
                requested: count,
                granted,
            });
        }
        if granted != count {
            warn!("Requested {} buffers, driver granted {}", count, granted);
        }

        let slots = (0..granted)
            .map(|_| Slot {
                mapping: None,
                state: SlotState::UserOwned,
            })
            .collect();

        Ok(Self {
            session,
            requested: count,
            slots,
            enqueued: false,
            streaming: false,
            released: false,
        })
    }

    /// Allocate, map and enqueue in one go; the ring is ready for `stream_on`.
    pub fn prepare(session: &'s mut DeviceSession<D>, count: u32) -> Result<Self> {
        let mut ring = Self::allocate(session, count)?;
        ring.map_all()?;
        ring.enqueue_all()?;
        Ok(ring)
    }

    /// Map every granted buffer. On failure the slots mapped so far are
    /// unmapped again before the error is returned.
    pub fn map_all(&mut self) -> Result<()> {
        if self.released || self.slots.iter().any(|s| s.mapping.is_some()) {
            return Err(CaptureError::InvalidState("buffers already mapped"));
        }

        for index in 0..self.slots.len() as u32 {
            match self.session.driver_mut().map_buffer(index) {
                Ok(mapping) => {
                    trace!(index, len = mapping.len(), "buffer mapped");
                    self.slots[index as usize].mapping = Some(mapping);
                }
                Err(source) => {
                    self.unmap_best_effort();
                    return Err(CaptureError::MappingFailed { index, source });
                }
            }
        }

        debug!("Mapped {} buffers", self.slots.len());
        Ok(())
    }

    /// Hand every slot to the device. Valid once, before streaming starts.
    pub fn enqueue_all(&mut self) -> Result<()> {
        if self.enqueued || self.streaming || self.released {
            return Err(CaptureError::InvalidState("ring already enqueued"));
        }
        if self.slots.iter().any(|s| s.mapping.is_none()) {
            return Err(CaptureError::InvalidState("enqueue before map_all"));
        }

        for index in 0..self.slots.len() as u32 {
            self.session
                .driver_mut()
                .queue(index)
                .map_err(CaptureError::DriverFault)?;
            self.slots[index as usize].state = SlotState::KernelOwned;
        }
        self.enqueued = true;
        Ok(())
    }

    pub fn stream_on(&mut self) -> Result<()> {
        if !self.enqueued {
            return Err(CaptureError::InvalidState("stream on before enqueue_all"));
        }
        if self.streaming {
            return Ok(());
        }
        self.session
            .driver_mut()
            .stream_on()
            .map_err(CaptureError::StreamOn)?;
        self.streaming = true;
        info!("Capture stream started with {} buffers", self.slots.len());
        Ok(())
    }

    /// Stop the stream. The device gives every buffer back, so all slots
    /// become user-owned.
    pub fn stream_off(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        self.session
            .driver_mut()
            .stream_off()
            .map_err(CaptureError::StreamOff)?;
        self.streaming = false;
        self.enqueued = false;
        for slot in &mut self.slots {
            slot.state = SlotState::UserOwned;
        }
        info!("Capture stream stopped");
        Ok(())
    }

    /// Take the next filled slot from the device, if there is one.
    pub fn dequeue(&mut self) -> Result<Dequeued> {
        if !self.streaming {
            return Err(CaptureError::InvalidState("dequeue while not streaming"));
        }
        let Some(buffer) = self
            .session
            .driver_mut()
            .dequeue()
            .map_err(CaptureError::DriverFault)?
        else {
            return Ok(Dequeued::WouldBlock);
        };

        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(buffer.index as usize)
            .ok_or(CaptureError::UnknownSlot {
                index: buffer.index,
                len,
            })?;
        if slot.state != SlotState::KernelOwned {
            return Err(CaptureError::OwnershipViolation {
                index: buffer.index,
                state: slot.state,
            });
        }
        slot.state = SlotState::UserOwned;

        let capacity = slot.mapping.as_ref().map_or(0, |m| m.len());
        let bytes_used = buffer.bytes_used as usize;
        if bytes_used > capacity {
            warn!(
                index = buffer.index,
                bytes_used, capacity, "driver reported more bytes than the buffer holds"
            );
        }

        Ok(Dequeued::Ready(DequeuedSlot {
            index: buffer.index,
            bytes_used: bytes_used.min(capacity),
            driver_sequence: buffer.sequence,
            device_timestamp: buffer.timestamp,
        }))
    }

    /// Block until the device has a filled slot or `timeout` passes.
    pub fn wait_ready(&mut self, timeout: std::time::Duration) -> Result<bool> {
        if !self.streaming {
            return Err(CaptureError::InvalidState("wait while not streaming"));
        }
        self.session
            .driver_mut()
            .wait_ready(timeout)
            .map_err(CaptureError::DriverFault)
    }

    /// Copy the valid range of a dequeued slot into owned memory.
    /// Must happen before the slot is requeued.
    pub fn copy_out(&self, slot: &DequeuedSlot) -> Result<Bytes> {
        let entry = self
            .slots
            .get(slot.index as usize)
            .ok_or(CaptureError::UnknownSlot {
                index: slot.index,
                len: self.slots.len(),
            })?;
        if entry.state != SlotState::UserOwned {
            return Err(CaptureError::OwnershipViolation {
                index: slot.index,
                state: entry.state,
            });
        }
        let mapping = entry
            .mapping
            .as_ref()
            .ok_or(CaptureError::InvalidState("slot is not mapped"))?;
        Ok(mapping.copy_prefix(slot.bytes_used))
    }

    /// Give a user-owned slot back to the device.
    pub fn requeue(&mut self, index: u32) -> Result<()> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(CaptureError::UnknownSlot { index, len })?;
        if slot.state != SlotState::UserOwned {
            return Err(CaptureError::OwnershipViolation {
                index,
                state: slot.state,
            });
        }
        self.session
            .driver_mut()
            .queue(index)
            .map_err(CaptureError::DriverFault)?;
        slot.state = SlotState::KernelOwned;
        Ok(())
    }

    /// Unmap every slot and free the device buffers. Only valid once the
    /// stream is off. All slots are attempted; the first failure is returned.
    pub fn release_all(&mut self) -> Result<()> {
        if self.streaming {
            return Err(CaptureError::InvalidState("release while streaming"));
        }
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut first_error = None;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(mapping) = slot.mapping.take() {
                if let Err(source) = self.session.driver_mut().unmap_buffer(mapping) {
                    warn!("Failed to unmap buffer {}: {}", index, source);
                    first_error.get_or_insert(CaptureError::UnmapFailed {
                        index: index as u32,
                        source,
                    });
                }
            }
        }
        self.slots.clear();

        if let Err(e) = self.session.driver_mut().request_buffers(0) {
            first_error.get_or_insert(CaptureError::BufferRequest(e));
        }

        debug!("Buffer ring released");
        first_error.map_or(Ok(()), Err)
    }

    fn unmap_best_effort(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(mapping) = slot.mapping.take() {
                if let Err(e) = self.session.driver_mut().unmap_buffer(mapping) {
                    warn!("Failed to unmap buffer {}: {}", index, e);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Buffers requested, which may exceed `len()`.
    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn slot_state(&self, index: u32) -> Option<SlotState> {
        self.slots.get(index as usize).map(|s| s.state)
    }

    /// `(kernel_owned, user_owned)`; always sums to `len()`.
    pub fn ownership(&self) -> (usize, usize) {
        let kernel = self
            .slots
            .iter()
            .filter(|s| s.state == SlotState::KernelOwned)
            .count();
        (kernel, self.slots.len() - kernel)
    }

    pub fn format(&self) -> Option<AcceptedFormat> {
        self.session.format()
    }

    pub fn session(&self) -> &DeviceSession<D> {
        self.session
    }
}

impl<D: Driver> Drop for BufferRing<'_, D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.stream_off() {
            warn!("Stream off during ring teardown failed: {}", e);
            // The device still owns the memory; unmapping is all that is left.
            self.streaming = false;
        }
        if let Err(e) = self.release_all() {
            warn!("Buffer ring teardown failed: {}", e);
        }
    }
}
