//! In-process capture device for tests and hardware-less runs.
//!
//! Behaves like a V4L2 driver from the ring's point of view: it grants a
//! limited number of buffers, owns their memory, hands filled buffers back
//! in FIFO order and can be told to misbehave (adjust formats, deliver
//! partial frames, report "not ready", fail mappings, overwrite slots as
//! soon as they are queued again).

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;

use super::driver::{Driver, DriverBuffer, SlotMapping};
use super::frame::{AcceptedFormat, PixelFormat};

/// Byte written over a slot's memory when `overwrite_on_queue` is set.
pub const SCRIBBLE: u8 = 0xAA;

/// Largest frame the mock accepts; bigger requests are adjusted down.
pub const MAX_WIDTH: u32 = 4096;
pub const MAX_HEIGHT: u32 = 2160;

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

type SlotMemory = Arc<Mutex<Vec<u8>>>;

/// Mock device for testing without hardware.
pub struct MockDriver {
    format: AcceptedFormat,
    adjust_to: Option<AcceptedFormat>,
    reject_format: bool,
    max_grant: u32,
    fail_map_at: Option<u32>,
    fail_stream_on: bool,
    pattern: TestPattern,
    short_every: Option<u64>,
    would_block_every: Option<u64>,
    overwrite_on_queue: bool,
    row_padding: u32,
    forced_index: Option<u32>,

    slots: Vec<SlotMemory>,
    mapped: Vec<bool>,
    kernel_queue: VecDeque<u32>,
    streaming: bool,
    closed: bool,
    produced: u64,
    dequeue_calls: u64,
    stream_on_calls: u32,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a new mock device with default settings.
    pub fn new() -> Self {
        Self {
            format: AcceptedFormat::packed(640, 480, PixelFormat::Yuyv),
            adjust_to: None,
            reject_format: false,
            max_grant: 32,
            fail_map_at: None,
            fail_stream_on: false,
            pattern: TestPattern::ColorBars,
            short_every: None,
            would_block_every: None,
            overwrite_on_queue: false,
            row_padding: 0,
            forced_index: None,
            slots: Vec::new(),
            mapped: Vec::new(),
            kernel_queue: VecDeque::new(),
            streaming: false,
            closed: false,
            produced: 0,
            dequeue_calls: 0,
            stream_on_calls: 0,
        }
    }

    /// Grant at most `count` buffers, whatever was requested.
    pub fn with_max_grant(mut self, count: u32) -> Self {
        self.max_grant = count;
        self
    }

    /// Accept every format request as this format instead.
    pub fn with_adjusted_format(mut self, width: u32, height: u32, format: PixelFormat) -> Self {
        self.adjust_to = Some(AcceptedFormat::packed(width, height, format));
        self
    }

    pub fn with_rejected_format(mut self) -> Self {
        self.reject_format = true;
        self
    }

    pub fn with_map_failure_at(mut self, index: u32) -> Self {
        self.fail_map_at = Some(index);
        self
    }

    pub fn with_stream_on_failure(mut self) -> Self {
        self.fail_stream_on = true;
        self
    }

    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Every `n`th produced frame carries only half of its bytes.
    pub fn with_short_frame_every(mut self, n: u64) -> Self {
        self.short_every = Some(n.max(1));
        self
    }

    /// Every `n`th dequeue call reports "not ready".
    pub fn with_would_block_every(mut self, n: u64) -> Self {
        self.would_block_every = Some(n.max(1));
        self
    }

    /// Scribble over a slot as soon as it is queued, like a DMA write would.
    pub fn with_overwrite_on_queue(mut self) -> Self {
        self.overwrite_on_queue = true;
        self
    }

    /// Lay rows out `pad` bytes wider than the pixels they hold, like a
    /// driver with aligned line pitch. Applies to raw formats.
    pub fn with_row_padding(mut self, pad: u32) -> Self {
        self.row_padding = pad;
        self
    }

    /// Make the next dequeue report `index`, whether or not it is queued.
    pub fn force_next_dequeue(&mut self, index: u32) {
        self.forced_index = Some(index);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stream_on_calls(&self) -> u32 {
        self.stream_on_calls
    }

    /// Buffers currently granted by the last request.
    pub fn granted(&self) -> usize {
        self.slots.len()
    }

    /// Mappings handed out and not yet unmapped.
    pub fn live_mappings(&self) -> usize {
        self.mapped.iter().filter(|m| **m).count()
    }

    /// Buffers currently queued to the device.
    pub fn queued(&self) -> usize {
        self.kernel_queue.len()
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(())
    }

    fn buffer_len(&self) -> usize {
        match self.format.size_image as usize {
            0 => self.format.width as usize * self.format.height as usize * 2,
            size => size,
        }
    }

    fn fill(&mut self, index: u32) -> usize {
        self.produced += 1;
        let full = match self.format.format {
            PixelFormat::Mjpeg => self.buffer_len() / 4 + (self.produced as usize % 7) * 16,
            _ => self.format.expected_frame_size().min(self.buffer_len()),
        };
        let len = match self.short_every {
            Some(n) if self.produced % n == 0 => full / 2,
            _ => full,
        };

        let memory = &self.slots[index as usize];
        let mut memory = memory.lock().unwrap_or_else(PoisonError::into_inner);
        let len = len.min(memory.len());
        let out = &mut memory[..len];
        match self.format.format {
            PixelFormat::Yuyv => {
                let packed = generate_test_frame(
                    self.format.width,
                    self.format.height,
                    self.pattern,
                );
                let full_frame = with_pitch(
                    packed,
                    self.format.width as usize * 2,
                    self.format.bytes_per_line as usize,
                );
                out.copy_from_slice(&full_frame[..len]);
            }
            PixelFormat::Rgb24 => generate_rgb(
                out,
                self.format.width,
                self.format.bytes_per_line as usize,
            ),
            PixelFormat::Mjpeg | PixelFormat::Other(_) => generate_jpeg_like(out),
        }
        len
    }
}

impl Driver for MockDriver {
    type Mapping = MockMapping;

    fn describe(&self) -> String {
        "Mock Camera (mock)".to_owned()
    }

    fn set_format(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> io::Result<AcceptedFormat> {
        self.ensure_open()?;
        if self.reject_format {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if self.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        let mut accepted = self.adjust_to.unwrap_or_else(|| {
            AcceptedFormat::packed(width.min(MAX_WIDTH), height.min(MAX_HEIGHT), format)
        });
        if accepted.format == PixelFormat::Mjpeg {
            accepted.size_image = accepted.width.saturating_mul(accepted.height);
        } else if self.row_padding > 0 {
            accepted.bytes_per_line = accepted.bytes_per_line.saturating_add(self.row_padding);
            accepted.size_image = accepted.bytes_per_line.saturating_mul(accepted.height);
        }
        self.format = accepted;
        Ok(self.format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.ensure_open()?;
        if self.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        let granted = count.min(self.max_grant);
        let len = self.buffer_len();
        self.slots = (0..granted)
            .map(|_| Arc::new(Mutex::new(vec![0u8; len])))
            .collect();
        self.mapped = vec![false; granted as usize];
        self.kernel_queue.clear();
        Ok(granted)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<MockMapping> {
        self.ensure_open()?;
        if self.fail_map_at == Some(index) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let memory = self
            .slots
            .get(index as usize)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        self.mapped[index as usize] = true;
        Ok(MockMapping { index, memory })
    }

    fn unmap_buffer(&mut self, mapping: MockMapping) -> io::Result<()> {
        match self.mapped.get_mut(mapping.index as usize) {
            Some(mapped) if *mapped => {
                *mapped = false;
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        self.ensure_open()?;
        let memory = self
            .slots
            .get(index as usize)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        if self.kernel_queue.contains(&index) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if self.overwrite_on_queue {
            memory
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .fill(SCRIBBLE);
        }
        self.kernel_queue.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<Option<DriverBuffer>> {
        self.ensure_open()?;
        if !self.streaming {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.dequeue_calls += 1;
        if let Some(index) = self.forced_index.take() {
            self.kernel_queue.retain(|queued| *queued != index);
            return Ok(Some(DriverBuffer {
                index,
                bytes_used: 0,
                sequence: self.produced as u32,
                timestamp: None,
            }));
        }
        if let Some(n) = self.would_block_every {
            if self.dequeue_calls % n == 0 {
                return Ok(None);
            }
        }
        let Some(index) = self.kernel_queue.pop_front() else {
            return Ok(None);
        };
        let bytes_used = self.fill(index);
        Ok(Some(DriverBuffer {
            index,
            bytes_used: bytes_used as u32,
            sequence: (self.produced - 1) as u32,
            timestamp: Some(Duration::from_millis(self.produced * 33)), // ~30fps
        }))
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        self.stream_on_calls += 1;
        if self.fail_stream_on {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        self.streaming = false;
        self.kernel_queue.clear();
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<bool> {
        self.ensure_open()?;
        let ready = self.streaming && !self.kernel_queue.is_empty();
        if !ready {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(ready)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Mapping of one mock buffer.
pub struct MockMapping {
    index: u32,
    memory: SlotMemory,
}

impl SlotMapping for MockMapping {
    fn len(&self) -> usize {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn copy_prefix(&self, len: usize) -> Bytes {
        let memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        Bytes::copy_from_slice(&memory[..len.min(memory.len())])
    }
}

/// Generate a full YUYV frame for `pattern`.
pub fn generate_test_frame(width: u32, height: u32, pattern: TestPattern) -> Vec<u8> {
    let size = width as usize * height as usize * 2; // YUYV = 2 bytes/pixel
    let mut data = vec![0u8; size];

    match pattern {
        TestPattern::ColorBars => generate_color_bars(&mut data, width, height),
        TestPattern::Gradient => generate_gradient(&mut data, width, height),
        TestPattern::Solid(y, u, v) => generate_solid(&mut data, y, u, v),
    }

    data
}

fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    // White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];

    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let (y_val, u_val, v_val) = bars[(x / bar_width).min(7) as usize];
            let offset = (y as usize * width as usize + x as usize) * 2;
            if let Some(group) = data.get_mut(offset..offset + 4) {
                group.copy_from_slice(&[y_val, u_val, y_val, v_val]);
            }
        }
    }
}

fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            let y_val = ((u64::from(x) * 255) / u64::from(width)) as u8;
            let offset = (y as usize * width as usize + x as usize) * 2;
            if let Some(group) = data.get_mut(offset..offset + 4) {
                group.copy_from_slice(&[y_val, 128, y_val, 128]);
            }
        }
    }
}

fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for group in data.chunks_exact_mut(4) {
        group.copy_from_slice(&[y, u, y, v]);
    }
}

/// Spread packed rows `row` bytes long out to `pitch` bytes, zero-filling the gap.
fn with_pitch(packed: Vec<u8>, row: usize, pitch: usize) -> Vec<u8> {
    if row == 0 || pitch <= row {
        return packed;
    }
    let mut out = vec![0u8; packed.len() / row * pitch];
    for (src, dst) in packed.chunks_exact(row).zip(out.chunks_exact_mut(pitch)) {
        dst[..row].copy_from_slice(src);
    }
    out
}

fn generate_rgb(data: &mut [u8], width: u32, pitch: usize) {
    let row = width as usize * 3;
    let pitch = pitch.max(row).max(1);
    for (y, line) in data.chunks_mut(pitch).enumerate() {
        let end = row.min(line.len());
        for (x, px) in line[..end].chunks_exact_mut(3).enumerate() {
            px.copy_from_slice(&[x as u8, y as u8, 128]);
        }
    }
}

fn generate_jpeg_like(data: &mut [u8]) {
    data.fill(0);
    if data.len() >= 4 {
        let end = data.len();
        data[..2].copy_from_slice(&[0xFF, 0xD8]);
        data[end - 2..].copy_from_slice(&[0xFF, 0xD9]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_is_capped() {
        let mut driver = MockDriver::new().with_max_grant(3);
        assert_eq!(driver.request_buffers(8).unwrap(), 3);
        assert_eq!(driver.granted(), 3);
    }

    #[test]
    fn dequeue_returns_buffers_in_queue_order() {
        let mut driver = MockDriver::new();
        driver.set_format(16, 4, PixelFormat::Yuyv).unwrap();
        driver.request_buffers(2).unwrap();
        driver.queue(1).unwrap();
        driver.queue(0).unwrap();
        driver.stream_on().unwrap();

        let first = driver.dequeue().unwrap().unwrap();
        let second = driver.dequeue().unwrap().unwrap();
        assert_eq!((first.index, second.index), (1, 0));
        assert_eq!(first.bytes_used, 16 * 4 * 2);
        assert!(driver.dequeue().unwrap().is_none());
    }

    #[test]
    fn dequeue_before_stream_on_fails() {
        let mut driver = MockDriver::new();
        driver.request_buffers(2).unwrap();
        assert!(driver.dequeue().is_err());
    }

    #[test]
    fn color_bars_start_white() {
        let data = generate_test_frame(640, 480, TestPattern::ColorBars);
        assert_eq!(data.len(), 640 * 480 * 2);
        assert_eq!(&data[..4], &[235, 128, 235, 128]);
    }

    #[test]
    fn gradient_runs_dark_to_light() {
        let data = generate_test_frame(640, 480, TestPattern::Gradient);
        assert!(data[0] < 10);
        let last_row_start = 479 * 640 * 2;
        assert!(data[last_row_start + 638 * 2] > 200);
    }

    #[test]
    fn queued_tracks_the_device_queue() {
        let mut driver = MockDriver::new();
        driver.set_format(16, 4, PixelFormat::Yuyv).unwrap();
        driver.request_buffers(3).unwrap();
        for index in 0..3 {
            driver.queue(index).unwrap();
        }
        assert_eq!(driver.queued(), 3);
        // Queueing a slot twice is refused and does not grow the queue
        assert!(driver.queue(1).is_err());
        assert_eq!(driver.queued(), 3);

        driver.stream_on().unwrap();
        driver.dequeue().unwrap().unwrap();
        assert_eq!(driver.queued(), 2);
        driver.stream_off().unwrap();
        assert_eq!(driver.queued(), 0);
    }

    #[test]
    fn oversized_requests_are_adjusted_down() {
        let mut driver = MockDriver::new();
        let accepted = driver.set_format(70_000, 70_000, PixelFormat::Yuyv).unwrap();
        assert_eq!((accepted.width, accepted.height), (MAX_WIDTH, MAX_HEIGHT));
        assert_eq!(accepted.expected_frame_size(), 4096 * 2160 * 2);
    }

    #[test]
    fn padded_rows_carry_the_packed_pixels() {
        let mut driver = MockDriver::new()
            .with_pattern(TestPattern::Gradient)
            .with_row_padding(8);
        let accepted = driver.set_format(8, 2, PixelFormat::Yuyv).unwrap();
        assert_eq!(accepted.bytes_per_line, 24);
        assert_eq!(accepted.size_image, 48);

        driver.request_buffers(2).unwrap();
        let mapping = driver.map_buffer(0).unwrap();
        driver.queue(0).unwrap();
        driver.stream_on().unwrap();
        assert_eq!(driver.dequeue().unwrap().unwrap().bytes_used, 48);

        let data = mapping.copy_prefix(48);
        let packed = generate_test_frame(8, 2, TestPattern::Gradient);
        assert_eq!(&data[..16], &packed[..16]);
        assert!(data[16..24].iter().all(|b| *b == 0));
        assert_eq!(&data[24..40], &packed[16..32]);
    }

    #[test]
    fn queue_overwrites_when_asked() {
        let mut driver = MockDriver::new().with_overwrite_on_queue();
        driver.set_format(4, 2, PixelFormat::Yuyv).unwrap();
        driver.request_buffers(2).unwrap();
        let mapping = driver.map_buffer(0).unwrap();
        driver.queue(0).unwrap();
        assert!(mapping.copy_prefix(16).iter().all(|b| *b == SCRIBBLE));
    }
}
