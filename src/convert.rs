//! Pixel conversion and sample statistics. Pure functions over frame bytes.

use std::fmt;

use crate::capture::PixelFormat;
use crate::error::ConvertError;

/// Edge of the centered square sampled by [`summarize`] unless configured otherwise.
pub const DEFAULT_SAMPLE_WINDOW: u32 = 100;

#[inline]
fn clip(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// BT.601 studio-range integer conversion of one luma sample with its chroma pair.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    [
        clip((298 * c + 409 * e + 128) >> 8),
        clip((298 * c - 100 * d - 208 * e + 128) >> 8),
        clip((298 * c + 516 * d + 128) >> 8),
    ]
}

fn require_len(raw: &[u8], expected: usize) -> Result<(), ConvertError> {
    if raw.len() < expected {
        return Err(ConvertError::FrameTooShort {
            expected,
            actual: raw.len(),
        });
    }
    Ok(())
}

/// Bytes between the starts of two rows. A `stride` shorter than a packed
/// row (including 0) means the rows are packed.
fn line_pitch(width: u32, stride: u32, bpp: usize) -> usize {
    (width as usize * bpp).max(stride as usize)
}

/// Convert one frame into interleaved 8-bit RGB (3 bytes per pixel).
/// `stride` is the driver's bytes per line; row padding is skipped.
pub fn to_rgb(
    raw: &[u8],
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
) -> Result<Vec<u8>, ConvertError> {
    let Some(bpp) = format.bytes_per_pixel() else {
        return Err(ConvertError::Unsupported(format));
    };
    if format == PixelFormat::Yuyv && width % 2 != 0 {
        return Err(ConvertError::OddWidth(width));
    }

    let row = width as usize * bpp;
    let pitch = line_pitch(width, stride, bpp);
    let needed = match height as usize {
        0 => 0,
        rows => pitch * (rows - 1) + row,
    };
    require_len(raw, needed)?;

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    if row == 0 {
        return Ok(rgb);
    }
    for line in raw.chunks(pitch).take(height as usize) {
        let line = &line[..row];
        if format == PixelFormat::Rgb24 {
            rgb.extend_from_slice(line);
            continue;
        }
        // [Y0 U Y1 V]: two pixels sharing one chroma pair
        for group in line.chunks_exact(4) {
            let (u, v) = (group[1], group[3]);
            rgb.extend_from_slice(&yuv_to_rgb(group[0], u, v));
            rgb.extend_from_slice(&yuv_to_rgb(group[2], u, v));
        }
    }
    Ok(rgb)
}

/// Average, minimum and maximum of one color component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentStats {
    pub label: char,
    pub avg: f64,
    pub min: u8,
    pub max: u8,
    pub samples: u64,
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    sum: u64,
    min: u8,
    max: u8,
    samples: u64,
}

impl Accumulator {
    const fn new() -> Self {
        Self {
            sum: 0,
            min: u8::MAX,
            max: u8::MIN,
            samples: 0,
        }
    }

    fn add(&mut self, value: u8) {
        self.sum += u64::from(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.samples += 1;
    }

    fn finish(self, label: char) -> ComponentStats {
        ComponentStats {
            label,
            avg: self.sum as f64 / self.samples.max(1) as f64,
            min: self.min,
            max: self.max,
            samples: self.samples,
        }
    }
}

/// Statistics over a centered sample window.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSummary {
    /// Sampled region as `(x, y, width, height)` in pixels.
    pub window: (u32, u32, u32, u32),
    pub components: Vec<ComponentStats>,
}

impl FrameSummary {
    pub fn component(&self, label: char) -> Option<&ComponentStats> {
        self.components.iter().find(|c| c.label == label)
    }
}

impl fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y, w, h) = self.window;
        write!(f, "sample area {w}x{h} at ({x},{y})")?;
        for c in &self.components {
            write!(
                f,
                "; {}: avg={:.1}, min={}, max={}",
                c.label, c.avg, c.min, c.max
            )?;
        }
        Ok(())
    }
}

/// Statistics over a `window` x `window` square at the frame center
/// (clamped to the frame). Only that square is read, never the full frame.
/// A partial frame is sampled up to its last complete pixel group.
///
/// For YUYV the square starts on an even pixel. Every pixel in it adds one
/// Y sample; U and V are sampled once per pixel pair touched.
pub fn summarize(
    raw: &[u8],
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    window: u32,
) -> Result<FrameSummary, ConvertError> {
    let win_w = window.min(width);
    let win_h = window.min(height);
    let mut start_x = (width - win_w) / 2;
    let start_y = (height - win_h) / 2;

    let (labels, accs) = match format {
        PixelFormat::Yuyv => {
            if width % 2 != 0 {
                return Err(ConvertError::OddWidth(width));
            }
            // Align to a pixel pair so every group reads [Y0 U Y1 V]
            start_x &= !1;
            let end_x = start_x + win_w;
            let pitch = line_pitch(width, stride, 2);
            let mut acc = [Accumulator::new(); 3];
            'rows: for row in start_y..start_y + win_h {
                for x in (start_x..end_x).step_by(2) {
                    let offset = row as usize * pitch + x as usize * 2;
                    let Some(group) = raw.get(offset..offset + 4) else {
                        break 'rows;
                    };
                    acc[0].add(group[0]);
                    if x + 1 < end_x {
                        acc[0].add(group[2]);
                    }
                    acc[1].add(group[1]);
                    acc[2].add(group[3]);
                }
            }
            (['Y', 'U', 'V'], acc)
        }
        PixelFormat::Rgb24 => {
            let pitch = line_pitch(width, stride, 3);
            let mut acc = [Accumulator::new(); 3];
            'rows: for row in start_y..start_y + win_h {
                for x in start_x..start_x + win_w {
                    let offset = row as usize * pitch + x as usize * 3;
                    let Some(px) = raw.get(offset..offset + 3) else {
                        break 'rows;
                    };
                    for (acc, value) in acc.iter_mut().zip(px) {
                        acc.add(*value);
                    }
                }
            }
            (['R', 'G', 'B'], acc)
        }
        PixelFormat::Mjpeg | PixelFormat::Other(_) => {
            return Err(ConvertError::Unsupported(format))
        }
    };

    if accs[0].samples == 0 {
        return Err(ConvertError::EmptySample);
    }

    Ok(FrameSummary {
        window: (start_x, start_y, win_w, win_h),
        components: labels
            .iter()
            .zip(accs)
            .map(|(label, acc)| acc.finish(*label))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::{generate_test_frame, TestPattern};

    fn solid(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
        generate_test_frame(width, height, TestPattern::Solid(y, u, v))
    }

    #[test]
    fn black_and_white_hit_the_rails() {
        assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(235, 128, 128), [255, 255, 255]);
    }

    #[test]
    fn matches_integer_formula_bit_for_bit() {
        // Hand-computed: c=65, d=-74, e=112
        //   R = (19370 + 45808 + 128) >> 8 = 255 (clipped from 255.1)
        //   G = (19370 + 7400 - 23296 + 128) >> 8 = 14
        //   B = (19370 - 38184 + 128) >> 8 = -73 -> 0
        assert_eq!(yuv_to_rgb(81, 54, 240), [255, 14, 0]);
        // c=112, d=0, e=0: (33376 + 128) >> 8 = 130
        assert_eq!(yuv_to_rgb(128, 128, 128), [130, 130, 130]);
    }

    #[test]
    fn exhaustive_against_reference_formula() {
        for y in (0..=255u8).step_by(5) {
            for u in (0..=255u8).step_by(15) {
                for v in (0..=255u8).step_by(15) {
                    let (c, d, e) = (y as i32 - 16, u as i32 - 128, v as i32 - 128);
                    let r = ((298 * c + 409 * e + 128) >> 8).clamp(0, 255) as u8;
                    let g = ((298 * c - 100 * d - 208 * e + 128) >> 8).clamp(0, 255) as u8;
                    let b = ((298 * c + 516 * d + 128) >> 8).clamp(0, 255) as u8;
                    assert_eq!(yuv_to_rgb(y, u, v), [r, g, b]);
                }
            }
        }
    }

    #[test]
    fn yuyv_pairs_share_chroma() {
        // Pair 0: Y0=16, Y1=235 neutral chroma; pair 1: Y=128 neutral
        let raw = [16, 128, 235, 128, 128, 128, 128, 128];
        let rgb = to_rgb(&raw, 4, 1, 0, PixelFormat::Yuyv).unwrap();
        assert_eq!(
            rgb,
            vec![0, 0, 0, 255, 255, 255, 130, 130, 130, 130, 130, 130]
        );
    }

    #[test]
    fn rgb_output_has_three_bytes_per_pixel() {
        let raw = solid(64, 48, 235, 128, 128);
        let rgb = to_rgb(&raw, 64, 48, 128, PixelFormat::Yuyv).unwrap();
        assert_eq!(rgb.len(), 64 * 48 * 3);
        assert!(rgb.iter().all(|b| *b == 255));
    }

    #[test]
    fn rgb24_passes_through() {
        let raw: Vec<u8> = (0..2 * 2 * 3).collect();
        assert_eq!(to_rgb(&raw, 2, 2, 6, PixelFormat::Rgb24).unwrap(), raw);
    }

    #[test]
    fn short_and_odd_inputs_are_rejected() {
        assert_eq!(
            to_rgb(&[0; 6], 2, 2, 0, PixelFormat::Yuyv).unwrap_err(),
            ConvertError::FrameTooShort {
                expected: 8,
                actual: 6
            }
        );
        assert_eq!(
            to_rgb(&[0; 12], 3, 2, 0, PixelFormat::Yuyv).unwrap_err(),
            ConvertError::OddWidth(3)
        );
        assert_eq!(
            to_rgb(&[0; 12], 2, 2, 0, PixelFormat::Mjpeg).unwrap_err(),
            ConvertError::Unsupported(PixelFormat::Mjpeg)
        );
    }

    #[test]
    fn summary_of_solid_frame() {
        let raw = solid(640, 480, 100, 60, 200);
        let summary = summarize(&raw, 640, 480, 1280, PixelFormat::Yuyv, 100).unwrap();
        assert_eq!(summary.window, (270, 190, 100, 100));

        let y = summary.component('Y').unwrap();
        assert_eq!((y.avg, y.min, y.max), (100.0, 100, 100));
        assert_eq!(y.samples, 100 * 100);
        let u = summary.component('U').unwrap();
        assert_eq!((u.min, u.max, u.samples), (60, 60, 100 * 50));
        assert_eq!(summary.component('V').unwrap().avg, 200.0);
    }

    #[test]
    fn summary_reads_only_the_center() {
        // Gradient: luma rises left to right, so the center window must
        // miss both the darkest and the brightest columns.
        let raw = generate_test_frame(640, 480, TestPattern::Gradient);
        let summary = summarize(&raw, 640, 480, 1280, PixelFormat::Yuyv, 100).unwrap();
        let y = summary.component('Y').unwrap();
        assert!(y.min > 90 && y.max < 170, "{summary}");
    }

    #[test]
    fn window_is_clamped_to_small_frames() {
        let raw = solid(8, 4, 50, 128, 128);
        let summary = summarize(&raw, 8, 4, 16, PixelFormat::Yuyv, 100).unwrap();
        assert_eq!(summary.window, (0, 0, 8, 4));
        assert_eq!(summary.component('Y').unwrap().samples, 32);
    }

    #[test]
    fn partial_frame_is_sampled_up_to_its_end() {
        let raw = solid(640, 480, 100, 128, 128);
        let half = &raw[..raw.len() / 2];
        // Center rows start at 190, half the frame ends at row 240
        let summary = summarize(half, 640, 480, 1280, PixelFormat::Yuyv, 100).unwrap();
        assert_eq!(summary.component('Y').unwrap().samples, 50 * 100);

        let none = &raw[..1000];
        assert_eq!(
            summarize(none, 640, 480, 1280, PixelFormat::Yuyv, 100).unwrap_err(),
            ConvertError::EmptySample
        );
    }

    #[test]
    fn rgb24_summary_uses_rgb_labels() {
        let raw: Vec<u8> = std::iter::repeat([10u8, 20, 30])
            .take(16)
            .flatten()
            .collect();
        let summary = summarize(&raw, 4, 4, 0, PixelFormat::Rgb24, 2).unwrap();
        assert_eq!(summary.window, (1, 1, 2, 2));
        let labels: Vec<char> = summary.components.iter().map(|c| c.label).collect();
        assert_eq!(labels, vec!['R', 'G', 'B']);
        assert_eq!(summary.component('B').unwrap().avg, 30.0);
    }

    #[test]
    fn odd_window_samples_a_square() {
        let raw = solid(8, 8, 90, 100, 110);
        let summary = summarize(&raw, 8, 8, 16, PixelFormat::Yuyv, 5).unwrap();
        assert_eq!(summary.window, (0, 1, 5, 5));
        assert_eq!(summary.component('Y').unwrap().samples, 25);
        // Pairs (0,1) (2,3) (4,_) on each of 5 rows
        assert_eq!(summary.component('U').unwrap().samples, 15);
        assert_eq!(summary.component('V').unwrap().avg, 110.0);
    }

    #[test]
    fn row_padding_is_skipped() {
        // 4x2 YUYV, 8 bytes of pixels then 4 bytes of padding per row
        let packed = [
            16, 128, 235, 128, 128, 128, 128, 128, //
            235, 128, 16, 128, 81, 54, 81, 240,
        ];
        let mut padded = Vec::new();
        for line in packed.chunks(8) {
            padded.extend_from_slice(line);
            padded.extend_from_slice(&[0xFF; 4]);
        }

        assert_eq!(
            to_rgb(&padded, 4, 2, 12, PixelFormat::Yuyv).unwrap(),
            to_rgb(&packed, 4, 2, 0, PixelFormat::Yuyv).unwrap()
        );
        // The last row needs no trailing padding
        assert!(to_rgb(&padded[..20], 4, 2, 12, PixelFormat::Yuyv).is_ok());

        let summary = summarize(&padded, 4, 2, 12, PixelFormat::Yuyv, 4).unwrap();
        let y = summary.component('Y').unwrap();
        assert_eq!((y.min, y.max, y.samples), (16, 235, 8));
    }

    #[test]
    fn odd_width_is_rejected_by_summary() {
        assert_eq!(
            summarize(&[0; 12], 3, 2, 0, PixelFormat::Yuyv, 2).unwrap_err(),
            ConvertError::OddWidth(3)
        );
    }
}
