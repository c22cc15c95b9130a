//! Decoded frames and the temporal frame window.
//!
//! - `Frame`: One decoded RGBA image. Owned by the pipeline that decoded it.
//! - `FrameWindow`: Ring buffer of the most recent `WINDOW_FRAMES` frames,
//!   handed to the motion gate on every new frame.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use zeroize::Zeroize;

use crate::BoundingBox;

/// Bytes per pixel of the fixed RGBA layout.
pub const FRAME_CHANNELS: usize = 4;

/// Capacity of the temporal window fed to the motion gate.
pub const WINDOW_FRAMES: usize = 3;

/// Region the motion gate believes contains movement.
pub type MotionRegion = BoundingBox;

/// Decoded RGBA frame.
///
/// Not `Clone`: a frame belongs to exactly one pipeline and moves through it.
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    /// Wraps an RGBA buffer. The buffer must hold exactly `width * height * 4` bytes.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = rgba_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGBA bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Raw RGBA bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGBA value at `(x, y)`; `None` when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * FRAME_CHANNELS;
        let px = self.pixels.get(idx..idx + FRAME_CHANNELS)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    pub fn same_dimensions(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // Camera imagery does not linger in freed memory.
        self.pixels.zeroize();
    }
}

pub(crate) fn rgba_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(FRAME_CHANNELS))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

/// Fixed-capacity window of the most recent frames, oldest first.
pub struct FrameWindow {
    frames: VecDeque<Frame>,
}

impl FrameWindow {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::with_capacity(WINDOW_FRAMES),
        }
    }

    /// Appends a frame, evicting the oldest when the window is full.
    pub fn push(&mut self, frame: Frame) {
        while self.frames.len() >= WINDOW_FRAMES {
            self.frames.pop_front(); // Drop triggers zeroize
        }
        self.frames.push_back(frame);
    }

    /// Frames in arrival order.
    pub fn frames(&self) -> impl ExactSizeIterator<Item = &Frame> + DoubleEndedIterator {
        self.frames.iter()
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    /// The two most recent frames as `(previous, latest)`.
    pub fn latest_pair(&self) -> Option<(&Frame, &Frame)> {
        let len = self.frames.len();
        if len < 2 {
            return None;
        }
        Some((&self.frames[len - 2], &self.frames[len - 1]))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() == WINDOW_FRAMES
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.frames.iter().map(|f| f.byte_len()).sum()
    }
}

impl Default for FrameWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(value: u8) -> Frame {
        Frame::new(2, 2, vec![value; 2 * 2 * FRAME_CHANNELS]).unwrap()
    }

    #[test]
    fn frame_rejects_wrong_buffer_length() {
        assert!(Frame::new(2, 2, vec![0; 15]).is_err());
        assert!(Frame::new(2, 2, vec![0; 16]).is_ok());
    }

    #[test]
    fn frame_pixel_lookup_is_row_major() {
        let mut data = vec![0u8; 2 * 2 * FRAME_CHANNELS];
        data[(2 + 1) * FRAME_CHANNELS..(2 + 1) * FRAME_CHANNELS + 4].copy_from_slice(&[9, 8, 7, 6]);
        let frame = Frame::new(2, 2, data).unwrap();
        assert_eq!(frame.pixel(1, 1), Some([9, 8, 7, 6]));
        assert_eq!(frame.pixel(2, 0), None);
    }

    #[test]
    fn window_keeps_last_three_in_arrival_order() {
        let mut window = FrameWindow::new();
        for value in 1..=7u8 {
            window.push(solid_frame(value));
            assert!(window.len() <= WINDOW_FRAMES);
        }

        let order: Vec<u8> = window.frames().map(|f| f.pixels()[0]).collect();
        assert_eq!(order, vec![5, 6, 7]);
        assert!(window.is_full());
    }

    #[test]
    fn window_tolerates_partial_fill() {
        let mut window = FrameWindow::new();
        assert!(window.latest_pair().is_none());
        window.push(solid_frame(1));
        assert!(window.latest_pair().is_none());
        window.push(solid_frame(2));
        let (prev, latest) = window.latest_pair().unwrap();
        assert_eq!(prev.pixels()[0], 1);
        assert_eq!(latest.pixels()[0], 2);
        assert_eq!(window.memory_bytes(), 32);
    }
}
