use anyhow::Result;

use crate::frame::{FrameWindow, MotionRegion, FRAME_CHANNELS};

/// Decides whether the current window contains movement.
///
/// Implementations receive up to `WINDOW_FRAMES` frames in arrival order and
/// must tolerate a partially filled window.
pub trait MotionGate: Send {
    fn name(&self) -> &'static str;

    /// `None` for "no motion", otherwise exactly one region.
    fn motion_region(&mut self, window: &FrameWindow) -> Result<Option<MotionRegion>>;
}

/// Frame-differencing gate over the two most recent frames.
///
/// Pixels are sampled on a grid of `step` pixels. A sample has changed when
/// its luma differs by more than `pixel_threshold`; motion is reported when
/// the changed share of samples exceeds `min_changed_ratio`. The region is the
/// bounding box of all changed samples.
#[derive(Clone, Debug)]
pub struct PixelDiffGate {
    pub pixel_threshold: u8,
    pub min_changed_ratio: f32,
    pub step: u32,
}

impl Default for PixelDiffGate {
    fn default() -> Self {
        Self {
            pixel_threshold: 25,
            min_changed_ratio: 0.002,
            step: 2,
        }
    }
}

impl PixelDiffGate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MotionGate for PixelDiffGate {
    fn name(&self) -> &'static str {
        "pixel-diff"
    }

    fn motion_region(&mut self, window: &FrameWindow) -> Result<Option<MotionRegion>> {
        let Some((previous, latest)) = window.latest_pair() else {
            return Ok(None);
        };
        if !previous.same_dimensions(latest) {
            return Ok(None);
        }

        let step = self.step.max(1);
        let width = latest.width;
        let height = latest.height;
        let (prev_px, next_px) = (previous.pixels(), latest.pixels());

        let mut sampled: u64 = 0;
        let mut changed: u64 = 0;
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);

        for y in (0..height).step_by(step as usize) {
            let row = y as usize * width as usize;
            for x in (0..width).step_by(step as usize) {
                sampled += 1;
                let idx = (row + x as usize) * FRAME_CHANNELS;
                let delta = luma(&prev_px[idx..idx + 3]).abs_diff(luma(&next_px[idx..idx + 3]));
                if delta > self.pixel_threshold {
                    changed += 1;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        if sampled == 0 || changed == 0 {
            return Ok(None);
        }
        if (changed as f64 / sampled as f64) <= self.min_changed_ratio as f64 {
            return Ok(None);
        }

        // Each sample stands for a step x step cell.
        let right = (max_x + step).min(width);
        let bottom = (max_y + step).min(height);
        Ok(Some(MotionRegion::new(
            min_x,
            min_y,
            right - min_x,
            bottom - min_y,
        )))
    }
}

// ITU-R BT.601 integer approximation.
fn luma(rgb: &[u8]) -> u8 {
    let r = rgb[0] as u32;
    let g = rgb[1] as u32;
    let b = rgb[2] as u32;
    ((77 * r + 150 * g + 29 * b) >> 8) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn frame_with_square(w: u32, h: u32, square: Option<(u32, u32, u32)>) -> Frame {
        let mut pixels = vec![0u8; (w * h) as usize * FRAME_CHANNELS];
        if let Some((sx, sy, size)) = square {
            for y in sy..sy + size {
                for x in sx..sx + size {
                    let idx = (y * w + x) as usize * FRAME_CHANNELS;
                    pixels[idx..idx + 4].copy_from_slice(&[255, 255, 255, 255]);
                }
            }
        }
        Frame::new(w, h, pixels).unwrap()
    }

    #[test]
    fn single_frame_reports_no_motion() {
        let mut gate = PixelDiffGate::new();
        let mut window = FrameWindow::new();
        window.push(frame_with_square(16, 16, None));
        assert_eq!(gate.motion_region(&window).unwrap(), None);
    }

    #[test]
    fn static_scene_reports_no_motion() {
        let mut gate = PixelDiffGate::new();
        let mut window = FrameWindow::new();
        window.push(frame_with_square(16, 16, Some((4, 4, 4))));
        window.push(frame_with_square(16, 16, Some((4, 4, 4))));
        assert_eq!(gate.motion_region(&window).unwrap(), None);
    }

    #[test]
    fn appearing_object_is_localized() {
        let mut gate = PixelDiffGate {
            step: 1,
            ..PixelDiffGate::default()
        };
        let mut window = FrameWindow::new();
        window.push(frame_with_square(32, 32, None));
        window.push(frame_with_square(32, 32, Some((8, 10, 6))));

        let region = gate.motion_region(&window).unwrap().unwrap();
        assert_eq!(region, MotionRegion::new(8, 10, 6, 6));
    }

    #[test]
    fn mismatched_dimensions_are_ignored() {
        let mut gate = PixelDiffGate::new();
        let mut window = FrameWindow::new();
        window.push(frame_with_square(16, 16, None));
        window.push(frame_with_square(8, 8, Some((0, 0, 8))));
        assert_eq!(gate.motion_region(&window).unwrap(), None);
    }
}
