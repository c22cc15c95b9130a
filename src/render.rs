//! Offline annotated GIF renderer.
//!
//! Turns a finished event's ordered boxes into a 1280x720, transparent,
//! forever-looping animation: each box is held until the next box starts (the
//! last one for whatever remains of the event), followed by a blank
//! zero-delay separator frame.
//!
//! Rendering is a pure function of its input. The GIF encoder quantizes with
//! a fixed speed setting and no randomness, so identical input yields
//! identical bytes.

use anyhow::{Context, Result};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{BoundingBox, Prediction};

pub const CANVAS_WIDTH: u32 = 1280;
pub const CANVAS_HEIGHT: u32 = 720;

const STROKE_WIDTH: u32 = 2;
const ENCODER_SPEED: i32 = 10;

fn default_color() -> [u8; 3] {
    [255, 0, 0]
}

/// One box to draw, in canvas coordinates, starting at `start_ms` into the event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderBox {
    pub start_ms: u64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_color")]
    pub color: [u8; 3],
}

impl RenderBox {
    /// Scales a prediction from its source frame onto the canvas.
    pub fn from_prediction(prediction: &Prediction, start_ms: u64) -> Self {
        let sx = |v: u32| scale(v, prediction.image_width, CANVAS_WIDTH);
        let sy = |v: u32| scale(v, prediction.image_height, CANVAS_HEIGHT);
        Self {
            start_ms,
            x: sx(prediction.bbox.x),
            y: sy(prediction.bbox.y),
            width: sx(prediction.bbox.width),
            height: sy(prediction.bbox.height),
            color: default_color(),
        }
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(self.x, self.y, self.width, self.height)
    }
}

fn scale(value: u32, from: u32, to: u32) -> u32 {
    if from == 0 {
        return value;
    }
    (value as u64 * to as u64 / from as u64) as u32
}

/// One frame of the output animation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Box {
        bbox: BoundingBox,
        color: [u8; 3],
        delay_ms: u64,
    },
    /// Cleared canvas separating boxes.
    Blank { delay_ms: u64 },
}

impl Segment {
    pub fn delay_ms(&self) -> u64 {
        match self {
            Segment::Box { delay_ms, .. } | Segment::Blank { delay_ms } => *delay_ms,
        }
    }
}

/// Frame plan for `boxes` (ordered by start) over an event of `total_ms`.
pub fn plan_segments(boxes: &[RenderBox], total_ms: u64) -> Vec<Segment> {
    let mut remaining = total_ms;
    let mut segments = Vec::with_capacity(boxes.len() * 2);
    for (i, current) in boxes.iter().enumerate() {
        let delay_ms = match boxes.get(i + 1) {
            Some(next) => next.start_ms.saturating_sub(current.start_ms),
            None => remaining,
        };
        remaining = remaining.saturating_sub(delay_ms);
        segments.push(Segment::Box {
            bbox: current.bbox(),
            color: current.color,
            delay_ms,
        });
        segments.push(Segment::Blank { delay_ms: 0 });
    }
    segments
}

/// Encodes the animation and returns the GIF bytes.
pub fn render(boxes: &[RenderBox], total_ms: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new_with_speed(&mut out, ENCODER_SPEED);
        encoder
            .set_repeat(Repeat::Infinite)
            .context("set gif repeat")?;
        for segment in plan_segments(boxes, total_ms) {
            let mut canvas = RgbaImage::new(CANVAS_WIDTH, CANVAS_HEIGHT);
            if let Segment::Box { bbox, color, .. } = &segment {
                stroke_rect(&mut canvas, bbox, Rgba([color[0], color[1], color[2], 255]));
            }
            let delay = Delay::from_numer_denom_ms(segment.delay_ms().min(u32::MAX as u64) as u32, 1);
            encoder
                .encode_frame(Frame::from_parts(canvas, 0, 0, delay))
                .context("encode gif frame")?;
        }
    }
    Ok(out)
}

pub fn render_to_file(boxes: &[RenderBox], total_ms: u64, output: &Path) -> Result<()> {
    let bytes = render(boxes, total_ms)?;
    std::fs::write(output, bytes).with_context(|| format!("write {}", output.display()))?;
    Ok(())
}

fn stroke_rect(canvas: &mut RgbaImage, bbox: &BoundingBox, color: Rgba<u8>) {
    if bbox.is_empty() {
        return;
    }
    let (w, h) = canvas.dimensions();
    let x0 = bbox.x;
    let y0 = bbox.y;
    let x1 = bbox.x.saturating_add(bbox.width);
    let y1 = bbox.y.saturating_add(bbox.height);
    for y in y0..y1.min(h) {
        for x in x0..x1.min(w) {
            let on_edge = x < x0 + STROKE_WIDTH
                || x + STROKE_WIDTH >= x1
                || y < y0 + STROKE_WIDTH
                || y + STROKE_WIDTH >= y1;
            if on_edge {
                canvas.put_pixel(x, y, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifDecoder;
    use image::AnimationDecoder;
    use std::io::Cursor;

    fn boxes() -> Vec<RenderBox> {
        vec![
            RenderBox {
                start_ms: 0,
                x: 1,
                y: 1,
                width: 2,
                height: 2,
                color: default_color(),
            },
            RenderBox {
                start_ms: 500,
                x: 3,
                y: 3,
                width: 4,
                height: 4,
                color: default_color(),
            },
        ]
    }

    #[test]
    fn plan_alternates_boxes_and_blank_separators() {
        let plan = plan_segments(&boxes(), 1000);
        let delays: Vec<u64> = plan.iter().map(Segment::delay_ms).collect();
        assert_eq!(delays, vec![500, 0, 500, 0]);
        assert!(matches!(plan[0], Segment::Box { bbox, .. } if bbox == BoundingBox::new(1, 1, 2, 2)));
        assert!(matches!(plan[1], Segment::Blank { .. }));
        assert!(matches!(plan[2], Segment::Box { bbox, .. } if bbox == BoundingBox::new(3, 3, 4, 4)));
    }

    #[test]
    fn last_box_never_gets_negative_time() {
        let plan = plan_segments(&boxes(), 300);
        let delays: Vec<u64> = plan.iter().map(Segment::delay_ms).collect();
        assert_eq!(delays, vec![500, 0, 0, 0]);
    }

    #[test]
    fn rendered_gif_has_canvas_size_and_frame_delays() {
        let bytes = render(&boxes(), 1000).unwrap();
        let decoder = GifDecoder::new(Cursor::new(&bytes)).unwrap();
        let frames = decoder.into_frames().collect_frames().unwrap();
        assert_eq!(frames.len(), 4);

        let delays: Vec<u32> = frames
            .iter()
            .map(|f| {
                let (numer, denom) = f.delay().numer_denom_ms();
                numer / denom
            })
            .collect();
        assert_eq!(delays, vec![500, 0, 500, 0]);
        assert_eq!(frames[0].buffer().dimensions(), (CANVAS_WIDTH, CANVAS_HEIGHT));
        // Outside the box stays transparent.
        assert_eq!(frames[0].buffer().get_pixel(100, 100)[3], 0);
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(render(&boxes(), 1000).unwrap(), render(&boxes(), 1000).unwrap());
    }

    #[test]
    fn predictions_scale_onto_canvas() {
        let prediction = Prediction {
            label: "human".to_string(),
            bbox: BoundingBox::new(10, 20, 30, 40),
            detected_on_ms: 0,
            image_width: 640,
            image_height: 360,
        };
        let scaled = RenderBox::from_prediction(&prediction, 250);
        assert_eq!(scaled.bbox(), BoundingBox::new(20, 40, 60, 80));
        assert_eq!(scaled.start_ms, 250);
    }
}
