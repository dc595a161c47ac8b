//! Overlay of the live detection onto camera frames.
use std::path::Path;

use common::detection::{BoundingBox, Detection};
use image::{imageops::flip_horizontal_in_place, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use rusttype::{Font, Scale};

/// Minimum confidence for a detection to be drawn on the live stream.
///
/// Higher than the single-shot threshold on purpose.
pub const OVERLAY_MIN_CONFIDENCE: f32 = 0.3;

const GREEN: Rgb<u8> = Rgb([34, 197, 94]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const GRAY: Rgb<u8> = Rgb([100, 100, 100]);

const BOX_THICKNESS: u32 = 4;
const LABEL_SCALE: Scale = Scale { x: 28.0, y: 28.0 };
const LABEL_PADDING: i32 = 7;

/// The detection drawn onto a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionSummary {
    pub letter: char,
    pub confidence: f32,
}

/// Draws the live detection overlay.
///
/// Labels need a TrueType font. Without one only the boxes are drawn.
pub struct FrameAnnotator {
    font: Option<Font<'static>>,
}

impl FrameAnnotator {
    pub fn new(font: Option<Font<'static>>) -> Self {
        Self { font }
    }

    /// Create an annotator with the font at `path`, falling back to no labels.
    pub fn with_font_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let font = match std::fs::read(path) {
            Ok(data) => Font::try_from_vec(data),
            Err(err) => {
                log::warn!("Failed to read font {}: {}", path.display(), err);
                None
            }
        };

        if font.is_none() {
            log::warn!("No usable font at {}, labels are disabled", path.display());
        }

        Self::new(font)
    }

    /// Mirror the frame and draw the first detection above the overlay threshold.
    ///
    /// Detections refer to the unmirrored frame. Returns a summary of the drawn detection, if
    /// any was drawn.
    pub fn annotate(
        &self,
        mut frame: RgbImage,
        detections: &[Detection],
    ) -> (RgbImage, Option<DetectionSummary>) {
        flip_horizontal_in_place(&mut frame);

        let summary = detections
            .iter()
            .filter(|detection| detection.confidence >= OVERLAY_MIN_CONFIDENCE)
            .find_map(|detection| {
                let bbox = detection.bounding_box().mirrored();
                self.draw_detection(&mut frame, &bbox, detection)
            });

        (frame, summary)
    }

    /// Draw box and label. Returns `None` without touching the frame if the box is not drawable.
    fn draw_detection(
        &self,
        frame: &mut RgbImage,
        bbox: &BoundingBox,
        detection: &Detection,
    ) -> Option<DetectionSummary> {
        let rect = pixel_rect(bbox, frame.width(), frame.height())?;

        for inset in 0..BOX_THICKNESS {
            let (width, height) = (
                rect.width().saturating_sub(2 * inset),
                rect.height().saturating_sub(2 * inset),
            );
            if width == 0 || height == 0 {
                break;
            }
            let inner = Rect::at(rect.left() + inset as i32, rect.top() + inset as i32)
                .of_size(width, height);
            draw_hollow_rect_mut(frame, inner, GREEN);
        }

        let letter = detection.letter();
        if let Some(font) = &self.font {
            let label = format!("{} {:.0}%", letter, detection.confidence * 100.0);
            draw_label(frame, font, &label, rect.left(), rect.top());
        }

        Some(DetectionSummary {
            letter,
            confidence: detection.confidence,
        })
    }

    /// Black frame with a centered message, shown while no camera is active.
    pub fn placeholder(&self, width: u32, height: u32, message: &str) -> RgbImage {
        let mut frame = RgbImage::new(width, height);

        if let Some(font) = &self.font {
            let scale = Scale { x: 48.0, y: 48.0 };
            let (text_width, text_height) = text_size(scale, font, message);
            let x = (width as i32 - text_width) / 2;
            let y = (height as i32 - text_height) / 2;
            draw_text_mut(&mut frame, GRAY, x, y, scale, font, message);
        }

        frame
    }
}

/// Label on a filled background above the top-left corner of the box.
fn draw_label(frame: &mut RgbImage, font: &Font<'_>, label: &str, x: i32, y: i32) {
    let (text_width, text_height) = text_size(LABEL_SCALE, font, label);
    if text_width <= 0 || text_height <= 0 {
        return;
    }

    let label_top = (y - text_height - 3 * LABEL_PADDING).max(0);
    let background = Rect::at(x, label_top).of_size(
        (text_width + 2 * LABEL_PADDING) as u32,
        (text_height + 2 * LABEL_PADDING) as u32,
    );
    draw_filled_rect_mut(frame, background, GREEN);
    draw_text_mut(
        frame,
        WHITE,
        x + LABEL_PADDING,
        label_top + LABEL_PADDING,
        LABEL_SCALE,
        font,
        label,
    );
}

/// Pixel rectangle of a normalized box, clipped to the frame.
///
/// `None` if nothing of the box is inside the frame.
fn pixel_rect(bbox: &BoundingBox, width: u32, height: u32) -> Option<Rect> {
    let [x_tl, y_tl, x_br, y_br] = bbox.corners();
    let (width, height) = (width as f32, height as f32);

    let left = (x_tl * width).round().max(0.0);
    let top = (y_tl * height).round().max(0.0);
    let right = (x_br * width).round().min(width);
    let bottom = (y_br * height).round().min(height);

    // Negated comparison to also catch NaN coordinates
    if !(right > left && bottom > top) {
        return None;
    }

    Some(
        Rect::at(left as i32, top as i32).of_size((right - left) as u32, (bottom - top) as u32),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn det(class_index: usize, confidence: f32, center_box: [f32; 4]) -> Detection {
        Detection::new(class_index, confidence, center_box)
    }

    fn frame() -> RgbImage {
        // Left half red, right half blue
        RgbImage::from_fn(100, 80, |x, _| match x < 50 {
            true => Rgb([255, 0, 0]),
            false => Rgb([0, 0, 255]),
        })
    }

    #[test]
    fn test_mirrors_without_detections() {
        let (annotated, summary) = FrameAnnotator::new(None).annotate(frame(), &[]);

        assert!(summary.is_none());
        assert_eq!(annotated.get_pixel(0, 0), &Rgb([0, 0, 255]));
        assert_eq!(annotated.get_pixel(99, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_first_above_threshold_not_best() {
        let detections = [
            det(0, 0.29, [0.5, 0.5, 0.2, 0.2]),
            det(1, 0.4, [0.25, 0.5, 0.2, 0.2]),
            det(2, 0.9, [0.75, 0.5, 0.2, 0.2]),
        ];

        let (_, summary) = FrameAnnotator::new(None).annotate(frame(), &detections);

        assert_eq!(
            summary,
            Some(DetectionSummary {
                letter: 'B',
                confidence: 0.4
            })
        );
    }

    #[test]
    fn test_box_is_mirrored() {
        // Box on the left side of the camera image spans x in 10..30
        let detections = [det(0, 0.8, [0.2, 0.5, 0.2, 0.5])];
        let (annotated, summary) = FrameAnnotator::new(None).annotate(frame(), &detections);

        assert!(summary.is_some());
        // After mirroring it spans x in 70..90, top edge at y = 20
        assert_eq!(annotated.get_pixel(70, 20), &GREEN);
        assert_eq!(annotated.get_pixel(80, 20), &GREEN);
        assert_ne!(annotated.get_pixel(20, 20), &GREEN);
    }

    #[test]
    fn test_undrawable_box_is_skipped() {
        let detections = [
            det(0, 0.9, [2.0, 2.0, 0.1, 0.1]),
            det(1, 0.9, [0.5, 0.5, 0.0, 0.0]),
            det(2, 0.9, [f32::NAN, 0.5, 0.1, 0.1]),
        ];
        let (annotated, summary) = FrameAnnotator::new(None).annotate(frame(), &detections);

        assert!(summary.is_none());
        assert_eq!(annotated.dimensions(), (100, 80));
    }

    #[test]
    fn test_skips_to_next_drawable_box() {
        let detections = [
            det(0, 0.9, [5.0, 5.0, 0.1, 0.1]),
            det(3, 0.5, [0.5, 0.5, 0.3, 0.3]),
        ];
        let (_, summary) = FrameAnnotator::new(None).annotate(frame(), &detections);

        assert_eq!(summary.map(|s| s.letter), Some('D'));
    }

    #[test]
    fn test_border_box_is_clipped() {
        let rect = pixel_rect(&BoundingBox::from_center(0.95, 0.5, 0.2, 0.2), 100, 80)
            .expect("partially visible");
        assert_eq!(rect.right(), 99);
    }

    #[test]
    fn test_placeholder_without_font() {
        let placeholder = FrameAnnotator::new(None).placeholder(64, 48, "Camera Off");
        assert_eq!(placeholder.dimensions(), (64, 48));
        assert!(placeholder.pixels().all(|p| p == &Rgb([0, 0, 0])));
    }

    #[test]
    fn test_missing_font_file() {
        let annotator = FrameAnnotator::with_font_file("/nonexistent/font.ttf");
        assert!(annotator.font.is_none());
    }
}
