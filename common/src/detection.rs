//! Detections and bounding boxes.
//!
//! All coordinates are normalized to the image extent, i.e. `(0, 0)` is the top-left and `(1, 1)`
//! the bottom-right corner of the image the detection was made on.
use serde::{Deserialize, Serialize};

use crate::letters::letter_for;

/// One object reported by the detector for a single inference call.
///
/// The box is stored in center form as produced by the model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub class_index: usize,
    pub confidence: f32,
    pub cx: f32,
    pub cy: f32,
    pub width: f32,
    pub height: f32,
}

impl Detection {
    pub fn new(class_index: usize, confidence: f32, center_box: [f32; 4]) -> Self {
        let [cx, cy, width, height] = center_box;
        Self {
            class_index,
            confidence,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Letter of the detected class.
    pub fn letter(&self) -> char {
        letter_for(self.class_index)
    }

    /// The box in top-left form.
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_center(self.cx, self.cy, self.width, self.height)
    }
}

/// Bounding box in top-left form.
///
/// Values are not clamped, `x + w` or `y + h` may slightly exceed 1 when the model predicts a box
/// touching the image border.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            w,
            h,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Reflect the box on the vertical center line of the image.
    pub fn mirrored(&self) -> Self {
        Self {
            x: 1.0 - self.x - self.w,
            ..*self
        }
    }

    /// Corner points `[x_tl, y_tl, x_br, y_br]`.
    pub fn corners(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.w, self.y + self.h]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_center_conversion_is_exact() {
        let det = Detection::new(3, 0.9, [0.4, 0.6, 0.2, 0.3]);
        let bbox = det.bounding_box();
        let (cx, cy) = bbox.center();

        assert!((bbox.x - 0.3).abs() < f32::EPSILON);
        assert!((bbox.y - 0.45).abs() < f32::EPSILON);
        assert!((cx - det.cx).abs() < f32::EPSILON);
        assert!((cy - det.cy).abs() < f32::EPSILON);
    }

    #[test]
    fn test_no_clamping_at_border() {
        let bbox = BoundingBox::from_center(0.95, 0.02, 0.2, 0.1);
        assert!(bbox.x + bbox.w > 1.0);
        assert!(bbox.y < 0.0);
    }

    #[test]
    fn test_mirrored() {
        let bbox = BoundingBox {
            x: 0.1,
            y: 0.2,
            w: 0.3,
            h: 0.4,
        };
        let mirrored = bbox.mirrored();
        assert!((mirrored.x - 0.6).abs() < 1e-6);
        assert_eq!(mirrored.y, bbox.y);
        assert!((mirrored.mirrored().x - bbox.x).abs() < 1e-6);
    }
}
