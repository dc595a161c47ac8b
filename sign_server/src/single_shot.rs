//! Single-shot detection on one uploaded frame.
//!
//! Stateless apart from the shared model; requests run fully in parallel.
use std::sync::Arc;

use common::{
    detection::Detection,
    letters::NO_LETTER,
    protocol::{Bone, DetectionResult, Keypoint},
};

use crate::detector::ModelSlot;

/// Minimum confidence for a detection to be reported.
pub const SINGLE_SHOT_MIN_CONFIDENCE: f32 = 0.2;

/// Offset of the outer skeleton points from the box center, relative to the box height.
const SKELETON_OFFSET: f32 = 0.2;

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("Invalid base64 image")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("Invalid image data")]
    InvalidImage(#[from] image::ImageError),

    #[error("Model not loaded")]
    ModelUnavailable,

    #[error("Model inference failed: {0}")]
    InferenceFailure(String),
}

pub struct SingleShotDetectionService {
    model: Arc<ModelSlot>,
}

impl SingleShotDetectionService {
    pub fn new(model: Arc<ModelSlot>) -> Self {
        Self { model }
    }

    /// Detect the most confident hand sign in a base64 image or data URL.
    pub fn detect(&self, data_url: &str) -> Result<DetectionResult, DetectError> {
        let detector = self.model.get().ok_or(DetectError::ModelUnavailable)?;

        let image = decode_image(data_url)?;
        let detections = detector
            .infer(&image)
            .map_err(|err| DetectError::InferenceFailure(format!("{err:#}")))?;

        Ok(match best_detection(&detections, SINGLE_SHOT_MIN_CONFIDENCE) {
            None => no_detection(),
            Some(detection) => {
                log::info!(
                    "Detected letter '{}' with confidence {:.3}",
                    detection.letter(),
                    detection.confidence
                );
                detection_result(detection)
            }
        })
    }
}

/// Decode a base64 image, stripping a `data:<mime>;base64,` prefix if present.
pub fn decode_image(data_url: &str) -> Result<image::RgbImage, DetectError> {
    let encoded = data_url
        .split_once(',')
        .map_or(data_url, |(_header, data)| data);

    let bytes = base64::decode(encoded.trim())?;
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

/// The detection with the highest confidence at or above `min_confidence`.
///
/// Ties go to the detection seen first.
pub fn best_detection(detections: &[Detection], min_confidence: f32) -> Option<&Detection> {
    detections
        .iter()
        .filter(|detection| detection.confidence >= min_confidence)
        .fold(None, |best: Option<&Detection>, detection| match best {
            Some(best) if best.confidence >= detection.confidence => Some(best),
            _ => Some(detection),
        })
}

/// Result reported when no detection passed the threshold.
pub fn no_detection() -> DetectionResult {
    DetectionResult {
        letter: NO_LETTER.to_string(),
        confidence: 0.0,
        keypoints: vec![],
        bones: vec![],
        boxes: vec![],
    }
}

fn detection_result(detection: &Detection) -> DetectionResult {
    let (keypoints, bones) = synthetic_skeleton(detection);

    DetectionResult {
        letter: detection.letter().to_string(),
        confidence: detection.confidence,
        keypoints,
        bones,
        boxes: vec![detection.bounding_box()],
    }
}

/// Three points on the vertical center line of the box, joined by two bones.
///
/// Purely decorative for skeleton rendering in the frontend, the model does not estimate a hand
/// pose.
pub fn synthetic_skeleton(detection: &Detection) -> (Vec<Keypoint>, Vec<Bone>) {
    let Detection { cx, cy, height, .. } = *detection;
    let offset = height * SKELETON_OFFSET;

    let keypoints = vec![
        Keypoint {
            x: cx,
            y: cy - offset,
        },
        Keypoint { x: cx, y: cy },
        Keypoint {
            x: cx,
            y: cy + offset,
        },
    ];

    (keypoints, vec![(0, 1), (1, 2)])
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use anyhow::Result;
    use image::{ImageOutputFormat, RgbImage};

    use super::*;
    use crate::detector::Detector;

    struct Fixed(Vec<Detection>);

    impl Detector for Fixed {
        fn infer(&self, _image: &RgbImage) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl Detector for Broken {
        fn infer(&self, _image: &RgbImage) -> Result<Vec<Detection>> {
            anyhow::bail!("tensor shape mismatch")
        }
    }

    fn png_data_url() -> String {
        let mut buf = Cursor::new(Vec::new());
        RgbImage::new(8, 8)
            .write_to(&mut buf, ImageOutputFormat::Png)
            .expect("encode png");
        format!("data:image/png;base64,{}", base64::encode(buf.into_inner()))
    }

    fn service(detector: impl Detector + 'static) -> SingleShotDetectionService {
        SingleShotDetectionService::new(Arc::new(ModelSlot::loaded(Arc::new(detector))))
    }

    fn det(class_index: usize, confidence: f32) -> Detection {
        Detection::new(class_index, confidence, [0.5, 0.5, 0.2, 0.4])
    }

    #[test]
    fn test_best_is_strict_max_first_on_ties() {
        let detections = [det(0, 0.5), det(1, 0.8), det(2, 0.8), det(3, 0.3)];
        assert_eq!(best_detection(&detections, 0.2).map(|d| d.class_index), Some(1));
    }

    #[test]
    fn test_below_threshold_never_selected() {
        let detections = [det(0, 0.19), det(1, 0.0), det(2, f32::NAN)];
        assert!(best_detection(&detections, SINGLE_SHOT_MIN_CONFIDENCE).is_none());

        let detections = [det(0, 0.19), det(1, 0.2)];
        assert_eq!(
            best_detection(&detections, SINGLE_SHOT_MIN_CONFIDENCE).map(|d| d.class_index),
            Some(1)
        );
    }

    #[test]
    fn test_detect_best() -> Result<(), DetectError> {
        let detection = Detection::new(9, 0.85, [0.4, 0.6, 0.2, 0.5]);
        let result = service(Fixed(vec![det(0, 0.3), detection])).detect(&png_data_url())?;

        assert_eq!(result.letter, "K");
        assert_eq!(result.confidence, 0.85);
        assert_eq!(result.boxes.len(), 1);
        let (cx, cy) = result.boxes[0].center();
        assert!((cx - 0.4).abs() < 1e-6);
        assert!((cy - 0.6).abs() < 1e-6);

        let ys: Vec<f32> = result.keypoints.iter().map(|k| k.y).collect();
        assert!((ys[0] - 0.5).abs() < 1e-6);
        assert!((ys[1] - 0.6).abs() < 1e-6);
        assert!((ys[2] - 0.7).abs() < 1e-6);
        assert!(result.keypoints.iter().all(|k| k.x == 0.4));
        assert_eq!(result.bones, vec![(0, 1), (1, 2)]);

        Ok(())
    }

    #[test]
    fn test_detect_nothing() -> Result<(), DetectError> {
        assert_eq!(service(Fixed(vec![])).detect(&png_data_url())?, no_detection());
        assert_eq!(
            service(Fixed(vec![det(4, 0.1)])).detect(&png_data_url())?,
            no_detection()
        );

        Ok(())
    }

    #[test]
    fn test_unknown_class() -> Result<(), DetectError> {
        let result = service(Fixed(vec![det(24, 0.9)])).detect(&png_data_url())?;
        assert_eq!(result.letter, "?");

        Ok(())
    }

    #[test]
    fn test_plain_base64_without_prefix() -> Result<(), DetectError> {
        let data_url = png_data_url();
        let (_, plain) = data_url.split_once(',').expect("prefix");
        service(Fixed(vec![])).detect(plain)?;

        Ok(())
    }

    #[test]
    fn test_errors() {
        let svc = service(Fixed(vec![]));
        assert!(matches!(
            svc.detect("not-a-valid-base64"),
            Err(DetectError::InvalidEncoding(_))
        ));
        assert!(matches!(
            svc.detect(&format!("data:image/png;base64,{}", base64::encode(b"no image"))),
            Err(DetectError::InvalidImage(_))
        ));

        let unloaded = SingleShotDetectionService::new(Arc::new(ModelSlot::new()));
        assert!(matches!(
            unloaded.detect(&png_data_url()),
            Err(DetectError::ModelUnavailable)
        ));

        assert!(matches!(
            service(Broken).detect(&png_data_url()),
            Err(DetectError::InferenceFailure(msg)) if msg.contains("shape mismatch")
        ));
    }
}
