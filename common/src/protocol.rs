//! Request and response bodies of the HTTP services.
//!
use serde::{Deserialize, Serialize};

use crate::detection::BoundingBox;

/// Body of a single-shot detection request.
#[derive(Debug, Deserialize, Serialize)]
pub struct DetectRequest {
    /// Base64 image, optionally as data URL (`data:image/jpeg;base64,...`).
    pub image: String,
}

/// Point of the synthetic hand skeleton.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
}

/// Connection between two keypoints, by index.
pub type Bone = (usize, usize);

/// Result of a single-shot detection.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DetectionResult {
    pub letter: String,
    pub confidence: f32,
    pub keypoints: Vec<Keypoint>,
    pub bones: Vec<Bone>,
    pub boxes: Vec<BoundingBox>,
}

/// Error body, `{"detail": "..."}`.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorDetail {
    pub detail: String,
}

/// Readiness of the single-shot service.
#[derive(Debug, Deserialize, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub model_loaded: bool,
    pub model_path: String,
    pub classes: usize,
}

/// Snapshot of the streaming statistics.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StatusReport {
    pub camera_active: bool,
    pub frames_processed: u64,
    pub total_detections: u64,
    pub last_detection: String,
    pub last_confidence: f32,
    pub fps: f32,
    pub current_camera_id: u32,
}

/// A capture device found while probing.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CameraInfo {
    pub id: u32,
    pub name: String,
    pub backend: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CameraList {
    pub cameras: Vec<CameraInfo>,
    pub current_camera_id: u32,
    pub total: usize,
}

/// Outcome of a camera control request.
///
/// Control requests never fail on the HTTP level, errors are reported with `success: false`.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<u32>,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            camera_id: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            camera_id: None,
        }
    }

    pub fn with_camera_id(mut self, camera_id: u32) -> Self {
        self.camera_id = Some(camera_id);
        self
    }
}
