//! Camera access for the sign stream server.
//!
//! A [`CameraSession`] owns at most one open capture device. Devices are opened through a list of
//! [`CameraBackend`]s which are tried in order, so a preferred backend can fall back to a more
//! generic one.
pub mod backend;
pub mod session;
pub mod synthetic;

pub use backend::{default_backends, CameraBackend, CameraDevice, V4l2Mjpeg, V4l2Yuyv};
pub use session::{CameraSession, SessionObserver};
pub use synthetic::Synthetic;

/// Errors of the camera lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("Failed to open camera {camera_id}")]
    OpenFailed { camera_id: u32 },

    #[error("Camera {camera_id} opened but cannot read frames")]
    Unreadable { camera_id: u32 },

    #[error("No active camera")]
    NoActiveCamera,

    #[error("Failed to read frame: {0}")]
    ReadFailed(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Requested capture properties.
///
/// Drivers are free to adjust them, the values are a request and not a guarantee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}
