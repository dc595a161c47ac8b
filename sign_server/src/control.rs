//! Camera lifecycle requests of the stream server.
//!
//! Failures never escape as errors, they are reported in the response body.
use std::sync::Arc;

use camera::CameraSession;
use common::protocol::{CameraList, ControlResponse};

use crate::stats::StreamingStats;

/// Highest camera index + 1 tried when listing cameras.
pub const MAX_PROBED_CAMERAS: u32 = 10;

/// Camera lifecycle calls on a session observed by the stream statistics.
///
/// All calls block on camera hardware and belong on a blocking thread.
#[derive(Clone)]
pub struct CameraControl {
    session: Arc<CameraSession>,
    stats: Arc<StreamingStats>,
}

impl CameraControl {
    /// `session` has to report its changes to `stats` (see [`CameraSession::with_observer`]).
    pub fn new(session: Arc<CameraSession>, stats: Arc<StreamingStats>) -> Self {
        Self { session, stats }
    }

    /// (Re)open the current camera.
    pub fn start(&self) -> ControlResponse {
        match self.session.reopen() {
            Ok(_) => ControlResponse::ok("Camera started"),
            Err(err) => {
                log::warn!("Failed to start camera: {}", err);
                ControlResponse::failed(format!("Failed to start camera: {err}"))
            }
        }
    }

    pub fn stop(&self) -> ControlResponse {
        self.session.close();
        ControlResponse::ok("Camera stopped")
    }

    pub fn switch(&self, camera_id: u32) -> ControlResponse {
        match self.session.switch(camera_id) {
            Ok(()) => ControlResponse::ok(format!("Switched to camera {camera_id}"))
                .with_camera_id(camera_id),
            Err(err) => {
                log::warn!("Failed to switch to camera {}: {}", camera_id, err);
                ControlResponse::failed(format!("Failed to switch to camera {camera_id}: {err}"))
            }
        }
    }

    pub fn list(&self, max_cameras: u32) -> CameraList {
        let cameras = self.session.probe(max_cameras);
        CameraList {
            total: cameras.len(),
            current_camera_id: self.stats.snapshot().current_camera_id,
            cameras,
        }
    }

    /// Release the camera on process exit.
    pub fn shutdown(&self) {
        self.session.close();
        log::info!("Camera released");
    }
}
