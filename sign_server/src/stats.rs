//! Statistics of the live stream.
//!
//! Written by the stream threads and the camera control calls, read by the status endpoint. All
//! access goes through one lock held only for field reads and writes.
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use camera::SessionObserver;
use common::{letters::NO_LETTER, protocol::StatusReport};
use tokio::{task::JoinHandle, time::interval};

use crate::annotator::DetectionSummary;

#[derive(Default)]
pub struct StreamingStats {
    inner: Mutex<StatsInner>,
}

#[derive(Clone, Debug)]
struct StatsInner {
    frames_processed: u64,
    detections: u64,
    last_detection: char,
    last_confidence: f32,
    fps: f32,
    camera_active: bool,
    current_camera_id: u32,
}

impl Default for StatsInner {
    fn default() -> Self {
        Self {
            frames_processed: 0,
            detections: 0,
            last_detection: NO_LETTER,
            last_confidence: 0.0,
            fps: 0.0,
            camera_active: false,
            current_camera_id: 0,
        }
    }
}

impl StreamingStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a processed frame and its detection, if any.
    pub fn record_frame(&self, summary: Option<&DetectionSummary>) {
        let mut inner = self.lock();
        inner.frames_processed += 1;
        if let Some(summary) = summary {
            inner.detections += 1;
            inner.last_detection = summary.letter;
            inner.last_confidence = summary.confidence;
        }
    }

    pub fn set_fps(&self, fps: f32) {
        self.lock().fps = fps;
    }

    /// Record the camera state after a lifecycle change.
    pub fn set_camera(&self, active: bool, camera_id: u32) {
        let mut inner = self.lock();
        inner.camera_active = active;
        inner.current_camera_id = camera_id;
    }

    pub fn frames_processed(&self) -> u64 {
        self.lock().frames_processed
    }

    /// Consistent copy of all values, FPS rounded to two decimals.
    pub fn snapshot(&self) -> StatusReport {
        let inner = self.lock().clone();

        StatusReport {
            camera_active: inner.camera_active,
            frames_processed: inner.frames_processed,
            total_detections: inner.detections,
            last_detection: inner.last_detection.to_string(),
            last_confidence: inner.last_confidence,
            fps: (inner.fps * 100.0).round() / 100.0,
            current_camera_id: inner.current_camera_id,
        }
    }
}

/// Camera state is written by the session itself, in step with the open device.
impl SessionObserver for StreamingStats {
    fn camera_changed(&self, active: bool, camera_id: u32) {
        self.set_camera(active, camera_id);
    }
}

/// Periodically log stream throughput while frames are flowing.
pub fn spawn_stats_logger(stats: Arc<StreamingStats>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;
        let mut last_frames = stats.frames_processed();

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let report = stats.snapshot();
            let new_frames = report.frames_processed - last_frames;
            last_frames = report.frames_processed;

            if new_frames > 0 {
                let elapsed = start.elapsed().as_secs_f32();
                log::info!(
                    "Frames per second: {:.2} (window {:.2}), detections: {}, last: {}",
                    new_frames as f32 / elapsed,
                    report.fps,
                    report.total_detections,
                    report.last_detection
                );
            }
        }
    })
}
