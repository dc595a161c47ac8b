//! MJPEG stream of annotated camera frames.
//!
//! [`StreamGenerator`] is an endless iterator of multipart chunks. Every stream connection gets
//! its own generator, driven by a dedicated thread which pushes the chunks into a small bounded
//! channel drained by the HTTP body. A slow client blocks the thread instead of piling up frames.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::Bytes;
use camera::{CameraError, CameraSession};
use image::RgbImage;
use tokio::sync::mpsc;

use crate::{annotator::FrameAnnotator, detector::ModelSlot, stats::StreamingStats};

/// Content type of the stream response.
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Header preceding every JPEG in the stream.
const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

pub const JPEG_QUALITY: i32 = 85;

/// Pause after a placeholder frame or a failed read.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Number of frames per FPS measurement.
pub const FPS_WINDOW: u32 = 30;

const PLACEHOLDER_SIZE: (u32, u32) = (640, 480);
const PLACEHOLDER_MESSAGE: &str = "Camera Off";

/// Capacity of the channel between a generator thread and its HTTP body.
const STREAM_CHANNEL_CAPACITY: usize = 2;

/// Wrap a JPEG into one part of the multipart stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::from([PART_HEADER, data, b"\r\n"].concat())
}

pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>> {
    let buf = turbojpeg::compress_image(frame, JPEG_QUALITY, turbojpeg::Subsamp::Sub2x2)?;
    Ok(buf.to_vec())
}

/// Frame rate over windows of [`FPS_WINDOW`] frames.
///
/// Coarse, only meant for display.
pub struct FpsWindow {
    frames: u32,
    started: Instant,
}

impl FpsWindow {
    pub fn new() -> Self {
        Self {
            frames: 0,
            started: Instant::now(),
        }
    }

    /// Count a frame. Returns the frame rate whenever a window completes.
    pub fn tick(&mut self) -> Option<f32> {
        self.frames += 1;
        if self.frames < FPS_WINDOW {
            return None;
        }

        let elapsed = self.started.elapsed().as_secs_f32();
        let fps = self.frames as f32 / elapsed.max(f32::EPSILON);
        self.frames = 0;
        self.started = Instant::now();

        Some(fps)
    }

    /// Drop the frames counted so far and start a new window now.
    pub fn restart(&mut self) {
        self.frames = 0;
        self.started = Instant::now();
    }
}

impl Default for FpsWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a stream generator works with, shared by all stream connections.
#[derive(Clone)]
pub struct StreamResources {
    pub session: Arc<CameraSession>,
    pub model: Arc<ModelSlot>,
    pub annotator: Arc<FrameAnnotator>,
    pub stats: Arc<StreamingStats>,
}

/// Endless iterator of multipart chunks.
///
/// Without an active camera a placeholder frame is emitted every [`RETRY_DELAY`]. Failed reads
/// are retried after the same delay; after `max_read_failures` consecutive failures (if not zero)
/// the camera is considered lost and closed. Failures and frame rate are counted per opened
/// device, a camera switched in by another request starts from zero.
pub struct StreamGenerator {
    resources: StreamResources,
    max_read_failures: u32,
    retry_delay: Duration,
    fps: FpsWindow,
    /// Generation of the device the counters refer to.
    generation: Option<u64>,
    consecutive_failures: u32,
    pending_delay: Option<Duration>,
    placeholder: Option<Bytes>,
}

impl StreamGenerator {
    pub fn new(resources: StreamResources, max_read_failures: u32) -> Self {
        Self {
            resources,
            max_read_failures,
            retry_delay: RETRY_DELAY,
            fps: FpsWindow::new(),
            generation: None,
            consecutive_failures: 0,
            pending_delay: None,
            placeholder: None,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// The placeholder chunk, encoded once and reused.
    fn placeholder_chunk(&mut self) -> Option<Bytes> {
        if self.placeholder.is_none() {
            let (width, height) = PLACEHOLDER_SIZE;
            let frame = self
                .resources
                .annotator
                .placeholder(width, height, PLACEHOLDER_MESSAGE);
            match encode_jpeg(&frame) {
                Ok(jpeg) => self.placeholder = Some(as_jpeg_stream_item(&jpeg)),
                Err(err) => log::warn!("Failed to encode placeholder frame: {err:#}"),
            }
        }

        self.placeholder.clone()
    }

    /// Reset the counters when the frame came from a newly opened device.
    fn track_device(&mut self, generation: u64) {
        if self.generation != Some(generation) {
            self.generation = Some(generation);
            self.consecutive_failures = 0;
            self.fps.restart();
        }
    }

    fn on_read_failure(&mut self, generation: u64, err: CameraError) {
        if let CameraError::NoActiveCamera = err {
            // Closed between the activity check and the read
            return;
        }

        self.consecutive_failures += 1;
        log::debug!(
            "Frame read failed ({} in a row): {}",
            self.consecutive_failures,
            err
        );

        if self.max_read_failures > 0 && self.consecutive_failures >= self.max_read_failures {
            self.consecutive_failures = 0;
            if self.resources.session.close_if(generation) {
                log::warn!(
                    "Camera lost after {} failed reads, closed it",
                    self.max_read_failures
                );
            }
        }
    }

    /// Detect, annotate, count and encode a frame.
    fn process(&mut self, frame: RgbImage) -> Option<Bytes> {
        let detections = match self.resources.model.get() {
            Some(detector) => detector.infer(&frame).unwrap_or_else(|err| {
                log::warn!("Inference failed, streaming frame without overlay: {err:#}");
                vec![]
            }),
            None => vec![],
        };

        let (annotated, summary) = self.resources.annotator.annotate(frame, &detections);
        self.resources.stats.record_frame(summary.as_ref());

        if let Some(fps) = self.fps.tick() {
            self.resources.stats.set_fps(fps);
        }

        match encode_jpeg(&annotated) {
            Ok(jpeg) => Some(as_jpeg_stream_item(&jpeg)),
            Err(err) => {
                log::warn!("Failed to encode frame: {err:#}");
                None
            }
        }
    }
}

impl StreamGenerator {
    /// One attempt at producing a chunk. `None` after a failed read.
    fn step(&mut self) -> Option<Bytes> {
        if let Some(delay) = self.pending_delay.take() {
            thread::sleep(delay);
        }

        if !self.resources.session.is_active() {
            self.pending_delay = Some(self.retry_delay);
            return self.placeholder_chunk();
        }

        let (generation, frame) = self.resources.session.read_frame_tagged();
        self.track_device(generation);

        match frame {
            Ok(frame) if frame.width() > 0 && frame.height() > 0 => {
                self.consecutive_failures = 0;
                self.process(frame)
            }
            Ok(_) => {
                let err = CameraError::ReadFailed("empty frame".into());
                self.on_read_failure(generation, err);
                self.pending_delay = Some(self.retry_delay);
                None
            }
            Err(err) => {
                self.on_read_failure(generation, err);
                self.pending_delay = Some(self.retry_delay);
                None
            }
        }
    }
}

impl Iterator for StreamGenerator {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        loop {
            if let Some(chunk) = self.step() {
                return Some(chunk);
            }
        }
    }
}

/// Run a generator on its own thread and return the receiving end of its chunks.
///
/// The thread ends when the receiver is dropped, i.e. the client disconnected, or when `shutdown`
/// is set.
pub fn spawn_stream(
    generator: StreamGenerator,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<(mpsc::Receiver<Bytes>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

    let handle = thread::Builder::new()
        .name("mjpeg-stream".into())
        .spawn(move || {
            for chunk in generator {
                if shutdown.load(Ordering::Relaxed) || tx.blocking_send(chunk).is_err() {
                    break;
                }
            }
            log::info!("Video stream ended");
        })?;

    Ok((rx, handle))
}

#[cfg(test)]
mod test {
    use camera::{CameraBackend, CameraDevice, CaptureSettings, Synthetic};
    use common::detection::Detection;

    use super::*;
    use crate::detector::Detector;

    struct Fixed(Vec<Detection>);

    impl Detector for Fixed {
        fn infer(&self, _image: &RgbImage) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    /// Camera 0 dies after the test read, any other camera hiccups once on its first read.
    struct Flaky;

    impl CameraBackend for Flaky {
        fn name(&self) -> &'static str {
            "Flaky"
        }

        fn open(
            &self,
            camera_id: u32,
            _settings: &CaptureSettings,
        ) -> Result<Box<dyn CameraDevice>, CameraError> {
            Ok(Box::new(FlakyDevice {
                camera_id,
                reads: 0,
            }))
        }
    }

    struct FlakyDevice {
        camera_id: u32,
        reads: u32,
    }

    impl CameraDevice for FlakyDevice {
        fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
            self.reads += 1;
            let fails = match self.camera_id {
                0 => self.reads > 1,
                _ => self.reads == 2,
            };
            match fails {
                true => Err(CameraError::ReadFailed("device gone".into())),
                false => Ok(RgbImage::new(8, 8)),
            }
        }
    }

    fn resources(
        backend: impl CameraBackend + 'static,
        detections: Vec<Detection>,
    ) -> StreamResources {
        let settings = CaptureSettings {
            width: 64,
            height: 48,
            fps: 0,
        };
        let stats = Arc::new(StreamingStats::new());
        let session =
            CameraSession::new(vec![Box::new(backend)], settings).with_observer(stats.clone());
        StreamResources {
            session: Arc::new(session),
            model: Arc::new(ModelSlot::loaded(Arc::new(Fixed(detections)))),
            annotator: Arc::new(FrameAnnotator::new(None)),
            stats,
        }
    }

    fn is_jpeg_chunk(chunk: &[u8]) -> bool {
        chunk.starts_with(PART_HEADER)
            && chunk[PART_HEADER.len()..].starts_with(&[0xFF, 0xD8])
            && chunk.ends_with(&[0xFF, 0xD9, b'\r', b'\n'])
    }

    #[test]
    fn test_chunk_framing() {
        let chunk = as_jpeg_stream_item(b"JPEG");
        assert_eq!(
            &chunk[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n"
        );
    }

    #[test]
    fn test_fps_window() {
        let mut window = FpsWindow::new();
        for _ in 0..FPS_WINDOW - 1 {
            assert!(window.tick().is_none());
        }
        let fps = window.tick().expect("window complete");
        assert!(fps > 0.0);
        assert!(window.tick().is_none());
    }

    #[test]
    fn test_placeholder_without_camera() {
        let res = resources(Synthetic::default(), vec![]);
        let generator = StreamGenerator::new(res.clone(), 30).with_retry_delay(Duration::ZERO);

        let chunks: Vec<Bytes> = generator.take(3).collect();

        assert!(chunks.iter().all(|chunk| is_jpeg_chunk(chunk)));
        assert_eq!(res.stats.snapshot().frames_processed, 0);
    }

    #[test]
    fn test_placeholder_rate() {
        let res = resources(Synthetic::default(), vec![]);
        let mut generator = StreamGenerator::new(res, 30);

        generator.next();
        let start = Instant::now();
        generator.next();
        let elapsed = start.elapsed();

        assert!(elapsed >= RETRY_DELAY);
        assert!(elapsed < Duration::from_millis(150));
    }

    #[test]
    fn test_counts_frames_and_detections() -> Result<(), CameraError> {
        let detections = vec![Detection::new(9, 0.6, [0.5, 0.5, 0.4, 0.4])];
        let res = resources(Synthetic::default(), detections);
        res.session.open(0)?;

        let chunks: Vec<Bytes> = StreamGenerator::new(res.clone(), 30).take(5).collect();
        assert!(chunks.iter().all(|chunk| is_jpeg_chunk(chunk)));

        let report = res.stats.snapshot();
        assert_eq!(report.frames_processed, 5);
        assert_eq!(report.total_detections, 5);
        assert_eq!(report.last_detection, "K");
        assert_eq!(report.last_confidence, 0.6);
        // No window completed yet
        assert_eq!(report.fps, 0.0);

        Ok(())
    }

    #[test]
    fn test_fps_after_full_window() -> Result<(), CameraError> {
        let res = resources(Synthetic::default(), vec![]);
        res.session.open(0)?;

        let generator = StreamGenerator::new(res.clone(), 30);
        assert_eq!(generator.take(FPS_WINDOW as usize).count(), FPS_WINDOW as usize);

        let report = res.stats.snapshot();
        assert_eq!(report.frames_processed, FPS_WINDOW as u64);
        assert_eq!(report.total_detections, 0);
        assert!(report.fps > 0.0);

        Ok(())
    }

    #[test]
    fn test_lost_camera_falls_back_to_placeholder() -> Result<(), CameraError> {
        let res = resources(Flaky, vec![]);
        res.session.open(0)?;
        assert!(res.stats.snapshot().camera_active);

        let mut generator = StreamGenerator::new(res.clone(), 3).with_retry_delay(Duration::ZERO);
        let chunk = generator.next().expect("endless");

        assert!(is_jpeg_chunk(&chunk));
        assert!(!res.session.is_active());
        assert!(!res.stats.snapshot().camera_active);
        assert_eq!(res.stats.snapshot().frames_processed, 0);

        Ok(())
    }

    #[test]
    fn test_failures_of_previous_camera_are_forgotten() -> Result<(), CameraError> {
        let res = resources(Flaky, vec![]);
        res.session.open(0)?;

        let mut generator = StreamGenerator::new(res.clone(), 3).with_retry_delay(Duration::ZERO);
        assert!(generator.step().is_none());
        assert!(generator.step().is_none());

        // Switched by a control request, one short of the bound
        res.session.switch(1)?;

        assert!(generator.step().is_none());
        assert!(res.session.is_active());
        assert!(generator.step().is_some());

        let report = res.stats.snapshot();
        assert!(report.camera_active);
        assert_eq!(report.current_camera_id, 1);
        assert_eq!(report.frames_processed, 1);

        Ok(())
    }

    #[test]
    fn test_stale_bound_does_not_close_new_camera() -> Result<(), CameraError> {
        let res = resources(Flaky, vec![]);
        res.session.open(0)?;
        let (old_generation, _) = res.session.read_frame_tagged();
        res.session.switch(1)?;

        let mut generator = StreamGenerator::new(res.clone(), 1).with_retry_delay(Duration::ZERO);
        generator.on_read_failure(old_generation, CameraError::ReadFailed("late".into()));

        assert!(res.session.is_active());
        assert!(res.stats.snapshot().camera_active);

        Ok(())
    }

    #[test]
    fn test_fps_window_restarts_with_new_camera() -> Result<(), CameraError> {
        let res = resources(Synthetic::default(), vec![]);
        let mut generator = StreamGenerator::new(res.clone(), 30);
        // Frames counted before the camera was opened
        generator.fps.frames = FPS_WINDOW - 1;

        res.session.open(0)?;
        assert!(generator.next().is_some());

        assert_eq!(res.stats.snapshot().frames_processed, 1);
        assert_eq!(res.stats.snapshot().fps, 0.0);

        Ok(())
    }

    fn wait_until_finished(handle: &JoinHandle<()>) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.is_finished() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn test_spawned_stream_stops_on_disconnect() {
        let res = resources(Synthetic::default(), vec![]);
        let generator = StreamGenerator::new(res, 30).with_retry_delay(Duration::from_millis(5));

        let (mut rx, handle) =
            spawn_stream(generator, Arc::new(AtomicBool::new(false))).expect("spawn");
        let chunk = rx.blocking_recv().expect("first chunk");
        assert!(is_jpeg_chunk(&chunk));

        drop(rx);
        assert!(wait_until_finished(&handle), "stream thread still running");
        handle.join().expect("stream thread panicked");
    }

    #[test]
    fn test_spawned_stream_ends_on_shutdown() {
        let res = resources(Synthetic::default(), vec![]);
        let generator = StreamGenerator::new(res, 30).with_retry_delay(Duration::from_millis(5));
        let shutdown = Arc::new(AtomicBool::new(false));

        let (mut rx, handle) = spawn_stream(generator, shutdown.clone()).expect("spawn");
        assert!(rx.blocking_recv().is_some());

        shutdown.store(true, Ordering::Relaxed);
        while rx.blocking_recv().is_some() {}
        assert!(wait_until_finished(&handle), "stream thread still running");
    }
}
