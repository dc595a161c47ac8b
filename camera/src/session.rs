//! Lock-guarded camera session.
//!
//! The session owns at most one open device. Every operation runs inside the session's critical
//! section, including the blocking hardware read. A control call arriving while a read is in
//! flight waits for the read to complete, so a device is never released under a running read.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::protocol::CameraInfo;
use image::RgbImage;

use crate::{CameraBackend, CameraDevice, CameraError, CaptureSettings};

/// Notified of every camera state change while the session lock is held.
///
/// Implementations must not call back into the session.
pub trait SessionObserver: Send + Sync {
    fn camera_changed(&self, active: bool, camera_id: u32);
}

/// Shared camera handle of the stream server.
pub struct CameraSession {
    backends: Vec<Box<dyn CameraBackend>>,
    settings: CaptureSettings,
    observer: Option<Arc<dyn SessionObserver>>,
    state: Mutex<SessionState>,
}

struct SessionState {
    device: Option<OpenDevice>,
    camera_id: u32,
    /// Incremented on every successful open.
    generation: u64,
}

struct OpenDevice {
    device: Box<dyn CameraDevice>,
    backend: &'static str,
}

impl SessionState {
    /// Drop the open device, if any. Returns whether a device was released.
    fn release(&mut self) -> bool {
        self.device.take().is_some()
    }
}

impl CameraSession {
    /// Create an empty session. Backends are tried in the given order when opening a camera.
    pub fn new(backends: Vec<Box<dyn CameraBackend>>, settings: CaptureSettings) -> Self {
        Self {
            backends,
            settings,
            observer: None,
            state: Mutex::new(SessionState {
                device: None,
                camera_id: 0,
                generation: 0,
            }),
        }
    }

    /// Camera opened by a later [`CameraSession::reopen`].
    pub fn with_camera_id(mut self, camera_id: u32) -> Self {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .camera_id = camera_id;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, state: &SessionState) {
        if let Some(observer) = &self.observer {
            observer.camera_changed(state.device.is_some(), state.camera_id);
        }
    }

    /// Open a camera, releasing a previously opened one first.
    pub fn open(&self, camera_id: u32) -> Result<(), CameraError> {
        let mut state = self.lock();
        if state.release() {
            log::info!("Released camera {} before opening {}", state.camera_id, camera_id);
        }

        let result = self.open_locked(&mut state, camera_id);
        self.notify(&state);
        result
    }

    /// Open the current camera again. Returns its index.
    pub fn reopen(&self) -> Result<u32, CameraError> {
        let mut state = self.lock();
        let camera_id = state.camera_id;
        state.release();

        let result = self.open_locked(&mut state, camera_id);
        self.notify(&state);
        result.map(|()| camera_id)
    }

    /// Release the camera. Closing a closed session is a no-op.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.release() {
            log::info!("Camera {} closed", state.camera_id);
        }
        self.notify(&state);
    }

    /// Release the camera only if it is still the device opened as `generation`.
    ///
    /// Returns whether a device was released.
    pub fn close_if(&self, generation: u64) -> bool {
        let mut state = self.lock();
        if state.generation != generation || !state.release() {
            return false;
        }

        log::info!("Camera {} closed", state.camera_id);
        self.notify(&state);
        true
    }

    /// Close the current camera and open another one.
    ///
    /// If the new camera cannot be opened, the session stays closed.
    pub fn switch(&self, camera_id: u32) -> Result<(), CameraError> {
        let mut state = self.lock();
        log::info!("Switching camera {} -> {}", state.camera_id, camera_id);
        state.release();

        let result = self.open_locked(&mut state, camera_id);
        self.notify(&state);
        result
    }

    /// Blocking read of one frame from the open camera.
    pub fn read_frame(&self) -> Result<RgbImage, CameraError> {
        self.read_frame_tagged().1
    }

    /// Like [`CameraSession::read_frame`], also returning the generation of the device read from.
    pub fn read_frame_tagged(&self) -> (u64, Result<RgbImage, CameraError>) {
        let mut state = self.lock();
        let generation = state.generation;
        let frame = match state.device.as_mut() {
            None => Err(CameraError::NoActiveCamera),
            Some(open) => open.device.read_frame(),
        };

        (generation, frame)
    }

    pub fn is_active(&self) -> bool {
        self.lock().device.is_some()
    }

    /// Index of the open camera, or of the last one opened.
    pub fn camera_id(&self) -> u32 {
        self.lock().camera_id
    }

    /// Counter identifying the open device, changes whenever a device is opened.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Find the cameras which can be opened and deliver frames, trying indices `0..max_cameras`.
    ///
    /// The active camera is reported without opening it a second time.
    pub fn probe(&self, max_cameras: u32) -> Vec<CameraInfo> {
        let active = {
            let state = self.lock();
            state
                .device
                .as_ref()
                .map(|open| (state.camera_id, open.backend))
        };

        (0..max_cameras)
            .filter_map(|camera_id| match active {
                Some((active_id, backend)) if active_id == camera_id => {
                    Some(camera_info(camera_id, backend))
                }
                _ => self.probe_one(camera_id),
            })
            .collect()
    }

    fn probe_one(&self, camera_id: u32) -> Option<CameraInfo> {
        self.backends.iter().find_map(|backend| {
            let mut device = backend.open(camera_id, &self.settings).ok()?;
            device.read_frame().ok()?;
            log::debug!("Probed camera {} with {}", camera_id, backend.name());
            Some(camera_info(camera_id, backend.name()))
        })
    }

    fn open_locked(&self, state: &mut SessionState, camera_id: u32) -> Result<(), CameraError> {
        let open = self.open_device(camera_id)?;
        state.device = Some(open);
        state.camera_id = camera_id;
        state.generation += 1;

        Ok(())
    }

    /// Try all backends in order, then check that the device actually delivers frames.
    fn open_device(&self, camera_id: u32) -> Result<OpenDevice, CameraError> {
        log::info!("Opening camera {}", camera_id);

        let mut open = self
            .backends
            .iter()
            .find_map(|backend| match backend.open(camera_id, &self.settings) {
                Ok(device) => Some(OpenDevice {
                    device,
                    backend: backend.name(),
                }),
                Err(err) => {
                    log::warn!(
                        "Backend {} failed to open camera {}: {}",
                        backend.name(),
                        camera_id,
                        err
                    );
                    None
                }
            })
            .ok_or(CameraError::OpenFailed { camera_id })?;

        // Some devices open fine but never deliver a frame
        if let Err(err) = open.device.read_frame() {
            log::warn!("Camera {} opened but test read failed: {}", camera_id, err);
            return Err(CameraError::Unreadable { camera_id });
        }

        log::info!("Camera {} ready ({})", camera_id, open.backend);
        Ok(open)
    }
}

fn camera_info(camera_id: u32, backend: &str) -> CameraInfo {
    CameraInfo {
        id: camera_id,
        name: format!("Camera {camera_id}"),
        backend: backend.to_owned(),
    }
}
