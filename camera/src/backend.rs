//! Capture backends.
//!
//! Both V4L2 backends open `/dev/video{id}`. They only differ in the pixel format they request:
//! compressed MJPG is preferred because most USB webcams only reach their full frame rate with
//! it, raw YUYV is supported by virtually every UVC device and serves as the fallback.
use image::{Rgb, RgbImage};
use rscam::{Camera, Config, IntervalInfo, ResolutionInfo};

use crate::{CameraError, CaptureSettings};

/// A way to open capture devices.
pub trait CameraBackend: Send + Sync {
    /// Name reported when listing cameras.
    fn name(&self) -> &'static str;

    /// Open and start the device with the given index.
    fn open(
        &self,
        camera_id: u32,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CameraDevice>, CameraError>;
}

/// An open capture device. Dropping it releases the device.
pub trait CameraDevice: Send {
    /// Blocking read of the next frame.
    fn read_frame(&mut self) -> Result<RgbImage, CameraError>;
}

/// The backends in the order they should be tried.
pub fn default_backends() -> Vec<Box<dyn CameraBackend>> {
    vec![Box::new(V4l2Mjpeg), Box::new(V4l2Yuyv)]
}

/// Device node of a camera index on a Linux machine.
pub fn device_path(camera_id: u32) -> String {
    format!("/dev/video{camera_id}")
}

/// V4L2 capture in MJPG format, decoded with libjpeg-turbo.
pub struct V4l2Mjpeg;

impl CameraBackend for V4l2Mjpeg {
    fn name(&self) -> &'static str {
        "V4L2-MJPG"
    }

    fn open(
        &self,
        camera_id: u32,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CameraDevice>, CameraError> {
        let cam = start_camera(camera_id, settings, b"MJPG")?;
        Ok(Box::new(MjpegDevice { cam }))
    }
}

struct MjpegDevice {
    cam: Camera,
}

impl CameraDevice for MjpegDevice {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        let frame = self.cam.capture()?;
        turbojpeg::decompress_image::<Rgb<u8>>(&frame[..])
            .map_err(|e| CameraError::ReadFailed(e.to_string()))
    }
}

/// V4L2 capture in raw YUYV 4:2:2 format.
pub struct V4l2Yuyv;

impl CameraBackend for V4l2Yuyv {
    fn name(&self) -> &'static str {
        "V4L2-YUYV"
    }

    fn open(
        &self,
        camera_id: u32,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CameraDevice>, CameraError> {
        let cam = start_camera(camera_id, settings, b"YUYV")?;
        Ok(Box::new(YuyvDevice { cam }))
    }
}

struct YuyvDevice {
    cam: Camera,
}

impl CameraDevice for YuyvDevice {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        let frame = self.cam.capture()?;
        let (width, height) = frame.resolution;
        yuyv_to_rgb(&frame[..], width, height).ok_or_else(|| {
            CameraError::ReadFailed(format!(
                "short YUYV frame: {} bytes for {width}x{height}",
                frame.len()
            ))
        })
    }
}

fn device_error(err: impl std::fmt::Display) -> CameraError {
    CameraError::Device(err.to_string())
}

/// Open a V4L2 device and start streaming in the given format.
///
/// Resolution and frame rate fall back to the maximum the device supports when the requested
/// values are not available.
fn start_camera(
    camera_id: u32,
    settings: &CaptureSettings,
    format: &[u8],
) -> Result<Camera, CameraError> {
    let device_name = device_path(camera_id);
    let mut cam = Camera::new(&device_name)?;
    log_supported_formats(&cam, format);

    let resolution = select_resolution(&cam, format, (settings.width, settings.height))?;
    let interval = select_interval(&cam, format, resolution, settings.fps)?;

    cam.start(&Config {
        interval,
        resolution,
        format,
        ..Default::default()
    })
    .map_err(device_error)?;

    log::info!(
        "Using camera {} with {}x{} at {}/{}s",
        device_name,
        resolution.0,
        resolution.1,
        interval.0,
        interval.1
    );

    Ok(cam)
}

fn select_resolution(
    cam: &Camera,
    format: &[u8],
    requested: (u32, u32),
) -> Result<(u32, u32), CameraError> {
    let resolution_info = cam.resolutions(format).map_err(device_error)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);

    let supported = match &resolution_info {
        ResolutionInfo::Discretes(resolutions) => resolutions.contains(&requested),
        ResolutionInfo::Stepwise { min, max, step: _ } => {
            (min.0..=max.0).contains(&requested.0) && (min.1..=max.1).contains(&requested.1)
        }
    };
    if supported {
        return Ok(requested);
    }

    max_resolution(&resolution_info).ok_or_else(|| device_error("No resolution found"))
}

/// Get the maximum supported resolution.
fn max_resolution(resolution_info: &ResolutionInfo) -> Option<(u32, u32)> {
    match resolution_info {
        ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1)
            .copied(),
        ResolutionInfo::Stepwise {
            min: _,
            max,
            step: _,
        } => Some(*max),
    }
}

fn select_interval(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
    fps: u32,
) -> Result<(u32, u32), CameraError> {
    let interval_info = cam.intervals(format, resolution).map_err(device_error)?;
    log::debug!("Found frame intervals: {:?}", &interval_info);

    let requested = (1, fps.max(1));
    match &interval_info {
        IntervalInfo::Discretes(intervals) if intervals.contains(&requested) => Ok(requested),
        IntervalInfo::Stepwise { .. } => Ok(requested),
        IntervalInfo::Discretes(_) => {
            max_frame_rate(&interval_info).ok_or_else(|| device_error("No frame rate found"))
        }
    }
}

/// Get the interval with the highest frame rate.
fn max_frame_rate(interval_info: &IntervalInfo) -> Option<(u32, u32)> {
    match interval_info {
        // Intervals are seconds per frame as (numerator, denominator)
        IntervalInfo::Discretes(intervals) => intervals
            .iter()
            .filter(|(numerator, _)| *numerator > 0)
            .max_by(|a, b| (a.1 as f32 / a.0 as f32).total_cmp(&(b.1 as f32 / b.0 as f32)))
            .copied(),
        IntervalInfo::Stepwise {
            min,
            max: _,
            step: _,
        } => Some(*min),
    }
}

fn log_supported_formats(cam: &Camera, format: &[u8]) {
    let formats: Vec<_> = cam.formats().filter_map(Result::ok).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        String::from_utf8_lossy(format)
    );
}

/// Convert a packed YUYV 4:2:2 buffer to RGB (BT.601).
///
/// Returns `None` if the buffer is too short for the given resolution.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Option<RgbImage> {
    let num_pixels = (width as usize) * (height as usize);
    if width % 2 != 0 || data.len() < num_pixels * 2 {
        return None;
    }

    let mut rgb = Vec::with_capacity(num_pixels * 3);
    for chunk in data[..num_pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;

    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}
