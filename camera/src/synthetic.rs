//! Synthetic camera producing a moving test pattern.
//!
//! Used to run the stream server on hosts without a capture device.
use std::{thread, time::Duration};

use image::{Rgb, RgbImage};

use crate::{CameraBackend, CameraDevice, CameraError, CaptureSettings};

/// Backend with a fixed number of synthetic devices, `0..num_devices`.
pub struct Synthetic {
    num_devices: u32,
}

impl Synthetic {
    pub fn new(num_devices: u32) -> Self {
        Self { num_devices }
    }
}

impl Default for Synthetic {
    fn default() -> Self {
        Self::new(1)
    }
}

impl CameraBackend for Synthetic {
    fn name(&self) -> &'static str {
        "Synthetic"
    }

    fn open(
        &self,
        camera_id: u32,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn CameraDevice>, CameraError> {
        if camera_id >= self.num_devices {
            return Err(CameraError::Device(format!(
                "no synthetic camera {camera_id}"
            )));
        }

        Ok(Box::new(TestPattern {
            camera_id,
            settings: *settings,
            frame_counter: 0,
        }))
    }
}

struct TestPattern {
    camera_id: u32,
    settings: CaptureSettings,
    frame_counter: u32,
}

impl CameraDevice for TestPattern {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        let CaptureSettings { width, height, fps } = self.settings;
        if fps > 0 {
            thread::sleep(Duration::from_millis(1000 / fps as u64));
        }

        // Vertical bar sweeping from left to right, the blue channel encodes the camera index
        let bar_x = (self.frame_counter * 8) % width.max(1);
        let blue = (self.camera_id * 40 % 256) as u8;
        self.frame_counter = self.frame_counter.wrapping_add(1);

        Ok(RgbImage::from_fn(width, height, |x, y| {
            if x >= bar_x && x < bar_x + 16 {
                Rgb([255, 255, 255])
            } else {
                Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, blue])
            }
        }))
    }
}
