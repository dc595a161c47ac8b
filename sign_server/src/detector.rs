//! The object detector seam.
//!
//! Everything downstream of the model only sees [`Detector::infer`]. The loaded model lives in a
//! [`ModelSlot`] which starts out empty and is filled once loading has finished.
use std::{
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use anyhow::Result;
use clap::Args;
use common::detection::Detection;
use image::RgbImage;
use tokio::task::JoinHandle;

use crate::{nn::YoloModel, utils::resolve_model_path};

/// Stateless object detection on a single RGB image.
///
/// Implementations are shared between request handlers and stream threads. A model which is not
/// safe to call concurrently must serialize itself, e.g. by being wrapped in [`Serialized`].
pub trait Detector: Send + Sync {
    fn infer(&self, image: &RgbImage) -> Result<Vec<Detection>>;
}

/// Runs every inference of the wrapped detector under one lock.
pub struct Serialized<D> {
    inner: Mutex<D>,
}

impl<D> Serialized<D> {
    pub fn new(detector: D) -> Self {
        Self {
            inner: Mutex::new(detector),
        }
    }
}

impl<D: Detector> Detector for Serialized<D> {
    fn infer(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let detector = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        detector.infer(image)
    }
}

/// Write-once holder of the loaded detector.
#[derive(Default)]
pub struct ModelSlot {
    detector: OnceLock<Arc<dyn Detector>>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot that is loaded from the start.
    pub fn loaded(detector: Arc<dyn Detector>) -> Self {
        let slot = Self::new();
        slot.set(detector);
        slot
    }

    /// Store the detector. Returns `false` if a detector was already set.
    pub fn set(&self, detector: Arc<dyn Detector>) -> bool {
        self.detector.set(detector).is_ok()
    }

    pub fn get(&self) -> Option<Arc<dyn Detector>> {
        self.detector.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.detector.get().is_some()
    }
}

/// Model options shared by both servers.
#[derive(Args, Clone, Debug)]
pub struct ModelArgs {
    /// Path of the ONNX detection model
    #[clap(long, env = "SIGN_MODEL_PATH", default_value = "best.onnx")]
    pub model_path: PathBuf,

    /// URL to download the model from if it is not found at the model path
    #[clap(long, env = "SIGN_MODEL_URL")]
    pub model_url: Option<String>,

    /// Side length of the square model input
    #[clap(long, default_value = "640")]
    pub model_input_size: u32,

    /// Detections below this confidence are dropped by the model already
    #[clap(long, default_value = "0.1")]
    pub model_min_confidence: f32,

    /// Run at most one inference at a time
    #[clap(long)]
    pub serialize_inference: bool,
}

impl ModelArgs {
    /// Locate (and if needed download) the model file and load it.
    pub async fn load(&self) -> Result<Arc<dyn Detector>> {
        let path = resolve_model_path(&self.model_path, self.model_url.as_deref()).await?;
        let (input_size, min_confidence) = (self.model_input_size, self.model_min_confidence);

        let model =
            tokio::task::spawn_blocking(move || YoloModel::load(path, input_size, min_confidence))
                .await??;

        let detector: Arc<dyn Detector> = match self.serialize_inference {
            true => Arc::new(Serialized::new(model)),
            false => Arc::new(model),
        };

        Ok(detector)
    }
}

/// Load the model in the background and fill the slot when done.
///
/// A failed load leaves the slot empty; the servers keep running and report the model as not
/// loaded.
pub fn spawn_model_loader(args: ModelArgs, slot: Arc<ModelSlot>) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::info!("Loading model {}", args.model_path.display());
        match args.load().await {
            Ok(detector) => {
                slot.set(detector);
                log::info!("Model loaded, {} classes", common::letters::NUM_CLASSES);
            }
            Err(err) => log::error!("Failed to load model: {err:#}"),
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    struct Fixed(Vec<Detection>);

    impl Detector for Fixed {
        fn infer(&self, _image: &RgbImage) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_slot_is_write_once() {
        let slot = ModelSlot::new();
        assert!(!slot.is_loaded());
        assert!(slot.get().is_none());

        assert!(slot.set(Arc::new(Fixed(vec![]))));
        assert!(!slot.set(Arc::new(Fixed(vec![]))));
        assert!(slot.is_loaded());
    }

    #[test]
    fn test_serialized_forwards() -> Result<()> {
        let detection = Detection::new(1, 0.7, [0.5, 0.5, 0.1, 0.1]);
        let detector = Serialized::new(Fixed(vec![detection]));

        let result = detector.infer(&RgbImage::new(2, 2))?;
        assert_eq!(result, vec![detection]);

        Ok(())
    }
}
