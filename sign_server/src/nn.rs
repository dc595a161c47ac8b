//! YOLO hand sign detector running on `tract`.
//!
//! Expects an ONNX export of a YOLOv8-style detection head: input `1x3xSxS` (RGB in `[0, 1]`),
//! output `1x(4+C)xN` where every one of the `N` anchors holds a center-form box in input pixels
//! followed by `C` class scores.
use std::path::Path;

use anyhow::{bail, Result};
use common::detection::Detection;
use image::RgbImage;
use ndarray::{s, ArrayView1, ArrayViewD, Ix3};
use tract_onnx::prelude::*;

use crate::detector::Detector;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Overlap above which the less confident of two boxes is dropped.
const MAX_IOU: f32 = 0.45;

/// Reentrant: a runnable plan creates a fresh state for every `run`.
pub struct YoloModel {
    model: NnModel,
    input_size: u32,
    min_confidence: f32,
    max_iou: f32,
}

impl YoloModel {
    pub fn load(path: impl AsRef<Path>, input_size: u32, min_confidence: f32) -> Result<Self> {
        let size = input_size as usize;
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size));
        let model = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        Ok(Self {
            model,
            input_size,
            min_confidence,
            max_iou: MAX_IOU,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let size = self.input_size;
        // Stretching keeps normalized coordinates valid for the original image
        let resized: RgbImage =
            image::imageops::resize(input, size, size, image::imageops::FilterType::Triangle);

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }
}

impl Detector for YoloModel {
    fn infer(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.preproc(image);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;
        let output = raw_nn_out[0].to_array_view::<f32>()?;

        decode_output(
            output,
            self.input_size as f32,
            self.min_confidence,
            self.max_iou,
        )
    }
}

/// Turn the raw detection head output into detections, most confident first.
pub fn decode_output(
    output: ArrayViewD<f32>,
    input_size: f32,
    min_confidence: f32,
    max_iou: f32,
) -> Result<Vec<Detection>> {
    let output = output.into_dimensionality::<Ix3>()?;
    let (batch, channels, num_anchors) = output.dim();
    if batch != 1 || channels < 5 {
        bail!("unexpected model output shape {:?}", output.shape());
    }

    let mut candidates: Vec<Detection> = (0..num_anchors)
        .filter_map(|anchor| {
            let column: ArrayView1<f32> = output.slice(s![0, .., anchor]);
            let (class_index, confidence) = column
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))?;

            if confidence.is_nan() || confidence < min_confidence {
                return None;
            }

            let center_box = [column[0], column[1], column[2], column[3]].map(|v| v / input_size);
            Some(Detection::new(class_index, confidence, center_box))
        })
        .collect();

    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    Ok(non_maximum_suppression(candidates, max_iou))
}

/// Run non-maximum-suppression on candidate detections.
///
/// Start with the most confident candidate and iterate over all others in the order of sinking
/// confidence. A candidate is only selected if it does not overlap any already selected one by
/// more than `max_iou`. The input has to be sorted by ascending confidence.
fn non_maximum_suppression(mut sorted_candidates: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    let mut selected: Vec<Detection> = vec![];

    while let Some(candidate) = sorted_candidates.pop() {
        let corners = candidate.bounding_box().corners();
        let overlaps = selected
            .iter()
            .any(|chosen| iou(&corners, &chosen.bounding_box().corners()) > max_iou);

        if !overlaps {
            selected.push(candidate);
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the corner points of the overlap box are ill defined, i.e. the
    // top-left corner is below or right of the bottom-right corner and the area is zero.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    // Avoid division-by-zero with `EPS`
    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box `[x_top_left, y_top_left, x_bottom_right,
/// y_bottom_right]`. An ill-defined box has an area of zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
