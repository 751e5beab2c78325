#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::GenericImageView;
use tract_onnx::prelude::*;

use super::region::{non_max_suppression, BoxModel};
use crate::detect::result::BoxDetection;

const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;

/// Tract-based YOLOv8 ONNX model.
///
/// Loads the model file once and reuses the optimized plan for every image.
/// Expects the standard export layout `[1, 4 + classes, anchors]` with
/// `cx, cy, w, h` followed by per-class scores.
pub struct TractYoloModel {
    model: TypedRunnableModel<TypedModel>,
    model_path: String,
    input_size: u32,
    score_threshold: f32,
    iou_threshold: f32,
}

impl TractYoloModel {
    /// Load an ONNX model from disk and prepare it for square inputs of `input_size`.
    pub fn load<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            model_path: model_path.display().to_string(),
            input_size,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        })
    }

    /// Override the raw score cut applied before NMS.
    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    fn build_input(&self, image: &image::DynamicImage) -> Tensor {
        let size = self.input_size;
        let resized = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();
        let size = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, scale_x: f32, scale_y: f32) -> Result<Vec<BoxDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        decode_predictions(
            view,
            self.score_threshold,
            self.iou_threshold,
            scale_x,
            scale_y,
        )
    }
}

/// Best class per anchor, raw score cut, rescale to image pixels, then NMS.
fn decode_predictions(
    view: tract_ndarray::ArrayViewD<'_, f32>,
    score_threshold: f32,
    iou_threshold: f32,
    scale_x: f32,
    scale_y: f32,
) -> Result<Vec<BoxDetection>> {
    let shape = view.shape().to_vec();
    if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
        return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
    }
    let rows = shape[1];
    let anchors = shape[2];

    let mut boxes = Vec::new();
    for i in 0..anchors {
        let mut best_class = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for class in 0..rows - 4 {
            let score = view[[0, 4 + class, i]];
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if !best_score.is_finite() || best_score < score_threshold {
            continue;
        }
        let cx = view[[0, 0, i]];
        let cy = view[[0, 1, i]];
        let w = view[[0, 2, i]];
        let h = view[[0, 3, i]];
        boxes.push(BoxDetection {
            x1: (cx - w / 2.0) * scale_x,
            y1: (cy - h / 2.0) * scale_y,
            x2: (cx + w / 2.0) * scale_x,
            y2: (cy + h / 2.0) * scale_y,
            confidence: best_score.min(1.0),
            class_id: best_class as u32,
        });
    }
    Ok(non_max_suppression(boxes, iou_threshold))
}

impl BoxModel for TractYoloModel {
    fn describe(&self) -> String {
        Path::new(&self.model_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.model_path.clone())
    }

    fn predict(&mut self, image_path: &Path) -> Result<Vec<BoxDetection>> {
        let image = image::open(image_path)
            .with_context(|| format!("failed to decode image {}", image_path.display()))?;
        let (width, height) = image.dimensions();
        let input = self.build_input(&image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let scale_x = width as f32 / self.input_size as f32;
        let scale_y = height as f32 / self.input_size as f32;
        self.decode(outputs, scale_x, scale_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two well-separated single-class anchors scored 0.2 and 0.9.
    fn two_anchors() -> tract_ndarray::ArrayD<f32> {
        let mut out = tract_ndarray::Array3::<f32>::zeros((1, 5, 2));
        for (i, (cx, score)) in [(50.0, 0.2), (400.0, 0.9)].into_iter().enumerate() {
            out[[0, 0, i]] = cx;
            out[[0, 1, i]] = 50.0;
            out[[0, 2, i]] = 40.0;
            out[[0, 3, i]] = 80.0;
            out[[0, 4, i]] = score;
        }
        out.into_dyn()
    }

    #[test]
    fn default_raw_cut_drops_low_scores() {
        let out = two_anchors();
        let boxes =
            decode_predictions(out.view(), DEFAULT_SCORE_THRESHOLD, DEFAULT_IOU_THRESHOLD, 1.0, 1.0)
                .unwrap();
        assert_eq!(boxes.len(), 1);
        assert!((boxes[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn lowered_raw_cut_keeps_low_scores() {
        let out = two_anchors();
        let boxes = decode_predictions(out.view(), 0.1, DEFAULT_IOU_THRESHOLD, 2.0, 1.0).unwrap();
        assert_eq!(boxes.len(), 2);
        let low = boxes.iter().find(|b| b.confidence < 0.5).unwrap();
        assert!((low.x1 - 60.0).abs() < 1e-4);
        assert!((low.x2 - 140.0).abs() < 1e-4);
    }

    #[test]
    fn rejects_unexpected_output_shape() {
        let out = tract_ndarray::Array2::<f32>::zeros((1, 5)).into_dyn();
        assert!(decode_predictions(out.view(), 0.25, 0.45, 1.0, 1.0).is_err());
    }
}
