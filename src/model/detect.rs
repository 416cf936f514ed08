// 该文件是 Guanshan （观山晚照） 项目的一部分。
// src/model/detect.rs - 目标检测模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use half::f16;
use image::RgbImage;
use ndarray::{Array3, ArrayD, Axis, IxDyn};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::tensor::TensorElementType;
use ort::value::ValueType;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{DetectItem, DetectResult, LabelError, LabelList, Model, Tag};
use crate::tensor;

const DETECT_PROB_THRESH: f32 = 0.5;
const DETECT_MAX_COUNT: usize = 5;
const DETECT_NMS_THRESH: f32 = 0.45;
const DETECT_STRIDE: u32 = 32;
const BOX_FIELDS: usize = 5; // x, y, w, h, objectness

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(ort::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("推理错误: {0}")]
  InferenceError(ort::Error),
  #[error("标签错误: {0}")]
  LabelError(#[from] LabelError),
}

/// 检测后端钩子：输入 (H, W, C) 的 RGB 浮点数组，
/// 输出压缩并转为通道后置布局的原始数组
pub trait Predict {
  type Error;

  fn predict(&self, input: &Array3<f32>) -> Result<ArrayD<f32>, Self::Error>;
}

pub struct OrtPredictor {
  session: Session,
  input_name: String,
  output_name: String,
  is_fp16: bool,
  declared_size: Option<(u32, u32)>,
}

impl OrtPredictor {
  pub fn from_file(model_path: &Path) -> Result<Self, DetectError> {
    info!("加载模型文件: {}", model_path.display());
    let session = Session::builder()
      .and_then(|b| b.with_execution_providers(crate::model::execution_providers()))
      .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Disable))
      .and_then(|b| b.commit_from_file(model_path))
      .map_err(DetectError::ModelLoadError)?;
    info!("模型加载完成");

    let input_name = session
      .inputs
      .first()
      .map(|input| input.name.clone())
      .ok_or_else(|| DetectError::ModelInvalid("模型没有输入张量".to_string()))?;
    let output_name = session
      .outputs
      .first()
      .map(|output| output.name.clone())
      .ok_or_else(|| DetectError::ModelInvalid("模型没有输出张量".to_string()))?;

    let is_fp16 = matches!(
      &session.inputs[0].input_type,
      ValueType::Tensor {
        ty: TensorElementType::Float16,
        ..
      }
    );
    debug!("模型输入为半精度: {}", is_fp16);

    // 固定导出的空间尺寸；动态维度记为 None
    let declared_size = session.inputs[0]
      .input_type
      .tensor_dimensions()
      .and_then(|dims| {
        if dims.len() == 4 && dims[2] > 0 && dims[3] > 0 {
          Some((dims[3] as u32, dims[2] as u32))
        } else {
          None
        }
      });
    debug!("模型声明的输入尺寸: {:?}", declared_size);

    Ok(OrtPredictor {
      session,
      input_name,
      output_name,
      is_fp16,
      declared_size,
    })
  }

  pub fn declared_size(&self) -> Option<(u32, u32)> {
    self.declared_size
  }
}

impl Predict for OrtPredictor {
  type Error = DetectError;

  fn predict(&self, input: &Array3<f32>) -> Result<ArrayD<f32>, Self::Error> {
    let batch = tensor::bgr_nchw(input);

    debug!("执行模型推理，输入形状: {:?}", batch.shape());
    let raw: ArrayD<f32> = if self.is_fp16 {
      // 半精度模型先转换输入
      let batch = batch.mapv(f16::from_f32);
      let inputs = ort::inputs![self.input_name.as_str() => batch.view()]
        .map_err(DetectError::InferenceError)?;
      let outputs = self.session.run(inputs).map_err(DetectError::InferenceError)?;
      let value = &outputs[self.output_name.as_str()];
      match value.try_extract_tensor::<f32>() {
        Ok(view) => view.into_owned(),
        Err(_) => value
          .try_extract_tensor::<f16>()
          .map_err(DetectError::InferenceError)?
          .mapv(|v| v.to_f32()),
      }
    } else {
      let inputs = ort::inputs![self.input_name.as_str() => batch.view()]
        .map_err(DetectError::InferenceError)?;
      let outputs = self.session.run(inputs).map_err(DetectError::InferenceError)?;
      let value = &outputs[self.output_name.as_str()];
      match value.try_extract_tensor::<f32>() {
        Ok(view) => view.into_owned(),
        Err(_) => value
          .try_extract_tensor::<f16>()
          .map_err(DetectError::InferenceError)?
          .mapv(|v| v.to_f32()),
      }
    };

    Ok(channel_last(squeeze(raw)))
  }
}

/// 移除所有长度为 1 的维度
fn squeeze(mut raw: ArrayD<f32>) -> ArrayD<f32> {
  while raw.ndim() > 1 {
    match raw.shape().iter().position(|&d| d == 1) {
      Some(axis) => raw = raw.index_axis_move(Axis(axis), 0),
      None => break,
    }
  }
  raw
}

/// 将 (C, H, W) 转为 (H, W, C)
fn channel_last(raw: ArrayD<f32>) -> ArrayD<f32> {
  if raw.ndim() != 3 {
    return raw;
  }
  raw
    .permuted_axes(IxDyn(&[1, 2, 0]))
    .as_standard_layout()
    .to_owned()
}

/// 将自然尺寸向下取整到步长的倍数
fn fit_stride(width: u32, height: u32) -> (u32, u32) {
  let fit = |v: u32| (v / DETECT_STRIDE).max(1) * DETECT_STRIDE;
  (fit(width), fit(height))
}

pub struct ObjectDetectionBuilder {
  model_path: PathBuf,
  labels_path: PathBuf,
  prob_threshold: f32,
  max_detections: usize,
  input_size: Option<(u32, u32)>,
}

impl ObjectDetectionBuilder {
  pub fn new(model_path: impl AsRef<Path>, labels_path: impl AsRef<Path>) -> Self {
    ObjectDetectionBuilder {
      model_path: model_path.as_ref().to_path_buf(),
      labels_path: labels_path.as_ref().to_path_buf(),
      prob_threshold: DETECT_PROB_THRESH,
      max_detections: DETECT_MAX_COUNT,
      input_size: None,
    }
  }

  pub fn prob_threshold(mut self, prob_threshold: f32) -> Self {
    self.prob_threshold = prob_threshold;
    self
  }

  pub fn max_detections(mut self, max_detections: usize) -> Self {
    self.max_detections = max_detections;
    self
  }

  pub fn input_size(mut self, input_size: Option<(u32, u32)>) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn build(self) -> Result<ObjectDetection<OrtPredictor>, DetectError> {
    info!("加载标签文件: {}", self.labels_path.display());
    let labels = LabelList::from_file(&self.labels_path)?;
    debug!("标签数量: {}", labels.len());

    let predictor = OrtPredictor::from_file(&self.model_path)?;

    // 输入尺寸：显式配置优先，其次模型声明的固定尺寸，
    // 两者皆无时由图像自然尺寸决定
    let input_size = self.input_size.or_else(|| predictor.declared_size());

    Ok(ObjectDetection {
      predictor,
      labels,
      prob_threshold: self.prob_threshold,
      max_detections: self.max_detections,
      input_size,
    })
  }
}

/// 通用目标检测流程，后端通过 Predict 钩子接入
pub struct ObjectDetection<P> {
  predictor: P,
  labels: LabelList,
  prob_threshold: f32,
  max_detections: usize,
  input_size: Option<(u32, u32)>,
}

impl<P: Predict> ObjectDetection<P> {
  pub fn predict_image(&self, image: &RgbImage) -> Result<DetectResult<Tag>, P::Error> {
    let tensor = self.preprocess(image);
    let raw = self.predictor.predict(&tensor)?;
    Ok(self.postprocess(raw))
  }

  fn preprocess(&self, image: &RgbImage) -> Array3<f32> {
    let (width, height) = match self.input_size {
      Some(size) => size,
      None => fit_stride(image.width(), image.height()),
    };
    let resized = tensor::resize_to(image, width, height);
    tensor::hwc(&resized)
  }

  fn postprocess(&self, raw: ArrayD<f32>) -> DetectResult<Tag> {
    let items = self.extract_items(&raw);
    debug!("检测到 {} 个物体", items.len());
    DetectResult {
      raw,
      items: items.into_boxed_slice(),
    }
  }

  /// 仅当通道数等于 5 + 类别数时解码边界框
  fn extract_items(&self, raw: &ArrayD<f32>) -> Vec<DetectItem<Tag>> {
    if raw.ndim() != 3 {
      debug!("输出维度数量为 {}, 跳过边界框解码", raw.ndim());
      return Vec::new();
    }
    let (grid_h, grid_w, channels) = (raw.shape()[0], raw.shape()[1], raw.shape()[2]);
    if channels != BOX_FIELDS + self.labels.len() {
      debug!(
        "输出通道数 {} 与 5 + {} 个类别不符，跳过边界框解码",
        channels,
        self.labels.len()
      );
      return Vec::new();
    }

    let mut items = Vec::new();
    for row in 0..grid_h {
      for col in 0..grid_w {
        let objectness = raw[[row, col, 4]];
        if objectness < self.prob_threshold {
          continue;
        }

        // 最高类别得分
        let mut max_score = 0.0f32;
        let mut max_id = 0usize;
        for class_id in 0..self.labels.len() {
          let score = raw[[row, col, BOX_FIELDS + class_id]];
          if score > max_score {
            max_score = score;
            max_id = class_id;
          }
        }

        let score = objectness * max_score;
        if score < self.prob_threshold {
          continue;
        }

        // 解码归一化边界框
        let cx = (col as f32 + raw[[row, col, 0]]) / grid_w as f32;
        let cy = (row as f32 + raw[[row, col, 1]]) / grid_h as f32;
        let w = raw[[row, col, 2]];
        let h = raw[[row, col, 3]];

        items.push(DetectItem {
          kind: self.labels.tag(max_id),
          score,
          bbox: [
            (cx - w / 2.0).clamp(0.0, 1.0),
            (cy - h / 2.0).clamp(0.0, 1.0),
            (cx + w / 2.0).clamp(0.0, 1.0),
            (cy + h / 2.0).clamp(0.0, 1.0),
          ],
        });
      }
    }

    let mut items = nms(items, DETECT_NMS_THRESH);
    items.truncate(self.max_detections);
    items
  }
}

impl<P: Predict> Model for ObjectDetection<P> {
  type Input = RgbImage;
  type Output = DetectResult<Tag>;
  type Error = P::Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.predict_image(input)
  }
}

/// 同类别非极大值抑制
fn nms(mut items: Vec<DetectItem<Tag>>, threshold: f32) -> Vec<DetectItem<Tag>> {
  items.sort_by(|a, b| {
    b.score
      .partial_cmp(&a.score)
      .unwrap_or(std::cmp::Ordering::Equal)
  });

  let mut result = Vec::new();
  while !items.is_empty() {
    let best = items.remove(0);
    items.retain(|item| item.kind.id != best.kind.id || iou(&best.bbox, &item.bbox) < threshold);
    result.push(best);
  }
  result
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array;

  struct EchoPredictor {
    raw: ArrayD<f32>,
  }

  impl Predict for EchoPredictor {
    type Error = DetectError;

    fn predict(&self, _input: &Array3<f32>) -> Result<ArrayD<f32>, Self::Error> {
      Ok(self.raw.clone())
    }
  }

  fn pipeline(raw: ArrayD<f32>, labels: &str) -> ObjectDetection<EchoPredictor> {
    ObjectDetection {
      predictor: EchoPredictor { raw },
      labels: LabelList::from_lines(labels.lines()).unwrap(),
      prob_threshold: DETECT_PROB_THRESH,
      max_detections: DETECT_MAX_COUNT,
      input_size: None,
    }
  }

  #[test]
  fn squeeze_removes_singleton_axes() {
    let raw = Array::zeros(IxDyn(&[1, 20, 13, 13]));
    assert_eq!(squeeze(raw).shape(), &[20, 13, 13]);

    let raw = Array::zeros(IxDyn(&[1, 1, 5]));
    assert_eq!(squeeze(raw).shape(), &[5]);
  }

  #[test]
  fn channel_last_moves_first_axis_to_back() {
    let raw = Array::from_shape_fn(IxDyn(&[2, 3, 4]), |d| (d[0] * 100 + d[1] * 10 + d[2]) as f32);
    let out = channel_last(raw.clone());
    assert_eq!(out.shape(), &[3, 4, 2]);
    assert_eq!(out[[1, 2, 0]], raw[[0, 1, 2]]);
    assert_eq!(out[[1, 2, 1]], raw[[1, 1, 2]]);
  }

  #[test]
  fn raw_element_count_matches_grid_times_channels() {
    // 3 个类别，通道数 5 + 3，网格 2x2
    let raw = Array::zeros(IxDyn(&[1, 8, 2, 2]));
    let out = channel_last(squeeze(raw));
    assert_eq!(out.shape(), &[2, 2, 8]);
    assert_eq!(out.len(), 2 * 2 * (5 + 3));
  }

  #[test]
  fn fit_stride_rounds_down_to_stride() {
    assert_eq!(fit_stride(640, 640), (640, 640));
    assert_eq!(fit_stride(700, 500), (672, 480));
    assert_eq!(fit_stride(20, 20), (32, 32));
  }

  #[test]
  fn extract_items_filters_by_confidence() {
    // 网格 2x2，1 个类别，通道数 6
    let mut raw = Array::zeros(IxDyn(&[2, 2, 6]));
    // (0, 0): 有效检测
    raw[[0, 0, 0]] = 0.5;
    raw[[0, 0, 1]] = 0.5;
    raw[[0, 0, 2]] = 0.2;
    raw[[0, 0, 3]] = 0.2;
    raw[[0, 0, 4]] = 0.9;
    raw[[0, 0, 5]] = 0.8;
    // (1, 0): 物体置信度高但类别得分低
    raw[[1, 0, 4]] = 0.9;
    raw[[1, 0, 5]] = 0.4;
    // (1, 1): 有效检测
    raw[[1, 1, 0]] = 0.5;
    raw[[1, 1, 1]] = 0.5;
    raw[[1, 1, 2]] = 0.2;
    raw[[1, 1, 3]] = 0.2;
    raw[[1, 1, 4]] = 0.8;
    raw[[1, 1, 5]] = 0.9;

    let detection = pipeline(raw.clone(), "0 part");
    let items = detection.extract_items(&raw);
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].kind.name, "part");

    let bbox = items
      .iter()
      .find(|item| item.bbox[0] < 0.5)
      .map(|item| item.bbox)
      .unwrap();
    assert!((bbox[0] - 0.15).abs() < 1e-6);
    assert!((bbox[3] - 0.35).abs() < 1e-6);
  }

  #[test]
  fn extract_items_skips_unexpected_channel_count() {
    let raw = Array::zeros(IxDyn(&[2, 2, 9]));
    let detection = pipeline(raw.clone(), "0 part");
    assert!(detection.extract_items(&raw).is_empty());
  }

  #[test]
  fn predict_image_returns_raw_and_items() {
    let raw = Array::zeros(IxDyn(&[2, 2, 6]));
    let detection = pipeline(raw, "0 part");
    let image = RgbImage::new(64, 64);
    let result = detection.predict_image(&image).unwrap();
    assert_eq!(result.raw.shape(), &[2, 2, 6]);
    assert!(result.is_empty());
  }

  #[test]
  fn nms_drops_overlapping_same_class_boxes() {
    let tag = |id| Tag {
      id,
      name: format!("{}", id),
    };
    let items = vec![
      DetectItem {
        kind: tag(0),
        score: 0.9,
        bbox: [0.1, 0.1, 0.5, 0.5],
      },
      DetectItem {
        kind: tag(0),
        score: 0.8,
        bbox: [0.12, 0.12, 0.5, 0.5],
      },
      DetectItem {
        kind: tag(1),
        score: 0.7,
        bbox: [0.1, 0.1, 0.5, 0.5],
      },
    ];
    let kept = nms(items, DETECT_NMS_THRESH);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].score, 0.9);
    assert_eq!(kept[1].kind.id, 1);
  }

  #[test]
  fn iou_of_identical_and_disjoint_boxes() {
    let a = [0.0, 0.0, 0.5, 0.5];
    let b = [0.6, 0.6, 0.9, 0.9];
    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    assert_eq!(iou(&a, &b), 0.0);
  }
}
