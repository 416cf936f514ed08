// 该文件是 Guanshan （观山晚照） 项目的一部分。
// src/model/classify.rs - 多分类模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use image::RgbImage;
use ndarray::{Array2, ArrayView2};
use ort::session::Session;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{ClassifyItem, ClassifyResult, LabelError, LabelList, Model};
use crate::tensor;

#[derive(Error, Debug)]
pub enum ClassifyError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(ort::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("推理错误: {0}")]
  InferenceError(ort::Error),
  #[error("标签错误: {0}")]
  LabelError(#[from] LabelError),
  #[error("没有输入图像")]
  EmptyInput,
  #[error("输入图像数量 {0} 超过模型批大小 {1}")]
  BatchOverflow(usize, usize),
  #[error("类别 {0} 超出标签列表范围，共 {1} 个标签")]
  LabelOutOfRange(usize, usize),
  #[error("张量形状错误: {0}")]
  ShapeError(#[from] ndarray::ShapeError),
}

/// 批推理结果的保留策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResultPolicy {
  /// 仅保留最后一张图像的最优结果
  LastOnly,
  /// 每张图像保留 top-k 结果
  PerImage,
  /// 保留所有得分不低于阈值的标签
  Threshold(f32),
}

pub struct ClassifierBuilder {
  model_path: PathBuf,
  labels_path: PathBuf,
  number_top: usize,
  policy: ResultPolicy,
}

impl ClassifierBuilder {
  pub fn new(model_path: impl AsRef<Path>, labels_path: impl AsRef<Path>) -> Self {
    ClassifierBuilder {
      model_path: model_path.as_ref().to_path_buf(),
      labels_path: labels_path.as_ref().to_path_buf(),
      number_top: 1,
      policy: ResultPolicy::LastOnly,
    }
  }

  pub fn number_top(mut self, number_top: usize) -> Self {
    self.number_top = number_top;
    self
  }

  pub fn policy(mut self, policy: ResultPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn build(self) -> Result<Classifier, ClassifyError> {
    info!("加载标签文件: {}", self.labels_path.display());
    let labels = LabelList::from_file(&self.labels_path)?;
    debug!("标签数量: {}", labels.len());

    info!("加载模型文件: {}", self.model_path.display());
    let session = Session::builder()
      .and_then(|b| b.with_execution_providers(crate::model::execution_providers()))
      .and_then(|b| b.commit_from_file(&self.model_path))
      .map_err(ClassifyError::ModelLoadError)?;
    info!("模型加载完成");

    let input_name = session
      .inputs
      .first()
      .map(|input| input.name.clone())
      .ok_or_else(|| ClassifyError::ModelInvalid("模型没有输入张量".to_string()))?;
    let output_name = session
      .outputs
      .first()
      .map(|output| output.name.clone())
      .ok_or_else(|| ClassifyError::ModelInvalid("模型没有输出张量".to_string()))?;

    let dims = session.inputs[0]
      .input_type
      .tensor_dimensions()
      .cloned()
      .ok_or_else(|| ClassifyError::ModelInvalid("模型输入不是张量".to_string()))?;
    if dims.len() != 4 {
      return Err(ClassifyError::ModelInvalid(format!(
        "预期输入维度数量为 4, 实际为 {}",
        dims.len()
      )));
    }
    debug!("模型输入形状: {:?}", dims);

    // 批维度允许动态，空间尺寸必须固定
    let batch = if dims[0] > 0 {
      Some(dims[0] as usize)
    } else {
      None
    };
    if dims[2] <= 0 || dims[3] <= 0 {
      return Err(ClassifyError::ModelInvalid(
        "分类模型要求固定的输入尺寸".to_string(),
      ));
    }
    let height = dims[2] as u32;
    let width = dims[3] as u32;

    Ok(Classifier {
      session,
      input_name,
      output_name,
      batch,
      height,
      width,
      labels,
      number_top: self.number_top,
      policy: self.policy,
    })
  }
}

pub struct Classifier {
  session: Session,
  input_name: String,
  output_name: String,
  batch: Option<usize>,
  height: u32,
  width: u32,
  labels: LabelList,
  number_top: usize,
  policy: ResultPolicy,
}

impl Classifier {
  pub fn input_shape(&self) -> (Option<usize>, u32, u32) {
    (self.batch, self.height, self.width)
  }
}

impl Model for Classifier {
  type Input = Vec<RgbImage>;
  type Output = ClassifyResult;
  type Error = ClassifyError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    check_batch(self.batch, input.len())?;

    debug!("预处理 {} 张输入图像", input.len());
    let mut planes = Vec::with_capacity(input.len());
    for image in input {
      let resized = tensor::resize_to(image, self.width, self.height);
      planes.push(tensor::bgr_chw(&resized));
    }
    let batch = tensor::stack_batch(&planes)?;

    debug!("执行模型推理");
    let inputs = ort::inputs![self.input_name.as_str() => batch.view()]
      .map_err(ClassifyError::InferenceError)?;
    let outputs = self
      .session
      .run(inputs)
      .map_err(ClassifyError::InferenceError)?;
    let scores = outputs[self.output_name.as_str()]
      .try_extract_tensor::<f32>()
      .map_err(ClassifyError::InferenceError)?;

    // 按批行展开，压缩掉尾部的单元素维度
    let rows = scores.shape().first().copied().unwrap_or(0);
    if rows == 0 {
      return Err(ClassifyError::ModelInvalid("模型输出为空".to_string()));
    }
    let row_len = scores.len() / rows;
    let matrix =
      Array2::from_shape_vec((rows, row_len), scores.iter().copied().collect::<Vec<f32>>())?;
    debug!("模型输出形状: {} x {}", rows, row_len);

    apply_policy(matrix.view(), &self.labels, self.number_top, self.policy)
  }
}

fn check_batch(declared: Option<usize>, actual: usize) -> Result<(), ClassifyError> {
  if actual == 0 {
    return Err(ClassifyError::EmptyInput);
  }
  if let Some(limit) = declared
    && actual > limit
  {
    return Err(ClassifyError::BatchOverflow(actual, limit));
  }
  Ok(())
}

/// 按得分降序返回前 k 个类别下标
fn top_indices(row: &[f32], k: usize) -> Vec<(usize, f32)> {
  let mut indexed: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
  indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
  indexed.truncate(k);
  indexed
}

fn apply_policy(
  matrix: ArrayView2<f32>,
  labels: &LabelList,
  number_top: usize,
  policy: ResultPolicy,
) -> Result<ClassifyResult, ClassifyError> {
  let item = |id: usize, score: f32| -> Result<ClassifyItem, ClassifyError> {
    let label = labels
      .get(id)
      .ok_or(ClassifyError::LabelOutOfRange(id, labels.len()))?;
    Ok(ClassifyItem {
      label: label.to_string(),
      probability: format!("{:.3}", score * 100.0),
    })
  };

  let mut items = Vec::new();
  match policy {
    ResultPolicy::LastOnly => {
      let mut last = None;
      for row in matrix.rows() {
        let ranked = top_indices(&row.to_vec(), number_top);
        if let Some(&(id, score)) = ranked.first() {
          last = Some(item(id, score)?);
        }
      }
      items.extend(last);
    }
    ResultPolicy::PerImage => {
      for row in matrix.rows() {
        for (id, score) in top_indices(&row.to_vec(), number_top) {
          items.push(item(id, score)?);
        }
      }
    }
    ResultPolicy::Threshold(threshold) => {
      for row in matrix.rows() {
        let row = row.to_vec();
        for (id, score) in top_indices(&row, row.len()) {
          if score >= threshold {
            items.push(item(id, score)?);
          }
        }
      }
    }
  }

  Ok(ClassifyResult {
    items: items.into_boxed_slice(),
  })
}
