// 该文件是 Guanshan （观山晚照） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ndarray::ArrayD;
use thiserror::Error;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

pub trait WithLabel: std::fmt::Debug {
  fn to_label_id(&self) -> u32;
  fn to_label_str(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct Tag {
  pub id: u32,
  pub name: String,
}

impl WithLabel for Tag {
  fn to_label_id(&self) -> u32 {
    self.id
  }

  fn to_label_str(&self) -> String {
    self.name.clone()
  }
}

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("标签文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标签文件为空")]
  Empty,
}

/// 标签列表，行号与模型输出类别下标对齐
#[derive(Debug, Clone)]
pub struct LabelList {
  labels: Vec<String>,
}

impl LabelList {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let content = std::fs::read_to_string(path)?;
    Self::from_lines(content.lines())
  }

  pub fn from_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Self, LabelError> {
    let labels: Vec<String> = lines.map(strip_numeric_prefix).collect();
    if labels.is_empty() {
      return Err(LabelError::Empty);
    }
    Ok(LabelList { labels })
  }

  pub fn get(&self, id: usize) -> Option<&str> {
    self.labels.get(id).map(String::as_str)
  }

  /// 查不到名称时退化为数字标签
  pub fn tag(&self, id: usize) -> Tag {
    Tag {
      id: id as u32,
      name: self
        .get(id)
        .map(str::to_string)
        .unwrap_or_else(|| id.to_string()),
    }
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }
}

/// 去掉行首的数字序号，如 "0 cat" -> "cat"
fn strip_numeric_prefix(line: &str) -> String {
  let line = line.trim();
  match line.split_once(' ') {
    Some((head, rest)) if head.parse::<i64>().is_ok() => rest.trim().to_string(),
    _ => line.to_string(),
  }
}

#[derive(Debug, Clone)]
pub struct ClassifyItem {
  pub label: String,
  pub probability: String, // 百分比，保留 3 位小数
}

impl std::fmt::Display for ClassifyItem {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} ({}%)", self.label, self.probability)
  }
}

#[derive(Debug, Clone)]
pub struct ClassifyResult {
  pub items: Box<[ClassifyItem]>,
}

impl ClassifyResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

#[derive(Debug, Clone)]
pub struct DetectItem<T> {
  pub kind: T,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

#[derive(Debug, Clone)]
pub struct DetectResult<T> {
  /// 压缩并转为通道后置布局的原始输出
  pub raw: ArrayD<f32>,
  pub items: Box<[DetectItem<T>]>,
}

impl<T> DetectResult<T> {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

mod classify;
pub use self::classify::{Classifier, ClassifierBuilder, ClassifyError, ResultPolicy};

mod detect;
pub use self::detect::{DetectError, ObjectDetection, ObjectDetectionBuilder, OrtPredictor, Predict};

#[cfg(feature = "cuda")]
pub(crate) fn execution_providers() -> Vec<ort::execution_providers::ExecutionProviderDispatch> {
  vec![ort::execution_providers::CUDAExecutionProvider::default().build()]
}

#[cfg(not(feature = "cuda"))]
pub(crate) fn execution_providers() -> Vec<ort::execution_providers::ExecutionProviderDispatch> {
  vec![ort::execution_providers::CPUExecutionProvider::default().build()]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strip_numeric_prefix_drops_leading_index() {
    assert_eq!(strip_numeric_prefix("0 cat"), "cat");
    assert_eq!(strip_numeric_prefix("12 stop sign"), "stop sign");
  }

  #[test]
  fn strip_numeric_prefix_keeps_non_numeric_head() {
    assert_eq!(strip_numeric_prefix("my label"), "my label");
    assert_eq!(strip_numeric_prefix("cat"), "cat");
  }

  #[test]
  fn label_list_aligns_indexes_with_lines() {
    let labels = LabelList::from_lines("0 other\n1 cat".lines()).unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels.get(0), Some("other"));
    assert_eq!(labels.get(1), Some("cat"));
    assert_eq!(labels.get(2), None);
  }

  #[test]
  fn label_list_rejects_empty_input() {
    assert!(matches!(
      LabelList::from_lines("".lines()),
      Err(LabelError::Empty)
    ));
  }

  #[test]
  fn tag_falls_back_to_numeric_name() {
    let labels = LabelList::from_lines("0 cat".lines()).unwrap();
    assert_eq!(labels.tag(0).name, "cat");
    assert_eq!(labels.tag(7).name, "7");
    assert_eq!(labels.tag(7).id, 7);
  }

  #[test]
  fn classify_item_display_matches_prediction_format() {
    let item = ClassifyItem {
      label: "cat".to_string(),
      probability: "90.000".to_string(),
    };
    assert_eq!(item.to_string(), "cat (90.000%)");
  }
}
