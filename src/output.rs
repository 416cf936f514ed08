// 该文件是 Guanshan （观山晚照） 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::RgbImage;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::model::{ClassifyResult, DetectResult, Tag, WithLabel};

pub trait Render<Frame, Output>: Sized {
  type Error;

  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 分类结果的 JSON 标准输出
pub struct JsonClassifyOutput {
  array: bool,
}

impl JsonClassifyOutput {
  /// 单条结果输出为对象，多条退化为数组
  pub fn object() -> Self {
    JsonClassifyOutput { array: false }
  }

  /// 总是输出数组
  pub fn array() -> Self {
    JsonClassifyOutput { array: true }
  }
}

fn classify_value(result: &ClassifyResult, array: bool) -> Value {
  let values: Vec<Value> = result
    .items
    .iter()
    .map(|item| {
      json!({
        "label": item.label,
        "probability": item.probability,
      })
    })
    .collect();

  if !array && values.len() == 1 {
    values.into_iter().next().unwrap_or(Value::Null)
  } else {
    Value::Array(values)
  }
}

impl Render<Vec<RgbImage>, ClassifyResult> for JsonClassifyOutput {
  type Error = OutputError;

  fn render_result(&self, _frame: &Vec<RgbImage>, result: &ClassifyResult) -> Result<(), Self::Error> {
    for item in result.items.iter() {
      info!("识别结果: {}", item);
    }

    let value = classify_value(result, self.array);
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
  }
}

/// 原始检测张量的标准输出
pub struct RawTensorOutput;

impl Render<RgbImage, DetectResult<Tag>> for RawTensorOutput {
  type Error = OutputError;

  fn render_result(&self, _frame: &RgbImage, result: &DetectResult<Tag>) -> Result<(), Self::Error> {
    println!("{}", result.raw);
    Ok(())
  }
}

/// 解码后检测框的 JSON 标准输出
pub struct JsonDetectionOutput;

fn detection_value(result: &DetectResult<Tag>) -> Value {
  let values: Vec<Value> = result
    .items
    .iter()
    .map(|item| {
      json!({
        "label": item.kind.to_label_str(),
        "probability": format!("{:.3}", item.score * 100.0),
        "box": {
          "left": item.bbox[0],
          "top": item.bbox[1],
          "width": item.bbox[2] - item.bbox[0],
          "height": item.bbox[3] - item.bbox[1],
        },
      })
    })
    .collect();
  Value::Array(values)
}

impl Render<RgbImage, DetectResult<Tag>> for JsonDetectionOutput {
  type Error = OutputError;

  fn render_result(&self, _frame: &RgbImage, result: &DetectResult<Tag>) -> Result<(), Self::Error> {
    for item in result.items.iter() {
      info!(
        "检测结果: {} ({:.3}%)",
        item.kind.to_label_str(),
        item.score * 100.0
      );
    }

    println!("{}", serde_json::to_string_pretty(&detection_value(result))?);
    Ok(())
  }
}
