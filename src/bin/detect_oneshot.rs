// 该文件是 Guanshan （观山晚照） 项目的一部分。
// src/bin/detect_oneshot.rs - 目标检测推理程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use guanshan::{
  input::ImageFileInput,
  model::ObjectDetectionBuilder,
  output::{JsonDetectionOutput, RawTensorOutput},
  task::{OneShotTask, Task},
};

/// Guanshan 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像路径，仅使用第一张
  #[arg(short = 'i', long, value_name = "IMAGE", num_args = 1.., required = true)]
  pub input: Vec<PathBuf>,

  /// ONNX 模型文件路径
  #[arg(long, value_name = "MODEL", default_value = "model.onnx")]
  pub model: PathBuf,

  /// 标签文件路径，每行一个标签
  #[arg(long, value_name = "LABELS", default_value = "model.labels")]
  pub labels: PathBuf,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,

  /// 最大检测数量
  #[arg(long, default_value = "5", value_name = "COUNT")]
  pub max_detections: usize,

  /// 强制输入尺寸，格式为 WxH，缺省时跟随模型或图像尺寸
  #[arg(long, value_name = "SIZE")]
  pub input_size: Option<String>,

  /// 输出解码后的检测框 JSON 而非原始数组
  #[arg(long)]
  pub json: bool,
}

fn parse_size(size: &str) -> Result<(u32, u32)> {
  let (width, height) = size
    .split_once('x')
    .ok_or_else(|| anyhow::anyhow!("输入尺寸格式应为 WxH: {}", size))?;
  Ok((width.trim().parse()?, height.trim().parse()?))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt().with_writer(std::io::stderr).init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model.display());
  info!("标签文件路径: {}", args.labels.display());
  info!("置信度阈值: {}", args.confidence);
  info!("最大检测数量: {}", args.max_detections);

  let input = ImageFileInput::open(&args.input)?;
  if input.len() > 1 {
    warn!("检测任务仅使用第一张输入图像，忽略其余 {} 张", input.len() - 1);
  }

  let input_size = match &args.input_size {
    Some(size) => Some(parse_size(size)?),
    None => None,
  };

  let model = ObjectDetectionBuilder::new(&args.model, &args.labels)
    .prob_threshold(args.confidence)
    .max_detections(args.max_detections)
    .input_size(input_size)
    .build()?;

  if args.json {
    OneShotTask.run_task(input.into_frames(), model, JsonDetectionOutput)?;
  } else {
    OneShotTask.run_task(input.into_frames(), model, RawTensorOutput)?;
  }

  Ok(())
}
