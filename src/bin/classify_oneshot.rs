// 该文件是 Guanshan （观山晚照） 项目的一部分。
// src/bin/classify_oneshot.rs - 多分类推理程序
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
use tracing::info;

use guanshan::{
  input::ImageFileInput,
  model::{ClassifierBuilder, ResultPolicy},
  output::JsonClassifyOutput,
  task::{OneShotTask, Task},
};

/// Guanshan 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像路径，可指定多个
  #[arg(short = 'i', long, value_name = "IMAGE", num_args = 1.., required = true)]
  pub input: Vec<PathBuf>,

  /// ONNX 模型文件路径
  #[arg(long, value_name = "MODEL", default_value = "model.onnx")]
  pub model: PathBuf,

  /// 标签文件路径，每行一个标签
  #[arg(long, value_name = "LABELS", default_value = "model.labels")]
  pub labels: PathBuf,

  /// 每张图像保留的 top-k 数量
  #[arg(long, default_value = "1", value_name = "COUNT")]
  pub number_top: usize,

  /// 每张图像单独输出结果
  #[arg(long)]
  pub per_image: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt().with_writer(std::io::stderr).init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model.display());
  info!("标签文件路径: {}", args.labels.display());
  info!("输入图像数量: {}", args.input.len());

  let input = ImageFileInput::open(&args.input)?;

  let (policy, output) = if args.per_image {
    (ResultPolicy::PerImage, JsonClassifyOutput::array())
  } else {
    (ResultPolicy::LastOnly, JsonClassifyOutput::object())
  };
  let model = ClassifierBuilder::new(&args.model, &args.labels)
    .number_top(args.number_top)
    .policy(policy)
    .build()?;

  OneShotTask.run_task(input.into_batch(), model, output)?;

  Ok(())
}
