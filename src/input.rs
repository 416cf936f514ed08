// 该文件是 Guanshan （观山晚照） 项目的一部分。
// src/input.rs - 图像文件输入
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("没有输入图像")]
  Empty,
}

/// 已解码的输入图像集合
pub struct ImageFileInput {
  images: Vec<RgbImage>,
}

impl ImageFileInput {
  /// 按顺序解码所有输入路径
  pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, InputError> {
    if paths.is_empty() {
      return Err(InputError::Empty);
    }

    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
      let image: RgbImage = ImageReader::open(path)?.decode()?.into();
      debug!(
        "读取图像 {}: {}x{}",
        path.as_ref().display(),
        image.width(),
        image.height()
      );
      images.push(image);
    }

    Ok(ImageFileInput { images })
  }

  pub fn len(&self) -> usize {
    self.images.len()
  }

  pub fn is_empty(&self) -> bool {
    self.images.is_empty()
  }

  /// 逐帧迭代，每次产出一张图像
  pub fn into_frames(self) -> ImageFileInputFrames {
    ImageFileInputFrames {
      images: self.images.into_iter(),
    }
  }

  /// 整批迭代，一次产出全部图像
  pub fn into_batch(self) -> ImageFileInputBatch {
    ImageFileInputBatch {
      images: Some(self.images),
    }
  }
}

pub struct ImageFileInputFrames {
  images: std::vec::IntoIter<RgbImage>,
}

impl Iterator for ImageFileInputFrames {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    self.images.next()
  }
}

pub struct ImageFileInputBatch {
  images: Option<Vec<RgbImage>>,
}

impl Iterator for ImageFileInputBatch {
  type Item = Vec<RgbImage>;

  fn next(&mut self) -> Option<Self::Item> {
    self.images.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_temp_png(name: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(name);
    let image = RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]));
    image.save(&path).unwrap();
    path
  }

  #[test]
  fn open_decodes_every_path() {
    let path = write_temp_png("guanshan_input_open.png");
    let input = ImageFileInput::open(&[&path, &path]).unwrap();
    assert_eq!(input.len(), 2);
    let _ = std::fs::remove_file(path);
  }

  #[test]
  fn open_rejects_empty_path_list() {
    let paths: [&str; 0] = [];
    assert!(matches!(
      ImageFileInput::open(&paths),
      Err(InputError::Empty)
    ));
  }

  #[test]
  fn open_fails_on_missing_file() {
    let result = ImageFileInput::open(&["guanshan-no-such-image.png"]);
    assert!(matches!(result, Err(InputError::IoError(_))));
  }

  #[test]
  fn into_frames_yields_one_image_at_a_time() {
    let path = write_temp_png("guanshan_input_frames.png");
    let mut frames = ImageFileInput::open(&[&path, &path]).unwrap().into_frames();
    assert!(frames.next().is_some());
    assert!(frames.next().is_some());
    assert!(frames.next().is_none());
    let _ = std::fs::remove_file(path);
  }

  #[test]
  fn into_batch_yields_exactly_once() {
    let path = write_temp_png("guanshan_input_batch.png");
    let mut batch = ImageFileInput::open(&[&path, &path]).unwrap().into_batch();
    assert_eq!(batch.next().map(|b| b.len()), Some(2));
    assert!(batch.next().is_none());
    let _ = std::fs::remove_file(path);
  }
}
