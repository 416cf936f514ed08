// 该文件是 Guanshan （观山晚照） 项目的一部分。
// src/tensor.rs - 图像张量布局转换
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

use image::RgbImage;
use ndarray::{Array3, Array4, Axis};

const RGB_CHANNELS: usize = 3;

/// 调整图像到指定尺寸，尺寸一致时原样返回
pub fn resize_to(image: &RgbImage, width: u32, height: u32) -> RgbImage {
  if image.dimensions() == (width, height) {
    return image.clone();
  }
  image::imageops::resize(image, width, height, image::imageops::FilterType::Triangle)
}

/// 将 RGB 图像转为 (C, H, W) 浮点平面，通道顺序为 BGR
pub fn bgr_chw(image: &RgbImage) -> Array3<f32> {
  let (width, height) = image.dimensions();
  let mut plane = Array3::zeros((RGB_CHANNELS, height as usize, width as usize));

  for c in 0..RGB_CHANNELS {
    for y in 0..height {
      for x in 0..width {
        let pixel = image.get_pixel(x, y);
        plane[[c, y as usize, x as usize]] = pixel[RGB_CHANNELS - 1 - c] as f32;
      }
    }
  }
  plane
}

/// 将 RGB 图像转为 (H, W, C) 浮点数组，保持 RGB 顺序
pub fn hwc(image: &RgbImage) -> Array3<f32> {
  let (width, height) = image.dimensions();
  let mut plane = Array3::zeros((height as usize, width as usize, RGB_CHANNELS));

  for y in 0..height {
    for x in 0..width {
      let pixel = image.get_pixel(x, y);
      for c in 0..RGB_CHANNELS {
        plane[[y as usize, x as usize, c]] = pixel[c] as f32;
      }
    }
  }
  plane
}

/// 将 (H, W, C) 数组转为批大小为 1 的 (N, C, H, W)，通道反转为 BGR
pub fn bgr_nchw(hwc: &Array3<f32>) -> Array4<f32> {
  let (height, width, channels) = hwc.dim();
  let mut batch = Array4::zeros((1, channels, height, width));

  for c in 0..channels {
    for y in 0..height {
      for x in 0..width {
        batch[[0, c, y, x]] = hwc[[y, x, channels - 1 - c]];
      }
    }
  }
  batch
}

/// 将若干 (C, H, W) 平面堆叠为 (N, C, H, W) 批张量
pub fn stack_batch(planes: &[Array3<f32>]) -> Result<Array4<f32>, ndarray::ShapeError> {
  let views: Vec<_> = planes.iter().map(|p| p.view()).collect();
  ndarray::stack(Axis(0), &views)
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn sample_image() -> RgbImage {
    let mut image = RgbImage::new(2, 1);
    image.put_pixel(0, 0, Rgb([10, 20, 30]));
    image.put_pixel(1, 0, Rgb([40, 50, 60]));
    image
  }

  #[test]
  fn resize_to_same_size_is_identity() {
    let image = sample_image();
    let resized = resize_to(&image, 2, 1);
    assert_eq!(resized.dimensions(), (2, 1));
    assert_eq!(resized.as_raw(), image.as_raw());
  }

  #[test]
  fn resize_to_changes_dimensions() {
    let image = sample_image();
    let resized = resize_to(&image, 4, 2);
    assert_eq!(resized.dimensions(), (4, 2));
  }

  #[test]
  fn bgr_chw_reverses_channel_order() {
    let plane = bgr_chw(&sample_image());
    assert_eq!(plane.dim(), (3, 1, 2));
    // 平面 0 为蓝色通道
    assert_eq!(plane[[0, 0, 0]], 30.0);
    assert_eq!(plane[[1, 0, 0]], 20.0);
    assert_eq!(plane[[2, 0, 0]], 10.0);
    assert_eq!(plane[[0, 0, 1]], 60.0);
  }

  #[test]
  fn hwc_keeps_rgb_order() {
    let plane = hwc(&sample_image());
    assert_eq!(plane.dim(), (1, 2, 3));
    assert_eq!(plane[[0, 0, 0]], 10.0);
    assert_eq!(plane[[0, 0, 2]], 30.0);
    assert_eq!(plane[[0, 1, 1]], 50.0);
  }

  #[test]
  fn bgr_nchw_matches_bgr_chw() {
    let image = sample_image();
    let batch = bgr_nchw(&hwc(&image));
    let plane = bgr_chw(&image);
    assert_eq!(batch.dim(), (1, 3, 1, 2));
    assert_eq!(batch.index_axis(Axis(0), 0), plane);
  }

  #[test]
  fn stack_batch_builds_batch_axis() {
    let image = sample_image();
    let planes = vec![bgr_chw(&image), bgr_chw(&image)];
    let batch = stack_batch(&planes).unwrap();
    assert_eq!(batch.dim(), (2, 3, 1, 2));
  }

  #[test]
  fn stack_batch_rejects_mismatched_shapes() {
    let planes = vec![Array3::zeros((3, 1, 2)), Array3::zeros((3, 2, 2))];
    assert!(stack_batch(&planes).is_err());
  }
}
