// 该文件是 Xunshan （巡山） 项目的一部分。
// src/model.rs - 检测结果与坐标换算
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

mod ssd;
pub use self::ssd::{SSD_OUTPUT_COUNT, SsdLayout, TensorError};

use crate::frame::Resolution;

/// 归一化边界框 [top, left, bottom, right]，取值 0..1
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedBox {
  pub top: f32,
  pub left: f32,
  pub bottom: f32,
  pub right: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub class_index: usize,
  pub score: f32,
  pub bbox: NormalizedBox,
}

impl Detection {
  /// 阈值为整数百分比，分数等于阈值时也算合格
  ///
  /// 在 f32 上比较，`0.29` 这类分数与阈值 29 舍入到同一个值。
  pub fn qualifies(&self, threshold_percent: u8) -> bool {
    self.score >= threshold_percent as f32 / 100.0
  }
}

/// 高清图像中的像素矩形
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

impl CropRect {
  pub fn right(&self) -> u64 {
    self.x as u64 + self.width as u64
  }

  pub fn bottom(&self) -> u64 {
    self.y as u64 + self.height as u64
  }

  pub fn is_empty(&self) -> bool {
    self.width == 0 || self.height == 0
  }

  pub fn fits_within(&self, resolution: Resolution) -> bool {
    self.right() <= resolution.width as u64 && self.bottom() <= resolution.height as u64
  }
}

/// 把检测框换算到高清帧坐标
///
/// 检测器看到的是高清画面中央以高度为边长的正方形区域，
/// 所以宽度方向按高度缩放，再加上左右裁掉的一半。
/// 结果不做越界截断，越界时由调用方决定如何处理。
pub fn hd_crop_rect(bbox: &NormalizedBox, hd: Resolution) -> CropRect {
  let cropped_width = hd.height as f32;
  let offset = (hd.width as i64 - hd.height as i64) / 2;

  let x = bbox.left * cropped_width + offset as f32;
  let y = bbox.top * hd.height as f32;
  let w = (bbox.right - bbox.left) * cropped_width;
  let h = (bbox.bottom - bbox.top) * hd.height as f32;

  CropRect {
    x: x as u32,
    y: y as u32,
    width: w as u32,
    height: h as u32,
  }
}
