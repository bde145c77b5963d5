// 该文件是 Xunshan （巡山） 项目的一部分。
// src/output/save_image_file.rs - 保存检测目标的高清裁剪图
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

use std::path::{Path, PathBuf};

use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;
use tracing::{debug, warn};

use crate::frame::{RGB_CHANNELS, Resolution};
use crate::model::CropRect;

#[derive(Error, Debug)]
pub enum CropError {
  #[error("裁剪区域 {rect:?} 超出 {image} 的图像")]
  OutOfBounds { rect: CropRect, image: Resolution },
  #[error("裁剪区域 {0:?} 面积为零")]
  Empty(CropRect),
  #[error("源图像只有 {actual} 字节, 需要 {expected} 字节")]
  SourceTooShort { expected: usize, actual: usize },
  #[error("JPEG 编码错误: {0}")]
  Encode(#[from] image::ImageError),
  #[error("无法写入 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
}

/// 从交错 RGB 图像中拷贝出一个矩形区域到 `target`
///
/// 越界或空的区域返回错误，不做截断。
pub fn crop_interleaved(
  source: &[u8],
  image: Resolution,
  rect: CropRect,
  target: &mut Vec<u8>,
) -> Result<(), CropError> {
  if rect.is_empty() {
    return Err(CropError::Empty(rect));
  }
  if !rect.fits_within(image) {
    return Err(CropError::OutOfBounds { rect, image });
  }
  let expected = image.rgb_size();
  if source.len() < expected {
    return Err(CropError::SourceTooShort {
      expected,
      actual: source.len(),
    });
  }

  let stride = image.width as usize * RGB_CHANNELS;
  let row_len = rect.width as usize * RGB_CHANNELS;
  target.clear();
  target.reserve(row_len * rect.height as usize);
  for row in rect.y as usize..rect.bottom() as usize {
    let start = row * stride + rect.x as usize * RGB_CHANNELS;
    target.extend_from_slice(&source[start..start + row_len]);
  }
  Ok(())
}

/// 把每个合格检测的裁剪图写成 `<dir>/detection_<k>.jpg`
///
/// 裁剪和编码缓冲在各周期之间复用。
pub struct DetectionCropWriter {
  directory: PathBuf,
  quality: u8,
  pixels: Vec<u8>,
  encoded: Vec<u8>,
}

impl DetectionCropWriter {
  pub fn new<P: AsRef<Path>>(directory: P, quality: u8) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      quality,
      pixels: Vec::new(),
      encoded: Vec::new(),
    }
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn path_for(&self, index: usize) -> PathBuf {
    self.directory.join(format!("detection_{}.jpg", index))
  }

  /// 裁剪、编码并覆盖写入第 `index` 个文件
  pub fn write(
    &mut self,
    index: usize,
    hd_rgb: &[u8],
    hd: Resolution,
    rect: CropRect,
  ) -> Result<PathBuf, CropError> {
    crop_interleaved(hd_rgb, hd, rect, &mut self.pixels)?;

    self.encoded.clear();
    {
      // JpegEncoder 接受 1..=100
      let mut encoder =
        JpegEncoder::new_with_quality(&mut self.encoded, self.quality.clamp(1, 100));
      encoder.encode(&self.pixels, rect.width, rect.height, ExtendedColorType::Rgb8)?;
    }

    let path = self.path_for(index);
    std::fs::write(&path, &self.encoded).map_err(|source| CropError::Io {
      path: path.clone(),
      source,
    })?;
    debug!(
      "保存 {} ({}x{}, {} 字节)",
      path.display(),
      rect.width,
      rect.height,
      self.encoded.len()
    );
    Ok(path)
  }

  /// 删除编号不小于 `written` 的旧文件，返回删除的数量
  pub fn remove_stale(&self, written: usize) -> usize {
    let mut removed = 0;
    let mut index = written;
    loop {
      let path = self.path_for(index);
      if !path.exists() {
        break;
      }
      match std::fs::remove_file(&path) {
        Ok(()) => removed += 1,
        Err(e) => {
          warn!("无法删除旧文件 {}: {}", path.display(), e);
          break;
        }
      }
      index += 1;
    }
    removed
  }
}
