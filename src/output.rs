// 该文件是 Xunshan （巡山） 项目的一部分。
// src/output.rs - 检测结果输出：裁剪图与叠加层
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

use std::path::PathBuf;

use thiserror::Error;

mod boxes;
mod draw;
mod overlay;
mod save_image_file;

pub use self::boxes::{BoxStyle, BoxesSink};
pub use self::draw::CanvasSink;
pub use self::overlay::{
  OVERLAY_CAPACITY, OVERLAY_LABEL_MAX_LEN, OverlayBackend, OverlayObject, OverlaySink, OverlayState,
};
pub use self::save_image_file::{CropError, DetectionCropWriter, crop_interleaved};

#[derive(Error, Debug)]
pub enum OverlayError {
  #[error("无法读取字体 {path}: {message}")]
  Font { path: PathBuf, message: String },
  #[error("叠加层图像错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("叠加层序列化错误: {0}")]
  Serialize(#[from] serde_json::Error),
  #[error("无法写入叠加层 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
}
