// 该文件是 Xunshan （巡山） 项目的一部分。
// src/output/boxes.rs - 归一化边框叠加层
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

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use super::{OverlayError, OverlayObject, OverlaySink, OverlayState};

/// 低于该分数的目标只画四角
const OUTLINE_SCORE_THRESHOLD: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxStyle {
  Outline,
  Corners,
}

#[derive(Debug, Serialize)]
struct NormalizedRect {
  left: f32,
  top: f32,
  right: f32,
  bottom: f32,
  style: BoxStyle,
  color: [u8; 3],
}

#[derive(Debug, Serialize)]
struct BoxesDocument<'a> {
  timestamp: String,
  generation: u64,
  width: u32,
  height: u32,
  boxes: &'a [NormalizedRect],
}

fn class_color(label: &str) -> [u8; 3] {
  match label {
    "person" => [255, 0, 0],
    "chair" => [0, 0, 255],
    "bed" => [0, 255, 0],
    _ => [255, 255, 255],
  }
}

fn box_style(score: f32) -> BoxStyle {
  if score >= OUTLINE_SCORE_THRESHOLD {
    BoxStyle::Outline
  } else {
    BoxStyle::Corners
  }
}

/// 把叠加层目标换算成归一化矩形，整体提交为一个 JSON 文档
pub struct BoxesSink {
  path: PathBuf,
  rects: Vec<NormalizedRect>,
}

impl BoxesSink {
  pub fn new<P: AsRef<Path>>(path: P) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      rects: Vec::new(),
    }
  }

  fn normalize(object: &OverlayObject, width: f32, height: f32) -> NormalizedRect {
    NormalizedRect {
      left: object.left as f32 / width,
      top: object.top as f32 / height,
      right: object.right as f32 / width,
      bottom: object.bottom as f32 / height,
      style: box_style(object.score),
      color: class_color(&object.label),
    }
  }
}

impl OverlaySink for BoxesSink {
  fn name(&self) -> &str {
    "boxes"
  }

  fn render(&mut self, state: &OverlayState) -> Result<(), OverlayError> {
    let resolution = state.resolution();
    let (width, height) = (
      resolution.width.max(1) as f32,
      resolution.height.max(1) as f32,
    );
    self.rects.clear();
    self.rects.extend(
      state
        .objects()
        .iter()
        .map(|object| Self::normalize(object, width, height)),
    );

    let document = BoxesDocument {
      timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
      generation: state.generation(),
      width: resolution.width,
      height: resolution.height,
      boxes: &self.rects,
    };
    let json = serde_json::to_vec_pretty(&document)?;
    std::fs::write(&self.path, json).map_err(|source| OverlayError::Io {
      path: self.path.clone(),
      source,
    })?;
    debug!("提交 {} 个边框", self.rects.len());
    Ok(())
  }
}
