// 该文件是 Xunshan （巡山） 项目的一部分。
// src/output/overlay.rs - 叠加层状态与输出后端
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

use serde::Serialize;
use tracing::debug;

use super::{BoxesSink, CanvasSink, OverlayError};
use crate::frame::Resolution;
use crate::labels::{LabelTable, cap_str};
use crate::model::{Detection, hd_crop_rect};

/// 同时显示的目标数上限
pub const OVERLAY_CAPACITY: usize = 5;
/// 叠加层标签的最大字节数
pub const OVERLAY_LABEL_MAX_LEN: usize = 50;

/// 一个待显示的目标，坐标为高清帧像素
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayObject {
  pub top: u32,
  pub left: u32,
  pub bottom: u32,
  pub right: u32,
  pub label: String,
  pub score: f32,
}

/// 检测周期写入、叠加层任务读取的有界目标表
#[derive(Debug, Clone)]
pub struct OverlayState {
  resolution: Resolution,
  objects: Vec<OverlayObject>,
  generation: u64,
}

impl OverlayState {
  pub fn new(resolution: Resolution) -> Self {
    Self {
      resolution,
      objects: Vec::with_capacity(OVERLAY_CAPACITY),
      generation: 0,
    }
  }

  /// 叠加层坐标所在的高清帧尺寸
  pub fn resolution(&self) -> Resolution {
    self.resolution
  }

  pub fn objects(&self) -> &[OverlayObject] {
    &self.objects
  }

  pub fn len(&self) -> usize {
    self.objects.len()
  }

  pub fn is_empty(&self) -> bool {
    self.objects.is_empty()
  }

  /// 每次发布递增
  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn clear(&mut self) {
    self.objects.clear();
    self.generation += 1;
  }

  /// 用本周期的检测结果替换全部目标，不看保存阈值，最多保留前 5 个
  pub fn publish(&mut self, detections: &[Detection], labels: &LabelTable) -> usize {
    self.objects.clear();
    for detection in detections.iter().take(OVERLAY_CAPACITY) {
      let rect = hd_crop_rect(&detection.bbox, self.resolution);
      let label = labels.get(detection.class_index).unwrap_or("?");
      self.objects.push(OverlayObject {
        top: rect.y,
        left: rect.x,
        bottom: rect.y.saturating_add(rect.height),
        right: rect.x.saturating_add(rect.width),
        label: cap_str(label, OVERLAY_LABEL_MAX_LEN).to_string(),
        score: detection.score,
      });
    }
    self.generation += 1;
    debug!(
      "发布叠加层第 {} 版: {} 个目标",
      self.generation,
      self.objects.len()
    );
    self.objects.len()
  }
}

/// 叠加层输出
pub trait OverlaySink {
  fn name(&self) -> &str;
  fn render(&mut self, state: &OverlayState) -> Result<(), OverlayError>;
}

/// 在配置时选定的叠加层后端
pub enum OverlayBackend {
  Canvas(CanvasSink),
  Boxes(BoxesSink),
}

impl OverlaySink for OverlayBackend {
  fn name(&self) -> &str {
    match self {
      OverlayBackend::Canvas(sink) => sink.name(),
      OverlayBackend::Boxes(sink) => sink.name(),
    }
  }

  fn render(&mut self, state: &OverlayState) -> Result<(), OverlayError> {
    match self {
      OverlayBackend::Canvas(sink) => sink.render(state),
      OverlayBackend::Boxes(sink) => sink.render(state),
    }
  }
}
