// 该文件是 Xunshan （巡山） 项目的一部分。
// src/output/draw.rs - 透明画布叠加层
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

use ab_glyph::{FontVec, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{debug, info};

use super::{OverlayError, OverlayObject, OverlaySink, OverlayState};
use crate::frame::Resolution;

const LINE_WIDTH: u32 = 5;
const LABEL_FONT_SIZE: f32 = 15.0;
const BOX_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const TEXT_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// 在与高清流同尺寸的透明画布上画框和标签，保存为 PNG
pub struct CanvasSink {
  path: PathBuf,
  canvas: RgbaImage,
  font: Option<FontVec>,
}

impl CanvasSink {
  /// 没有字体时只画框
  pub fn new<P: AsRef<Path>>(
    path: P,
    resolution: Resolution,
    font_path: Option<&Path>,
  ) -> Result<Self, OverlayError> {
    let font = match font_path {
      Some(font_path) => {
        let data = std::fs::read(font_path).map_err(|e| OverlayError::Font {
          path: font_path.to_path_buf(),
          message: e.to_string(),
        })?;
        let font = FontVec::try_from_vec(data).map_err(|e| OverlayError::Font {
          path: font_path.to_path_buf(),
          message: e.to_string(),
        })?;
        Some(font)
      }
      None => None,
    };
    info!(
      "画布叠加层: {} ({}, {})",
      path.as_ref().display(),
      resolution,
      if font.is_some() { "带标签" } else { "无标签" }
    );
    Ok(Self {
      path: path.as_ref().to_path_buf(),
      canvas: RgbaImage::from_pixel(resolution.width, resolution.height, TRANSPARENT),
      font,
    })
  }

  pub fn canvas(&self) -> &RgbaImage {
    &self.canvas
  }

  fn draw_object(&mut self, object: &OverlayObject) {
    let (width, height) = self.canvas.dimensions();
    if width == 0 || height == 0 {
      return;
    }
    let left = object.left.min(width - 1);
    let top = object.top.min(height - 1);
    let right = object.right.min(width - 1);
    let bottom = object.bottom.min(height - 1);
    if left >= right || top >= bottom {
      return;
    }

    for inset in 0..LINE_WIDTH {
      let w = (right - left + 1).saturating_sub(inset * 2);
      let h = (bottom - top + 1).saturating_sub(inset * 2);
      if w == 0 || h == 0 {
        break;
      }
      let rect = Rect::at((left + inset) as i32, (top + inset) as i32).of_size(w, h);
      draw_hollow_rect_mut(&mut self.canvas, rect, BOX_COLOR);
    }

    if let Some(font) = &self.font {
      let text = format!("{} ({:.2})", object.label, object.score);
      let scale = PxScale::from(LABEL_FONT_SIZE);
      let (text_width, _) = text_size(scale, font, &text);
      let x = (left + (right - left) / 2) as i32 - text_width as i32 / 2;
      let y = (top + (bottom - top) / 2) as i32;
      draw_text_mut(&mut self.canvas, TEXT_COLOR, x, y, scale, font, &text);
    }
  }
}

impl OverlaySink for CanvasSink {
  fn name(&self) -> &str {
    "canvas"
  }

  fn render(&mut self, state: &OverlayState) -> Result<(), OverlayError> {
    for pixel in self.canvas.pixels_mut() {
      *pixel = TRANSPARENT;
    }
    for object in state.objects() {
      self.draw_object(object);
    }
    self.canvas.save(&self.path)?;
    debug!("重绘叠加层: {} 个目标", state.len());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::labels::LabelTable;
  use crate::model::{Detection, NormalizedBox};

  #[test]
  fn canvas_draws_box_edges_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("overlay.png");
    let resolution = Resolution::new(64, 32);
    let mut sink = CanvasSink::new(&path, resolution, None).unwrap();

    let labels = LabelTable::parse(b"person\n");
    let mut state = OverlayState::new(resolution);
    state.publish(
      &[Detection {
        class_index: 0,
        score: 0.8,
        bbox: NormalizedBox {
          top: 0.0,
          left: 0.0,
          bottom: 1.0,
          right: 1.0,
        },
      }],
      &labels,
    );
    sink.render(&state).unwrap();

    // 框的左上角在 (16, 0)，中心保持透明
    let canvas = sink.canvas();
    assert_eq!(*canvas.get_pixel(16, 0), BOX_COLOR);
    assert_eq!(*canvas.get_pixel(20, 4), BOX_COLOR);
    assert_eq!(*canvas.get_pixel(32, 16), TRANSPARENT);
    assert_eq!(*canvas.get_pixel(2, 16), TRANSPARENT);
    assert!(path.exists());

    state.publish(&[], &labels);
    sink.render(&state).unwrap();
    assert_eq!(*sink.canvas().get_pixel(16, 0), TRANSPARENT);
  }

  #[test]
  fn missing_font_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let font = dir.path().join("missing.ttf");
    assert!(matches!(
      CanvasSink::new(
        dir.path().join("o.png"),
        Resolution::new(8, 8),
        Some(&font)
      ),
      Err(OverlayError::Font { .. })
    ));
  }
}
