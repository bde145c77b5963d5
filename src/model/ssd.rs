// 该文件是 Xunshan （巡山） 项目的一部分。
// src/model/ssd.rs - SSD 检测器输出解析
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

use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{Detection, NormalizedBox};

/// 检测器固定输出四个张量：位置、类别、分数、数量
pub const SSD_OUTPUT_COUNT: usize = 4;
const FLOAT_SIZE: usize = std::mem::size_of::<f32>();
const DEFAULT_MAX_DETECTIONS: usize = 20;

#[derive(Error, Debug, PartialEq)]
pub enum TensorError {
  #[error("输出张量 {name} 大小 {actual} 字节, 至少需要 {expected} 字节")]
  TooShort {
    name: &'static str,
    expected: usize,
    actual: usize,
  },
  #[error("输出张量 {0} 不是按 4 字节对齐的浮点数组")]
  Misaligned(&'static str),
  #[error("第 {index} 个检测结果的类别 {class} 超出标签表范围 (共 {labels} 个标签)")]
  ClassOutOfRange {
    index: usize,
    class: f32,
    labels: usize,
  },
}

/// SSD 风格输出的布局，`max_detections` 决定每个张量的容量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsdLayout {
  pub max_detections: usize,
}

impl Default for SsdLayout {
  fn default() -> Self {
    Self {
      max_detections: DEFAULT_MAX_DETECTIONS,
    }
  }
}

impl SsdLayout {
  pub const OUTPUT_NAMES: [&'static str; SSD_OUTPUT_COUNT] =
    ["locations", "classes", "scores", "count"];

  pub fn new(max_detections: usize) -> Self {
    Self { max_detections }
  }

  /// 每个输出张量的字节数
  pub fn output_pitches(&self) -> [usize; SSD_OUTPUT_COUNT] {
    [
      4 * self.max_detections * FLOAT_SIZE,
      self.max_detections * FLOAT_SIZE,
      self.max_detections * FLOAT_SIZE,
      FLOAT_SIZE,
    ]
  }

  /// 每个输出张量的维度
  pub fn output_dims(&self) -> [Vec<usize>; SSD_OUTPUT_COUNT] {
    [
      vec![1, self.max_detections, 4],
      vec![1, self.max_detections],
      vec![1, self.max_detections],
      vec![1],
    ]
  }

  /// 把四个原始输出解析为检测结果，写入 `detections`（先清空）
  ///
  /// 类别索引按截断取整，并且必须落在标签表内。
  pub fn interpret(
    &self,
    outputs: [&[u8]; SSD_OUTPUT_COUNT],
    num_labels: usize,
    detections: &mut Vec<Detection>,
  ) -> Result<usize, TensorError> {
    detections.clear();

    let [locations, classes, scores, count] = outputs;
    let count = as_floats("count", count, 1)?;

    let reported = count[0] as i64;
    if reported <= 0 {
      debug!("未检测到物体");
      return Ok(0);
    }
    let mut total = reported as usize;
    if total > self.max_detections {
      warn!(
        "检测数量 {} 超出输出容量 {}，只解析前 {} 个",
        total, self.max_detections, self.max_detections
      );
      total = self.max_detections;
    }

    let locations = as_floats("locations", locations, 4 * total)?;
    let classes = as_floats("classes", classes, total)?;
    let scores = as_floats("scores", scores, total)?;

    for i in 0..total {
      let class = classes[i];
      let class_index = class as i64;
      if class_index < 0 || class_index as usize >= num_labels {
        detections.clear();
        return Err(TensorError::ClassOutOfRange {
          index: i,
          class,
          labels: num_labels,
        });
      }

      detections.push(Detection {
        class_index: class_index as usize,
        score: scores[i],
        bbox: NormalizedBox {
          top: locations[4 * i],
          left: locations[4 * i + 1],
          bottom: locations[4 * i + 2],
          right: locations[4 * i + 3],
        },
      });
    }

    Ok(total)
  }
}

fn as_floats<'a>(
  name: &'static str,
  bytes: &'a [u8],
  wanted: usize,
) -> Result<&'a [f32], TensorError> {
  let expected = wanted * FLOAT_SIZE;
  if bytes.len() < expected {
    return Err(TensorError::TooShort {
      name,
      expected,
      actual: bytes.len(),
    });
  }
  bytemuck::try_cast_slice(&bytes[..expected]).map_err(|_| TensorError::Misaligned(name))
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  /// 按 SSD 布局构造四个输出张量
  pub(crate) struct Fixture {
    pub locations: Vec<f32>,
    pub classes: Vec<f32>,
    pub scores: Vec<f32>,
    pub count: Vec<f32>,
  }

  impl Fixture {
    pub fn new(layout: SsdLayout, items: &[([f32; 4], f32, f32)]) -> Self {
      let mut locations = vec![0.0; 4 * layout.max_detections];
      let mut classes = vec![0.0; layout.max_detections];
      let mut scores = vec![0.0; layout.max_detections];
      for (i, (bbox, class, score)) in items.iter().enumerate() {
        locations[4 * i..4 * i + 4].copy_from_slice(bbox);
        classes[i] = *class;
        scores[i] = *score;
      }
      Self {
        locations,
        classes,
        scores,
        count: vec![items.len() as f32],
      }
    }

    pub fn bytes(&self) -> [&[u8]; SSD_OUTPUT_COUNT] {
      [
        bytemuck::cast_slice(&self.locations),
        bytemuck::cast_slice(&self.classes),
        bytemuck::cast_slice(&self.scores),
        bytemuck::cast_slice(&self.count),
      ]
    }
  }

  #[test]
  fn pitches_match_mobilenet_ssd_outputs() {
    assert_eq!(SsdLayout::default().output_pitches(), [320, 80, 80, 4]);
  }

  #[test]
  fn zero_count_yields_nothing() {
    let layout = SsdLayout::default();
    let fixture = Fixture::new(layout, &[]);
    let mut detections = vec![];
    assert_eq!(layout.interpret(fixture.bytes(), 3, &mut detections), Ok(0));
    assert!(detections.is_empty());
  }

  #[test]
  fn detections_are_read_in_order() {
    let layout = SsdLayout::default();
    let fixture = Fixture::new(
      layout,
      &[
        ([0.1, 0.2, 0.3, 0.4], 2.7, 0.9),
        ([0.5, 0.6, 0.7, 0.8], 0.0, 0.4),
      ],
    );
    let mut detections = vec![];
    assert_eq!(layout.interpret(fixture.bytes(), 3, &mut detections), Ok(2));
    assert_eq!(detections[0].class_index, 2);
    assert_eq!(detections[0].bbox.left, 0.2);
    assert_eq!(detections[1].score, 0.4);
    assert_eq!(detections[1].bbox.right, 0.8);
    for d in &detections {
      assert!(d.class_index < 3);
    }
  }

  #[test]
  fn class_outside_label_table_is_a_contract_failure() {
    let layout = SsdLayout::default();
    let fixture = Fixture::new(layout, &[([0.0, 0.0, 1.0, 1.0], 5.0, 0.9)]);
    let mut detections = vec![];
    let err = layout.interpret(fixture.bytes(), 5, &mut detections).unwrap_err();
    assert!(matches!(err, TensorError::ClassOutOfRange { index: 0, .. }));
    assert!(detections.is_empty());

    let fixture = Fixture::new(layout, &[([0.0, 0.0, 1.0, 1.0], -1.0, 0.9)]);
    assert!(layout.interpret(fixture.bytes(), 5, &mut detections).is_err());
  }

  #[test]
  fn count_is_clamped_to_capacity() {
    let layout = SsdLayout::new(2);
    let mut fixture = Fixture::new(
      layout,
      &[([0.0; 4], 0.0, 0.1), ([0.0; 4], 1.0, 0.2)],
    );
    fixture.count[0] = 9.0;
    let mut detections = vec![];
    assert_eq!(layout.interpret(fixture.bytes(), 2, &mut detections), Ok(2));
  }

  #[test]
  fn short_buffers_are_rejected() {
    let layout = SsdLayout::default();
    let fixture = Fixture::new(layout, &[([0.0; 4], 0.0, 0.1)]);
    let [locations, classes, _, count] = fixture.bytes();
    let mut detections = vec![];
    let err = layout
      .interpret([locations, classes, &[], count], 1, &mut detections)
      .unwrap_err();
    assert!(matches!(err, TensorError::TooShort { name: "scores", .. }));
  }
}
