// 该文件是 Xunshan （巡山） 项目的一部分。
// src/frame.rs - 原始相机帧定义
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

use std::fmt;
use std::str::FromStr;

use crate::model::CropRect;

pub const RGB_CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
  pub width: u32,
  pub height: u32,
}

impl Resolution {
  pub const fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub fn area(&self) -> u64 {
    self.width as u64 * self.height as u64
  }

  pub fn is_zero(&self) -> bool {
    self.width == 0 || self.height == 0
  }

  /// 两个方向都不小于 `other`
  pub fn covers(&self, other: Resolution) -> bool {
    self.width >= other.width && self.height >= other.height
  }

  /// 交错排列 RGB 图像的字节数
  pub fn rgb_size(&self) -> usize {
    self.width as usize * self.height as usize * RGB_CHANNELS
  }
}

impl fmt::Display for Resolution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}x{}", self.width, self.height)
  }
}

/// 一个平面在紧凑帧内的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
  pub offset: usize,
  pub row_bytes: usize,
  pub rows: usize,
}

impl PlaneLayout {
  /// 从行间带填充的源平面逐行复制到紧凑帧
  ///
  /// `stride` 小于行宽或源数据不足时什么都不写，返回 `false`。
  pub fn copy_rows(&self, dst: &mut [u8], src: &[u8], stride: usize) -> bool {
    if self.rows == 0 {
      return true;
    }
    let needed = stride * (self.rows - 1) + self.row_bytes;
    let end = self.offset + self.row_bytes * self.rows;
    if stride < self.row_bytes || src.len() < needed || dst.len() < end {
      return false;
    }
    for (row, out) in dst[self.offset..end]
      .chunks_exact_mut(self.row_bytes)
      .enumerate()
    {
      let start = row * stride;
      out.copy_from_slice(&src[start..start + self.row_bytes]);
    }
    true
  }
}

/// 相机输出的原始像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
  /// Y 平面后跟交错的 UV 平面，色度宽高各减半
  Nv12,
  /// 每两个像素共用一组 U/V：Y0 U Y1 V
  Yuyv,
}

impl PixelFormat {
  pub fn name(&self) -> &'static str {
    match self {
      PixelFormat::Nv12 => "nv12",
      PixelFormat::Yuyv => "yuyv",
    }
  }

  /// 色度行的字节数
  ///
  /// 奇数宽度时最后一列单独占一组 U/V，因此按像素对向上取整。
  pub fn chroma_stride(&self, resolution: Resolution) -> usize {
    let pairs = (resolution.width as usize).div_ceil(2);
    match self {
      PixelFormat::Nv12 => pairs * 2,
      PixelFormat::Yuyv => pairs * 4,
    }
  }

  /// 给定分辨率下一帧的字节数
  pub fn frame_size(&self, resolution: Resolution) -> usize {
    let (width, height) = (resolution.width as usize, resolution.height as usize);
    let stride = self.chroma_stride(resolution);
    match self {
      PixelFormat::Nv12 => width * height + stride * height.div_ceil(2),
      PixelFormat::Yuyv => stride * height,
    }
  }

  /// 紧凑帧中各个平面的位置
  pub fn planes(&self, resolution: Resolution) -> Vec<PlaneLayout> {
    let (width, height) = (resolution.width as usize, resolution.height as usize);
    let stride = self.chroma_stride(resolution);
    match self {
      PixelFormat::Nv12 => vec![
        PlaneLayout {
          offset: 0,
          row_bytes: width,
          rows: height,
        },
        PlaneLayout {
          offset: width * height,
          row_bytes: stride,
          rows: height.div_ceil(2),
        },
      ],
      PixelFormat::Yuyv => vec![PlaneLayout {
        offset: 0,
        row_bytes: stride,
        rows: height,
      }],
    }
  }

  /// 像素 (x, y) 的 Y、U、V 三个字节在帧内的偏移
  ///
  /// 坐标须落在 `resolution` 内，此时三个偏移都小于 `frame_size`。
  pub fn yuv_offsets(&self, resolution: Resolution, x: usize, y: usize) -> [usize; 3] {
    let width = resolution.width as usize;
    let stride = self.chroma_stride(resolution);
    match self {
      PixelFormat::Nv12 => {
        let uv = width * resolution.height as usize + (y / 2) * stride + (x / 2) * 2;
        [y * width + x, uv, uv + 1]
      }
      PixelFormat::Yuyv => {
        let pair = y * stride + (x / 2) * 4;
        [pair + (x & 1) * 2, pair + 1, pair + 3]
      }
    }
  }
}

impl fmt::Display for PixelFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for PixelFormat {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "nv12" => Ok(PixelFormat::Nv12),
      "yuyv" | "yuy2" => Ok(PixelFormat::Yuyv),
      other => Err(format!("不支持的像素格式: {}", other)),
    }
  }
}

/// 帧源借出的一帧原始数据
///
/// 帧内存属于帧源的缓冲池，`slot` 标记它来自哪个池位，归还时按池位放回。
#[derive(Debug)]
pub struct Frame {
  data: Box<[u8]>,
  resolution: Resolution,
  format: PixelFormat,
  sequence: u64,
  timestamp_ms: u64,
  slot: usize,
}

impl Frame {
  pub(crate) fn new(
    data: Box<[u8]>,
    resolution: Resolution,
    format: PixelFormat,
    sequence: u64,
    timestamp_ms: u64,
    slot: usize,
  ) -> Self {
    Self {
      data,
      resolution,
      format,
      sequence,
      timestamp_ms,
      slot,
    }
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub(crate) fn data_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }

  pub fn resolution(&self) -> Resolution {
    self.resolution
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn timestamp_ms(&self) -> u64 {
    self.timestamp_ms
  }

  pub fn slot(&self) -> usize {
    self.slot
  }

  pub(crate) fn set_meta(&mut self, sequence: u64, timestamp_ms: u64) {
    self.sequence = sequence;
    self.timestamp_ms = timestamp_ms;
  }

  pub(crate) fn into_data(self) -> Box<[u8]> {
    self.data
  }
}

/// 从相机支持的分辨率中选出面积最小、且宽高都不小于请求值的一个
pub fn choose_stream_resolution(
  supported: &[Resolution],
  requested: Resolution,
) -> Option<Resolution> {
  supported
    .iter()
    .copied()
    .filter(|r| r.covers(requested))
    .min_by_key(|r| r.area())
}

/// 流画面中与目标宽高比一致的最大居中矩形
///
/// 先以整幅宽度为准，高度放不下时改以整幅高度为准。
pub fn centered_aspect_crop(stream: Resolution, target: Resolution) -> CropRect {
  let ratio = target.width as f32 / target.height as f32;
  let mut width = stream.width as f32;
  let mut height = width / ratio;
  if height > stream.height as f32 {
    height = stream.height as f32;
    width = height * ratio;
  }

  let width = (width as u32).min(stream.width);
  let height = (height as u32).min(stream.height);
  CropRect {
    x: (stream.width - width) / 2,
    y: (stream.height - height) / 2,
    width,
    height,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn picks_smallest_covering_resolution() {
    let supported = [
      Resolution::new(1920, 1080),
      Resolution::new(640, 480),
      Resolution::new(320, 240),
      Resolution::new(480, 360),
    ];
    assert_eq!(
      choose_stream_resolution(&supported, Resolution::new(300, 300)),
      Some(Resolution::new(480, 360))
    );
    assert_eq!(
      choose_stream_resolution(&supported, Resolution::new(640, 480)),
      Some(Resolution::new(640, 480))
    );
    assert_eq!(
      choose_stream_resolution(&supported, Resolution::new(4000, 3000)),
      None
    );
  }

  #[test]
  fn square_crop_of_wide_stream_is_centered() {
    let crop = centered_aspect_crop(Resolution::new(480, 360), Resolution::new(300, 300));
    assert_eq!(
      crop,
      CropRect {
        x: 60,
        y: 0,
        width: 360,
        height: 360,
      }
    );
  }

  #[test]
  fn wide_target_on_square_stream_fills_width() {
    let crop = centered_aspect_crop(Resolution::new(400, 400), Resolution::new(200, 100));
    assert_eq!(crop.width, 400);
    assert_eq!(crop.height, 200);
    assert_eq!(crop.y, 100);
  }

  #[test]
  fn frame_sizes() {
    let res = Resolution::new(4, 2);
    assert_eq!(PixelFormat::Nv12.frame_size(res), 12);
    assert_eq!(PixelFormat::Yuyv.frame_size(res), 16);
    assert_eq!(res.rgb_size(), 24);
    assert_eq!("NV12".parse::<PixelFormat>(), Ok(PixelFormat::Nv12));
    assert!("mjpg".parse::<PixelFormat>().is_err());
  }

  #[test]
  fn odd_sizes_round_chroma_up() {
    let res = Resolution::new(3, 3);
    // 9 字节亮度 + 2 行 x 2 组 UV
    assert_eq!(PixelFormat::Nv12.frame_size(res), 9 + 8);
    assert_eq!(PixelFormat::Yuyv.frame_size(res), 3 * 8);

    for format in [PixelFormat::Nv12, PixelFormat::Yuyv] {
      for res in [Resolution::new(3, 2), Resolution::new(63, 64), Resolution::new(5, 7)] {
        let size = format.frame_size(res);
        let mut seen = vec![false; size];
        for y in 0..res.height as usize {
          for x in 0..res.width as usize {
            let offsets = format.yuv_offsets(res, x, y);
            assert!(offsets.iter().all(|&o| o < size), "{} {} ({}, {})", format, res, x, y);
            seen[offsets[0]] = true;
          }
        }
        // 每个亮度字节只属于一个像素
        let luma = seen.iter().filter(|s| **s).count();
        assert_eq!(luma, res.width as usize * res.height as usize);
      }
    }
  }

  #[test]
  fn planes_tile_the_frame() {
    for format in [PixelFormat::Nv12, PixelFormat::Yuyv] {
      let res = Resolution::new(5, 3);
      let planes = format.planes(res);
      let last = planes[planes.len() - 1];
      assert_eq!(last.offset + last.row_bytes * last.rows, format.frame_size(res));
    }
  }

  #[test]
  fn padded_rows_are_dropped_when_copying() {
    let res = Resolution::new(3, 2);
    let planes = PixelFormat::Nv12.planes(res);
    let mut frame = vec![0u8; PixelFormat::Nv12.frame_size(res)];

    // 亮度每行 3 字节，源按 8 字节对齐
    let luma = [1, 2, 3, 0, 0, 0, 0, 0, 4, 5, 6];
    let chroma = [7, 8, 9, 10, 0, 0, 0, 0];
    assert!(planes[0].copy_rows(&mut frame, &luma, 8));
    assert!(planes[1].copy_rows(&mut frame, &chroma, 8));
    assert_eq!(frame, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

    // 行距小于行宽或数据不足时拒绝
    assert!(!planes[0].copy_rows(&mut frame, &luma, 2));
    assert!(!planes[0].copy_rows(&mut frame, &luma[..10], 8));
  }

  #[test]
  fn even_layout_matches_packed_planes() {
    let res = Resolution::new(4, 2);
    assert_eq!(PixelFormat::Nv12.yuv_offsets(res, 3, 1), [7, 10, 11]);
    assert_eq!(PixelFormat::Yuyv.yuv_offsets(res, 3, 1), [14, 13, 15]);
  }
}
