// 该文件是 Xunshan （巡山） 项目的一部分。
// src/input/read_image_file.rs - 以静态图片模拟相机
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

use image::imageops::FilterType;
use image::{ImageReader, RgbImage};
use tracing::{debug, error, info};
use url::Url;

use super::{FramePool, FrameProvider, StreamConfig, StreamError};
use crate::frame::{Frame, PixelFormat, Resolution};
use crate::{FromUrl, FromUrlWithScheme};

const READ_IMAGE_FILE_SCHEME: &str = "image";

pub struct ImageFileProviderBuilder {
  path: PathBuf,
}

impl FromUrl for ImageFileProviderBuilder {
  type Error = StreamError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != READ_IMAGE_FILE_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        READ_IMAGE_FILE_SCHEME,
        url.scheme()
      );
      return Err(StreamError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(Self {
      path: PathBuf::from(url.path()),
    })
  }
}

impl FromUrlWithScheme for ImageFileProviderBuilder {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl ImageFileProviderBuilder {
  pub fn build(self, config: StreamConfig) -> Result<ImageFileProvider, StreamError> {
    let name = self.path.display().to_string();
    let open_err = |message: String| StreamError::Open {
      source_name: name.clone(),
      message,
    };
    let image = ImageReader::open(&self.path)
      .map_err(|e| open_err(e.to_string()))?
      .decode()
      .map_err(|e| open_err(e.to_string()))?;
    info!(
      "读取图片 {} ({}x{})",
      name,
      image.width(),
      image.height()
    );
    ImageFileProvider::from_image(&name, image.into(), config)
  }
}

/// 每次取帧都返回同一张图片的帧源
///
/// 图片在打开时缩放到流分辨率并编码为流的像素格式，之后每帧只做一次拷贝。
pub struct ImageFileProvider {
  name: String,
  encoded: Box<[u8]>,
  pool: FramePool,
  resolution: Resolution,
  format: PixelFormat,
  running: bool,
}

impl ImageFileProvider {
  pub fn from_image(
    name: &str,
    image: RgbImage,
    config: StreamConfig,
  ) -> Result<Self, StreamError> {
    let resolution = config.resolution;
    if resolution.is_zero() {
      return Err(StreamError::UnsupportedResolution {
        source_name: name.to_string(),
        requested: resolution,
      });
    }
    let image = if image.dimensions() == (resolution.width, resolution.height) {
      image
    } else {
      debug!(
        "{}: 缩放 {}x{} -> {}",
        name,
        image.width(),
        image.height(),
        resolution
      );
      image::imageops::resize(
        &image,
        resolution.width,
        resolution.height,
        FilterType::Triangle,
      )
    };

    let encoded = encode_yuv(&image, config.format);
    Ok(Self {
      name: name.to_string(),
      encoded,
      pool: FramePool::new(name, resolution, config.format, config.buffer_count),
      resolution,
      format: config.format,
      running: false,
    })
  }
}

impl FrameProvider for ImageFileProvider {
  fn name(&self) -> &str {
    &self.name
  }

  fn start(&mut self) -> Result<(), StreamError> {
    self.running = true;
    Ok(())
  }

  fn latest_frame(&mut self) -> Result<Frame, StreamError> {
    if !self.running {
      return Err(StreamError::NotStarted(self.name.clone()));
    }
    let mut frame = self.pool.acquire()?;
    frame.data_mut().copy_from_slice(&self.encoded);
    Ok(frame)
  }

  fn release(&mut self, frame: Frame) -> Result<(), StreamError> {
    self.pool.release(frame)
  }

  fn stop(&mut self) -> Result<(), StreamError> {
    self.running = false;
    Ok(())
  }

  fn resolution(&self) -> Resolution {
    self.resolution
  }

  fn pixel_format(&self) -> PixelFormat {
    self.format
  }
}

/// BT.601 全范围 RGB 转 YUV
fn rgb_to_yuv(pixel: &[u8]) -> (f32, f32, f32) {
  let (r, g, b) = (pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
  let y = 0.299 * r + 0.587 * g + 0.114 * b;
  let u = -0.169 * r - 0.331 * g + 0.5 * b + 128.0;
  let v = 0.5 * r - 0.419 * g - 0.081 * b + 128.0;
  (y, u, v)
}

fn to_byte(value: f32) -> u8 {
  value.round().clamp(0.0, 255.0) as u8
}

fn encode_yuv(image: &RgbImage, format: PixelFormat) -> Box<[u8]> {
  let (width, height) = (image.width() as usize, image.height() as usize);
  let resolution = Resolution::new(image.width(), image.height());
  let mut data = vec![0u8; format.frame_size(resolution)];
  let rgb = image.as_raw();
  let at = |x: usize, y: usize| rgb_to_yuv(&rgb[(y * width + x) * 3..(y * width + x) * 3 + 3]);

  for y in 0..height {
    for x in 0..width {
      let [luma, _, _] = format.yuv_offsets(resolution, x, y);
      data[luma] = to_byte(at(x, y).0);
    }
  }

  // 共用一组 UV 的像素块取平均：NV12 为 2x2，YUYV 为 2x1
  let rows = match format {
    PixelFormat::Nv12 => 2,
    PixelFormat::Yuyv => 1,
  };
  for by in (0..height).step_by(rows) {
    for bx in (0..width).step_by(2) {
      let (mut u, mut v, mut n) = (0.0, 0.0, 0.0);
      for y in by..(by + rows).min(height) {
        for x in bx..(bx + 2).min(width) {
          let (_, pu, pv) = at(x, y);
          u += pu;
          v += pv;
          n += 1.0;
        }
      }
      let [_, ui, vi] = format.yuv_offsets(resolution, bx, by);
      data[ui] = to_byte(u / n);
      data[vi] = to_byte(v / n);
    }
  }

  // YUYV 奇数宽度的最后一组只有一个像素，补齐的 Y1 沿用 Y0
  if format == PixelFormat::Yuyv && width % 2 == 1 {
    for y in 0..height {
      let [luma, _, _] = format.yuv_offsets(resolution, width - 1, y);
      data[luma + 2] = data[luma];
    }
  }
  data.into_boxed_slice()
}
