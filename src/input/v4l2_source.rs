// 该文件是 Xunshan （巡山） 项目的一部分。
// src/input/v4l2_source.rs - V4L2 摄像头帧源
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
use std::pin::Pin;

use tracing::{debug, info, warn};
use url::Url;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use super::{FramePool, FrameProvider, StreamConfig, StreamError};
use crate::frame::{Frame, PixelFormat, Resolution, choose_stream_resolution};
use crate::{FromUrl, FromUrlWithScheme};

const V4L2_SCHEME: &str = "v4l2";

fn fourcc(format: PixelFormat) -> FourCC {
  match format {
    PixelFormat::Nv12 => FourCC::new(b"NV12"),
    PixelFormat::Yuyv => FourCC::new(b"YUYV"),
  }
}

/// `v4l2:///dev/video0`
pub struct V4l2SourceBuilder {
  device_path: PathBuf,
}

impl FromUrl for V4l2SourceBuilder {
  type Error = StreamError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != V4L2_SCHEME {
      return Err(StreamError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(Self {
      device_path: PathBuf::from(url.path()),
    })
  }
}

impl FromUrlWithScheme for V4l2SourceBuilder {
  const SCHEME: &'static str = V4L2_SCHEME;
}

impl V4l2SourceBuilder {
  /// 打开设备，按分辨率策略选择流尺寸并设置像素格式
  pub fn build(self, config: StreamConfig) -> Result<V4l2Source, StreamError> {
    let name = self.device_path.display().to_string();
    let open_err = |message: String| StreamError::Open {
      source_name: name.clone(),
      message,
    };

    let device =
      Box::pin(Device::with_path(&self.device_path).map_err(|e| open_err(e.to_string()))?);
    let code = fourcc(config.format);

    let mut supported = Vec::new();
    for size in device
      .enum_framesizes(code)
      .map_err(|e| open_err(e.to_string()))?
    {
      match size.size {
        FrameSizeEnum::Discrete(d) => supported.push(Resolution::new(d.width, d.height)),
        FrameSizeEnum::Stepwise(s) => {
          // 连续尺寸的设备直接按请求值向上对齐到步长
          let align = |value: u32, min: u32, step: u32| {
            let step = step.max(1);
            min + (value.saturating_sub(min)).div_ceil(step) * step
          };
          let width = align(config.resolution.width, s.min_width, s.step_width);
          let height = align(config.resolution.height, s.min_height, s.step_height);
          if width <= s.max_width && height <= s.max_height {
            supported.push(Resolution::new(width, height));
          }
        }
      }
    }
    debug!("{} 支持的分辨率: {:?}", name, supported);

    let resolution =
      choose_stream_resolution(&supported, config.resolution).ok_or_else(|| {
        StreamError::UnsupportedResolution {
          source_name: name.clone(),
          requested: config.resolution,
        }
      })?;

    let mut format = device.format().map_err(|e| open_err(e.to_string()))?;
    format.width = resolution.width;
    format.height = resolution.height;
    format.fourcc = code;
    let format = device
      .set_format(&format)
      .map_err(|e| open_err(e.to_string()))?;
    if format.fourcc != code || format.width != resolution.width || format.height != resolution.height
    {
      return Err(open_err(format!(
        "设备接受的格式为 {} {}x{}",
        format.fourcc, format.width, format.height
      )));
    }
    info!(
      "{}: 请求 {}，选用 {} {}",
      name, config.resolution, resolution, config.format
    );

    Ok(V4l2Source {
      pool: FramePool::new(&name, resolution, config.format, config.buffer_count),
      name,
      device,
      stream: None,
      buffer_count: config.buffer_count.max(1) as u32,
      resolution,
      format: config.format,
    })
  }
}

/// V4L2 摄像头帧源
///
/// v4l 的 Stream 需要引用 Device，这里用 Pin<Box<Device>> 固定设备地址，
/// 使同一结构体中的 Stream 可以安全地引用它。
pub struct V4l2Source {
  name: String,
  /// 捕获流（生命周期与 device 关联），必须先于 device 销毁
  stream: Option<Stream<'static>>,
  device: Pin<Box<Device>>,
  pool: FramePool,
  buffer_count: u32,
  resolution: Resolution,
  format: PixelFormat,
}

impl Drop for V4l2Source {
  fn drop(&mut self) {
    // 确保 stream 在 device 之前被 drop
    self.stream.take();
  }
}

impl FrameProvider for V4l2Source {
  fn name(&self) -> &str {
    &self.name
  }

  fn start(&mut self) -> Result<(), StreamError> {
    if self.stream.is_some() {
      return Ok(());
    }
    let device_ref: &Device = &self.device;
    // SAFETY: device 被 Pin<Box> 固定在堆上不会移动；stream 存在同一结构体中，
    // stop 和 Drop 都会先于 device 释放它
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, self.buffer_count)
    }
    .map_err(|e| StreamError::Open {
      source_name: self.name.clone(),
      message: format!("无法创建捕获流: {}", e),
    })?;
    self.stream = Some(stream);
    info!("{} 开始采集", self.name);
    Ok(())
  }

  /// 取出驱动队列中的下一帧，拷贝到帧缓冲池
  fn latest_frame(&mut self) -> Result<Frame, StreamError> {
    let stream = self
      .stream
      .as_mut()
      .ok_or_else(|| StreamError::NotStarted(self.name.clone()))?;
    let (buffer, meta) = stream.next().map_err(|e| StreamError::Capture {
      source_name: self.name.clone(),
      message: format!("无法捕获帧: {}", e),
    })?;

    let mut frame = self.pool.acquire()?;
    let data = frame.data_mut();
    let used = (meta.bytesused as usize).min(buffer.len());
    if used < data.len() {
      warn!(
        "{}: 第 {} 帧只有 {} 字节, 需要 {} 字节",
        self.name,
        meta.sequence,
        used,
        data.len()
      );
    }
    let n = used.min(data.len());
    data[..n].copy_from_slice(&buffer[..n]);
    let timestamp_ms = meta.timestamp.sec as u64 * 1000 + meta.timestamp.usec as u64 / 1000;
    frame.set_meta(meta.sequence as u64, timestamp_ms);
    Ok(frame)
  }

  fn release(&mut self, frame: Frame) -> Result<(), StreamError> {
    self.pool.release(frame)
  }

  fn stop(&mut self) -> Result<(), StreamError> {
    if self.stream.take().is_some() {
      info!("{} 停止采集", self.name);
    }
    Ok(())
  }

  fn resolution(&self) -> Resolution {
    self.resolution
  }

  fn pixel_format(&self) -> PixelFormat {
    self.format
  }
}
