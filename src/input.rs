// 该文件是 Xunshan （巡山） 项目的一部分。
// src/input.rs - 相机帧输入
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
use url::Url;

mod dual;
#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
mod provider;
mod read_image_file;
#[cfg(feature = "v4l2_input")]
mod v4l2_source;

pub use self::dual::{DualStreamSource, FrameLease, StreamKind};
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerSource, GStreamerSourceBuilder};
pub use self::provider::{FramePool, FrameProvider, StreamConfig};
pub use self::read_image_file::{ImageFileProvider, ImageFileProviderBuilder};
#[cfg(feature = "v4l2_input")]
pub use self::v4l2_source::{V4l2Source, V4l2SourceBuilder};

use crate::FromUrl;
use crate::frame::{Frame, PixelFormat, Resolution};

#[derive(Error, Debug)]
pub enum StreamError {
  #[error("URI scheme 不匹配: {0}")]
  SchemeMismatch(String),
  #[error("无法打开视频源 {source_name}: {message}")]
  Open {
    source_name: String,
    message: String,
  },
  #[error("视频源 {source_name} 不支持 {requested} 及以上的分辨率")]
  UnsupportedResolution {
    source_name: String,
    requested: Resolution,
  },
  #[error("视频源 {0} 尚未启动")]
  NotStarted(String),
  #[error("视频源 {source_name} 的 {count} 个帧缓冲全部被占用")]
  PoolExhausted { source_name: String, count: usize },
  #[error("帧缓冲 {slot} 不属于视频源 {source_name} 或已归还")]
  UnknownSlot { source_name: String, slot: usize },
  #[error("视频源 {source_name} 采集失败: {message}")]
  Capture {
    source_name: String,
    message: String,
  },
}

/// 按 URL scheme 选择的帧源
pub enum InputWrapper {
  ImageFile(ImageFileProvider),
  #[cfg(feature = "v4l2_input")]
  V4l2(V4l2Source),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerSource),
}

impl InputWrapper {
  pub fn open(url: &Url, config: StreamConfig) -> Result<Self, StreamError> {
    #[cfg(feature = "v4l2_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4l2SourceBuilder::SCHEME {
        let source = V4l2SourceBuilder::from_url(url)?.build(config)?;
        return Ok(InputWrapper::V4l2(source));
      }
    }
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerSourceBuilder::SCHEME {
        let source = GStreamerSourceBuilder::from_url(url)?.build(config)?;
        return Ok(InputWrapper::GStreamer(source));
      }
    }
    if url.scheme() == <ImageFileProviderBuilder as crate::FromUrlWithScheme>::SCHEME {
      let source = ImageFileProviderBuilder::from_url(url)?.build(config)?;
      return Ok(InputWrapper::ImageFile(source));
    }
    Err(StreamError::SchemeMismatch(url.scheme().to_string()))
  }

  fn inner(&self) -> &dyn FrameProvider {
    match self {
      InputWrapper::ImageFile(source) => source,
      #[cfg(feature = "v4l2_input")]
      InputWrapper::V4l2(source) => source,
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(source) => source,
    }
  }

  fn inner_mut(&mut self) -> &mut dyn FrameProvider {
    match self {
      InputWrapper::ImageFile(source) => source,
      #[cfg(feature = "v4l2_input")]
      InputWrapper::V4l2(source) => source,
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(source) => source,
    }
  }
}

impl FrameProvider for InputWrapper {
  fn name(&self) -> &str {
    self.inner().name()
  }

  fn start(&mut self) -> Result<(), StreamError> {
    self.inner_mut().start()
  }

  fn latest_frame(&mut self) -> Result<Frame, StreamError> {
    self.inner_mut().latest_frame()
  }

  fn release(&mut self, frame: Frame) -> Result<(), StreamError> {
    self.inner_mut().release(frame)
  }

  fn stop(&mut self) -> Result<(), StreamError> {
    self.inner_mut().stop()
  }

  fn resolution(&self) -> Resolution {
    self.inner().resolution()
  }

  fn pixel_format(&self) -> PixelFormat {
    self.inner().pixel_format()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://camera.local/stream").unwrap();
    let config = StreamConfig::new(Resolution::new(640, 480), PixelFormat::Nv12, 2);
    assert!(matches!(
      InputWrapper::open(&url, config),
      Err(StreamError::SchemeMismatch(_))
    ));
  }
}
