// 该文件是 Xunshan （巡山） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 帧源
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

//! # GStreamer 帧源
//!
//! 以 appsink 结尾的 GStreamer 管道作为帧源，输出 NV12 或 YUY2 原始帧。
//!
//! - `gst://camera/dev/video0?fps=15&io-mode=2`：V4L2 摄像头
//! - `gst://test?pattern=ball`：videotestsrc 测试图案
//!
//! 使用前需要安装 GStreamer 开发库（libgstreamer1.0-dev、
//! libgstreamer-plugins-base1.0-dev）。

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{info, warn};
use url::Url;

use super::{FramePool, FrameProvider, StreamConfig, StreamError};
use crate::frame::{Frame, PixelFormat, Resolution};
use crate::{FromUrl, FromUrlWithScheme};

const GSTREAMER_INPUT_SCHEME: &str = "gst";

fn caps_format(format: PixelFormat) -> &'static str {
  match format {
    PixelFormat::Nv12 => "NV12",
    PixelFormat::Yuyv => "YUY2",
  }
}

enum SourceItem {
  Camera {
    device: String,
    io_mode: Option<u32>,
    fps: u32,
  },
  Test {
    pattern: String,
  },
}

impl SourceItem {
  fn to_pipeline(&self, config: &StreamConfig) -> String {
    let caps = format!(
      "video/x-raw,format={},width={},height={}",
      caps_format(config.format),
      config.resolution.width,
      config.resolution.height
    );
    match self {
      SourceItem::Camera {
        device,
        io_mode,
        fps,
      } => {
        let io_mode = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! videoscale ! videoconvert ! {},framerate={}/1",
          device, io_mode, caps, fps
        )
      }
      SourceItem::Test { pattern } => {
        format!("videotestsrc is-live=true pattern={} ! videoconvert ! {}", pattern, caps)
      }
    }
  }
}

pub struct GStreamerSourceBuilder {
  item: SourceItem,
}

impl FromUrl for GStreamerSourceBuilder {
  type Error = StreamError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != GSTREAMER_INPUT_SCHEME {
      return Err(StreamError::SchemeMismatch(url.scheme().to_string()));
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let item = match url.host_str() {
      Some("camera") => SourceItem::Camera {
        device: url.path().to_string(),
        io_mode: query.get("io-mode").and_then(|v| v.parse::<u32>().ok()),
        fps: query
          .get("fps")
          .and_then(|v| v.parse::<u32>().ok())
          .unwrap_or(15),
      },
      Some("test") => SourceItem::Test {
        pattern: query
          .get("pattern")
          .cloned()
          .unwrap_or_else(|| "smpte".to_string()),
      },
      other => {
        return Err(StreamError::SchemeMismatch(format!(
          "gst://{}",
          other.unwrap_or_default()
        )));
      }
    };
    Ok(Self { item })
  }
}

impl FromUrlWithScheme for GStreamerSourceBuilder {
  const SCHEME: &'static str = GSTREAMER_INPUT_SCHEME;
}

impl GStreamerSourceBuilder {
  pub fn pipeline_description(&self, config: &StreamConfig) -> String {
    format!(
      "{} ! appsink max-buffers={} drop=true name=sink",
      self.item.to_pipeline(config),
      config.buffer_count.max(1)
    )
  }

  pub fn build(self, config: StreamConfig) -> Result<GStreamerSource, StreamError> {
    let description = self.pipeline_description(&config);
    let name = match &self.item {
      SourceItem::Camera { device, .. } => device.clone(),
      SourceItem::Test { pattern } => format!("videotestsrc:{}", pattern),
    };
    let open_err = |message: String| StreamError::Open {
      source_name: name.clone(),
      message,
    };

    gst::init().map_err(|e| open_err(e.to_string()))?;
    info!("GStreamer 管道: {}", description);

    let pipeline = gst::parse::launch(&description)
      .map_err(|e| open_err(e.to_string()))?
      .downcast::<gst::Pipeline>()
      .map_err(|_| open_err("无法创建管道".to_string()))?;
    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| open_err("找不到 appsink".to_string()))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| open_err("sink 不是 appsink".to_string()))?;

    Ok(GStreamerSource {
      pool: FramePool::new(&name, config.resolution, config.format, config.buffer_count),
      name,
      pipeline,
      appsink,
      resolution: config.resolution,
      format: config.format,
      running: false,
    })
  }
}

/// GStreamer 管道帧源
pub struct GStreamerSource {
  name: String,
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  pool: FramePool,
  resolution: Resolution,
  format: PixelFormat,
  running: bool,
}

impl Drop for GStreamerSource {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

impl GStreamerSource {
  fn capture_err(&self, message: String) -> StreamError {
    StreamError::Capture {
      source_name: self.name.clone(),
      message,
    }
  }
}

impl FrameProvider for GStreamerSource {
  fn name(&self) -> &str {
    &self.name
  }

  fn start(&mut self) -> Result<(), StreamError> {
    self
      .pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| StreamError::Open {
        source_name: self.name.clone(),
        message: e.to_string(),
      })?;
    self.running = true;
    Ok(())
  }

  fn latest_frame(&mut self) -> Result<Frame, StreamError> {
    if !self.running {
      return Err(StreamError::NotStarted(self.name.clone()));
    }
    let sample = self
      .appsink
      .pull_sample()
      .map_err(|e| self.capture_err(format!("无法拉取样本: {}", e)))?;
    let buffer = sample
      .buffer()
      .ok_or_else(|| self.capture_err("样本中没有缓冲".to_string()))?;
    let caps = sample
      .caps()
      .ok_or_else(|| self.capture_err("样本中没有 caps".to_string()))?;
    let info = gst_video::VideoInfo::from_caps(caps)
      .map_err(|e| self.capture_err(format!("无法解析 caps: {}", e)))?;
    if info.width() != self.resolution.width || info.height() != self.resolution.height {
      return Err(self.capture_err(format!(
        "样本尺寸 {}x{} 与 {} 不符",
        info.width(),
        info.height(),
        self.resolution
      )));
    }
    let video = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
      .map_err(|e| self.capture_err(format!("无法映射视频帧: {}", e)))?;
    let planes = self.format.planes(self.resolution);
    if video.n_planes() as usize != planes.len() {
      return Err(self.capture_err(format!(
        "样本有 {} 个平面, 需要 {} 个",
        video.n_planes(),
        planes.len()
      )));
    }

    // 源平面可能带行填充，按 stride 逐行复制
    let mut sources = Vec::with_capacity(planes.len());
    for index in 0..planes.len() {
      let data = video
        .plane_data(index as u32)
        .map_err(|e| self.capture_err(format!("无法读取第 {} 个平面: {}", index, e)))?;
      let stride = usize::try_from(video.plane_stride()[index])
        .map_err(|_| self.capture_err(format!("第 {} 个平面的行距为负", index)))?;
      sources.push((data, stride));
    }

    let mut frame = self.pool.acquire()?;
    let copied = planes
      .iter()
      .zip(&sources)
      .all(|(plane, (data, stride))| plane.copy_rows(frame.data_mut(), data, *stride));
    if !copied {
      self.pool.release(frame)?;
      return Err(self.capture_err(format!(
        "样本平面与 {} {} 的布局不符",
        self.format, self.resolution
      )));
    }
    Ok(frame)
  }

  fn release(&mut self, frame: Frame) -> Result<(), StreamError> {
    self.pool.release(frame)
  }

  fn stop(&mut self) -> Result<(), StreamError> {
    if !self.running {
      return Ok(());
    }
    self.running = false;
    self
      .pipeline
      .set_state(gst::State::Null)
      .map_err(|e| self.capture_err(e.to_string()))?;
    Ok(())
  }

  fn resolution(&self) -> Resolution {
    self.resolution
  }

  fn pixel_format(&self) -> PixelFormat {
    self.format
  }
}
