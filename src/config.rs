// 该文件是 Xunshan （巡山） 项目的一部分。
// src/config.rs - 流水线配置
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
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;
use url::Url;

use crate::frame::{PixelFormat, Resolution};

/// 高清流的默认请求尺寸，命令行给出的原始尺寸只在 `--use-raw-resolution` 时生效
pub const DEFAULT_HD_RESOLUTION: Resolution = Resolution::new(1280, 720);
/// 每路相机流的帧缓冲数
pub const DEFAULT_BUFFER_COUNT: usize = 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
  #[error("{name} 应在 0..=100 之间, 实际为 {value}")]
  Percent { name: &'static str, value: u32 },
  #[error("{0} 的宽高不能为 0")]
  ZeroSize(&'static str),
  #[error("{0} 不能为 0")]
  Zero(&'static str),
  #[error("两路流不能共用同一个 V4L2 设备 {0}，请用 --hd-source 指定高清流")]
  SharedDevice(String),
}

/// 同一个设备节点只能被打开一次
const EXCLUSIVE_SCHEMES: &[&str] = &["v4l2"];

/// 把命令行中的百分比校验为 0..=100
pub fn percent(name: &'static str, value: u32) -> Result<u8, ConfigError> {
  match u8::try_from(value) {
    Ok(v) if v <= 100 => Ok(v),
    _ => Err(ConfigError::Percent { name, value }),
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OverlayKind {
  None,
  /// 透明画布 PNG
  Canvas,
  /// 归一化边框 JSON
  Boxes,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub model: PathBuf,
  pub labels: PathBuf,
  /// 检测器输入尺寸
  pub detector_input: Resolution,
  pub quality: u8,
  pub threshold: u8,
  /// 高清流请求尺寸
  pub hd_resolution: Resolution,
  /// 检测模型所在的计算设备
  pub chip: String,
  pub source: Url,
  pub hd_source: Url,
  pub pixel_format: PixelFormat,
  pub buffer_count: usize,
  pub overlay: OverlayKind,
  pub overlay_output: PathBuf,
  pub overlay_font: Option<PathBuf>,
  pub output_dir: PathBuf,
  pub period: Duration,
  pub overlay_period: Duration,
  pub max_cycles: Option<u64>,
  /// 任务软超时，`None` 表示不检查
  pub job_deadline: Option<Duration>,
}

impl PipelineConfig {
  /// 在申请任何资源之前检查配置
  pub fn validate(&self) -> Result<(), ConfigError> {
    percent("quality", self.quality as u32)?;
    percent("threshold", self.threshold as u32)?;
    if self.detector_input.is_zero() {
      return Err(ConfigError::ZeroSize("detector input"));
    }
    if self.hd_resolution.is_zero() {
      return Err(ConfigError::ZeroSize("hd resolution"));
    }
    if self.buffer_count == 0 {
      return Err(ConfigError::Zero("buffer count"));
    }
    if self.period.is_zero() {
      return Err(ConfigError::Zero("period"));
    }
    if self.overlay != OverlayKind::None && self.overlay_period.is_zero() {
      return Err(ConfigError::Zero("overlay period"));
    }
    if self.max_cycles == Some(0) {
      return Err(ConfigError::Zero("max cycles"));
    }
    if EXCLUSIVE_SCHEMES.contains(&self.source.scheme()) && self.source == self.hd_source {
      return Err(ConfigError::SharedDevice(self.source.path().to_string()));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> PipelineConfig {
    PipelineConfig {
      model: PathBuf::from("/models/ssd.tflite"),
      labels: PathBuf::from("/models/labels.txt"),
      detector_input: Resolution::new(300, 300),
      quality: 80,
      threshold: 50,
      hd_resolution: DEFAULT_HD_RESOLUTION,
      chip: "rknpu".to_string(),
      source: Url::parse("v4l2:///dev/video0").unwrap(),
      hd_source: Url::parse("v4l2:///dev/video1").unwrap(),
      pixel_format: PixelFormat::Nv12,
      buffer_count: DEFAULT_BUFFER_COUNT,
      overlay: OverlayKind::None,
      overlay_output: PathBuf::from("/tmp/overlay.png"),
      overlay_font: None,
      output_dir: PathBuf::from("/tmp"),
      period: Duration::from_millis(2000),
      overlay_period: Duration::from_millis(2000),
      max_cycles: None,
      job_deadline: Some(Duration::from_millis(1000)),
    }
  }

  #[test]
  fn percent_bounds() {
    assert_eq!(percent("threshold", 0), Ok(0));
    assert_eq!(percent("threshold", 100), Ok(100));
    assert!(percent("threshold", 101).is_err());
    assert!(percent("quality", 300).is_err());
  }

  #[test]
  fn validate_rejects_bad_values() {
    assert!(sample().validate().is_ok());

    let mut config = sample();
    config.threshold = 120;
    assert!(matches!(
      config.validate(),
      Err(ConfigError::Percent { name: "threshold", .. })
    ));

    let mut config = sample();
    config.detector_input = Resolution::new(0, 300);
    assert_eq!(
      config.validate(),
      Err(ConfigError::ZeroSize("detector input"))
    );

    let mut config = sample();
    config.period = Duration::ZERO;
    assert_eq!(config.validate(), Err(ConfigError::Zero("period")));
  }

  #[test]
  fn one_v4l2_device_cannot_feed_both_streams() {
    let mut config = sample();
    config.hd_source = config.source.clone();
    assert_eq!(
      config.validate(),
      Err(ConfigError::SharedDevice("/dev/video0".to_string()))
    );

    // 图片和 GStreamer 测试源可以同时服务两路
    for url in ["image:///tmp/scene.png", "gst://test"] {
      let mut config = sample();
      config.source = Url::parse(url).unwrap();
      config.hd_source = config.source.clone();
      assert!(config.validate().is_ok(), "{}", url);
    }
  }
}
