// 该文件是 Xunshan （巡山） 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use xunshan::config::{
  ConfigError, DEFAULT_BUFFER_COUNT, DEFAULT_HD_RESOLUTION, OverlayKind, PipelineConfig, percent,
};
use xunshan::frame::{PixelFormat, Resolution};

/// Xunshan 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型文件路径
  #[arg(value_name = "MODEL")]
  pub model: PathBuf,

  /// 检测器输入宽度
  #[arg(value_name = "WIDTH")]
  pub width: u32,

  /// 检测器输入高度
  #[arg(value_name = "HEIGHT")]
  pub height: u32,

  /// 裁剪图 JPEG 质量 (0 - 100)
  #[arg(value_name = "QUALITY")]
  pub quality: u32,

  /// 高清流宽度，仅在 --use-raw-resolution 时生效
  #[arg(value_name = "RAW_WIDTH")]
  pub raw_width: u32,

  /// 高清流高度，仅在 --use-raw-resolution 时生效
  #[arg(value_name = "RAW_HEIGHT")]
  pub raw_height: u32,

  /// 检测分数阈值，百分比 (0 - 100)
  #[arg(value_name = "THRESHOLD")]
  pub threshold: u32,

  /// 标签文件路径，每行一个类别名
  #[arg(value_name = "LABELSFILE")]
  pub labels: PathBuf,

  /// 检测模型所在的计算设备
  #[arg(long, default_value = "rknpu", value_name = "DEVICE")]
  pub chip: String,

  /// 低分辨率视频源
  /// 支持格式:
  /// - V4L2: v4l2:///dev/video0
  /// - GStreamer: gst://camera/dev/video0, gst://test
  /// - 图片: image:///path/to/picture.jpg
  #[arg(long, default_value = "v4l2:///dev/video0", value_name = "URL")]
  pub source: Url,

  /// 高清视频源，默认与 --source 相同；V4L2 设备不能被两路流共用，须另行指定
  #[arg(long, value_name = "URL")]
  pub hd_source: Option<Url>,

  /// 相机像素格式 (nv12, yuyv)
  #[arg(long, default_value = "nv12", value_name = "FORMAT")]
  pub format: PixelFormat,

  /// 叠加层后端
  #[arg(long, value_enum, default_value_t = OverlayKind::None)]
  pub overlay: OverlayKind,

  /// 叠加层输出文件
  #[arg(long, default_value = "/tmp/overlay.png", value_name = "PATH")]
  pub overlay_output: PathBuf,

  /// 叠加层文字使用的字体文件，不给出时只画边框
  #[arg(long, value_name = "PATH")]
  pub overlay_font: Option<PathBuf>,

  /// 裁剪图输出目录
  #[arg(long, default_value = "/tmp", value_name = "DIR")]
  pub output_dir: PathBuf,

  /// 检测周期（毫秒）
  #[arg(long, default_value_t = 2000, value_name = "MS")]
  pub period_ms: u64,

  /// 叠加层刷新周期（毫秒）
  #[arg(long, default_value_t = 2000, value_name = "MS")]
  pub overlay_period_ms: u64,

  /// 运行指定数量的检测周期后退出
  #[arg(long, value_name = "COUNT")]
  pub max_cycles: Option<u64>,

  /// 单个任务的软超时（毫秒），0 表示不检查
  #[arg(long, default_value_t = 1000, value_name = "MS")]
  pub job_deadline_ms: u64,

  /// 高清流使用 RAW_WIDTH x RAW_HEIGHT，而不是 1280x720
  #[arg(long)]
  pub use_raw_resolution: bool,
}

impl Args {
  pub fn into_config(self) -> Result<PipelineConfig, ConfigError> {
    let hd_resolution = if self.use_raw_resolution {
      Resolution::new(self.raw_width, self.raw_height)
    } else {
      DEFAULT_HD_RESOLUTION
    };
    let hd_source = self.hd_source.unwrap_or_else(|| self.source.clone());
    let job_deadline = match self.job_deadline_ms {
      0 => None,
      ms => Some(Duration::from_millis(ms)),
    };

    let config = PipelineConfig {
      model: self.model,
      labels: self.labels,
      detector_input: Resolution::new(self.width, self.height),
      quality: percent("quality", self.quality)?,
      threshold: percent("threshold", self.threshold)?,
      hd_resolution,
      chip: self.chip,
      source: self.source,
      hd_source,
      pixel_format: self.format,
      buffer_count: DEFAULT_BUFFER_COUNT,
      overlay: self.overlay,
      overlay_output: self.overlay_output,
      overlay_font: self.overlay_font,
      output_dir: self.output_dir,
      period: Duration::from_millis(self.period_ms),
      overlay_period: Duration::from_millis(self.overlay_period_ms),
      max_cycles: self.max_cycles,
      job_deadline,
    };
    config.validate()?;
    Ok(config)
  }
}
