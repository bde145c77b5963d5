// 该文件是 Xunshan （巡山） 项目的一部分。
// src/pipeline.rs - 检测流水线上下文
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

//! # 检测流水线
//!
//! 启动时一次性建立所有资源：共享缓冲区、三个模型（低分辨率预处理、
//! 高清预处理、检测器）、张量绑定和任务描述。之后每个检测周期只改写缓冲区
//! 内容并重新提交同样的任务，不再分配任何资源。
//!
//! 字段按依赖的逆序声明，销毁时先停帧源，再释放任务、缓冲区，最后断开会话。

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

mod cycle;
mod tasks;

pub use self::cycle::{CycleError, CycleReport, CycleStage, StageTimings};
pub use self::tasks::{DetectionTask, OverlayTask};

use crate::accel::{
  AccessMode, AcceleratorError, CPU_PROC_DEVICE, Device, JobRequest, ModelSource,
  PARAM_DETECTION_MAX, PARAM_INPUT_CROP, PARAM_INPUT_FORMAT, PARAM_INPUT_SIZE,
  PARAM_OUTPUT_FORMAT, PARAM_OUTPUT_SIZE, ParamMap, Session,
};
use crate::buffer::{BufferError, BufferId, BufferPool};
use crate::config::{ConfigError, OverlayKind, PipelineConfig};
use crate::frame::{Resolution, centered_aspect_crop};
use crate::input::{DualStreamSource, InputWrapper, StreamConfig, StreamError, StreamKind};
use crate::labels::{LabelError, LabelTable};
use crate::model::{Detection, SSD_OUTPUT_COUNT, SsdLayout};
use crate::output::{
  BoxesSink, CanvasSink, DetectionCropWriter, OverlayBackend, OverlayError, OverlaySink,
  OverlayState,
};

#[derive(Error, Debug)]
pub enum SetupError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("标签文件错误: {0}")]
  Labels(#[from] LabelError),
  #[error("视频源错误: {0}")]
  Stream(#[from] StreamError),
  #[error("推理会话错误: {0}")]
  Accelerator(#[from] AcceleratorError),
  #[error("共享缓冲区错误: {0}")]
  Buffer(#[from] BufferError),
  #[error("叠加层错误: {0}")]
  Overlay(#[from] OverlayError),
  #[error("无法创建输出目录 {path}: {source}")]
  OutputDir {
    path: PathBuf,
    source: std::io::Error,
  },
}

/// 三个预先构造好的任务
struct Jobs {
  preprocess_low: JobRequest,
  preprocess_hd: JobRequest,
  detect: JobRequest,
}

/// 每个周期要读写的缓冲区
struct Buffers {
  low_input: BufferId,
  /// 低分辨率预处理的输出，同时是检测器的输入
  detector_input: BufferId,
  hd_input: BufferId,
  hd_rgb: BufferId,
  detector_outputs: [BufferId; SSD_OUTPUT_COUNT],
}

impl Buffers {
  /// 预处理任务写入的缓冲区
  fn preprocess_outputs(&self) -> [BufferId; 2] {
    [self.detector_input, self.hd_rgb]
  }
}

struct Overlay {
  state: OverlayState,
  sink: OverlayBackend,
}

/// 检测周期和叠加层任务共享的应用上下文
pub struct PipelineContext {
  source: DualStreamSource,
  overlay: Option<Overlay>,
  writer: DetectionCropWriter,
  detections: Vec<Detection>,
  jobs: Jobs,
  buffers: Buffers,
  pool: BufferPool,
  session: Session,
  labels: LabelTable,
  layout: SsdLayout,
  threshold: u8,
  hd: Resolution,
  cycles: u64,
}

/// 按配置中的 URL 打开两路相机流
pub fn open_sources(config: &PipelineConfig) -> Result<DualStreamSource, SetupError> {
  let low = InputWrapper::open(
    &config.source,
    StreamConfig::new(config.detector_input, config.pixel_format, config.buffer_count),
  )?;
  let high = InputWrapper::open(
    &config.hd_source,
    StreamConfig::new(config.hd_resolution, config.pixel_format, config.buffer_count),
  )?;
  Ok(DualStreamSource::new(Box::new(low), Box::new(high)))
}

/// 按配置创建叠加层后端，`none` 时返回 `None`
pub fn open_overlay(
  config: &PipelineConfig,
  resolution: Resolution,
) -> Result<Option<OverlayBackend>, SetupError> {
  let backend = match config.overlay {
    OverlayKind::None => return Ok(None),
    OverlayKind::Canvas => OverlayBackend::Canvas(CanvasSink::new(
      &config.overlay_output,
      resolution,
      config.overlay_font.as_deref(),
    )?),
    OverlayKind::Boxes => OverlayBackend::Boxes(BoxesSink::new(&config.overlay_output)),
  };
  Ok(Some(backend))
}

impl fmt::Debug for PipelineContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PipelineContext")
      .field("session", &self.session)
      .field("labels", &self.labels.len())
      .field("layout", &self.layout)
      .field("threshold", &self.threshold)
      .field("hd", &self.hd)
      .field("overlay", &self.overlay.is_some())
      .field("detections", &self.detections.len())
      .field("cycles", &self.cycles)
      .finish_non_exhaustive()
  }
}

impl PipelineContext {
  /// 建立全部资源并启动两路帧源
  ///
  /// 任何一步失败时，已经建立的资源随局部变量按逆序释放。
  pub fn setup(
    config: &PipelineConfig,
    devices: Vec<Box<dyn Device>>,
    mut source: DualStreamSource,
    overlay: Option<OverlayBackend>,
  ) -> Result<Self, SetupError> {
    config.validate()?;

    let labels = LabelTable::load(&config.labels)?;
    info!("读取 {} 个标签", labels.len());

    let detector_input = config.detector_input;
    let low = source.resolution(StreamKind::LowRes);
    let hd = source.resolution(StreamKind::HighRes);
    let crop = centered_aspect_crop(low, detector_input);
    info!(
      "低分辨率流 {}，裁剪 ({}, {}) {}x{}；高清流 {}",
      low, crop.x, crop.y, crop.width, crop.height, hd
    );

    let mut low_params = ParamMap::new();
    low_params
      .set_str(PARAM_INPUT_FORMAT, source.pixel_format(StreamKind::LowRes).name())
      .set_int_arr2(PARAM_INPUT_SIZE, low.width as i64, low.height as i64)
      .set_str(PARAM_OUTPUT_FORMAT, "rgb-interleaved")
      .set_int_arr2(
        PARAM_OUTPUT_SIZE,
        detector_input.width as i64,
        detector_input.height as i64,
      );
    let mut hd_params = ParamMap::new();
    hd_params
      .set_str(PARAM_INPUT_FORMAT, source.pixel_format(StreamKind::HighRes).name())
      .set_int_arr2(PARAM_INPUT_SIZE, hd.width as i64, hd.height as i64)
      .set_str(PARAM_OUTPUT_FORMAT, "rgb-interleaved")
      .set_int_arr2(PARAM_OUTPUT_SIZE, hd.width as i64, hd.height as i64);
    let mut crop_params = ParamMap::new();
    crop_params.set_int_arr4(
      PARAM_INPUT_CROP,
      crop.x as i64,
      crop.y as i64,
      crop.width as i64,
      crop.height as i64,
    );

    let layout = SsdLayout::default();
    let mut detector_params = ParamMap::new();
    detector_params
      .set_int_arr2(
        PARAM_INPUT_SIZE,
        detector_input.width as i64,
        detector_input.height as i64,
      )
      .set_int(PARAM_DETECTION_MAX, layout.max_detections as i64);

    let mut session = Session::connect(devices)?.with_deadline(config.job_deadline);
    info!("推理会话已连接，设备: {:?}", session.list_devices());

    let detector = session.load_model(
      ModelSource::File(config.model.clone()),
      &config.chip,
      AccessMode::Private,
      "detector",
      &detector_params,
    )?;
    let preprocess_low = session.load_model(
      ModelSource::Builtin,
      CPU_PROC_DEVICE,
      AccessMode::Private,
      "preprocess-low",
      &low_params,
    )?;
    let preprocess_hd = session.load_model(
      ModelSource::Builtin,
      CPU_PROC_DEVICE,
      AccessMode::Private,
      "preprocess-hd",
      &hd_params,
    )?;

    let (mut low_in, mut low_out) = session.declare_tensors(preprocess_low)?;
    let (mut hd_in, mut hd_out) = session.declare_tensors(preprocess_hd)?;
    let (mut det_in, mut det_out) = session.declare_tensors(detector)?;
    expect_count("preprocess-low", &low_in, &low_out, 1, 1)?;
    expect_count("preprocess-hd", &hd_in, &hd_out, 1, 1)?;
    expect_count("detector", &det_in, &det_out, 1, SSD_OUTPUT_COUNT)?;

    // 预处理输出与检测器输入共用一块缓冲区，字节数必须一致
    low_out[0].expect_pitch(detector_input.rgb_size())?;
    det_in[0].expect_pitch(detector_input.rgb_size())?;
    hd_out[0].expect_pitch(hd.rgb_size())?;
    for (tensor, pitch) in det_out.iter().zip(layout.output_pitches()) {
      tensor.expect_pitch(pitch)?;
    }

    let mut pool = BufferPool::new();
    let low_input = pool.create("pp-sd-input", low_in[0].pitch())?;
    let detector_buffer = pool.create("detector-input", detector_input.rgb_size())?;
    let hd_input = pool.create("pp-hd-input", hd_in[0].pitch())?;
    let hd_rgb = pool.create("pp-hd-output", hd.rgb_size())?;
    let mut detector_outputs = Vec::with_capacity(SSD_OUTPUT_COUNT);
    for (tensor, name) in det_out.iter().zip(SsdLayout::OUTPUT_NAMES) {
      detector_outputs.push(pool.create(&format!("detector-{}", name), tensor.pitch())?);
    }
    let detector_outputs: [BufferId; SSD_OUTPUT_COUNT] = detector_outputs
      .try_into()
      .map_err(|_| AcceleratorError::Configuration("检测器输出数量不符".to_string()))?;

    low_in[0].bind(pool.get(low_input)?)?;
    low_out[0].bind(pool.get(detector_buffer)?)?;
    hd_in[0].bind(pool.get(hd_input)?)?;
    hd_out[0].bind(pool.get(hd_rgb)?)?;
    det_in[0].bind(pool.get(detector_buffer)?)?;
    for (tensor, id) in det_out.iter_mut().zip(detector_outputs) {
      tensor.bind(pool.get(id)?)?;
    }

    let jobs = Jobs {
      preprocess_low: session.create_job(
        "preprocess-low",
        preprocess_low,
        &low_in,
        &low_out,
        Some(crop_params),
      )?,
      preprocess_hd: session.create_job("preprocess-hd", preprocess_hd, &hd_in, &hd_out, None)?,
      detect: session.create_job("detect", detector, &det_in, &det_out, None)?,
    };

    std::fs::create_dir_all(&config.output_dir).map_err(|source| SetupError::OutputDir {
      path: config.output_dir.clone(),
      source,
    })?;
    let writer = DetectionCropWriter::new(&config.output_dir, config.quality);

    let overlay = overlay.map(|sink| {
      info!("叠加层后端: {}", sink.name());
      Overlay {
        state: OverlayState::new(hd),
        sink,
      }
    });

    source.start()?;

    Ok(Self {
      source,
      overlay,
      writer,
      detections: Vec::with_capacity(layout.max_detections),
      jobs,
      buffers: Buffers {
        low_input,
        detector_input: detector_buffer,
        hd_input,
        hd_rgb,
        detector_outputs,
      },
      pool,
      session,
      labels,
      layout,
      threshold: config.threshold,
      hd,
      cycles: 0,
    })
  }

  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  pub fn hd_resolution(&self) -> Resolution {
    self.hd
  }

  /// 已开始的检测周期数
  pub fn cycles(&self) -> u64 {
    self.cycles
  }

  /// 上一个周期的检测结果
  pub fn detections(&self) -> &[Detection] {
    &self.detections
  }

  pub fn overlay_state(&self) -> Option<&OverlayState> {
    self.overlay.as_ref().map(|overlay| &overlay.state)
  }

  pub fn crop_writer(&self) -> &DetectionCropWriter {
    &self.writer
  }

  /// 重绘叠加层，没有叠加层时返回 false
  pub fn render_overlay(&mut self) -> Result<bool, OverlayError> {
    match &mut self.overlay {
      Some(overlay) => {
        overlay.sink.render(&overlay.state)?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// 停止帧源并断开推理会话
  pub fn shutdown(&mut self) {
    if let Err(e) = self.source.stop() {
      warn!("停止帧源失败: {}", e);
    }
    self.session.disconnect();
  }
}

fn expect_count<T>(
  model: &str,
  inputs: &[T],
  outputs: &[T],
  want_inputs: usize,
  want_outputs: usize,
) -> Result<(), AcceleratorError> {
  if inputs.len() != want_inputs || outputs.len() != want_outputs {
    return Err(AcceleratorError::Configuration(format!(
      "模型 {} 有 {} 个输入、{} 个输出, 需要 {} 个输入、{} 个输出",
      model,
      inputs.len(),
      outputs.len(),
      want_inputs,
      want_outputs
    )));
  }
  Ok(())
}
