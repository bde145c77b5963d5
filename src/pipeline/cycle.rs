// 该文件是 Xunshan （巡山） 项目的一部分。
// src/pipeline/cycle.rs - 一次完整的检测周期
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
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::PipelineContext;
use crate::accel::AcceleratorError;
use crate::buffer::{BufferError, BufferId, BufferPool};
use crate::input::StreamError;
use crate::model::{TensorError, hd_crop_rect};

/// 检测周期的各个阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
  Acquire,
  Stage,
  Preprocess,
  Infer,
  Interpret,
  Save,
  Release,
}

impl fmt::Display for CycleStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      CycleStage::Acquire => "acquire",
      CycleStage::Stage => "stage",
      CycleStage::Preprocess => "preprocess",
      CycleStage::Infer => "infer",
      CycleStage::Interpret => "interpret",
      CycleStage::Save => "save",
      CycleStage::Release => "release",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
pub enum CycleError {
  #[error("[{stage}] 视频源错误: {source}")]
  Stream {
    stage: CycleStage,
    source: StreamError,
  },
  #[error("[{stage}] 任务执行失败: {source}")]
  Job {
    stage: CycleStage,
    source: AcceleratorError,
  },
  #[error("[{stage}] 缓冲区错误: {source}")]
  Buffer {
    stage: CycleStage,
    source: BufferError,
  },
  #[error("[{stage}] 输出张量不符合约定: {source}")]
  Tensor {
    stage: CycleStage,
    source: TensorError,
  },
}

impl CycleError {
  pub fn stage(&self) -> CycleStage {
    match self {
      CycleError::Stream { stage, .. }
      | CycleError::Job { stage, .. }
      | CycleError::Buffer { stage, .. }
      | CycleError::Tensor { stage, .. } => *stage,
    }
  }

  /// 视频源失败时整个进程退出，其余错误只放弃本周期
  pub fn is_fatal(&self) -> bool {
    matches!(self, CycleError::Stream { .. })
  }

  fn stream(stage: CycleStage) -> impl FnOnce(StreamError) -> Self {
    move |source| CycleError::Stream { stage, source }
  }

  fn job(stage: CycleStage) -> impl FnOnce(AcceleratorError) -> Self {
    move |source| CycleError::Job { stage, source }
  }

  fn buffer(stage: CycleStage) -> impl FnOnce(BufferError) -> Self {
    move |source| CycleError::Buffer { stage, source }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimings {
  pub acquire: Duration,
  pub preprocess: Duration,
  pub inference: Duration,
  pub save: Duration,
}

/// 一次成功周期的统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
  pub cycle: u64,
  /// 检测器报告的目标数（截断到输出容量）
  pub detections: usize,
  /// 分数达到阈值的目标数
  pub qualifying: usize,
  pub files_written: usize,
  /// 裁剪区域越界或保存失败而跳过的目标数
  pub skipped: usize,
  /// 叠加层中的目标数，没有叠加层时为 `None`
  pub overlay_entries: Option<usize>,
  pub timings: StageTimings,
}

fn rewind_all(pool: &mut BufferPool, ids: &[BufferId], stage: CycleStage) -> Result<(), CycleError> {
  for id in ids {
    pool.get_mut(*id).map_err(CycleError::buffer(stage))?.rewind();
  }
  Ok(())
}

impl PipelineContext {
  /// 执行一次检测周期
  ///
  /// 任何阶段失败都放弃本周期剩余步骤，不保留中间状态；
  /// 两帧由租约持有，任何返回路径上都会归还给帧源。
  pub fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
    self.cycles += 1;
    let cycle = self.cycles;
    let PipelineContext {
      source,
      overlay,
      writer,
      detections,
      jobs,
      buffers,
      pool,
      session,
      labels,
      layout,
      threshold,
      hd,
      ..
    } = self;
    let mut timings = StageTimings::default();

    // 取帧
    let now = Instant::now();
    let (low, high) = source
      .acquire_pair()
      .map_err(CycleError::stream(CycleStage::Acquire))?;
    timings.acquire = now.elapsed();
    debug!(
      "第 {} 周期取得帧 {} / {}，耗时 {:.2?}",
      cycle,
      low.sequence(),
      high.sequence(),
      timings.acquire
    );

    // 拷贝到预处理输入，字节数以张量 pitch 为准
    for (id, frame) in [(buffers.low_input, &low), (buffers.hd_input, &high)] {
      let buffer = pool.get_mut(id).map_err(CycleError::buffer(CycleStage::Stage))?;
      let pitch = buffer.len();
      let copied = buffer
        .fill_from(frame.data(), pitch)
        .map_err(CycleError::buffer(CycleStage::Stage))?;
      if copied < pitch {
        warn!(
          "帧 {} 只有 {} 字节, 缓冲区 {} 需要 {} 字节",
          frame.sequence(),
          copied,
          buffer.label(),
          pitch
        );
      }
    }

    // 预处理
    let now = Instant::now();
    rewind_all(pool, &buffers.preprocess_outputs(), CycleStage::Preprocess)?;
    session
      .run_job(&jobs.preprocess_low, pool)
      .map_err(CycleError::job(CycleStage::Preprocess))?;
    session
      .run_job(&jobs.preprocess_hd, pool)
      .map_err(CycleError::job(CycleStage::Preprocess))?;
    timings.preprocess = now.elapsed();
    debug!("converted image in {:.2?}", timings.preprocess);

    // 推理
    let now = Instant::now();
    rewind_all(pool, &buffers.detector_outputs, CycleStage::Infer)?;
    session
      .run_job(&jobs.detect, pool)
      .map_err(CycleError::job(CycleStage::Infer))?;
    timings.inference = now.elapsed();
    debug!("ran inference for {:.2?}", timings.inference);

    // 解析输出张量
    let [locations, classes, scores, count] = buffers.detector_outputs;
    let outputs = [
      pool.get(locations),
      pool.get(classes),
      pool.get(scores),
      pool.get(count),
    ];
    let mut views: [&[u8]; 4] = [&[]; 4];
    for (view, buffer) in views.iter_mut().zip(outputs) {
      *view = buffer
        .and_then(|b| b.as_slice())
        .map_err(CycleError::buffer(CycleStage::Interpret))?;
    }
    let found = layout
      .interpret(views, labels.len(), detections)
      .map_err(|source| CycleError::Tensor {
        stage: CycleStage::Interpret,
        source,
      })?;

    // 保存合格目标的高清裁剪图
    let now = Instant::now();
    let hd_rgb = pool
      .get(buffers.hd_rgb)
      .and_then(|b| b.as_slice())
      .map_err(CycleError::buffer(CycleStage::Save))?;
    let mut qualifying = 0;
    let mut written = 0;
    let mut skipped = 0;
    for (i, detection) in detections.iter().enumerate() {
      let label = labels.get(detection.class_index).unwrap_or("?");
      if !detection.qualifies(*threshold) {
        debug!("目标 {} {} 分数 {:.2} 低于阈值", i, label, detection.score);
        continue;
      }
      qualifying += 1;
      let rect = hd_crop_rect(&detection.bbox, *hd);
      match writer.write(written, hd_rgb, *hd, rect) {
        Ok(path) => {
          info!(
            "目标 {}: {} ({:.2}) -> {}",
            i,
            label,
            detection.score,
            path.display()
          );
          written += 1;
        }
        Err(e) => {
          warn!("跳过目标 {} {}: {}", i, label, e);
          skipped += 1;
        }
      }
    }
    let removed = writer.remove_stale(written);
    if removed > 0 {
      debug!("删除 {} 个旧裁剪图", removed);
    }
    timings.save = now.elapsed();

    // 发布叠加层
    let overlay_entries = overlay
      .as_mut()
      .map(|overlay| overlay.state.publish(detections, labels));

    // 归还帧
    low.release().map_err(CycleError::stream(CycleStage::Release))?;
    high.release().map_err(CycleError::stream(CycleStage::Release))?;

    Ok(CycleReport {
      cycle,
      detections: found,
      qualifying,
      files_written: written,
      skipped,
      overlay_entries,
      timings,
    })
  }
}
