// 该文件是 Xunshan （巡山） 项目的一部分。
// src/pipeline/tasks.rs - 检测与叠加层周期任务
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

use std::time::Duration;

use tracing::{error, info, warn};

use super::PipelineContext;
use crate::task::{PeriodicTask, TaskFlow};

/// 按固定周期运行检测周期
pub struct DetectionTask {
  period: Duration,
  max_cycles: Option<u64>,
  attempted: u64,
}

impl DetectionTask {
  /// `max_cycles` 按尝试次数计算，失败的周期也算在内
  pub fn new(period: Duration, max_cycles: Option<u64>) -> Self {
    Self {
      period,
      max_cycles,
      attempted: 0,
    }
  }
}

impl PeriodicTask<PipelineContext> for DetectionTask {
  fn name(&self) -> &str {
    "detection"
  }

  fn period(&self) -> Duration {
    self.period
  }

  fn tick(&mut self, context: &mut PipelineContext) -> TaskFlow {
    self.attempted += 1;
    match context.run_cycle() {
      Ok(report) => {
        info!(
          "周期 {}: {} 个目标, {} 个合格, 保存 {} 张, 跳过 {} 张; 取帧 {:.2?}, 预处理 {:.2?}, 推理 {:.2?}, 保存 {:.2?}",
          report.cycle,
          report.detections,
          report.qualifying,
          report.files_written,
          report.skipped,
          report.timings.acquire,
          report.timings.preprocess,
          report.timings.inference,
          report.timings.save
        );
      }
      Err(e) if e.is_fatal() => {
        error!("检测周期失败, 停止运行: {}", e);
        return TaskFlow::Fail(e.into());
      }
      Err(e) => {
        warn!("放弃本次检测周期: {}", e);
      }
    }

    match self.max_cycles {
      Some(max) if self.attempted >= max => {
        info!("已完成 {} 个检测周期", self.attempted);
        TaskFlow::Stop
      }
      _ => TaskFlow::Continue,
    }
  }
}

/// 按固定周期把最新的叠加层状态提交给后端
pub struct OverlayTask {
  period: Duration,
}

impl OverlayTask {
  pub fn new(period: Duration) -> Self {
    Self { period }
  }
}

impl PeriodicTask<PipelineContext> for OverlayTask {
  fn name(&self) -> &str {
    "overlay"
  }

  fn period(&self) -> Duration {
    self.period
  }

  fn tick(&mut self, context: &mut PipelineContext) -> TaskFlow {
    match context.render_overlay() {
      Ok(true) => TaskFlow::Continue,
      Ok(false) => TaskFlow::Remove,
      Err(e) => {
        error!("绘制叠加层失败: {}", e);
        TaskFlow::Continue
      }
    }
  }
}
