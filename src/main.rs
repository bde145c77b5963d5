// 该文件是 Xunshan （巡山） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use xunshan::accel::builtin_devices;
use xunshan::input::StreamKind;
use xunshan::pipeline::{DetectionTask, OverlayTask, PipelineContext, open_overlay, open_sources};
use xunshan::task::Scheduler;

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = args::Args::parse().into_config()?;

  info!("模型文件路径: {}", config.model.display());
  info!("标签文件路径: {}", config.labels.display());
  info!("检测设备: {}", config.chip);
  info!("低分辨率视频源: {} ({})", config.source, config.detector_input);
  info!("高清视频源: {} ({})", config.hd_source, config.hd_resolution);
  info!("输出目录: {}", config.output_dir.display());

  let source = open_sources(&config).context("打开视频源失败")?;
  let overlay = open_overlay(&config, source.resolution(StreamKind::HighRes))
    .context("创建叠加层失败")?;
  let has_overlay = overlay.is_some();
  let context = PipelineContext::setup(&config, builtin_devices(), source, overlay)
    .context("初始化检测流水线失败")?;

  let mut scheduler = Scheduler::new(context).install_ctrlc()?;
  scheduler.add_task(Box::new(DetectionTask::new(
    config.period,
    config.max_cycles,
  )));
  if has_overlay {
    scheduler.add_task(Box::new(OverlayTask::new(config.overlay_period)));
  }

  let result = scheduler.run();
  let mut context = scheduler.into_context();
  info!(
    "共运行 {} 个检测周期, {} 次任务超时",
    context.cycles(),
    context.session().overruns()
  );
  context.shutdown();

  if let Err(e) = &result {
    error!("程序异常退出: {:#}", e);
  }
  result
}
