// 该文件是 Xunshan （巡山） 项目的一部分。
// src/input/provider.rs - 帧源特征与帧缓冲池
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

use std::time::Instant;

use tracing::debug;

use super::StreamError;
use crate::frame::{Frame, PixelFormat, Resolution};

/// 帧源的创建参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
  pub resolution: Resolution,
  pub format: PixelFormat,
  pub buffer_count: usize,
}

impl StreamConfig {
  pub fn new(resolution: Resolution, format: PixelFormat, buffer_count: usize) -> Self {
    Self {
      resolution,
      format,
      buffer_count,
    }
  }
}

/// 相机帧源
///
/// `latest_frame` 阻塞直到下一帧可用；借出的帧必须通过 `release` 归还，
/// 且每帧只能归还一次。
pub trait FrameProvider {
  fn name(&self) -> &str;
  fn start(&mut self) -> Result<(), StreamError>;
  fn latest_frame(&mut self) -> Result<Frame, StreamError>;
  fn release(&mut self, frame: Frame) -> Result<(), StreamError>;
  fn stop(&mut self) -> Result<(), StreamError>;
  fn resolution(&self) -> Resolution;
  fn pixel_format(&self) -> PixelFormat;
}

/// 固定数量的帧缓冲，启动时一次分配，之后只在借出和归还之间轮转
#[derive(Debug)]
pub struct FramePool {
  name: String,
  slots: Vec<Option<Box<[u8]>>>,
  frame_size: usize,
  resolution: Resolution,
  format: PixelFormat,
  sequence: u64,
  started: Instant,
}

impl FramePool {
  pub fn new(name: &str, resolution: Resolution, format: PixelFormat, count: usize) -> Self {
    let frame_size = format.frame_size(resolution);
    let slots = (0..count.max(1))
      .map(|_| Some(vec![0u8; frame_size].into_boxed_slice()))
      .collect::<Vec<_>>();
    debug!(
      "{}: 分配 {} 个 {} {} 帧缓冲 ({} 字节)",
      name,
      slots.len(),
      resolution,
      format,
      frame_size
    );
    Self {
      name: name.to_string(),
      slots,
      frame_size,
      resolution,
      format,
      sequence: 0,
      started: Instant::now(),
    }
  }

  pub fn frame_size(&self) -> usize {
    self.frame_size
  }

  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  /// 已借出未归还的帧数
  pub fn outstanding(&self) -> usize {
    self.slots.iter().filter(|s| s.is_none()).count()
  }

  /// 借出一个空闲帧缓冲，并填上序号和时间戳
  pub fn acquire(&mut self) -> Result<Frame, StreamError> {
    let slot = self
      .slots
      .iter()
      .position(Option::is_some)
      .ok_or_else(|| StreamError::PoolExhausted {
        source_name: self.name.clone(),
        count: self.slots.len(),
      })?;
    let data = self.slots[slot]
      .take()
      .ok_or_else(|| StreamError::UnknownSlot {
        source_name: self.name.clone(),
        slot,
      })?;

    let sequence = self.sequence;
    self.sequence += 1;
    let timestamp_ms = self.started.elapsed().as_millis() as u64;
    Ok(Frame::new(
      data,
      self.resolution,
      self.format,
      sequence,
      timestamp_ms,
      slot,
    ))
  }

  /// 放回借出的帧；不属于本池或重复归还的帧会被拒绝
  pub fn release(&mut self, frame: Frame) -> Result<(), StreamError> {
    let slot = frame.slot();
    let unknown = || StreamError::UnknownSlot {
      source_name: self.name.clone(),
      slot,
    };
    if frame.data().len() != self.frame_size || frame.resolution() != self.resolution {
      return Err(unknown());
    }
    match self.slots.get_mut(slot) {
      Some(entry @ None) => {
        *entry = Some(frame.into_data());
        Ok(())
      }
      _ => Err(unknown()),
    }
  }
}
