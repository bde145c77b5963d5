// 该文件是 Xunshan （巡山） 项目的一部分。
// src/input/dual.rs - 低分辨率 / 高清双路帧源
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

use std::ops::Deref;

use tracing::{error, info, warn};

use super::{FrameProvider, StreamError};
use crate::frame::{Frame, PixelFormat, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
  /// 送检测器的低分辨率流
  LowRes,
  /// 用于保存裁剪图的高清流
  HighRes,
}

/// 借出的一帧，离开作用域时自动归还给帧源
pub struct FrameLease<'a> {
  provider: &'a mut dyn FrameProvider,
  frame: Frame,
  returned: bool,
}

impl<'a> FrameLease<'a> {
  pub fn acquire(provider: &'a mut dyn FrameProvider) -> Result<Self, StreamError> {
    let frame = provider.latest_frame()?;
    Ok(Self {
      provider,
      frame,
      returned: false,
    })
  }

  /// 立即归还，并返回归还结果
  pub fn release(mut self) -> Result<(), StreamError> {
    self.give_back()
  }

  /// 把帧交还帧源，原位留下不占内存的空帧，之后的调用不再归还
  fn give_back(&mut self) -> Result<(), StreamError> {
    if self.returned {
      return Ok(());
    }
    self.returned = true;
    let empty = Frame::new(
      Box::default(),
      self.frame.resolution(),
      self.frame.format(),
      self.frame.sequence(),
      self.frame.timestamp_ms(),
      self.frame.slot(),
    );
    let frame = std::mem::replace(&mut self.frame, empty);
    self.provider.release(frame)
  }
}

impl Deref for FrameLease<'_> {
  type Target = Frame;

  fn deref(&self) -> &Frame {
    &self.frame
  }
}

impl Drop for FrameLease<'_> {
  fn drop(&mut self) {
    let sequence = self.frame.sequence();
    if let Err(e) = self.give_back() {
      error!("{} 归还第 {} 帧失败: {}", self.provider.name(), sequence, e);
    }
  }
}

/// 两路相互独立的相机流
pub struct DualStreamSource {
  low: Box<dyn FrameProvider>,
  high: Box<dyn FrameProvider>,
  running: bool,
}

impl DualStreamSource {
  pub fn new(low: Box<dyn FrameProvider>, high: Box<dyn FrameProvider>) -> Self {
    Self {
      low,
      high,
      running: false,
    }
  }

  pub fn resolution(&self, kind: StreamKind) -> Resolution {
    self.stream(kind).resolution()
  }

  pub fn pixel_format(&self, kind: StreamKind) -> PixelFormat {
    self.stream(kind).pixel_format()
  }

  fn stream(&self, kind: StreamKind) -> &dyn FrameProvider {
    match kind {
      StreamKind::LowRes => self.low.as_ref(),
      StreamKind::HighRes => self.high.as_ref(),
    }
  }

  /// 启动两路流，第二路失败时停止已经启动的第一路
  pub fn start(&mut self) -> Result<(), StreamError> {
    self.low.start()?;
    if let Err(e) = self.high.start() {
      if let Err(stop) = self.low.stop() {
        warn!("停止 {} 失败: {}", self.low.name(), stop);
      }
      return Err(e);
    }
    self.running = true;
    info!(
      "已启动双路帧源: {} ({}), {} ({})",
      self.low.name(),
      self.low.resolution(),
      self.high.name(),
      self.high.resolution()
    );
    Ok(())
  }

  /// 依次阻塞获取低分辨率帧和高清帧
  ///
  /// 任何一路失败时，已经取到的帧随租约一起归还。
  pub fn acquire_pair(&mut self) -> Result<(FrameLease<'_>, FrameLease<'_>), StreamError> {
    let low = FrameLease::acquire(self.low.as_mut())?;
    let high = FrameLease::acquire(self.high.as_mut())?;
    Ok((low, high))
  }

  pub fn stop(&mut self) -> Result<(), StreamError> {
    if !self.running {
      return Ok(());
    }
    self.running = false;
    let low = self.low.stop();
    let high = self.high.stop();
    low.and(high)
  }

  pub fn is_running(&self) -> bool {
    self.running
  }
}

impl Drop for DualStreamSource {
  fn drop(&mut self) {
    if let Err(e) = self.stop() {
      warn!("停止帧源失败: {}", e);
    }
  }
}
