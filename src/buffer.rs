// 该文件是 Xunshan （巡山） 项目的一部分。
// src/buffer.rs - 共享内存缓冲区管理
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

//! # 共享内存缓冲区
//!
//! 每个流水线阶段的输入/输出张量都由一块固定大小的共享内存承载。
//! 内存由一个没有文件系统路径的临时文件提供（创建后即脱离命名空间），
//! 再通过 `mmap` 映射进本进程，加速器可以通过文件句柄直接读写，实现零拷贝。
//!
//! 缓冲区在创建后大小固定、地址稳定，直到被释放或整个 [`BufferPool`] 被销毁。

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum BufferError {
  #[error("无法创建临时文件 {label}: {source}")]
  Create {
    label: String,
    source: std::io::Error,
  },
  #[error("无法设置临时文件 {label} 大小为 {size} 字节: {source}")]
  Truncate {
    label: String,
    size: usize,
    source: std::io::Error,
  },
  #[error("无法映射临时文件 {label}: {source}")]
  Map {
    label: String,
    source: std::io::Error,
  },
  #[error("缓冲区大小不能为 0: {0}")]
  ZeroSized(String),
  #[error("缓冲区名称已被使用: {0}")]
  DuplicateLabel(String),
  #[error("未知的缓冲区句柄: {0:?}")]
  UnknownBuffer(BufferId),
  #[error("缓冲区 {0} 已被释放")]
  Released(String),
  #[error("缓冲区 {label} 剩余空间不足: 游标 {cursor}, 需要 {wanted}, 总大小 {len}")]
  CursorOverrun {
    label: String,
    cursor: usize,
    wanted: usize,
    len: usize,
  },
  #[error("同一任务中缓冲区 {0:?} 被重复引用")]
  Aliased(BufferId),
}

/// 缓冲区句柄，由 [`BufferPool`] 分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

impl BufferId {
  pub fn index(self) -> usize {
    self.0
  }
}

/// 一块固定大小的共享内存
pub struct SharedBuffer {
  id: BufferId,
  label: String,
  len: usize,
  cursor: usize,
  // 先解除映射，再关闭文件
  map: Option<MmapMut>,
  file: Option<File>,
}

impl SharedBuffer {
  fn create(id: BufferId, label: &str, size: usize) -> Result<Self, BufferError> {
    if size == 0 {
      return Err(BufferError::ZeroSized(label.to_string()));
    }

    // tempfile() 打开的文件不在任何目录中留下名字
    let file = tempfile::tempfile().map_err(|source| BufferError::Create {
      label: label.to_string(),
      source,
    })?;

    file
      .set_len(size as u64)
      .map_err(|source| BufferError::Truncate {
        label: label.to_string(),
        size,
        source,
      })?;

    // SAFETY: 文件没有路径，其他进程只能通过我们交出的句柄访问；
    // 本进程内所有访问都经由 SharedBuffer 的借用规则。
    let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| BufferError::Map {
      label: label.to_string(),
      source,
    })?;

    debug!("创建共享缓冲区 {} ({} 字节)", label, size);

    Ok(Self {
      id,
      label: label.to_string(),
      len: size,
      cursor: 0,
      map: Some(map),
      file: Some(file),
    })
  }

  pub fn id(&self) -> BufferId {
    self.id
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn is_released(&self) -> bool {
    self.map.is_none()
  }

  pub fn cursor(&self) -> usize {
    self.cursor
  }

  pub fn as_slice(&self) -> Result<&[u8], BufferError> {
    self
      .map
      .as_deref()
      .ok_or_else(|| BufferError::Released(self.label.clone()))
  }

  pub fn as_mut_slice(&mut self) -> Result<&mut [u8], BufferError> {
    match self.map.as_deref_mut() {
      Some(data) => Ok(data),
      None => Err(BufferError::Released(self.label.clone())),
    }
  }

  /// 游标归零
  pub fn rewind(&mut self) {
    self.cursor = 0;
  }

  /// 从游标处取出 `len` 字节供写入，并把游标后移
  pub fn claim_at_cursor(&mut self, len: usize) -> Result<&mut [u8], BufferError> {
    let cursor = self.cursor;
    let total = self.len;
    if cursor + len > total {
      return Err(BufferError::CursorOverrun {
        label: self.label.clone(),
        cursor,
        wanted: len,
        len: total,
      });
    }
    if self.map.is_none() {
      return Err(BufferError::Released(self.label.clone()));
    }
    self.cursor = cursor + len;
    let data = self.as_mut_slice()?;
    Ok(&mut data[cursor..cursor + len])
  }

  /// 用源数据填充缓冲区开头，最多复制 `len` 字节
  pub fn fill_from(&mut self, source: &[u8], len: usize) -> Result<usize, BufferError> {
    let data = self.as_mut_slice()?;
    let count = len.min(source.len()).min(data.len());
    data[..count].copy_from_slice(&source[..count]);
    Ok(count)
  }

  /// 解除映射并关闭文件，重复调用无副作用
  pub fn release(&mut self) {
    if self.map.take().is_some() {
      debug!("释放共享缓冲区 {}", self.label);
    }
    self.file.take();
  }

  pub fn raw_fd(&self) -> Option<RawFd> {
    self.file.as_ref().map(|f| f.as_raw_fd())
  }

  pub fn backing_fd(&self) -> Option<BorrowedFd<'_>> {
    self.file.as_ref().map(|f| f.as_fd())
  }
}

impl Drop for SharedBuffer {
  fn drop(&mut self) {
    self.release();
  }
}

/// 缓冲区管理器，持有所有共享缓冲区直到进程结束
#[derive(Default)]
pub struct BufferPool {
  buffers: Vec<SharedBuffer>,
}

impl BufferPool {
  pub fn new() -> Self {
    Self::default()
  }

  /// 创建一块全零、大小恰为 `size` 字节的共享缓冲区
  pub fn create(&mut self, label: &str, size: usize) -> Result<BufferId, BufferError> {
    if self.buffers.iter().any(|b| b.label == label) {
      return Err(BufferError::DuplicateLabel(label.to_string()));
    }
    let id = BufferId(self.buffers.len());
    let buffer = SharedBuffer::create(id, label, size)?;
    info!("分配共享缓冲区 {}: {} 字节", label, size);
    self.buffers.push(buffer);
    Ok(id)
  }

  pub fn get(&self, id: BufferId) -> Result<&SharedBuffer, BufferError> {
    self.buffers.get(id.0).ok_or(BufferError::UnknownBuffer(id))
  }

  pub fn get_mut(&mut self, id: BufferId) -> Result<&mut SharedBuffer, BufferError> {
    self.buffers.get_mut(id.0).ok_or(BufferError::UnknownBuffer(id))
  }

  pub fn release(&mut self, id: BufferId) -> Result<(), BufferError> {
    self.get_mut(id)?.release();
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.buffers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buffers.is_empty()
  }

  /// 为一次任务同时借出只读输入和可写输出
  ///
  /// 同一个缓冲区不能在一次任务中出现两次。返回的视图顺序与参数顺序一致。
  pub fn split_for_job(
    &mut self,
    inputs: &[BufferId],
    outputs: &[BufferId],
  ) -> Result<(Vec<&SharedBuffer>, Vec<&mut SharedBuffer>), BufferError> {
    for (n, id) in inputs.iter().chain(outputs).enumerate() {
      if id.0 >= self.buffers.len() {
        return Err(BufferError::UnknownBuffer(*id));
      }
      if inputs.iter().chain(outputs).skip(n + 1).any(|other| other == id) {
        return Err(BufferError::Aliased(*id));
      }
    }

    let mut input_views: Vec<Option<&SharedBuffer>> = vec![None; inputs.len()];
    let mut output_views: Vec<Option<&mut SharedBuffer>> =
      std::iter::repeat_with(|| None).take(outputs.len()).collect();

    for buffer in self.buffers.iter_mut() {
      let id = buffer.id;
      if let Some(pos) = inputs.iter().position(|input| *input == id) {
        let shared: &SharedBuffer = buffer;
        input_views[pos] = Some(shared);
      } else if let Some(pos) = outputs.iter().position(|output| *output == id) {
        output_views[pos] = Some(buffer);
      }
    }

    let inputs = input_views.into_iter().flatten().collect();
    let outputs = output_views.into_iter().flatten().collect();
    Ok((inputs, outputs))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn created_buffer_is_zeroed_and_exact() {
    let mut pool = BufferPool::new();
    let id = pool.create("pp.input", 4096 + 17).unwrap();
    let buffer = pool.get(id).unwrap();
    assert_eq!(buffer.len(), 4096 + 17);
    assert!(buffer.as_slice().unwrap().iter().all(|b| *b == 0));
    assert!(buffer.raw_fd().is_some());
  }

  #[test]
  fn zero_size_and_duplicate_label_are_rejected() {
    let mut pool = BufferPool::new();
    assert!(matches!(
      pool.create("empty", 0),
      Err(BufferError::ZeroSized(_))
    ));
    pool.create("out1", 80).unwrap();
    assert!(matches!(
      pool.create("out1", 80),
      Err(BufferError::DuplicateLabel(_))
    ));
  }

  #[test]
  fn release_is_idempotent() {
    let mut pool = BufferPool::new();
    let id = pool.create("once", 16).unwrap();
    pool.release(id).unwrap();
    pool.release(id).unwrap();
    let buffer = pool.get(id).unwrap();
    assert!(buffer.is_released());
    assert!(buffer.raw_fd().is_none());
    assert!(matches!(buffer.as_slice(), Err(BufferError::Released(_))));
  }

  #[test]
  fn cursor_must_be_rewound_before_reuse() {
    let mut pool = BufferPool::new();
    let id = pool.create("scores", 8).unwrap();
    let buffer = pool.get_mut(id).unwrap();

    buffer.claim_at_cursor(8).unwrap().fill(7);
    assert_eq!(buffer.cursor(), 8);
    assert!(matches!(
      buffer.claim_at_cursor(8),
      Err(BufferError::CursorOverrun { .. })
    ));

    buffer.rewind();
    buffer.claim_at_cursor(8).unwrap().fill(9);
    assert_eq!(buffer.as_slice().unwrap(), &[9; 8]);
  }

  #[test]
  fn claims_advance_through_the_buffer() {
    let mut pool = BufferPool::new();
    let id = pool.create("boxes", 12).unwrap();
    let buffer = pool.get_mut(id).unwrap();

    buffer.claim_at_cursor(4).unwrap().fill(1);
    buffer.claim_at_cursor(8).unwrap().fill(2);
    assert_eq!(buffer.cursor(), 12);
    assert_eq!(&buffer.as_slice().unwrap()[..4], &[1; 4]);
    assert_eq!(&buffer.as_slice().unwrap()[4..], &[2; 8]);

    buffer.rewind();
    buffer.release();
    assert!(matches!(
      buffer.claim_at_cursor(4),
      Err(BufferError::Released(_))
    ));
    assert_eq!(buffer.cursor(), 0);
  }

  #[test]
  fn fill_copies_at_most_the_requested_length() {
    let mut pool = BufferPool::new();
    let id = pool.create("stage", 4).unwrap();
    let buffer = pool.get_mut(id).unwrap();
    let copied = buffer.fill_from(&[1, 2, 3, 4, 5, 6], 4).unwrap();
    assert_eq!(copied, 4);
    assert_eq!(buffer.as_slice().unwrap(), &[1, 2, 3, 4]);
  }

  #[test]
  fn split_keeps_argument_order_and_rejects_aliasing() {
    let mut pool = BufferPool::new();
    let a = pool.create("a", 1).unwrap();
    let b = pool.create("b", 2).unwrap();
    let c = pool.create("c", 3).unwrap();

    let (inputs, outputs) = pool.split_for_job(&[c, a], &[b]).unwrap();
    assert_eq!(inputs[0].label(), "c");
    assert_eq!(inputs[1].label(), "a");
    assert_eq!(outputs[0].label(), "b");

    assert!(matches!(
      pool.split_for_job(&[a], &[a]),
      Err(BufferError::Aliased(_))
    ));
  }
}
