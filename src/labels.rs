// 该文件是 Xunshan （巡山） 项目的一部分。
// src/labels.rs - 类别标签表
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

/// 标签文件大小上限
pub const LABEL_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024;
/// 每个标签最多保留的字节数
pub const LABEL_MAX_LEN: usize = 60;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("无法读取标签文件 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("标签文件 {path} 过大: {size} 字节")]
  TooLarge { path: PathBuf, size: u64 },
  #[error("标签文件 {0} 为空")]
  Empty(PathBuf),
}

/// 按行号索引的类别名称，加载后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
  labels: Box<[String]>,
}

impl LabelTable {
  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LabelError> {
    let path = path.as_ref();
    let io_err = |source| LabelError::Io {
      path: path.to_path_buf(),
      source,
    };

    let size = std::fs::metadata(path).map_err(io_err)?.len();
    if size > LABEL_FILE_MAX_BYTES {
      return Err(LabelError::TooLarge {
        path: path.to_path_buf(),
        size,
      });
    }

    let data = std::fs::read(path).map_err(io_err)?;
    if data.is_empty() {
      return Err(LabelError::Empty(path.to_path_buf()));
    }

    let table = Self::parse(&data);
    info!("从 {} 读取 {} 个标签", path.display(), table.len());
    Ok(table)
  }

  /// 按换行符切分；文件末尾的换行不产生额外的空标签
  pub fn parse(data: &[u8]) -> Self {
    let body = data.strip_suffix(b"\n").unwrap_or(data);
    let labels = body
      .split(|b| *b == b'\n')
      .map(|line| {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        cap_label(&String::from_utf8_lossy(line))
      })
      .collect::<Vec<_>>();
    debug!("标签: {:?}", labels);
    Self {
      labels: labels.into_boxed_slice(),
    }
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.labels.get(index).map(String::as_str)
  }

  pub fn contains_index(&self, index: usize) -> bool {
    index < self.labels.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.labels.iter().map(String::as_str)
  }
}

/// 截断到最多 `LABEL_MAX_LEN` 字节，不切开多字节字符
fn cap_label(line: &str) -> String {
  cap_str(line, LABEL_MAX_LEN).to_string()
}

pub(crate) fn cap_str(text: &str, max: usize) -> &str {
  if text.len() <= max {
    return text;
  }
  let mut end = max;
  while !text.is_char_boundary(end) {
    end -= 1;
  }
  &text[..end]
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn last_line_without_newline_is_kept() {
    let table = LabelTable::parse(b"person\nbicycle\ncar");
    assert_eq!(table.len(), 3);
    assert_eq!(table.get(2), Some("car"));
  }

  #[test]
  fn trailing_newline_does_not_add_a_label() {
    let table = LabelTable::parse(b"person\nbicycle\n");
    assert_eq!(table.len(), 2);
    assert_eq!(table.get(1), Some("bicycle"));
    assert_eq!(table.get(2), None);
  }

  #[test]
  fn crlf_and_blank_lines() {
    let table = LabelTable::parse(b"person\r\n\r\nchair\r\n");
    assert_eq!(table.len(), 3);
    assert_eq!(table.get(0), Some("person"));
    assert_eq!(table.get(1), Some(""));
    assert_eq!(table.get(2), Some("chair"));
  }

  #[test]
  fn long_lines_are_capped_at_sixty_bytes() {
    let long = "x".repeat(100);
    let table = LabelTable::parse(format!("{}\nok", long).as_bytes());
    assert_eq!(table.get(0).unwrap().len(), LABEL_MAX_LEN);
    assert_eq!(table.get(1), Some("ok"));
  }

  #[test]
  fn capping_respects_char_boundaries() {
    // 59 个 ASCII 字符后跟一个三字节字符
    let line = format!("{}山", "a".repeat(59));
    let table = LabelTable::parse(line.as_bytes());
    assert_eq!(table.get(0).unwrap(), "a".repeat(59));
  }

  #[test]
  fn load_reads_file_and_rejects_empty() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"background\nperson").unwrap();
    let table = LabelTable::load(file.path()).unwrap();
    assert_eq!(table.iter().collect::<Vec<_>>(), vec!["background", "person"]);

    let empty = tempfile::NamedTempFile::new().unwrap();
    assert!(matches!(
      LabelTable::load(empty.path()),
      Err(LabelError::Empty(_))
    ));
  }

  #[test]
  fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      LabelTable::load(dir.path().join("labels.txt")),
      Err(LabelError::Io { .. })
    ));
  }

  #[test]
  fn oversized_file_is_rejected() {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(LABEL_FILE_MAX_BYTES + 1).unwrap();
    assert!(matches!(
      LabelTable::load(file.path()),
      Err(LabelError::TooLarge { .. })
    ));
  }
}
