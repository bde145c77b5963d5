// 该文件是 Xunshan （巡山） 项目的一部分。
// src/accel.rs - 推理加速器会话
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

//! # 加速器会话
//!
//! 会话持有所有计算设备与已加载的模型。每个模型声明自己的输入/输出张量，
//! 张量绑定到 [`BufferPool`] 中的共享缓冲区后，即可构造一个可重复提交的
//! [`JobRequest`]。任务同步执行：`run_job` 返回时输出已经写入缓冲区。
//!
//! 输出写在缓冲区游标处并推进游标，所以每次执行前调用方需要先 `rewind`。

mod cpu_proc;
#[cfg(feature = "rknpu")]
mod rknpu_device;
#[cfg(feature = "tract")]
mod tract_device;

pub use self::cpu_proc::{CPU_PROC_DEVICE, CpuProcDevice, yuv_to_rgb};
#[cfg(feature = "rknpu")]
pub use self::rknpu_device::{RKNPU_DEVICE, RknpuDevice};
#[cfg(feature = "tract")]
pub use self::tract_device::{TRACT_DEVICE, TractDevice};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::buffer::{BufferError, BufferId, BufferPool, SharedBuffer};
use crate::frame::{RGB_CHANNELS, Resolution};
use crate::model::SsdLayout;

pub const PARAM_INPUT_FORMAT: &str = "image.input.format";
pub const PARAM_INPUT_SIZE: &str = "image.input.size";
pub const PARAM_OUTPUT_FORMAT: &str = "image.output.format";
pub const PARAM_OUTPUT_SIZE: &str = "image.output.size";
pub const PARAM_INPUT_CROP: &str = "image.input.crop";
pub const PARAM_DETECTION_MAX: &str = "detection.max";

/// 参数非法
pub const JOB_ERROR_INVALID: i32 = 22;
/// 缓冲区不可用
pub const JOB_ERROR_BUFFER: i32 = 5;
/// 设备运行时报错
pub const JOB_ERROR_RUNTIME: i32 = 1;

#[derive(Error, Debug)]
pub enum AcceleratorError {
  #[error("无法连接推理运行时: {0}")]
  Connection(String),
  #[error("加载模型 {model} 失败: {message}")]
  ModelLoad { model: String, message: String },
  #[error("配置错误: {0}")]
  Configuration(String),
  #[error("任务执行失败 (错误码 {code}): {message}")]
  JobExecution { message: String, code: i32 },
  #[error("缓冲区错误: {0}")]
  Buffer(#[from] BufferError),
}

impl AcceleratorError {
  pub fn job(code: i32, message: impl Into<String>) -> Self {
    AcceleratorError::JobExecution {
      message: message.into(),
      code,
    }
  }

  pub fn load(model: impl Into<String>, message: impl Into<String>) -> Self {
    AcceleratorError::ModelLoad {
      model: model.into(),
      message: message.into(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
  UInt8,
  Float32,
}

impl DataType {
  pub fn size(&self) -> usize {
    match self {
      DataType::UInt8 => 1,
      DataType::Float32 => 4,
    }
  }
}

/// 模型声明的张量槽位
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
  pub name: String,
  pub dims: Vec<usize>,
  pub data_type: DataType,
  /// 实际字节跨度，可能大于元素数乘元素大小
  pub pitch: usize,
}

impl TensorSpec {
  /// 无填充的紧凑张量
  pub fn packed(name: &str, dims: Vec<usize>, data_type: DataType) -> Self {
    let pitch = dims.iter().product::<usize>() * data_type.size();
    Self {
      name: name.to_string(),
      dims,
      data_type,
      pitch,
    }
  }
}

/// SSD 检测模型的张量声明：一个 NHWC 的 RGB 输入，四个浮点输出
#[derive(Debug, Clone)]
pub struct DetectorSpecs {
  pub input: Resolution,
  pub layout: SsdLayout,
  pub inputs: Vec<TensorSpec>,
  pub outputs: Vec<TensorSpec>,
}

impl DetectorSpecs {
  /// 从 `image.input.size` 和 `detection.max` 参数构造
  pub fn from_params(device: &str, params: &ParamMap) -> Result<Self, AcceleratorError> {
    let [w, h] = params
      .get_int_arr2(PARAM_INPUT_SIZE)
      .ok_or_else(|| AcceleratorError::load(device, format!("缺少参数 {}", PARAM_INPUT_SIZE)))?;
    if w <= 0 || h <= 0 || w > u32::MAX as i64 || h > u32::MAX as i64 {
      return Err(AcceleratorError::load(
        device,
        format!("输入尺寸 {}x{} 无效", w, h),
      ));
    }
    let layout = match params.get_int(PARAM_DETECTION_MAX) {
      Some(n) if n > 0 => SsdLayout::new(n as usize),
      Some(n) => {
        return Err(AcceleratorError::load(
          device,
          format!("最大检测数 {} 无效", n),
        ));
      }
      None => SsdLayout::default(),
    };

    let input = Resolution::new(w as u32, h as u32);
    let image = TensorSpec::packed(
      "image",
      vec![1, h as usize, w as usize, RGB_CHANNELS],
      DataType::UInt8,
    );
    let outputs = SsdLayout::OUTPUT_NAMES
      .iter()
      .zip(layout.output_dims())
      .map(|(name, dims)| TensorSpec::packed(name, dims, DataType::Float32))
      .collect();
    Ok(Self {
      input,
      layout,
      inputs: vec![image],
      outputs,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
  Str(String),
  Int(i64),
  IntArr2([i64; 2]),
  IntArr4([i64; 4]),
}

/// 模型或任务的键值参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamMap {
  entries: BTreeMap<String, ParamValue>,
}

impl ParamMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_str(&mut self, key: &str, value: &str) -> &mut Self {
    self
      .entries
      .insert(key.to_string(), ParamValue::Str(value.to_string()));
    self
  }

  pub fn set_int(&mut self, key: &str, value: i64) -> &mut Self {
    self.entries.insert(key.to_string(), ParamValue::Int(value));
    self
  }

  pub fn set_int_arr2(&mut self, key: &str, a: i64, b: i64) -> &mut Self {
    self
      .entries
      .insert(key.to_string(), ParamValue::IntArr2([a, b]));
    self
  }

  pub fn set_int_arr4(&mut self, key: &str, a: i64, b: i64, c: i64, d: i64) -> &mut Self {
    self
      .entries
      .insert(key.to_string(), ParamValue::IntArr4([a, b, c, d]));
    self
  }

  pub fn get(&self, key: &str) -> Option<&ParamValue> {
    self.entries.get(key)
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    match self.entries.get(key) {
      Some(ParamValue::Str(s)) => Some(s),
      _ => None,
    }
  }

  pub fn get_int(&self, key: &str) -> Option<i64> {
    match self.entries.get(key) {
      Some(ParamValue::Int(v)) => Some(*v),
      _ => None,
    }
  }

  pub fn get_int_arr2(&self, key: &str) -> Option<[i64; 2]> {
    match self.entries.get(key) {
      Some(ParamValue::IntArr2(v)) => Some(*v),
      _ => None,
    }
  }

  pub fn get_int_arr4(&self, key: &str) -> Option<[i64; 4]> {
    match self.entries.get(key) {
      Some(ParamValue::IntArr4(v)) => Some(*v),
      _ => None,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// 模型来源：模型文件，或只由参数描述的内置变换
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
  File(PathBuf),
  Builtin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
  /// 断开连接时随会话一起销毁
  Private,
  /// 可被其他会话引用
  Public,
}

/// 计算设备
pub trait Device {
  fn name(&self) -> &str;

  /// 检查设备是否可用
  fn probe(&self) -> Result<(), AcceleratorError>;

  fn load(
    &self,
    source: &ModelSource,
    params: &ParamMap,
  ) -> Result<Box<dyn Executable>, AcceleratorError>;
}

/// 已加载到设备上的模型
pub trait Executable {
  fn input_specs(&self) -> &[TensorSpec];
  fn output_specs(&self) -> &[TensorSpec];

  /// 同步执行；`outputs[i]` 的长度恰为第 i 个输出的 pitch
  fn execute(
    &mut self,
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
    params: &ParamMap,
  ) -> Result<(), AcceleratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDirection {
  Input,
  Output,
}

/// 模型的一个张量槽位，以及它绑定的共享缓冲区
#[derive(Debug, Clone)]
pub struct Tensor {
  model: ModelId,
  direction: TensorDirection,
  slot: usize,
  spec: TensorSpec,
  buffer: Option<BufferId>,
}

impl Tensor {
  pub fn model(&self) -> ModelId {
    self.model
  }

  pub fn direction(&self) -> TensorDirection {
    self.direction
  }

  pub fn slot(&self) -> usize {
    self.slot
  }

  pub fn spec(&self) -> &TensorSpec {
    &self.spec
  }

  pub fn pitch(&self) -> usize {
    self.spec.pitch
  }

  pub fn buffer(&self) -> Option<BufferId> {
    self.buffer
  }

  /// 绑定共享缓冲区，每个槽位只能绑定一次，且缓冲区大小必须等于 pitch
  pub fn bind(&mut self, buffer: &SharedBuffer) -> Result<(), AcceleratorError> {
    if let Some(existing) = self.buffer {
      return Err(AcceleratorError::Configuration(format!(
        "张量 {} 已绑定缓冲区 {:?}",
        self.spec.name, existing
      )));
    }
    if buffer.is_released() {
      return Err(BufferError::Released(buffer.label().to_string()).into());
    }
    if buffer.len() != self.spec.pitch {
      return Err(AcceleratorError::Configuration(format!(
        "张量 {} 的 pitch 为 {} 字节, 缓冲区 {} 为 {} 字节",
        self.spec.name,
        self.spec.pitch,
        buffer.label(),
        buffer.len()
      )));
    }
    debug!("张量 {} 绑定到缓冲区 {}", self.spec.name, buffer.label());
    self.buffer = Some(buffer.id());
    Ok(())
  }

  /// 校验 pitch 与期望的字节数一致
  pub fn expect_pitch(&self, expected: usize) -> Result<(), AcceleratorError> {
    if self.spec.pitch != expected {
      return Err(AcceleratorError::Configuration(format!(
        "张量 {} 的 pitch 为 {} 字节, 期望 {} 字节",
        self.spec.name, self.spec.pitch, expected
      )));
    }
    Ok(())
  }
}

/// 绑定好缓冲区的任务描述，构造一次，反复提交
#[derive(Debug, Clone)]
pub struct JobRequest {
  name: String,
  model: ModelId,
  inputs: Vec<BufferId>,
  outputs: Vec<BufferId>,
  output_pitches: Vec<usize>,
  params: ParamMap,
}

impl JobRequest {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn model(&self) -> ModelId {
    self.model
  }

  pub fn inputs(&self) -> &[BufferId] {
    &self.inputs
  }

  pub fn outputs(&self) -> &[BufferId] {
    &self.outputs
  }

  pub fn params(&self) -> &ParamMap {
    &self.params
  }
}

struct LoadedModel {
  name: String,
  device: String,
  access: AccessMode,
  executable: Box<dyn Executable>,
}

/// 当前编译进来的全部计算设备
pub fn builtin_devices() -> Vec<Box<dyn Device>> {
  #[allow(unused_mut)]
  let mut devices: Vec<Box<dyn Device>> = vec![Box::new(CpuProcDevice)];
  #[cfg(feature = "rknpu")]
  devices.push(Box::new(RknpuDevice::default()));
  #[cfg(feature = "tract")]
  devices.push(Box::new(TractDevice));
  devices
}

pub struct Session {
  devices: Vec<Box<dyn Device>>,
  models: Vec<Option<LoadedModel>>,
  connected: bool,
  deadline: Option<Duration>,
  overruns: u64,
}

impl fmt::Debug for Session {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Session")
      .field("devices", &self.list_devices())
      .field("models", &self.models.iter().flatten().count())
      .field("connected", &self.connected)
      .field("overruns", &self.overruns)
      .finish()
  }
}

impl Session {
  /// 探测给定设备，至少有一个可用才算连接成功
  pub fn connect(candidates: Vec<Box<dyn Device>>) -> Result<Self, AcceleratorError> {
    let mut devices = Vec::with_capacity(candidates.len());
    for device in candidates {
      match device.probe() {
        Ok(()) => {
          info!("发现计算设备: {}", device.name());
          devices.push(device);
        }
        Err(e) => warn!("计算设备 {} 不可用: {}", device.name(), e),
      }
    }

    if devices.is_empty() {
      return Err(AcceleratorError::Connection(
        "没有可用的计算设备".to_string(),
      ));
    }

    Ok(Self {
      devices,
      models: Vec::new(),
      connected: true,
      deadline: None,
      overruns: 0,
    })
  }

  /// 设置软超时：超时的任务只记录警告，不会被中断
  pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
    self.deadline = deadline;
    self
  }

  pub fn list_devices(&self) -> Vec<&str> {
    self.devices.iter().map(|d| d.name()).collect()
  }

  pub fn overruns(&self) -> u64 {
    self.overruns
  }

  pub fn is_connected(&self) -> bool {
    self.connected
  }

  fn ensure_connected(&self) -> Result<(), AcceleratorError> {
    if self.connected {
      Ok(())
    } else {
      Err(AcceleratorError::Connection("会话已断开".to_string()))
    }
  }

  pub fn load_model(
    &mut self,
    source: ModelSource,
    device: &str,
    access: AccessMode,
    name: &str,
    params: &ParamMap,
  ) -> Result<ModelId, AcceleratorError> {
    self.ensure_connected()?;
    let dev = self
      .devices
      .iter()
      .find(|d| d.name() == device)
      .ok_or_else(|| AcceleratorError::load(name, format!("找不到计算设备 {}", device)))?;

    let now = Instant::now();
    let executable = dev.load(&source, params)?;
    info!(
      "在 {} 上加载模型 {}，耗时 {:.2?}",
      device,
      name,
      now.elapsed()
    );
    debug!(
      "模型 {} 输入: {:?}, 输出: {:?}",
      name,
      executable.input_specs(),
      executable.output_specs()
    );

    let id = ModelId(self.models.len());
    self.models.push(Some(LoadedModel {
      name: name.to_string(),
      device: device.to_string(),
      access,
      executable,
    }));
    Ok(id)
  }

  fn model(&self, id: ModelId) -> Result<&LoadedModel, AcceleratorError> {
    self
      .models
      .get(id.0)
      .and_then(Option::as_ref)
      .ok_or_else(|| AcceleratorError::Configuration(format!("未知的模型 {:?}", id)))
  }

  pub fn model_name(&self, id: ModelId) -> Option<&str> {
    self.model(id).ok().map(|m| m.name.as_str())
  }

  /// 查询模型的输入、输出张量槽位
  pub fn declare_tensors(
    &self,
    id: ModelId,
  ) -> Result<(Vec<Tensor>, Vec<Tensor>), AcceleratorError> {
    let model = self.model(id)?;
    let make = |direction, specs: &[TensorSpec]| {
      specs
        .iter()
        .enumerate()
        .map(|(slot, spec)| Tensor {
          model: id,
          direction,
          slot,
          spec: spec.clone(),
          buffer: None,
        })
        .collect::<Vec<_>>()
    };
    Ok((
      make(TensorDirection::Input, model.executable.input_specs()),
      make(TensorDirection::Output, model.executable.output_specs()),
    ))
  }

  pub fn create_job(
    &self,
    name: &str,
    id: ModelId,
    inputs: &[Tensor],
    outputs: &[Tensor],
    params: Option<ParamMap>,
  ) -> Result<JobRequest, AcceleratorError> {
    let model = self.model(id)?;
    check_tensors(&model.name, id, TensorDirection::Input, inputs, model.executable.input_specs())?;
    check_tensors(&model.name, id, TensorDirection::Output, outputs, model.executable.output_specs())?;

    let bound = |tensors: &[Tensor]| {
      tensors
        .iter()
        .map(|t| {
          t.buffer.ok_or_else(|| {
            AcceleratorError::Configuration(format!("张量 {} 尚未绑定缓冲区", t.spec.name))
          })
        })
        .collect::<Result<Vec<_>, _>>()
    };

    Ok(JobRequest {
      name: name.to_string(),
      model: id,
      inputs: bound(inputs)?,
      outputs: bound(outputs)?,
      output_pitches: outputs.iter().map(Tensor::pitch).collect(),
      params: params.unwrap_or_default(),
    })
  }

  /// 同步执行任务，返回时输出已写入绑定的缓冲区
  pub fn run_job(&mut self, job: &JobRequest, pool: &mut BufferPool) -> Result<(), AcceleratorError> {
    self.ensure_connected()?;
    let deadline = self.deadline;
    let model = self
      .models
      .get_mut(job.model.0)
      .and_then(Option::as_mut)
      .ok_or_else(|| AcceleratorError::job(JOB_ERROR_INVALID, format!("模型 {:?} 已卸载", job.model)))?;

    let (inputs, outputs) = pool.split_for_job(&job.inputs, &job.outputs)?;
    let inputs = inputs
      .into_iter()
      .map(SharedBuffer::as_slice)
      .collect::<Result<Vec<_>, _>>()?;
    let mut outputs = outputs
      .into_iter()
      .zip(&job.output_pitches)
      .map(|(buffer, pitch)| buffer.claim_at_cursor(*pitch))
      .collect::<Result<Vec<_>, _>>()?;

    let now = Instant::now();
    model
      .executable
      .execute(&inputs, &mut outputs, &job.params)?;
    let elapsed = now.elapsed();
    debug!("任务 {} 在 {} 上完成，耗时 {:.2?}", job.name, model.device, elapsed);

    match deadline {
      Some(limit) if elapsed > limit => {
        self.overruns += 1;
        warn!(
          "任务 {} 耗时 {:.2?}，超过期限 {:.2?} (累计 {} 次)",
          job.name, elapsed, limit, self.overruns
        );
      }
      _ => {}
    }
    Ok(())
  }

  /// 断开连接，私有模型随之销毁
  pub fn disconnect(&mut self) {
    if !self.connected {
      return;
    }
    let mut private = 0;
    let mut public = 0;
    for model in self.models.iter_mut() {
      if let Some(loaded) = model.take() {
        match loaded.access {
          AccessMode::Private => private += 1,
          AccessMode::Public => public += 1,
        }
      }
    }
    self.connected = false;
    info!("断开推理会话，释放 {} 个私有模型，{} 个公共模型", private, public);
  }
}

impl Drop for Session {
  fn drop(&mut self) {
    self.disconnect();
  }
}

fn check_tensors(
  model: &str,
  id: ModelId,
  direction: TensorDirection,
  tensors: &[Tensor],
  specs: &[TensorSpec],
) -> Result<(), AcceleratorError> {
  if tensors.len() != specs.len() {
    return Err(AcceleratorError::Configuration(format!(
      "模型 {} 需要 {} 个{:?}张量, 实际提供 {} 个",
      model,
      specs.len(),
      direction,
      tensors.len()
    )));
  }
  for (n, tensor) in tensors.iter().enumerate() {
    if tensor.model != id || tensor.direction != direction || tensor.slot != n {
      return Err(AcceleratorError::Configuration(format!(
        "张量 {} 不属于模型 {} 的第 {} 个{:?}槽位",
        tensor.spec.name, model, n, direction
      )));
    }
  }
  Ok(())
}
