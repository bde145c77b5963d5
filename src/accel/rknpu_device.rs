// 该文件是 Xunshan （巡山） 项目的一部分。
// src/accel/rknpu_device.rs - RKNPU 检测模型设备
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

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};

use super::{
  AcceleratorError, DetectorSpecs, Device, Executable, JOB_ERROR_BUFFER, JOB_ERROR_RUNTIME,
  ModelSource, ParamMap, TensorSpec,
};
use crate::model::{SSD_OUTPUT_COUNT, SsdLayout};

pub const RKNPU_DEVICE: &str = "rknpu";
const RKNPU_NUM_INPUTS: u32 = 1;

/// 运行 RKNN 格式 SSD 检测模型的 NPU
#[derive(Debug, Default, Clone, Copy)]
pub struct RknpuDevice;

struct RknpuModel {
  context: Context,
  layout: SsdLayout,
  inputs: Vec<TensorSpec>,
  outputs: Vec<TensorSpec>,
}

impl Device for RknpuDevice {
  fn name(&self) -> &str {
    RKNPU_DEVICE
  }

  fn probe(&self) -> Result<(), AcceleratorError> {
    const NPU_NODES: [&str; 2] = ["/dev/rknpu", "/dev/dri/renderD129"];
    if NPU_NODES.iter().any(|p| std::path::Path::new(p).exists()) {
      Ok(())
    } else {
      Err(AcceleratorError::Connection("找不到 NPU 设备节点".to_string()))
    }
  }

  fn load(
    &self,
    source: &ModelSource,
    params: &ParamMap,
  ) -> Result<Box<dyn Executable>, AcceleratorError> {
    let ModelSource::File(path) = source else {
      return Err(AcceleratorError::load(RKNPU_DEVICE, "需要模型文件"));
    };
    let model = path.display().to_string();
    let specs = DetectorSpecs::from_params(RKNPU_DEVICE, params)?;

    info!("加载模型文件: {}", model);
    let data = std::fs::read(path).map_err(|e| AcceleratorError::load(&model, e.to_string()))?;
    debug!(
      "模型文件大小: {:.2} MB",
      data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&data, InitFlags::default())
      .map_err(|e| AcceleratorError::load(&model, e.to_string()))?;

    let num_inputs = context
      .num_inputs()
      .map_err(|e| AcceleratorError::load(&model, format!("无法获取输入数量: {}", e)))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| AcceleratorError::load(&model, format!("无法获取输出数量: {}", e)))?;
    if num_inputs != RKNPU_NUM_INPUTS || num_outputs as usize != SSD_OUTPUT_COUNT {
      error!(
        "预期模型有 {} 个输入 {} 个输出, 实际为 {} / {}",
        RKNPU_NUM_INPUTS, SSD_OUTPUT_COUNT, num_inputs, num_outputs
      );
      return Err(AcceleratorError::load(
        &model,
        format!("输入/输出数量 {}/{} 不是 SSD 模型", num_inputs, num_outputs),
      ));
    }

    Ok(Box::new(RknpuModel {
      context,
      layout: specs.layout,
      inputs: specs.inputs,
      outputs: specs.outputs,
    }))
  }
}

impl Executable for RknpuModel {
  fn input_specs(&self) -> &[TensorSpec] {
    &self.inputs
  }

  fn output_specs(&self) -> &[TensorSpec] {
    &self.outputs
  }

  fn execute(
    &mut self,
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
    _params: &ParamMap,
  ) -> Result<(), AcceleratorError> {
    let pitch = self.inputs[0].pitch;
    let image = match inputs {
      [image] if image.len() >= pitch => &image[..pitch],
      _ => return Err(AcceleratorError::job(JOB_ERROR_BUFFER, "检测模型输入缓冲区无效")),
    };
    if outputs.len() != SSD_OUTPUT_COUNT {
      return Err(AcceleratorError::job(JOB_ERROR_BUFFER, "检测模型需要四个输出缓冲区"));
    }

    let runtime = |e: rknpu::Error| AcceleratorError::job(JOB_ERROR_RUNTIME, e.to_string());

    debug!("设置模型输入");
    self
      .context
      .set_input(0, image, TensorFormat::NHWC, TensorType::UInt8)
      .map_err(runtime)?;
    debug!("执行模型推理");
    self.context.run().map_err(runtime)?;
    let result = self.context.get_outputs().map_err(runtime)?;

    for (i, out) in outputs.iter_mut().enumerate() {
      let values = result.get_f32(i).map_err(runtime)?;
      let bytes: &[u8] = bytemuck::cast_slice(&values[..]);
      let n = bytes.len().min(out.len());
      out[..n].copy_from_slice(&bytes[..n]);
      out[n..].fill(0);
    }
    debug!("模型输出已写入 ({} 个检测槽位)", self.layout.max_detections);
    Ok(())
  }
}
