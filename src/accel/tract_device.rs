// 该文件是 Xunshan （巡山） 项目的一部分。
// src/accel/tract_device.rs - 基于 tract 的 CPU 检测模型设备
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

use tracing::{debug, info};
use tract_onnx::prelude::*;

use super::{
  AcceleratorError, DetectorSpecs, Device, Executable, JOB_ERROR_BUFFER, JOB_ERROR_RUNTIME,
  ModelSource, ParamMap, TensorSpec,
};
use crate::frame::{RGB_CHANNELS, Resolution};
use crate::model::SSD_OUTPUT_COUNT;

pub const TRACT_DEVICE: &str = "tract-cpu";

/// 在 CPU 上运行 ONNX 格式 SSD 检测模型
#[derive(Debug, Default, Clone, Copy)]
pub struct TractDevice;

struct TractModel {
  plan: TypedRunnableModel<TypedModel>,
  input: Resolution,
  inputs: Vec<TensorSpec>,
  outputs: Vec<TensorSpec>,
}

impl Device for TractDevice {
  fn name(&self) -> &str {
    TRACT_DEVICE
  }

  fn probe(&self) -> Result<(), AcceleratorError> {
    Ok(())
  }

  fn load(
    &self,
    source: &ModelSource,
    params: &ParamMap,
  ) -> Result<Box<dyn Executable>, AcceleratorError> {
    let ModelSource::File(path) = source else {
      return Err(AcceleratorError::load(TRACT_DEVICE, "需要模型文件"));
    };
    let model = path.display().to_string();
    let specs = DetectorSpecs::from_params(TRACT_DEVICE, params)?;
    let (w, h) = (specs.input.width as usize, specs.input.height as usize);

    info!("加载 ONNX 模型: {}", model);
    let load_err = |e: TractError| AcceleratorError::load(&model, e.to_string());
    let plan = tract_onnx::onnx()
      .model_for_path(path)
      .map_err(load_err)?
      .with_input_fact(
        0,
        InferenceFact::dt_shape(u8::datum_type(), tvec!(1, h, w, RGB_CHANNELS)),
      )
      .map_err(load_err)?
      .into_optimized()
      .map_err(load_err)?
      .into_runnable()
      .map_err(load_err)?;

    Ok(Box::new(TractModel {
      plan,
      input: specs.input,
      inputs: specs.inputs,
      outputs: specs.outputs,
    }))
  }
}

impl Executable for TractModel {
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

    let runtime = |e: TractError| AcceleratorError::job(JOB_ERROR_RUNTIME, e.to_string());
    let (w, h) = (self.input.width as usize, self.input.height as usize);
    let tensor = tract_ndarray::Array4::from_shape_vec((1, h, w, RGB_CHANNELS), image.to_vec())
      .map_err(|e| AcceleratorError::job(JOB_ERROR_BUFFER, e.to_string()))?
      .into_tensor();

    let result = self.plan.run(tvec!(tensor.into())).map_err(runtime)?;
    if result.len() < SSD_OUTPUT_COUNT {
      return Err(AcceleratorError::job(
        JOB_ERROR_RUNTIME,
        format!("模型只产生了 {} 个输出", result.len()),
      ));
    }

    for (value, out) in result.iter().zip(outputs.iter_mut()) {
      let floats = value.cast_to::<f32>().map_err(runtime)?;
      let floats = floats.as_slice::<f32>().map_err(runtime)?;
      let bytes: &[u8] = bytemuck::cast_slice(floats);
      let n = bytes.len().min(out.len());
      out[..n].copy_from_slice(&bytes[..n]);
      out[n..].fill(0);
    }
    debug!("tract 推理完成");
    Ok(())
  }
}
