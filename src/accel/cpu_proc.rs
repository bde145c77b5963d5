// 该文件是 Xunshan （巡山） 项目的一部分。
// src/accel/cpu_proc.rs - CPU 上的图像预处理设备
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

use tracing::debug;

use super::{
  AcceleratorError, DataType, Device, Executable, JOB_ERROR_BUFFER, JOB_ERROR_INVALID,
  ModelSource, PARAM_INPUT_CROP, PARAM_INPUT_FORMAT, PARAM_INPUT_SIZE, PARAM_OUTPUT_FORMAT,
  PARAM_OUTPUT_SIZE, ParamMap, TensorSpec,
};
use crate::frame::{PixelFormat, RGB_CHANNELS, Resolution};
use crate::model::CropRect;

pub const CPU_PROC_DEVICE: &str = "cpu-proc";

/// 把 YUV 相机帧转换、裁剪、缩放为 RGB 的预处理设备
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuProcDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RgbLayout {
  Interleaved,
  Planar,
}

struct CpuProc {
  input_format: PixelFormat,
  input: Resolution,
  layout: RgbLayout,
  output: Resolution,
  inputs: [TensorSpec; 1],
  outputs: [TensorSpec; 1],
}

impl Device for CpuProcDevice {
  fn name(&self) -> &str {
    CPU_PROC_DEVICE
  }

  fn probe(&self) -> Result<(), AcceleratorError> {
    Ok(())
  }

  fn load(
    &self,
    source: &ModelSource,
    params: &ParamMap,
  ) -> Result<Box<dyn Executable>, AcceleratorError> {
    if let ModelSource::File(path) = source {
      return Err(AcceleratorError::load(
        path.display().to_string(),
        "cpu-proc 只接受参数描述的内置变换",
      ));
    }

    let input_format = params
      .get_str(PARAM_INPUT_FORMAT)
      .ok_or_else(|| missing(PARAM_INPUT_FORMAT))?
      .parse::<PixelFormat>()
      .map_err(|e| AcceleratorError::load(CPU_PROC_DEVICE, e))?;
    let input = size_param(params, PARAM_INPUT_SIZE)?;
    let output = size_param(params, PARAM_OUTPUT_SIZE)?;
    let layout = match params.get_str(PARAM_OUTPUT_FORMAT).unwrap_or("rgb-interleaved") {
      "rgb-interleaved" => RgbLayout::Interleaved,
      "rgb-planar" => RgbLayout::Planar,
      other => {
        return Err(AcceleratorError::load(
          CPU_PROC_DEVICE,
          format!("不支持的输出格式 {}", other),
        ));
      }
    };

    let pitch = input_format.frame_size(input);
    let input_spec = TensorSpec {
      name: format!("input.{}", input_format),
      dims: vec![1, pitch],
      data_type: DataType::UInt8,
      pitch,
    };
    let (ow, oh) = (output.width as usize, output.height as usize);
    let output_spec = TensorSpec::packed(
      "output.rgb",
      match layout {
        RgbLayout::Interleaved => vec![1, oh, ow, RGB_CHANNELS],
        RgbLayout::Planar => vec![1, RGB_CHANNELS, oh, ow],
      },
      DataType::UInt8,
    );

    debug!(
      "cpu-proc: {} {} -> {:?} {}",
      input_format, input, layout, output
    );

    Ok(Box::new(CpuProc {
      input_format,
      input,
      layout,
      output,
      inputs: [input_spec],
      outputs: [output_spec],
    }))
  }
}

fn missing(key: &str) -> AcceleratorError {
  AcceleratorError::load(CPU_PROC_DEVICE, format!("缺少参数 {}", key))
}

fn size_param(params: &ParamMap, key: &str) -> Result<Resolution, AcceleratorError> {
  let [w, h] = params.get_int_arr2(key).ok_or_else(|| missing(key))?;
  if w <= 0 || h <= 0 || w > u32::MAX as i64 || h > u32::MAX as i64 {
    return Err(AcceleratorError::load(
      CPU_PROC_DEVICE,
      format!("参数 {} 的尺寸 {}x{} 无效", key, w, h),
    ));
  }
  Ok(Resolution::new(w as u32, h as u32))
}

impl CpuProc {
  fn crop(&self, params: &ParamMap) -> Result<CropRect, AcceleratorError> {
    let Some([x, y, w, h]) = params.get_int_arr4(PARAM_INPUT_CROP) else {
      return Ok(CropRect {
        x: 0,
        y: 0,
        width: self.input.width,
        height: self.input.height,
      });
    };
    let invalid = || {
      AcceleratorError::job(
        JOB_ERROR_INVALID,
        format!("裁剪区域 ({}, {}, {}, {}) 超出输入 {}", x, y, w, h, self.input),
      )
    };
    if x < 0 || y < 0 || w <= 0 || h <= 0 {
      return Err(invalid());
    }
    let rect = CropRect {
      x: u32::try_from(x).map_err(|_| invalid())?,
      y: u32::try_from(y).map_err(|_| invalid())?,
      width: u32::try_from(w).map_err(|_| invalid())?,
      height: u32::try_from(h).map_err(|_| invalid())?,
    };
    if !rect.fits_within(self.input) {
      return Err(invalid());
    }
    Ok(rect)
  }

  #[inline]
  fn sample(&self, frame: &[u8], x: usize, y: usize) -> (u8, u8, u8) {
    let [luma, u, v] = self.input_format.yuv_offsets(self.input, x, y);
    (frame[luma], frame[u], frame[v])
  }
}

impl Executable for CpuProc {
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
    params: &ParamMap,
  ) -> Result<(), AcceleratorError> {
    let (frame, out) = match (inputs, outputs) {
      ([frame], [out]) => (*frame, &mut **out),
      _ => {
        return Err(AcceleratorError::job(
          JOB_ERROR_INVALID,
          "cpu-proc 需要一个输入和一个输出",
        ));
      }
    };
    if frame.len() < self.inputs[0].pitch || out.len() < self.outputs[0].pitch {
      return Err(AcceleratorError::job(
        JOB_ERROR_BUFFER,
        format!(
          "缓冲区过小: 输入 {}/{} 字节, 输出 {}/{} 字节",
          frame.len(),
          self.inputs[0].pitch,
          out.len(),
          self.outputs[0].pitch
        ),
      ));
    }

    let crop = self.crop(params)?;
    let (ow, oh) = (self.output.width as usize, self.output.height as usize);
    let plane = ow * oh;

    for oy in 0..oh {
      let sy = crop.y as usize + oy * crop.height as usize / oh;
      for ox in 0..ow {
        let sx = crop.x as usize + ox * crop.width as usize / ow;
        let (y, u, v) = self.sample(frame, sx, sy);
        let rgb = yuv_to_rgb(y, u, v);
        let pixel = oy * ow + ox;
        match self.layout {
          RgbLayout::Interleaved => {
            out[pixel * RGB_CHANNELS..(pixel + 1) * RGB_CHANNELS].copy_from_slice(&rgb)
          }
          RgbLayout::Planar => {
            out[pixel] = rgb[0];
            out[plane + pixel] = rgb[1];
            out[2 * plane + pixel] = rgb[2];
          }
        }
      }
    }
    Ok(())
  }
}

/// BT.601 全范围 YUV 转 RGB
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
  let y = y as f32;
  let u = u as f32 - 128.0;
  let v = v as f32 - 128.0;

  let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
  let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
  let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
  [r, g, b]
}
