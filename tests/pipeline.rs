// 该文件是 Xunshan （巡山） 项目的一部分。
// tests/pipeline.rs - 检测流水线集成测试
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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgb, RgbImage};
use tempfile::TempDir;
use url::Url;

use xunshan::accel::{
  AcceleratorError, CPU_PROC_DEVICE, CpuProcDevice, DetectorSpecs, Device, Executable,
  JOB_ERROR_RUNTIME, ModelSource, ParamMap, TensorSpec,
};
use xunshan::config::{OverlayKind, PipelineConfig};
use xunshan::frame::{Frame, PixelFormat, Resolution};
use xunshan::input::{DualStreamSource, FrameProvider, StreamError};
use xunshan::output::{BoxesSink, OverlayBackend};
use xunshan::pipeline::{
  CycleError, CycleStage, DetectionTask, OverlayTask, PipelineContext, SetupError, open_sources,
};
use xunshan::task::Scheduler;

const SCRIPTED_DEVICE: &str = "scripted";
const DETECTOR_INPUT: Resolution = Resolution::new(64, 64);
const HD: Resolution = Resolution::new(320, 240);

/// 一个检测结果：[top, left, bottom, right]，类别，分数
type Item = ([f32; 4], f32, f32);

/// 按脚本输出 SSD 结果的检测设备
struct ScriptedDevice {
  script: Arc<Mutex<Vec<Item>>>,
  /// 加在位置张量 pitch 上的填充字节
  padding: usize,
  fail: Arc<AtomicBool>,
}

struct ScriptedDetector {
  specs: DetectorSpecs,
  inputs: Vec<TensorSpec>,
  outputs: Vec<TensorSpec>,
  script: Arc<Mutex<Vec<Item>>>,
  fail: Arc<AtomicBool>,
}

/// 包装 cpu-proc，可以填充输出 pitch，也可以让任务失败
struct FlakyProcDevice {
  padding: usize,
  fail: Arc<AtomicBool>,
}

struct FlakyProc {
  inner: Box<dyn Executable>,
  outputs: Vec<TensorSpec>,
  fail: Arc<AtomicBool>,
}

impl Device for ScriptedDevice {
  fn name(&self) -> &str {
    SCRIPTED_DEVICE
  }

  fn probe(&self) -> Result<(), AcceleratorError> {
    Ok(())
  }

  fn load(
    &self,
    _source: &ModelSource,
    params: &ParamMap,
  ) -> Result<Box<dyn Executable>, AcceleratorError> {
    let specs = DetectorSpecs::from_params(SCRIPTED_DEVICE, params)?;
    let inputs = specs.inputs.clone();
    let mut outputs = specs.outputs.clone();
    outputs[0].pitch += self.padding;
    Ok(Box::new(ScriptedDetector {
      specs,
      inputs,
      outputs,
      script: Arc::clone(&self.script),
      fail: Arc::clone(&self.fail),
    }))
  }
}

impl Executable for ScriptedDetector {
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
    if self.fail.load(Ordering::SeqCst) {
      return Err(AcceleratorError::job(JOB_ERROR_RUNTIME, "npu timeout"));
    }
    assert_eq!(inputs[0].len(), self.specs.input.rgb_size());
    let max = self.specs.layout.max_detections;
    let items = self.script.lock().unwrap();
    let mut locations = vec![0f32; 4 * max];
    let mut classes = vec![0f32; max];
    let mut scores = vec![0f32; max];
    for (i, (bbox, class, score)) in items.iter().enumerate() {
      locations[4 * i..4 * i + 4].copy_from_slice(bbox);
      classes[i] = *class;
      scores[i] = *score;
    }
    let count = [items.len() as f32];
    for (out, values) in outputs
      .iter_mut()
      .zip([&locations[..], &classes[..], &scores[..], &count[..]])
    {
      out.copy_from_slice(bytemuck::cast_slice(values));
    }
    Ok(())
  }
}

impl Device for FlakyProcDevice {
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
    let inner = CpuProcDevice.load(source, params)?;
    let mut outputs = inner.output_specs().to_vec();
    outputs[0].pitch += self.padding;
    Ok(Box::new(FlakyProc {
      inner,
      outputs,
      fail: Arc::clone(&self.fail),
    }))
  }
}

impl Executable for FlakyProc {
  fn input_specs(&self) -> &[TensorSpec] {
    self.inner.input_specs()
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
    if self.fail.load(Ordering::SeqCst) {
      return Err(AcceleratorError::job(JOB_ERROR_RUNTIME, "rga busy"));
    }
    self.inner.execute(inputs, outputs, params)
  }
}

/// 采集总是失败的帧源
struct BrokenCamera {
  resolution: Resolution,
}

impl FrameProvider for BrokenCamera {
  fn name(&self) -> &str {
    "broken"
  }

  fn start(&mut self) -> Result<(), StreamError> {
    Ok(())
  }

  fn latest_frame(&mut self) -> Result<Frame, StreamError> {
    Err(StreamError::Capture {
      source_name: "broken".to_string(),
      message: "device unplugged".to_string(),
    })
  }

  fn release(&mut self, _frame: Frame) -> Result<(), StreamError> {
    Ok(())
  }

  fn stop(&mut self) -> Result<(), StreamError> {
    Ok(())
  }

  fn resolution(&self) -> Resolution {
    self.resolution
  }

  fn pixel_format(&self) -> PixelFormat {
    PixelFormat::Nv12
  }
}

struct Harness {
  _dir: TempDir,
  config: PipelineConfig,
  script: Arc<Mutex<Vec<Item>>>,
  detector_fails: Arc<AtomicBool>,
  preprocess_fails: Arc<AtomicBool>,
}

impl Harness {
  fn new() -> Self {
    let dir = tempfile::tempdir().unwrap();
    let scene = dir.path().join("scene.png");
    RgbImage::from_fn(HD.width, HD.height, |x, y| {
      Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    })
    .save(&scene)
    .unwrap();
    let labels = dir.path().join("labels.txt");
    std::fs::write(&labels, "person\nchair\nbed\n").unwrap();
    let output_dir = dir.path().join("crops");
    let source = Url::parse(&format!("image://{}", scene.display())).unwrap();

    let config = PipelineConfig {
      model: dir.path().join("detector.model"),
      labels,
      detector_input: DETECTOR_INPUT,
      quality: 80,
      threshold: 50,
      hd_resolution: HD,
      chip: SCRIPTED_DEVICE.to_string(),
      source: source.clone(),
      hd_source: source,
      pixel_format: PixelFormat::Nv12,
      buffer_count: 2,
      overlay: OverlayKind::Boxes,
      overlay_output: dir.path().join("boxes.json"),
      overlay_font: None,
      output_dir,
      period: Duration::from_millis(1),
      overlay_period: Duration::from_millis(1),
      max_cycles: None,
      job_deadline: None,
    };
    Self {
      _dir: dir,
      config,
      script: Arc::new(Mutex::new(Vec::new())),
      detector_fails: Arc::new(AtomicBool::new(false)),
      preprocess_fails: Arc::new(AtomicBool::new(false)),
    }
  }

  fn devices(&self, padding: usize) -> Vec<Box<dyn Device>> {
    self.padded_devices(0, padding)
  }

  /// 分别给预处理输出和检测器位置张量加填充
  fn padded_devices(&self, preprocess: usize, detector: usize) -> Vec<Box<dyn Device>> {
    vec![
      Box::new(FlakyProcDevice {
        padding: preprocess,
        fail: Arc::clone(&self.preprocess_fails),
      }),
      Box::new(ScriptedDevice {
        script: Arc::clone(&self.script),
        padding: detector,
        fail: Arc::clone(&self.detector_fails),
      }),
    ]
  }

  fn script(&self, items: &[Item]) {
    *self.script.lock().unwrap() = items.to_vec();
  }

  fn setup(&self) -> PipelineContext {
    let source = open_sources(&self.config).unwrap();
    let overlay = OverlayBackend::Boxes(BoxesSink::new(&self.config.overlay_output));
    PipelineContext::setup(&self.config, self.devices(0), source, Some(overlay)).unwrap()
  }

  fn crop(&self, index: usize) -> PathBuf {
    self.config.output_dir.join(format!("detection_{}.jpg", index))
  }

  fn crop_count(&self) -> usize {
    std::fs::read_dir(&self.config.output_dir)
      .unwrap()
      .filter(|entry| {
        entry
          .as_ref()
          .map(|e| e.file_name().to_string_lossy().starts_with("detection_"))
          .unwrap_or(false)
      })
      .count()
  }
}

fn read_json(path: &Path) -> serde_json::Value {
  serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

const PERSON: Item = ([0.1, 0.1, 0.5, 0.5], 0.0, 0.95);
const CHAIR: Item = ([0.2, 0.3, 0.6, 0.7], 1.0, 0.10);
const BED: Item = ([0.5, 0.5, 0.9, 0.9], 2.0, 0.50);

#[test]
fn empty_scene_writes_nothing() {
  let harness = Harness::new();
  let mut context = harness.setup();

  let report = context.run_cycle().unwrap();
  assert_eq!(report.cycle, 1);
  assert_eq!(report.detections, 0);
  assert_eq!(report.files_written, 0);
  assert_eq!(report.overlay_entries, Some(0));
  assert_eq!(harness.crop_count(), 0);
  assert!(context.overlay_state().unwrap().is_empty());
}

#[test]
fn qualifying_detections_are_saved_and_all_are_published() {
  let harness = Harness::new();
  harness.script(&[PERSON, CHAIR, BED]);
  let mut context = harness.setup();

  let report = context.run_cycle().unwrap();
  assert_eq!(report.detections, 3);
  assert_eq!(report.qualifying, 2);
  assert_eq!(report.files_written, 2);
  assert_eq!(report.skipped, 0);
  assert_eq!(report.overlay_entries, Some(3));

  // 人：x = 0.1 * 240 + 40，宽 0.4 * 240
  let person = image::open(harness.crop(0)).unwrap();
  assert_eq!((person.width(), person.height()), (96, 96));
  assert!(harness.crop(1).exists());
  assert_eq!(harness.crop_count(), 2);

  let state = context.overlay_state().unwrap();
  let labels = state
    .objects()
    .iter()
    .map(|o| o.label.as_str())
    .collect::<Vec<_>>();
  assert_eq!(labels, ["person", "chair", "bed"]);
  assert_eq!(state.objects()[0].left, 64);
  assert_eq!(state.objects()[0].top, 24);

  assert!(context.render_overlay().unwrap());
  let boxes = read_json(&harness.config.overlay_output);
  assert_eq!(boxes["boxes"].as_array().unwrap().len(), 3);
  assert_eq!(boxes["boxes"][1]["style"], "corners");
}

#[test]
fn repeated_cycles_on_the_same_scene_are_stable() {
  let harness = Harness::new();
  harness.script(&[PERSON, BED]);
  let mut context = harness.setup();

  let first = context.run_cycle().unwrap();
  let first_crop = std::fs::read(harness.crop(0)).unwrap();
  let second = context.run_cycle().unwrap();
  assert_eq!(second.cycle, 2);
  assert_eq!(first.files_written, second.files_written);
  assert_eq!(first.overlay_entries, second.overlay_entries);
  assert_eq!(std::fs::read(harness.crop(0)).unwrap(), first_crop);
  assert_eq!(context.overlay_state().unwrap().generation(), 2);
}

#[test]
fn crops_left_by_an_earlier_cycle_are_removed() {
  let harness = Harness::new();
  harness.script(&[PERSON, BED]);
  let mut context = harness.setup();
  context.run_cycle().unwrap();
  assert_eq!(harness.crop_count(), 2);

  harness.script(&[]);
  let report = context.run_cycle().unwrap();
  assert_eq!(report.files_written, 0);
  assert_eq!(harness.crop_count(), 0);
  assert!(context.overlay_state().unwrap().is_empty());

  context.render_overlay().unwrap();
  let boxes = read_json(&harness.config.overlay_output);
  assert!(boxes["boxes"].as_array().unwrap().is_empty());
}

#[test]
fn crop_outside_the_hd_frame_is_skipped() {
  let harness = Harness::new();
  // 右边界 0.95 * 240 + 40 + 0.5 * 240 > 320
  harness.script(&[([0.0, 0.95, 0.5, 1.45], 0.0, 0.9), BED]);
  let mut context = harness.setup();

  let report = context.run_cycle().unwrap();
  assert_eq!(report.qualifying, 2);
  assert_eq!(report.skipped, 1);
  assert_eq!(report.files_written, 1);
  assert!(harness.crop(0).exists());
  assert!(!harness.crop(1).exists());
}

#[test]
fn class_outside_label_table_aborts_only_the_cycle() {
  let mut harness = Harness::new();
  // 每路只有一个帧缓冲，失败周期若没有归还帧，下一周期就取不到帧
  harness.config.buffer_count = 1;
  harness.script(&[([0.1, 0.1, 0.5, 0.5], 7.0, 0.9)]);
  let mut context = harness.setup();

  for _ in 0..3 {
    let err = context.run_cycle().unwrap_err();
    assert!(matches!(err, CycleError::Tensor { .. }));
    assert_eq!(err.stage(), CycleStage::Interpret);
    assert!(!err.is_fatal());
  }
  assert_eq!(harness.crop_count(), 0);

  harness.script(&[PERSON]);
  let report = context.run_cycle().unwrap();
  assert_eq!(report.files_written, 1);
}

#[test]
fn detector_job_failure_skips_only_that_cycle() {
  let mut harness = Harness::new();
  harness.config.buffer_count = 1;
  harness.script(&[PERSON]);
  let mut context = harness.setup();

  harness.detector_fails.store(true, Ordering::SeqCst);
  for _ in 0..2 {
    let err = context.run_cycle().unwrap_err();
    assert!(matches!(err, CycleError::Job { .. }));
    assert_eq!(err.stage(), CycleStage::Infer);
    assert!(!err.is_fatal());
  }
  assert_eq!(harness.crop_count(), 0);

  harness.detector_fails.store(false, Ordering::SeqCst);
  let report = context.run_cycle().unwrap();
  assert_eq!(report.files_written, 1);
  assert_eq!(report.overlay_entries, Some(1));
}

#[test]
fn preprocess_job_failure_skips_only_that_cycle() {
  let mut harness = Harness::new();
  harness.config.buffer_count = 1;
  harness.script(&[PERSON]);
  let mut context = harness.setup();

  harness.preprocess_fails.store(true, Ordering::SeqCst);
  let err = context.run_cycle().unwrap_err();
  assert!(matches!(err, CycleError::Job { .. }));
  assert_eq!(err.stage(), CycleStage::Preprocess);
  assert!(!err.is_fatal());

  harness.preprocess_fails.store(false, Ordering::SeqCst);
  assert_eq!(context.run_cycle().unwrap().files_written, 1);
}

#[test]
fn odd_detector_input_runs_end_to_end() {
  let mut harness = Harness::new();
  harness.config.detector_input = Resolution::new(63, 64);
  harness.script(&[PERSON]);
  let mut context = harness.setup();

  for _ in 0..2 {
    let report = context.run_cycle().unwrap();
    assert_eq!(report.files_written, 1);
  }
  assert!(harness.crop(0).exists());
}

#[test]
fn padded_preprocess_output_is_rejected_at_setup() {
  let harness = Harness::new();
  let source = open_sources(&harness.config).unwrap();
  let err = PipelineContext::setup(&harness.config, harness.padded_devices(8, 0), source, None)
    .unwrap_err();
  assert!(matches!(
    err,
    SetupError::Accelerator(AcceleratorError::Configuration(_))
  ));
}

#[test]
fn padded_detector_output_is_rejected_at_setup() {
  let harness = Harness::new();
  let source = open_sources(&harness.config).unwrap();
  let err = PipelineContext::setup(&harness.config, harness.devices(16), source, None).unwrap_err();
  assert!(matches!(
    err,
    SetupError::Accelerator(AcceleratorError::Configuration(_))
  ));
}

#[test]
fn invalid_threshold_is_rejected_before_opening_anything() {
  let mut harness = Harness::new();
  harness.config.threshold = 101;
  let source = open_sources(&harness.config).unwrap();
  let err = PipelineContext::setup(&harness.config, harness.devices(0), source, None).unwrap_err();
  assert!(matches!(err, SetupError::Config(_)));
  assert!(!harness.config.output_dir.exists());
}

#[test]
fn scheduler_stops_after_max_cycles() {
  let harness = Harness::new();
  harness.script(&[PERSON]);
  let context = harness.setup();

  let mut scheduler = Scheduler::new(context);
  scheduler.add_task(Box::new(DetectionTask::new(Duration::from_millis(1), Some(3))));
  scheduler.add_task(Box::new(OverlayTask::new(Duration::from_millis(1))));
  scheduler.run().unwrap();

  let mut context = scheduler.into_context();
  assert_eq!(context.cycles(), 3);
  assert!(harness.crop(0).exists());
  context.shutdown();
  assert!(!context.session().is_connected());
}

#[test]
fn lost_camera_stops_the_scheduler_with_an_error() {
  let harness = Harness::new();
  let source = DualStreamSource::new(
    Box::new(BrokenCamera {
      resolution: DETECTOR_INPUT,
    }),
    Box::new(BrokenCamera { resolution: HD }),
  );
  let context =
    PipelineContext::setup(&harness.config, harness.devices(0), source, None).unwrap();

  let mut scheduler = Scheduler::new(context);
  scheduler.add_task(Box::new(DetectionTask::new(Duration::from_millis(1), None)));
  let err = scheduler.run().unwrap_err();
  let cycle = err.downcast_ref::<CycleError>().unwrap();
  assert!(cycle.is_fatal());
  assert_eq!(cycle.stage(), CycleStage::Acquire);
  assert_eq!(scheduler.context().cycles(), 1);
}

#[test]
fn overlay_task_removes_itself_without_an_overlay() {
  let harness = Harness::new();
  let source = open_sources(&harness.config).unwrap();
  let context =
    PipelineContext::setup(&harness.config, harness.devices(0), source, None).unwrap();

  let mut scheduler = Scheduler::new(context);
  scheduler.add_task(Box::new(OverlayTask::new(Duration::from_millis(1))));
  scheduler.run().unwrap();
  assert_eq!(scheduler.task_count(), 0);
  assert!(scheduler.context().overlay_state().is_none());
}
