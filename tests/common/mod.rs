// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 集成测试共用的替身实现
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use ndarray::Array4;

use rtsp_cascade::capability::{
    Decoder, DecoderFactory, EngineFactory, FaceAnalysis, FrameCallback, InferenceEngine,
    InputSpec, OutputTensor, Presentation, Renderer,
};
use rtsp_cascade::config::DispatcherConfig;
use rtsp_cascade::engine::{AcceleratorCoreAllocator, InferenceDispatcher};
use rtsp_cascade::models::{yolov8, ModelSpec};
use rtsp_cascade::types::{
    AnnotatedFrame, BBox, FaceAnalysisResult, FaceAttributes, FaceRecord, Frame, FrameKey,
    PersonRoi, RawFrame, StreamId,
};
use rtsp_cascade::{config::Balancing, Pipeline, PipelineConfig, SharedClock, StreamHandle, SystemClock};

pub const MODEL_BYTES: &[u8] = b"test-model";

/// 标记像素 G 通道: 延迟 R×2 毫秒
pub const MARK_DELAY: u8 = 100;
/// 标记像素 G 通道: 推理失败
pub const MARK_FAIL: u8 = 200;
/// 标记像素 G 通道: 引擎 panic
pub const MARK_PANIC: u8 = 250;

/// 64×64 输入的小模型, 64×64 帧不缩放不填充
pub fn tiny_spec() -> ModelSpec {
    let mut spec = ModelSpec::yolov8("tiny");
    spec.input_width = 64;
    spec.input_height = 64;
    spec
}

// ========== 脚本化引擎 ==========

/// 所有引擎实例共享的调用记录
#[derive(Default)]
pub struct Script {
    pub started: Mutex<Vec<u8>>,
    pub completed: Mutex<Vec<u8>>,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub cores: Mutex<Vec<usize>>,
}

impl Script {
    pub fn started(&self) -> Vec<u8> {
        self.started.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<u8> {
        self.completed.lock().unwrap().clone()
    }
}

/// 读取输入张量左上角像素决定行为: (R, G, B) = (延迟, 模式, 标签)
pub struct ScriptedEngine {
    spec: ModelSpec,
    objects: Vec<(u32, f32, BBox)>,
    script: Arc<Script>,
    core: usize,
}

impl InferenceEngine for ScriptedEngine {
    fn set_core(&mut self, core: usize) -> anyhow::Result<()> {
        self.core = core;
        Ok(())
    }

    fn initialize(&mut self, model_bytes: &[u8], input: &InputSpec) -> anyhow::Result<()> {
        anyhow::ensure!(model_bytes == MODEL_BYTES, "unexpected model blob");
        anyhow::ensure!(input.width == self.spec.input_width, "input width mismatch");
        Ok(())
    }

    fn infer(&mut self, input: &Array4<u8>) -> anyhow::Result<Vec<OutputTensor>> {
        let (r, g, b) = (input[[0, 0, 0, 0]], input[[0, 0, 0, 1]], input[[0, 0, 0, 2]]);
        self.script.started.lock().unwrap().push(b);
        self.script.cores.lock().unwrap().push(self.core);
        let now = self.script.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_active.fetch_max(now, Ordering::SeqCst);

        if g == MARK_DELAY {
            thread::sleep(Duration::from_millis(r as u64 * 2));
        }
        self.script.active.fetch_sub(1, Ordering::SeqCst);
        self.script.completed.lock().unwrap().push(b);
        if g == MARK_FAIL {
            anyhow::bail!("scripted failure for tag {}", b);
        }
        if g == MARK_PANIC {
            panic!("scripted panic for tag {}", b);
        }
        Ok(yolov8::encode(&self.spec, &self.objects, 8))
    }
}

pub fn scripted_factory(spec: &ModelSpec, objects: Vec<(u32, f32, BBox)>, script: Arc<Script>) -> EngineFactory {
    let spec = spec.clone();
    Arc::new(move || {
        Box::new(ScriptedEngine {
            spec: spec.clone(),
            objects: objects.clone(),
            script: script.clone(),
            core: usize::MAX,
        }) as Box<dyn InferenceEngine>
    })
}

pub fn dispatcher_config(workers: usize, max_depth: usize) -> DispatcherConfig {
    DispatcherConfig {
        workers,
        max_depth,
        ..Default::default()
    }
}

/// 小模型分发器 + 调用记录
pub fn tiny_dispatcher(config: DispatcherConfig, clock: SharedClock) -> (InferenceDispatcher, Arc<Script>) {
    let script = Arc::new(Script::default());
    let spec = tiny_spec();
    let factory = scripted_factory(&spec, Vec::new(), script.clone());
    let allocator = Arc::new(AcceleratorCoreAllocator::new(3, None).unwrap());
    let dispatcher = InferenceDispatcher::spawn(
        spec,
        MODEL_BYTES,
        &factory,
        allocator,
        &config,
        Balancing::Static,
        clock,
    )
    .unwrap();
    (dispatcher, script)
}

pub fn system_clock() -> SharedClock {
    SystemClock::shared()
}

// ========== 帧 ==========

/// 左上角为标记像素的纯色帧
pub fn marker_raw(width: u32, height: u32, r: u8, g: u8, b: u8) -> RawFrame {
    let mut image = RgbaImage::from_pixel(width, height, Rgba([40, 40, 40, 255]));
    image.put_pixel(0, 0, Rgba([r, g, b, 255]));
    RawFrame::from_rgba(image, 0)
}

pub fn marker_frame(stream: &str, frame_id: u64, r: u8, g: u8, b: u8) -> Frame {
    Frame::from_raw(StreamId::new(stream), frame_id, marker_raw(64, 64, r, g, b)).unwrap()
}

pub fn plain_raw(width: u32, height: u32) -> RawFrame {
    RawFrame::from_rgba(RgbaImage::from_pixel(width, height, Rgba([40, 40, 40, 255])), 0)
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ========== 人脸分析 ==========

/// 每第 N 次调用失败; 成功时每个 ROI 给出一张有效人脸 (男, 20-29)
pub struct FlakyFaceAnalysis {
    pub fail_every: usize,
    pub calls: AtomicUsize,
}

impl FlakyFaceAnalysis {
    pub fn new(fail_every: usize) -> Self {
        Self {
            fail_every,
            calls: AtomicUsize::new(0),
        }
    }
}

impl FaceAnalysis for FlakyFaceAnalysis {
    fn analyze(&self, _frame: &Frame, rois: &[PersonRoi]) -> anyhow::Result<Vec<FaceAnalysisResult>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            anyhow::bail!("face model failed on call {}", call);
        }
        Ok(rois
            .iter()
            .map(|r| FaceAnalysisResult {
                person: r.person,
                faces: vec![FaceRecord {
                    bbox: BBox::new(r.roi.x1, r.roi.y1, r.roi.x1 + 20.0, r.roi.y1 + 20.0),
                    confidence: 0.9,
                    attributes: FaceAttributes::from_codes(1, 3, 4).with_confidences(0.9, 0.8, 0.7),
                }],
            })
            .collect())
    }
}

// ========== 渲染面 ==========

#[derive(Default)]
pub struct RecordingRenderer {
    pub busy: AtomicBool,
    pub frames: Mutex<Vec<FrameKey>>,
}

impl RecordingRenderer {
    pub fn keys(&self) -> Vec<FrameKey> {
        self.frames.lock().unwrap().clone()
    }
}

impl Renderer for RecordingRenderer {
    fn try_present(&self, frame: &AnnotatedFrame) -> Presentation {
        if self.busy.load(Ordering::SeqCst) {
            return Presentation::SurfaceUnavailable;
        }
        self.frames.lock().unwrap().push(frame.key.clone());
        Presentation::Presented
    }
}

// ========== 手动解码器 ==========

/// 由测试直接推帧的解码器状态
#[derive(Default)]
pub struct ManualDecoderState {
    pub callback: Mutex<Option<FrameCallback>>,
    pub url: Mutex<Option<String>>,
    pub opens: AtomicUsize,
    pub restarts: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_open: AtomicBool,
}

impl ManualDecoderState {
    /// 推一帧; 解码器未打开时返回 false
    pub fn push(&self, raw: RawFrame) -> bool {
        let callback = self.callback.lock().unwrap().clone();
        match callback {
            Some(cb) => {
                cb(raw);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }
}

pub struct ManualDecoder {
    state: Arc<ManualDecoderState>,
}

impl ManualDecoder {
    pub fn new(state: Arc<ManualDecoderState>) -> Self {
        Self { state }
    }
}

impl Decoder for ManualDecoder {
    fn open(&mut self, url: &str, on_frame: FrameCallback) -> anyhow::Result<()> {
        anyhow::ensure!(!self.state.fail_open.load(Ordering::SeqCst), "connection refused");
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        *self.state.url.lock().unwrap() = Some(url.to_string());
        *self.state.callback.lock().unwrap() = Some(on_frame);
        Ok(())
    }

    fn restart(&mut self) -> anyhow::Result<()> {
        self.state.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.state.callback.lock().unwrap().take();
    }
}

#[derive(Default)]
pub struct ManualDecoderFactory {
    states: Mutex<HashMap<StreamId, Arc<ManualDecoderState>>>,
}

impl ManualDecoderFactory {
    pub fn state(&self, stream: &str) -> Arc<ManualDecoderState> {
        self.states
            .lock()
            .unwrap()
            .get(&StreamId::new(stream))
            .cloned()
            .expect("decoder was created for stream")
    }
}

impl DecoderFactory for ManualDecoderFactory {
    fn create(&self, stream: &StreamId) -> Box<dyn Decoder> {
        let state = Arc::new(ManualDecoderState::default());
        self.states.lock().unwrap().insert(stream.clone(), state.clone());
        Box::new(ManualDecoder::new(state))
    }
}

// ========== 流水线 ==========

/// 不跳帧, 后台巡检间隔拉长到测试期间不会触发
pub fn pipeline_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.dispatcher = dispatcher_config(2, 8);
    config.stream.frame_skip = 1;
    config.supervisor.check_interval_ms = 3_600_000;
    config
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub decoders: Arc<ManualDecoderFactory>,
    pub script: Arc<Script>,
}

impl Harness {
    /// 注册 `tiny_spec` 模型的流水线
    pub fn new(config: PipelineConfig, clock: SharedClock, face: Option<Arc<dyn FaceAnalysis>>) -> Self {
        let decoders = Arc::new(ManualDecoderFactory::default());
        let pipeline = Pipeline::new(config, decoders.clone(), face, clock).unwrap();
        let script = Arc::new(Script::default());
        let spec = tiny_spec();
        let factory = scripted_factory(&spec, Vec::new(), script.clone());
        pipeline.register_model(spec, MODEL_BYTES, factory).unwrap();
        Self {
            pipeline,
            decoders,
            script,
        }
    }

    /// 添加并启动一路流
    pub fn running_stream(&self, id: &str, priority: u32) -> (StreamHandle, Arc<ManualDecoderState>) {
        let handle = self
            .pipeline
            .add_stream(id, &format!("rtsp://10.0.0.1/{}", id), priority)
            .unwrap();
        self.pipeline.start(handle).unwrap();
        (handle, self.decoders.state(id))
    }

    /// 等待该流交付数达到 n
    pub fn wait_delivered(&self, handle: StreamHandle, n: u64) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.pipeline
                .stream_health(handle)
                .map(|h| h.delivered >= n)
                .unwrap_or(false)
        })
    }
}
