// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 合成协作者: 无硬件时驱动整条流水线 (演示程序 / 压测)
/// Synthetic engine, decoder, face analyzer and renderer
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use image::{Rgba, RgbaImage};
use log::{debug, info, warn};
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::capability::{
    Decoder, DecoderFactory, EngineFactory, FaceAnalysis, FrameCallback, InferenceEngine,
    InputSpec, OutputTensor, Presentation, Renderer,
};
use crate::models::{yolov5, yolov8, ModelKind, ModelSpec};
use crate::types::{
    AnnotatedFrame, BBox, FaceAnalysisResult, FaceAttributes, FaceRecord, Frame, PersonRoi, RawFrame, StreamId,
};

// ========== 推理引擎 ==========

/// 每帧输出的目标 (类别, 置信度, 模型坐标框)
#[derive(Debug, Clone)]
pub enum Scene {
    Random { max_objects: usize },
    Fixed(Vec<(u32, f32, BBox)>),
}

/// 按模型变体编码成量化输出
pub fn encode_outputs(spec: &ModelSpec, objects: &[(u32, f32, BBox)]) -> Vec<OutputTensor> {
    match spec.kind {
        ModelKind::YoloV5 => yolov5::encode(spec, objects),
        ModelKind::YoloV8 => yolov8::encode(spec, objects, 64),
    }
}

pub struct SyntheticEngine {
    spec: ModelSpec,
    scene: Scene,
    latency: Duration,
    fail_every: Option<u64>,
    core: Option<usize>,
    initialized: bool,
    calls: u64,
    rng: StdRng,
}

impl SyntheticEngine {
    pub fn new(spec: ModelSpec, scene: Scene, latency: Duration, fail_every: Option<u64>, seed: u64) -> Self {
        Self {
            spec,
            scene,
            latency,
            fail_every,
            core: None,
            initialized: false,
            calls: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// 每次调用产出一个独立实例 (种子递增)
    pub fn factory(spec: ModelSpec, scene: Scene, latency: Duration, fail_every: Option<u64>) -> EngineFactory {
        let seed = Arc::new(AtomicU64::new(0));
        Arc::new(move || {
            let s = seed.fetch_add(1, Ordering::Relaxed);
            Box::new(SyntheticEngine::new(spec.clone(), scene.clone(), latency, fail_every, s))
                as Box<dyn InferenceEngine>
        })
    }

    fn random_objects(&mut self, max_objects: usize) -> Vec<(u32, f32, BBox)> {
        let (w, h) = (self.spec.input_width as f32, self.spec.input_height as f32);
        let n = self.rng.gen_range(0..=max_objects);
        (0..n)
            .map(|_| {
                // 大多是人
                let class_id = if self.rng.gen_bool(0.7) { 0 } else { self.rng.gen_range(1..8) };
                let bw = self.rng.gen_range(40.0..w / 3.0);
                let bh = self.rng.gen_range(60.0..h / 2.0);
                let x1 = self.rng.gen_range(0.0..w - bw);
                let y1 = self.rng.gen_range(0.0..h - bh);
                let conf = self.rng.gen_range(0.55..0.98);
                (class_id, conf, BBox::new(x1, y1, x1 + bw, y1 + bh))
            })
            .collect()
    }
}

impl InferenceEngine for SyntheticEngine {
    fn set_core(&mut self, core: usize) -> Result<()> {
        self.core = Some(core);
        Ok(())
    }

    fn initialize(&mut self, model_bytes: &[u8], input: &InputSpec) -> Result<()> {
        if model_bytes.is_empty() {
            bail!("empty model blob");
        }
        if input.width != self.spec.input_width || input.height != self.spec.input_height {
            bail!(
                "input {}x{} does not match model {}x{}",
                input.width,
                input.height,
                self.spec.input_width,
                self.spec.input_height
            );
        }
        self.initialized = true;
        debug!("synthetic engine for {} on core {:?}", self.spec.tag, self.core);
        Ok(())
    }

    fn infer(&mut self, input: &Array4<u8>) -> Result<Vec<OutputTensor>> {
        if !self.initialized {
            bail!("engine not initialized");
        }
        let shape = input.shape();
        if shape[1] != self.spec.input_height as usize || shape[2] != self.spec.input_width as usize {
            bail!("unexpected input shape {:?}", shape);
        }
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        self.calls += 1;
        if let Some(n) = self.fail_every {
            if n > 0 && self.calls % n == 0 {
                bail!("synthetic failure on call {}", self.calls);
            }
        }
        let objects = match &self.scene {
            Scene::Fixed(objects) => objects.clone(),
            Scene::Random { max_objects } => {
                let max = *max_objects;
                self.random_objects(max)
            }
        };
        Ok(encode_outputs(&self.spec, &objects))
    }
}

// ========== 解码器 ==========

struct Running {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// 按固定帧率产出纯色渐变帧
pub struct SyntheticDecoder {
    stream: StreamId,
    width: u32,
    height: u32,
    fps: u32,
    url: Option<String>,
    callback: Option<FrameCallback>,
    running: Option<Running>,
}

impl SyntheticDecoder {
    pub fn new(stream: StreamId, width: u32, height: u32, fps: u32) -> Self {
        Self {
            stream,
            width,
            height,
            fps: fps.max(1),
            url: None,
            callback: None,
            running: None,
        }
    }

    fn launch(&mut self) -> Result<()> {
        let callback = self
            .callback
            .clone()
            .ok_or_else(|| anyhow!("decoder for {} was never opened", self.stream))?;
        let (stop, stop_rx) = bounded::<()>(1);
        let (w, h) = (self.width, self.height);
        let interval = Duration::from_millis(1000 / self.fps as u64);
        let handle = thread::Builder::new()
            .name(format!("decode-{}", self.stream))
            .spawn(move || {
                let mut n: u64 = 0;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let shade = (n % 200) as u8 + 30;
                            let image = RgbaImage::from_pixel(w, h, Rgba([shade, shade / 2, 90, 255]));
                            callback(RawFrame::from_rgba(image, n * interval.as_millis() as u64));
                            n += 1;
                        }
                        _ => break,
                    }
                }
            })?;
        self.running = Some(Running { stop, handle });
        Ok(())
    }
}

impl Decoder for SyntheticDecoder {
    fn open(&mut self, url: &str, on_frame: FrameCallback) -> Result<()> {
        self.close();
        self.url = Some(url.to_string());
        self.callback = Some(on_frame);
        self.launch()?;
        info!("🎬 [{}] synthetic decoder opened {} ({}x{} @ {}fps)", self.stream, url, self.width, self.height, self.fps);
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        self.close();
        self.launch()?;
        info!("🔄 [{}] synthetic decoder reconnected to {}", self.stream, self.url.as_deref().unwrap_or("?"));
        Ok(())
    }

    fn close(&mut self) {
        if let Some(running) = self.running.take() {
            drop(running.stop);
            if running.handle.join().is_err() {
                warn!("⚠️  [{}] decoder thread panicked", self.stream);
            }
        }
    }
}

impl Drop for SyntheticDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct SyntheticDecoderFactory {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl DecoderFactory for SyntheticDecoderFactory {
    fn create(&self, stream: &StreamId) -> Box<dyn Decoder> {
        Box::new(SyntheticDecoder::new(stream.clone(), self.width, self.height, self.fps))
    }
}

// ========== 人脸分析 ==========

/// 每个人体 ROI 上方生成一张随机属性的人脸
pub struct SyntheticFaceAnalysis {
    rng: Mutex<StdRng>,
    fail_every: Option<u64>,
    calls: AtomicU64,
}

impl SyntheticFaceAnalysis {
    pub fn new(seed: u64, fail_every: Option<u64>) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            fail_every,
            calls: AtomicU64::new(0),
        }
    }
}

impl FaceAnalysis for SyntheticFaceAnalysis {
    fn analyze(&self, _frame: &Frame, rois: &[PersonRoi]) -> Result<Vec<FaceAnalysisResult>> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(n) = self.fail_every {
            if n > 0 && call % n == 0 {
                bail!("synthetic face model failure on call {}", call);
            }
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rois
            .iter()
            .map(|r| {
                let side = (r.roi.width() * 0.4).min(r.roi.height() * 0.25);
                let cx = (r.roi.x1 + r.roi.x2) / 2.0;
                let bbox = BBox::new(cx - side / 2.0, r.roi.y1, cx + side / 2.0, r.roi.y1 + side);
                let attributes = FaceAttributes::from_codes(
                    rng.gen_range(0..=2),
                    rng.gen_range(0..9),
                    rng.gen_range(0..5),
                )
                .with_confidences(rng.gen_range(0.6..1.0), rng.gen_range(0.4..1.0), rng.gen_range(0.4..1.0));
                FaceAnalysisResult {
                    person: r.person,
                    faces: vec![FaceRecord {
                        bbox,
                        confidence: rng.gen_range(0.6..0.99),
                        attributes,
                    }],
                }
            })
            .collect())
    }
}

// ========== 渲染 ==========

/// 无窗口渲染面: 只计数; 模拟 UI 线程持有表面时的 try-lock 失败
#[derive(Default)]
pub struct LogRenderer {
    surface: Mutex<()>,
    presented: AtomicU64,
}

impl LogRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }
}

impl Renderer for LogRenderer {
    fn try_present(&self, frame: &AnnotatedFrame) -> Presentation {
        match self.surface.try_lock() {
            Ok(_guard) => {
                let n = self.presented.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 100 == 0 {
                    debug!(
                        "🖼️  {} presented ({} boxes, {} faces), total {}",
                        frame.key, frame.detections_drawn, frame.faces_drawn, n
                    );
                }
                Presentation::Presented
            }
            Err(_) => Presentation::SurfaceUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::letterbox;

    #[test]
    fn fixed_scene_round_trips_through_decode() {
        let spec = ModelSpec::yolov8("yolov8n");
        let person = BBox::new(100.0, 100.0, 200.0, 400.0);
        let mut engine = SyntheticEngine::new(
            spec.clone(),
            Scene::Fixed(vec![(0, 0.9, person)]),
            Duration::ZERO,
            None,
            1,
        );
        engine.set_core(0).unwrap();
        engine.initialize(b"blob", &spec.input_spec()).unwrap();

        let raw = RawFrame::from_rgba(RgbaImage::new(640, 640), 0);
        let frame = Frame::from_raw(StreamId::new("s"), 1, raw).unwrap();
        let (input, lb) = letterbox(&frame, 640, 640);
        let outputs = engine.infer(&input).unwrap();
        let dets = spec.decode(&outputs, &lb).unwrap();
        assert_eq!(dets.len(), 1);
        assert!(dets[0].is_class("person"));
        assert!((dets[0].bbox.x1 - 100.0).abs() < 3.0);
    }

    #[test]
    fn engine_fails_on_schedule_and_rejects_uninitialized_use() {
        let spec = ModelSpec::yolov5("yolov5s");
        let input = Array4::<u8>::zeros((1, 640, 640, 3));
        let mut engine = SyntheticEngine::new(spec.clone(), Scene::Random { max_objects: 3 }, Duration::ZERO, Some(2), 7);
        assert!(engine.infer(&input).is_err());
        engine.initialize(b"blob", &spec.input_spec()).unwrap();
        assert!(engine.infer(&input).is_ok());
        assert!(engine.infer(&input).is_err());
        assert!(engine.infer(&input).is_ok());
    }

    #[test]
    fn face_analysis_emits_one_face_per_roi() {
        let analyzer = SyntheticFaceAnalysis::new(3, None);
        let raw = RawFrame::from_rgba(RgbaImage::new(64, 64), 0);
        let frame = Frame::from_raw(StreamId::new("s"), 1, raw).unwrap();
        let person = crate::types::Detection::new(0, "person", 0.9, BBox::new(0.0, 0.0, 40.0, 60.0));
        let rois = vec![PersonRoi { person, roi: person.bbox }; 3];
        let out = analyzer.analyze(&frame, &rois).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.faces.len() == 1));
    }
}
