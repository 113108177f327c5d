// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 外部协作者接口: 推理引擎、人脸分析、解码器、渲染器、时钟
/// Capability traits injected into the core
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ndarray::Array4;

use crate::types::{AnnotatedFrame, FaceAnalysisResult, Frame, PersonRoi, RawFrame, StreamId};

// ========== 推理引擎 ==========

/// 模型输入描述 (NHWC, u8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// 量化输出张量 (int8 + 仿射量化参数)
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub dims: Vec<usize>,
    pub data: Vec<i8>,
    pub zero_point: i32,
    pub scale: f32,
}

impl OutputTensor {
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn dequant(&self, index: usize) -> f32 {
        crate::models::quant::dequantize(self.data[index], self.zero_point, self.scale)
    }
}

/// 加速器推理引擎; 每个 worker 独占一个实例
pub trait InferenceEngine: Send {
    /// 绑定加速器核心 (在 initialize 之前调用, 动态均衡时可在每次分发前调用)
    fn set_core(&mut self, core: usize) -> anyhow::Result<()>;

    fn initialize(&mut self, model_bytes: &[u8], input: &InputSpec) -> anyhow::Result<()>;

    /// 输入形状为 [1, h, w, c]
    fn infer(&mut self, input: &Array4<u8>) -> anyhow::Result<Vec<OutputTensor>>;
}

/// 每个 worker 调用一次, 产出独立的引擎实例
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn InferenceEngine> + Send + Sync>;

// ========== 人脸分析 ==========

/// 二阶段人脸属性分析; 可缺省
pub trait FaceAnalysis: Send + Sync {
    /// ROI 与返回的人脸框均为原图坐标
    fn analyze(&self, frame: &Frame, rois: &[PersonRoi])
        -> anyhow::Result<Vec<FaceAnalysisResult>>;
}

// ========== 解码器 ==========

/// 解码器帧回调; 在解码线程上执行, 不得长时间阻塞
pub type FrameCallback = Arc<dyn Fn(RawFrame) + Send + Sync>;

pub trait Decoder: Send {
    fn open(&mut self, url: &str, on_frame: FrameCallback) -> anyhow::Result<()>;

    /// 以相同 url 与回调重新连接
    fn restart(&mut self) -> anyhow::Result<()>;

    fn close(&mut self);
}

pub trait DecoderFactory: Send + Sync {
    fn create(&self, stream: &StreamId) -> Box<dyn Decoder>;
}

// ========== 渲染器 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    Presented,
    SurfaceUnavailable,
}

/// 外部渲染面; try_present 不得阻塞
pub trait Renderer: Send + Sync {
    fn try_present(&self, frame: &AnnotatedFrame) -> Presentation;
}

// ========== 时钟 ==========

/// 单调时钟 (毫秒)
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub type SharedClock = Arc<dyn Clock>;

/// 基于 Instant 的系统单调时钟
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// 手动推进的时钟 (测试/回放)
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start_ms),
        })
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
