#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 多路 RTSP 级联推理调度核心
//! Concurrent inference scheduler for multi-camera analytics
//!
//! 解码器回调 → 准入 → 有界分发器 → 加速器 worker → 级联 (人体 → 人脸属性) → 统计 + 叠加绘制 → 渲染面

pub mod admission; // 单流准入: 跳帧 / 配额 / 帧号
pub mod capability; // 外部协作者接口
pub mod cascade; // 两阶段级联
pub mod config; // 流水线配置
pub mod engine; // 核心分配 / worker / 分发器
pub mod error; // 错误类型
pub mod logger; // 日志初始化
pub mod models; // 模型变体与后处理
pub mod pipeline; // 面向宿主的接口
pub mod sim; // 合成协作者
pub mod sink; // 叠加绘制与渲染交付
pub mod stats; // 统计聚合
pub mod supervisor; // 停滞检测与重启
pub mod types; // 共享值类型

pub use crate::capability::{
    Clock, Decoder, DecoderFactory, EngineFactory, FaceAnalysis, InferenceEngine, ManualClock,
    Presentation, Renderer, SharedClock, SystemClock,
};
pub use crate::config::PipelineConfig;
pub use crate::engine::{AcceleratorCoreAllocator, InferenceDispatcher, InferenceWorker};
pub use crate::error::{ErrorKind, PipelineError, Result};
pub use crate::models::{ModelKind, ModelSpec};
pub use crate::pipeline::{Pipeline, StatsScope, StreamHandle};
pub use crate::stats::{StatsAggregator, StatsSnapshot};
pub use crate::types::{
    BBox, CascadeResult, Detection, DetectionSet, Frame, FrameKey, ModelTag, RawFrame, StreamId,
};
