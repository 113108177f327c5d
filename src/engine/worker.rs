// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 推理 worker: 独占一个模型实例, 绑定一个加速器核心
/// Inference worker: letterbox → infer → decode for one frame
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use super::allocator::{AcceleratorCoreAllocator, CoreTask};
use crate::capability::{InferenceEngine, SharedClock};
use crate::config::Balancing;
use crate::error::{PipelineError, Result};
use crate::models::{letterbox, ModelSpec};
use crate::types::{DetectionSet, Frame, ModelTag, WorkerTiming};

/// worker 对外可观察的槽位状态 (只由所属 worker 修改)
#[derive(Debug, Default)]
pub struct SlotState {
    core: AtomicUsize,
    in_flight: AtomicBool,
}

/// 槽位快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSlot {
    pub worker_index: usize,
    pub core: usize,
    pub in_flight: bool,
}

pub struct InferenceWorker {
    index: usize,
    core: usize,
    engine: Box<dyn InferenceEngine>,
    spec: Arc<ModelSpec>,
    tag: ModelTag,
    allocator: Arc<AcceleratorCoreAllocator>,
    balancing: Balancing,
    clock: SharedClock,
    slot: Arc<SlotState>,
}

impl InferenceWorker {
    /// 绑定核心并初始化模型
    pub fn new(
        index: usize,
        mut engine: Box<dyn InferenceEngine>,
        spec: Arc<ModelSpec>,
        model_bytes: &[u8],
        allocator: Arc<AcceleratorCoreAllocator>,
        balancing: Balancing,
        clock: SharedClock,
    ) -> Result<Self> {
        let core = allocator.assign_core()?;
        engine
            .set_core(core)
            .and_then(|_| engine.initialize(model_bytes, &spec.input_spec()))
            .map_err(|e| {
                PipelineError::NotInitialized(format!(
                    "worker {} for {} on core {}: {:#}",
                    index, spec.tag, core, e
                ))
            })?;
        info!(
            "✅ worker {} ({}) 已绑定核心 {}",
            index, spec.tag, core
        );

        let slot = Arc::new(SlotState::default());
        slot.core.store(core, Ordering::Release);
        Ok(Self {
            index,
            core,
            engine,
            tag: spec.model_tag(),
            spec,
            allocator,
            balancing,
            clock,
            slot,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn slot_state(&self) -> Arc<SlotState> {
        self.slot.clone()
    }

    /// 选定本次使用的核心并计入在途; 动态均衡且全部满载时退回绑定核心
    fn begin_task(&mut self) -> usize {
        if self.balancing == Balancing::Dynamic {
            if let Ok(core) = self.allocator.acquire_core() {
                if core == self.core {
                    return core;
                }
                match self.engine.set_core(core) {
                    Ok(()) => {
                        self.core = core;
                        return core;
                    }
                    Err(e) => {
                        warn!("⚠️  worker {} 切换到核心 {} 失败: {:#}", self.index, core, e);
                        self.allocator.task_completed(core);
                    }
                }
            }
        }
        self.allocator.task_started(self.core);
        self.core
    }

    /// run 中途 panic 后复位槽位状态
    pub(crate) fn abandon_task(&self) {
        self.slot.in_flight.store(false, Ordering::Release);
    }

    /// 单帧: letterbox → 推理 → 解码 → 盖章
    pub fn run(&mut self, frame: &Frame) -> Result<DetectionSet> {
        let key = frame.key().clone();
        self.slot.in_flight.store(true, Ordering::Release);

        let t_pre = Instant::now();
        let (input, lb) = letterbox(frame, self.spec.input_width, self.spec.input_height);
        let preprocess_ms = t_pre.elapsed().as_secs_f64() * 1000.0;

        let t_run = Instant::now();
        let core = self.begin_task();
        let allocator = self.allocator.clone();
        let task = CoreTask::acquired(&allocator, core);
        let outputs = self.engine.infer(&input);
        drop(task);
        let inference_ms = t_run.elapsed().as_secs_f64() * 1000.0;
        self.slot.core.store(core, Ordering::Release);

        let outputs = match outputs {
            Ok(outputs) => outputs,
            Err(e) => {
                self.slot.in_flight.store(false, Ordering::Release);
                return Err(PipelineError::InferenceFailed {
                    key,
                    reason: format!("{:#}", e),
                });
            }
        };

        let t_post = Instant::now();
        let decoded = self.spec.decode(&outputs, &lb);
        let postprocess_ms = t_post.elapsed().as_secs_f64() * 1000.0;
        self.slot.in_flight.store(false, Ordering::Release);

        let detections = decoded.map_err(|e| PipelineError::InferenceFailed {
            key: key.clone(),
            reason: format!("decode: {:#}", e),
        })?;
        debug!(
            "🔍 {} → {} detections on core {} ({:.1}ms infer)",
            key,
            detections.len(),
            core,
            inference_ms
        );

        Ok(DetectionSet {
            key,
            detections,
            model: self.tag.clone(),
            completed_ms: self.clock.now_ms(),
            timing: WorkerTiming {
                preprocess_ms,
                inference_ms,
                postprocess_ms,
                worker_index: self.index,
                core,
            },
        })
    }
}

impl SlotState {
    pub fn snapshot(&self, worker_index: usize) -> WorkerSlot {
        WorkerSlot {
            worker_index,
            core: self.core.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }
}
