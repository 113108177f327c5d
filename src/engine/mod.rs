// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 推理调度: 核心分配 → worker → 分发器
/// Inference scheduling: core allocation, workers and the bounded dispatcher
pub mod allocator;
pub mod dispatcher;
pub mod worker;

pub use allocator::{AcceleratorCoreAllocator, CoreTask};
pub use dispatcher::{DispatcherMetrics, InferenceDispatcher, Rejected, ResultPoll};
pub use worker::{InferenceWorker, WorkerSlot};
