// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 推理分发器: 有界 FIFO + worker 线程池 + 按帧键发布的结果表
/// Inference dispatcher
///
/// 帧状态: Submitted → InFlight → Completed → Consumed / Evicted,
/// 推理失败时 InFlight → Failed → Evicted.
///
/// 队列深度 = 排队 + 执行中, 永远不超过 `max_depth`. 结果表单独一把锁,
/// 先发布结果再移出 in-flight 集合, 所以查询方先看队列再看结果表不会误报 NotFound.
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::allocator::AcceleratorCoreAllocator;
use super::worker::{InferenceWorker, SlotState, WorkerSlot};
use crate::capability::{EngineFactory, SharedClock};
use crate::config::{Balancing, DispatcherConfig};
use crate::error::{PipelineError, Result};
use crate::models::ModelSpec;
use crate::types::{DetectionSet, Frame, FrameKey, ModelTag, StreamId};

// ========== 提交 / 查询结果 ==========

/// 提交被拒绝时原样退回帧, 由生产者决定丢弃或重试
pub struct Rejected {
    pub frame: Frame,
    pub error: PipelineError,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("key", self.frame.key())
            .field("error", &self.error)
            .finish()
    }
}

/// 非阻塞查询结果
#[derive(Debug)]
pub enum ResultPoll {
    Ready(DetectionSet),
    Failed(PipelineError),
    NotReady,
    NotFound,
}

/// 分发器计数器快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub consumed: u64,
    pub evicted: u64,
    pub backpressured: u64,
    pub depth: usize,
    pub peak_depth: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    consumed: AtomicU64,
    evicted: AtomicU64,
    backpressured: AtomicU64,
}

// ========== 内部状态 ==========

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Frame>,
    queued: HashSet<FrameKey>,
    in_flight: HashSet<FrameKey>,
    outstanding: HashMap<StreamId, usize>,
    last_submitted: HashMap<StreamId, u64>,
    peak_depth: usize,
    shutdown: bool,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    fn release(&mut self, stream: &StreamId) {
        if let Some(n) = self.outstanding.get_mut(stream) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.outstanding.remove(stream);
            }
        }
    }
}

enum Outcome {
    Completed(DetectionSet),
    Failed(PipelineError),
}

struct ResultEntry {
    outcome: Option<Outcome>,
    frame: Option<Frame>,
    published_ms: u64,
    seq: u64,
}

impl ResultEntry {
    fn is_spent(&self) -> bool {
        self.outcome.is_none() && self.frame.is_none()
    }
}

#[derive(Default)]
struct ResultState {
    entries: BTreeMap<FrameKey, ResultEntry>,
    seq: u64,
}

struct Shared {
    tag: ModelTag,
    config: DispatcherConfig,
    clock: SharedClock,
    queue: Mutex<QueueState>,
    work_cv: Condvar,
    space_cv: Condvar,
    results: Mutex<ResultState>,
    result_cv: Condvar,
    shutdown: AtomicBool,
    counters: Counters,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn is_pending(&self, key: &FrameKey) -> bool {
        let q = lock(&self.queue);
        q.queued.contains(key) || q.in_flight.contains(key)
    }

    /// 持结果表锁时清理过期 / 超量条目
    fn evict(&self, results: &mut ResultState) {
        let now = self.clock.now_ms();
        let ttl = self.config.result_ttl_ms;
        let before = results.entries.len();
        results
            .entries
            .retain(|_, e| !e.is_spent() && now.saturating_sub(e.published_ms) <= ttl);

        let cap = self.config.result_cap;
        if results.entries.len() > cap {
            let mut by_age: Vec<(u64, FrameKey)> = results
                .entries
                .iter()
                .map(|(k, e)| (e.seq, k.clone()))
                .collect();
            by_age.sort_unstable_by_key(|(seq, _)| *seq);
            let excess = results.entries.len() - cap;
            for (_, key) in by_age.into_iter().take(excess) {
                results.entries.remove(&key);
            }
        }

        let evicted = before - results.entries.len();
        if evicted > 0 {
            self.counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!("🧹 [{}] evicted {} result entries", self.tag, evicted);
        }
    }

    /// 发布结果: 先写结果表, 再移出 in-flight
    fn publish(&self, key: FrameKey, frame: Frame, outcome: Result<DetectionSet>) {
        {
            let mut results = lock(&self.results);
            results.seq += 1;
            let seq = results.seq;
            let entry = match outcome {
                Ok(set) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    ResultEntry {
                        outcome: Some(Outcome::Completed(set)),
                        frame: Some(frame),
                        published_ms: self.clock.now_ms(),
                        seq,
                    }
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("❌ [{}] {}", self.tag, e);
                    // 失败帧不保留图像
                    drop(frame);
                    ResultEntry {
                        outcome: Some(Outcome::Failed(e)),
                        frame: None,
                        published_ms: self.clock.now_ms(),
                        seq,
                    }
                }
            };
            results.entries.insert(key.clone(), entry);
            self.evict(&mut results);
            self.result_cv.notify_all();
        }

        let mut q = lock(&self.queue);
        q.in_flight.remove(&key);
        q.release(&key.stream);
        self.space_cv.notify_all();
    }

    /// 取走结果 (可选连同帧); 只在结果已发布时返回 Some
    fn take_outcome(
        &self,
        results: &mut ResultState,
        key: &FrameKey,
        with_frame: bool,
    ) -> Option<Result<(DetectionSet, Option<Frame>)>> {
        let entry = results.entries.get_mut(key)?;
        let taken = match entry.outcome.take()? {
            Outcome::Completed(set) => {
                let frame = if with_frame { entry.frame.take() } else { None };
                Ok((set, frame))
            }
            Outcome::Failed(e) => Err(e),
        };
        if entry.is_spent() {
            results.entries.remove(key);
        }
        self.counters.consumed.fetch_add(1, Ordering::Relaxed);
        Some(taken)
    }

    fn wait_for(
        &self,
        key: &FrameKey,
        timeout: Duration,
        with_frame: bool,
    ) -> Result<(DetectionSet, Option<Frame>)> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.is_pending(key);
            let mut results = lock(&self.results);
            self.evict(&mut results);
            if let Some(outcome) = self.take_outcome(&mut results, key, with_frame) {
                return outcome;
            }
            if !pending {
                return Err(if self.shutdown.load(Ordering::Acquire) {
                    PipelineError::Shutdown
                } else {
                    PipelineError::NotFound(format!("no result for {}", key))
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::Timeout(timeout));
            }
            let (guard, _) = self
                .result_cv
                .wait_timeout(results, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            drop(guard);
        }
    }
}

// ========== 分发器 ==========

pub struct InferenceDispatcher {
    shared: Arc<Shared>,
    slots: Vec<Arc<SlotState>>,
    allocator: Arc<AcceleratorCoreAllocator>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl InferenceDispatcher {
    /// 构造 M 个 worker (各自独立的引擎实例) 并启动线程
    pub fn spawn(
        spec: ModelSpec,
        model_bytes: &[u8],
        factory: &EngineFactory,
        allocator: Arc<AcceleratorCoreAllocator>,
        config: &DispatcherConfig,
        balancing: Balancing,
        clock: SharedClock,
    ) -> Result<Self> {
        spec.validate()?;
        if config.workers == 0 || config.max_depth == 0 || config.result_cap == 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "dispatcher needs workers, depth and result cap > 0, got {:?}",
                config
            )));
        }
        let spec = Arc::new(spec);
        let tag = spec.model_tag();

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            workers.push(InferenceWorker::new(
                index,
                factory(),
                spec.clone(),
                model_bytes,
                allocator.clone(),
                balancing,
                clock.clone(),
            )?);
        }
        let slots = workers.iter().map(|w| w.slot_state()).collect();

        let shared = Arc::new(Shared {
            tag: tag.clone(),
            config: config.clone(),
            clock,
            queue: Mutex::new(QueueState::default()),
            work_cv: Condvar::new(),
            space_cv: Condvar::new(),
            results: Mutex::new(ResultState::default()),
            result_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let dispatcher = Self {
            shared,
            slots,
            allocator,
            handles: Mutex::new(Vec::new()),
        };
        for worker in workers {
            let shared = dispatcher.shared.clone();
            let name = format!("infer-{}-{}", tag, worker.index());
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(shared, worker))
                .map_err(|e| {
                    PipelineError::NotInitialized(format!("spawn worker thread: {}", e))
                });
            match handle {
                Ok(h) => lock(&dispatcher.handles).push(h),
                Err(e) => {
                    dispatcher.shutdown();
                    return Err(e);
                }
            }
        }
        info!(
            "✅ 分发器 {} 已启动: {} workers, max_depth {}",
            tag, config.workers, config.max_depth
        );
        Ok(dispatcher)
    }

    pub fn tag(&self) -> &ModelTag {
        &self.shared.tag
    }

    pub fn max_depth(&self) -> usize {
        self.shared.config.max_depth
    }

    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    /// 非阻塞提交; 满队列返回 Backpressured 并退回帧
    pub fn submit(&self, frame: Frame) -> std::result::Result<FrameKey, Rejected> {
        let mut q = lock(&self.shared.queue);
        self.try_enqueue(&mut q, frame)
    }

    /// 满队列时最多等待 `timeout` 再提交
    pub fn submit_timeout(
        &self,
        frame: Frame,
        timeout: Duration,
    ) -> std::result::Result<FrameKey, Rejected> {
        let deadline = Instant::now() + timeout;
        let mut q = lock(&self.shared.queue);
        while !q.shutdown && q.depth() >= self.shared.config.max_depth {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .shared
                .space_cv
                .wait_timeout(q, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            q = guard;
        }
        self.try_enqueue(&mut q, frame)
    }

    fn try_enqueue(
        &self,
        q: &mut QueueState,
        frame: Frame,
    ) -> std::result::Result<FrameKey, Rejected> {
        if q.shutdown {
            return Err(Rejected {
                frame,
                error: PipelineError::Shutdown,
            });
        }
        let key = frame.key().clone();
        if let Some(&last) = q.last_submitted.get(&key.stream) {
            if key.frame_id <= last {
                return Err(Rejected {
                    frame,
                    error: PipelineError::InvalidArgument(format!(
                        "frame id {} not above last submitted {} for stream {}",
                        key.frame_id, last, key.stream
                    )),
                });
            }
        }
        let depth = q.depth();
        let limit = self.shared.config.max_depth;
        if depth >= limit {
            self.shared
                .counters
                .backpressured
                .fetch_add(1, Ordering::Relaxed);
            return Err(Rejected {
                frame,
                error: PipelineError::Backpressured { depth, limit },
            });
        }

        q.last_submitted.insert(key.stream.clone(), key.frame_id);
        *q.outstanding.entry(key.stream.clone()).or_insert(0) += 1;
        q.queued.insert(key.clone());
        q.pending.push_back(frame);
        q.peak_depth = q.peak_depth.max(q.depth());
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.work_cv.notify_one();
        Ok(key)
    }

    /// 非阻塞取结果 (帧缓冲保留, 供 take_frame_buffer 取走)
    pub fn try_take_result(&self, key: &FrameKey) -> ResultPoll {
        let pending = self.shared.is_pending(key);
        let mut results = lock(&self.shared.results);
        self.shared.evict(&mut results);
        match self.shared.take_outcome(&mut results, key, false) {
            Some(Ok((set, _))) => ResultPoll::Ready(set),
            Some(Err(e)) => ResultPoll::Failed(e),
            None if pending => ResultPoll::NotReady,
            None => ResultPoll::NotFound,
        }
    }

    /// 阻塞等待结果, 直到完成或超时
    pub fn take_result_blocking(&self, key: &FrameKey, timeout: Duration) -> Result<DetectionSet> {
        self.shared.wait_for(key, timeout, false).map(|(set, _)| set)
    }

    /// 取走与结果对应的源帧; 被淘汰后返回 NotFound
    pub fn take_frame_buffer(&self, key: &FrameKey) -> Result<Frame> {
        let mut results = lock(&self.shared.results);
        self.shared.evict(&mut results);
        let entry = results
            .entries
            .get_mut(key)
            .ok_or_else(|| PipelineError::NotFound(format!("no frame buffer for {}", key)))?;
        let frame = entry
            .frame
            .take()
            .ok_or_else(|| PipelineError::NotFound(format!("frame buffer for {} already taken", key)))?;
        if entry.is_spent() {
            results.entries.remove(key);
        }
        Ok(frame)
    }

    /// 阻塞等待并一次性取走 (结果, 源帧)
    pub fn take_completed(&self, key: &FrameKey, timeout: Duration) -> Result<(DetectionSet, Frame)> {
        let (set, frame) = self.shared.wait_for(key, timeout, true)?;
        let frame = frame.ok_or_else(|| {
            PipelineError::NotFound(format!("frame buffer for {} already taken", key))
        })?;
        Ok((set, frame))
    }

    /// 指定流中帧号 ≤ cursor 的最新已完成结果
    pub fn latest_completed(&self, stream: &StreamId, cursor: u64) -> Option<FrameKey> {
        let mut results = lock(&self.shared.results);
        self.shared.evict(&mut results);
        let lo = FrameKey::new(stream.clone(), 0);
        let hi = FrameKey::new(stream.clone(), cursor);
        results
            .entries
            .range(lo..=hi)
            .rev()
            .find(|(_, e)| matches!(e.outcome, Some(Outcome::Completed(_))))
            .map(|(k, _)| k.clone())
    }

    /// 停流: 丢弃该流排队中的帧和未消费的结果, 返回丢弃的排队帧数
    pub fn drain_stream(&self, stream: &StreamId) -> usize {
        let dropped = {
            let mut q = lock(&self.shared.queue);
            let before = q.pending.len();
            let (keep, removed): (VecDeque<Frame>, VecDeque<Frame>) =
                q.pending.drain(..).partition(|f| f.stream() != stream);
            q.pending = keep;
            for frame in &removed {
                q.queued.remove(frame.key());
                q.release(stream);
            }
            self.shared.space_cv.notify_all();
            before - q.pending.len()
        };

        let mut results = lock(&self.shared.results);
        results.entries.retain(|k, _| &k.stream != stream);
        if dropped > 0 {
            info!("🗑️  [{}] drained {} queued frames of {}", self.shared.tag, dropped, stream);
        }
        dropped
    }

    /// 移除流: 排空并忘记其帧号基线
    pub fn forget_stream(&self, stream: &StreamId) {
        self.drain_stream(stream);
        lock(&self.shared.queue).last_submitted.remove(stream);
    }

    /// 排队 + 执行中
    pub fn queue_depth(&self) -> usize {
        lock(&self.shared.queue).depth()
    }

    pub fn peak_queue_depth(&self) -> usize {
        lock(&self.shared.queue).peak_depth
    }

    /// 某条流在分发器内 (排队 + 执行中) 的帧数
    pub fn stream_outstanding(&self, stream: &StreamId) -> usize {
        lock(&self.shared.queue)
            .outstanding
            .get(stream)
            .copied()
            .unwrap_or(0)
    }

    pub fn worker_slots(&self) -> Vec<WorkerSlot> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| s.snapshot(i))
            .collect()
    }

    pub fn core_loads(&self) -> Vec<usize> {
        self.allocator.snapshot()
    }

    pub fn metrics(&self) -> DispatcherMetrics {
        let c = &self.shared.counters;
        let (depth, peak_depth) = {
            let q = lock(&self.shared.queue);
            (q.depth(), q.peak_depth)
        };
        DispatcherMetrics {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            consumed: c.consumed.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            backpressured: c.backpressured.load(Ordering::Relaxed),
            depth,
            peak_depth,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// 唤醒所有 worker; 执行中的帧跑完后退出, 排队中的帧丢弃
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut q = lock(&self.shared.queue);
            q.shutdown = true;
            let frames: Vec<Frame> = q.pending.drain(..).collect();
            for frame in &frames {
                q.queued.remove(frame.key());
                q.release(frame.stream());
            }
            self.shared.work_cv.notify_all();
            self.shared.space_cv.notify_all();
            frames.len()
        };
        {
            let _results = lock(&self.shared.results);
            self.shared.result_cv.notify_all();
        }

        let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("⚠️  [{}] worker thread panicked", self.shared.tag);
            }
        }
        info!(
            "🛑 分发器 {} 已停止 (丢弃排队帧 {})",
            self.shared.tag, dropped
        );
    }
}

impl Drop for InferenceDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, mut worker: InferenceWorker) {
    debug!("🚀 [{}] worker {} started", shared.tag, worker.index());
    loop {
        let frame = {
            let mut q = lock(&shared.queue);
            loop {
                if q.shutdown {
                    debug!("[{}] worker {} exiting", shared.tag, worker.index());
                    return;
                }
                if let Some(frame) = q.pending.pop_front() {
                    let key = frame.key().clone();
                    q.queued.remove(&key);
                    q.in_flight.insert(key);
                    break frame;
                }
                q = shared
                    .work_cv
                    .wait(q)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };

        let key = frame.key().clone();
        // 引擎或解码 panic 也要发布结果, 否则该帧永远占着队列深度
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.run(&frame)))
            .unwrap_or_else(|payload| {
                worker.abandon_task();
                warn!(
                    "💥 [{}] worker {} panicked on {}",
                    shared.tag,
                    worker.index(),
                    key
                );
                Err(PipelineError::InferenceFailed {
                    key: key.clone(),
                    reason: format!("worker panicked: {}", panic_message(payload.as_ref())),
                })
            });
        shared.publish(key, frame, outcome);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
