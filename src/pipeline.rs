// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 面向宿主的流水线: 流生命周期 / 模型 / 级联参数 / 统计 / 绘制过滤 / 渲染面
/// Host-facing pipeline
///
/// 每个注册的模型一个分发器 (worker 池), 每条运行中的流一个结果消费线程:
///
/// ```text
/// Decoder ─▶ FrameSourceAdapter ─▶ InferenceDispatcher ─▶ workers
///                   │ (FrameKey)                               │
///                   └────────▶ consumer: CascadeCoordinator ◀──┘
///                                        │
///                                        └─▶ ResultSink ─▶ Renderer
/// ```
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::admission::{priority_allotments, AdmissionCounters, FrameSourceAdapter};
use crate::capability::{
    DecoderFactory, EngineFactory, FaceAnalysis, FrameCallback, Renderer, SharedClock,
};
use crate::cascade::{CascadeCoordinator, SharedCascadeConfig};
use crate::config::{CascadeConfig, PipelineConfig};
use crate::engine::{AcceleratorCoreAllocator, DispatcherMetrics, InferenceDispatcher};
use crate::error::{PipelineError, Result};
use crate::models::ModelSpec;
use crate::sink::{Delivery, DrawClassFilter, OverlayPainter, ResultSink, SinkCounters};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::supervisor::{
    SharedDecoder, StreamHealth, StreamHealthReport, StreamSupervisor, SupervisorAction,
};
use crate::types::{ModelTag, StreamId};

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://\S+$").expect("valid url pattern"));

const CONSUMER_POLL: Duration = Duration::from_millis(100);

/// add_stream 返回的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 统计查询 / 重置范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsScope {
    Stream(StreamHandle),
    Global,
}

struct ModelSlot {
    order: usize,
    spec: Arc<ModelSpec>,
    dispatcher: Arc<InferenceDispatcher>,
}

struct RunningStream {
    adapter: Arc<FrameSourceAdapter>,
    dispatcher: Arc<InferenceDispatcher>,
    stop: Arc<AtomicBool>,
    consumer: JoinHandle<()>,
}

struct StreamEntry {
    id: StreamId,
    url: String,
    priority: u32,
    model: ModelTag,
    stats: Arc<StatsAggregator>,
    health: Arc<StreamHealth>,
    sink: Arc<ResultSink>,
    decoder: SharedDecoder,
    max_inflight: Arc<AtomicUsize>,
    /// 跨 stop/start 保持帧号单调
    last_id: u64,
    running: Option<RunningStream>,
}

pub struct Pipeline {
    config: PipelineConfig,
    clock: SharedClock,
    allocator: Arc<AcceleratorCoreAllocator>,
    decoders: Arc<dyn DecoderFactory>,
    face: Option<Arc<dyn FaceAnalysis>>,
    cascade: SharedCascadeConfig,
    draw_filter: DrawClassFilter,
    painter: Arc<OverlayPainter>,
    supervisor: StreamSupervisor,
    models: RwLock<HashMap<ModelTag, ModelSlot>>,
    streams: Mutex<BTreeMap<StreamHandle, StreamEntry>>,
    next_handle: AtomicU64,
    shutdown: AtomicBool,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        decoders: Arc<dyn DecoderFactory>,
        face: Option<Arc<dyn FaceAnalysis>>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        if config.cascade.enable_face_analysis && face.is_none() {
            return Err(PipelineError::CapabilityUnavailable(
                "face analysis enabled but no analyzer was provided".into(),
            ));
        }
        let allocator = Arc::new(AcceleratorCoreAllocator::new(
            config.accelerator.core_count,
            config.accelerator.max_in_flight_per_core,
        )?);
        let painter = Arc::new(OverlayPainter::new(&config.overlay)?);
        let supervisor = StreamSupervisor::new(config.supervisor.clone(), clock.clone());
        supervisor.start()?;

        info!(
            "🚀 pipeline ready: {} cores, {} workers per model, face analysis {}",
            config.accelerator.core_count,
            config.dispatcher.workers,
            if face.is_some() { "available" } else { "unavailable" }
        );
        Ok(Self {
            cascade: Arc::new(RwLock::new(config.cascade.clone())),
            config,
            clock,
            allocator,
            decoders,
            face,
            draw_filter: Arc::new(RwLock::new(None)),
            painter,
            supervisor,
            models: RwLock::new(HashMap::new()),
            streams: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        })
    }

    fn streams(&self) -> MutexGuard<'_, BTreeMap<StreamHandle, StreamEntry>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PipelineError::Shutdown);
        }
        Ok(())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ========== 模型 ==========

    /// 注册模型并启动其 worker 池; 第一个注册的模型为新流的默认模型
    pub fn register_model(&self, spec: ModelSpec, model_bytes: &[u8], factory: EngineFactory) -> Result<()> {
        self.ensure_running()?;
        let tag = spec.model_tag();
        if self.model_available(&tag) {
            return Err(PipelineError::InvalidArgument(format!(
                "model {} already registered",
                tag
            )));
        }
        let spec_arc = Arc::new(spec.clone());
        let dispatcher = InferenceDispatcher::spawn(
            spec,
            model_bytes,
            &factory,
            self.allocator.clone(),
            &self.config.dispatcher,
            self.config.accelerator.balancing,
            self.clock.clone(),
        )?;
        let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());
        if models.contains_key(&tag) {
            dispatcher.shutdown();
            return Err(PipelineError::InvalidArgument(format!(
                "model {} already registered",
                tag
            )));
        }
        let order = models.len();
        models.insert(
            tag.clone(),
            ModelSlot {
                order,
                spec: spec_arc,
                dispatcher: Arc::new(dispatcher),
            },
        );
        info!("📦 model {} registered", tag);
        Ok(())
    }

    pub fn model_available(&self, tag: &ModelTag) -> bool {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(tag)
    }

    pub fn model_spec(&self, tag: &ModelTag) -> Option<Arc<ModelSpec>> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
            .map(|m| m.spec.clone())
    }

    fn dispatcher_for(&self, tag: &ModelTag) -> Result<Arc<InferenceDispatcher>> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
            .map(|m| m.dispatcher.clone())
            .ok_or_else(|| PipelineError::NotInitialized(format!("model {} not registered", tag)))
    }

    fn default_model(&self) -> Option<ModelTag> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        models
            .iter()
            .min_by_key(|(_, m)| m.order)
            .map(|(tag, _)| tag.clone())
    }

    pub fn dispatcher_metrics(&self, tag: &ModelTag) -> Result<DispatcherMetrics> {
        Ok(self.dispatcher_for(tag)?.metrics())
    }

    // ========== 流生命周期 ==========

    pub fn add_stream(&self, id: impl Into<StreamId>, url: &str, priority: u32) -> Result<StreamHandle> {
        self.ensure_running()?;
        let id = id.into();
        if id.as_str().is_empty() {
            return Err(PipelineError::InvalidArgument("empty stream id".into()));
        }
        if !URL_RE.is_match(url) {
            return Err(PipelineError::InvalidArgument(format!("bad stream url {:?}", url)));
        }
        let model = self
            .default_model()
            .ok_or_else(|| PipelineError::NotInitialized("no model registered".into()))?;

        let mut streams = self.streams();
        if streams.values().any(|s| s.id == id) {
            return Err(PipelineError::InvalidArgument(format!("stream {} already added", id)));
        }
        let handle = StreamHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let health = Arc::new(StreamHealth::new(id.clone(), self.clock.clone()));
        let stats = Arc::new(StatsAggregator::new(
            id.as_str(),
            self.config.stats.clone(),
            self.clock.clone(),
        ));
        let sink = Arc::new(ResultSink::new(
            id.clone(),
            self.painter.clone(),
            self.draw_filter.clone(),
            health.clone(),
        ));
        let decoder: SharedDecoder = Arc::new(Mutex::new(self.decoders.create(&id)));
        info!("➕ stream {} {} ({}) priority {} → {}", handle, id, url, priority, model);
        streams.insert(
            handle,
            StreamEntry {
                id,
                url: url.to_string(),
                priority,
                model,
                stats,
                health,
                sink,
                decoder,
                max_inflight: Arc::new(AtomicUsize::new(1)),
                last_id: 0,
                running: None,
            },
        );
        Ok(handle)
    }

    pub fn start(&self, handle: StreamHandle) -> Result<()> {
        self.ensure_running()?;
        let mut streams = self.streams();
        self.start_locked(&mut streams, handle)?;
        self.rebalance(&streams);
        Ok(())
    }

    fn start_locked(&self, streams: &mut BTreeMap<StreamHandle, StreamEntry>, handle: StreamHandle) -> Result<()> {
        let entry = streams
            .get_mut(&handle)
            .ok_or_else(|| unknown_handle(handle))?;
        if entry.running.is_some() {
            return Ok(());
        }
        let dispatcher = self.dispatcher_for(&entry.model)?;

        let (tx, rx) = bounded(self.config.dispatcher.result_cap);
        let adapter = Arc::new(FrameSourceAdapter::new(
            entry.id.clone(),
            dispatcher.clone(),
            self.config.stream.frame_skip,
            self.config.stream.block_on_full_ms.map(Duration::from_millis),
            entry.max_inflight.clone(),
            entry.stats.clone(),
            entry.health.clone(),
            tx,
            entry.last_id,
        ));
        let coordinator = CascadeCoordinator::new(
            entry.id.clone(),
            dispatcher.clone(),
            self.face.clone(),
            self.cascade.clone(),
            entry.stats.clone(),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let consumer = {
            let stop = stop.clone();
            let sink = entry.sink.clone();
            let health = entry.health.clone();
            let stats = entry.stats.clone();
            let timeout = Duration::from_millis(self.config.stream.result_timeout_ms);
            thread::Builder::new()
                .name(format!("sink-{}", entry.id))
                .spawn(move || loop {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    match rx.recv_timeout(CONSUMER_POLL) {
                        Ok(key) => match coordinator.finish(&key, timeout) {
                            Ok((result, frame)) => {
                                sink.deliver(&frame, &result);
                            }
                            Err(PipelineError::Shutdown) => break,
                            Err(e) => {
                                health.record_failure();
                                debug!("[{}] {} dropped: {}", coordinator.stream(), key, e);
                            }
                        },
                        Err(RecvTimeoutError::Timeout) => stats.maintain(),
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .map_err(|e| PipelineError::NotInitialized(format!("consumer thread: {}", e)))?
        };

        entry.health.reset_baseline();
        let callback: FrameCallback = {
            let adapter = adapter.clone();
            Arc::new(move |raw| {
                adapter.on_frame(raw);
            })
        };
        let opened = entry
            .decoder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .open(&entry.url, callback);
        if let Err(e) = opened {
            adapter.stop();
            stop.store(true, Ordering::Release);
            if consumer.join().is_err() {
                warn!("⚠️  [{}] consumer thread panicked", entry.id);
            }
            return Err(PipelineError::NotInitialized(format!(
                "decoder for {}: {:#}",
                entry.id, e
            )));
        }

        self.supervisor.watch(entry.health.clone(), entry.decoder.clone());
        entry.running = Some(RunningStream {
            adapter,
            dispatcher,
            stop,
            consumer,
        });
        info!("▶️  stream {} started on {}", entry.id, entry.model);
        Ok(())
    }

    pub fn stop(&self, handle: StreamHandle) -> Result<()> {
        let mut streams = self.streams();
        self.stop_locked(&mut streams, handle)?;
        self.rebalance(&streams);
        Ok(())
    }

    fn stop_locked(&self, streams: &mut BTreeMap<StreamHandle, StreamEntry>, handle: StreamHandle) -> Result<()> {
        let entry = streams
            .get_mut(&handle)
            .ok_or_else(|| unknown_handle(handle))?;
        let Some(running) = entry.running.take() else {
            return Ok(());
        };
        self.supervisor.unwatch(&entry.id);

        // 先截断入口, 再停解码器, 最后停消费线程
        running.adapter.stop();
        entry.decoder.lock().unwrap_or_else(|e| e.into_inner()).close();
        running.stop.store(true, Ordering::Release);
        if running.consumer.join().is_err() {
            warn!("⚠️  [{}] consumer thread panicked", entry.id);
        }
        let drained = running.dispatcher.drain_stream(&entry.id);
        entry.last_id = running.adapter.last_id();
        info!(
            "⏹️  stream {} stopped at frame {} ({} queued frames dropped)",
            entry.id, entry.last_id, drained
        );
        Ok(())
    }

    pub fn remove_stream(&self, handle: StreamHandle) -> Result<()> {
        let mut streams = self.streams();
        self.stop_locked(&mut streams, handle)?;
        if let Some(entry) = streams.remove(&handle) {
            if let Ok(dispatcher) = self.dispatcher_for(&entry.model) {
                dispatcher.forget_stream(&entry.id);
            }
            info!("➖ stream {} removed", entry.id);
        }
        self.rebalance(&streams);
        Ok(())
    }

    /// 切换模型; 运行中的流会先停再启
    pub fn select_model(&self, handle: StreamHandle, tag: &ModelTag) -> Result<()> {
        self.ensure_running()?;
        if !self.model_available(tag) {
            return Err(PipelineError::InvalidArgument(format!("model {} not registered", tag)));
        }
        let mut streams = self.streams();
        let (was_running, previous) = {
            let entry = streams
                .get(&handle)
                .ok_or_else(|| unknown_handle(handle))?;
            if &entry.model == tag {
                return Ok(());
            }
            (entry.running.is_some(), entry.model.clone())
        };
        if was_running {
            self.stop_locked(&mut streams, handle)?;
        }
        if let Some(entry) = streams.get_mut(&handle) {
            if let Ok(old) = self.dispatcher_for(&previous) {
                old.forget_stream(&entry.id);
            }
            entry.model = tag.clone();
            info!("🔀 stream {} switched {} → {}", entry.id, previous, tag);
        }
        let restarted = if was_running {
            self.start_locked(&mut streams, handle)
        } else {
            Ok(())
        };
        self.rebalance(&streams);
        restarted
    }

    /// 按优先级重新分配每个分发器的在途名额 (只算运行中的流)
    fn rebalance(&self, streams: &BTreeMap<StreamHandle, StreamEntry>) {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        for (tag, slot) in models.iter() {
            let members: Vec<&StreamEntry> = streams
                .values()
                .filter(|s| s.running.is_some() && &s.model == tag)
                .collect();
            if members.is_empty() {
                continue;
            }
            let weights: Vec<(StreamId, u32)> =
                members.iter().map(|s| (s.id.clone(), s.priority)).collect();
            let shares = priority_allotments(slot.dispatcher.max_depth(), &weights);
            for s in members {
                let share = shares.get(&s.id).copied().unwrap_or(1);
                s.max_inflight.store(share, Ordering::Release);
                debug!("⚖️  {} on {}: max_inflight {}", s.id, tag, share);
            }
        }
    }

    pub fn stream_ids(&self) -> Vec<(StreamHandle, StreamId)> {
        self.streams()
            .iter()
            .map(|(h, s)| (*h, s.id.clone()))
            .collect()
    }

    pub fn is_running(&self, handle: StreamHandle) -> Result<bool> {
        self.with_entry(handle, |e| e.running.is_some())
    }

    pub fn stream_model(&self, handle: StreamHandle) -> Result<ModelTag> {
        self.with_entry(handle, |e| e.model.clone())
    }

    pub fn max_inflight(&self, handle: StreamHandle) -> Result<usize> {
        self.with_entry(handle, |e| e.max_inflight.load(Ordering::Acquire))
    }

    /// 运行中的流的准入计数; 未运行时为 None
    pub fn admission_counters(&self, handle: StreamHandle) -> Result<Option<AdmissionCounters>> {
        self.with_entry(handle, |e| e.running.as_ref().map(|r| r.adapter.counters()))
    }

    pub fn sink_counters(&self, handle: StreamHandle) -> Result<SinkCounters> {
        self.with_entry(handle, |e| e.sink.counters())
    }

    fn with_entry<T>(&self, handle: StreamHandle, f: impl FnOnce(&StreamEntry) -> T) -> Result<T> {
        let streams = self.streams();
        let entry = streams.get(&handle).ok_or_else(|| unknown_handle(handle))?;
        Ok(f(entry))
    }

    // ========== 级联 / 绘制 ==========

    pub fn set_cascade_config(&self, config: CascadeConfig) -> Result<()> {
        config.validate()?;
        if config.enable_face_analysis && self.face.is_none() {
            return Err(PipelineError::CapabilityUnavailable(
                "face analysis is not available".into(),
            ));
        }
        info!("🔧 cascade config updated: {:?}", config);
        *self.cascade.write().unwrap_or_else(|e| e.into_inner()) = config;
        Ok(())
    }

    pub fn cascade_config(&self) -> CascadeConfig {
        self.cascade.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 只绘制给定类别 (不影响检测与统计)
    pub fn set_enabled_draw_classes(&self, classes: HashSet<String>) {
        debug!("🎨 draw classes: {:?}", classes);
        *self.draw_filter.write().unwrap_or_else(|e| e.into_inner()) = Some(classes);
    }

    pub fn clear_draw_class_filter(&self) {
        *self.draw_filter.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn bind_render_surface(&self, handle: StreamHandle, surface: Arc<dyn Renderer>) -> Result<()> {
        self.with_entry(handle, |e| e.sink.bind(surface))
    }

    pub fn unbind_render_surface(&self, handle: StreamHandle) -> Result<()> {
        self.with_entry(handle, |e| {
            e.sink.unbind();
        })
    }

    /// 重新呈现该流最后一帧完整标注帧
    pub fn present_last_good(&self, handle: StreamHandle) -> Result<Delivery> {
        self.with_entry(handle, |e| e.sink.present_last_good())
    }

    // ========== 统计 / 健康 ==========

    pub fn stats_snapshot(&self, scope: StatsScope) -> Result<StatsSnapshot> {
        match scope {
            StatsScope::Stream(handle) => self.with_entry(handle, |e| e.stats.snapshot()),
            StatsScope::Global => {
                let snapshots: Vec<StatsSnapshot> =
                    self.streams().values().map(|e| e.stats.snapshot()).collect();
                Ok(StatsSnapshot::merged(&snapshots).unwrap_or_else(|| StatsSnapshot::empty(Utc::now())))
            }
        }
    }

    pub fn reset_stats(&self, scope: StatsScope) -> Result<()> {
        match scope {
            StatsScope::Stream(handle) => self.with_entry(handle, |e| e.stats.reset()),
            StatsScope::Global => {
                for entry in self.streams().values() {
                    entry.stats.reset();
                }
                Ok(())
            }
        }
    }

    pub fn stats_report(&self, handle: StreamHandle) -> Result<String> {
        self.with_entry(handle, |e| e.stats.report())
    }

    /// 重启次数耗尽后返回 `Stalled`
    pub fn stream_health(&self, handle: StreamHandle) -> Result<StreamHealthReport> {
        let health = self.with_entry(handle, |e| e.health.clone())?;
        health.check()
    }

    /// 立即执行一次看门狗巡检
    pub fn check_streams(&self) -> Vec<(StreamId, SupervisorAction)> {
        self.supervisor.check_now()
    }

    // ========== 关闭 ==========

    /// 停止所有流与 worker; 可重复调用
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🛑 pipeline shutting down");
        {
            let mut streams = self.streams();
            let handles: Vec<StreamHandle> = streams.keys().copied().collect();
            for handle in handles {
                if let Err(e) = self.stop_locked(&mut streams, handle) {
                    warn!("⚠️  stop {} during shutdown: {}", handle, e);
                }
            }
        }
        self.supervisor.shutdown();
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        for slot in models.values() {
            slot.dispatcher.shutdown();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unknown_handle(handle: StreamHandle) -> PipelineError {
    PipelineError::InvalidArgument(format!("unknown stream handle {}", handle))
}
