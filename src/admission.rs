// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 单流准入控制: 跳帧 → 配额检查 → 分配帧号 → 提交
/// Per-stream admission between the decoder callback and the dispatcher
///
/// 过载时丢弃的是最新到达的帧, 而不是队首.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use log::{debug, warn};

use crate::engine::{InferenceDispatcher, Rejected};
use crate::error::PipelineError;
use crate::stats::StatsAggregator;
use crate::supervisor::StreamHealth;
use crate::types::{Frame, FrameKey, RawFrame, StreamId};

/// 一帧的准入结果
#[derive(Debug)]
pub enum Admission {
    Submitted(FrameKey),
    /// 跳帧策略跳过
    Skipped,
    Dropped(DropReason),
    Rejected(PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// 本流在分发器中的帧数已达配额
    StreamAllotment,
    /// 分发器整体已满
    Backpressured,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdmissionCounters {
    pub decoded: u64,
    pub skipped: u64,
    pub submitted: u64,
    pub dropped: u64,
    pub rejected: u64,
}

struct AdapterState {
    decoded: u64,
    last_id: u64,
    counters: AdmissionCounters,
}

pub struct FrameSourceAdapter {
    stream: StreamId,
    dispatcher: Arc<InferenceDispatcher>,
    frame_skip: u64,
    block_on_full: Option<Duration>,
    max_inflight: Arc<AtomicUsize>,
    stats: Arc<StatsAggregator>,
    health: Arc<StreamHealth>,
    admitted: Sender<FrameKey>,
    stopped: AtomicBool,
    state: Mutex<AdapterState>,
}

impl FrameSourceAdapter {
    /// `last_id` 为该流此前分配的最后一个帧号, 新帧号从其后开始
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: StreamId,
        dispatcher: Arc<InferenceDispatcher>,
        frame_skip: u32,
        block_on_full: Option<Duration>,
        max_inflight: Arc<AtomicUsize>,
        stats: Arc<StatsAggregator>,
        health: Arc<StreamHealth>,
        admitted: Sender<FrameKey>,
        last_id: u64,
    ) -> Self {
        Self {
            stream,
            dispatcher,
            frame_skip: frame_skip.max(1) as u64,
            block_on_full,
            max_inflight,
            stats,
            health,
            admitted,
            stopped: AtomicBool::new(false),
            state: Mutex::new(AdapterState {
                decoded: 0,
                last_id,
                counters: AdmissionCounters::default(),
            }),
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// 最后一个成功提交的帧号
    pub fn last_id(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).last_id
    }

    pub fn counters(&self) -> AdmissionCounters {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).counters
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight.load(Ordering::Acquire)
    }

    fn drop_frame(&self, state: &mut AdapterState, reason: DropReason) -> Admission {
        state.counters.dropped += 1;
        self.stats.on_drop();
        self.health.record_failure();
        debug!("⏭️  [{}] dropped newest frame: {:?}", self.stream, reason);
        Admission::Dropped(reason)
    }

    /// 解码器回调入口; 默认不阻塞
    pub fn on_frame(&self, raw: RawFrame) -> Admission {
        if self.is_stopped() {
            return Admission::Dropped(DropReason::Stopped);
        }
        // 持锁保证帧号分配与提交顺序一致
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.decoded += 1;
        state.counters.decoded += 1;
        if (state.decoded - 1) % self.frame_skip != 0 {
            state.counters.skipped += 1;
            return Admission::Skipped;
        }

        let outstanding = self.dispatcher.stream_outstanding(&self.stream);
        if outstanding >= self.max_inflight() {
            return self.drop_frame(&mut state, DropReason::StreamAllotment);
        }

        let frame_id = state.last_id + 1;
        let frame = match Frame::from_raw(self.stream.clone(), frame_id, raw) {
            Ok(frame) => frame,
            Err(e) => {
                state.counters.rejected += 1;
                self.health.record_failure();
                warn!("⚠️  [{}] bad frame from decoder: {}", self.stream, e);
                return Admission::Rejected(e);
            }
        };

        let submitted = match self.block_on_full {
            Some(wait) => self.dispatcher.submit_timeout(frame, wait),
            None => self.dispatcher.submit(frame),
        };
        match submitted {
            Ok(key) => {
                // 只有提交成功才占用帧号
                state.last_id = frame_id;
                state.counters.submitted += 1;
                match self.admitted.try_send(key.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("⚠️  [{}] consumer backlog full, {} will expire", self.stream, key)
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!("[{}] consumer gone, {} will expire", self.stream, key)
                    }
                }
                Admission::Submitted(key)
            }
            Err(Rejected {
                error: PipelineError::Backpressured { .. },
                ..
            }) => self.drop_frame(&mut state, DropReason::Backpressured),
            Err(Rejected { error, .. }) => {
                state.counters.rejected += 1;
                Admission::Rejected(error)
            }
        }
    }
}

/// 按优先级把 `budget` 个在途名额分给各流: 每流先保底 1 个, 余下按最大余数法分配
pub fn priority_allotments(budget: usize, priorities: &[(StreamId, u32)]) -> HashMap<StreamId, usize> {
    let mut out = HashMap::with_capacity(priorities.len());
    if priorities.is_empty() {
        return out;
    }
    let spare = budget.saturating_sub(priorities.len()) as u64;
    let weights: Vec<u64> = priorities.iter().map(|(_, p)| (*p).max(1) as u64).collect();
    let total: u64 = weights.iter().sum();

    let mut shares: Vec<(usize, u64)> = weights
        .iter()
        .map(|w| {
            let exact = spare * w;
            (1 + (exact / total) as usize, exact % total)
        })
        .collect();

    let assigned: u64 = shares.iter().map(|(n, _)| (*n - 1) as u64).sum();
    let mut remaining = spare - assigned;
    // 余数大者优先, 同余数按加入顺序
    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.sort_by(|a, b| shares[*b].1.cmp(&shares[*a].1).then(a.cmp(b)));
    for i in order {
        if remaining == 0 {
            break;
        }
        shares[i].0 += 1;
        remaining -= 1;
    }

    for ((stream, _), (n, _)) in priorities.iter().zip(shares) {
        out.insert(stream.clone(), n);
    }
    out
}
