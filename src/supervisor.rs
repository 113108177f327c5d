// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 流健康看门狗: 停滞检测 + 有限次重启
/// Per-stream stall watchdog. Only ever talks to the decoder.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::capability::{Decoder, SharedClock};
use crate::config::SupervisorConfig;
use crate::error::{PipelineError, Result};
use crate::types::StreamId;

/// 解码器由流水线与看门狗共享
pub type SharedDecoder = Arc<Mutex<Box<dyn Decoder>>>;

#[derive(Debug, Default)]
struct HealthState {
    last_success_ms: u64,
    consecutive_failures: u32,
    stalled: bool,
    exhausted: bool,
    restart_attempts: u32,
    total_restarts: u64,
    last_restart_ms: Option<u64>,
    delivered: u64,
}

/// 健康状态报告
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamHealthReport {
    pub stream: StreamId,
    pub last_success_ms: u64,
    pub since_success_ms: u64,
    pub consecutive_failures: u32,
    pub stalled: bool,
    pub exhausted: bool,
    pub restart_attempts: u32,
    pub total_restarts: u64,
    pub delivered: u64,
}

/// 单流健康记录, 由准入 / 消费线程写入, 看门狗读取
pub struct StreamHealth {
    stream: StreamId,
    clock: SharedClock,
    state: Mutex<HealthState>,
    /// 是否仍在看门狗名单中; stop 先清掉它再关闭解码器
    attached: AtomicBool,
}

impl StreamHealth {
    pub fn new(stream: StreamId, clock: SharedClock) -> Self {
        let state = HealthState {
            last_success_ms: clock.now_ms(),
            ..Default::default()
        };
        Self {
            stream,
            clock,
            state: Mutex::new(state),
            attached: AtomicBool::new(false),
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// 一帧成功交给 sink
    pub fn record_success(&self) {
        let now = self.clock.now_ms();
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.last_success_ms = now;
        s.consecutive_failures = 0;
        s.delivered += 1;
        if s.stalled || s.exhausted {
            info!(
                "✅ [{}] 流已恢复 (after {} restart(s))",
                self.stream, s.restart_attempts
            );
            s.stalled = false;
            s.exhausted = false;
            s.restart_attempts = 0;
        }
    }

    /// 推理失败或准入丢帧
    pub fn record_failure(&self) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
    }

    /// start 时重置计时基线
    pub fn reset_baseline(&self) {
        let now = self.clock.now_ms();
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let delivered = s.delivered;
        let total_restarts = s.total_restarts;
        *s = HealthState {
            last_success_ms: now,
            delivered,
            total_restarts,
            ..Default::default()
        };
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn is_stalled(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).stalled
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).exhausted
    }

    pub fn report(&self) -> StreamHealthReport {
        let now = self.clock.now_ms();
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        StreamHealthReport {
            stream: self.stream.clone(),
            last_success_ms: s.last_success_ms,
            since_success_ms: now.saturating_sub(s.last_success_ms),
            consecutive_failures: s.consecutive_failures,
            stalled: s.stalled,
            exhausted: s.exhausted,
            restart_attempts: s.restart_attempts,
            total_restarts: s.total_restarts,
            delivered: s.delivered,
        }
    }

    /// 重启次数耗尽时以 `Stalled` 的形式暴露给调用方
    pub fn check(&self) -> Result<StreamHealthReport> {
        let report = self.report();
        if report.exhausted {
            return Err(PipelineError::Stalled(self.stream.clone()));
        }
        Ok(report)
    }
}

/// 一次巡检对单个流采取的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    Healthy,
    /// 已停滞, 处于上次重启后的宽限期
    Waiting,
    Restarted { attempt: u32 },
    /// 判定需要重启时流已被停止, 不再碰解码器
    Detached,
    RestartFailed { attempt: u32, reason: String },
    Exhausted,
}

struct Watched {
    health: Arc<StreamHealth>,
    decoder: SharedDecoder,
}

struct Inner {
    config: SupervisorConfig,
    clock: SharedClock,
    watched: Mutex<HashMap<StreamId, Watched>>,
}

enum Verdict {
    Healthy,
    Waiting,
    Exhausted,
    Restart(u32),
}

impl Inner {
    fn judge(&self, health: &StreamHealth, now: u64) -> Verdict {
        let cfg = &self.config;
        let mut s = health.state.lock().unwrap_or_else(|e| e.into_inner());
        let silent = now.saturating_sub(s.last_success_ms) > cfg.stall_timeout_ms;
        let failing = s.consecutive_failures > cfg.max_consecutive_failures;
        if !silent && !failing {
            return Verdict::Healthy;
        }
        if s.exhausted {
            return Verdict::Exhausted;
        }
        if let Some(at) = s.last_restart_ms {
            if s.stalled && now.saturating_sub(at) <= cfg.stall_timeout_ms {
                return Verdict::Waiting;
            }
        }
        if s.restart_attempts >= cfg.max_restart_attempts {
            s.stalled = true;
            s.exhausted = true;
            error!(
                "❌ [{}] 停滞且已重启 {} 次, 放弃",
                health.stream, s.restart_attempts
            );
            return Verdict::Exhausted;
        }
        if !s.stalled {
            warn!(
                "⚠️  [{}] 流停滞: {}ms 无输出, 连续失败 {}",
                health.stream,
                now.saturating_sub(s.last_success_ms),
                s.consecutive_failures
            );
        }
        s.stalled = true;
        s.restart_attempts += 1;
        s.total_restarts += 1;
        s.last_restart_ms = Some(now);
        s.consecutive_failures = 0;
        Verdict::Restart(s.restart_attempts)
    }

    fn check_now(&self) -> Vec<(StreamId, SupervisorAction)> {
        let targets: Vec<(Arc<StreamHealth>, SharedDecoder)> = {
            let watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
            watched
                .values()
                .map(|w| (w.health.clone(), w.decoder.clone()))
                .collect()
        };

        let now = self.clock.now_ms();
        let mut actions = Vec::with_capacity(targets.len());
        for (health, decoder) in targets {
            let action = match self.judge(&health, now) {
                Verdict::Healthy => SupervisorAction::Healthy,
                Verdict::Waiting => SupervisorAction::Waiting,
                Verdict::Exhausted => SupervisorAction::Exhausted,
                Verdict::Restart(attempt) => {
                    // 健康锁已释放, 再去碰解码器
                    let mut decoder = decoder.lock().unwrap_or_else(|e| e.into_inner());
                    // 持有解码器锁后再确认: stop 在同一把锁下 close
                    if !health.is_attached() {
                        debug!("[{}] stream stopped during check, restart skipped", health.stream);
                        actions.push((health.stream.clone(), SupervisorAction::Detached));
                        continue;
                    }
                    match decoder.restart() {
                        Ok(()) => {
                            info!(
                                "🔄 [{}] 解码器已重启 (第 {}/{} 次)",
                                health.stream, attempt, self.config.max_restart_attempts
                            );
                            SupervisorAction::Restarted { attempt }
                        }
                        Err(e) => {
                            warn!("⚠️  [{}] 解码器重启失败: {:#}", health.stream, e);
                            SupervisorAction::RestartFailed {
                                attempt,
                                reason: format!("{:#}", e),
                            }
                        }
                    }
                }
            };
            actions.push((health.stream.clone(), action));
        }
        actions
    }
}

/// 周期性巡检所有被监视的流
pub struct StreamSupervisor {
    inner: Arc<Inner>,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSupervisor {
    pub fn new(config: SupervisorConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                watched: Mutex::new(HashMap::new()),
            }),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn watch(&self, health: Arc<StreamHealth>, decoder: SharedDecoder) {
        let stream = health.stream().clone();
        debug!("👀 supervisor watching {}", stream);
        let mut watched = self.inner.watched.lock().unwrap_or_else(|e| e.into_inner());
        health.attached.store(true, Ordering::Release);
        watched.insert(stream, Watched { health, decoder });
    }

    pub fn unwatch(&self, stream: &StreamId) -> bool {
        let mut watched = self.inner.watched.lock().unwrap_or_else(|e| e.into_inner());
        match watched.remove(stream) {
            Some(w) => {
                w.health.attached.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn watched_count(&self) -> usize {
        self.inner.watched.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 立即巡检一次 (测试与手动触发)
    pub fn check_now(&self) -> Vec<(StreamId, SupervisorAction)> {
        self.inner.check_now()
    }

    /// 启动巡检线程; 重复调用无效
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return Ok(());
        }
        let (tx, rx) = bounded::<()>(1);
        let inner = self.inner.clone();
        let interval = Duration::from_millis(inner.config.check_interval_ms.max(1));
        let spawned = thread::Builder::new()
            .name("stream-supervisor".into())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        inner.check_now();
                    }
                    _ => break,
                }
            })
            .map_err(|e| PipelineError::NotInitialized(format!("supervisor thread: {}", e)))?;
        *handle = Some(spawned);
        *self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        info!(
            "✅ supervisor started (stall {}ms, check every {}ms)",
            self.inner.config.stall_timeout_ms, self.inner.config.check_interval_ms
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        // 丢弃发送端即唤醒巡检线程
        self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("⚠️  supervisor thread panicked");
            }
        }
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{FrameCallback, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDecoder {
        restarts: Arc<AtomicUsize>,
    }

    impl Decoder for CountingDecoder {
        fn open(&mut self, _url: &str, _on_frame: FrameCallback) -> anyhow::Result<()> {
            Ok(())
        }
        fn restart(&mut self) -> anyhow::Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn close(&mut self) {}
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            stall_timeout_ms: 1_000,
            max_consecutive_failures: 3,
            max_restart_attempts: 2,
            check_interval_ms: 100,
        }
    }

    fn setup() -> (Arc<ManualClock>, StreamSupervisor, Arc<StreamHealth>, Arc<AtomicUsize>) {
        let clock = ManualClock::new(0);
        let sup = StreamSupervisor::new(config(), clock.clone());
        let health = Arc::new(StreamHealth::new(StreamId::new("cam"), clock.clone()));
        let restarts = Arc::new(AtomicUsize::new(0));
        let decoder: Box<dyn Decoder> = Box::new(CountingDecoder {
            restarts: restarts.clone(),
        });
        sup.watch(health.clone(), Arc::new(Mutex::new(decoder)));
        (clock, sup, health, restarts)
    }

    #[test]
    fn silence_triggers_single_restart_within_grace() {
        let (clock, sup, health, restarts) = setup();
        clock.set(900);
        assert_eq!(sup.check_now()[0].1, SupervisorAction::Healthy);

        clock.set(1_100);
        assert_eq!(sup.check_now()[0].1, SupervisorAction::Restarted { attempt: 1 });
        clock.set(1_600);
        assert_eq!(sup.check_now()[0].1, SupervisorAction::Waiting);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert!(health.is_stalled());

        health.record_success();
        assert!(!health.is_stalled());
        assert_eq!(health.report().restart_attempts, 0);
        assert_eq!(sup.check_now()[0].1, SupervisorAction::Healthy);
    }

    #[test]
    fn stop_during_check_skips_restart() {
        let clock = ManualClock::new(0);
        let sup = Arc::new(StreamSupervisor::new(config(), clock.clone()));
        let health = Arc::new(StreamHealth::new(StreamId::new("cam"), clock.clone()));
        let restarts = Arc::new(AtomicUsize::new(0));
        let boxed: Box<dyn Decoder> = Box::new(CountingDecoder {
            restarts: restarts.clone(),
        });
        let decoder: SharedDecoder = Arc::new(Mutex::new(boxed));
        sup.watch(health.clone(), decoder.clone());
        assert!(health.is_attached());
        clock.set(1_500);

        // 占住解码器锁, 让巡检停在判定之后, 重启之前
        let guard = decoder.lock().unwrap();
        let checker = {
            let sup = sup.clone();
            thread::spawn(move || sup.check_now())
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while health.report().total_restarts == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(health.report().total_restarts, 1);

        // 与 Pipeline::stop 同序: 先摘名单, 再在解码器锁下关闭
        assert!(sup.unwatch(&StreamId::new("cam")));
        assert!(!health.is_attached());
        drop(guard);
        decoder.lock().unwrap().close();

        let actions = checker.join().unwrap();
        assert_eq!(actions[0].1, SupervisorAction::Detached);
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failures_over_limit_count_as_stall() {
        let (_clock, sup, health, restarts) = setup();
        for _ in 0..3 {
            health.record_failure();
        }
        assert_eq!(sup.check_now()[0].1, SupervisorAction::Healthy);
        health.record_failure();
        assert_eq!(sup.check_now()[0].1, SupervisorAction::Restarted { attempt: 1 });
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhaustion_surfaces_stalled() {
        let (clock, sup, health, restarts) = setup();
        clock.set(1_500);
        sup.check_now();
        clock.set(3_000);
        assert_eq!(sup.check_now()[0].1, SupervisorAction::Restarted { attempt: 2 });
        clock.set(4_500);
        assert_eq!(sup.check_now()[0].1, SupervisorAction::Exhausted);
        assert_eq!(restarts.load(Ordering::SeqCst), 2);
        assert!(matches!(health.check(), Err(PipelineError::Stalled(_))));

        health.record_success();
        assert!(health.check().is_ok());
    }

    #[test]
    fn unwatched_streams_are_ignored() {
        let (clock, sup, _health, restarts) = setup();
        assert!(sup.unwatch(&StreamId::new("cam")));
        clock.set(10_000);
        assert!(sup.check_now().is_empty());
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
    }
}
