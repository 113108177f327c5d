// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 加速器核心分配器
/// Accelerator core allocator: fewest in-flight first, ties go to least recently used
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::error::{PipelineError, Result};

/// 选择阶段的共享状态 (短时持锁)
struct SelectState {
    last_used: Vec<u64>,
    tick: u64,
}

pub struct AcceleratorCoreAllocator {
    in_flight: Vec<AtomicUsize>,
    select: Mutex<SelectState>,
    cap: Option<usize>,
}

impl AcceleratorCoreAllocator {
    pub fn new(core_count: usize, cap: Option<usize>) -> Result<Self> {
        if core_count == 0 {
            return Err(PipelineError::InvalidArgument(
                "accelerator needs at least one core".into(),
            ));
        }
        if cap == Some(0) {
            return Err(PipelineError::InvalidArgument(
                "per-core cap must be at least 1".into(),
            ));
        }
        Ok(Self {
            in_flight: (0..core_count).map(|_| AtomicUsize::new(0)).collect(),
            select: Mutex::new(SelectState {
                last_used: vec![0; core_count],
                tick: 0,
            }),
            cap,
        })
    }

    pub fn core_count(&self) -> usize {
        self.in_flight.len()
    }

    fn lock(&self) -> MutexGuard<'_, SelectState> {
        self.select.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 在持锁状态下挑选核心并刷新 LRU
    fn pick(&self, state: &mut SelectState) -> Result<usize> {
        let mut best = 0usize;
        let mut best_load = usize::MAX;
        for (core, counter) in self.in_flight.iter().enumerate() {
            let load = counter.load(Ordering::Acquire);
            if load < best_load || (load == best_load && state.last_used[core] < state.last_used[best])
            {
                best = core;
                best_load = load;
            }
        }
        if let Some(cap) = self.cap {
            if best_load >= cap {
                return Err(PipelineError::BusyAllCoresFull {
                    cores: self.core_count(),
                    cap,
                });
            }
        }
        state.tick += 1;
        state.last_used[best] = state.tick;
        Ok(best)
    }

    /// 静态绑定: 选一个核心, 不计入在途任务
    pub fn assign_core(&self) -> Result<usize> {
        let mut state = self.lock();
        let core = self.pick(&mut state)?;
        debug!("🔧 core {} assigned, loads {:?}", core, self.snapshot());
        Ok(core)
    }

    /// 动态均衡: "选最小 + 自增" 在同一把锁内完成
    pub fn acquire_core(&self) -> Result<usize> {
        let mut state = self.lock();
        let core = self.pick(&mut state)?;
        self.in_flight[core].fetch_add(1, Ordering::AcqRel);
        Ok(core)
    }

    pub fn task_started(&self, core: usize) {
        if let Some(counter) = self.in_flight.get(core) {
            counter.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn task_completed(&self, core: usize) {
        if let Some(counter) = self.in_flight.get(core) {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        }
    }

    /// 各核心在途任务数
    pub fn snapshot(&self) -> Vec<usize> {
        self.in_flight
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .collect()
    }
}

/// 在途任务守卫, drop 时归还计数
pub struct CoreTask<'a> {
    allocator: &'a AcceleratorCoreAllocator,
    core: usize,
}

impl<'a> CoreTask<'a> {
    /// 已经计数的核心 (acquire_core 的返回值)
    pub fn acquired(allocator: &'a AcceleratorCoreAllocator, core: usize) -> Self {
        Self { allocator, core }
    }

    /// 静态绑定核心, 在此处计数
    pub fn start(allocator: &'a AcceleratorCoreAllocator, core: usize) -> Self {
        allocator.task_started(core);
        Self { allocator, core }
    }

    pub fn core(&self) -> usize {
        self.core
    }
}

impl Drop for CoreTask<'_> {
    fn drop(&mut self) {
        self.allocator.task_completed(self.core);
    }
}
