// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 流水线配置 - 通过JSON文件调整参数
//! Pipeline configuration, persisted as JSON

use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::models::ModelSpec;

/// 核心分配策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Balancing {
    /// worker 构造时绑定核心, 终身不变
    Static,
    /// 每次分发重新挑选负载最小的核心
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    pub core_count: usize,                     // 加速器核心数
    pub max_in_flight_per_core: Option<usize>, // 单核硬上限 (None = 不限)
    pub balancing: Balancing,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            core_count: 3,
            max_in_flight_per_core: None,
            balancing: Balancing::Static,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub workers: usize,      // 每个模型的 worker 数
    pub max_depth: usize,    // 排队 + 执行中的帧数上限
    pub result_ttl_ms: u64,  // 结果表条目存活时间
    pub result_cap: usize,   // 结果表条目上限
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 6,
            max_depth: 8,
            result_ttl_ms: 2000,
            result_cap: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub frame_skip: u32,                // 每K帧处理1帧
    pub block_on_full_ms: Option<u64>,  // 队列满时最多等待 (None = 直接丢帧)
    pub result_timeout_ms: u64,         // 消费端等待一阶段结果的超时
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_skip: 2,
            block_on_full_ms: None,
            result_timeout_ms: 1000,
        }
    }
}

/// 级联参数 (可运行时整体替换)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub enable_face_analysis: bool,
    pub enable_statistics: bool,
    pub person_conf_threshold: f32,
    pub min_person_px: f32,
    pub max_persons_per_frame: usize,
    pub roi_expand_ratio: f32,
    pub analysis_interval: u32, // 每K帧做一次人脸分析
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            enable_face_analysis: false,
            enable_statistics: true,
            person_conf_threshold: 0.5,
            min_person_px: 50.0,
            max_persons_per_frame: 10,
            roi_expand_ratio: 0.1,
            analysis_interval: 3,
        }
    }
}

impl CascadeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.person_conf_threshold) {
            return Err(invalid(format!(
                "person_conf_threshold {} outside [0,1]",
                self.person_conf_threshold
            )));
        }
        if self.min_person_px.is_nan() || self.min_person_px < 0.0 {
            return Err(invalid(format!(
                "min_person_px {} must be non-negative",
                self.min_person_px
            )));
        }
        if !(0.0..=1.0).contains(&self.roi_expand_ratio) {
            return Err(invalid(format!(
                "roi_expand_ratio {} outside [0,1]",
                self.roi_expand_ratio
            )));
        }
        if self.analysis_interval == 0 {
            return Err(invalid("analysis_interval must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub stall_timeout_ms: u64,
    pub max_consecutive_failures: u32,
    pub max_restart_attempts: u32,
    pub check_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 10_000,
            max_consecutive_failures: 30,
            max_restart_attempts: 3,
            check_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub history_interval_ms: u64, // 历史快照间隔
    pub history_capacity: usize,  // 历史环形缓冲大小
    pub auto_reset_ms: Option<u64>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            history_interval_ms: 60_000,
            history_capacity: 60,
            auto_reset_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub font_path: Option<String>, // 标签字体 (None = 只画框)
    pub line_thickness: u32,
    pub draw_faces: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            font_path: None,
            line_thickness: 2,
            draw_faces: true,
        }
    }
}

/// 完整流水线配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub accelerator: AcceleratorConfig,
    pub dispatcher: DispatcherConfig,
    pub stream: StreamConfig,
    pub cascade: CascadeConfig,
    pub supervisor: SupervisorConfig,
    pub stats: StatsConfig,
    pub overlay: OverlayConfig,
    pub models: Vec<ModelSpec>,
}

impl PipelineConfig {
    /// 严格加载: 文件缺失或解析失败都返回错误
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| invalid(format!("read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| invalid(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    /// 文件不存在时写出默认配置; 解析失败时回退默认值
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str::<Self>(&json) {
                Ok(config) => match config.validate() {
                    Ok(()) => {
                        info!("✅ 配置已从 {} 加载", path.display());
                        config
                    }
                    Err(e) => {
                        warn!("⚠️  配置无效: {}, 使用默认值", e);
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("❌ 保存默认配置失败: {}", e);
                }
                config
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| invalid(format!("serialize config: {}", e)))?;
        fs::write(path, json).map_err(|e| invalid(format!("write {}: {}", path.display(), e)))?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.accelerator.core_count == 0 {
            return Err(invalid("accelerator.core_count must be at least 1"));
        }
        if self.accelerator.max_in_flight_per_core == Some(0) {
            return Err(invalid("accelerator.max_in_flight_per_core must be at least 1"));
        }
        if self.dispatcher.workers == 0 {
            return Err(invalid("dispatcher.workers must be at least 1"));
        }
        if self.dispatcher.max_depth == 0 {
            return Err(invalid("dispatcher.max_depth must be at least 1"));
        }
        if self.dispatcher.result_cap == 0 {
            return Err(invalid("dispatcher.result_cap must be at least 1"));
        }
        if self.stream.frame_skip == 0 {
            return Err(invalid("stream.frame_skip must be at least 1"));
        }
        if self.supervisor.check_interval_ms == 0 {
            return Err(invalid("supervisor.check_interval_ms must be at least 1"));
        }
        if self.stats.history_capacity == 0 {
            return Err(invalid("stats.history_capacity must be at least 1"));
        }
        self.cascade.validate()?;
        for model in &self.models {
            model.validate()?;
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️  当前流水线配置:");
        info!(
            "  加速器: {} 核, 策略 {:?}, 单核上限 {:?}",
            self.accelerator.core_count,
            self.accelerator.balancing,
            self.accelerator.max_in_flight_per_core
        );
        info!(
            "  分发器: {} workers, 深度 {}, 结果TTL {}ms, 结果上限 {}",
            self.dispatcher.workers,
            self.dispatcher.max_depth,
            self.dispatcher.result_ttl_ms,
            self.dispatcher.result_cap
        );
        info!(
            "  级联: 人脸分析={} 统计={} 人体阈值={:.2} 间隔={}",
            self.cascade.enable_face_analysis,
            self.cascade.enable_statistics,
            self.cascade.person_conf_threshold,
            self.cascade.analysis_interval
        );
        info!(
            "  看门狗: 停滞 {}ms, 连续失败 {}, 重启上限 {}",
            self.supervisor.stall_timeout_ms,
            self.supervisor.max_consecutive_failures,
            self.supervisor.max_restart_attempts
        );
    }
}

fn invalid(msg: impl Into<String>) -> PipelineError {
    PipelineError::InvalidArgument(msg.into())
}
