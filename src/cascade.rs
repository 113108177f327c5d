// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 两阶段级联: 一阶段检测 → 人体筛选 → 二阶段人脸属性 → 统计
/// Two-stage cascade for one stream
///
/// 二阶段失败时仍返回一阶段结果 (`stage2_failed = true`, 人脸为空).
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::capability::FaceAnalysis;
use crate::config::CascadeConfig;
use crate::engine::{InferenceDispatcher, Rejected};
use crate::error::{PipelineError, Result};
use crate::models::labels::PERSON;
use crate::stats::StatsAggregator;
use crate::types::{
    BBox, CascadeResult, Detection, FaceAnalysisResult, Frame, FrameKey,
    PerStageTiming, PersonRoi, StreamId,
};

/// 级联参数在所有流之间共享, 可整体替换
pub type SharedCascadeConfig = Arc<RwLock<CascadeConfig>>;

/// 按置信度 / 尺寸筛出人体, 保持一阶段输出顺序并截断
pub fn select_persons(detections: &[Detection], config: &CascadeConfig) -> Vec<Detection> {
    detections
        .iter()
        .filter(|d| {
            d.is_class(PERSON)
                && d.confidence >= config.person_conf_threshold
                && d.bbox.width() >= config.min_person_px
                && d.bbox.height() >= config.min_person_px
        })
        .take(config.max_persons_per_frame)
        .copied()
        .collect()
}

/// 四周各外扩 `ratio` 倍宽高, 并裁剪到图像内
pub fn expand_roi(bbox: &BBox, ratio: f32, width: u32, height: u32) -> BBox {
    let dx = bbox.width() * ratio;
    let dy = bbox.height() * ratio;
    BBox::new(bbox.x1 - dx, bbox.y1 - dy, bbox.x2 + dx, bbox.y2 + dy)
        .clamp_to(width as f32, height as f32)
}

pub struct CascadeCoordinator {
    stream: StreamId,
    dispatcher: Arc<InferenceDispatcher>,
    face: Option<Arc<dyn FaceAnalysis>>,
    config: SharedCascadeConfig,
    stats: Arc<StatsAggregator>,
    counter: AtomicU64,
}

impl CascadeCoordinator {
    pub fn new(
        stream: StreamId,
        dispatcher: Arc<InferenceDispatcher>,
        face: Option<Arc<dyn FaceAnalysis>>,
        config: SharedCascadeConfig,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            stream,
            dispatcher,
            face,
            config,
            stats,
            counter: AtomicU64::new(0),
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn dispatcher(&self) -> &Arc<InferenceDispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn face_available(&self) -> bool {
        self.face.is_some()
    }

    /// 同步处理一帧: 提交 → 等待一阶段 → 级联
    pub fn process(&self, frame: Frame, timeout: Duration) -> Result<CascadeResult> {
        let key = match self.dispatcher.submit(frame) {
            Ok(key) => key,
            Err(Rejected { error, .. }) => {
                if matches!(error, PipelineError::Backpressured { .. }) {
                    self.stats.on_drop();
                }
                return Err(error);
            }
        };
        self.finish(&key, timeout).map(|(result, _)| result)
    }

    /// 取回已提交帧的一阶段结果并完成级联, 同时交还源帧
    pub fn finish(&self, key: &FrameKey, timeout: Duration) -> Result<(CascadeResult, Frame)> {
        let started = Instant::now();
        let config = self.config.read().unwrap_or_else(|e| e.into_inner()).clone();

        let (detections, frame) = match self.dispatcher.take_completed(key, timeout) {
            Ok(done) => done,
            Err(e) => {
                if config.enable_statistics && !matches!(e, PipelineError::Shutdown) {
                    self.stats.on_frame();
                    self.stats.on_failure();
                }
                debug!("[{}] stage 1 failed for {}: {}", self.stream, key, e);
                return Err(e);
            }
        };
        let stage1_wait_ms = started.elapsed().as_secs_f64() * 1000.0;

        let persons = select_persons(&detections.detections, &config);
        let (faces, stage2_ms, stage2_ran, stage2_failed) = self.run_stage2(&frame, &persons, &config);

        let t_stats = Instant::now();
        if config.enable_statistics {
            self.stats.on_frame();
            self.stats.on_cascade(&detections, &faces, stage2_ran && !stage2_failed);
        }
        let stats = self.stats.snapshot();
        let stats_ms = t_stats.elapsed().as_secs_f64() * 1000.0;

        let timing = PerStageTiming {
            stage1_wait_ms,
            stage1: detections.timing,
            stage2_ms,
            stats_ms,
            total_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        Ok((
            CascadeResult {
                detections,
                faces,
                stats,
                timing,
                stage2_ran,
                stage2_failed,
            },
            frame,
        ))
    }

    /// 是否对当前帧做二阶段; 计数器只在功能开启且可用时前进
    fn should_analyze(&self, config: &CascadeConfig) -> bool {
        if !config.enable_face_analysis || self.face.is_none() {
            return false;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        n % config.analysis_interval.max(1) as u64 == 0
    }

    fn run_stage2(
        &self,
        frame: &Frame,
        persons: &[Detection],
        config: &CascadeConfig,
    ) -> (Vec<FaceAnalysisResult>, Option<f64>, bool, bool) {
        if !self.should_analyze(config) || persons.is_empty() {
            return (Vec::new(), None, false, false);
        }
        let Some(face) = self.face.as_ref() else {
            return (Vec::new(), None, false, false);
        };

        let rois: Vec<PersonRoi> = persons
            .iter()
            .map(|p| PersonRoi {
                person: *p,
                roi: expand_roi(&p.bbox, config.roi_expand_ratio, frame.width(), frame.height()),
            })
            .collect();

        let t = Instant::now();
        let outcome = face.analyze(frame, &rois);
        let elapsed = t.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(faces) => (faces, Some(elapsed), true, false),
            Err(e) => {
                warn!(
                    "⚠️  [{}] face analysis failed on frame {}: {:#}",
                    self.stream,
                    frame.frame_id(),
                    e
                );
                (Vec::new(), Some(elapsed), true, true)
            }
        }
    }
}
