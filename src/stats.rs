// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 人数 / 人脸 / 性别 / 年龄段统计
/// Per-stream statistics aggregator with history and trends
///
/// 所有计数在同一把锁内更新, 任何时刻读到的快照都满足:
/// male + female + unknown_gender = valid_faces ≤ total_faces,
/// Σ age ≤ valid_faces, Σ race ≤ valid_faces.
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use crate::capability::SharedClock;
use crate::config::StatsConfig;
use crate::models::labels::PERSON;
use crate::types::{DetectionSet, FaceAnalysisResult, Gender, AGE_BRACKET_LABELS, RACE_LABELS};

pub const AGE_BRACKETS: usize = AGE_BRACKET_LABELS.len();
pub const RACE_GROUPS: usize = RACE_LABELS.len();

/// 人数变化低于该百分比视为稳定
const PERSON_TREND_STABLE_PCT: f64 = 5.0;
/// 男性占比变化低于该百分点视为稳定
const GENDER_TREND_STABLE_PCT: f64 = 2.0;

// ========== 快照 ==========

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_persons: u64,
    pub total_faces: u64,
    pub valid_faces: u64,
    pub male: u64,
    pub female: u64,
    pub unknown_gender: u64,
    pub age_histogram: [u64; AGE_BRACKETS],
    pub race_histogram: [u64; RACE_GROUPS],
    pub frame_count: u64,
    pub analysis_count: u64,
    pub dropped_frames: u64,
    pub failed_frames: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StatsSnapshot {
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            total_persons: 0,
            total_faces: 0,
            valid_faces: 0,
            male: 0,
            female: 0,
            unknown_gender: 0,
            age_histogram: [0; AGE_BRACKETS],
            race_histogram: [0; RACE_GROUPS],
            frame_count: 0,
            analysis_count: 0,
            dropped_frames: 0,
            failed_frames: 0,
            started_at: at,
            updated_at: at,
        }
    }

    /// 计数器是否全为零 (时间戳除外)
    pub fn is_zero(&self) -> bool {
        *self == Self::empty(self.started_at).with_updated_at(self.updated_at)
    }

    fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    pub fn is_consistent(&self) -> bool {
        let age: u64 = self.age_histogram.iter().sum();
        let race: u64 = self.race_histogram.iter().sum();
        self.male + self.female + self.unknown_gender == self.valid_faces
            && self.valid_faces <= self.total_faces
            && age <= self.valid_faces
            && race <= self.valid_faces
    }

    fn record_cascade(&mut self, detections: &DetectionSet, faces: &[FaceAnalysisResult], analyzed: bool) {
        self.total_persons += detections.count_class(PERSON) as u64;
        if analyzed {
            self.analysis_count += 1;
        }
        for face in faces.iter().flat_map(|r| r.faces.iter()) {
            self.total_faces += 1;
            let attrs = &face.attributes;
            if !attrs.is_valid() {
                continue;
            }
            self.valid_faces += 1;
            match attrs.gender {
                Gender::Male => self.male += 1,
                Gender::Female => self.female += 1,
                Gender::Unknown => self.unknown_gender += 1,
            }
            if let Some(age) = attrs.age_bracket {
                self.age_histogram[age as usize] += 1;
            }
            if let Some(race) = attrs.race.filter(|r| (*r as usize) < RACE_GROUPS) {
                self.race_histogram[race as usize] += 1;
            }
        }
    }

    /// 合并 (全局视图)
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.total_persons += other.total_persons;
        self.total_faces += other.total_faces;
        self.valid_faces += other.valid_faces;
        self.male += other.male;
        self.female += other.female;
        self.unknown_gender += other.unknown_gender;
        for (a, b) in self.age_histogram.iter_mut().zip(other.age_histogram) {
            *a += b;
        }
        for (a, b) in self.race_histogram.iter_mut().zip(other.race_histogram) {
            *a += b;
        }
        self.frame_count += other.frame_count;
        self.analysis_count += other.analysis_count;
        self.dropped_frames += other.dropped_frames;
        self.failed_frames += other.failed_frames;
        self.started_at = self.started_at.min(other.started_at);
        self.updated_at = self.updated_at.max(other.updated_at);
    }

    pub fn merged<'a>(snapshots: impl IntoIterator<Item = &'a StatsSnapshot>) -> Option<Self> {
        let mut iter = snapshots.into_iter();
        let mut total = iter.next()?.clone();
        for s in iter {
            total.merge(s);
        }
        Some(total)
    }

    /// (男性%, 女性%), 以有效人脸为分母
    pub fn gender_percentage(&self) -> (f64, f64) {
        if self.valid_faces == 0 {
            return (0.0, 0.0);
        }
        let v = self.valid_faces as f64;
        (self.male as f64 / v * 100.0, self.female as f64 / v * 100.0)
    }

    pub fn dominant_gender(&self) -> Gender {
        match self.male.cmp(&self.female) {
            std::cmp::Ordering::Greater => Gender::Male,
            std::cmp::Ordering::Less => Gender::Female,
            std::cmp::Ordering::Equal => Gender::Unknown,
        }
    }

    /// 人数最多的年龄段 (下标, 人数)
    pub fn dominant_age_bracket(&self) -> Option<(usize, u64)> {
        self.age_histogram
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, n)| *n > 0)
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
    }
}

// ========== 趋势 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trend {
    pub direction: TrendDirection,
    /// 人数: 变化百分比; 性别: 男性占比变化的百分点
    pub change: f64,
}

impl Trend {
    fn insufficient() -> Self {
        Self {
            direction: TrendDirection::InsufficientData,
            change: 0.0,
        }
    }

    fn classify(change: f64, stable_below: f64) -> Self {
        let direction = if change.abs() < stable_below {
            TrendDirection::Stable
        } else if change > 0.0 {
            TrendDirection::Rising
        } else {
            TrendDirection::Falling
        };
        Self { direction, change }
    }
}

// ========== 聚合器 ==========

struct Inner {
    current: StatsSnapshot,
    /// 当前历史区间内的增量
    interval: StatsSnapshot,
    history: VecDeque<StatsSnapshot>,
    last_sample_ms: u64,
    last_reset_ms: u64,
}

pub struct StatsAggregator {
    label: String,
    config: StatsConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl StatsAggregator {
    pub fn new(label: impl Into<String>, config: StatsConfig, clock: SharedClock) -> Self {
        let now = Utc::now();
        let now_ms = clock.now_ms();
        Self {
            label: label.into(),
            inner: Mutex::new(Inner {
                current: StatsSnapshot::empty(now),
                interval: StatsSnapshot::empty(now),
                history: VecDeque::with_capacity(config.history_capacity),
                last_sample_ms: now_ms,
                last_reset_ms: now_ms,
            }),
            config,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_frame(&self) {
        self.mutate(|s| s.frame_count += 1);
    }

    pub fn on_drop(&self) {
        self.mutate(|s| s.dropped_frames += 1);
    }

    pub fn on_failure(&self) {
        self.mutate(|s| s.failed_frames += 1);
    }

    /// 一帧级联结果: 仅属性有效的人脸计入性别 / 年龄 / 种族
    pub fn on_cascade(&self, detections: &DetectionSet, faces: &[FaceAnalysisResult], analyzed: bool) {
        self.mutate(|s| s.record_cascade(detections, faces, analyzed));
    }

    /// 同一更新同时作用于累计值与区间增量
    fn mutate(&self, f: impl Fn(&mut StatsSnapshot)) {
        let mut inner = self.lock();
        self.maintain_locked(&mut inner);
        let now = Utc::now();
        f(&mut inner.current);
        f(&mut inner.interval);
        inner.current.updated_at = now.max(inner.current.started_at);
        inner.interval.updated_at = now.max(inner.interval.started_at);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut inner = self.lock();
        self.maintain_locked(&mut inner);
        inner.current.clone()
    }

    /// 清零; 新的起始时间严格晚于此前任何时间戳
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.reset_locked(&mut inner);
        info!("🔄 [{}] 统计已重置", self.label);
    }

    fn reset_locked(&self, inner: &mut Inner) {
        let floor = inner.current.started_at.max(inner.current.updated_at)
            + chrono::Duration::microseconds(1);
        let at = Utc::now().max(floor);
        inner.current = StatsSnapshot::empty(at);
        inner.interval = StatsSnapshot::empty(at);
        inner.last_reset_ms = self.clock.now_ms();
        inner.last_sample_ms = inner.last_reset_ms;
    }

    /// 到期时采样历史, 必要时自动重置
    pub fn maintain(&self) {
        let mut inner = self.lock();
        self.maintain_locked(&mut inner);
    }

    fn maintain_locked(&self, inner: &mut Inner) {
        let now_ms = self.clock.now_ms();
        if now_ms.saturating_sub(inner.last_sample_ms) >= self.config.history_interval_ms {
            self.sample_locked(inner, now_ms);
        }
        if let Some(period) = self.config.auto_reset_ms {
            if now_ms.saturating_sub(inner.last_reset_ms) >= period {
                if inner.last_sample_ms != now_ms {
                    self.sample_locked(inner, now_ms);
                }
                self.reset_locked(inner);
                info!("🔄 [{}] 统计自动重置", self.label);
            }
        }
    }

    fn sample_locked(&self, inner: &mut Inner, now_ms: u64) {
        if inner.history.len() >= self.config.history_capacity {
            inner.history.pop_front();
        }
        let next_start = Utc::now().max(inner.interval.updated_at);
        let sample = std::mem::replace(&mut inner.interval, StatsSnapshot::empty(next_start));
        inner.history.push_back(sample);
        inner.last_sample_ms = now_ms;
    }

    /// 历史区间快照 (旧 → 新)
    pub fn history(&self) -> Vec<StatsSnapshot> {
        self.lock().history.iter().cloned().collect()
    }

    /// 历史区间的平均值
    pub fn average(&self) -> Option<StatsSnapshot> {
        let inner = self.lock();
        let n = inner.history.len() as u64;
        let mut avg = StatsSnapshot::merged(inner.history.iter())?;
        let div = |v: &mut u64| *v /= n;
        div(&mut avg.total_persons);
        div(&mut avg.frame_count);
        div(&mut avg.analysis_count);
        div(&mut avg.dropped_frames);
        div(&mut avg.failed_frames);
        div(&mut avg.total_faces);
        div(&mut avg.male);
        div(&mut avg.female);
        div(&mut avg.unknown_gender);
        avg.age_histogram.iter_mut().for_each(div);
        avg.race_histogram.iter_mut().for_each(div);
        // 各分箱单独取整, 舍入差额记入 unknown_gender 以保持不变式
        let genders = avg.male + avg.female + avg.unknown_gender;
        let age: u64 = avg.age_histogram.iter().sum();
        let race: u64 = avg.race_histogram.iter().sum();
        avg.valid_faces = genders.max(age).max(race);
        avg.unknown_gender += avg.valid_faces - genders;
        avg.total_faces = avg.total_faces.max(avg.valid_faces);
        Some(avg)
    }

    /// 最近两个历史区间的人数变化
    pub fn person_trend(&self) -> Trend {
        let inner = self.lock();
        let n = inner.history.len();
        if n < 2 {
            return Trend::insufficient();
        }
        let (prev, last) = (&inner.history[n - 2], &inner.history[n - 1]);
        if prev.total_persons == 0 {
            return Trend::insufficient();
        }
        let change = (last.total_persons as f64 - prev.total_persons as f64)
            / prev.total_persons as f64
            * 100.0;
        Trend::classify(change, PERSON_TREND_STABLE_PCT)
    }

    /// 最近两个历史区间的男性占比变化 (百分点)
    pub fn gender_trend(&self) -> Trend {
        let inner = self.lock();
        let n = inner.history.len();
        if n < 2 {
            return Trend::insufficient();
        }
        let prev = inner.history[n - 2].gender_percentage().0;
        let last = inner.history[n - 1].gender_percentage().0;
        Trend::classify(last - prev, GENDER_TREND_STABLE_PCT)
    }

    /// 文本摘要报告
    pub fn report(&self) -> String {
        let current = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "=== 统计摘要 [{}] ===", self.label);
        let _ = writeln!(
            out,
            "  区间: {} → {}",
            current.started_at.format("%Y-%m-%d %H:%M:%S"),
            current.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(
            out,
            "  帧数: {} (分析 {}, 丢弃 {}, 失败 {})",
            current.frame_count, current.analysis_count, current.dropped_frames, current.failed_frames
        );
        let _ = writeln!(
            out,
            "  总人数: {}  人脸: {} (有效 {})",
            current.total_persons, current.total_faces, current.valid_faces
        );
        if current.valid_faces > 0 {
            let (male, female) = current.gender_percentage();
            let _ = writeln!(out, "  性别分布: 男性 {:.1}%, 女性 {:.1}%", male, female);
            if let Some((bracket, n)) = current.dominant_age_bracket() {
                let _ = writeln!(out, "  主要年龄段: {} ({}人)", AGE_BRACKET_LABELS[bracket], n);
            }
        }

        let person = self.person_trend();
        if person.direction != TrendDirection::InsufficientData {
            let _ = writeln!(
                out,
                "  人数趋势: {:?} ({:+.1}%)",
                person.direction, person.change
            );
            let gender = self.gender_trend();
            let _ = writeln!(out, "  性别趋势: {:?} ({:+.1}pt)", gender.direction, gender.change);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ManualClock;
    use crate::types::{BBox, Detection, FaceAttributes, FaceRecord, FrameKey, ModelTag, StreamId, WorkerTiming};
    use std::sync::Arc;

    fn set(persons: usize, others: usize) -> DetectionSet {
        let mut detections = Vec::new();
        for _ in 0..persons {
            detections.push(Detection::new(0, "person", 0.9, BBox::new(0.0, 0.0, 60.0, 120.0)));
        }
        for _ in 0..others {
            detections.push(Detection::new(2, "car", 0.8, BBox::new(0.0, 0.0, 60.0, 60.0)));
        }
        DetectionSet {
            key: FrameKey::new(StreamId::new("cam"), 1),
            detections,
            model: ModelTag::new("m"),
            completed_ms: 0,
            timing: WorkerTiming::default(),
        }
    }

    fn faces(codes: &[(i32, i32, i32)]) -> Vec<FaceAnalysisResult> {
        vec![FaceAnalysisResult {
            person: Detection::new(0, "person", 0.9, BBox::new(0.0, 0.0, 60.0, 120.0)),
            faces: codes
                .iter()
                .map(|&(g, a, r)| FaceRecord {
                    bbox: BBox::new(10.0, 10.0, 30.0, 30.0),
                    confidence: 0.9,
                    attributes: FaceAttributes::from_codes(g, a, r),
                })
                .collect(),
        }]
    }

    fn aggregator(config: StatsConfig) -> (StatsAggregator, Arc<ManualClock>) {
        let clock = ManualClock::new(0);
        (StatsAggregator::new("cam", config, clock.clone()), clock)
    }

    #[test]
    fn only_valid_faces_reach_histograms() {
        let (stats, _) = aggregator(StatsConfig::default());
        stats.on_frame();
        stats.on_cascade(
            &set(2, 1),
            &faces(&[(1, 3, 1), (0, 8, -1), (-1, 2, 0), (1, -1, 4)]),
            true,
        );
        let s = stats.snapshot();
        assert_eq!(s.total_persons, 2);
        assert_eq!(s.total_faces, 4);
        assert_eq!(s.valid_faces, 2);
        assert_eq!((s.male, s.female, s.unknown_gender), (1, 1, 0));
        assert_eq!(s.age_histogram[3], 1);
        assert_eq!(s.age_histogram[8], 1);
        assert_eq!(s.race_histogram.iter().sum::<u64>(), 1);
        assert_eq!(s.analysis_count, 1);
        assert_eq!(s.frame_count, 1);
        assert!(s.is_consistent());
    }

    #[test]
    fn reset_zeroes_and_moves_start_forward() {
        let (stats, _) = aggregator(StatsConfig::default());
        stats.on_frame();
        stats.on_cascade(&set(1, 0), &faces(&[(1, 4, 4)]), true);
        let before = stats.snapshot();
        stats.reset();
        let after = stats.snapshot();
        assert!(after.is_zero());
        assert!(after.started_at > before.started_at);
        assert!(after.started_at > before.updated_at);

        stats.reset();
        assert!(stats.snapshot().started_at > after.started_at);
    }

    #[test]
    fn history_samples_interval_deltas_and_trends() {
        let config = StatsConfig {
            history_interval_ms: 1000,
            history_capacity: 3,
            auto_reset_ms: None,
        };
        let (stats, clock) = aggregator(config);
        for persons in [10usize, 10, 20, 20] {
            stats.on_cascade(&set(persons, 0), &faces(&[(1, 3, 1)]), true);
            clock.advance(1000);
            stats.maintain();
        }
        let history = stats.history();
        assert_eq!(history.len(), 3);
        let persons: Vec<u64> = history.iter().map(|s| s.total_persons).collect();
        assert_eq!(persons, vec![10, 20, 20]);
        assert_eq!(stats.snapshot().total_persons, 60);

        let trend = stats.person_trend();
        assert_eq!(trend.direction, TrendDirection::Stable);
        assert_eq!(stats.gender_trend().direction, TrendDirection::Stable);

        let avg = stats.average().unwrap();
        assert_eq!(avg.total_persons, 16);
        assert!(avg.is_consistent());
    }

    #[test]
    fn average_of_split_genders_stays_consistent() {
        let config = StatsConfig {
            history_interval_ms: 1000,
            ..StatsConfig::default()
        };
        let (stats, clock) = aggregator(config);
        // 两个区间同一年龄段, 性别不同: 单独取整后 male = female = 0, age[3] = 1
        for gender in [1, 0] {
            stats.on_cascade(&set(1, 0), &faces(&[(gender, 3, 2)]), true);
            clock.advance(1000);
            stats.maintain();
        }
        assert_eq!(stats.history().len(), 2);

        let avg = stats.average().unwrap();
        assert!(avg.is_consistent(), "{:?}", avg);
        assert_eq!(avg.age_histogram[3], 1);
        assert_eq!(avg.valid_faces, 1);
        assert_eq!((avg.male, avg.female, avg.unknown_gender), (0, 0, 1));
        assert_eq!(avg.total_faces, 1);
    }

    #[test]
    fn rising_person_trend() {
        let config = StatsConfig {
            history_interval_ms: 100,
            ..StatsConfig::default()
        };
        let (stats, clock) = aggregator(config);
        stats.on_cascade(&set(4, 0), &[], false);
        clock.advance(100);
        stats.maintain();
        stats.on_cascade(&set(8, 0), &[], false);
        clock.advance(100);
        stats.maintain();
        let trend = stats.person_trend();
        assert_eq!(trend.direction, TrendDirection::Rising);
        assert!((trend.change - 100.0).abs() < 1e-9);
    }

    #[test]
    fn auto_reset_keeps_a_history_sample() {
        let config = StatsConfig {
            history_interval_ms: 60_000,
            history_capacity: 10,
            auto_reset_ms: Some(5_000),
        };
        let (stats, clock) = aggregator(config);
        stats.on_cascade(&set(3, 0), &[], false);
        clock.advance(5_000);
        stats.maintain();
        assert_eq!(stats.snapshot().total_persons, 0);
        assert_eq!(stats.history().len(), 1);
        assert_eq!(stats.history()[0].total_persons, 3);
    }

    #[test]
    fn merge_adds_counters() {
        let (a, _) = aggregator(StatsConfig::default());
        let (b, _) = aggregator(StatsConfig::default());
        a.on_cascade(&set(1, 0), &faces(&[(0, 2, 1)]), true);
        b.on_cascade(&set(2, 0), &faces(&[(1, 5, 3)]), true);
        b.on_drop();
        let total = StatsSnapshot::merged([a.snapshot(), b.snapshot()].iter()).unwrap();
        assert_eq!(total.total_persons, 3);
        assert_eq!(total.valid_faces, 2);
        assert_eq!(total.dropped_frames, 1);
        assert_eq!(total.dominant_gender(), Gender::Unknown);
        assert!(total.is_consistent());
    }

    #[test]
    fn concurrent_updates_stay_consistent() {
        let (stats, _) = aggregator(StatsConfig::default());
        let stats = Arc::new(stats);
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        stats.on_cascade(&set(1, 0), &faces(&[(1, 2, 0), (0, 4, -1), (-1, 1, 1)]), true);
                    }
                })
            })
            .collect();
        for _ in 0..200 {
            assert!(stats.snapshot().is_consistent());
        }
        for w in writers {
            w.join().unwrap();
        }
        let s = stats.snapshot();
        assert_eq!(s.valid_faces, 1600);
        assert_eq!(s.total_faces, 2400);
    }
}
