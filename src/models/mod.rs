// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 模型描述与后处理
///
/// # 架构说明
///
/// 推理本身由外部 [`InferenceEngine`](crate::capability::InferenceEngine) 完成,
/// 这里只负责模型无关的预处理 (letterbox) 与按模型变体区分的后处理:
/// - **YOLOv5**: 基于锚框, 三个量化输出头 (stride 8/16/32)
///   - 文件: `yolov5.rs`
/// - **YOLOv8**: 无锚框, 两个量化输出 (框 / 类别分数)
///   - 文件: `yolov8.rs`
///
/// 两者共用: 置信度过滤 → NMS → 最多 64 个结果 → letterbox 逆变换回原图坐标
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::capability::{InputSpec, OutputTensor};
use crate::error::PipelineError;
use crate::types::{Detection, ModelTag};

pub mod labels;
pub mod letterbox;
pub mod nms;
pub mod quant;
pub mod yolov5;
pub mod yolov8;

pub use letterbox::{letterbox, Letterbox, PAD_VALUE};
pub use nms::non_max_suppression;

/// 单帧最多输出的检测数
pub const MAX_DETECTIONS: usize = 64;

/// 模型变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    /// YOLOv5 锚框模型
    YoloV5,
    /// YOLOv8 无锚框模型
    YoloV8,
}

/// 模型参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    pub tag: String,
    pub kind: ModelKind,
    pub input_width: u32,
    pub input_height: u32,
    pub num_classes: usize,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    pub max_detections: usize,
    pub class_agnostic_nms: bool,
    pub model_path: Option<String>,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self::yolov5("yolov5s")
    }
}

impl ModelSpec {
    pub fn yolov5(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            kind: ModelKind::YoloV5,
            input_width: 640,
            input_height: 640,
            num_classes: labels::COCO_CLASSES.len(),
            conf_threshold: 0.5,
            nms_threshold: 0.6,
            max_detections: MAX_DETECTIONS,
            class_agnostic_nms: false,
            model_path: None,
        }
    }

    pub fn yolov8(tag: &str) -> Self {
        Self {
            kind: ModelKind::YoloV8,
            class_agnostic_nms: true,
            ..Self::yolov5(tag)
        }
    }

    pub fn model_tag(&self) -> ModelTag {
        ModelTag::new(&self.tag)
    }

    pub fn input_spec(&self) -> InputSpec {
        InputSpec {
            width: self.input_width,
            height: self.input_height,
            channels: 3,
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        let bad = |msg: String| Err(PipelineError::InvalidArgument(msg));
        if self.tag.trim().is_empty() {
            return bad("model tag is empty".into());
        }
        if self.input_width == 0 || self.input_height == 0 {
            return bad(format!(
                "model {} has empty input {}x{}",
                self.tag, self.input_width, self.input_height
            ));
        }
        if self.num_classes == 0 {
            return bad(format!("model {} declares zero classes", self.tag));
        }
        if !(0.0..=1.0).contains(&self.conf_threshold) || !(0.0..=1.0).contains(&self.nms_threshold)
        {
            return bad(format!(
                "model {} thresholds out of range: conf {} nms {}",
                self.tag, self.conf_threshold, self.nms_threshold
            ));
        }
        if self.max_detections == 0 {
            return bad(format!("model {} max_detections is zero", self.tag));
        }
        Ok(())
    }

    /// 原始输出 → 原图坐标下的检测结果
    pub fn decode(&self, outputs: &[OutputTensor], lb: &Letterbox) -> Result<Vec<Detection>> {
        let candidates = match self.kind {
            ModelKind::YoloV5 => yolov5::decode(self, outputs)?,
            ModelKind::YoloV8 => yolov8::decode(self, outputs)?,
        };
        Ok(self.finalize(candidates, lb))
    }

    /// NMS → 截断 → 映射回原图 → 丢弃退化框
    fn finalize(&self, mut candidates: Vec<Detection>, lb: &Letterbox) -> Vec<Detection> {
        non_max_suppression(&mut candidates, self.nms_threshold, self.class_agnostic_nms);
        candidates.truncate(self.max_detections.min(MAX_DETECTIONS));
        candidates
            .into_iter()
            .filter_map(|mut d| {
                d.bbox = lb.to_source(&d.bbox);
                d.bbox.is_valid().then_some(d)
            })
            .collect()
    }
}

/// 检查输出张量个数
pub(crate) fn expect_outputs(outputs: &[OutputTensor], n: usize, model: &str) -> Result<()> {
    if outputs.len() < n {
        anyhow::bail!(
            "{} expects {} output tensors, engine returned {}",
            model,
            n,
            outputs.len()
        );
    }
    for (i, t) in outputs.iter().take(n).enumerate() {
        if t.data.len() < t.element_count() {
            anyhow::bail!(
                "{} output {} holds {} values, dims {:?} need {}",
                model,
                i,
                t.data.len(),
                t.dims,
                t.element_count()
            );
        }
    }
    Ok(())
}
