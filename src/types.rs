// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 级联推理核心数据结构定义
/// Core data model shared by the inference scheduler, the cascade and the sink
use std::fmt;
use std::sync::Arc;

use image::RgbaImage;
use serde::{Serialize, Serializer};

use crate::error::{PipelineError, Result};

// ========== 标识符 ==========

/// 视频流标识 (廉价克隆)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(Arc<str>);

impl StreamId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// 模型标识 (例如 "yolov5s", "yolov8n")
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelTag(Arc<str>);

impl ModelTag {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(Arc::from(tag.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ModelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for ModelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ModelTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// 结果关联键: (流, 帧号)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FrameKey {
    pub stream: StreamId,
    pub frame_id: u64,
}

impl FrameKey {
    pub fn new(stream: StreamId, frame_id: u64) -> Self {
        Self { stream, frame_id }
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream, self.frame_id)
    }
}

// ========== 帧 ==========

/// 解码器输出的像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelFormat {
    Rgba8888,
    Bgra8888,
    Rgb888,
    /// Y平面 + 交错UV平面 (4:2:0)
    Nv12,
}

impl PixelFormat {
    /// 单行最少字节数
    pub fn min_stride(&self, width: u32) -> usize {
        let w = width as usize;
        match self {
            PixelFormat::Rgba8888 | PixelFormat::Bgra8888 => w * 4,
            PixelFormat::Rgb888 => w * 3,
            // 奇数宽度时 UV 行仍按整对存放
            PixelFormat::Nv12 => w.div_ceil(2) * 2,
        }
    }

    /// 给定行宽和高度时缓冲区所需的最少字节数
    pub fn min_len(&self, stride: usize, height: u32) -> usize {
        let h = height as usize;
        match self {
            PixelFormat::Nv12 => stride * (h + h.div_ceil(2)),
            _ => stride * h,
        }
    }
}

/// 解码器回调携带的原始帧 (尚未分配帧号)
#[derive(Clone)]
pub struct RawFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: PixelFormat,
    pub timestamp_ms: u64,
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("bytes", &self.pixels.len())
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

impl RawFrame {
    /// 紧凑 RGBA 图像转原始帧
    pub fn from_rgba(image: RgbaImage, timestamp_ms: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
            stride: width as usize * 4,
            format: PixelFormat::Rgba8888,
            timestamp_ms,
        }
    }
}

/// 带帧号的像素缓冲区, 通过 move 在各阶段之间传递
pub struct Frame {
    key: FrameKey,
    raw: RawFrame,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("key", &self.key)
            .field("raw", &self.raw)
            .finish()
    }
}

impl Frame {
    /// 校验尺寸与缓冲区长度后绑定帧号
    pub fn from_raw(stream: StreamId, frame_id: u64, raw: RawFrame) -> Result<Self> {
        if raw.width == 0 || raw.height == 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "frame has empty dimensions {}x{}",
                raw.width, raw.height
            )));
        }
        let min_stride = raw.format.min_stride(raw.width);
        if raw.stride < min_stride {
            return Err(PipelineError::InvalidArgument(format!(
                "stride {} below minimum {} for {:?}",
                raw.stride, min_stride, raw.format
            )));
        }
        let min_len = raw.format.min_len(raw.stride, raw.height);
        if raw.pixels.len() < min_len {
            return Err(PipelineError::InvalidArgument(format!(
                "buffer holds {} bytes, {}x{} {:?} needs {}",
                raw.pixels.len(),
                raw.width,
                raw.height,
                raw.format,
                min_len
            )));
        }
        Ok(Self {
            key: FrameKey::new(stream, frame_id),
            raw,
        })
    }

    pub fn key(&self) -> &FrameKey {
        &self.key
    }

    pub fn frame_id(&self) -> u64 {
        self.key.frame_id
    }

    pub fn stream(&self) -> &StreamId {
        &self.key.stream
    }

    pub fn width(&self) -> u32 {
        self.raw.width
    }

    pub fn height(&self) -> u32 {
        self.raw.height
    }

    pub fn stride(&self) -> usize {
        self.raw.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.raw.format
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.raw.timestamp_ms
    }

    pub fn pixels(&self) -> &[u8] {
        &self.raw.pixels
    }

    pub fn into_raw(self) -> RawFrame {
        self.raw
    }

    /// 转为紧凑的 RGBA 图像 (遵循 stride)
    pub fn to_rgba_image(&self) -> RgbaImage {
        let (w, h) = (self.raw.width, self.raw.height);
        let stride = self.raw.stride;
        let px = &self.raw.pixels;
        let mut out = Vec::with_capacity(w as usize * h as usize * 4);

        match self.raw.format {
            PixelFormat::Rgba8888 => {
                for y in 0..h as usize {
                    let row = &px[y * stride..y * stride + w as usize * 4];
                    out.extend_from_slice(row);
                }
            }
            PixelFormat::Bgra8888 => {
                for y in 0..h as usize {
                    let row = &px[y * stride..y * stride + w as usize * 4];
                    for p in row.chunks_exact(4) {
                        out.extend_from_slice(&[p[2], p[1], p[0], p[3]]);
                    }
                }
            }
            PixelFormat::Rgb888 => {
                for y in 0..h as usize {
                    let row = &px[y * stride..y * stride + w as usize * 3];
                    for p in row.chunks_exact(3) {
                        out.extend_from_slice(&[p[0], p[1], p[2], 255]);
                    }
                }
            }
            PixelFormat::Nv12 => {
                let uv_base = stride * h as usize;
                for y in 0..h as usize {
                    for x in 0..w as usize {
                        let luma = px[y * stride + x] as f32;
                        let uv = uv_base + (y / 2) * stride + (x / 2) * 2;
                        let u = px[uv] as f32 - 128.0;
                        let v = px[uv + 1] as f32 - 128.0;
                        // BT.601
                        let r = (luma + 1.402 * v).clamp(0.0, 255.0) as u8;
                        let g = (luma - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
                        let b = (luma + 1.772 * u).clamp(0.0, 255.0) as u8;
                        out.extend_from_slice(&[r, g, b, 255]);
                    }
                }
            }
        }

        // 长度在 from_raw 中已校验
        RgbaImage::from_raw(w, h, out).unwrap_or_else(|| RgbaImage::new(w, h))
    }
}

// ========== 检测结果 ==========

/// 定长类别名 (≤ 32 字节, 可 Copy)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassName {
    bytes: [u8; ClassName::CAPACITY],
    len: u8,
}

impl ClassName {
    pub const CAPACITY: usize = 32;

    /// 超长名称在字符边界处截断
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(Self::CAPACITY);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; Self::CAPACITY];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self {
            bytes,
            len: end as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }
}

impl fmt::Debug for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ClassName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// 轴对齐检测框 (x1,y1,x2,y2)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// x1<x2 且 y1<y2
    pub fn is_valid(&self) -> bool {
        self.x1.is_finite()
            && self.y1.is_finite()
            && self.x2.is_finite()
            && self.y2.is_finite()
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    /// 面积为零的框 IoU 为 0
    pub fn iou(&self, other: &BBox) -> f32 {
        let (a, b) = (self.area(), other.area());
        if a <= 0.0 || b <= 0.0 {
            return 0.0;
        }
        let inter = self.intersection_area(other);
        let union = a + b - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// 裁剪到 [0,w]x[0,h]
    pub fn clamp_to(&self, width: f32, height: f32) -> BBox {
        BBox {
            x1: self.x1.clamp(0.0, width),
            y1: self.y1.clamp(0.0, height),
            x2: self.x2.clamp(0.0, width),
            y2: self.y2.clamp(0.0, height),
        }
    }
}

/// 单个检测结果 (值类型)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: ClassName,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(class_id: u32, class_name: &str, confidence: f32, bbox: BBox) -> Self {
        Self {
            class_id,
            class_name: ClassName::new(class_name),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }

    pub fn is_class(&self, name: &str) -> bool {
        self.class_name.as_str() == name
    }
}

/// 单帧推理各阶段耗时 (毫秒)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WorkerTiming {
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
    pub worker_index: usize,
    pub core: usize,
}

/// 单帧一阶段检测结果
#[derive(Debug, Clone, Serialize)]
pub struct DetectionSet {
    pub key: FrameKey,
    pub detections: Vec<Detection>,
    pub model: ModelTag,
    pub completed_ms: u64,
    pub timing: WorkerTiming,
}

impl DetectionSet {
    pub fn frame_id(&self) -> u64 {
        self.key.frame_id
    }

    pub fn count_class(&self, name: &str) -> usize {
        self.detections.iter().filter(|d| d.is_class(name)).count()
    }
}

// ========== 人脸属性 ==========

pub const AGE_BRACKET_LABELS: [&str; 9] = [
    "0-2", "3-9", "10-19", "20-29", "30-39", "40-49", "50-59", "60-69", "70+",
];

pub const RACE_LABELS: [&str; 5] = ["Black", "Asian", "Latino", "Middle Eastern", "White"];

/// 性别 (female=0, male=1, unknown=-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Gender {
    Female,
    Male,
    #[default]
    Unknown,
}

impl Gender {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Gender::Female,
            1 => Gender::Male,
            _ => Gender::Unknown,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Gender::Female => 0,
            Gender::Male => 1,
            Gender::Unknown => -1,
        }
    }
}

/// 人脸属性; 越界的编码视为未知
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FaceAttributes {
    pub gender: Gender,
    pub gender_confidence: f32,
    pub age_bracket: Option<u8>,
    pub age_confidence: f32,
    pub race: Option<u8>,
    pub race_confidence: f32,
}

impl FaceAttributes {
    /// 由整型编码构造 (-1 表示未知)
    pub fn from_codes(gender: i32, age_bracket: i32, race: i32) -> Self {
        let age = (0..AGE_BRACKET_LABELS.len() as i32)
            .contains(&age_bracket)
            .then_some(age_bracket as u8);
        let race = (0..RACE_LABELS.len() as i32)
            .contains(&race)
            .then_some(race as u8);
        Self {
            gender: Gender::from_code(gender),
            age_bracket: age,
            race,
            ..Self::default()
        }
    }

    pub fn with_confidences(mut self, gender: f32, age: f32, race: f32) -> Self {
        self.gender_confidence = gender;
        self.age_confidence = age;
        self.race_confidence = race;
        self
    }

    /// 性别与年龄段均已知才算有效
    pub fn is_valid(&self) -> bool {
        self.gender != Gender::Unknown
            && self
                .age_bracket
                .is_some_and(|a| (a as usize) < AGE_BRACKET_LABELS.len())
    }

    pub fn age_label(&self) -> Option<&'static str> {
        self.age_bracket
            .and_then(|a| AGE_BRACKET_LABELS.get(a as usize).copied())
    }

    pub fn race_label(&self) -> Option<&'static str> {
        self.race.and_then(|r| RACE_LABELS.get(r as usize).copied())
    }
}

/// 单张人脸 (图像坐标)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaceRecord {
    pub bbox: BBox,
    pub confidence: f32,
    pub attributes: FaceAttributes,
}

/// 一个人体区域的二阶段分析结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceAnalysisResult {
    pub person: Detection,
    pub faces: Vec<FaceRecord>,
}

/// 送入人脸分析的区域: 原始人体检测 + 外扩后的 ROI
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersonRoi {
    pub person: Detection,
    pub roi: BBox,
}

// ========== 级联结果 ==========

/// 各阶段耗时 (毫秒)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PerStageTiming {
    /// 提交到取回一阶段结果
    pub stage1_wait_ms: f64,
    pub stage1: WorkerTiming,
    pub stage2_ms: Option<f64>,
    pub stats_ms: f64,
    pub total_ms: f64,
}

/// 级联一帧的完整输出
#[derive(Debug, Clone, Serialize)]
pub struct CascadeResult {
    pub detections: DetectionSet,
    pub faces: Vec<FaceAnalysisResult>,
    pub stats: crate::stats::StatsSnapshot,
    pub timing: PerStageTiming,
    pub stage2_ran: bool,
    pub stage2_failed: bool,
}

impl CascadeResult {
    pub fn face_count(&self) -> usize {
        self.faces.iter().map(|f| f.faces.len()).sum()
    }
}

/// 交给渲染器的已标注帧
#[derive(Clone)]
pub struct AnnotatedFrame {
    pub key: FrameKey,
    pub image: RgbaImage,
    pub detections_drawn: usize,
    pub faces_drawn: usize,
}

impl fmt::Debug for AnnotatedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnotatedFrame")
            .field("key", &self.key)
            .field("size", &self.image.dimensions())
            .field("detections_drawn", &self.detections_drawn)
            .field("faces_drawn", &self.faces_drawn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_name_truncates_on_char_boundary() {
        let long = "é".repeat(20); // 40 bytes
        let name = ClassName::new(&long);
        assert!(name.as_str().len() <= ClassName::CAPACITY);
        assert_eq!(name.as_str(), "é".repeat(16));
        assert_eq!(ClassName::new("person").as_str(), "person");
    }

    #[test]
    fn zero_area_boxes_have_zero_iou() {
        let a = BBox::new(10.0, 10.0, 10.0, 50.0);
        let b = BBox::new(0.0, 0.0, 100.0, 100.0);
        assert_eq!(a.iou(&b), 0.0);
        assert_eq!(b.iou(&b), 1.0);
        let c = BBox::new(200.0, 200.0, 300.0, 300.0);
        assert_eq!(b.iou(&c), 0.0);
    }

    #[test]
    fn frame_rejects_short_buffers() {
        let raw = RawFrame {
            pixels: vec![0; 10],
            width: 4,
            height: 4,
            stride: 16,
            format: PixelFormat::Rgba8888,
            timestamp_ms: 0,
        };
        let err = Frame::from_raw(StreamId::new("cam"), 1, raw).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn padded_stride_and_bgra_convert_to_rgba() {
        // 2x1 BGRA, stride 12 (4 bytes padding)
        let pixels = vec![1, 2, 3, 255, 4, 5, 6, 255, 0, 0, 0, 0];
        let raw = RawFrame {
            pixels,
            width: 2,
            height: 1,
            stride: 12,
            format: PixelFormat::Bgra8888,
            timestamp_ms: 0,
        };
        let frame = Frame::from_raw(StreamId::new("cam"), 1, raw).unwrap();
        let img = frame.to_rgba_image();
        assert_eq!(img.get_pixel(0, 0).0, [3, 2, 1, 255]);
        assert_eq!(img.get_pixel(1, 0).0, [6, 5, 4, 255]);
    }

    #[test]
    fn nv12_grey_stays_grey() {
        let (w, h) = (4u32, 2u32);
        let mut pixels = vec![128u8; (w * h) as usize];
        pixels.extend(vec![128u8; (w * h / 2) as usize]);
        let raw = RawFrame {
            pixels,
            width: w,
            height: h,
            stride: w as usize,
            format: PixelFormat::Nv12,
            timestamp_ms: 0,
        };
        let img = Frame::from_raw(StreamId::new("cam"), 1, raw)
            .unwrap()
            .to_rgba_image();
        for p in img.pixels() {
            assert_eq!(p.0, [128, 128, 128, 255]);
        }
    }

    #[test]
    fn odd_width_nv12_needs_a_full_uv_pair_per_row() {
        let tight = RawFrame {
            pixels: vec![128; 9],
            width: 3,
            height: 2,
            stride: 3,
            format: PixelFormat::Nv12,
            timestamp_ms: 0,
        };
        let err = Frame::from_raw(StreamId::new("cam"), 1, tight).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);

        let padded = RawFrame {
            pixels: vec![128; 12],
            width: 3,
            height: 2,
            stride: 4,
            format: PixelFormat::Nv12,
            timestamp_ms: 0,
        };
        let img = Frame::from_raw(StreamId::new("cam"), 1, padded)
            .unwrap()
            .to_rgba_image();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(2, 1).0, [128, 128, 128, 255]);
    }

    #[test]
    fn face_attribute_validity() {
        assert!(FaceAttributes::from_codes(1, 3, 2).is_valid());
        assert!(!FaceAttributes::from_codes(-1, 3, 2).is_valid());
        assert!(!FaceAttributes::from_codes(0, -1, 2).is_valid());
        let out_of_range = FaceAttributes::from_codes(0, 9, 7);
        assert!(!out_of_range.is_valid());
        assert_eq!(out_of_range.race, None);
        assert_eq!(FaceAttributes::from_codes(0, 8, 4).age_label(), Some("70+"));
    }
}
