// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 结果输出: 叠加绘制 → 非阻塞交给渲染面
/// Result sink: overlay drawing and non-blocking hand-off to the renderer
use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex, RwLock};

use ab_glyph::{FontVec, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use log::{debug, info};

use crate::capability::{Presentation, Renderer};
use crate::config::OverlayConfig;
use crate::error::{PipelineError, Result};
use crate::supervisor::StreamHealth;
use crate::types::{AnnotatedFrame, BBox, CascadeResult, Frame, Gender, StreamId};

/// 允许绘制的类别; None 表示全部绘制 (只影响绘制, 不影响检测)
pub type DrawClassFilter = Arc<RwLock<Option<HashSet<String>>>>;

// ========== 调色板 ==========

const PALETTE: [(u8, u8, u8); 10] = [
    (255, 64, 64),   // 红色
    (64, 255, 64),   // 绿色
    (64, 64, 255),   // 蓝色
    (255, 255, 64),  // 黄色
    (255, 64, 255),  // 品红
    (64, 255, 255),  // 青色
    (255, 128, 0),   // 橙色
    (128, 0, 255),   // 紫色
    (255, 128, 192), // 粉色
    (128, 255, 128), // 浅绿
];

const LABEL_PX: f32 = 16.0;

fn class_color(class_id: u32) -> Rgba<u8> {
    let (r, g, b) = PALETTE[class_id as usize % PALETTE.len()];
    Rgba([r, g, b, 255])
}

fn face_color(gender: Gender) -> Rgba<u8> {
    match gender {
        Gender::Male => Rgba([64, 160, 255, 255]),
        Gender::Female => Rgba([255, 96, 192, 255]),
        Gender::Unknown => Rgba([220, 220, 220, 255]),
    }
}

/// 浮点框 → 像素矩形 (宽高至少 1)
fn rect_from_bbox(bbox: &BBox, img_w: u32, img_h: u32) -> Option<Rect> {
    if img_w == 0 || img_h == 0 || !bbox.is_valid() {
        return None;
    }
    let max_x = (img_w - 1) as f32;
    let max_y = (img_h - 1) as f32;
    let x1 = bbox.x1.clamp(0.0, max_x);
    let y1 = bbox.y1.clamp(0.0, max_y);
    let x2 = bbox.x2.clamp(0.0, max_x);
    let y2 = bbox.y2.clamp(0.0, max_y);
    let width = (x2 - x1).max(1.0).round() as u32;
    let height = (y2 - y1).max(1.0).round() as u32;
    Some(Rect::at(x1.round() as i32, y1.round() as i32).of_size(width, height))
}

/// 叠加绘制器 (所有流共享)
pub struct OverlayPainter {
    font: Option<FontVec>,
    line_thickness: u32,
    draw_faces: bool,
}

impl OverlayPainter {
    pub fn new(config: &OverlayConfig) -> Result<Self> {
        let font = match &config.font_path {
            Some(path) => {
                let bytes = fs::read(path).map_err(|e| {
                    PipelineError::InvalidArgument(format!("font {}: {}", path, e))
                })?;
                let font = FontVec::try_from_vec(bytes).map_err(|e| {
                    PipelineError::InvalidArgument(format!("font {}: {}", path, e))
                })?;
                info!("🔤 已加载标签字体 {}", path);
                Some(font)
            }
            None => None,
        };
        Ok(Self {
            font,
            line_thickness: config.line_thickness.max(1),
            draw_faces: config.draw_faces,
        })
    }

    fn draw_box(&self, image: &mut RgbaImage, bbox: &BBox, color: Rgba<u8>, label: Option<String>) {
        let (w, h) = image.dimensions();
        let Some(rect) = rect_from_bbox(bbox, w, h) else {
            return;
        };
        draw_hollow_rect_mut(image, rect, color);
        for t in 1..self.line_thickness {
            if let Some(inner) = shrink(rect, t) {
                draw_hollow_rect_mut(image, inner, color);
            }
        }

        if let (Some(font), Some(text)) = (&self.font, label) {
            let text_h = LABEL_PX as u32 + 4;
            let text_w = text.chars().count() as u32 * (LABEL_PX as u32 / 2) + 8;
            let y = (rect.top() - text_h as i32).max(0);
            let bg = Rect::at(rect.left(), y).of_size(text_w, text_h);
            draw_filled_rect_mut(image, bg, color);
            draw_text_mut(
                image,
                Rgba([0, 0, 0, 255]),
                rect.left() + 4,
                y + 2,
                PxScale::from(LABEL_PX),
                font,
                &text,
            );
        }
    }

    /// 在源帧上绘制检测框与人脸; 返回完整的标注帧
    pub fn paint(
        &self,
        frame: &Frame,
        result: &CascadeResult,
        filter: Option<&HashSet<String>>,
    ) -> AnnotatedFrame {
        let mut image = frame.to_rgba_image();
        let mut detections_drawn = 0;
        for det in &result.detections.detections {
            let name = det.class_name.as_str();
            if filter.is_some_and(|set| !set.contains(name)) {
                continue;
            }
            let label = format!("{} {:.2}", name, det.confidence);
            self.draw_box(&mut image, &det.bbox, class_color(det.class_id), Some(label));
            detections_drawn += 1;
        }

        let mut faces_drawn = 0;
        if self.draw_faces {
            for face in result.faces.iter().flat_map(|r| r.faces.iter()) {
                let attrs = &face.attributes;
                let label = attrs.is_valid().then(|| {
                    let gender = match attrs.gender {
                        Gender::Male => "M",
                        Gender::Female => "F",
                        Gender::Unknown => "?",
                    };
                    format!("{} {}", gender, attrs.age_label().unwrap_or("-"))
                });
                self.draw_box(&mut image, &face.bbox, face_color(attrs.gender), label);
                faces_drawn += 1;
            }
        }

        AnnotatedFrame {
            key: frame.key().clone(),
            image,
            detections_drawn,
            faces_drawn,
        }
    }
}

fn shrink(rect: Rect, by: u32) -> Option<Rect> {
    let w = rect.width().checked_sub(2 * by)?;
    let h = rect.height().checked_sub(2 * by)?;
    if w == 0 || h == 0 {
        return None;
    }
    Some(Rect::at(rect.left() + by as i32, rect.top() + by as i32).of_size(w, h))
}

// ========== ResultSink ==========

/// 单次交付结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Presented,
    /// 渲染面忙, 本帧跳过
    SurfaceUnavailable,
    /// 未绑定渲染面
    NoSurface,
    /// 帧号不晚于已交付的帧
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinkCounters {
    pub presented: u64,
    pub surface_unavailable: u64,
    pub no_surface: u64,
    pub stale: u64,
}

#[derive(Default)]
struct SinkState {
    renderer: Option<Arc<dyn Renderer>>,
    last_delivered: u64,
    last_good: Option<AnnotatedFrame>,
    counters: SinkCounters,
}

pub struct ResultSink {
    stream: StreamId,
    painter: Arc<OverlayPainter>,
    filter: DrawClassFilter,
    health: Arc<StreamHealth>,
    state: Mutex<SinkState>,
}

impl ResultSink {
    pub fn new(
        stream: StreamId,
        painter: Arc<OverlayPainter>,
        filter: DrawClassFilter,
        health: Arc<StreamHealth>,
    ) -> Self {
        Self {
            stream,
            painter,
            filter,
            health,
            state: Mutex::new(SinkState::default()),
        }
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn bind(&self, renderer: Arc<dyn Renderer>) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).renderer = Some(renderer);
        info!("🖥️  [{}] 渲染面已绑定", self.stream);
    }

    pub fn unbind(&self) -> bool {
        let had = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .renderer
            .take()
            .is_some();
        if had {
            info!("🖥️  [{}] 渲染面已解绑", self.stream);
        }
        had
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).renderer.is_some()
    }

    pub fn counters(&self) -> SinkCounters {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).counters
    }

    pub fn last_delivered(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).last_delivered
    }

    pub fn last_good(&self) -> Option<AnnotatedFrame> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).last_good.clone()
    }

    /// 绘制并尝试交给渲染面; 渲染面忙时直接跳过, 不阻塞调用方
    pub fn deliver(&self, frame: &Frame, result: &CascadeResult) -> Delivery {
        let renderer = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if frame.frame_id() <= state.last_delivered {
                state.counters.stale += 1;
                debug!(
                    "[{}] stale frame {} (last {})",
                    self.stream,
                    frame.frame_id(),
                    state.last_delivered
                );
                return Delivery::Stale;
            }
            state.last_delivered = frame.frame_id();
            state.renderer.clone()
        };
        self.health.record_success();

        let annotated = {
            let filter = self.filter.read().unwrap_or_else(|e| e.into_inner());
            self.painter.paint(frame, result, filter.as_ref())
        };

        let delivery = match &renderer {
            None => Delivery::NoSurface,
            Some(renderer) => match renderer.try_present(&annotated) {
                Presentation::Presented => Delivery::Presented,
                Presentation::SurfaceUnavailable => Delivery::SurfaceUnavailable,
            },
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match delivery {
            Delivery::Presented => state.counters.presented += 1,
            Delivery::SurfaceUnavailable => state.counters.surface_unavailable += 1,
            Delivery::NoSurface => state.counters.no_surface += 1,
            Delivery::Stale => {}
        }
        state.last_good = Some(annotated);
        delivery
    }

    /// 重新呈现最后一帧完整标注帧 (流停滞时)
    pub fn present_last_good(&self) -> Delivery {
        let (renderer, frame) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.renderer.clone(), state.last_good.clone())
        };
        match (renderer, frame) {
            (Some(renderer), Some(frame)) => match renderer.try_present(&frame) {
                Presentation::Presented => Delivery::Presented,
                Presentation::SurfaceUnavailable => Delivery::SurfaceUnavailable,
            },
            _ => Delivery::NoSurface,
        }
    }
}
