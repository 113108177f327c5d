// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// Letterbox 预处理: 保持宽高比缩放 + 居中灰边填充
/// Aspect-preserving resize into the model input, and its inverse
use image::imageops::{self, FilterType};
use ndarray::Array4;

use crate::types::{BBox, Frame};

/// 填充像素值
pub const PAD_VALUE: u8 = 114;

/// 一次 letterbox 的几何参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
}

impl Letterbox {
    pub fn fit(src_width: u32, src_height: u32, dst_width: u32, dst_height: u32) -> Self {
        let scale = (dst_width as f32 / src_width as f32).min(dst_height as f32 / src_height as f32);
        let (new_w, new_h) = scaled_size(src_width, src_height, scale, dst_width, dst_height);
        Self {
            scale,
            pad_x: ((dst_width - new_w) / 2) as f32,
            pad_y: ((dst_height - new_h) / 2) as f32,
            src_width,
            src_height,
            dst_width,
            dst_height,
        }
    }

    /// 缩放后的内容区尺寸
    pub fn content_size(&self) -> (u32, u32) {
        scaled_size(
            self.src_width,
            self.src_height,
            self.scale,
            self.dst_width,
            self.dst_height,
        )
    }

    /// 模型坐标 → 原图坐标 (裁剪到图像范围)
    pub fn to_source(&self, b: &BBox) -> BBox {
        BBox {
            x1: (b.x1 - self.pad_x) / self.scale,
            y1: (b.y1 - self.pad_y) / self.scale,
            x2: (b.x2 - self.pad_x) / self.scale,
            y2: (b.y2 - self.pad_y) / self.scale,
        }
        .clamp_to(self.src_width as f32, self.src_height as f32)
    }

    /// 原图坐标 → 模型坐标
    pub fn to_model(&self, b: &BBox) -> BBox {
        BBox {
            x1: b.x1 * self.scale + self.pad_x,
            y1: b.y1 * self.scale + self.pad_y,
            x2: b.x2 * self.scale + self.pad_x,
            y2: b.y2 * self.scale + self.pad_y,
        }
    }
}

fn scaled_size(src_w: u32, src_h: u32, scale: f32, dst_w: u32, dst_h: u32) -> (u32, u32) {
    let w = ((src_w as f32 * scale).round() as u32).clamp(1, dst_w);
    let h = ((src_h as f32 * scale).round() as u32).clamp(1, dst_h);
    (w, h)
}

/// 帧 → [1, h, w, 3] RGB 输入张量
pub fn letterbox(frame: &Frame, dst_width: u32, dst_height: u32) -> (Array4<u8>, Letterbox) {
    let lb = Letterbox::fit(frame.width(), frame.height(), dst_width, dst_height);
    let rgba = frame.to_rgba_image();
    let (new_w, new_h) = lb.content_size();

    // 尺寸一致时跳过缩放
    let resized = if (new_w, new_h) == rgba.dimensions() {
        rgba
    } else {
        imageops::resize(&rgba, new_w, new_h, FilterType::Triangle)
    };

    let mut tensor = Array4::from_elem((1, dst_height as usize, dst_width as usize, 3), PAD_VALUE);
    let (ox, oy) = (lb.pad_x as usize, lb.pad_y as usize);
    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = (ox + x as usize, oy + y as usize);
        let [r, g, b, _] = px.0;
        tensor[[0, ty, tx, 0]] = r;
        tensor[[0, ty, tx, 1]] = g;
        tensor[[0, ty, tx, 2]] = b;
    }
    (tensor, lb)
}
