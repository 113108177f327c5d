// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv5 后处理 (锚框)
// 三个输出头 [1, 3*(5+nc), gh, gw], 数值已过 sigmoid, stride 8/16/32

use anyhow::{bail, Result};

use super::labels;
use super::quant::{params_for_range, quantize};
use super::{expect_outputs, ModelSpec};
use crate::capability::OutputTensor;
use crate::types::{BBox, Detection};

const ANCHORS_PER_HEAD: usize = 3;

/// 每个输出头的锚框 (w, h), 模型输入像素
pub const ANCHORS: [[(f32, f32); ANCHORS_PER_HEAD]; 3] = [
    [(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)],
    [(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)],
    [(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)],
];

pub const STRIDES: [u32; 3] = [8, 16, 32];

struct Head<'a> {
    tensor: &'a OutputTensor,
    grid_h: usize,
    grid_w: usize,
    stride: f32,
    nc: usize,
}

impl<'a> Head<'a> {
    fn new(tensor: &'a OutputTensor, input_height: u32) -> Result<Self> {
        if tensor.dims.len() != 4 || tensor.dims[2] == 0 || tensor.dims[3] == 0 {
            bail!("YOLOv5 head must be [1, C, gh, gw], got {:?}", tensor.dims);
        }
        let channels = tensor.dims[1];
        if channels % ANCHORS_PER_HEAD != 0 || channels / ANCHORS_PER_HEAD <= 5 {
            bail!("YOLOv5 head channel count {} is not 3*(5+nc)", channels);
        }
        Ok(Self {
            tensor,
            grid_h: tensor.dims[2],
            grid_w: tensor.dims[3],
            stride: input_height as f32 / tensor.dims[2] as f32,
            nc: channels / ANCHORS_PER_HEAD - 5,
        })
    }

    #[inline]
    fn index(&self, anchor: usize, channel: usize, i: usize, j: usize) -> usize {
        let grid = self.grid_h * self.grid_w;
        (anchor * (5 + self.nc) + channel) * grid + i * self.grid_w + j
    }
}

/// 解码为模型坐标下的候选框 (未做 NMS)
pub fn decode(spec: &ModelSpec, outputs: &[OutputTensor]) -> Result<Vec<Detection>> {
    expect_outputs(outputs, 3, "YOLOv5")?;
    let mut out = Vec::new();

    for (h, tensor) in outputs.iter().take(3).enumerate() {
        let head = Head::new(tensor, spec.input_height)?;
        let thr_q = quantize(spec.conf_threshold, tensor.zero_point, tensor.scale);

        for (a, &(anchor_w, anchor_h)) in ANCHORS[h].iter().enumerate() {
            for i in 0..head.grid_h {
                for j in 0..head.grid_w {
                    let obj_q = tensor.data[head.index(a, 4, i, j)];
                    if obj_q < thr_q {
                        continue;
                    }

                    let mut best_q = i8::MIN;
                    let mut best_c = 0usize;
                    for c in 0..head.nc {
                        let q = tensor.data[head.index(a, 5 + c, i, j)];
                        if q > best_q {
                            best_q = q;
                            best_c = c;
                        }
                    }
                    if best_q < thr_q {
                        continue;
                    }

                    let score = tensor.dequant(head.index(a, 5 + best_c, i, j))
                        * tensor.dequant(head.index(a, 4, i, j));
                    if score < spec.conf_threshold {
                        continue;
                    }

                    let bx = tensor.dequant(head.index(a, 0, i, j)) * 2.0 - 0.5;
                    let by = tensor.dequant(head.index(a, 1, i, j)) * 2.0 - 0.5;
                    let bw = (tensor.dequant(head.index(a, 2, i, j)) * 2.0).powi(2) * anchor_w;
                    let bh = (tensor.dequant(head.index(a, 3, i, j)) * 2.0).powi(2) * anchor_h;
                    let cx = (bx + j as f32) * head.stride;
                    let cy = (by + i as f32) * head.stride;

                    let bbox = BBox::from_cxcywh(cx, cy, bw, bh)
                        .clamp_to(spec.input_width as f32, spec.input_height as f32);
                    if !bbox.is_valid() {
                        continue;
                    }
                    out.push(Detection {
                        class_id: best_c as u32,
                        class_name: labels::class_name(best_c as u32),
                        confidence: score.clamp(0.0, 1.0),
                        bbox,
                    });
                }
            }
        }
    }
    Ok(out)
}

/// 由 (类别, 置信度, 模型坐标框) 生成三个量化输出头, 供合成引擎与测试使用
pub fn encode(spec: &ModelSpec, objects: &[(u32, f32, BBox)]) -> Vec<OutputTensor> {
    let nc = spec.num_classes;
    let channels = ANCHORS_PER_HEAD * (5 + nc);
    let (scale, zp) = params_for_range(0.0, 1.0);

    let mut heads: Vec<OutputTensor> = STRIDES
        .iter()
        .map(|s| {
            let gh = (spec.input_height / s).max(1) as usize;
            let gw = (spec.input_width / s).max(1) as usize;
            OutputTensor {
                dims: vec![1, channels, gh, gw],
                data: vec![quantize(0.0, zp, scale); channels * gh * gw],
                zero_point: zp,
                scale,
            }
        })
        .collect();

    for &(class_id, conf, b) in objects {
        let (w, h) = (b.width(), b.height());
        if w <= 0.0 || h <= 0.0 {
            continue;
        }
        // 挑选能表达该尺寸且形状最接近的锚框
        let mut best: Option<(usize, usize, f32)> = None;
        for (hi, anchors) in ANCHORS.iter().enumerate() {
            for (ai, &(aw, ah)) in anchors.iter().enumerate() {
                if w >= 4.0 * aw || h >= 4.0 * ah {
                    continue;
                }
                let cost = (w / aw).ln().abs() + (h / ah).ln().abs();
                if best.map_or(true, |(_, _, c)| cost < c) {
                    best = Some((hi, ai, cost));
                }
            }
        }
        let Some((hi, ai, _)) = best else {
            continue;
        };

        let tensor = &mut heads[hi];
        let (gh, gw) = (tensor.dims[2], tensor.dims[3]);
        let stride = spec.input_height as f32 / gh as f32;
        let (aw, ah) = ANCHORS[hi][ai];
        let cx = (b.x1 + b.x2) / 2.0 / stride;
        let cy = (b.y1 + b.y2) / 2.0 / stride;
        let j = (cx.floor() as usize).min(gw - 1);
        let i = (cy.floor() as usize).min(gh - 1);
        let grid = gh * gw;
        let at = |channel: usize| (ai * (5 + nc) + channel) * grid + i * gw + j;

        let values = [
            ((cx - j as f32) + 0.5) / 2.0,
            ((cy - i as f32) + 0.5) / 2.0,
            (w / aw).sqrt() / 2.0,
            (h / ah).sqrt() / 2.0,
            1.0,
        ];
        for (channel, v) in values.iter().enumerate() {
            tensor.data[at(channel)] = quantize(*v, zp, scale);
        }
        let c = (class_id as usize).min(nc - 1);
        tensor.data[at(5 + c)] = quantize(conf, zp, scale);
    }
    heads
}
