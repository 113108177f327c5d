// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 后处理 (无锚框)
// 输出: boxes [1, 4, N] (cx, cy, w, h, 模型输入像素) + scores [1, nc, N]

use anyhow::{bail, Result};

use super::labels;
use super::quant::{params_for_range, quantize};
use super::{expect_outputs, ModelSpec};
use crate::capability::OutputTensor;
use crate::types::{BBox, Detection};

/// 校验两个输出张量的形状, 返回锚点数 N
fn anchor_count(boxes: &OutputTensor, scores: &OutputTensor) -> Result<usize> {
    if boxes.dims.len() != 3 || boxes.dims[1] != 4 {
        bail!("YOLOv8 box tensor must be [1, 4, N], got {:?}", boxes.dims);
    }
    if scores.dims.len() != 3 || scores.dims[1] == 0 {
        bail!("YOLOv8 score tensor must be [1, nc, N], got {:?}", scores.dims);
    }
    if boxes.dims[2] != scores.dims[2] {
        bail!(
            "YOLOv8 anchor mismatch: boxes {:?} vs scores {:?}",
            boxes.dims,
            scores.dims
        );
    }
    Ok(boxes.dims[2])
}

/// 解码为模型坐标下的候选框 (未做 NMS)
pub fn decode(spec: &ModelSpec, outputs: &[OutputTensor]) -> Result<Vec<Detection>> {
    expect_outputs(outputs, 2, "YOLOv8")?;
    let (boxes, scores) = (&outputs[0], &outputs[1]);
    let n = anchor_count(boxes, scores)?;
    let nc = scores.dims[1];

    // 量化域阈值, 先粗筛再反量化
    let thr_q = quantize(spec.conf_threshold, scores.zero_point, scores.scale);

    let mut out = Vec::new();
    for a in 0..n {
        // argmax (量化值单调, 可直接比较)
        let mut best_q = i8::MIN;
        let mut best_c = 0usize;
        for c in 0..nc {
            let q = scores.data[c * n + a];
            if q > best_q {
                best_q = q;
                best_c = c;
            }
        }
        if best_q < thr_q {
            continue;
        }
        let confidence = scores.dequant(best_c * n + a);
        if confidence < spec.conf_threshold {
            continue;
        }

        let cx = boxes.dequant(a);
        let cy = boxes.dequant(n + a);
        let w = boxes.dequant(2 * n + a);
        let h = boxes.dequant(3 * n + a);
        let bbox = BBox::from_cxcywh(cx, cy, w, h)
            .clamp_to(spec.input_width as f32, spec.input_height as f32);
        if !bbox.is_valid() {
            continue;
        }

        out.push(Detection {
            class_id: best_c as u32,
            class_name: labels::class_name(best_c as u32),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        });
    }
    Ok(out)
}

/// 由 (类别, 置信度, 模型坐标框) 生成量化输出, 供合成引擎与测试使用
pub fn encode(spec: &ModelSpec, objects: &[(u32, f32, BBox)], min_anchors: usize) -> Vec<OutputTensor> {
    let n = objects.len().max(min_anchors).max(1);
    let nc = spec.num_classes;
    let extent = spec.input_width.max(spec.input_height) as f32;

    let (box_scale, box_zp) = params_for_range(0.0, extent);
    let (score_scale, score_zp) = params_for_range(0.0, 1.0);
    let mut box_data = vec![quantize(0.0, box_zp, box_scale); 4 * n];
    let mut score_data = vec![quantize(0.0, score_zp, score_scale); nc * n];

    for (a, (class_id, conf, b)) in objects.iter().enumerate() {
        let cx = (b.x1 + b.x2) / 2.0;
        let cy = (b.y1 + b.y2) / 2.0;
        box_data[a] = quantize(cx, box_zp, box_scale);
        box_data[n + a] = quantize(cy, box_zp, box_scale);
        box_data[2 * n + a] = quantize(b.width(), box_zp, box_scale);
        box_data[3 * n + a] = quantize(b.height(), box_zp, box_scale);
        let c = (*class_id as usize).min(nc - 1);
        score_data[c * n + a] = quantize(*conf, score_zp, score_scale);
    }

    vec![
        OutputTensor {
            dims: vec![1, 4, n],
            data: box_data,
            zero_point: box_zp,
            scale: box_scale,
        },
        OutputTensor {
            dims: vec![1, nc, n],
            data: score_data,
            zero_point: score_zp,
            scale: score_scale,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Letterbox;

    #[test]
    fn decodes_encoded_objects_within_quantization_error() {
        let spec = ModelSpec::yolov8("yolov8n");
        let objects = [
            (0, 0.9, BBox::new(100.0, 180.0, 200.0, 480.0)),
            (2, 0.7, BBox::new(400.0, 300.0, 600.0, 420.0)),
            (0, 0.3, BBox::new(10.0, 10.0, 60.0, 60.0)), // 低于阈值
        ];
        let outputs = encode(&spec, &objects, 16);
        let dets = decode(&spec, &outputs).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_name.as_str(), "person");
        assert!((dets[0].confidence - 0.9).abs() < 0.01);
        assert!((dets[0].bbox.x1 - 100.0).abs() < 3.0);
        assert!((dets[0].bbox.y2 - 480.0).abs() < 3.0);
        assert_eq!(dets[1].class_name.as_str(), "car");
    }

    #[test]
    fn full_decode_maps_back_to_frame() {
        let spec = ModelSpec::yolov8("yolov8n");
        let lb = Letterbox::fit(640, 480, 640, 640);
        let frame_box = BBox::new(100.0, 100.0, 200.0, 400.0);
        let outputs = encode(&spec, &[(0, 0.9, lb.to_model(&frame_box))], 8);
        let dets = spec.decode(&outputs, &lb).unwrap();
        assert_eq!(dets.len(), 1);
        assert!((dets[0].bbox.y1 - 100.0).abs() < 3.0);
        assert!((dets[0].bbox.y2 - 400.0).abs() < 3.0);
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let spec = ModelSpec::yolov8("yolov8n");
        let mut outputs = encode(&spec, &[], 4);
        outputs[1].dims = vec![1, spec.num_classes, 5];
        assert!(decode(&spec, &outputs).is_err());
        assert!(decode(&spec, &outputs[..1]).is_err());
    }
}
