// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

use crate::types::Detection;

/// 非极大值抑制: 按置信度降序, 依次保留并抑制 IoU 超过阈值的候选
///
/// `class_agnostic = false` 时只在同类之间抑制. 排序是稳定的, 对结果再跑一次不会改变它.
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32, class_agnostic: bool) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if !class_agnostic && xs[prev_index].class_id != xs[index].class_id {
                continue;
            }
            let iou = xs[prev_index].bbox.iou(&xs[index].bbox);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}
