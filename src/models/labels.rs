// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! COCO 类别名表

use phf::phf_map;

use crate::types::ClassName;

pub const PERSON: &str = "person";

pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// 常用类别 名称 → id
static CLASS_IDS: phf::Map<&'static str, u32> = phf_map! {
    "person" => 0,
    "bicycle" => 1,
    "car" => 2,
    "motorcycle" => 3,
    "bus" => 5,
    "truck" => 7,
    "backpack" => 24,
    "handbag" => 26,
    "suitcase" => 28,
    "cell phone" => 67,
};

pub fn class_name(class_id: u32) -> ClassName {
    match COCO_CLASSES.get(class_id as usize) {
        Some(name) => ClassName::new(name),
        None => ClassName::new(&format!("unknown_{}", class_id)),
    }
}

pub fn class_id(name: &str) -> Option<u32> {
    CLASS_IDS.get(name).copied().or_else(|| {
        COCO_CLASSES
            .iter()
            .position(|c| *c == name)
            .map(|i| i as u32)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_agree_with_table() {
        assert_eq!(class_name(0).as_str(), PERSON);
        assert_eq!(class_id("person"), Some(0));
        assert_eq!(class_id("toothbrush"), Some(79));
        assert_eq!(class_id("unicorn"), None);
        assert_eq!(class_name(120).as_str(), "unknown_120");
        for (name, id) in CLASS_IDS.entries() {
            assert_eq!(COCO_CLASSES[*id as usize], *name);
        }
    }
}
