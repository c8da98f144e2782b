/// 检测系统 (Detection System)
///
/// 对单帧做目标检测并只保留车辆类别:
/// - VehicleDetector: 检测接口 (外部能力边界,不修改输入帧)
/// - YOLOv8Detector:  基于 ONNX Runtime 的实现
pub mod yolov8;

pub use yolov8::{YOLOv8Detector, YOLOv8Options};

use std::collections::BTreeMap;

use phf::phf_map;
use serde::Serialize;

use crate::input::Frame;

/// 默认置信度阈值
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.25;

/// 车辆类别 → COCO类别ID
pub static VEHICLE_CLASSES: phf::Map<&'static str, usize> = phf_map! {
    "car" => 2,
    "motorcycle" => 3,
    "bus" => 5,
    "truck" => 7,
};

/// 默认允许的标签 (按COCO顺序)
pub fn default_vehicle_labels() -> Vec<String> {
    ["car", "motorcycle", "bus", "truck"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// COCO 80类名称
pub const COCO_NAMES: [&str; 80] = [
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

/// 检测框 (x1 < x2, y1 < y2, 原图像素坐标)
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
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

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    pub fn iou(&self, another: &BBox) -> f32 {
        let l = self.x1.max(another.x1);
        let r = self.x2.min(another.x2);
        let t = self.y1.max(another.y1);
        let b = self.y2.min(another.y2);
        let inter = (r - l).max(0.) * (b - t).max(0.);
        let union = self.area() + another.area() - inter;
        if union <= 0. {
            return 0.;
        }
        inter / union
    }

    /// 裁剪到帧范围内
    pub fn clamp(&self, width: f32, height: f32) -> Self {
        Self {
            x1: self.x1.clamp(0.0, width),
            y1: self.y1.clamp(0.0, height),
            x2: self.x2.clamp(0.0, width),
            y2: self.y2.clamp(0.0, height),
        }
    }
}

/// 单个检测结果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, class_id: usize, confidence: f32, bbox: BBox) -> Self {
        Self {
            label: label.into(),
            class_id,
            confidence,
            bbox,
        }
    }
}

/// 车辆检测接口
///
/// 同一帧、同一权重下结果确定;实现不得修改输入帧,画框等标注由调用方负责。
/// 返回值按置信度降序,且已按 `min_confidence` 与 `allowed_labels` 过滤。
pub trait VehicleDetector: Send {
    fn detect(
        &mut self,
        frame: &Frame,
        min_confidence: f32,
        allowed_labels: &[String],
    ) -> anyhow::Result<Vec<Detection>>;

    fn name(&self) -> &str {
        "detector"
    }
}

/// 置信度/标签过滤 + 排序,丢弃退化框
pub fn filter_detections(
    detections: Vec<Detection>,
    min_confidence: f32,
    allowed_labels: &[String],
) -> Vec<Detection> {
    let mut kept: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.confidence >= min_confidence && d.confidence <= 1.0)
        .filter(|d| allowed_labels.iter().any(|l| l == &d.label))
        .filter(|d| d.bbox.is_valid())
        .collect();
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    kept
}

/// 按标签统计 (日志/状态接口使用)
pub fn count_by_label(detections: &[Detection]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for d in detections {
        *counts.entry(d.label.clone()).or_insert(0) += 1;
    }
    counts
}

/// 非极大值抑制 (按类别),输入按置信度降序排列后原地截断
///
/// 只有同一 `class_id` 的框会互相抑制: 骑手不会吞掉摩托车,重叠的轿车和卡车各自保留。
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class_id != xs[index].class_id {
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
