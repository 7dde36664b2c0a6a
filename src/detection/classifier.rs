use image::{imageops, imageops::FilterType};
use serde::Serialize;
use std::sync::Arc;

use crate::capture::Frame;
use crate::error::Result;
use crate::settings::ConfidenceThresholds;

use super::model::{Detector, RawDetection};

// SSD MobileNet v2 COCO label ids.
const PERSON_LABEL: u32 = 1;
const TV_LABEL: u32 = 72;
const LAPTOP_LABEL: u32 = 73;
const CELLPHONE_LABEL: u32 = 77;
const BOOK_LABEL: u32 = 84;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Person,
    Monitor,
    Phone,
    Book,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Person,
        Category::Monitor,
        Category::Phone,
        Category::Book,
    ];

    pub fn from_label(label: u32) -> Option<Self> {
        match label {
            PERSON_LABEL => Some(Category::Person),
            TV_LABEL | LAPTOP_LABEL => Some(Category::Monitor),
            CELLPHONE_LABEL => Some(Category::Phone),
            BOOK_LABEL => Some(Category::Book),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            Category::Person => 0,
            Category::Monitor => 1,
            Category::Phone => 2,
            Category::Book => 3,
        }
    }
}

/// Pixel box in the frame's native resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub xmin: u32,
    pub ymin: u32,
    pub xmax: u32,
    pub ymax: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub category: Category,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// One cycle's detections, bucketed by category.
#[derive(Debug, Clone, Default)]
pub struct DetectionSet {
    buckets: [Vec<Detection>; 4],
}

impl DetectionSet {
    pub fn push(&mut self, detection: Detection) {
        self.buckets[detection.category.index()].push(detection);
    }

    pub fn of(&self, category: Category) -> &[Detection] {
        &self.buckets[category.index()]
    }

    pub fn count(&self, category: Category) -> usize {
        self.of(category).len()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.buckets.iter().flatten()
    }
}

impl FromIterator<Detection> for DetectionSet {
    fn from_iter<T: IntoIterator<Item = Detection>>(iter: T) -> Self {
        let mut set = DetectionSet::default();
        for detection in iter {
            set.push(detection);
        }
        set
    }
}

/// Stateless per-frame classification on top of the opaque model.
pub struct DetectionClassifier {
    detector: Arc<dyn Detector>,
    input_size: (u32, u32),
    thresholds: ConfidenceThresholds,
}

impl DetectionClassifier {
    pub fn new(
        detector: Arc<dyn Detector>,
        input_size: (u32, u32),
        thresholds: ConfidenceThresholds,
    ) -> Self {
        Self {
            detector,
            input_size,
            thresholds,
        }
    }

    pub fn threshold(&self, category: Category) -> f32 {
        match category {
            Category::Person => self.thresholds.person,
            Category::Monitor => self.thresholds.monitor,
            Category::Phone => self.thresholds.phone,
            Category::Book => self.thresholds.book,
        }
    }

    /// Runs the model once and keeps the detections that map to a category
    /// and clear that category's threshold.
    pub fn classify(&self, frame: &Frame) -> Result<DetectionSet> {
        let (input_w, input_h) = self.input_size;
        let input = imageops::resize(frame.image.as_ref(), input_w, input_h, FilterType::Triangle);
        let raw = self.detector.detect(&input)?;
        Ok(self.bucket(raw, frame.dimensions()))
    }

    pub fn bucket(&self, raw: Vec<RawDetection>, native: (u32, u32)) -> DetectionSet {
        let (input_w, input_h) = self.input_size;
        let x_scale = native.0 as f32 / input_w as f32;
        let y_scale = native.1 as f32 / input_h as f32;

        raw.into_iter()
            .filter_map(|det| {
                let category = Category::from_label(det.label)?;
                if det.confidence <= self.threshold(category) {
                    return None;
                }
                Some(Detection {
                    category,
                    confidence: det.confidence,
                    bbox: BoundingBox {
                        xmin: scale(det.xmin, x_scale, native.0),
                        ymin: scale(det.ymin, y_scale, native.1),
                        xmax: scale(det.xmax, x_scale, native.0),
                        ymax: scale(det.ymax, y_scale, native.1),
                    },
                })
            })
            .collect()
    }
}

fn scale(value: f32, factor: f32, limit: u32) -> u32 {
    let scaled = (value * factor).max(0.0) as u32;
    scaled.min(limit.saturating_sub(1))
}
