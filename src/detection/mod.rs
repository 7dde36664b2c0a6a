pub mod classifier;
mod font;
pub mod model;
pub mod overlay;

pub use classifier::{BoundingBox, Category, Detection, DetectionClassifier, DetectionSet};
pub use model::{Detector, HttpDetector, RawDetection};
pub use overlay::{annotate, annotate_snapshot, encode_jpeg};
