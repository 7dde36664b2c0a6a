use chrono::{DateTime, Utc};
use image::RgbImage;
use std::sync::Arc;

/// One decoded camera frame. The pixel buffer is shared read-only between
/// every consumer it is fanned out to, so cloning a `Frame` is cheap.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(seq: u64, image: RgbImage) -> Self {
        Self {
            seq,
            captured_at: Utc::now(),
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Placeholder sent to viewers when the camera has nothing new.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(0, RgbImage::new(width, height))
    }
}
