use chrono::{DateTime, Utc};
use image::{codecs::jpeg::JpegEncoder, Rgb, RgbImage};

use super::font::{draw_text, text_width, GLYPH_HEIGHT};
use super::{BoundingBox, Detection};

pub const ALERT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: u32 = 4;
const TEXT_PAD: u32 = 3;

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(image)?;
    Ok(out)
}

/// Draw a rectangle border with given thickness, clipped to the image.
pub fn draw_rect(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let x0 = bbox.xmin.min(w - 1);
    let y0 = bbox.ymin.min(h - 1);
    let x1 = bbox.xmax.min(w - 1);
    let y1 = bbox.ymax.min(h - 1);

    for t in 0..thickness {
        let xx0 = x0.saturating_add(t);
        let yy0 = y0.saturating_add(t);
        let xx1 = x1.saturating_sub(t);
        let yy1 = y1.saturating_sub(t);
        if xx0 > xx1 || yy0 > yy1 {
            break;
        }
        for x in xx0..=xx1 {
            img.put_pixel(x, yy0, color);
            img.put_pixel(x, yy1, color);
        }
        for y in yy0..=yy1 {
            img.put_pixel(xx0, y, color);
            img.put_pixel(xx1, y, color);
        }
    }
}

fn text_scale(width: u32) -> u32 {
    if width >= 640 {
        2
    } else {
        1
    }
}

/// Burns the violation into a copy of the frame: a red banner carrying the
/// message and the detection time, then every evidence box outlined with its
/// confidence written above it.
pub fn annotate(
    frame: &RgbImage,
    detections: &[Detection],
    message: &str,
    detected_at: DateTime<Utc>,
) -> RgbImage {
    let mut canvas = frame.clone();
    let (w, h) = canvas.dimensions();
    let scale = text_scale(w);
    let line = (GLYPH_HEIGHT + 2) * scale;
    let banner = (2 * line + 2 * TEXT_PAD).min(h);

    for y in 0..banner {
        for x in 0..w {
            canvas.put_pixel(x, y, ALERT_COLOR);
        }
    }
    let stamp = detected_at.format("%Y-%m-%d %H:%M:%S UTC").to_string();
    draw_text(&mut canvas, TEXT_PAD, TEXT_PAD, message, scale, TEXT_COLOR);
    draw_text(&mut canvas, TEXT_PAD, TEXT_PAD + line, &stamp, scale, TEXT_COLOR);

    for detection in detections {
        let bbox = &detection.bbox;
        draw_rect(&mut canvas, bbox, ALERT_COLOR, BOX_THICKNESS);

        let label = format!("{:.0}%", detection.confidence * 100.0);
        // Above the box when there is room below the banner, inside otherwise.
        let label_y = if bbox.ymin >= banner + line {
            bbox.ymin - line
        } else {
            bbox.ymin + BOX_THICKNESS + 1
        };
        let label_x = (bbox.xmin + 1).min(w.saturating_sub(text_width(&label, scale)));
        draw_text(&mut canvas, label_x, label_y, &label, scale, ALERT_COLOR);
    }

    canvas
}

/// JPEG evidence for a violation, see [`annotate`].
pub fn annotate_snapshot(
    frame: &RgbImage,
    detections: &[Detection],
    message: &str,
    detected_at: DateTime<Utc>,
) -> image::ImageResult<Vec<u8>> {
    encode_jpeg(&annotate(frame, detections, message, detected_at), 85)
}
