use axum::{
    body::{Body, Bytes},
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use futures::stream;
use std::{convert::Infallible, sync::Arc, time::Duration};

use crate::capture::{Frame, FrameConsumer, OverflowPolicy};
use crate::detection::encode_jpeg;

use super::ApiState;

// Set to true to log every preview frame
const ENABLE_LOGS: bool = false;

use crate::log_debug;

const BOUNDARY: &str = "frame";
const PREVIEW_QUEUE: usize = 2;
const JPEG_QUALITY: u8 = 80;

/// MJPEG preview of the live camera. Each client gets its own consumer,
/// detached when the response body is dropped.
pub async fn video_stream(State(state): State<ApiState>) -> Response {
    let settings = state.coordinator.settings();
    let receive_timeout = settings.broadcast.receive_timeout();
    let blank = Frame::blank(settings.capture.width, settings.capture.height);

    let consumer = Arc::new(state.coordinator.broadcaster().attach(
        "preview",
        PREVIEW_QUEUE,
        OverflowPolicy::DropOldest,
    ));
    log::info!("preview client attached as {}", consumer.id());

    let parts = stream::unfold((consumer, blank), move |(consumer, blank)| async move {
        let reader = Arc::clone(&consumer);
        let filler = blank.clone();
        let chunk = tokio::task::spawn_blocking(move || next_chunk(&reader, &filler, receive_timeout))
            .await
            .ok()
            .flatten()?;
        Some((Ok::<Bytes, Infallible>(chunk), (consumer, blank)))
    });

    (
        [(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )],
        Body::from_stream(parts),
    )
        .into_response()
}

fn next_chunk(consumer: &FrameConsumer, blank: &Frame, timeout: Duration) -> Option<Bytes> {
    let frame = consumer.receive(timeout).unwrap_or_else(|| blank.clone());
    match encode_jpeg(&frame.image, JPEG_QUALITY) {
        Ok(jpeg) => {
            log_debug!("preview frame {} ({} bytes)", frame.seq, jpeg.len());
            Some(Bytes::from(part(&jpeg)))
        }
        Err(err) => {
            log::warn!("preview encode failed, closing stream: {err}");
            None
        }
    }
}

fn part(jpeg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(jpeg.len() + 64);
    out.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n").as_bytes());
    out.extend_from_slice(jpeg);
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_are_framed_for_multipart_replace() {
        let chunk = part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(chunk.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }
}
