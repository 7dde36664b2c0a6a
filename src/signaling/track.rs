use std::time::{Duration, Instant};

use crate::capture::{ConsumerId, Frame, FrameConsumer};

/// Clock rate of the outbound video time base (1/120000 s per tick).
pub const VIDEO_CLOCK_RATE: u64 = 120_000;

#[derive(Debug, Clone)]
pub struct VideoSample {
    pub frame: Frame,
    /// Presentation timestamp in `VIDEO_CLOCK_RATE` ticks since the first pull.
    pub pts: u64,
    /// True when no camera frame arrived in time and `frame` is blank filler.
    pub filler: bool,
}

/// Outbound media source for one peer connection, backed by its own
/// broadcaster consumer.
pub struct VideoTrack {
    consumer: FrameConsumer,
    receive_timeout: Duration,
    blank: Frame,
    started: Option<Instant>,
}

impl VideoTrack {
    pub fn new(consumer: FrameConsumer, receive_timeout: Duration, resolution: (u32, u32)) -> Self {
        Self {
            consumer,
            receive_timeout,
            blank: Frame::blank(resolution.0, resolution.1),
            started: None,
        }
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer.id()
    }

    /// Blocks up to the receive timeout. Media backends call this from their
    /// own sender thread; async callers should go through `spawn_blocking`.
    pub fn next_sample(&mut self) -> VideoSample {
        let now = Instant::now();
        let started = *self.started.get_or_insert(now);
        let pts = pts_ticks(now.duration_since(started));

        match self.consumer.receive(self.receive_timeout) {
            Some(frame) => VideoSample {
                frame,
                pts,
                filler: false,
            },
            None => VideoSample {
                frame: self.blank.clone(),
                pts,
                filler: true,
            },
        }
    }

    pub fn stop(&self) {
        self.consumer.detach();
    }
}

fn pts_ticks(elapsed: Duration) -> u64 {
    (elapsed.as_micros() as u64 * VIDEO_CLOCK_RATE) / 1_000_000
}
