use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use image::{imageops, imageops::FilterType, RgbImage};
use log::{info, warn};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::settings::CaptureSettings;

use super::{device::ReadInterrupt, CaptureDevice, DeviceLease, Frame, FrameBroadcaster};

// Set to true to log every captured frame
const ENABLE_LOGS: bool = false;

use crate::log_debug;

#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    pub resolution: (u32, u32),
    /// How long `stop` waits for the capture thread before returning.
    pub release_timeout: Duration,
    /// How long `start` waits for a previous holder to let go of the device.
    pub claim_timeout: Duration,
}

impl SourceOptions {
    pub fn from_settings(capture: &CaptureSettings) -> Self {
        Self {
            resolution: (capture.width, capture.height),
            release_timeout: capture.release_timeout(),
            claim_timeout: capture.open_timeout(),
        }
    }
}

/// Owns the camera while an exam generation is live and pumps frames into
/// the broadcaster from a dedicated capture thread.
///
/// The device lease travels with the capture thread and is dropped only
/// after the device is closed, so a stop that times out never frees the
/// device early.
pub struct FrameSource {
    device_id: String,
    cancel_token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    done_rx: Option<Receiver<()>>,
    interrupt: Option<ReadInterrupt>,
    release_timeout: Duration,
}

impl FrameSource {
    /// Claims and opens the device, then starts capturing. A failure leaves
    /// nothing running and the device unclaimed.
    pub fn start(
        mut device: Box<dyn CaptureDevice>,
        broadcaster: Arc<FrameBroadcaster>,
        options: SourceOptions,
    ) -> Result<Self> {
        let device_id = device.device_id();
        let lease = DeviceLease::acquire_within(&device_id, options.claim_timeout)?;

        if let Err(err) = device.apply_settings() {
            warn!("could not apply camera settings for {device_id}: {err}");
        }

        if let Err(err) = device.open() {
            device.close();
            if let Err(revert_err) = device.revert_settings() {
                warn!("could not revert camera settings for {device_id}: {revert_err}");
            }
            return Err(match err {
                Error::DeviceUnavailable(_) => err,
                other => Error::DeviceUnavailable(other.to_string()),
            });
        }

        let interrupt = device.read_interrupt();
        let cancel_token = CancellationToken::new();
        let (done_tx, done_rx) = bounded::<()>(0);
        let token = cancel_token.clone();
        let resolution = options.resolution;

        let handle = thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || capture_loop(device, lease, broadcaster, resolution, token, done_tx))?;

        info!("frame source started on {device_id}");

        Ok(Self {
            device_id,
            cancel_token: Some(cancel_token),
            handle: Some(handle),
            done_rx: Some(done_rx),
            interrupt,
            release_timeout: options.release_timeout,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signals the capture thread, breaks any blocked read and waits at most
    /// the release timeout for the thread to exit. Idempotent.
    pub fn stop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(interrupt) = self.interrupt.take() {
            interrupt();
        }

        if let (Some(handle), Some(done_rx)) = (self.handle.take(), self.done_rx.take()) {
            match done_rx.recv_timeout(self.release_timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "frame source on {} did not exit within {:?}; device stays claimed until it does",
                        self.device_id, self.release_timeout
                    );
                }
                _ => {
                    if handle.join().is_err() {
                        warn!("frame source thread for {} panicked", self.device_id);
                    }
                }
            }
            info!("frame source stopped on {}", self.device_id);
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn normalize(image: RgbImage, (width, height): (u32, u32)) -> RgbImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, FilterType::Triangle)
    }
}

fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    lease: DeviceLease,
    broadcaster: Arc<FrameBroadcaster>,
    resolution: (u32, u32),
    cancel_token: CancellationToken,
    done_tx: Sender<()>,
) {
    let mut seq: u64 = 0;

    while !cancel_token.is_cancelled() {
        let read = device.read_frame();
        // A read that outlived a stop must not reach the next generation.
        if cancel_token.is_cancelled() {
            break;
        }
        match read {
            Ok(image) => {
                seq += 1;
                let frame = Frame::new(seq, normalize(image, resolution));
                log_debug!("captured frame {} ({}x{})", seq, frame.width(), frame.height());
                broadcaster.publish(frame);
            }
            Err(Error::DeviceUnavailable(reason)) => {
                log::error!("capture device lost, frame source stopping: {reason}");
                break;
            }
            Err(err) => {
                log::warn!("frame read failed: {err}");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    device.close();
    if let Err(err) = device.revert_settings() {
        log::warn!("could not revert camera settings: {err}");
    }
    drop(lease);
    // Wake a pending `stop` even when nobody is waiting.
    let _ = done_tx.try_send(());
}
