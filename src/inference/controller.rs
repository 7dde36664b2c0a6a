use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::capture::FrameConsumer;
use crate::detection::DetectionClassifier;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;

use super::loop_worker::{inference_loop, InferenceContext};
use super::{ViolationDebouncer, ViolationSink};

#[derive(Debug, Clone, Copy)]
pub struct InferenceOptions {
    /// How long one cycle waits for a frame before looping again.
    pub receive_timeout: Duration,
    /// Upper bound `stop` waits for the worker to finish its current cycle.
    pub join_timeout: Duration,
    pub attach_snapshots: bool,
    /// Log one line per completed cycle.
    pub log_cycles: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_millis(1_500),
            attach_snapshots: true,
            log_cycles: false,
        }
    }
}

/// Owns the inference worker thread for one exam generation.
pub struct InferenceLoop {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    done_rx: Option<Receiver<()>>,
    consumer: Option<Arc<FrameConsumer>>,
    join_timeout: Duration,
}

impl InferenceLoop {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
            done_rx: None,
            consumer: None,
            join_timeout: InferenceOptions::default().join_timeout,
        }
    }

    pub fn start(
        &mut self,
        consumer: FrameConsumer,
        classifier: DetectionClassifier,
        debouncer: ViolationDebouncer,
        sink: Arc<dyn ViolationSink>,
        metrics: MetricsCollector,
        options: InferenceOptions,
    ) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::AlreadyActive("inference loop"));
        }

        let consumer = Arc::new(consumer);
        let cancel_token = CancellationToken::new();
        let (done_tx, done_rx) = bounded::<()>(0);

        let ctx = InferenceContext {
            consumer: Arc::clone(&consumer),
            classifier,
            debouncer,
            sink,
            metrics,
            receive_timeout: options.receive_timeout,
            attach_snapshots: options.attach_snapshots,
            log_cycles: options.log_cycles,
        };
        let token = cancel_token.clone();
        let handle = thread::Builder::new()
            .name("inference".into())
            .spawn(move || inference_loop(ctx, token, done_tx))?;

        log::info!("inference loop started (consumer {})", consumer.id());

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.done_rx = Some(done_rx);
        self.consumer = Some(consumer);
        self.join_timeout = options.join_timeout;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signals the worker, detaches its consumer and waits a bounded time for
    /// the in-flight cycle. Safe to call repeatedly or before `start`.
    pub fn stop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(consumer) = self.consumer.take() {
            consumer.detach();
        }

        if let (Some(handle), Some(done_rx)) = (self.handle.take(), self.done_rx.take()) {
            match done_rx.recv_timeout(self.join_timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "inference loop still busy after {:?}; leaving it to exit on its own",
                        self.join_timeout
                    );
                }
                _ => {
                    if handle.join().is_err() {
                        log::warn!("inference thread panicked");
                    }
                }
            }
            log::info!("inference loop stopped");
        }
    }
}

impl Default for InferenceLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InferenceLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
