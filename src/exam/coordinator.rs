use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

use crate::capture::{
    CaptureDeviceFactory, FrameBroadcaster, FrameSource, OverflowPolicy, SourceOptions,
};
use crate::detection::{DetectionClassifier, Detector};
use crate::error::{Error, Result};
use crate::inference::{InferenceLoop, InferenceOptions, ViolationDebouncer, ViolationSink};
use crate::metrics::MetricsCollector;
use crate::remote::{ExamId, ProctorServer};
use crate::settings::Settings;
use crate::signaling::{HubConnector, PeerFactory, SessionOutcome, SignalingOptions, SignalingSession};

use super::events::EventForwarder;
use super::state::{CoordinatorStatus, ExamContext, Generation};

/// Collaborators the coordinator drives. Signaling runs only when both a hub
/// and a peer factory are present.
#[derive(Clone)]
pub struct PipelineDeps {
    pub devices: Arc<dyn CaptureDeviceFactory>,
    pub detector: Arc<dyn Detector>,
    pub server: Arc<dyn ProctorServer>,
    pub hub: Option<Arc<dyn HubConnector>>,
    pub peers: Option<Arc<dyn PeerFactory>>,
}

struct CoordinatorState {
    next_generation: u64,
    current: Option<Generation>,
}

/// Owns every live pipeline resource, one exam generation at a time.
#[derive(Clone)]
pub struct SessionCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    settings: Arc<Settings>,
    deps: PipelineDeps,
    broadcaster: Arc<FrameBroadcaster>,
    metrics: MetricsCollector,
}

impl SessionCoordinator {
    pub fn new(settings: Settings, deps: PipelineDeps) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState {
                next_generation: 1,
                current: None,
            })),
            settings: Arc::new(settings),
            deps,
            broadcaster: FrameBroadcaster::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn broadcaster(&self) -> Arc<FrameBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Logs in with the browser's token, fetches the exam policy and roster,
    /// and starts a new generation. Policy and roster failures fall back to
    /// the strict policy and an empty roster.
    pub async fn login_and_start_exam(&self, token: &str, exam_id: ExamId) -> Result<u64> {
        let server = &self.deps.server;
        let auth = server.login(token).await?;

        let allow_books = match server.exam_details(&auth, exam_id).await {
            Ok(details) => details.allow_books,
            Err(err) => {
                log::warn!("exam {exam_id}: could not fetch details, books disallowed: {err}");
                false
            }
        };

        let proctors = match server.proctors(&auth, exam_id).await {
            Ok(proctors) => proctors.into_iter().map(|p| p.id).collect(),
            Err(err) => {
                log::warn!("exam {exam_id}: could not fetch proctors: {err}");
                Vec::new()
            }
        };

        self.start_exam(ExamContext {
            exam_id,
            auth,
            allow_books,
            proctors,
        })
        .await
    }

    /// Quiesces any running generation, then brings up capture, inference and
    /// signaling for `exam`. On failure nothing from the new generation is
    /// left running.
    pub async fn start_exam(&self, exam: ExamContext) -> Result<u64> {
        let mut state = self.state.lock().await;

        if let Some(previous) = state.current.take() {
            log::info!("stopping generation {} before starting a new one", previous.id);
            teardown(previous).await;
        }

        let id = state.next_generation;
        state.next_generation += 1;

        let (generation, outcome) = self.launch(id, &exam).await.map_err(|err| {
            log::error!("generation {id} for exam {} failed to start: {err}", exam.exam_id);
            err
        })?;

        if let Some(outcome) = outcome {
            self.watch(id, outcome);
        }
        state.current = Some(generation);
        log::info!("generation {id} started for exam {}", exam.exam_id);
        Ok(id)
    }

    async fn launch(
        &self,
        id: u64,
        exam: &ExamContext,
    ) -> Result<(Generation, Option<oneshot::Receiver<SessionOutcome>>)> {
        let settings = &self.settings;

        let device = self.deps.devices.create();
        let broadcaster = self.broadcaster();
        let options = SourceOptions::from_settings(&settings.capture);
        let source = tokio::task::spawn_blocking(move || FrameSource::start(device, broadcaster, options))
        .await
        .map_err(|err| Error::DeviceUnavailable(format!("capture start aborted: {err}")))??;

        let (forwarder, _) = EventForwarder::spawn(
            id,
            exam.exam_id,
            exam.auth.clone(),
            Arc::clone(&self.deps.server),
            self.metrics.clone(),
        );

        let consumer = self.broadcaster.attach(
            "inference",
            settings.broadcast.inference_queue_capacity,
            OverflowPolicy::DropOldest,
        );
        let classifier = DetectionClassifier::new(
            Arc::clone(&self.deps.detector),
            (settings.detection.input_width, settings.detection.input_height),
            settings.detection.thresholds,
        );
        let debouncer = ViolationDebouncer::new(settings.debounce, exam.allow_books);
        let sink: Arc<dyn ViolationSink> = forwarder.clone();

        let mut inference = InferenceLoop::new();
        if let Err(err) = inference.start(
            consumer,
            classifier,
            debouncer,
            sink,
            self.metrics.clone(),
            InferenceOptions {
                receive_timeout: settings.broadcast.receive_timeout(),
                join_timeout: settings.detection.join_timeout(),
                attach_snapshots: settings.detection.attach_snapshots,
                log_cycles: settings.debug,
            },
        ) {
            forwarder.close();
            quiesce(inference, source).await;
            return Err(err);
        }

        let mut outcome = None;
        let mut signaling = None;
        if let (Some(hub), Some(peers)) = (&self.deps.hub, &self.deps.peers) {
            match self.start_signaling(hub.as_ref(), peers, exam).await {
                Ok((session, ended)) => {
                    signaling = Some(session);
                    outcome = Some(ended);
                }
                Err(err) => {
                    forwarder.close();
                    quiesce(inference, source).await;
                    return Err(err);
                }
            }
        }

        Ok((
            Generation {
                id,
                exam_id: exam.exam_id,
                allow_books: exam.allow_books,
                started_at: Utc::now(),
                source,
                inference,
                signaling,
                forwarder,
            },
            outcome,
        ))
    }

    async fn start_signaling(
        &self,
        hub: &dyn HubConnector,
        peers: &Arc<dyn PeerFactory>,
        exam: &ExamContext,
    ) -> Result<(SignalingSession, oneshot::Receiver<SessionOutcome>)> {
        let settings = &self.settings;
        let link = hub.connect(exam.auth.cookie.as_deref()).await?;
        SignalingSession::start(
            link,
            Arc::clone(peers),
            self.broadcaster(),
            &exam.proctors,
            SignalingOptions {
                viewer_queue_capacity: settings.broadcast.viewer_queue_capacity,
                receive_timeout: settings.broadcast.receive_timeout(),
                resolution: (settings.capture.width, settings.capture.height),
                join_timeout: settings.detection.join_timeout(),
            },
        )
        .await
    }

    /// Stops the generation once its hub session ends, unless it has already
    /// been replaced.
    fn watch(&self, id: u64, outcome: oneshot::Receiver<SessionOutcome>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            // A dropped sender means the session was stopped by us.
            let Ok(outcome) = outcome.await else {
                return;
            };
            match &outcome {
                SessionOutcome::ExamEnded => log::info!("generation {id}: exam ended by hub"),
                SessionOutcome::Failed(reason) => {
                    log::error!("generation {id}: signaling failed, stopping exam: {reason}")
                }
            }
            coordinator.end_generation(id).await;
        });
    }

    /// Stops generation `id` if it is still the current one.
    pub async fn end_generation(&self, id: u64) -> bool {
        let mut state = self.state.lock().await;
        match &state.current {
            Some(current) if current.id == id => {}
            _ => return false,
        }
        if let Some(generation) = state.current.take() {
            teardown(generation).await;
        }
        true
    }

    /// Tears the running generation down. Returns whether one was running;
    /// calling it again is harmless.
    pub async fn stop_exam(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.current.take() {
            Some(generation) => {
                teardown(generation).await;
                true
            }
            None => false,
        }
    }

    pub async fn active_generation(&self) -> Option<u64> {
        self.state.lock().await.current.as_ref().map(|g| g.id)
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let state = self.state.lock().await;
        let active = match &state.current {
            Some(generation) => Some(generation.status().await),
            None => None,
        };

        CoordinatorStatus {
            active,
            generations_started: state.next_generation - 1,
            frames_published: self.broadcaster.published(),
            consumers: self.broadcaster.stats(),
        }
    }
}

/// Fixed teardown order: signaling, then inference, then capture.
async fn teardown(generation: Generation) {
    let Generation {
        id,
        source,
        inference,
        signaling,
        forwarder,
        ..
    } = generation;

    if let Some(mut session) = signaling {
        session.stop().await;
    }
    forwarder.close();
    quiesce(inference, source).await;
    log::info!("generation {id} stopped");
}

/// Stops inference and then capture off the async runtime; both joins are
/// bounded.
async fn quiesce(mut inference: InferenceLoop, mut source: FrameSource) {
    let joined = tokio::task::spawn_blocking(move || {
        inference.stop();
        source.stop();
    })
    .await;
    if let Err(err) = joined {
        log::error!("pipeline shutdown task failed: {err}");
    }
}
