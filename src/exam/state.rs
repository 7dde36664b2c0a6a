use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::capture::{ConsumerStats, FrameSource};
use crate::inference::InferenceLoop;
use crate::remote::{AuthSession, ExamId};
use crate::signaling::{PeerState, SignalingSession, ViewerId};

use super::events::EventForwarder;

/// Everything a generation needs to know about its exam.
#[derive(Debug, Clone)]
pub struct ExamContext {
    pub exam_id: ExamId,
    pub auth: AuthSession,
    pub allow_books: bool,
    pub proctors: Vec<String>,
}

/// The live resources of one exam generation.
pub(crate) struct Generation {
    pub id: u64,
    pub exam_id: ExamId,
    pub allow_books: bool,
    pub started_at: DateTime<Utc>,
    pub source: FrameSource,
    pub inference: InferenceLoop,
    pub signaling: Option<SignalingSession>,
    pub forwarder: Arc<EventForwarder>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub viewer: ViewerId,
    pub state: PeerState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub generation: u64,
    pub exam_id: ExamId,
    pub allow_books: bool,
    pub started_at: DateTime<Utc>,
    pub capture_running: bool,
    pub inference_running: bool,
    pub signaling: bool,
    pub peers: Vec<PeerStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub active: Option<GenerationStatus>,
    pub generations_started: u64,
    pub frames_published: u64,
    pub consumers: Vec<ConsumerStats>,
}

impl Generation {
    pub async fn status(&self) -> GenerationStatus {
        let peers = match &self.signaling {
            Some(session) => session
                .peer_states()
                .await
                .into_iter()
                .map(|(viewer, state)| PeerStatus { viewer, state })
                .collect(),
            None => Vec::new(),
        };

        GenerationStatus {
            generation: self.id,
            exam_id: self.exam_id,
            allow_books: self.allow_books,
            started_at: self.started_at,
            capture_running: self.source.is_running(),
            inference_running: self.inference.is_running(),
            signaling: self.signaling.is_some(),
            peers,
        }
    }
}
