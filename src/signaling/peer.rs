use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::error::Result;

use super::messages::{IceCandidate, SessionDescription};
use super::track::VideoTrack;

/// Who is on the other end of a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "role", content = "id", rename_all = "camelCase")]
pub enum ViewerId {
    /// The test taker's own browser, showing their camera back to them.
    Taker,
    Proctor(String),
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewerId::Taker => f.write_str("taker"),
            ViewerId::Proctor(id) => write!(f, "proctor:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerState {
    Idle,
    Offering,
    Negotiating,
    Connected,
    Closed,
}

/// One media connection to a viewer. Signaling only drives offer/answer
/// and ICE through this seam; see `signaling::rtc` for the WebRTC backend.
#[async_trait]
pub trait MediaPeer: Send {
    async fn create_offer(&mut self) -> Result<SessionDescription>;

    /// Applies `offer` locally and returns the description to signal, which
    /// may carry candidates gathered meanwhile.
    async fn set_local_description(&mut self, offer: &SessionDescription) -> Result<SessionDescription>;

    async fn set_remote_description(&mut self, answer: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;

    /// Releases the connection. Must tolerate being called on a peer that
    /// never finished negotiating.
    async fn close(&mut self);
}

pub trait PeerFactory: Send + Sync {
    /// Builds a peer that streams `track` to `viewer`.
    fn create(&self, viewer: &ViewerId, track: VideoTrack) -> Result<Box<dyn MediaPeer>>;
}
