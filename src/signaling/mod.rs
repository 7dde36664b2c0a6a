pub mod hub;
pub mod messages;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod track;

pub use hub::{HubConnector, HubEndpoint, HubEvent, HubLink, ReconnectPolicy, WebSocketHub};
pub use messages::{IceCandidate, InboundMessage, OutboundMessage, SdpKind, SessionDescription};
pub use peer::{MediaPeer, PeerFactory, PeerState, ViewerId};
pub use rtc::{RtcPeer, RtcPeerFactory};
pub use session::{SessionOutcome, SignalingOptions, SignalingSession};
pub use track::{VideoSample, VideoTrack, VIDEO_CLOCK_RATE};
