//! Error taxonomy for the proctoring pipeline.
//!
//! Per-frame failures (`ModelInference`) stay local to the inference loop;
//! device and transport failures escalate to the exam session.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Capture device could not be opened. Fatal to exam start, never retried here.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A frame source already owns the device.
    #[error("capture device busy: {0}")]
    DeviceBusy(String),

    /// The opaque detection model failed for one cycle.
    #[error("model inference failed: {0}")]
    ModelInference(String),

    /// Hub connection dropped and the reconnect budget is spent.
    #[error("signaling transport failure: {0}")]
    SignalingTransport(String),

    /// Offer/answer negotiation with a media peer failed.
    #[error("negotiation failed for {viewer}: {message}")]
    Negotiation { viewer: String, message: String },

    /// Proctoring server call failed or returned a non-zero code.
    #[error("remote call {call} failed: {message}")]
    RemoteCall { call: &'static str, message: String },

    #[error("{0} already active")]
    AlreadyActive(&'static str),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn remote(call: &'static str, message: impl Into<String>) -> Self {
        Error::RemoteCall {
            call,
            message: message.into(),
        }
    }
}
