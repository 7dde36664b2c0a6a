use chrono::{DateTime, Utc};

use super::ViolationKind;

/// A debounced violation ready to be reported upstream.
#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    pub message: String,
    pub detected_at: DateTime<Utc>,
    pub frame_seq: u64,
    /// Annotated JPEG of the frame that tipped the rule over.
    pub snapshot: Option<Vec<u8>>,
}

impl Violation {
    pub fn new(kind: ViolationKind, frame_seq: u64, snapshot: Option<Vec<u8>>) -> Self {
        Self {
            kind,
            message: kind.message().to_string(),
            detected_at: Utc::now(),
            frame_seq,
            snapshot,
        }
    }
}

/// Receives violations from the inference thread. Must not block for long:
/// forward the work elsewhere.
pub trait ViolationSink: Send + Sync {
    fn on_violation(&self, violation: Violation);
}
