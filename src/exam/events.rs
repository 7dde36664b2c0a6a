use std::sync::{Arc, Mutex};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::inference::{Violation, ViolationSink};
use crate::metrics::MetricsCollector;
use crate::remote::{AuthSession, ExamEvent, ExamId, ProctorServer};

/// Bridges violations from the inference thread to the proctoring server.
/// Each violation uploads its snapshot (if any) and then posts the event;
/// network failures are logged and never reach the pipeline.
pub struct EventForwarder {
    generation: u64,
    tx: Mutex<Option<mpsc::UnboundedSender<Violation>>>,
}

impl EventForwarder {
    pub fn spawn(
        generation: u64,
        exam_id: ExamId,
        auth: AuthSession,
        server: Arc<dyn ProctorServer>,
        metrics: MetricsCollector,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Violation>();

        let handle = tokio::spawn(async move {
            while let Some(violation) = rx.recv().await {
                let delivered = deliver(server.as_ref(), &auth, exam_id, violation).await;
                metrics.record_event_delivery(delivered);
            }
            log::debug!("event forwarder for generation {generation} drained");
        });

        (
            Arc::new(Self {
                generation,
                tx: Mutex::new(Some(tx)),
            }),
            handle,
        )
    }

    /// Stops accepting violations. Ones already queued are still delivered.
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

impl ViolationSink for EventForwarder {
    fn on_violation(&self, violation: Violation) {
        let tx = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(violation).is_err() {
                    log::warn!("event forwarder for generation {} is gone", self.generation);
                }
            }
            None => log::debug!(
                "generation {} closed; dropping {} violation",
                self.generation,
                violation.kind
            ),
        }
    }
}

/// Returns whether the event reached the server.
pub async fn deliver(
    server: &dyn ProctorServer,
    auth: &AuthSession,
    exam_id: ExamId,
    violation: Violation,
) -> bool {
    let attachment = match violation.snapshot {
        Some(jpeg) => match server.upload_attachment(auth, jpeg).await {
            Ok(file_name) => Some(file_name),
            Err(err) => {
                log::warn!("snapshot upload failed, sending event without it: {err}");
                None
            }
        },
        None => None,
    };

    let event = ExamEvent::detection(exam_id, violation.message, attachment);
    match server.send_event(auth, &event).await {
        Ok(()) => {
            log::info!("reported '{}' for exam {exam_id}", event.message);
            true
        }
        Err(err) => {
            log::warn!("could not report '{}' for exam {exam_id}: {err}", event.message);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::inference::ViolationKind;
    use crate::remote::{ExamDetails, Proctor};
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        fail_upload: bool,
        fail_send: bool,
        events: Mutex<Vec<ExamEvent>>,
    }

    #[async_trait]
    impl ProctorServer for Recorder {
        async fn login(&self, _token: &str) -> Result<AuthSession> {
            Ok(AuthSession::default())
        }

        async fn exam_details(&self, _auth: &AuthSession, _exam_id: ExamId) -> Result<ExamDetails> {
            Ok(ExamDetails { allow_books: false })
        }

        async fn proctors(&self, _auth: &AuthSession, _exam_id: ExamId) -> Result<Vec<Proctor>> {
            Ok(Vec::new())
        }

        async fn upload_attachment(&self, _auth: &AuthSession, _jpeg: Vec<u8>) -> Result<String> {
            if self.fail_upload {
                return Err(Error::remote("upload attachment", "503"));
            }
            Ok("snap.jpg".into())
        }

        async fn send_event(&self, _auth: &AuthSession, event: &ExamEvent) -> Result<()> {
            if self.fail_send {
                return Err(Error::remote("send event", "503"));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn phone(snapshot: Option<Vec<u8>>) -> Violation {
        Violation::new(ViolationKind::Phone, 42, snapshot)
    }

    #[tokio::test]
    async fn snapshot_becomes_the_attachment() {
        let server = Recorder::default();
        let delivered = deliver(&server, &AuthSession::default(), 9, phone(Some(vec![1, 2]))).await;

        assert!(delivered);
        let events = server.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].exam_id, 9);
        assert_eq!(events[0].kind, ExamEvent::DETECTION);
        assert_eq!(events[0].message, ViolationKind::Phone.message());
        assert_eq!(events[0].attachment.as_deref(), Some("snap.jpg"));
    }

    #[tokio::test]
    async fn failed_upload_still_reports_the_event() {
        let server = Recorder {
            fail_upload: true,
            ..Default::default()
        };
        let delivered = deliver(&server, &AuthSession::default(), 9, phone(Some(vec![1]))).await;

        assert!(delivered);
        assert_eq!(server.events.lock().unwrap()[0].attachment, None);
    }

    #[tokio::test]
    async fn failed_send_is_reported_not_raised() {
        let server = Recorder {
            fail_send: true,
            ..Default::default()
        };
        assert!(!deliver(&server, &AuthSession::default(), 9, phone(None)).await);
    }

    #[tokio::test]
    async fn closed_forwarder_drops_late_violations() {
        let server = Arc::new(Recorder::default());
        let metrics = MetricsCollector::new();
        let (forwarder, handle) = EventForwarder::spawn(
            1,
            9,
            AuthSession::default(),
            server.clone(),
            metrics.clone(),
        );

        forwarder.on_violation(phone(None));
        forwarder.close();
        forwarder.on_violation(phone(None));
        forwarder.close();
        handle.await.unwrap();

        assert_eq!(server.events.lock().unwrap().len(), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_delivered, 1);
        assert_eq!(snapshot.events_failed, 0);
    }
}
