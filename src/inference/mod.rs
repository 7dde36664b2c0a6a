pub mod controller;
pub mod debouncer;
mod loop_worker;
pub mod sink;

pub use controller::{InferenceLoop, InferenceOptions};
pub use debouncer::{CounterState, DebounceRules, DebounceThreshold, ViolationDebouncer, ViolationKind};
pub use sink::{Violation, ViolationSink};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, FrameBroadcaster, OverflowPolicy};
    use crate::detection::{DetectionClassifier, Detector, RawDetection};
    use crate::error::{Error, Result};
    use crate::metrics::MetricsCollector;
    use crate::settings::ConfidenceThresholds;
    use image::RgbImage;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    };
    use std::time::Duration;

    /// Reports an empty room, optionally failing every call.
    struct EmptyRoom {
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl EmptyRoom {
        fn new(failing: bool) -> Arc<Self> {
            Arc::new(Self {
                failing: AtomicBool::new(failing),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Detector for EmptyRoom {
        fn detect(&self, _input: &RgbImage) -> Result<Vec<RawDetection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::ModelInference("offline".into()));
            }
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Violation>>);

    impl ViolationSink for Collect {
        fn on_violation(&self, violation: Violation) {
            self.0.lock().unwrap().push(violation);
        }
    }

    fn options() -> InferenceOptions {
        InferenceOptions {
            receive_timeout: Duration::from_millis(20),
            join_timeout: Duration::from_secs(2),
            attach_snapshots: true,
            log_cycles: false,
        }
    }

    fn start(
        detector: Arc<EmptyRoom>,
        sink: Arc<Collect>,
    ) -> (Arc<FrameBroadcaster>, InferenceLoop, MetricsCollector) {
        let broadcaster = FrameBroadcaster::new();
        let consumer = broadcaster.attach("inference", 1, OverflowPolicy::DropOldest);
        let classifier = DetectionClassifier::new(detector, (300, 300), ConfidenceThresholds::default());
        let metrics = MetricsCollector::new();
        let mut inference = InferenceLoop::new();
        inference
            .start(
                consumer,
                classifier,
                ViolationDebouncer::new(DebounceRules::default(), false),
                sink,
                metrics.clone(),
                options(),
            )
            .unwrap();
        (broadcaster, inference, metrics)
    }

    fn feed(broadcaster: &FrameBroadcaster, detector: &EmptyRoom, frames: usize) {
        for seq in 0..frames {
            let before = detector.calls.load(Ordering::SeqCst);
            broadcaster.publish(Frame::new(seq as u64, RgbImage::new(64, 36)));
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while detector.calls.load(Ordering::SeqCst) == before && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn empty_room_reports_exam_taker_left_with_snapshot() {
        let detector = EmptyRoom::new(false);
        let sink = Arc::new(Collect::default());
        let (broadcaster, mut inference, metrics) = start(Arc::clone(&detector), Arc::clone(&sink));

        feed(&broadcaster, &detector, 12);
        inference.stop();

        let violations = sink.0.lock().unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::NoPerson);
        assert_eq!(violations[0].message, "Exam taker left");
        assert!(violations[0].snapshot.is_some());
        assert!(metrics.snapshot().cycle_count >= 10);
    }

    #[test]
    fn model_failures_do_not_advance_counters() {
        let detector = EmptyRoom::new(true);
        let sink = Arc::new(Collect::default());
        let (broadcaster, mut inference, metrics) = start(Arc::clone(&detector), Arc::clone(&sink));

        feed(&broadcaster, &detector, 15);
        inference.stop();

        assert!(sink.0.lock().unwrap().is_empty());
        assert!(metrics.snapshot().model_failures >= 1);
        assert_eq!(metrics.snapshot().cycle_count, 0);
    }

    #[test]
    fn stop_detaches_consumer_and_is_idempotent() {
        let detector = EmptyRoom::new(false);
        let sink = Arc::new(Collect::default());
        let (broadcaster, mut inference, _) = start(detector, sink);
        assert_eq!(broadcaster.consumer_count(), 1);

        inference.stop();
        assert_eq!(broadcaster.consumer_count(), 0);
        assert!(!inference.is_running());
        inference.stop();
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let mut inference = InferenceLoop::new();
        inference.stop();
        assert!(!inference.is_running());
    }
}
