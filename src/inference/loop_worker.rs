use chrono::Utc;
use crossbeam_channel::Sender;
use std::{sync::Arc, time::Duration, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::capture::{Frame, FrameConsumer};
use crate::detection::{annotate_snapshot, Category, DetectionClassifier, DetectionSet};
use crate::metrics::{CycleMetrics, MetricsCollector};

use super::{Violation, ViolationDebouncer, ViolationSink};

// Set to true to log every inference cycle
const ENABLE_LOGS: bool = false;

use crate::log_debug;

pub(crate) struct InferenceContext {
    pub consumer: Arc<FrameConsumer>,
    pub classifier: DetectionClassifier,
    pub debouncer: ViolationDebouncer,
    pub sink: Arc<dyn ViolationSink>,
    pub metrics: MetricsCollector,
    pub receive_timeout: Duration,
    pub attach_snapshots: bool,
    pub log_cycles: bool,
}

pub(crate) fn inference_loop(
    mut ctx: InferenceContext,
    cancel_token: CancellationToken,
    done_tx: Sender<()>,
) {
    while !cancel_token.is_cancelled() {
        let Some(frame) = ctx.consumer.receive(ctx.receive_timeout) else {
            ctx.metrics.record_frame_timeout();
            continue;
        };

        let cycle_start = Instant::now();
        let detections = match ctx.classifier.classify(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                // Counters stay untouched; a failed cycle is not evidence either way.
                log::warn!("skipping frame {}: {err}", frame.seq);
                ctx.metrics.record_model_failure();
                continue;
            }
        };
        let inference_ms = cycle_start.elapsed().as_millis() as u64;

        let fired = ctx.debouncer.observe(&detections);
        log_debug!(
            "frame {}: {} detections, {} persons, fired {:?}",
            frame.seq,
            detections.len(),
            detections.count(Category::Person),
            fired
        );

        if cancel_token.is_cancelled() {
            break;
        }

        for kind in &fired {
            let mut violation = Violation::new(*kind, frame.seq, None);
            if ctx.attach_snapshots {
                violation.snapshot = evidence(&frame, &detections, &violation);
            }
            log::info!("violation {kind} on frame {}", frame.seq);
            ctx.sink.on_violation(violation);
        }

        let cycle = CycleMetrics {
            timestamp: Utc::now(),
            frame_seq: frame.seq,
            inference_ms,
            detections: detections.len(),
            persons: detections.count(Category::Person),
            fired: fired.iter().map(|kind| kind.to_string()).collect(),
            total_ms: cycle_start.elapsed().as_millis() as u64,
        };
        if ctx.log_cycles {
            log::info!(
                "cycle frame={} inference={}ms total={}ms detections={} persons={} fired={:?}",
                cycle.frame_seq,
                cycle.inference_ms,
                cycle.total_ms,
                cycle.detections,
                cycle.persons,
                cycle.fired
            );
        }
        ctx.metrics.record_cycle(cycle);
    }

    ctx.consumer.detach();
    let _ = done_tx.try_send(());
}

fn evidence(frame: &Frame, detections: &DetectionSet, violation: &Violation) -> Option<Vec<u8>> {
    let boxes = detections.of(violation.kind.evidence());
    match annotate_snapshot(&frame.image, boxes, &violation.message, violation.detected_at) {
        Ok(jpeg) => Some(jpeg),
        Err(err) => {
            log::warn!("could not encode snapshot for {}: {err}", violation.kind);
            None
        }
    }
}
