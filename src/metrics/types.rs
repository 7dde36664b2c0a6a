use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub timestamp: DateTime<Utc>,
    pub frame_seq: u64,
    pub inference_ms: u64,
    pub detections: usize,
    pub persons: usize,
    pub fired: Vec<String>,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub recent_cycles: Vec<CycleMetrics>,
    pub cycle_count: u64,
    pub frame_timeouts: u64,
    pub model_failures: u64,
    pub violations_fired: u64,
    pub events_delivered: u64,
    pub events_failed: u64,
}
