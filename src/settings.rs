use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};

use crate::inference::DebounceRules;

pub const CONFIG_PATH_ENV: &str = "PROCTORCAM_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "proctorcam.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub base_url: String,
    /// The proctoring server runs with a self-signed certificate.
    pub accept_invalid_certs: bool,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: "https://10.28.140.146:5001".into(),
            accept_invalid_certs: true,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Signaling is disabled when no hub is configured.
    pub url: Option<String>,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            url: None,
            reconnect_interval_ms: 1_000,
            max_reconnect_interval_ms: 8_000,
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub source: String,
    pub input_format: Option<String>,
    pub ffmpeg_path: String,
    pub width: u32,
    pub height: u32,
    pub open_timeout_ms: u64,
    pub release_timeout_ms: u64,
    pub apply_settings_command: Option<Vec<String>>,
    pub revert_settings_command: Option<Vec<String>>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            source: "/opt/awscam/out/ch1_out.h264".into(),
            input_format: None,
            ffmpeg_path: "ffmpeg".into(),
            width: 858,
            height: 480,
            open_timeout_ms: 5_000,
            release_timeout_ms: 100,
            apply_settings_command: None,
            revert_settings_command: None,
        }
    }
}

impl CaptureSettings {
    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    pub inference_queue_capacity: usize,
    pub viewer_queue_capacity: usize,
    pub receive_timeout_ms: u64,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            inference_queue_capacity: 1,
            viewer_queue_capacity: 2,
            receive_timeout_ms: 1_000,
        }
    }
}

impl BroadcastSettings {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceThresholds {
    pub person: f32,
    pub monitor: f32,
    pub phone: f32,
    pub book: f32,
}

impl Default for ConfidenceThresholds {
    // Model accuracy differs by class; phones are rarely scored high.
    fn default() -> Self {
        Self {
            person: 0.5,
            monitor: 0.5,
            phone: 0.1,
            book: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub model_url: String,
    pub input_width: u32,
    pub input_height: u32,
    pub thresholds: ConfidenceThresholds,
    pub attach_snapshots: bool,
    pub join_timeout_ms: u64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            model_url: "http://127.0.0.1:9000/detect".into(),
            input_width: 300,
            input_height: 300,
            thresholds: ConfidenceThresholds::default(),
            attach_snapshots: true,
            join_timeout_ms: 1_500,
        }
    }
}

impl DetectionSettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcSettings {
    /// STUN/TURN urls handed to every peer connection.
    pub ice_servers: Vec<String>,
    /// `ffmpeg` used to encode the outbound H.264 stream.
    pub encoder_path: String,
    /// Upper bound on waiting for ICE candidates before an offer is sent.
    pub gather_timeout_ms: u64,
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".into()],
            encoder_path: "ffmpeg".into(),
            gather_timeout_ms: 2_000,
        }
    }
}

impl RtcSettings {
    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub bind: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub rtc: RtcSettings,
    pub capture: CaptureSettings,
    pub broadcast: BroadcastSettings,
    pub detection: DetectionSettings,
    pub debounce: DebounceRules,
    pub api: ApiSettings,
    /// Log a metrics line every inference cycle.
    pub debug: bool,
}

impl Settings {
    /// Loads the file named by `PROCTORCAM_CONFIG` (or `proctorcam.json`),
    /// then applies environment overrides.
    pub fn load() -> Result<Self> {
        let path = env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut settings = Self::from_path(path)?;
        settings.apply_env();
        Ok(settings)
    }

    pub fn from_path(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;

        Ok(serde_json::from_str(&contents).unwrap_or_else(|err| {
            warn!(
                "Ignoring unparsable settings in {}: {err}; using defaults",
                path.display()
            );
            Self::default()
        }))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("PROCTORCAM_SERVER_URL") {
            self.server.base_url = url;
        }
        if let Ok(url) = env::var("PROCTORCAM_HUB_URL") {
            self.hub.url = Some(url);
        }
        if let Ok(url) = env::var("PROCTORCAM_MODEL_URL") {
            self.detection.model_url = url;
        }
        if let Ok(bind) = env::var("PROCTORCAM_BIND") {
            self.api.bind = bind;
        }
        if let Ok(value) = env::var("PROCTORCAM_DEBUG") {
            self.debug = value == "1" || value.eq_ignore_ascii_case("true");
        }
    }
}
