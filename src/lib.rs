pub mod api;
pub mod capture;
pub mod detection;
pub mod error;
pub mod exam;
pub mod inference;
pub mod metrics;
pub mod remote;
pub mod settings;
pub mod signaling;
mod utils;

use anyhow::Context;
use std::sync::Arc;

use api::{create_router, ApiState};
use capture::FfmpegDeviceFactory;
use detection::HttpDetector;
use exam::{PipelineDeps, SessionCoordinator};
use remote::ServerClient;
use settings::Settings;
use signaling::{HubConnector, PeerFactory, ReconnectPolicy, RtcPeerFactory, WebSocketHub};

pub use error::{Error, Result};

/// Wires the production collaborators from settings. Signaling runs only
/// when a hub is configured; peers then stream over WebRTC.
pub fn production_deps(settings: &Settings) -> anyhow::Result<PipelineDeps> {
    let detector = HttpDetector::new(
        settings.detection.model_url.clone(),
        tokio::runtime::Handle::current(),
    )
    .context("failed to build model client")?;
    let server = ServerClient::new(&settings.server).context("failed to build server client")?;

    let hub = settings.hub.url.as_ref().map(|url| {
        Arc::new(WebSocketHub::new(
            url.clone(),
            ReconnectPolicy::from_settings(&settings.hub),
        )) as Arc<dyn HubConnector>
    });
    let peers = match hub {
        Some(_) => {
            let resolution = (settings.capture.width, settings.capture.height);
            let factory = RtcPeerFactory::new(&settings.rtc, resolution, tokio::runtime::Handle::current())
                .context("failed to build WebRTC stack")?;
            Some(Arc::new(factory) as Arc<dyn PeerFactory>)
        }
        None => {
            log::info!("no signaling hub configured; camera sharing disabled");
            None
        }
    };

    Ok(PipelineDeps {
        devices: Arc::new(FfmpegDeviceFactory::new(settings.capture.clone())),
        detector: Arc::new(detector),
        server: Arc::new(server),
        hub,
        peers,
    })
}

pub async fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("proctorcam starting up...");

    let settings = Settings::load()?;
    let bind = settings.api.bind.clone();
    let deps = production_deps(&settings)?;
    let coordinator = SessionCoordinator::new(settings, deps);

    let app = create_router(ApiState::new(coordinator.clone()));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    log::info!("management API listening on {bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("failed to listen for shutdown signal: {err}");
            }
        })
        .await
        .context("management API failed")?;

    log::info!("shutting down");
    coordinator.stop_exam().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn configured_hub_gets_webrtc_peers() {
        let mut settings = Settings::default();
        settings.hub.url = Some("ws://127.0.0.1:9/hub".into());
        let deps = production_deps(&settings).unwrap();
        assert!(deps.hub.is_some());
        assert!(deps.peers.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_hub_means_no_signaling() {
        let deps = production_deps(&Settings::default()).unwrap();
        assert!(deps.hub.is_none());
        assert!(deps.peers.is_none());
    }
}
