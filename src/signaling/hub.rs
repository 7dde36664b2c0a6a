use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{sleep, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::COOKIE, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::error::{Error, Result};
use crate::settings::HubSettings;

use super::messages::{self, HubFrame, InboundMessage, OutboundMessage};

const LINK_CAPACITY: usize = 32;
const PING_INTERVAL: Duration = Duration::from_secs(15);

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the hub transport reports to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Message(InboundMessage),
    /// The transport dropped and came back; offers in flight may be lost.
    Reconnected,
    /// Reconnect budget spent. Nothing else arrives after this.
    Failed(String),
}

/// Session side of a hub connection. Dropping it closes the transport.
pub struct HubLink {
    pub outbound: mpsc::Sender<OutboundMessage>,
    pub inbound: mpsc::Receiver<HubEvent>,
}

/// Transport side of a hub connection.
pub struct HubEndpoint {
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub inbound: mpsc::Sender<HubEvent>,
}

impl HubLink {
    /// A connected link/endpoint pair with nothing on the wire. The websocket
    /// transport drives the endpoint; tests drive it by hand.
    pub fn pair() -> (HubLink, HubEndpoint) {
        let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);
        (
            HubLink {
                outbound: out_tx,
                inbound: in_rx,
            },
            HubEndpoint {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }
}

#[async_trait]
pub trait HubConnector: Send + Sync {
    /// Opens the hub for one signaling session, authenticated by the
    /// server's cookie when present.
    async fn connect(&self, auth_cookie: Option<&str>) -> Result<HubLink>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &HubSettings) -> Self {
        Self {
            initial: Duration::from_millis(settings.reconnect_interval_ms),
            max: Duration::from_millis(settings.max_reconnect_interval_ms),
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect `attempt` (1-based): doubling from `initial`,
    /// capped at `max`, plus up to 10% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial.saturating_mul(1u32 << exp).min(self.max);
        let jitter_cap = base.as_millis() as u64 / 10;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

/// SignalR hub over a websocket.
pub struct WebSocketHub {
    url: String,
    policy: ReconnectPolicy,
}

impl WebSocketHub {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            url: url.into(),
            policy,
        }
    }
}

#[async_trait]
impl HubConnector for WebSocketHub {
    async fn connect(&self, auth_cookie: Option<&str>) -> Result<HubLink> {
        let socket = open(&self.url, auth_cookie).await?;
        log::info!("hub connected: {}", self.url);

        let (link, endpoint) = HubLink::pair();
        tokio::spawn(drive(
            self.url.clone(),
            auth_cookie.map(str::to_owned),
            self.policy,
            socket,
            endpoint,
        ));
        Ok(link)
    }
}

fn transport(err: impl std::fmt::Display) -> Error {
    Error::SignalingTransport(err.to_string())
}

async fn open(url: &str, auth_cookie: Option<&str>) -> Result<HubSocket> {
    let mut request = url.into_client_request().map_err(transport)?;
    if let Some(cookie) = auth_cookie {
        let value = HeaderValue::from_str(cookie).map_err(transport)?;
        request.headers_mut().insert(COOKIE, value);
    }

    let (mut socket, _) = connect_async(request).await.map_err(transport)?;
    socket
        .send(Message::Text(messages::handshake_request()))
        .await
        .map_err(transport)?;

    loop {
        match socket.next().await {
            Some(Ok(Message::Text(payload))) => {
                let reply = messages::split_records(&payload)
                    .next()
                    .ok_or_else(|| transport("empty hub handshake reply"))?;
                messages::check_handshake(reply)?;
                return Ok(socket);
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(transport("hub closed during handshake"));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(transport(err)),
        }
    }
}

enum Ended {
    /// The session dropped its link.
    LinkClosed,
    Dropped(String),
}

async fn drive(
    url: String,
    auth_cookie: Option<String>,
    policy: ReconnectPolicy,
    mut socket: HubSocket,
    mut endpoint: HubEndpoint,
) {
    loop {
        let reason = match pump(&mut socket, &mut endpoint).await {
            Ended::LinkClosed => {
                let _ = socket.close(None).await;
                log::info!("hub connection closed");
                return;
            }
            Ended::Dropped(reason) => reason,
        };
        log::warn!("hub connection dropped: {reason}");

        match reconnect(&url, auth_cookie.as_deref(), policy, &endpoint).await {
            Some(fresh) => {
                socket = fresh;
                // Offers queued while offline are stale; the session re-offers.
                while endpoint.outbound.try_recv().is_ok() {}
                if endpoint.inbound.send(HubEvent::Reconnected).await.is_err() {
                    let _ = socket.close(None).await;
                    return;
                }
            }
            None => {
                log::error!(
                    "hub unreachable after {} attempts, giving up",
                    policy.max_attempts
                );
                let _ = endpoint.inbound.send(HubEvent::Failed(reason)).await;
                return;
            }
        }
    }
}

async fn reconnect(
    url: &str,
    auth_cookie: Option<&str>,
    policy: ReconnectPolicy,
    endpoint: &HubEndpoint,
) -> Option<HubSocket> {
    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            _ = sleep(policy.delay(attempt)) => {}
            _ = endpoint.inbound.closed() => return None,
        }
        match open(url, auth_cookie).await {
            Ok(socket) => {
                log::info!("hub reconnected on attempt {attempt}");
                return Some(socket);
            }
            Err(err) => log::warn!("hub reconnect attempt {attempt} failed: {err}"),
        }
    }
    None
}

async fn pump(socket: &mut HubSocket, endpoint: &mut HubEndpoint) -> Ended {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            outbound = endpoint.outbound.recv() => {
                let Some(message) = outbound else {
                    return Ended::LinkClosed;
                };
                let record = match messages::encode(&message) {
                    Ok(record) => record,
                    Err(err) => {
                        log::warn!("dropping unencodable {} message: {err}", message.target());
                        continue;
                    }
                };
                if let Err(err) = socket.send(Message::Text(record)).await {
                    return Ended::Dropped(err.to_string());
                }
            }
            incoming = socket.next() => {
                let payload = match incoming {
                    Some(Ok(Message::Text(payload))) => payload,
                    Some(Ok(Message::Close(frame))) => {
                        return Ended::Dropped(format!("hub closed: {frame:?}"));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Ended::Dropped(err.to_string()),
                    None => return Ended::Dropped("hub stream ended".into()),
                };
                for record in messages::split_records(&payload) {
                    match messages::decode(record) {
                        Ok(HubFrame::Invocation(message)) => {
                            if endpoint.inbound.send(HubEvent::Message(message)).await.is_err() {
                                return Ended::LinkClosed;
                            }
                        }
                        Ok(HubFrame::Close(error)) => {
                            return Ended::Dropped(error.unwrap_or_else(|| "hub sent close".into()));
                        }
                        Ok(HubFrame::Ping) | Ok(HubFrame::Ignored) => {}
                        Err(err) => log::warn!("unreadable hub record: {err}"),
                    }
                }
            }
            _ = ping.tick() => {
                if let Err(err) = socket.send(Message::Text(messages::ping_record())).await {
                    return Ended::Dropped(err.to_string());
                }
            }
            _ = endpoint.inbound.closed() => return Ended::LinkClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };
    use tokio::{net::TcpListener, time::timeout};
    use tokio_tungstenite::accept_async;

    use crate::signaling::SessionDescription;

    /// Accepts one websocket client and completes the SignalR handshake.
    async fn serve_handshake(stream: TcpStream) -> WebSocketStream<TcpStream> {
        let mut ws = accept_async(stream).await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Text(text))) => assert!(text.contains(r#""protocol":"json""#)),
            other => panic!("expected handshake, got {other:?}"),
        }
        ws.send(Message::Text(format!("{{}}{}", messages::RECORD_SEPARATOR)))
            .await
            .unwrap();
        ws
    }

    fn quick_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(80),
            max_attempts,
        }
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_millis(1_000),
            max: Duration::from_millis(8_000),
            max_attempts: 5,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy();
        for (attempt, base_ms) in [(1, 1_000), (2, 2_000), (3, 4_000), (4, 8_000), (5, 8_000), (40, 8_000)] {
            let delay = policy.delay(attempt).as_millis() as u64;
            assert!(
                (base_ms..=base_ms + base_ms / 10).contains(&delay),
                "attempt {attempt}: {delay}ms"
            );
        }
    }

    #[test]
    fn policy_reads_hub_settings() {
        let policy = ReconnectPolicy::from_settings(&HubSettings::default());
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial, Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn unreachable_hub_fails_to_connect() {
        let hub = WebSocketHub::new("ws://127.0.0.1:9/hub", policy());
        let result = hub.connect(Some("session=abc")).await;
        assert!(matches!(result, Err(Error::SignalingTransport(_))));
    }

    #[tokio::test]
    async fn dropped_hub_comes_back_as_reconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/hub", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(serve_handshake(stream).await);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = serve_handshake(stream).await;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) if text.contains("CameraOfferToTaker") => {
                        return text;
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("hub lost before the offer: {other:?}"),
                }
            }
        });

        let hub = WebSocketHub::new(url, quick_policy(3));
        let mut link = hub.connect(None).await.unwrap();
        let event = timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(HubEvent::Reconnected));

        // The fresh socket carries the session's traffic.
        link.outbound
            .send(OutboundMessage::OfferToTaker(SessionDescription::offer("v=0")))
            .await
            .unwrap();
        let record = timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(record.contains("v=0"));
    }

    #[tokio::test]
    async fn hub_that_stays_down_fails_after_the_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/hub", listener.local_addr().unwrap());
        let refused = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&refused);
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(serve_handshake(stream).await);
            // Every later connection is cut before the websocket upgrade.
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let hub = WebSocketHub::new(url, quick_policy(3));
        let mut link = hub.connect(Some("sid=abc")).await.unwrap();
        let event = timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(HubEvent::Failed(_))), "got {event:?}");
        assert_eq!(refused.load(Ordering::SeqCst), 3);

        // Nothing follows the failure.
        let after = timeout(Duration::from_secs(1), link.inbound.recv())
            .await
            .unwrap();
        assert_eq!(after, None);
        server.abort();
    }

    #[tokio::test]
    async fn link_pair_carries_both_directions() {
        let (mut link, mut endpoint) = HubLink::pair();
        link.outbound
            .send(OutboundMessage::OfferToTaker(messages::SessionDescription::offer("v=0")))
            .await
            .unwrap();
        assert!(matches!(
            endpoint.outbound.recv().await,
            Some(OutboundMessage::OfferToTaker(_))
        ));
        endpoint
            .inbound
            .send(HubEvent::Message(InboundMessage::ExamEnded))
            .await
            .unwrap();
        assert_eq!(
            link.inbound.recv().await,
            Some(HubEvent::Message(InboundMessage::ExamEnded))
        );
    }
}
