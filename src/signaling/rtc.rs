use async_trait::async_trait;
use image::{imageops, imageops::FilterType};
use std::{
    fmt,
    io::{ErrorKind, Write},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_H264},
        APIBuilder, API,
    },
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    interceptor::registry::Registry,
    media::{io::h264_reader::H264Reader, Sample},
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

use crate::error::{Error, Result};
use crate::settings::RtcSettings;

use super::messages::{IceCandidate, SessionDescription};
use super::peer::{MediaPeer, PeerFactory, ViewerId};
use super::track::VideoTrack;

// Set to true to log every outbound NAL unit
const ENABLE_LOGS: bool = false;

use crate::log_debug;

const NAL_BUFFER: usize = 1 << 20;
const FIRST_FRAME_DURATION: Duration = Duration::from_millis(33);

/// Builds WebRTC peers that stream the camera as H.264.
pub struct RtcPeerFactory {
    api: Arc<API>,
    ice_servers: Vec<String>,
    encoder: EncoderSettings,
    gather_timeout: Duration,
    runtime: Handle,
}

#[derive(Debug, Clone)]
struct EncoderSettings {
    path: String,
    resolution: (u32, u32),
}

fn setup(err: webrtc::Error) -> Error {
    Error::Config(format!("webrtc setup failed: {err}"))
}

impl RtcPeerFactory {
    pub fn new(settings: &RtcSettings, resolution: (u32, u32), runtime: Handle) -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(setup)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(setup)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            ice_servers: settings.ice_servers.clone(),
            encoder: EncoderSettings {
                path: settings.encoder_path.clone(),
                resolution,
            },
            gather_timeout: settings.gather_timeout(),
            runtime,
        })
    }
}

impl PeerFactory for RtcPeerFactory {
    fn create(&self, viewer: &ViewerId, track: VideoTrack) -> Result<Box<dyn MediaPeer>> {
        Ok(Box::new(RtcPeer {
            viewer: viewer.to_string(),
            api: Arc::clone(&self.api),
            ice_servers: self.ice_servers.clone(),
            encoder: self.encoder.clone(),
            gather_timeout: self.gather_timeout,
            runtime: self.runtime.clone(),
            video: Some(track),
            connection: None,
            pump: None,
        }))
    }
}

struct Connection {
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
}

/// One `RTCPeerConnection` with a single outbound H.264 track. The encoder
/// starts once the viewer's answer is applied.
pub struct RtcPeer {
    viewer: String,
    api: Arc<API>,
    ice_servers: Vec<String>,
    encoder: EncoderSettings,
    gather_timeout: Duration,
    runtime: Handle,
    video: Option<VideoTrack>,
    connection: Option<Connection>,
    pump: Option<MediaPump>,
}

impl RtcPeer {
    fn fail(&self, err: impl fmt::Display) -> Error {
        Error::Negotiation {
            viewer: self.viewer.clone(),
            message: err.to_string(),
        }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn open(&self) -> Result<Connection> {
        let pc = self
            .api
            .new_peer_connection(self.configuration())
            .await
            .map_err(|err| self.fail(err))?;
        let pc = Arc::new(pc);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "proctorcam".to_owned(),
        ));
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| self.fail(err))?;

        // RTCP must be drained for the interceptors to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let viewer = self.viewer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            log::info!("media connection to {viewer}: {state}");
            Box::pin(async {})
        }));

        Ok(Connection { pc, track })
    }

    async fn connection(&mut self) -> Result<Arc<RTCPeerConnection>> {
        if self.connection.is_none() {
            let connection = self.open().await?;
            self.connection = Some(connection);
        }
        self.connection
            .as_ref()
            .map(|connection| Arc::clone(&connection.pc))
            .ok_or_else(|| self.fail("peer connection missing"))
    }

    fn start_media(&mut self) -> Result<()> {
        if self.pump.is_some() {
            return Ok(());
        }
        let (Some(video), Some(connection)) = (self.video.take(), self.connection.as_ref()) else {
            return Ok(());
        };
        let pump = MediaPump::start(
            &self.viewer,
            video,
            Arc::clone(&connection.track),
            &self.encoder,
            self.runtime.clone(),
        )
        .map_err(|err| self.fail(format!("encoder failed to start: {err}")))?;
        self.pump = Some(pump);
        log::info!("streaming to {}", self.viewer);
        Ok(())
    }
}

#[async_trait]
impl MediaPeer for RtcPeer {
    async fn create_offer(&mut self) -> Result<SessionDescription> {
        let pc = self.connection().await?;
        let offer = pc.create_offer(None).await.map_err(|err| self.fail(err))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(&mut self, offer: &SessionDescription) -> Result<SessionDescription> {
        let pc = self.connection().await?;
        let description = RTCSessionDescription::offer(offer.sdp.clone()).map_err(|err| self.fail(err))?;

        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(description)
            .await
            .map_err(|err| self.fail(err))?;
        if tokio::time::timeout(self.gather_timeout, gathered.recv()).await.is_err() {
            log::warn!(
                "ICE gathering for {} still running after {:?}; offering partial candidates",
                self.viewer,
                self.gather_timeout
            );
        }

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| self.fail("local description missing after apply"))?;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn set_remote_description(&mut self, answer: &SessionDescription) -> Result<()> {
        let pc = self.connection().await?;
        let description = RTCSessionDescription::answer(answer.sdp.clone()).map_err(|err| self.fail(err))?;
        pc.set_remote_description(description)
            .await
            .map_err(|err| self.fail(err))?;
        self.start_media()
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        let pc = self.connection().await?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        })
        .await
        .map_err(|err| self.fail(err))
    }

    async fn close(&mut self) {
        if let Some(mut pump) = self.pump.take() {
            pump.stop();
        }
        if let Some(video) = self.video.take() {
            video.stop();
        }
        if let Some(connection) = self.connection.take() {
            if let Err(err) = connection.pc.close().await {
                log::warn!("closing media connection to {} failed: {err}", self.viewer);
            }
        }
    }
}

fn encoder_args((width, height): (u32, u32)) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect();
    args.extend(["-f", "rawvideo", "-pix_fmt", "rgb24", "-s"].map(String::from));
    args.push(format!("{width}x{height}"));
    args.extend(
        [
            "-i",
            "pipe:0",
            "-an",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-profile:v",
            "baseline",
            "-pix_fmt",
            "yuv420p",
            "-g",
            "30",
            "-bsf:v",
            "h264_mp4toannexb",
            "-f",
            "h264",
            "pipe:1",
        ]
        .map(String::from),
    );
    args
}

/// An `ffmpeg` child turning the viewer's frames into Annex B H.264, with
/// one thread feeding raw frames in and one writing NAL units to the track.
struct MediaPump {
    cancel: CancellationToken,
    encoder: Option<Child>,
}

impl MediaPump {
    fn start(
        viewer: &str,
        video: VideoTrack,
        track: Arc<TrackLocalStaticSample>,
        settings: &EncoderSettings,
        runtime: Handle,
    ) -> Result<Self> {
        let mut encoder = Command::new(&settings.path)
            .args(encoder_args(settings.resolution))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (encoder.stdin.take(), encoder.stdout.take()) else {
            let _ = encoder.kill();
            return Err(Error::Config("encoder pipes unavailable".into()));
        };

        let cancel = CancellationToken::new();
        let resolution = settings.resolution;

        let token = cancel.clone();
        thread::Builder::new()
            .name(format!("rtc-feed-{viewer}"))
            .spawn(move || feed(video, stdin, resolution, token))?;

        let token = cancel.clone();
        thread::Builder::new()
            .name(format!("rtc-send-{viewer}"))
            .spawn(move || send(stdout, track, runtime, token))?;

        Ok(Self {
            cancel,
            encoder: Some(encoder),
        })
    }

    /// Both threads exit on their own once the encoder is gone.
    fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(mut encoder) = self.encoder.take() {
            let _ = encoder.kill();
            let _ = encoder.wait();
        }
    }
}

impl Drop for MediaPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn feed(mut video: VideoTrack, mut stdin: ChildStdin, (width, height): (u32, u32), cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        let sample = video.next_sample();
        let image = sample.frame.image.as_ref();
        let written = if image.dimensions() == (width, height) {
            stdin.write_all(image.as_raw())
        } else {
            stdin.write_all(imageops::resize(image, width, height, FilterType::Triangle).as_raw())
        };
        if let Err(err) = written {
            if err.kind() != ErrorKind::BrokenPipe {
                log::warn!("encoder input failed: {err}");
            }
            break;
        }
    }
    video.stop();
}

fn send(
    stdout: ChildStdout,
    track: Arc<TrackLocalStaticSample>,
    runtime: Handle,
    cancel: CancellationToken,
) {
    let mut reader = H264Reader::new(stdout, NAL_BUFFER);
    let mut last_picture: Option<Instant> = None;

    while !cancel.is_cancelled() {
        let nal = match reader.next_nal() {
            Ok(nal) => nal,
            Err(err) => {
                log_debug!("encoder output ended: {}", err);
                break;
            }
        };

        // Parameter sets share the timestamp of the picture that follows.
        let picture = matches!(nal.data.first().map(|header| header & 0x1f), Some(1) | Some(5));
        let duration = if picture {
            let now = Instant::now();
            let elapsed = last_picture
                .map(|previous| now.duration_since(previous))
                .unwrap_or(FIRST_FRAME_DURATION);
            last_picture = Some(now);
            elapsed
        } else {
            Duration::ZERO
        };
        log_debug!("nal {} bytes, duration {:?}", nal.data.len(), duration);

        let sample = Sample {
            data: nal.data.freeze(),
            duration,
            ..Default::default()
        };
        if let Err(err) = runtime.block_on(track.write_sample(&sample)) {
            log::warn!("dropping outbound video: {err}");
            break;
        }
    }
}
