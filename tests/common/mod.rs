#![allow(dead_code)]

use async_trait::async_trait;
use image::RgbImage;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use proctorcam_lib::{
    capture::{CaptureDevice, CaptureDeviceFactory},
    detection::{Detector, RawDetection},
    error::{Error, Result},
    exam::PipelineDeps,
    remote::{AuthSession, ExamDetails, ExamEvent, ExamId, Proctor, ProctorServer},
    settings::Settings,
    signaling::{
        HubConnector, HubEndpoint, HubLink, IceCandidate, MediaPeer, PeerFactory,
        SessionDescription, VideoTrack, ViewerId,
    },
};

/// Counts how many devices are open at once across generations.
#[derive(Default)]
pub struct DeviceUsage {
    pub open_now: AtomicUsize,
    pub max_open: AtomicUsize,
    pub opens: AtomicUsize,
}

pub struct FakeDevice {
    id: String,
    fail_open: bool,
    read_delay: Duration,
    open: bool,
    usage: Arc<DeviceUsage>,
}

impl CaptureDevice for FakeDevice {
    fn device_id(&self) -> String {
        self.id.clone()
    }

    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(Error::DeviceUnavailable(format!("{} not found", self.id)));
        }
        self.open = true;
        self.usage.opens.fetch_add(1, Ordering::SeqCst);
        let now = self.usage.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.usage.max_open.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        thread::sleep(self.read_delay);
        Ok(RgbImage::new(160, 90))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.usage.open_now.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct FakeCamera {
    pub id: String,
    pub fail_open: bool,
    pub read_delay: Duration,
    pub usage: Arc<DeviceUsage>,
}

impl FakeCamera {
    pub fn new(id: &str) -> Arc<Self> {
        Self::slow(id, Duration::from_millis(5))
    }

    /// Every read blocks for `read_delay` and cannot be interrupted.
    pub fn slow(id: &str, read_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            fail_open: false,
            read_delay,
            usage: Arc::new(DeviceUsage::default()),
        })
    }

    pub fn broken(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            fail_open: true,
            read_delay: Duration::from_millis(5),
            usage: Arc::new(DeviceUsage::default()),
        })
    }
}

impl CaptureDeviceFactory for FakeCamera {
    fn create(&self) -> Box<dyn CaptureDevice> {
        Box::new(FakeDevice {
            id: self.id.clone(),
            fail_open: self.fail_open,
            read_delay: self.read_delay,
            open: false,
            usage: Arc::clone(&self.usage),
        })
    }
}

/// Sees an empty room in every frame.
pub struct EmptyRoom;

impl Detector for EmptyRoom {
    fn detect(&self, _input: &RgbImage) -> Result<Vec<RawDetection>> {
        Ok(Vec::new())
    }
}

/// Sees exactly one seated person in every frame.
pub struct SeatedTaker;

impl Detector for SeatedTaker {
    fn detect(&self, _input: &RgbImage) -> Result<Vec<RawDetection>> {
        Ok(vec![RawDetection {
            label: 1,
            confidence: 0.9,
            xmin: 50.0,
            ymin: 40.0,
            xmax: 250.0,
            ymax: 299.0,
        }])
    }
}

#[derive(Default)]
pub struct FakeServer {
    pub reject_login: bool,
    pub allow_books: bool,
    pub proctors: Vec<String>,
    pub fail_details: bool,
    pub uploads: AtomicUsize,
    pub events: Mutex<Vec<ExamEvent>>,
}

#[async_trait]
impl ProctorServer for FakeServer {
    async fn login(&self, token: &str) -> Result<AuthSession> {
        if self.reject_login {
            return Err(Error::remote("login", "server returned code 1"));
        }
        Ok(AuthSession {
            cookie: Some(format!("sid={token}")),
        })
    }

    async fn exam_details(&self, _auth: &AuthSession, _exam_id: ExamId) -> Result<ExamDetails> {
        if self.fail_details {
            return Err(Error::remote("exam details", "timeout"));
        }
        Ok(ExamDetails {
            allow_books: self.allow_books,
        })
    }

    async fn proctors(&self, _auth: &AuthSession, _exam_id: ExamId) -> Result<Vec<Proctor>> {
        Ok(self
            .proctors
            .iter()
            .map(|id| Proctor { id: id.clone() })
            .collect())
    }

    async fn upload_attachment(&self, _auth: &AuthSession, jpeg: Vec<u8>) -> Result<String> {
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("evt-{n}.jpg"))
    }

    async fn send_event(&self, _auth: &AuthSession, event: &ExamEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Hub whose far ends are kept for the test to drive.
#[derive(Default)]
pub struct MemoryHub {
    pub unreachable: bool,
    pub endpoints: tokio::sync::Mutex<Vec<HubEndpoint>>,
    pub cookies: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl HubConnector for MemoryHub {
    async fn connect(&self, auth_cookie: Option<&str>) -> Result<HubLink> {
        self.cookies.lock().unwrap().push(auth_cookie.map(str::to_owned));
        if self.unreachable {
            return Err(Error::SignalingTransport("connection refused".into()));
        }
        let (link, endpoint) = HubLink::pair();
        self.endpoints.lock().await.push(endpoint);
        Ok(link)
    }
}

pub struct NullPeer {
    closed: Arc<AtomicBool>,
    _track: VideoTrack,
}

#[async_trait]
impl MediaPeer for NullPeer {
    async fn create_offer(&mut self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0"))
    }

    async fn set_local_description(&mut self, offer: &SessionDescription) -> Result<SessionDescription> {
        Ok(offer.clone())
    }

    async fn set_remote_description(&mut self, _answer: &SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&mut self, _candidate: &IceCandidate) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct NullPeers {
    pub created: Mutex<Vec<ViewerId>>,
    pub closed: Mutex<Vec<Arc<AtomicBool>>>,
}

impl NullPeers {
    pub fn all_closed(&self) -> bool {
        self.closed
            .lock()
            .unwrap()
            .iter()
            .all(|flag| flag.load(Ordering::SeqCst))
    }
}

impl PeerFactory for NullPeers {
    fn create(&self, viewer: &ViewerId, track: VideoTrack) -> Result<Box<dyn MediaPeer>> {
        let closed = Arc::new(AtomicBool::new(false));
        self.created.lock().unwrap().push(viewer.clone());
        self.closed.lock().unwrap().push(Arc::clone(&closed));
        Ok(Box::new(NullPeer {
            closed,
            _track: track,
        }))
    }
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.capture.width = 160;
    settings.capture.height = 90;
    settings.capture.release_timeout_ms = 500;
    settings.broadcast.receive_timeout_ms = 50;
    settings.detection.join_timeout_ms = 2_000;
    settings
}

pub fn deps(
    camera: Arc<FakeCamera>,
    detector: Arc<dyn Detector>,
    server: Arc<FakeServer>,
) -> PipelineDeps {
    PipelineDeps {
        devices: camera,
        detector,
        server,
        hub: None,
        peers: None,
    }
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
