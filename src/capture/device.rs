use image::RgbImage;
use std::{
    collections::HashSet,
    io::{ErrorKind, Read},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
    sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock},
    thread,
    time::{Duration, Instant},
};

use crate::error::{Error, Result};
use crate::settings::CaptureSettings;

/// A physical camera (or camera pipe) that yields decoded RGB frames.
pub trait CaptureDevice: Send {
    /// Stable identity of the underlying device; at most one frame source may hold it.
    fn device_id(&self) -> String;

    /// Puts the camera into the working configuration expected by the pipeline.
    fn apply_settings(&mut self) -> Result<()> {
        Ok(())
    }

    /// Opens the device, waiting for it to become readable. Fails with
    /// [`Error::DeviceUnavailable`].
    fn open(&mut self) -> Result<()>;

    /// Blocks until the next frame is decoded.
    fn read_frame(&mut self) -> Result<RgbImage>;

    /// Releases the device. Must be idempotent.
    fn close(&mut self);

    /// Restores the settings changed by [`CaptureDevice::apply_settings`].
    fn revert_settings(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle that makes a blocked [`CaptureDevice::read_frame`] return from
    /// another thread. Only valid after a successful open.
    fn read_interrupt(&self) -> Option<ReadInterrupt> {
        None
    }
}

/// Unblocks a pending frame read; the read then fails with
/// [`Error::DeviceUnavailable`].
pub type ReadInterrupt = Arc<dyn Fn() + Send + Sync>;

/// Produces a fresh device for every exam generation.
pub trait CaptureDeviceFactory: Send + Sync {
    fn create(&self) -> Box<dyn CaptureDevice>;
}

struct LeaseTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

fn leases() -> &'static LeaseTable {
    static LEASES: OnceLock<LeaseTable> = OnceLock::new();
    LEASES.get_or_init(|| LeaseTable {
        held: Mutex::new(HashSet::new()),
        released: Condvar::new(),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Exclusive claim on a capture device, released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    device_id: String,
}

impl DeviceLease {
    pub fn acquire(device_id: &str) -> Result<Self> {
        Self::acquire_within(device_id, Duration::ZERO)
    }

    /// Waits up to `wait` for the current holder to drop its lease.
    pub fn acquire_within(device_id: &str, wait: Duration) -> Result<Self> {
        let table = leases();
        let deadline = Instant::now() + wait;
        let mut held = lock(&table.held);
        while held.contains(device_id) {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DeviceBusy(device_id.to_string()));
            }
            held = match table.released.wait_timeout(held, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        held.insert(device_id.to_string());
        Ok(Self {
            device_id: device_id.to_string(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let table = leases();
        lock(&table.held).remove(&self.device_id);
        table.released.notify_all();
    }
}

/// Decodes the camera stream with an `ffmpeg` child process writing raw
/// `rgb24` frames, already scaled to the working resolution, to its stdout.
pub struct FfmpegDevice {
    settings: CaptureSettings,
    child: Arc<Mutex<Option<Child>>>,
    stdout: Option<ChildStdout>,
    buffer: Vec<u8>,
}

impl FfmpegDevice {
    pub fn new(settings: CaptureSettings) -> Self {
        let frame_len = settings.width as usize * settings.height as usize * 3;
        Self {
            settings,
            child: Arc::new(Mutex::new(None)),
            stdout: None,
            buffer: vec![0; frame_len],
        }
    }

    fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        if let Some(format) = &self.settings.input_format {
            args.push("-f".into());
            args.push(format.clone());
        }
        args.extend([
            "-i".into(),
            self.settings.source.clone(),
            "-vf".into(),
            format!("scale={}:{}", self.settings.width, self.settings.height),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-f".into(),
            "rawvideo".into(),
            "pipe:1".into(),
        ]);
        args
    }

    /// The camera pipe only appears once the device firmware starts streaming.
    fn wait_for_source(&self) -> Result<()> {
        let path = Path::new(&self.settings.source);
        if self.settings.source.contains("://") {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_millis(self.settings.open_timeout_ms);
        while !path.exists() {
            if Instant::now() >= deadline {
                return Err(Error::DeviceUnavailable(format!(
                    "{} did not appear within {}ms",
                    self.settings.source, self.settings.open_timeout_ms
                )));
            }
            thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    }
}

fn run_hook(argv: &[String], what: &str) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let status = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .status()?;
    if !status.success() {
        return Err(Error::Config(format!("{what} command exited with {status}")));
    }
    Ok(())
}

impl CaptureDevice for FfmpegDevice {
    fn device_id(&self) -> String {
        self.settings.source.clone()
    }

    fn apply_settings(&mut self) -> Result<()> {
        match &self.settings.apply_settings_command {
            Some(argv) => run_hook(argv, "apply camera settings"),
            None => Ok(()),
        }
    }

    fn open(&mut self) -> Result<()> {
        if lock(&self.child).is_some() {
            return Ok(());
        }
        self.wait_for_source()?;

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(self.ffmpeg_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                Error::DeviceUnavailable(format!(
                    "failed to spawn {} for {}: {err}",
                    self.settings.ffmpeg_path, self.settings.source
                ))
            })?;

        self.stdout = child.stdout.take();
        *lock(&self.child) = Some(child);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| Error::DeviceUnavailable("device not open".into()))?;

        stdout.read_exact(&mut self.buffer).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => {
                Error::DeviceUnavailable(format!("{} stream ended", self.settings.source))
            }
            _ => Error::Io(err),
        })?;

        RgbImage::from_raw(self.settings.width, self.settings.height, self.buffer.clone())
            .ok_or_else(|| Error::DeviceUnavailable("short frame from decoder".into()))
    }

    fn close(&mut self) {
        self.stdout = None;
        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            if let Err(err) = child.kill() {
                if err.kind() != ErrorKind::InvalidInput {
                    log::warn!("failed to stop decoder for {}: {err}", self.settings.source);
                }
            }
            let _ = child.wait();
        }
    }

    fn revert_settings(&mut self) -> Result<()> {
        match &self.settings.revert_settings_command {
            Some(argv) => run_hook(argv, "revert camera settings"),
            None => Ok(()),
        }
    }

    fn read_interrupt(&self) -> Option<ReadInterrupt> {
        let child = Arc::clone(&self.child);
        Some(Arc::new(move || {
            // Killing the decoder closes its stdout and ends the blocked read.
            if let Some(child) = lock(&child).as_mut() {
                let _ = child.kill();
            }
        }))
    }
}

impl Drop for FfmpegDevice {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct FfmpegDeviceFactory {
    settings: CaptureSettings,
}

impl FfmpegDeviceFactory {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }
}

impl CaptureDeviceFactory for FfmpegDeviceFactory {
    fn create(&self) -> Box<dyn CaptureDevice> {
        Box::new(FfmpegDevice::new(self.settings.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let lease = DeviceLease::acquire("test-lease-device").unwrap();
        assert!(matches!(
            DeviceLease::acquire("test-lease-device"),
            Err(Error::DeviceBusy(_))
        ));
        drop(lease);
        assert!(DeviceLease::acquire("test-lease-device").is_ok());
    }

    #[test]
    fn waiting_claim_succeeds_once_holder_lets_go() {
        let lease = DeviceLease::acquire("test-lease-handover").unwrap();
        let holder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            drop(lease);
        });

        let started = Instant::now();
        let claimed = DeviceLease::acquire_within("test-lease-handover", Duration::from_secs(2));
        assert!(claimed.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(90));
        holder.join().unwrap();
    }

    #[test]
    fn waiting_claim_gives_up_after_deadline() {
        let _lease = DeviceLease::acquire("test-lease-stuck").unwrap();
        let claimed = DeviceLease::acquire_within("test-lease-stuck", Duration::from_millis(30));
        assert!(matches!(claimed, Err(Error::DeviceBusy(_))));
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_unblocks_a_stalled_decoder() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("ch1_out.h264");
        std::fs::write(&source, b"").unwrap();
        // Stands in for a decoder that never produces a frame.
        let decoder = dir.path().join("stalled-decoder");
        std::fs::write(&decoder, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&decoder, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut device = FfmpegDevice::new(CaptureSettings {
            source: source.display().to_string(),
            ffmpeg_path: decoder.display().to_string(),
            width: 4,
            height: 4,
            ..CaptureSettings::default()
        });
        device.open().unwrap();
        let interrupt = device.read_interrupt().unwrap();

        let started = Instant::now();
        let reader = thread::spawn(move || {
            let result = device.read_frame();
            device.close();
            result
        });
        thread::sleep(Duration::from_millis(100));
        interrupt();

        let result = reader.join().unwrap();
        assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
