pub mod broadcaster;
pub mod device;
pub mod frame;
pub mod source;

pub use broadcaster::{ConsumerId, ConsumerStats, FrameBroadcaster, FrameConsumer, OverflowPolicy};
pub use device::{
    CaptureDevice, CaptureDeviceFactory, DeviceLease, FfmpegDevice, FfmpegDeviceFactory, ReadInterrupt,
};
pub use frame::Frame;
pub use source::{FrameSource, SourceOptions};
