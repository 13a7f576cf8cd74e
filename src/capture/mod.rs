pub mod codec;
pub mod frame;
pub mod illumination;
pub mod sensor;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use codec::{EncodedFrame, FrameCodec};
pub use frame::{CaptureProfile, Checkout, ConsumerId, Frame, FrameMetadata, PixelFormat};
pub use illumination::{Illumination, LedProbe, NoIllumination, SimulatedLed, SysfsLed};
pub use sensor::{GrabPolicy, RawCapture, Sensor, SensorControls, SimulatedSensor};
pub use source::{FrameSource, SlotState, SourceStats};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Sensor;
