pub mod capture_loop;
pub mod device;
pub mod driver;
pub mod frame;
pub mod mock;
pub mod ring;
pub mod v4l2;

pub use capture_loop::{CaptureLoop, CaptureReport, LoopOptions, LoopState};
pub use device::{DeviceSession, Negotiation};
pub use driver::{Driver, DriverBuffer, SlotMapping};
pub use frame::{AcceptedFormat, Frame, FrameMetadata, PixelFormat};
pub use mock::{MockDriver, TestPattern};
pub use ring::{BufferRing, Dequeued, DequeuedSlot, SlotState, MIN_BUFFERS};
pub use v4l2::V4l2Driver;
