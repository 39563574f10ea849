pub mod channel;

pub use channel::{Backpressure, ChannelStats, FrameChannel, FrameReceiver, FrameSender, Push};
