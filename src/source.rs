//! Frame acquisition.

mod channel;
mod frame;
mod image_dir;
mod replay;
mod retry;

pub use channel::{CaptureFeed, ChannelSource, capture_channel};
pub use frame::{Frame, FrameSource, SourceError, SourceEvent};
pub use image_dir::ImageSequenceSource;
pub use replay::ReplaySource;
pub use retry::ReconnectingSource;
