//! Control-channel wire protocol: JSON frames with a length prefix.

mod codec;
mod frame;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use frame::{Frame, FrameKind};
