// src/core/protocol/mod.rs

//! RESP2 framing used to talk to the broker.

pub mod resp_frame;
pub mod resp_value;
pub use resp_frame::{RespFrame, RespFrameCodec};
pub use resp_value::RespValue;
