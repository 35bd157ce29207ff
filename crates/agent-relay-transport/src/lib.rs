//! Transport layer between the relay and its agents.
//!
//! Provides:
//! - Wire codec (`[u32 BE length][payload]` frames)
//! - `AgentConnection` - One agent socket with its single receive loop

pub mod codec;
pub mod connection;

pub use codec::{DecodeError, EncodeError, FrameCodec, LEN_PREFIX, encode_frame};
pub use connection::{AgentConnection, ConnectionReader, SendError};
