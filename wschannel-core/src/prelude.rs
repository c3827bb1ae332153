//! Prelude module for wschannel-core
//!
//! This module re-exports commonly used types and traits to make them
//! easily accessible for users of the library.

pub use crate::channel::{Channel, State, TimerKind};
pub use crate::config::ChannelConfig;
pub use crate::error::{ChannelError, CloseCode, Error, Result, StreamError};
pub use crate::event::{
    AuthCallbacks, AuthChallenge, ChannelState, Credentials, EventSink, HandshakeRequestInfo,
    HandshakeResponseInfo, SslErrorCallbacks, SslInfo,
};
pub use crate::frame::{Frame, FrameDecoder};
pub use crate::protocol::Opcode;
pub use crate::stream::{ConnectRequest, IoPoll, Stream, StreamCreator, StreamRequest};

// Re-export commonly used external dependencies
pub use bytes::{Bytes, BytesMut};
pub use http::{HeaderMap, Uri};
