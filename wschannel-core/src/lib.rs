//! # wschannel-core
//!
//! Sans-IO implementation of the client side of an RFC 6455 WebSocket
//! connection, sitting above an already-upgraded transport.
//!
//! The crate includes:
//!
//! - Error handling and types
//! - The frame model and a wire codec for byte-oriented transports
//! - An incremental UTF-8 validator for fragmented text messages
//! - Close frame encoding and status code validation
//! - The [`Channel`] state machine: send quota, frame batching, consumer-pull
//!   reads and the closing handshake with its timers
//! - The [`Stream`] and [`EventSink`] seams the owner plugs into
//!
//! The channel performs no I/O and owns no runtime. Transport completions
//! and timer expiries are fed to it by the owner; see the `wschannel-tokio`
//! crate for a driver built on tokio.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/wschannel-core/")]

// Core modules
pub mod channel;
pub mod close;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod protocol;
pub mod stream;
pub mod utf8;

// Prelude module with common imports
pub mod prelude;

// Re-export key types for convenience
pub use channel::{Channel, State, TimerKind};
pub use config::ChannelConfig;
pub use error::{ChannelError, CloseCode, Error, Result, StreamError};
pub use event::{ChannelState, EventSink};
pub use frame::{Frame, FrameDecoder};
pub use protocol::Opcode;
pub use stream::{IoPoll, Stream, StreamCreator, StreamRequest};
