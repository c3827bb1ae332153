//! Tokio integration for wschannel
//!
//! [`TokioStream`] adapts any upgraded `AsyncRead + AsyncWrite` connection to
//! the channel's [`Stream`](wschannel_core::Stream) seam, and
//! [`ChannelDriver`] runs a [`Channel`](wschannel_core::Channel) on a tokio
//! task: it feeds transport completions, owner commands and close timers
//! into the state machine until the channel is deleted.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/wschannel-tokio/")]

pub mod driver;
pub mod stream;

// Re-export driver and transport types
pub use driver::{ChannelDriver, ChannelHandle, Command};
pub use stream::{Completion, TokioStream, TokioStreamConfig};

/// Prelude module
pub mod prelude {
    pub use crate::driver::{ChannelDriver, ChannelHandle, Command};
    pub use crate::stream::{Completion, TokioStream, TokioStreamConfig};
    pub use wschannel_core::prelude::*;
}
