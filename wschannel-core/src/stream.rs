//! Transport abstraction
//!
//! The channel drives a [`Stream`] that exchanges whole frames with the peer.
//! Every operation may complete inline ([`IoPoll::Ready`]) or later
//! ([`IoPoll::Pending`]); in the latter case the owner reports the outcome
//! through [`Channel::on_read_done`](crate::Channel::on_read_done) or
//! [`Channel::on_write_done`](crate::Channel::on_write_done).

use crate::error::StreamError;
use crate::frame::Frame;
use http::{HeaderMap, Uri};

/// Outcome of a transport operation
#[derive(Debug)]
pub enum IoPoll<T> {
    /// The operation finished synchronously
    Ready(Result<T, StreamError>),
    /// The completion will be delivered to the channel later
    Pending,
}

/// A connected WebSocket transport that reads and writes whole frames.
///
/// Implementations apply masking keys to frames flagged `masked` and report a
/// clean close as [`StreamError::ConnectionClosed`]; a successful read never
/// yields zero frames.
pub trait Stream: Send {
    /// Read at least one frame.
    fn read_frames(&mut self) -> IoPoll<Vec<Frame>>;

    /// Write a batch of frames, in order.
    fn write_frames(&mut self, frames: Vec<Frame>) -> IoPoll<()>;

    /// Tear the connection down. The channel ignores anything the transport
    /// reports afterward.
    fn close(&mut self);

    /// Subprotocol selected during the opening handshake, or empty
    fn sub_protocol(&self) -> &str;

    /// Extensions accepted during the opening handshake, or empty
    fn extensions(&self) -> &str;
}

/// Parameters for the opening handshake
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// `ws://` or `wss://` target
    pub socket_url: Uri,
    /// Subprotocols offered in `Sec-WebSocket-Protocol`
    pub requested_subprotocols: Vec<String>,
    /// Origin of the requesting application
    pub origin: String,
    /// Extra request headers
    pub additional_headers: HeaderMap,
}

/// Handle to an opening handshake in progress. Dropping it abandons the
/// attempt.
pub trait StreamRequest: Send {
    /// Abort the handshake; no further callbacks for it reach the channel.
    fn cancel(&mut self) {}
}

/// The opening-handshake collaborator.
///
/// It performs the HTTP upgrade and eventually reports back through
/// [`Channel::on_connect_success`](crate::Channel::on_connect_success) or
/// [`Channel::on_connect_failure`](crate::Channel::on_connect_failure).
pub trait StreamCreator {
    /// Begin connecting
    fn create_and_connect(&mut self, request: ConnectRequest) -> Box<dyn StreamRequest>;
}
