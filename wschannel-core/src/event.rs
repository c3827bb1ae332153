//! Notifications from the channel to its owner

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::time::SystemTime;

use crate::protocol::Opcode;

/// Whether the channel may still be used after a call returns.
///
/// Any call into the [`EventSink`] or the transport may end the channel's
/// life. Callers must stop touching the channel as soon as they see
/// [`ChannelState::Deleted`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The channel is still usable
    Alive,
    /// The channel has delivered its terminal notification or its owner
    /// asked for it to be torn down; it must only be dropped now
    Deleted,
}

impl ChannelState {
    /// Check for [`ChannelState::Deleted`]
    pub fn is_deleted(self) -> bool {
        self == ChannelState::Deleted
    }
}

/// Metadata about the upgrade request, for developer tooling
#[derive(Debug, Clone)]
pub struct HandshakeRequestInfo {
    /// Target URL
    pub url: String,
    /// Request headers as sent
    pub headers: HeaderMap,
    /// When the request was sent
    pub request_time: SystemTime,
}

/// Metadata about the upgrade response, for developer tooling
#[derive(Debug, Clone)]
pub struct HandshakeResponseInfo {
    /// Target URL
    pub url: String,
    /// HTTP status, normally 101
    pub status: StatusCode,
    /// Response headers as received
    pub headers: HeaderMap,
    /// When the response arrived
    pub response_time: SystemTime,
}

/// Details of a certificate error reported by the TLS layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslInfo {
    /// Host the certificate was presented for
    pub host: String,
    /// Description of the verification failure
    pub error: String,
}

/// Lets the owner decide what to do about a certificate error
pub trait SslErrorCallbacks: Send {
    /// Abort the connection attempt
    fn cancel_ssl_request(self: Box<Self>, error: &str);
    /// Proceed despite the error
    fn continue_ssl_request(self: Box<Self>);
}

/// HTTP authentication challenge received during the opening handshake
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    /// Challenge scheme, e.g. `Basic`
    pub scheme: String,
    /// Protection space
    pub realm: String,
    /// Headers of the 401/407 response
    pub response_headers: HeaderMap,
}

/// Credentials supplied in answer to an [`AuthChallenge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

/// Lets the owner answer an authentication challenge
pub trait AuthCallbacks: Send {
    /// Retry the handshake with these credentials
    fn continue_with_credentials(self: Box<Self>, credentials: Credentials);
    /// Give up; the handshake fails with the 401/407 response
    fn cancel_auth(self: Box<Self>);
}

/// Receives everything the channel reports to its owner.
///
/// Returning [`ChannelState::Deleted`] from a notification tells the channel
/// that its owner is tearing it down; the channel stops immediately.
/// [`on_channel_failed`](EventSink::on_channel_failed) and
/// [`on_channel_dropped`](EventSink::on_channel_dropped) are terminal: each
/// channel delivers exactly one of them, at most once, and is defunct
/// afterward.
pub trait EventSink: Send {
    /// The opening handshake succeeded and `initial_quota` bytes may be sent.
    fn on_handshake_response(
        &mut self,
        sub_protocol: &str,
        extensions: &str,
        initial_quota: usize,
    ) -> ChannelState;

    /// A chunk of a data message. The first chunk delivered for a message
    /// carries `Text` or `Binary`; later chunks carry `Continuation`.
    fn on_data_frame(&mut self, fin: bool, opcode: Opcode, payload: Bytes) -> ChannelState;

    /// `quota` more bytes may be sent.
    fn on_send_quota_added(&mut self, quota: usize) -> ChannelState;

    /// Whether frames handed over by [`on_data_frame`](EventSink::on_data_frame)
    /// are still waiting to be consumed. While this is true the channel stops
    /// reading; call [`Channel::read_frames`](crate::Channel::read_frames) once
    /// the backlog has drained.
    fn has_pending_data_frames(&self) -> bool;

    /// The peer started the closing handshake and we answered it.
    fn on_closing_handshake_started(&mut self) -> ChannelState;

    /// The channel failed. Terminal.
    fn on_channel_failed(&mut self, message: &str);

    /// The connection ended. `was_clean` is true only if both Close frames
    /// were exchanged and the transport closed normally. Terminal.
    fn on_channel_dropped(&mut self, was_clean: bool, code: u16, reason: &str);

    /// The upgrade request was sent.
    fn on_start_opening_handshake(&mut self, _request: HandshakeRequestInfo) -> ChannelState {
        ChannelState::Alive
    }

    /// The upgrade response arrived.
    fn on_finish_opening_handshake(&mut self, _response: HandshakeResponseInfo) -> ChannelState {
        ChannelState::Alive
    }

    /// Certificate verification failed. The default refuses the connection.
    fn on_ssl_certificate_error(
        &mut self,
        callbacks: Box<dyn SslErrorCallbacks>,
        _url: &str,
        info: &SslInfo,
        _fatal: bool,
    ) -> ChannelState {
        callbacks.cancel_ssl_request(&info.error);
        ChannelState::Alive
    }

    /// The server requested authentication. The default declines.
    fn on_auth_required(
        &mut self,
        _challenge: &AuthChallenge,
        callbacks: Box<dyn AuthCallbacks>,
    ) -> ChannelState {
        callbacks.cancel_auth();
        ChannelState::Alive
    }
}
