//! The WebSocket channel state machine
//!
//! [`Channel`] owns one logical WebSocket connection. The owner feeds it API
//! calls (`send_frame`, `start_closing_handshake`), transport completions and
//! timer expiries; the channel drives the [`Stream`] and reports to the
//! [`EventSink`]. Every entry point returns a [`ChannelState`]: once it is
//! [`ChannelState::Deleted`] the channel has delivered its terminal
//! notification and the owner should drop it.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Uri};
use tracing::{debug, error, trace, warn};

use crate::close::{build_close_payload, is_strictly_valid_close_status_code, parse_close};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, CloseCode, Result, StreamError};
use crate::event::{
    AuthCallbacks, AuthChallenge, ChannelState, EventSink, HandshakeRequestInfo,
    HandshakeResponseInfo, SslErrorCallbacks, SslInfo,
};
use crate::frame::Frame;
use crate::protocol::{constants::MAX_CLOSE_REASON_LENGTH, Opcode};
use crate::stream::{ConnectRequest, IoPoll, Stream, StreamCreator, StreamRequest};
use crate::utf8::{StreamingUtf8Validator, Utf8State};

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, no connection attempted yet
    FreshlyConstructed,
    /// Opening handshake in progress
    Connecting,
    /// Open in both directions
    Connected,
    /// We sent Close and are waiting for the peer's
    SendClosed,
    /// The peer sent Close and we are sending ours
    RecvClosed,
    /// Both Close frames exchanged; waiting for the transport to go away
    CloseWait,
    /// Finished
    Closed,
}

/// Which deadline the close timer is enforcing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// The peer has to answer our Close frame
    ClosingHandshake,
    /// The peer has to close the underlying connection
    UnderlyingConnectionClose,
}

#[derive(Debug, Clone, Copy)]
struct CloseTimer {
    kind: TimerKind,
    deadline: Instant,
}

/// A batch of frames handed to the transport in one write.
#[derive(Debug, Default)]
struct SendBuffer {
    frames: Vec<Frame>,
    total_bytes: u64,
}

impl SendBuffer {
    fn add_frame(&mut self, frame: Frame) {
        self.total_bytes += frame.payload_len();
        self.frames.push(frame);
    }
}

#[derive(Debug, Clone)]
struct ReceivedClose {
    code: u16,
    reason: String,
}

/// A WebSocket connection's protocol engine
pub struct Channel {
    event_sink: Box<dyn EventSink>,
    config: ChannelConfig,
    state: State,
    /// Set once the channel must no longer be used
    deleted: bool,
    socket_url: Option<Uri>,
    stream_request: Option<Box<dyn StreamRequest>>,
    stream: Option<Box<dyn Stream>>,

    /// Frames currently being written; `Some` while a write is outstanding
    data_being_sent: Option<SendBuffer>,
    /// Frames queued behind the outstanding write
    data_to_send_next: Option<SendBuffer>,
    current_send_quota: i64,

    /// A read is outstanding
    is_reading: bool,
    close_timer: Option<CloseTimer>,
    received_close: Option<ReceivedClose>,
    /// A Close is being sent on the way to failing; write errors are ignored
    failing: bool,

    pending_handshake_request: Option<HandshakeRequestInfo>,
    pending_handshake_response: Option<HandshakeResponseInfo>,

    outgoing_utf8_validator: StreamingUtf8Validator,
    incoming_utf8_validator: StreamingUtf8Validator,
    sending_text_message: bool,
    receiving_text_message: bool,
    expecting_to_handle_continuation: bool,
    initial_frame_forwarded: bool,

    established_on: Option<Instant>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state)
            .field("deleted", &self.deleted)
            .field("socket_url", &self.socket_url)
            .field("current_send_quota", &self.current_send_quota)
            .field("is_reading", &self.is_reading)
            .field("close_timer", &self.close_timer)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Create a channel with the default configuration
    pub fn new(event_sink: Box<dyn EventSink>) -> Self {
        Self::build(event_sink, ChannelConfig::default())
    }

    /// Create a channel with a custom configuration
    pub fn with_config(event_sink: Box<dyn EventSink>, config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(event_sink, config))
    }

    fn build(event_sink: Box<dyn EventSink>, config: ChannelConfig) -> Self {
        Self {
            event_sink,
            config,
            state: State::FreshlyConstructed,
            deleted: false,
            socket_url: None,
            stream_request: None,
            stream: None,
            data_being_sent: None,
            data_to_send_next: None,
            current_send_quota: 0,
            is_reading: false,
            close_timer: None,
            received_close: None,
            failing: false,
            pending_handshake_request: None,
            pending_handshake_response: None,
            outgoing_utf8_validator: StreamingUtf8Validator::new(),
            incoming_utf8_validator: StreamingUtf8Validator::new(),
            sending_text_message: false,
            receiving_text_message: false,
            expecting_to_handle_continuation: false,
            initial_frame_forwarded: false,
            established_on: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the channel has delivered its terminal notification
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Bytes that may still be sent before more quota is granted
    pub fn current_send_quota(&self) -> i64 {
        self.current_send_quota
    }

    /// Target of the connection, once one was requested
    pub fn socket_url(&self) -> Option<&Uri> {
        self.socket_url.as_ref()
    }

    /// Configuration in use
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// When the armed close timer fires, if any
    pub fn close_deadline(&self) -> Option<Instant> {
        self.close_timer.map(|timer| timer.deadline)
    }

    /// Which close timer is armed, if any
    pub fn close_timer_kind(&self) -> Option<TimerKind> {
        self.close_timer.map(|timer| timer.kind)
    }

    /// Close and release the transport.
    ///
    /// A sink that returns [`ChannelState::Deleted`] leaves the transport
    /// open; owners call this while tearing such a channel down.
    pub fn release_stream(&mut self) {
        if self.stream.is_some() {
            debug!(state = ?self.state, "releasing transport");
        }
        self.close_stream();
    }

    // ---------------------------------------------------------------------
    // Opening handshake
    // ---------------------------------------------------------------------

    /// Start connecting to `socket_url` through the opening-handshake
    /// collaborator.
    pub fn send_add_channel_request(
        &mut self,
        socket_url: &str,
        requested_subprotocols: Vec<String>,
        origin: &str,
        additional_headers: HeaderMap,
        creator: &mut dyn StreamCreator,
    ) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        if self.state != State::FreshlyConstructed {
            error!(state = ?self.state, "send_add_channel_request called twice");
            return ChannelState::Alive;
        }

        let socket_url = match socket_url.parse::<Uri>() {
            Ok(uri) if matches!(uri.scheme_str(), Some("ws") | Some("wss")) => uri,
            _ => {
                warn!(url = socket_url, "refusing to connect to a non-WebSocket URL");
                self.set_state(State::Closed);
                return self.report_failure("Invalid scheme");
            }
        };

        debug!(url = %socket_url, "starting opening handshake");
        let request = ConnectRequest {
            socket_url: socket_url.clone(),
            requested_subprotocols,
            origin: origin.to_string(),
            additional_headers,
        };
        self.socket_url = Some(socket_url);
        self.stream_request = Some(creator.create_and_connect(request));
        self.set_state(State::Connecting);
        ChannelState::Alive
    }

    /// The opening handshake produced a connected transport.
    pub fn on_connect_success(&mut self, stream: Box<dyn Stream>) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        if self.state != State::Connecting {
            error!(state = ?self.state, "on_connect_success in unexpected state");
            return ChannelState::Alive;
        }

        let sub_protocol = stream.sub_protocol().to_string();
        let extensions = stream.extensions().to_string();
        self.stream = Some(stream);
        self.set_state(State::Connected);

        let initial_quota = self.config.send_quota_high_water_mark;
        self.current_send_quota = initial_quota as i64;
        let result = self
            .event_sink
            .on_handshake_response(&sub_protocol, &extensions, initial_quota);
        if self.deliver(result).is_deleted() {
            return ChannelState::Deleted;
        }

        // The request is not used once the connection has succeeded.
        self.stream_request = None;

        self.read_frames()
    }

    /// The opening handshake failed.
    pub fn on_connect_failure(&mut self, message: &str) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        if self.state != State::Connecting {
            error!(state = ?self.state, "on_connect_failure in unexpected state");
            return ChannelState::Alive;
        }

        self.set_state(State::Closed);
        self.stream_request = None;

        if self.send_pending_handshake_notifications().is_deleted() {
            return ChannelState::Deleted;
        }
        self.report_failure(message)
    }

    /// Record the upgrade request; it is reported by
    /// [`send_pending_handshake_notifications`](Self::send_pending_handshake_notifications).
    pub fn on_start_opening_handshake(&mut self, request: HandshakeRequestInfo) {
        debug_assert!(self.pending_handshake_request.is_none());
        self.pending_handshake_request = Some(request);
    }

    /// Record the upgrade response; it is reported by
    /// [`send_pending_handshake_notifications`](Self::send_pending_handshake_notifications).
    pub fn on_finish_opening_handshake(&mut self, response: HandshakeResponseInfo) {
        debug_assert!(self.pending_handshake_response.is_none());
        self.pending_handshake_response = Some(response);
    }

    /// Deliver recorded opening-handshake metadata. Owners schedule this on
    /// their loop after `on_start_opening_handshake` or
    /// `on_finish_opening_handshake`; it also runs before any drop or
    /// connect-failure notification so the metadata is never lost.
    pub fn send_pending_handshake_notifications(&mut self) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        if let Some(request) = self.pending_handshake_request.take() {
            let result = self.event_sink.on_start_opening_handshake(request);
            if self.deliver(result).is_deleted() {
                return ChannelState::Deleted;
            }
        }
        if let Some(response) = self.pending_handshake_response.take() {
            let result = self.event_sink.on_finish_opening_handshake(response);
            if self.deliver(result).is_deleted() {
                return ChannelState::Deleted;
            }
        }
        ChannelState::Alive
    }

    /// Forward a certificate error to the owner.
    pub fn on_ssl_certificate_error(
        &mut self,
        callbacks: Box<dyn SslErrorCallbacks>,
        info: &SslInfo,
        fatal: bool,
    ) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        let url = self.url_string();
        let result = self
            .event_sink
            .on_ssl_certificate_error(callbacks, &url, info, fatal);
        self.deliver(result)
    }

    /// Forward an authentication challenge to the owner.
    pub fn on_auth_required(
        &mut self,
        challenge: &AuthChallenge,
        callbacks: Box<dyn AuthCallbacks>,
    ) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        let result = self.event_sink.on_auth_required(challenge, callbacks);
        self.deliver(result)
    }

    // ---------------------------------------------------------------------
    // Application API
    // ---------------------------------------------------------------------

    /// Send one data frame.
    ///
    /// Calls made while closing are ignored. Sending more than the current
    /// quota, or text that is not UTF-8, fails the channel.
    pub fn send_frame(&mut self, fin: bool, opcode: Opcode, payload: Bytes) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        if self.stream.is_none() {
            error!(
                fin,
                %opcode,
                size = payload.len(),
                "send_frame called without an established connection"
            );
            return ChannelState::Alive;
        }
        if self.in_closing_state() {
            debug!(
                state = ?self.state,
                "send_frame called while closing; this may be a bug or a harmless race"
            );
            return ChannelState::Alive;
        }
        if self.state != State::Connected {
            error!(state = ?self.state, "send_frame called in unexpected state");
            return ChannelState::Alive;
        }
        if payload.len() as i64 > self.current_send_quota {
            return self.fail(ChannelError::SendQuotaExceeded);
        }
        if !opcode.is_data() {
            error!(%opcode, fin, size = payload.len(), "send_frame called with a non-data opcode");
            return ChannelState::Alive;
        }
        if opcode == Opcode::Text || (opcode == Opcode::Continuation && self.sending_text_message)
        {
            let state = self.outgoing_utf8_validator.add_bytes(&payload);
            if state == Utf8State::Invalid || (state == Utf8State::ValidMidpoint && fin) {
                return self.fail(ChannelError::InvalidOutgoingUtf8);
            }
            self.sending_text_message = !fin;
        }

        self.current_send_quota -= payload.len() as i64;
        debug_assert!(self.current_send_quota >= 0);
        self.send_frame_internal(fin, opcode, payload)
    }

    /// Begin the closing handshake with `code` and `reason`.
    ///
    /// A code that may not be sent, or a reason longer than 123 bytes, is
    /// replaced by `(1011, "")`.
    pub fn start_closing_handshake(&mut self, code: u16, reason: &str) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        if self.in_closing_state() {
            debug!(
                state = ?self.state,
                "start_closing_handshake called while closing; this may be a bug or a harmless race"
            );
            return ChannelState::Alive;
        }
        if self.received_close.is_some() {
            // The application no longer wants the data frames we were
            // holding back, so the peer's Close can be answered now.
            return self.respond_to_closing_handshake();
        }
        if self.state == State::Connecting {
            if let Some(mut request) = self.stream_request.take() {
                request.cancel();
            }
            self.set_state(State::Closed);
            return self.do_drop_channel(false, CloseCode::Abnormal.code(), "");
        }
        if self.state != State::Connected {
            error!(state = ?self.state, "start_closing_handshake called in unexpected state");
            return ChannelState::Alive;
        }

        self.arm_close_timer(TimerKind::ClosingHandshake);

        let (code, reason) = if !is_strictly_valid_close_status_code(code)
            || reason.len() > MAX_CLOSE_REASON_LENGTH
        {
            warn!(code, reason_len = reason.len(), "invalid close requested; sending 1011");
            (CloseCode::InternalError.code(), "")
        } else if code == CloseCode::NoStatusReceived.code() {
            (code, "")
        } else {
            (code, reason)
        };
        if self.send_close(code, reason).is_deleted() {
            return ChannelState::Deleted;
        }
        debug_assert_eq!(self.state, State::Connected);
        self.set_state(State::SendClosed);
        ChannelState::Alive
    }

    /// Fail the channel: send Close(`code`, `reason`) if still connected,
    /// close the transport and report `message`. Terminal.
    pub fn fail_channel(&mut self, message: &str, code: u16, reason: &str) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        debug!(state = ?self.state, code, reason, message, "failing channel");

        #[cfg(feature = "metrics")]
        metrics::counter!("wschannel_channel_failures_total").increment(1);

        if self.state == State::Connected {
            let reason = if reason.len() <= MAX_CLOSE_REASON_LENGTH {
                reason
            } else {
                ""
            };
            self.failing = true;
            let result = self.send_close(code, reason);
            self.failing = false;
            if result.is_deleted() {
                return ChannelState::Deleted;
            }
        }

        // RFC 6455 7.1.7: the endpoint that fails the connection closes it
        // without waiting for the closing handshake.
        if let Some(mut request) = self.stream_request.take() {
            request.cancel();
        }
        self.close_stream();
        if self.state != State::Closed {
            self.set_state(State::Closed);
        }
        self.report_failure(message)
    }

    // ---------------------------------------------------------------------
    // Receive path
    // ---------------------------------------------------------------------

    /// Read from the transport until the consumer has data pending.
    ///
    /// The consumer calls this whenever it has drained the frames delivered
    /// so far. A Close from the peer that was waiting for the backlog to
    /// drain is answered first.
    pub fn read_frames(&mut self) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        if !matches!(
            self.state,
            State::Connected | State::SendClosed | State::CloseWait
        ) {
            debug!(state = ?self.state, "read_frames called in unexpected state");
            return ChannelState::Alive;
        }
        if self.is_reading {
            return ChannelState::Alive;
        }

        if self.state == State::Connected
            && self.received_close.is_some()
            && !self.event_sink.has_pending_data_frames()
        {
            // The backlog that held back our Close response has drained.
            if self.respond_to_closing_handshake().is_deleted() {
                return ChannelState::Deleted;
            }
        }

        while !self.event_sink.has_pending_data_frames() {
            let Some(stream) = self.stream.as_mut() else {
                return ChannelState::Alive;
            };
            trace!("reading frames");
            match stream.read_frames() {
                IoPoll::Pending => {
                    self.is_reading = true;
                    return ChannelState::Alive;
                }
                IoPoll::Ready(result) => {
                    if self.on_read_complete(true, result).is_deleted() {
                        return ChannelState::Deleted;
                    }
                }
            }
        }
        ChannelState::Alive
    }

    /// Completion of a read that returned [`IoPoll::Pending`].
    pub fn on_read_done(&mut self, result: std::result::Result<Vec<Frame>, StreamError>) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        if !self.is_reading {
            warn!("read completion without an outstanding read");
        }
        self.on_read_complete(false, result)
    }

    fn on_read_complete(
        &mut self,
        synchronous: bool,
        result: std::result::Result<Vec<Frame>, StreamError>,
    ) -> ChannelState {
        self.is_reading = false;
        match result {
            Ok(frames) => {
                if frames.is_empty() {
                    // A clean close must be reported as ConnectionClosed.
                    error!("transport reported a successful read with no frames");
                    return self.fail(ChannelError::InvalidFrameHeader);
                }
                for frame in frames {
                    if self.handle_frame(frame).is_deleted() {
                        return ChannelState::Deleted;
                    }
                }
                if !synchronous && !self.event_sink.has_pending_data_frames() {
                    return self.read_frames();
                }
                ChannelState::Alive
            }
            Err(StreamError::Protocol(detail)) => {
                debug!(%detail, "transport could not deframe input");
                self.fail(ChannelError::InvalidFrameHeader)
            }
            Err(err) => {
                debug!(%err, state = ?self.state, "transport read ended");
                self.close_stream();
                self.set_state(State::Closed);

                let clean_close = matches!(err, StreamError::ConnectionClosed);
                match self.received_close.take() {
                    Some(close) => self.do_drop_channel(clean_close, close.code, &close.reason),
                    None => self.do_drop_channel(false, CloseCode::Abnormal.code(), ""),
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> ChannelState {
        #[cfg(feature = "metrics")]
        metrics::counter!("wschannel_frames_received_total").increment(1);

        if frame.masked {
            // RFC 6455 5.1: a client MUST close a connection if it detects a
            // masked frame.
            return self.fail(ChannelError::MaskedFrame);
        }
        if frame.has_reserved_bits() {
            return self.fail(ChannelError::ReservedBits {
                rsv1: u8::from(frame.rsv[0]),
                rsv2: u8::from(frame.rsv[1]),
                rsv3: u8::from(frame.rsv[2]),
            });
        }
        self.handle_frame_by_state(frame.opcode, frame.fin, frame.payload)
    }

    fn handle_frame_by_state(&mut self, opcode: Opcode, fin: bool, payload: Bytes) -> ChannelState {
        debug_assert_ne!(self.state, State::Closed);
        if self.state == State::CloseWait {
            // Only one Close per direction; fail without sending another.
            return self.fail(ChannelError::FrameAfterClose(opcode.frame_type_name()));
        }

        match opcode {
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                self.handle_data_frame(opcode, fin, payload)
            }
            Opcode::Ping => {
                trace!(size = payload.len(), "got ping");
                if self.state == State::Connected {
                    return self.send_frame_internal(true, Opcode::Pong, payload);
                }
                trace!(state = ?self.state, "ignored ping");
                ChannelState::Alive
            }
            Opcode::Pong => {
                trace!(size = payload.len(), "got pong");
                ChannelState::Alive
            }
            Opcode::Close => match parse_close(&payload) {
                Ok((code, reason)) => self.handle_close_frame(code, reason),
                Err(err) => self.fail(ChannelError::BrokenClose(err)),
            },
            Opcode::Unknown(value) => self.fail(ChannelError::UnknownOpcode(value)),
        }
    }

    fn handle_data_frame(&mut self, opcode: Opcode, fin: bool, payload: Bytes) -> ChannelState {
        if self.state != State::Connected {
            trace!(state = ?self.state, "ignored data frame");
            return ChannelState::Alive;
        }
        if self.received_close.is_some() {
            trace!("ignored data frame after the peer's close");
            return ChannelState::Alive;
        }

        let got_continuation = opcode == Opcode::Continuation;
        if got_continuation != self.expecting_to_handle_continuation {
            return self.fail(if got_continuation {
                ChannelError::UnexpectedContinuation
            } else {
                ChannelError::PreviousMessageUnfinished
            });
        }
        self.expecting_to_handle_continuation = !fin;

        let mut opcode_to_send = opcode;
        if !self.initial_frame_forwarded && got_continuation {
            opcode_to_send = if self.receiving_text_message {
                Opcode::Text
            } else {
                Opcode::Binary
            };
        }

        if opcode == Opcode::Text || (got_continuation && self.receiving_text_message) {
            // Not redundant for empty payloads: it reports the current state.
            let state = self.incoming_utf8_validator.add_bytes(&payload);
            if state == Utf8State::Invalid || (state == Utf8State::ValidMidpoint && fin) {
                return self.fail(ChannelError::InvalidIncomingUtf8);
            }
            self.receiving_text_message = !fin;
        }

        if payload.is_empty() && !fin {
            return ChannelState::Alive;
        }

        self.initial_frame_forwarded = !fin;
        let result = self.event_sink.on_data_frame(fin, opcode_to_send, payload);
        self.deliver(result)
    }

    fn handle_close_frame(&mut self, code: u16, reason: String) -> ChannelState {
        debug!(code, state = ?self.state, "got close");
        match self.state {
            State::Connected => {
                self.received_close = Some(ReceivedClose { code, reason });
                if self.event_sink.has_pending_data_frames() {
                    // Answer once the consumer has taken the frames already
                    // delivered; see read_frames().
                    return ChannelState::Alive;
                }
                self.respond_to_closing_handshake()
            }
            State::SendClosed => {
                self.set_state(State::CloseWait);
                debug_assert_eq!(
                    self.close_timer_kind(),
                    Some(TimerKind::ClosingHandshake)
                );
                self.arm_close_timer(TimerKind::UnderlyingConnectionClose);
                // RFC 6455 7.1.5: each endpoint reports the code the other
                // end sent.
                self.received_close = Some(ReceivedClose { code, reason });
                ChannelState::Alive
            }
            state => {
                error!(?state, "got close in unexpected state");
                ChannelState::Alive
            }
        }
    }

    fn respond_to_closing_handshake(&mut self) -> ChannelState {
        debug_assert_eq!(self.state, State::Connected);
        let Some(close) = self.received_close.clone() else {
            error!("no close frame to respond to");
            return ChannelState::Alive;
        };

        self.set_state(State::RecvClosed);
        if self.send_close(close.code, &close.reason).is_deleted() {
            return ChannelState::Deleted;
        }
        debug_assert_eq!(self.state, State::RecvClosed);

        self.set_state(State::CloseWait);
        debug_assert!(self.close_timer.is_none());
        self.arm_close_timer(TimerKind::UnderlyingConnectionClose);

        let result = self.event_sink.on_closing_handshake_started();
        self.deliver(result)
    }

    // ---------------------------------------------------------------------
    // Send path
    // ---------------------------------------------------------------------

    fn send_close(&mut self, code: u16, reason: &str) -> ChannelState {
        debug_assert!(matches!(self.state, State::Connected | State::RecvClosed));
        debug!(code, reason, "sending close");
        let payload = build_close_payload(code, reason);
        self.send_frame_internal(true, Opcode::Close, payload)
    }

    fn send_frame_internal(&mut self, fin: bool, opcode: Opcode, payload: Bytes) -> ChannelState {
        debug_assert!(matches!(self.state, State::Connected | State::RecvClosed));

        #[cfg(feature = "metrics")]
        {
            metrics::counter!("wschannel_frames_sent_total").increment(1);
            metrics::counter!("wschannel_bytes_sent_total").increment(payload.len() as u64);
        }

        // The transport picks the masking key.
        let frame = Frame::new(opcode, payload).fin(fin).masked(true);

        if self.data_being_sent.is_some() {
            // Either the link is saturated or several frames are being sent
            // in a batch.
            self.data_to_send_next
                .get_or_insert_with(SendBuffer::default)
                .add_frame(frame);
            return ChannelState::Alive;
        }

        let mut buffer = SendBuffer::default();
        buffer.add_frame(frame);
        self.data_being_sent = Some(buffer);
        self.write_frames()
    }

    fn write_frames(&mut self) -> ChannelState {
        loop {
            let Some(buffer) = self.data_being_sent.as_mut() else {
                return ChannelState::Alive;
            };
            let frames = std::mem::take(&mut buffer.frames);
            trace!(
                frames = frames.len(),
                bytes = buffer.total_bytes,
                "writing frames"
            );
            let Some(stream) = self.stream.as_mut() else {
                return ChannelState::Alive;
            };
            match stream.write_frames(frames) {
                IoPoll::Pending => return ChannelState::Alive,
                IoPoll::Ready(result) => {
                    let succeeded = result.is_ok();
                    if self.on_write_complete(true, result).is_deleted() {
                        return ChannelState::Deleted;
                    }
                    if !succeeded {
                        return ChannelState::Alive;
                    }
                }
            }
        }
    }

    /// Completion of a write that returned [`IoPoll::Pending`].
    pub fn on_write_done(&mut self, result: std::result::Result<(), StreamError>) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        if self.data_being_sent.is_none() {
            warn!("write completion without an outstanding write");
            return ChannelState::Alive;
        }
        self.on_write_complete(false, result)
    }

    fn on_write_complete(
        &mut self,
        synchronous: bool,
        result: std::result::Result<(), StreamError>,
    ) -> ChannelState {
        debug_assert!(!matches!(
            self.state,
            State::FreshlyConstructed | State::Connecting
        ));
        match result {
            Ok(()) => {
                if let Some(next) = self.data_to_send_next.take() {
                    self.data_being_sent = Some(next);
                    if !synchronous {
                        return self.write_frames();
                    }
                    return ChannelState::Alive;
                }

                self.data_being_sent = None;
                let low_water_mark = self.config.send_quota_low_water_mark as i64;
                let high_water_mark = self.config.send_quota_high_water_mark as i64;
                if self.current_send_quota < low_water_mark {
                    let fresh_quota = high_water_mark - self.current_send_quota;
                    self.current_send_quota += fresh_quota;
                    trace!(fresh_quota, "refilling send quota");
                    let result = self.event_sink.on_send_quota_added(fresh_quota as usize);
                    return self.deliver(result);
                }
                ChannelState::Alive
            }
            Err(err) => {
                warn!(%err, state = ?self.state, "write failed");
                self.data_being_sent = None;
                self.data_to_send_next = None;
                self.close_stream();
                if self.failing {
                    // fail_channel() reports the failure itself.
                    return ChannelState::Alive;
                }
                self.set_state(State::Closed);
                self.do_drop_channel(false, CloseCode::Abnormal.code(), "")
            }
        }
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    fn arm_close_timer(&mut self, kind: TimerKind) {
        let timeout: Duration = match kind {
            TimerKind::ClosingHandshake => self.config.closing_handshake_timeout,
            TimerKind::UnderlyingConnectionClose => self.config.underlying_connection_close_timeout,
        };
        let timer = CloseTimer {
            kind,
            deadline: Instant::now() + timeout,
        };
        if let Some(previous) = self.close_timer.replace(timer) {
            trace!(previous = ?previous.kind, next = ?kind, "replacing close timer");
        }
    }

    /// The armed close timer expired: close the transport and drop the
    /// channel abnormally.
    pub fn on_close_timeout(&mut self) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        let Some(timer) = self.close_timer.take() else {
            return ChannelState::Alive;
        };
        debug!(kind = ?timer.kind, state = ?self.state, "close timer fired");
        self.close_stream();
        self.set_state(State::Closed);
        self.do_drop_channel(false, CloseCode::Abnormal.code(), "")
    }

    /// Fire the close timer if its deadline is not after `now`.
    pub fn poll_timers(&mut self, now: Instant) -> ChannelState {
        if self.deleted {
            return ChannelState::Deleted;
        }
        match self.close_deadline() {
            Some(deadline) if deadline <= now => self.on_close_timeout(),
            _ => ChannelState::Alive,
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn set_state(&mut self, new_state: State) {
        debug_assert_ne!(self.state, new_state);
        trace!(from = ?self.state, to = ?new_state, "state change");

        if new_state == State::Connected {
            self.established_on = Some(Instant::now());
        }
        if self.state == State::Connected {
            if let Some(established_on) = self.established_on.take() {
                let duration = established_on.elapsed();
                debug!(?duration, "connection leaving connected state");
                #[cfg(feature = "metrics")]
                metrics::histogram!("wschannel_connection_duration_seconds")
                    .record(duration.as_secs_f64());
            }
        }
        if new_state == State::Closed {
            self.close_timer = None;
        }

        self.state = new_state;
    }

    fn in_closing_state(&self) -> bool {
        matches!(
            self.state,
            State::SendClosed | State::RecvClosed | State::CloseWait | State::Closed
        )
    }

    fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.is_reading = false;
    }

    fn fail(&mut self, err: ChannelError) -> ChannelState {
        let message = err.to_string();
        self.fail_channel(&message, err.close_code(), err.close_reason())
    }

    fn do_drop_channel(&mut self, was_clean: bool, code: u16, reason: &str) -> ChannelState {
        if self.send_pending_handshake_notifications().is_deleted() {
            return ChannelState::Deleted;
        }
        debug!(was_clean, code, reason, "dropping channel");
        self.event_sink.on_channel_dropped(was_clean, code, reason);
        self.mark_deleted()
    }

    fn report_failure(&mut self, message: &str) -> ChannelState {
        self.event_sink.on_channel_failed(message);
        self.mark_deleted()
    }

    /// Record a sink verdict; `Deleted` makes the channel defunct.
    fn deliver(&mut self, result: ChannelState) -> ChannelState {
        if result.is_deleted() {
            return self.mark_deleted();
        }
        ChannelState::Alive
    }

    fn mark_deleted(&mut self) -> ChannelState {
        self.deleted = true;
        self.close_timer = None;
        ChannelState::Deleted
    }

    fn url_string(&self) -> String {
        self.socket_url
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }
}
