//! Runs a channel on a tokio task
//!
//! The driver owns the [`Channel`] and is the only code that calls into it.
//! Everything else talks to it through a [`ChannelHandle`].

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};
use wschannel_core::{Channel, ChannelState, CloseCode, Opcode};

use crate::stream::Completion;

/// Capacity of the command queue between handles and the driver
pub const DEFAULT_COMMAND_BUFFER: usize = 64;

/// Requests from the owner to the channel
#[derive(Debug, Clone)]
pub enum Command {
    /// [`Channel::send_frame`]
    Send {
        /// Last chunk of the message
        fin: bool,
        /// `Text`, `Binary` or `Continuation`
        opcode: Opcode,
        /// Chunk contents
        payload: Bytes,
    },
    /// [`Channel::start_closing_handshake`]
    Close {
        /// Status code to send
        code: u16,
        /// Reason to send
        reason: String,
    },
    /// [`Channel::read_frames`]; sent once the consumer has drained the
    /// frames delivered so far
    ReadFrames,
}

/// Cloneable sender of [`Command`]s to a running [`ChannelDriver`]
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    commands: mpsc::Sender<Command>,
}

impl ChannelHandle {
    /// Queue a data frame. Returns `false` once the driver has stopped.
    pub async fn send_frame(&self, fin: bool, opcode: Opcode, payload: impl Into<Bytes>) -> bool {
        self.command(Command::Send {
            fin,
            opcode,
            payload: payload.into(),
        })
        .await
    }

    /// Queue a complete text message
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_frame(true, Opcode::Text, Bytes::from(text.into()))
            .await
    }

    /// Queue a complete binary message
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.send_frame(true, Opcode::Binary, data).await
    }

    /// Start the closing handshake
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.command(Command::Close {
            code,
            reason: reason.into(),
        })
        .await
    }

    /// Tell the channel the consumer is ready for more frames
    pub async fn read_frames(&self) -> bool {
        self.command(Command::ReadFrames).await
    }

    /// Whether the driver has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn command(&self, command: Command) -> bool {
        self.commands.send(command).await.is_ok()
    }
}

/// Event loop for one [`Channel`]
#[derive(Debug)]
pub struct ChannelDriver {
    channel: Channel,
    completions: mpsc::UnboundedReceiver<Completion>,
    commands: mpsc::Receiver<Command>,
}

impl ChannelDriver {
    /// Wrap a channel and the completion receiver of its transport
    pub fn new(
        channel: Channel,
        completions: mpsc::UnboundedReceiver<Completion>,
    ) -> (Self, ChannelHandle) {
        Self::with_capacity(channel, completions, DEFAULT_COMMAND_BUFFER)
    }

    /// Like [`new`](Self::new) with a custom command queue capacity
    pub fn with_capacity(
        channel: Channel,
        completions: mpsc::UnboundedReceiver<Completion>,
        capacity: usize,
    ) -> (Self, ChannelHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let driver = Self {
            channel,
            completions,
            commands: rx,
        };
        (driver, ChannelHandle { commands: tx })
    }

    /// Run until the channel is deleted, then hand it back with its
    /// transport closed.
    ///
    /// Dropping every [`ChannelHandle`] starts the closing handshake with
    /// 1001 (going away).
    #[tracing::instrument(skip(self), fields(url = ?self.channel.socket_url()))]
    pub async fn run(self) -> Channel {
        let Self {
            mut channel,
            mut completions,
            mut commands,
        } = self;
        let mut commands_open = true;

        info!(state = ?channel.state(), "channel driver started");
        while !channel.is_deleted() {
            let deadline = channel.close_deadline();
            let close_timer = async move {
                match deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                    }
                    None => std::future::pending().await,
                }
            };

            let state = tokio::select! {
                Some(completion) = completions.recv() => match completion {
                    Completion::Read(result) => channel.on_read_done(result),
                    Completion::Write(result) => channel.on_write_done(result),
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => apply(&mut channel, command),
                    None => {
                        debug!("all handles dropped; closing");
                        commands_open = false;
                        channel.start_closing_handshake(CloseCode::GoingAway.code(), "")
                    }
                },
                _ = close_timer => channel.on_close_timeout(),
            };

            if state.is_deleted() {
                break;
            }
        }

        channel.release_stream();
        info!(state = ?channel.state(), "channel driver finished");
        channel
    }
}

fn apply(channel: &mut Channel, command: Command) -> ChannelState {
    match command {
        Command::Send {
            fin,
            opcode,
            payload,
        } => channel.send_frame(fin, opcode, payload),
        Command::Close { code, reason } => channel.start_closing_handshake(code, &reason),
        Command::ReadFrames => channel.read_frames(),
    }
}
