//! Frame transport over a tokio byte stream
//!
//! Reading and writing happen on two background tasks. The channel's
//! `read_frames`/`write_frames` calls only enqueue a request and return
//! [`IoPoll::Pending`]; each request produces exactly one [`Completion`],
//! which the owner hands back to the channel.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use wschannel_core::error::ConfigError;
use wschannel_core::{Error, Frame, FrameDecoder, IoPoll, Result, Stream, StreamError};

pub use wschannel_core::protocol::constants::DEFAULT_MAX_PAYLOAD_LEN;

/// Default number of bytes reserved for each socket read
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Result of a transport operation that returned [`IoPoll::Pending`]
#[derive(Debug)]
pub enum Completion {
    /// Pass to [`Channel::on_read_done`](wschannel_core::Channel::on_read_done)
    Read(std::result::Result<Vec<Frame>, StreamError>),
    /// Pass to [`Channel::on_write_done`](wschannel_core::Channel::on_write_done)
    Write(std::result::Result<(), StreamError>),
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokioStreamConfig {
    /// Largest payload accepted from the peer
    pub max_payload_len: u64,
    /// Bytes reserved for each socket read
    pub read_buffer_size: usize,
}

impl Default for TokioStreamConfig {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl TokioStreamConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_len == 0 {
            return Err(Error::Config(ConfigError::Validation(
                "max_payload_len must be greater than 0".to_string(),
            )));
        }

        if self.read_buffer_size == 0 {
            return Err(Error::Config(ConfigError::InvalidValue {
                field: "read_buffer_size".to_string(),
                value: self.read_buffer_size.to_string(),
            }));
        }

        Ok(())
    }

    /// Set the largest accepted payload
    pub fn max_payload_len(mut self, len: u64) -> Self {
        self.max_payload_len = len;
        self
    }

    /// Set the read buffer size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}

/// A [`Stream`] backed by an upgraded tokio connection
#[derive(Debug)]
pub struct TokioStream {
    read_requests: mpsc::UnboundedSender<()>,
    /// Dropped on close; the writer flushes what is queued and shuts down
    write_requests: Option<mpsc::UnboundedSender<Vec<Frame>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    sub_protocol: String,
    extensions: String,
}

impl TokioStream {
    /// Start the background tasks for `io`. Must be called inside a tokio
    /// runtime.
    ///
    /// Returns the transport and the receiver its completions arrive on.
    pub fn spawn<S>(
        io: S,
        sub_protocol: impl Into<String>,
        extensions: impl Into<String>,
        config: TokioStreamConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Completion>)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (read_half, write_half) = tokio::io::split(io);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(read_half, read_rx, completion_tx.clone(), config));
        let writer = tokio::spawn(write_loop(write_half, write_rx, completion_tx));

        let stream = Self {
            read_requests: read_tx,
            write_requests: Some(write_tx),
            reader,
            writer,
            sub_protocol: sub_protocol.into(),
            extensions: extensions.into(),
        };
        Ok((stream, completion_rx))
    }
}

impl Stream for TokioStream {
    fn read_frames(&mut self) -> IoPoll<Vec<Frame>> {
        if self.read_requests.send(()).is_err() {
            return IoPoll::Ready(Err(StreamError::ConnectionClosed));
        }
        IoPoll::Pending
    }

    fn write_frames(&mut self, frames: Vec<Frame>) -> IoPoll<()> {
        match &self.write_requests {
            Some(requests) if requests.send(frames).is_ok() => IoPoll::Pending,
            _ => IoPoll::Ready(Err(StreamError::ConnectionClosed)),
        }
    }

    /// Stop reading at once. Frames already handed to the writer, such as a
    /// final Close, are still flushed before the write side shuts down.
    fn close(&mut self) {
        debug!(writer_finished = self.writer.is_finished(), "closing transport");
        self.reader.abort();
        self.write_requests = None;
    }

    fn sub_protocol(&self) -> &str {
        &self.sub_protocol
    }

    fn extensions(&self) -> &str {
        &self.extensions
    }
}

impl Drop for TokioStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    mut reader: R,
    mut requests: mpsc::UnboundedReceiver<()>,
    completions: mpsc::UnboundedSender<Completion>,
    config: TokioStreamConfig,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(config.max_payload_len);
    while requests.recv().await.is_some() {
        let result = read_batch(&mut reader, &mut decoder, config.read_buffer_size).await;
        let finished = result.is_err();
        if completions.send(Completion::Read(result)).is_err() || finished {
            break;
        }
    }
    trace!("read loop finished");
}

/// Read until at least one whole frame is buffered.
async fn read_batch<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    read_buffer_size: usize,
) -> std::result::Result<Vec<Frame>, StreamError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frames = decoder.decode_all()?;
        if !frames.is_empty() {
            trace!(frames = frames.len(), "decoded frames");
            return Ok(frames);
        }

        let buffer = decoder.buffer_mut();
        buffer.reserve(read_buffer_size);
        if reader.read_buf(buffer).await? == 0 {
            debug!(
                buffered = decoder.buffered_bytes(),
                "peer closed the connection"
            );
            return Err(StreamError::ConnectionClosed);
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut requests: mpsc::UnboundedReceiver<Vec<Frame>>,
    completions: mpsc::UnboundedSender<Completion>,
) where
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::new();
    while let Some(frames) = requests.recv().await {
        buffer.clear();
        for frame in &frames {
            frame.write_to(&mut buffer);
        }
        trace!(frames = frames.len(), bytes = buffer.len(), "writing frames");

        let result = write_batch(&mut writer, &buffer).await;
        let failed = result.is_err();
        if completions.send(Completion::Write(result)).is_err() || failed {
            break;
        }
    }
    let _ = writer.shutdown().await;
    trace!("write loop finished");
}

async fn write_batch<W>(writer: &mut W, data: &[u8]) -> std::result::Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wschannel_core::Opcode;

    #[test]
    fn test_tokio_stream_config_validation() {
        assert!(TokioStreamConfig::default().validate().is_ok());
        assert!(TokioStreamConfig::default()
            .max_payload_len(0)
            .validate()
            .is_err());
        assert!(TokioStreamConfig::default()
            .read_buffer_size(0)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_read_decodes_frames_then_reports_close() {
        let mut wire = Frame::text("hel").fin(false).to_bytes().to_vec();
        wire.extend_from_slice(&Frame::continuation("lo").to_bytes());
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(&wire).await.unwrap();
        drop(server);

        let (mut stream, mut completions) =
            TokioStream::spawn(client, "", "", TokioStreamConfig::default()).unwrap();

        assert!(matches!(stream.read_frames(), IoPoll::Pending));
        match completions.recv().await.unwrap() {
            Completion::Read(Ok(frames)) => {
                assert_eq!(frames.len(), 2);
                assert_eq!(frames[0].opcode, Opcode::Text);
                assert!(!frames[0].fin);
                assert_eq!(&frames[1].payload[..], b"lo");
            }
            other => panic!("unexpected completion: {other:?}"),
        }

        assert!(matches!(stream.read_frames(), IoPoll::Pending));
        assert!(matches!(
            completions.recv().await.unwrap(),
            Completion::Read(Err(StreamError::ConnectionClosed))
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_a_protocol_error() {
        let wire = Frame::binary(vec![0u8; 32]).to_bytes();
        let io = tokio_test::io::Builder::new().read(&wire).build();

        let config = TokioStreamConfig::default().max_payload_len(16);
        let (mut stream, mut completions) = TokioStream::spawn(io, "", "", config).unwrap();

        assert!(matches!(stream.read_frames(), IoPoll::Pending));
        assert!(matches!(
            completions.recv().await.unwrap(),
            Completion::Read(Err(StreamError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn test_write_encodes_masked_frames() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut stream, mut completions) =
            TokioStream::spawn(client, "chat", "", TokioStreamConfig::default()).unwrap();
        assert_eq!(stream.sub_protocol(), "chat");

        let frames = vec![
            Frame::text("hi").masked(true),
            Frame::ping("p").masked(true),
        ];
        assert!(matches!(stream.write_frames(frames), IoPoll::Pending));
        assert!(matches!(
            completions.recv().await.unwrap(),
            Completion::Write(Ok(()))
        ));

        let (mut server_read, _server_write) = tokio::io::split(server);
        let mut decoder = FrameDecoder::default();
        let mut received = Vec::new();
        while received.len() < 2 {
            let mut chunk = [0u8; 256];
            let n = server_read.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            decoder.feed(&chunk[..n]);
            received.extend(decoder.decode_all().unwrap());
        }

        assert!(received.iter().all(|frame| frame.masked));
        assert_eq!(&received[0].payload[..], b"hi");
        assert_eq!(received[1].opcode, Opcode::Ping);
    }
}
