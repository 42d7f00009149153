//! Message-level transport over one duplex byte stream
//!
//! [`Connection`] owns the socket, the chunk decoder and encoder, and the
//! acknowledgement window bookkeeping. Protocol control messages from the
//! peer are applied here before the next chunk is parsed, so the session
//! layer only ever sees their effect.
//!
//! Both `read_message` and `flush` are cancel-safe: all progress lives in
//! the connection's buffers, never in a suspended future. Sessions rely on
//! this to `select!` between the socket and a consumer queue.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, ChunkMessage};
use crate::protocol::constants::DEFAULT_WINDOW_ACK_SIZE;
use crate::protocol::message::ControlMessage;
use crate::protocol::pool::BufferPool;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// One RTMP connection after the handshake
pub struct Connection<S> {
    io: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    /// Window the peer asked us to acknowledge by
    remote_window: u32,
    /// Bytes received since the last Acknowledgement we sent
    unacked: u32,
    /// Total bytes received, wrapping, sent as the ack sequence number
    sequence: u32,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, pool: Arc<BufferPool>) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            decoder: ChunkDecoder::new(pool),
            encoder: ChunkEncoder::new(),
            remote_window: DEFAULT_WINDOW_ACK_SIZE,
            unacked: 0,
            sequence: 0,
        }
    }

    /// Read the next complete message
    ///
    /// Protocol control messages are applied and then returned as well, so
    /// callers can log them. A malformed one is an error.
    pub async fn read_message(&mut self) -> Result<ChunkMessage> {
        loop {
            if let Some(msg) = self.decoder.decode(&mut self.read_buf)? {
                if let Some(control) = ControlMessage::parse(msg.type_id, &msg.payload)? {
                    self.apply_control(control)?;
                }
                return Ok(msg);
            }

            if self.read_buf.capacity() - self.read_buf.len() < 4096 {
                self.read_buf.reserve(READ_BUFFER_SIZE);
            }
            let n = self.io.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.ack(n as u32);
        }
    }

    fn apply_control(&mut self, control: ControlMessage) -> Result<()> {
        match control {
            ControlMessage::SetChunkSize(size) => self.decoder.set_chunk_size(size)?,
            ControlMessage::WindowAckSize(size) => {
                tracing::debug!(window = size, "Peer window acknowledgement size");
                self.remote_window = size;
            }
            ControlMessage::Abort(csid) => self.decoder.abort(csid),
            ControlMessage::Acknowledgement(sequence) => {
                tracing::trace!(sequence = sequence, "Peer acknowledgement");
            }
            ControlMessage::SetPeerBandwidth { size, limit_type } => {
                tracing::trace!(size = size, limit_type = limit_type, "Peer bandwidth");
            }
        }
        Ok(())
    }

    /// Count `n` received bytes, queueing an Acknowledgement once the
    /// peer's window is exceeded
    pub fn ack(&mut self, n: u32) {
        self.sequence = self.sequence.wrapping_add(n);
        self.unacked = self.unacked.saturating_add(n);

        if self.remote_window > 0 && self.unacked > self.remote_window {
            let ack = ControlMessage::Acknowledgement(self.sequence).into_message();
            // Control messages are far below the maximum message size
            if self.encoder.encode(&ack, &mut self.write_buf).is_ok() {
                tracing::trace!(sequence = self.sequence, "Acknowledgement queued");
            }
            self.unacked = 0;
        }
    }

    /// Serialize a message into the output buffer; sent on [`flush`](Self::flush)
    pub fn write_message(&mut self, msg: &ChunkMessage) -> Result<()> {
        self.encoder.encode(msg, &mut self.write_buf)?;
        Ok(())
    }

    /// Write all buffered output to the socket
    pub async fn flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            let n = self.io.write_buf(&mut self.write_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Whether output is waiting for a flush
    pub fn has_pending_writes(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Announce and switch to a new outbound chunk size
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        self.write_message(&ControlMessage::SetChunkSize(size).into_message())?;
        self.encoder.set_chunk_size(size)?;
        Ok(())
    }

    pub fn in_chunk_size(&self) -> u32 {
        self.decoder.chunk_size()
    }

    pub fn out_chunk_size(&self) -> u32 {
        self.encoder.chunk_size()
    }

    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    /// Total bytes received (the acknowledgement sequence number)
    pub fn bytes_received(&self) -> u32 {
        self.sequence
    }

    /// Limit the message length accepted from the peer
    pub fn set_max_message_size(&mut self, size: u32) {
        self.decoder.set_max_message_size(size);
    }

    /// Flush and shut down the write half
    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        self.io.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::error::ProtocolError;
    use crate::protocol::constants::*;

    fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let pool = Arc::new(BufferPool::new());
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::new(a, Arc::clone(&pool)),
            Connection::new(b, pool),
        )
    }

    fn audio(len: usize, ts: u32) -> ChunkMessage {
        ChunkMessage::new(CSID_AUDIO, MSG_AUDIO, 1, ts, Bytes::from(vec![0xAF; len]))
    }

    #[tokio::test]
    async fn test_write_flush_read() {
        let (mut client, mut server) = pair();

        client.write_message(&audio(300, 10)).unwrap();
        assert!(client.has_pending_writes());
        client.flush().await.unwrap();
        assert!(!client.has_pending_writes());

        let msg = server.read_message().await.unwrap();
        assert_eq!(msg.type_id, MSG_AUDIO);
        assert_eq!(msg.timestamp, 10);
        assert_eq!(msg.payload.len(), 300);
        assert_eq!(server.bytes_received(), 1 + 11 + 300 + 2);
    }

    #[tokio::test]
    async fn test_peer_chunk_size_applied_before_next_message() {
        let (mut client, mut server) = pair();

        client.set_chunk_size(4096).unwrap();
        client.write_message(&audio(3000, 0)).unwrap();
        client.flush().await.unwrap();

        let first = server.read_message().await.unwrap();
        assert_eq!(first.type_id, MSG_SET_CHUNK_SIZE);
        assert_eq!(server.in_chunk_size(), 4096);

        let second = server.read_message().await.unwrap();
        assert_eq!(second.payload.len(), 3000);
        assert_eq!(client.out_chunk_size(), 4096);
    }

    #[tokio::test]
    async fn test_ack_after_window_exceeded() {
        let (mut client, mut server) = pair();

        client
            .write_message(&ControlMessage::WindowAckSize(500).into_message())
            .unwrap();
        client.flush().await.unwrap();
        server.read_message().await.unwrap();
        assert_eq!(server.remote_window(), 500);
        assert!(!server.has_pending_writes());

        client.write_message(&audio(600, 0)).unwrap();
        client.flush().await.unwrap();
        server.read_message().await.unwrap();
        assert!(server.has_pending_writes());
        server.flush().await.unwrap();

        let ack = client.read_message().await.unwrap();
        assert_eq!(ack.type_id, MSG_ACKNOWLEDGEMENT);
        match ControlMessage::parse(ack.type_id, &ack.payload).unwrap() {
            Some(ControlMessage::Acknowledgement(sequence)) => {
                assert!(sequence > 500);
                assert!(sequence <= server.bytes_received());
            }
            other => panic!("expected acknowledgement, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ack_counter_resets() {
        let (_client, mut server) = pair();
        server.remote_window = 100;

        server.ack(60);
        assert!(!server.has_pending_writes());
        server.ack(60);
        assert!(server.has_pending_writes());
        assert_eq!(server.unacked, 0);
        assert_eq!(server.bytes_received(), 120);
    }

    #[tokio::test]
    async fn test_malformed_control_is_fatal() {
        // SetChunkSize with a 2-byte payload
        let wire = [0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00];
        let io = tokio_test::io::Builder::new().read(&wire).build();
        let mut conn = Connection::new(io, Arc::new(BufferPool::new()));

        assert!(matches!(
            conn.read_message().await,
            Err(Error::Protocol(ProtocolError::MalformedControl { .. }))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (client, mut server) = pair();
        drop(client);
        assert!(matches!(
            server.read_message().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_is_cancel_safe() {
        let (mut client, mut server) = pair();

        let mut wire = BytesMut::new();
        ChunkEncoder::new().encode(&audio(300, 7), &mut wire).unwrap();
        let tail = wire.split_off(100);

        // Half a message, then a cancelled read
        client.io.write_all(&wire).await.unwrap();
        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            server.read_message(),
        )
        .await;
        assert!(cancelled.is_err());

        client.io.write_all(&tail).await.unwrap();
        let msg = server.read_message().await.unwrap();
        assert_eq!(msg.timestamp, 7);
        assert_eq!(msg.payload.len(), 300);
    }
}
