//! Outbound RTMP connection
//!
//! Drives the client side of a session:
//!
//! ```text
//! TCP connect → handshake → connect → createStream → publish | play
//! ```
//!
//! After `publish` the connector sends frames; after `play` it reads them.
//! Relays use it to re-publish a local stream to a remote server.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::config::ClientConfig;
use crate::addr::Addr;
use crate::amf::{Amf0Codec, AmfValue};
use crate::connection::Connection;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::chunk::ChunkMessage;
use crate::protocol::constants::*;
use crate::protocol::handshake;
use crate::protocol::message::{
    unwrap_data_frame, Command, ConnectParams, MessageKind, UserControlEvent,
};
use crate::protocol::pool::BufferPool;
use crate::registry::Frame;

/// Status reported by the server in `onStatus`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub level: String,
    pub code: String,
    pub description: String,
}

impl Status {
    fn from_command(cmd: &Command) -> Self {
        let info = cmd.arguments.first();
        let field = |key: &str| {
            info.and_then(|v| v.get_string(key))
                .unwrap_or_default()
                .to_string()
        };
        Self {
            level: field("level"),
            code: field("code"),
            description: field("description"),
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == "error"
    }
}

/// Client connection to a remote RTMP server
pub struct RtmpConnector<S = TcpStream> {
    conn: Connection<S>,
    addr: Addr,
    config: ClientConfig,
    codec: Amf0Codec,
    /// Message stream from createStream
    stream_id: u32,
    next_transaction: f64,
}

impl RtmpConnector<TcpStream> {
    /// Dial `addr` and run the handshake, connect and createStream
    pub async fn dial(addr: &Addr, config: ClientConfig, pool: Arc<BufferPool>) -> Result<Self> {
        let socket = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr.host()))
            .await
            .map_err(|_| Error::Timeout("tcp connect"))??;
        socket.set_nodelay(config.tcp_nodelay)?;

        tracing::debug!(addr = %addr, "Connected to remote server");
        Self::establish(socket, addr.clone(), config, pool).await
    }
}

impl<S> RtmpConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake, connect and createStream over an open transport
    pub async fn establish(
        mut io: S,
        addr: Addr,
        config: ClientConfig,
        pool: Arc<BufferPool>,
    ) -> Result<Self> {
        tokio::time::timeout(config.connect_timeout, handshake::initiate(&mut io))
            .await
            .map_err(|_| Error::Timeout("handshake"))??;

        let mut connector = Self {
            conn: Connection::new(io, pool),
            addr,
            config,
            codec: Amf0Codec,
            stream_id: 0,
            next_transaction: 1.0,
        };
        connector.conn.set_chunk_size(connector.config.chunk_size)?;
        connector.connect().await?;
        connector.create_stream().await?;
        Ok(connector)
    }

    async fn connect(&mut self) -> Result<()> {
        let params = ConnectParams {
            app: self.addr.app().to_string(),
            tc_url: Some(self.addr.tc_url()),
            flash_ver: Some(self.config.flash_ver.clone()),
            ..ConnectParams::default()
        };
        let tx = self.transaction();
        self.send_command(Command::new(CMD_CONNECT, tx, params.to_object()), 0)?;
        self.flush().await?;

        let reply = self.await_reply(tx).await?;
        if reply.name != CMD_RESULT {
            return Err(ProtocolError::Rejected(Status::from_command(&reply).code).into());
        }
        tracing::debug!(addr = %self.addr, "Connect accepted");
        Ok(())
    }

    async fn create_stream(&mut self) -> Result<()> {
        let tx = self.transaction();
        self.send_command(Command::new(CMD_CREATE_STREAM, tx, AmfValue::Null), 0)?;
        self.flush().await?;

        let reply = self.await_reply(tx).await?;
        match reply.arguments.first().and_then(AmfValue::as_number) {
            Some(id) if reply.name == CMD_RESULT => {
                self.stream_id = id as u32;
                Ok(())
            }
            _ => Err(ProtocolError::Rejected(format!("{} to createStream", reply.name)).into()),
        }
    }

    /// Start publishing `name`; resolves on `NetStream.Publish.Start`
    pub async fn publish(&mut self, name: &str) -> Result<()> {
        let tx = self.transaction();
        self.send_command(
            Command::new(CMD_RELEASE_STREAM, tx, AmfValue::Null).arg(name),
            0,
        )?;
        let tx = self.transaction();
        self.send_command(Command::new(CMD_FC_PUBLISH, tx, AmfValue::Null).arg(name), 0)?;
        self.send_command(
            Command::new(CMD_PUBLISH, 0.0, AmfValue::Null)
                .arg(name)
                .arg("live"),
            self.stream_id,
        )?;
        self.flush().await?;

        let status = self.await_status(NS_PUBLISH_START).await?;
        tracing::info!(addr = %self.addr, stream = name, code = %status.code, "Publishing to remote");
        Ok(())
    }

    /// Start playing `name`; resolves on `NetStream.Play.Start`
    pub async fn play(&mut self, name: &str) -> Result<()> {
        self.send_command(
            Command::new(CMD_PLAY, 0.0, AmfValue::Null)
                .arg(name)
                .arg(-2.0),
            self.stream_id,
        )?;
        self.flush().await?;

        self.await_status(NS_PLAY_START).await?;
        tracing::debug!(addr = %self.addr, stream = name, "Playing from remote");
        Ok(())
    }

    /// Queue a frame on the publish stream
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.conn.write_message(&frame.to_message(self.stream_id))
    }

    /// Send one frame immediately
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_frame(frame)?;
        self.flush().await
    }

    /// Send queued output; fails with `Timeout` if the server stops reading
    pub async fn flush(&mut self) -> Result<()> {
        tokio::time::timeout(self.config.write_timeout, self.conn.flush())
            .await
            .map_err(|_| Error::Timeout("write"))?
    }

    /// Read the next raw message; cancel-safe
    pub async fn read_message(&mut self) -> Result<ChunkMessage> {
        self.conn.read_message().await
    }

    /// Answer pings and log anything else the server sends
    pub fn handle_incoming(&mut self, msg: &ChunkMessage) -> Result<()> {
        match MessageKind::of(msg.type_id) {
            MessageKind::UserControl => {
                if let Ok(UserControlEvent::PingRequest(ts)) = UserControlEvent::parse(&msg.payload) {
                    self.conn
                        .write_message(&UserControlEvent::PingResponse(ts).into_message())?;
                }
            }
            MessageKind::Command => {
                if let Ok(cmd) = Command::decode(&self.codec, msg) {
                    tracing::debug!(addr = %self.addr, command = %cmd.name, "Command from remote");
                }
            }
            _ => {
                tracing::trace!(addr = %self.addr, type_id = msg.type_id, "Message from remote ignored");
            }
        }
        Ok(())
    }

    /// Next media or data frame while playing
    ///
    /// Returns `None` once the server reports the stream unpublished.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let msg = self.conn.read_message().await?;
            let frame = match MessageKind::of(msg.type_id) {
                MessageKind::Audio => Frame::audio(msg.timestamp, msg.payload),
                MessageKind::Video => Frame::video(msg.timestamp, msg.payload),
                MessageKind::Data => match unwrap_data_frame(&self.codec, &msg)? {
                    (payload, true) => Frame::metadata(msg.timestamp, payload),
                    (payload, false) => Frame::data(msg.timestamp, payload),
                },
                MessageKind::Command => {
                    let cmd = Command::decode(&self.codec, &msg)?;
                    if cmd.name == CMD_ON_STATUS
                        && Status::from_command(&cmd).code == NS_PLAY_UNPUBLISH_NOTIFY
                    {
                        return Ok(None);
                    }
                    continue;
                }
                _ => {
                    self.handle_incoming(&msg)?;
                    self.flush_pending().await?;
                    continue;
                }
            };
            self.flush_pending().await?;
            return Ok(Some(frame));
        }
    }

    /// Send deleteStream and close the transport
    pub async fn close(mut self) -> Result<()> {
        let tx = self.transaction();
        self.send_command(
            Command::new(CMD_DELETE_STREAM, tx, AmfValue::Null).arg(self.stream_id),
            0,
        )?;
        tokio::time::timeout(self.config.write_timeout, self.conn.shutdown())
            .await
            .map_err(|_| Error::Timeout("write"))?
    }

    /// Message stream assigned by the server
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    fn transaction(&mut self) -> f64 {
        let tx = self.next_transaction;
        self.next_transaction += 1.0;
        tx
    }

    fn send_command(&mut self, cmd: Command, stream_id: u32) -> Result<()> {
        let msg = cmd.into_message(&self.codec, stream_id);
        self.conn.write_message(&msg)
    }

    async fn flush_pending(&mut self) -> Result<()> {
        if self.conn.has_pending_writes() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Next command, answering pings on the way
    async fn next_command(&mut self) -> Result<Command> {
        loop {
            let msg = self.conn.read_message().await?;
            if MessageKind::of(msg.type_id) == MessageKind::Command {
                return Command::decode(&self.codec, &msg);
            }
            self.handle_incoming(&msg)?;
            self.flush_pending().await?;
        }
    }

    /// `_result` or `_error` for transaction `tx`
    async fn await_reply(&mut self, tx: f64) -> Result<Command> {
        let timeout = self.config.command_timeout;
        tokio::time::timeout(timeout, self.next_reply(tx))
            .await
            .map_err(|_| Error::Timeout("command reply"))?
    }

    async fn next_reply(&mut self, tx: f64) -> Result<Command> {
        loop {
            let cmd = self.next_command().await?;
            if (cmd.name == CMD_RESULT || cmd.name == CMD_ERROR) && cmd.transaction_id == tx {
                return Ok(cmd);
            }
            tracing::trace!(command = %cmd.name, "Command skipped while awaiting reply");
        }
    }

    /// `onStatus` with `code`; an error-level status fails
    async fn await_status(&mut self, code: &str) -> Result<Status> {
        let timeout = self.config.command_timeout;
        tokio::time::timeout(timeout, self.next_status(code))
            .await
            .map_err(|_| Error::Timeout("status"))?
    }

    async fn next_status(&mut self, code: &str) -> Result<Status> {
        loop {
            let cmd = self.next_command().await?;
            if cmd.name == CMD_ERROR {
                return Err(ProtocolError::Rejected(Status::from_command(&cmd).code).into());
            }
            if cmd.name != CMD_ON_STATUS {
                continue;
            }
            let status = Status::from_command(&cmd);
            if status.is_error() {
                return Err(ProtocolError::Rejected(status.code).into());
            }
            if status.code == code {
                return Ok(status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::protocol::message::status_info;
    use crate::server::{AcceptAll, ServerConfig, ServerContext};
    use crate::session::ServerSession;

    #[test]
    fn test_status_from_command() {
        let cmd = Command::on_status("error", NS_PUBLISH_BAD_NAME, "already publishing");
        let status = Status::from_command(&cmd);
        assert!(status.is_error());
        assert_eq!(status.code, NS_PUBLISH_BAD_NAME);
        assert_eq!(status.description, "already publishing");

        let reply = Command::error(1.0, status_info("error", NC_CONNECT_REJECTED, "no"));
        assert_eq!(Status::from_command(&reply).code, NC_CONNECT_REJECTED);
    }

    #[tokio::test]
    async fn test_handshake_failure_surfaces() {
        // Server answers with version 1
        let mut s0s1s2 = vec![1u8];
        s0s1s2.extend(std::iter::repeat(0).take(HANDSHAKE_SIZE * 2));
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut c0c1 = vec![0u8; HANDSHAKE_SIZE + 1];
            server.read_exact(&mut c0c1).await.unwrap();
            server.write_all(&s0s1s2).await.unwrap();
        });

        let addr = Addr::parse("rtmp://localhost/live/key").unwrap();
        let result = RtmpConnector::establish(
            client,
            addr,
            ClientConfig::default(),
            Arc::new(BufferPool::new()),
        )
        .await;
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn test_flush_times_out_when_server_stops_reading() {
        let ctx = Arc::new(ServerContext::new(ServerConfig::default()));
        let (client, relay) = tokio::io::duplex(4096);
        let (pipe, mut server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            handshake::accept(&mut server_io).await?;
            let peer = "127.0.0.1:40000".parse().unwrap();
            ServerSession::new(1, peer, server_io, ctx, Arc::new(AcceptAll))
                .run()
                .await
        });

        // Carry bytes both ways until told to stop reading from the client
        let (mut relay_read, mut relay_write) = tokio::io::split(relay);
        let (mut pipe_read, mut pipe_write) = tokio::io::split(pipe);
        let (stall_tx, stall_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                _ = stall_rx => {}
                _ = tokio::io::copy(&mut relay_read, &mut pipe_write) => {}
            }
            std::future::pending::<()>().await;
        });
        tokio::spawn(async move { tokio::io::copy(&mut pipe_read, &mut relay_write).await });

        let config = ClientConfig::default().write_timeout(Duration::from_millis(200));
        let addr = Addr::parse("rtmp://localhost/live/test").unwrap();
        let mut publisher = RtmpConnector::establish(client, addr, config, Arc::new(BufferPool::new()))
            .await
            .unwrap();
        publisher.publish("test").await.unwrap();
        stall_tx.send(()).unwrap();

        let frame = Frame::video(0, Bytes::from(vec![0x27; 2000]));
        let result = tokio::time::timeout(Duration::from_secs(3), async {
            for _ in 0..1000 {
                publisher.send_frame(&frame).await?;
            }
            Ok::<(), Error>(())
        })
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Timeout("write"))));
    }
}
