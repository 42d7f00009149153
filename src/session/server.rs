//! Server side of one RTMP connection
//!
//! A [`ServerSession`] runs after the handshake. Its loop waits on four
//! things at once: the next inbound message, the next frame for a playing
//! session, the idle timer and shutdown. Each iteration ends with a flush
//! of whatever the dispatch queued.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::context::SessionContext;
use super::state::{SessionPhase, SessionState};
use crate::amf::{AmfObject, AmfValue};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::chunk::ChunkMessage;
use crate::protocol::constants::*;
use crate::protocol::message::{
    status_info, unwrap_data_frame, Command, ConnectParams, ControlMessage, MessageKind,
    PlayParams, PublishParams, UserControlEvent,
};
use crate::registry::{Consumer, Frame, RegistryError, StreamBuffer};
use crate::server::context::ServerContext;
use crate::server::handler::{AuthResult, RtmpHandler};

/// Frames written per wakeup before yielding back to the loop
const MAX_BATCH: usize = 64;

/// Upper bound on the final flush when a session ends
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// What the session is attached to
enum Binding {
    None,
    Publishing(Arc<StreamBuffer>),
    Playing(Consumer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-connection state machine
pub struct ServerSession<S, H> {
    conn: Connection<S>,
    state: SessionState,
    ctx: SessionContext,
    server: Arc<ServerContext>,
    handler: Arc<H>,
    binding: Binding,
    cancel: CancellationToken,
}

impl<S, H> ServerSession<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: RtmpHandler,
{
    /// Wrap a transport whose handshake already completed
    pub fn new(
        session_id: u64,
        peer_addr: SocketAddr,
        io: S,
        server: Arc<ServerContext>,
        handler: Arc<H>,
    ) -> Self {
        let mut conn = Connection::new(io, Arc::clone(&server.pool));
        conn.set_max_message_size(server.config.max_message_size);
        let cancel = server.cancel.child_token();

        Self {
            conn,
            state: SessionState::new(session_id, peer_addr),
            ctx: SessionContext::new(session_id, peer_addr),
            server,
            handler,
            binding: Binding::None,
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    /// Run until the peer leaves, an error occurs or the server shuts down
    ///
    /// The stream binding is released on every exit path.
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        self.teardown().await;

        match result {
            Err(Error::ConnectionClosed) | Err(Error::Cancelled) => Ok(()),
            other => other,
        }
    }

    async fn serve(&mut self) -> Result<()> {
        let idle_timeout = self.server.config.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            let flow = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(session_id = self.state.id, "Session cancelled");
                    return Err(Error::Cancelled);
                }
                _ = &mut idle => {
                    tracing::info!(
                        session_id = self.state.id,
                        idle_secs = idle_timeout.as_secs(),
                        "Session idle timeout"
                    );
                    return Err(Error::Timeout("session idle"));
                }
                frame = next_frame(&self.binding) => self.deliver(frame)?,
                msg = self.conn.read_message() => self.handle_message(msg?).await?,
            };

            idle.as_mut()
                .reset(tokio::time::Instant::now() + idle_timeout);
            if self.conn.has_pending_writes() {
                self.flush().await?;
            }
            if flow == Flow::Close {
                return Ok(());
            }
        }
    }

    /// Flush queued output, giving up on shutdown or a peer that stopped reading
    async fn flush(&mut self) -> Result<()> {
        let write_timeout = self.server.config.write_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(write_timeout, self.conn.flush()) => match result {
                Ok(flushed) => flushed,
                Err(_) => {
                    tracing::warn!(
                        session_id = self.state.id,
                        timeout_secs = write_timeout.as_secs(),
                        "Peer stopped reading, closing session"
                    );
                    Err(Error::Timeout("write"))
                }
            },
        }
    }

    async fn teardown(&mut self) {
        self.state.close();

        match std::mem::replace(&mut self.binding, Binding::None) {
            Binding::Publishing(buffer) => {
                let key = buffer.key().clone();
                self.server.relays.on_unpublish(&key);
                if let Err(e) = self
                    .server
                    .registry
                    .unregister_publisher(&key, self.state.id)
                    .await
                {
                    tracing::debug!(session_id = self.state.id, error = %e, "Unregister failed");
                }
            }
            Binding::Playing(consumer) => drop(consumer),
            Binding::None => {}
        }

        self.handler.on_disconnect(&self.ctx).await;

        // Best effort: the peer may already be gone
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.conn.shutdown()).await;

        tracing::info!(
            session_id = self.state.id,
            peer = %self.state.peer_addr,
            duration_secs = self.state.duration().as_secs(),
            "Session closed"
        );
    }

    /// Write frames for a playing session
    fn deliver(&mut self, frame: Option<Frame>) -> Result<Flow> {
        let stream_id = self.state.stream_id;
        let Binding::Playing(consumer) = &self.binding else {
            return Ok(Flow::Continue);
        };

        if let Some(frame) = frame {
            self.conn.write_message(&frame.to_message(stream_id))?;
            for _ in 1..MAX_BATCH {
                let Some(frame) = consumer.try_recv() else {
                    break;
                };
                self.conn.write_message(&frame.to_message(stream_id))?;
            }
            return Ok(Flow::Continue);
        }

        if !consumer.stream_ended() {
            tracing::warn!(
                session_id = self.state.id,
                dropped = consumer.dropped(),
                "Player fell behind and was detached"
            );
            return Ok(Flow::Close);
        }

        tracing::info!(session_id = self.state.id, "Publisher ended, closing player");
        self.conn
            .write_message(&UserControlEvent::StreamEof(stream_id).into_message())?;
        self.send_status(
            stream_id,
            "status",
            NS_PLAY_UNPUBLISH_NOTIFY,
            "Stream was unpublished",
        )?;
        Ok(Flow::Close)
    }

    async fn handle_message(&mut self, msg: ChunkMessage) -> Result<Flow> {
        match MessageKind::of(msg.type_id) {
            MessageKind::ProtocolControl => {
                tracing::trace!(session_id = self.state.id, type_id = msg.type_id, "Protocol control applied");
            }
            MessageKind::UserControl => self.handle_user_control(&msg)?,
            MessageKind::Command => {
                let cmd = match Command::decode(&*self.server.codec, &msg) {
                    Ok(cmd) => cmd,
                    Err(e) if !self.state.phase.is_streaming() => return Err(e),
                    Err(e) => {
                        tracing::warn!(session_id = self.state.id, error = %e, "Undecodable command dropped");
                        return Ok(Flow::Continue);
                    }
                };
                return self.handle_command(cmd).await;
            }
            MessageKind::Data => self.handle_data(&msg),
            MessageKind::Audio => self.publish(Frame::audio(msg.timestamp, msg.payload)),
            MessageKind::Video => self.publish(Frame::video(msg.timestamp, msg.payload)),
            MessageKind::Unsupported => {
                tracing::debug!(session_id = self.state.id, type_id = msg.type_id, "Unsupported message dropped");
            }
            MessageKind::Unknown => {
                tracing::warn!(session_id = self.state.id, type_id = msg.type_id, "Unknown message type dropped");
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_user_control(&mut self, msg: &ChunkMessage) -> Result<()> {
        match UserControlEvent::parse(&msg.payload) {
            Ok(UserControlEvent::PingRequest(ts)) => {
                self.conn
                    .write_message(&UserControlEvent::PingResponse(ts).into_message())?;
            }
            Ok(event) => {
                tracing::trace!(session_id = self.state.id, event = ?event, "User control event");
            }
            Err(e) => {
                tracing::warn!(session_id = self.state.id, error = %e, "Malformed user control dropped");
            }
        }
        Ok(())
    }

    fn handle_data(&mut self, msg: &ChunkMessage) {
        if !matches!(self.binding, Binding::Publishing(_)) {
            tracing::trace!(session_id = self.state.id, "Data message before publish dropped");
            return;
        }
        match unwrap_data_frame(&*self.server.codec, msg) {
            Ok((payload, true)) => self.publish(Frame::metadata(msg.timestamp, payload)),
            Ok((payload, false)) => self.publish(Frame::data(msg.timestamp, payload)),
            Err(e) => {
                tracing::warn!(session_id = self.state.id, error = %e, "Undecodable data message dropped");
            }
        }
    }

    fn publish(&self, frame: Frame) {
        match &self.binding {
            Binding::Publishing(buffer) => buffer.publish(frame),
            _ => {
                tracing::trace!(session_id = self.state.id, kind = ?frame.kind, "Media before publish dropped");
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<Flow> {
        tracing::debug!(
            session_id = self.state.id,
            command = %cmd.name,
            transaction_id = cmd.transaction_id,
            "Command received"
        );

        let name = cmd.name.clone();
        match name.as_str() {
            CMD_CONNECT => return self.on_connect(cmd).await,
            CMD_CREATE_STREAM => self.on_create_stream(cmd)?,
            CMD_PUBLISH => self.on_publish(cmd).await?,
            CMD_PLAY => self.on_play(cmd).await?,
            CMD_DELETE_STREAM | CMD_CLOSE_STREAM => return Ok(Flow::Close),
            CMD_RELEASE_STREAM | CMD_FC_PUBLISH | CMD_FC_UNPUBLISH | CMD_CHECK_BW
            | CMD_GET_STREAM_LENGTH => {}
            other => {
                tracing::debug!(session_id = self.state.id, command = other, "Unknown command ignored");
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_connect(&mut self, cmd: Command) -> Result<Flow> {
        let tx = cmd.transaction_id;
        if self.state.phase != SessionPhase::New {
            tracing::warn!(session_id = self.state.id, phase = ?self.state.phase, "Repeated connect rejected");
            self.send_command(
                Command::error(
                    tx,
                    status_info("error", NC_CONNECT_REJECTED, "Connection already established"),
                ),
                0,
            )?;
            return Ok(Flow::Continue);
        }

        let params = ConnectParams::from_command(&cmd)?;
        self.ctx.with_connect(params.clone());

        if let AuthResult::Reject(reason) = self.handler.on_connect(&self.ctx, &params).await {
            tracing::warn!(session_id = self.state.id, app = %params.app, reason = %reason, "Connect rejected");
            self.send_command(
                Command::error(tx, status_info("error", NC_CONNECT_REJECTED, &reason)),
                0,
            )?;
            return Ok(Flow::Close);
        }

        let app = params.app.clone();
        let object_encoding = params.object_encoding;
        self.state.on_connect(params)?;

        let config = &self.server.config;
        let (window, bandwidth, chunk_size) =
            (config.window_ack_size, config.peer_bandwidth, config.chunk_size);
        self.conn
            .write_message(&ControlMessage::WindowAckSize(window).into_message())?;
        self.conn.write_message(
            &ControlMessage::SetPeerBandwidth {
                size: bandwidth,
                limit_type: 2,
            }
            .into_message(),
        )?;
        self.conn.set_chunk_size(chunk_size)?;

        let properties = AmfObject::new()
            .with("fmsVer", "FMS/3,0,1,123")
            .with("capabilities", 31.0)
            .with("mode", 1.0);
        let info = AmfObject::new()
            .with("level", "status")
            .with("code", NC_CONNECT_SUCCESS)
            .with("description", "Connection succeeded.")
            .with("objectEncoding", object_encoding);
        self.send_command(
            Command::result(tx, AmfValue::Object(properties), AmfValue::Object(info)),
            0,
        )?;

        tracing::info!(
            session_id = self.state.id,
            peer = %self.state.peer_addr,
            app = %app,
            "Client connected"
        );
        Ok(Flow::Continue)
    }

    fn on_create_stream(&mut self, cmd: Command) -> Result<()> {
        match self.state.allocate_stream_id() {
            Ok(stream_id) => {
                tracing::debug!(session_id = self.state.id, stream_id = stream_id, "Stream created");
                self.send_command(
                    Command::result(cmd.transaction_id, AmfValue::Null, AmfValue::from(stream_id)),
                    0,
                )
            }
            Err(e) => {
                tracing::warn!(session_id = self.state.id, phase = ?e.phase, "createStream refused");
                self.send_command(
                    Command::error(
                        cmd.transaction_id,
                        status_info("error", NS_FAILED, "createStream before connect"),
                    ),
                    0,
                )
            }
        }
    }

    async fn on_publish(&mut self, cmd: Command) -> Result<()> {
        let stream_id = cmd.stream_id;
        if let Err(e) = self.state.can_bind(CMD_PUBLISH) {
            tracing::warn!(session_id = self.state.id, phase = ?e.phase, "publish refused");
            return self.send_status(stream_id, "error", NS_FAILED, "publish not allowed now");
        }

        let params = PublishParams::from_command(&cmd)?;
        let key = self.ctx.stream_key(&params.stream_key);

        if let AuthResult::Reject(reason) = self.handler.on_publish(&self.ctx, &key).await {
            tracing::warn!(session_id = self.state.id, stream = %key, reason = %reason, "Publish rejected by handler");
            return self.send_status(stream_id, "error", NS_PUBLISH_REJECTED, &reason);
        }

        match self.server.registry.register_publisher(&key, self.state.id).await {
            Ok(buffer) => {
                self.server.relays.on_publish(&key, &buffer);
                self.binding = Binding::Publishing(buffer);
                self.state.on_publish(key.clone(), stream_id);
                tracing::info!(
                    session_id = self.state.id,
                    stream = %key,
                    publish_type = %params.publish_type,
                    "Publish started"
                );
                self.send_status(
                    stream_id,
                    "status",
                    NS_PUBLISH_START,
                    &format!("{} is now published", key.name),
                )
            }
            Err(RegistryError::StreamAlreadyPublishing(_)) => {
                self.send_status(stream_id, "error", NS_PUBLISH_BAD_NAME, "already publishing")
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_play(&mut self, cmd: Command) -> Result<()> {
        let stream_id = cmd.stream_id;
        if let Err(e) = self.state.can_bind(CMD_PLAY) {
            tracing::warn!(session_id = self.state.id, phase = ?e.phase, "play refused");
            return self.send_status(stream_id, "error", NS_PLAY_FAILED, "play not allowed now");
        }

        let params = PlayParams::from_command(&cmd)?;
        let key = self.ctx.stream_key(&params.stream_key);

        if let AuthResult::Reject(reason) = self.handler.on_play(&self.ctx, &key).await {
            tracing::warn!(session_id = self.state.id, stream = %key, reason = %reason, "Play rejected by handler");
            return self.send_status(stream_id, "error", NS_PLAY_FAILED, &reason);
        }

        let wait = self.server.config.play_wait;
        let subscribed = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.server.registry.subscribe(&key, wait) => result,
        };

        match subscribed {
            Ok(consumer) => {
                self.conn
                    .write_message(&UserControlEvent::StreamBegin(stream_id).into_message())?;
                if params.reset {
                    self.send_status(
                        stream_id,
                        "status",
                        NS_PLAY_RESET,
                        &format!("Playing and resetting {}", key.name),
                    )?;
                }
                self.send_status(
                    stream_id,
                    "status",
                    NS_PLAY_START,
                    &format!("Started playing {}", key.name),
                )?;

                tracing::info!(
                    session_id = self.state.id,
                    stream = %key,
                    consumer_id = consumer.id(),
                    "Play started"
                );
                self.binding = Binding::Playing(consumer);
                self.state.on_play(key, stream_id);
                Ok(())
            }
            Err(RegistryError::StreamNotFound(_)) | Err(RegistryError::StreamClosed(_)) => {
                tracing::debug!(session_id = self.state.id, stream = %key, "Play for unknown stream");
                self.send_status(
                    stream_id,
                    "error",
                    NS_PLAY_STREAM_NOT_FOUND,
                    &format!("{} not found", key.name),
                )
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send_command(&mut self, cmd: Command, stream_id: u32) -> Result<()> {
        let msg = cmd.into_message(&*self.server.codec, stream_id);
        self.conn.write_message(&msg)
    }

    fn send_status(&mut self, stream_id: u32, level: &str, code: &str, description: &str) -> Result<()> {
        self.send_command(Command::on_status(level, code, description), stream_id)
    }
}

/// Next frame for a playing session; never resolves otherwise
async fn next_frame(binding: &Binding) -> Option<Frame> {
    match binding {
        Binding::Playing(consumer) => consumer.recv().await,
        _ => std::future::pending().await,
    }
}
