//! RTMP message types
//!
//! Turns reassembled [`ChunkMessage`]s into typed protocol-control, user
//! control and command messages, and builds the outgoing ones.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::chunk::ChunkMessage;
use super::constants::*;
use crate::amf::{AmfObject, AmfValue, CommandCodec};
use crate::error::{Error, ProtocolError};

/// Coarse classification of a message by type ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// SetChunkSize, Abort, Acknowledgement, WindowAckSize, SetPeerBandwidth
    ProtocolControl,
    UserControl,
    /// AMF0 or AMF3-wrapped command
    Command,
    /// AMF0 or AMF3-wrapped data (metadata)
    Data,
    Audio,
    Video,
    /// Shared object and aggregate messages
    Unsupported,
    Unknown,
}

impl MessageKind {
    pub fn of(type_id: u8) -> Self {
        match type_id {
            MSG_SET_CHUNK_SIZE | MSG_ABORT | MSG_ACKNOWLEDGEMENT | MSG_WINDOW_ACK_SIZE
            | MSG_SET_PEER_BANDWIDTH => MessageKind::ProtocolControl,
            MSG_USER_CONTROL => MessageKind::UserControl,
            MSG_COMMAND_AMF0 | MSG_COMMAND_AMF3 => MessageKind::Command,
            MSG_DATA_AMF0 | MSG_DATA_AMF3 => MessageKind::Data,
            MSG_AUDIO => MessageKind::Audio,
            MSG_VIDEO => MessageKind::Video,
            MSG_SHARED_OBJECT_AMF0 | MSG_SHARED_OBJECT_AMF3 | MSG_AGGREGATE => {
                MessageKind::Unsupported
            }
            _ => MessageKind::Unknown,
        }
    }
}

/// AMF body of a command or data message
///
/// AMF3-flagged messages carry one format byte before the AMF0 values.
pub fn amf_body(msg: &ChunkMessage) -> &[u8] {
    match msg.type_id {
        MSG_COMMAND_AMF3 | MSG_DATA_AMF3 if !msg.payload.is_empty() => &msg.payload[1..],
        _ => &msg.payload,
    }
}

/// Protocol control messages (types 1, 2, 3, 5, 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    SetChunkSize(u32),
    Abort(u32),
    Acknowledgement(u32),
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit_type: u8 },
}

impl ControlMessage {
    /// Parse a protocol control payload
    ///
    /// Returns `Ok(None)` if `type_id` is not a protocol control type.
    pub fn parse(type_id: u8, payload: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let (kind, min_len) = match type_id {
            MSG_SET_CHUNK_SIZE => ("SetChunkSize", 4),
            MSG_ABORT => ("Abort", 4),
            MSG_ACKNOWLEDGEMENT => ("Acknowledgement", 4),
            MSG_WINDOW_ACK_SIZE => ("WindowAckSize", 4),
            MSG_SET_PEER_BANDWIDTH => ("SetPeerBandwidth", 5),
            _ => return Ok(None),
        };
        if payload.len() < min_len {
            return Err(ProtocolError::MalformedControl {
                kind,
                len: payload.len(),
            });
        }

        let mut buf = payload;
        let value = buf.get_u32();
        let msg = match type_id {
            MSG_SET_CHUNK_SIZE => {
                // High bit is reserved and must be ignored
                let size = value & MAX_CHUNK_SIZE;
                if size == 0 {
                    return Err(ProtocolError::InvalidChunkSize(size));
                }
                ControlMessage::SetChunkSize(size)
            }
            MSG_ABORT => ControlMessage::Abort(value),
            MSG_ACKNOWLEDGEMENT => ControlMessage::Acknowledgement(value),
            MSG_WINDOW_ACK_SIZE => ControlMessage::WindowAckSize(value),
            _ => ControlMessage::SetPeerBandwidth {
                size: value,
                limit_type: buf.get_u8(),
            },
        };
        Ok(Some(msg))
    }

    pub fn type_id(&self) -> u8 {
        match self {
            ControlMessage::SetChunkSize(_) => MSG_SET_CHUNK_SIZE,
            ControlMessage::Abort(_) => MSG_ABORT,
            ControlMessage::Acknowledgement(_) => MSG_ACKNOWLEDGEMENT,
            ControlMessage::WindowAckSize(_) => MSG_WINDOW_ACK_SIZE,
            ControlMessage::SetPeerBandwidth { .. } => MSG_SET_PEER_BANDWIDTH,
        }
    }

    /// Wrap into a message on the protocol control chunk stream
    pub fn into_message(self) -> ChunkMessage {
        let mut buf = BytesMut::with_capacity(5);
        match self {
            ControlMessage::SetChunkSize(v)
            | ControlMessage::Abort(v)
            | ControlMessage::Acknowledgement(v)
            | ControlMessage::WindowAckSize(v) => buf.put_u32(v),
            ControlMessage::SetPeerBandwidth { size, limit_type } => {
                buf.put_u32(size);
                buf.put_u8(limit_type);
            }
        }
        ChunkMessage::new(CSID_PROTOCOL_CONTROL, self.type_id(), 0, 0, buf.freeze())
    }
}

/// User control events (type 4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    PingRequest(u32),
    PingResponse(u32),
    Other { event_type: u16, data: Bytes },
}

impl UserControlEvent {
    pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedControl {
            kind: "UserControl",
            len: payload.len(),
        };
        if payload.len() < 2 {
            return Err(malformed());
        }

        let mut buf = payload.clone();
        let event_type = buf.get_u16();
        let needs = match event_type {
            UC_SET_BUFFER_LENGTH => 8,
            UC_STREAM_BEGIN | UC_STREAM_EOF | UC_PING_REQUEST | UC_PING_RESPONSE => 4,
            _ => 0,
        };
        if buf.remaining() < needs {
            return Err(malformed());
        }

        Ok(match event_type {
            UC_STREAM_BEGIN => UserControlEvent::StreamBegin(buf.get_u32()),
            UC_STREAM_EOF => UserControlEvent::StreamEof(buf.get_u32()),
            UC_SET_BUFFER_LENGTH => UserControlEvent::SetBufferLength {
                stream_id: buf.get_u32(),
                buffer_ms: buf.get_u32(),
            },
            UC_PING_REQUEST => UserControlEvent::PingRequest(buf.get_u32()),
            UC_PING_RESPONSE => UserControlEvent::PingResponse(buf.get_u32()),
            _ => UserControlEvent::Other {
                event_type,
                data: buf,
            },
        })
    }

    pub fn into_message(self) -> ChunkMessage {
        let mut buf = BytesMut::with_capacity(10);
        match self {
            UserControlEvent::StreamBegin(id) => {
                buf.put_u16(UC_STREAM_BEGIN);
                buf.put_u32(id);
            }
            UserControlEvent::StreamEof(id) => {
                buf.put_u16(UC_STREAM_EOF);
                buf.put_u32(id);
            }
            UserControlEvent::SetBufferLength {
                stream_id,
                buffer_ms,
            } => {
                buf.put_u16(UC_SET_BUFFER_LENGTH);
                buf.put_u32(stream_id);
                buf.put_u32(buffer_ms);
            }
            UserControlEvent::PingRequest(ts) => {
                buf.put_u16(UC_PING_REQUEST);
                buf.put_u32(ts);
            }
            UserControlEvent::PingResponse(ts) => {
                buf.put_u16(UC_PING_RESPONSE);
                buf.put_u32(ts);
            }
            UserControlEvent::Other { event_type, data } => {
                buf.put_u16(event_type);
                buf.put_slice(&data);
            }
        }
        ChunkMessage::new(CSID_PROTOCOL_CONTROL, MSG_USER_CONTROL, 0, 0, buf.freeze())
    }
}

/// A decoded command message
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    /// Usually an object for requests and `Null` for stream commands
    pub command_object: AmfValue,
    pub arguments: Vec<AmfValue>,
    /// Message stream the command arrived on
    pub stream_id: u32,
}

impl Command {
    pub fn new(name: impl Into<String>, transaction_id: f64, command_object: AmfValue) -> Self {
        Self {
            name: name.into(),
            transaction_id,
            command_object,
            arguments: Vec::new(),
            stream_id: 0,
        }
    }

    pub fn arg(mut self, value: impl Into<AmfValue>) -> Self {
        self.arguments.push(value.into());
        self
    }

    /// Decode a type 17 or 20 message
    pub fn decode(codec: &dyn CommandCodec, msg: &ChunkMessage) -> Result<Self, Error> {
        let mut values = codec.decode(amf_body(msg))?.into_iter();
        let count = values.len();
        if count < 2 {
            return Err(ProtocolError::CommandTooShort(count).into());
        }

        let name = match values.next() {
            Some(AmfValue::String(name)) => name,
            _ => return Err(ProtocolError::CommandNameNotString.into()),
        };
        let transaction_id = values.next().and_then(|v| v.as_number()).unwrap_or(0.0);
        let command_object = values.next().unwrap_or(AmfValue::Null);

        Ok(Self {
            name,
            transaction_id,
            command_object,
            arguments: values.collect(),
            stream_id: msg.stream_id,
        })
    }

    /// Encode as an AMF0 command message on `stream_id`
    pub fn into_message(self, codec: &dyn CommandCodec, stream_id: u32) -> ChunkMessage {
        let mut values = Vec::with_capacity(3 + self.arguments.len());
        values.push(AmfValue::String(self.name));
        values.push(AmfValue::Number(self.transaction_id));
        values.push(self.command_object);
        values.extend(self.arguments);
        ChunkMessage::new(
            CSID_COMMAND,
            MSG_COMMAND_AMF0,
            stream_id,
            0,
            codec.encode(&values),
        )
    }

    /// `_result` reply for a transaction
    pub fn result(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Command::new(CMD_RESULT, transaction_id, properties).arg(info)
    }

    /// `_error` reply for a transaction
    pub fn error(transaction_id: f64, info: AmfValue) -> Self {
        Command::new(CMD_ERROR, transaction_id, AmfValue::Null).arg(info)
    }

    /// `onStatus` notification
    pub fn on_status(level: &str, code: &str, description: &str) -> Self {
        Command::new(CMD_ON_STATUS, 0.0, AmfValue::Null).arg(status_info(level, code, description))
    }

    /// First string argument, used by publish/play/releaseStream
    pub fn stream_name(&self) -> Option<&str> {
        self.arguments.first().and_then(AmfValue::as_str)
    }
}

/// `{level, code, description}` info object
pub fn status_info(level: &str, code: &str, description: &str) -> AmfValue {
    AmfValue::Object(
        AmfObject::new()
            .with("level", level)
            .with("code", code)
            .with("description", description),
    )
}

/// Parameters of the `connect` command object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    pub app: String,
    pub tc_url: Option<String>,
    pub flash_ver: Option<String>,
    pub swf_url: Option<String>,
    pub page_url: Option<String>,
    /// 0 for AMF0, 3 for AMF3
    pub object_encoding: f64,
}

impl ConnectParams {
    pub fn from_command(cmd: &Command) -> Result<Self, ProtocolError> {
        let obj = cmd
            .command_object
            .as_object()
            .ok_or(ProtocolError::InvalidCommand {
                command: CMD_CONNECT,
                reason: "command object is not an object",
            })?;

        let string = |key: &str| obj.get(key).and_then(AmfValue::as_str).map(str::to_owned);

        Ok(Self {
            // Some encoders append the stream key or a query to app
            app: string("app")
                .map(|app| strip_query(&app).trim_end_matches('/').to_owned())
                .unwrap_or_default(),
            tc_url: string("tcUrl"),
            flash_ver: string("flashVer"),
            swf_url: string("swfUrl"),
            page_url: string("pageUrl"),
            object_encoding: obj
                .get("objectEncoding")
                .and_then(AmfValue::as_number)
                .unwrap_or(0.0),
        })
    }

    /// Command object for an outgoing connect
    pub fn to_object(&self) -> AmfValue {
        let mut obj = AmfObject::new().with("app", self.app.as_str());
        if let Some(flash_ver) = &self.flash_ver {
            obj.insert("flashVer", flash_ver.as_str());
        }
        if let Some(tc_url) = &self.tc_url {
            obj.insert("tcUrl", tc_url.as_str());
        }
        obj.insert("type", "nonprivate");
        obj.insert("fpad", false);
        obj.insert("capabilities", 15.0);
        obj.insert("audioCodecs", 3191.0);
        obj.insert("videoCodecs", 252.0);
        obj.insert("videoFunction", 1.0);
        obj.insert("objectEncoding", self.object_encoding);
        AmfValue::Object(obj)
    }
}

/// Parameters of `publish`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishParams {
    /// Stream name with any `?query` removed
    pub stream_key: String,
    /// "live", "record" or "append"
    pub publish_type: String,
}

impl PublishParams {
    pub fn from_command(cmd: &Command) -> Result<Self, ProtocolError> {
        let name = cmd.stream_name().ok_or(ProtocolError::InvalidCommand {
            command: CMD_PUBLISH,
            reason: "missing stream name",
        })?;
        let stream_key = strip_query(name);
        if stream_key.is_empty() {
            return Err(ProtocolError::InvalidCommand {
                command: CMD_PUBLISH,
                reason: "empty stream name",
            });
        }

        Ok(Self {
            stream_key: stream_key.to_owned(),
            publish_type: cmd
                .arguments
                .get(1)
                .and_then(AmfValue::as_str)
                .unwrap_or("live")
                .to_owned(),
        })
    }
}

/// Parameters of `play`
#[derive(Debug, Clone, PartialEq)]
pub struct PlayParams {
    pub stream_key: String,
    /// -2 live or recorded, -1 live only, >= 0 recorded offset
    pub start: f64,
    pub duration: f64,
    pub reset: bool,
}

impl PlayParams {
    pub fn from_command(cmd: &Command) -> Result<Self, ProtocolError> {
        let name = cmd.stream_name().ok_or(ProtocolError::InvalidCommand {
            command: CMD_PLAY,
            reason: "missing stream name",
        })?;
        let stream_key = strip_query(name);
        if stream_key.is_empty() {
            return Err(ProtocolError::InvalidCommand {
                command: CMD_PLAY,
                reason: "empty stream name",
            });
        }

        let number = |i: usize, default: f64| {
            cmd.arguments
                .get(i)
                .and_then(AmfValue::as_number)
                .unwrap_or(default)
        };

        Ok(Self {
            stream_key: stream_key.to_owned(),
            start: number(1, -2.0),
            duration: number(2, -1.0),
            reset: cmd
                .arguments
                .get(3)
                .and_then(AmfValue::as_bool)
                .unwrap_or(true),
        })
    }
}

fn strip_query(name: &str) -> &str {
    name.split_once('?').map_or(name, |(base, _)| base)
}

/// Remove an `@setDataFrame` wrapper from a data message body
///
/// Returns the AMF0 payload to hand to players (`onMetaData, {...}`), plus
/// whether it is stream metadata.
pub fn unwrap_data_frame(
    codec: &dyn CommandCodec,
    msg: &ChunkMessage,
) -> Result<(Bytes, bool), Error> {
    let values = codec.decode(amf_body(msg))?;
    match values.first().and_then(AmfValue::as_str) {
        Some(SET_DATA_FRAME) => {
            let inner = &values[1..];
            let is_metadata = inner.first().and_then(AmfValue::as_str) == Some(ON_METADATA);
            Ok((codec.encode(inner), is_metadata))
        }
        Some(ON_METADATA) => Ok((Bytes::copy_from_slice(amf_body(msg)), true)),
        _ => Ok((Bytes::copy_from_slice(amf_body(msg)), false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::Amf0Codec;

    fn command_message(values: &[AmfValue]) -> ChunkMessage {
        ChunkMessage::new(3, MSG_COMMAND_AMF0, 0, 0, Amf0Codec.encode(values))
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(MessageKind::of(1), MessageKind::ProtocolControl);
        assert_eq!(MessageKind::of(4), MessageKind::UserControl);
        assert_eq!(MessageKind::of(8), MessageKind::Audio);
        assert_eq!(MessageKind::of(9), MessageKind::Video);
        assert_eq!(MessageKind::of(15), MessageKind::Data);
        assert_eq!(MessageKind::of(17), MessageKind::Command);
        assert_eq!(MessageKind::of(19), MessageKind::Unsupported);
        assert_eq!(MessageKind::of(22), MessageKind::Unsupported);
        assert_eq!(MessageKind::of(42), MessageKind::Unknown);
    }

    #[test]
    fn test_control_roundtrip() {
        for control in [
            ControlMessage::SetChunkSize(4096),
            ControlMessage::Abort(6),
            ControlMessage::Acknowledgement(2_500_001),
            ControlMessage::WindowAckSize(2_500_000),
            ControlMessage::SetPeerBandwidth {
                size: 2_500_000,
                limit_type: 2,
            },
        ] {
            let msg = control.into_message();
            assert_eq!(msg.csid, CSID_PROTOCOL_CONTROL);
            assert_eq!(
                ControlMessage::parse(msg.type_id, &msg.payload).unwrap(),
                Some(control)
            );
        }
    }

    #[test]
    fn test_control_malformed() {
        assert!(matches!(
            ControlMessage::parse(MSG_SET_CHUNK_SIZE, &[0, 0]),
            Err(ProtocolError::MalformedControl { len: 2, .. })
        ));
        assert!(matches!(
            ControlMessage::parse(MSG_SET_CHUNK_SIZE, &[0x80, 0, 0, 0]),
            Err(ProtocolError::InvalidChunkSize(0))
        ));
        assert_eq!(ControlMessage::parse(MSG_AUDIO, &[]).unwrap(), None);
    }

    #[test]
    fn test_user_control_events() {
        let ping = UserControlEvent::PingRequest(1234).into_message();
        assert_eq!(ping.type_id, MSG_USER_CONTROL);
        assert_eq!(
            UserControlEvent::parse(&ping.payload).unwrap(),
            UserControlEvent::PingRequest(1234)
        );

        let buffer = UserControlEvent::SetBufferLength {
            stream_id: 1,
            buffer_ms: 3000,
        };
        assert_eq!(
            UserControlEvent::parse(&buffer.clone().into_message().payload).unwrap(),
            buffer
        );

        assert!(UserControlEvent::parse(&Bytes::from_static(&[0, 6, 0])).is_err());
    }

    #[test]
    fn test_command_decode() {
        let msg = command_message(&[
            "connect".into(),
            AmfValue::Number(1.0),
            AmfValue::Object(AmfObject::new().with("app", "live")),
        ]);
        let cmd = Command::decode(&Amf0Codec, &msg).unwrap();

        assert_eq!(cmd.name, "connect");
        assert_eq!(cmd.transaction_id, 1.0);
        assert_eq!(cmd.command_object.get_string("app"), Some("live"));
        assert!(cmd.arguments.is_empty());
    }

    #[test]
    fn test_command_decode_failures() {
        let one_value = command_message(&[AmfValue::from("connect")]);
        assert!(matches!(
            Command::decode(&Amf0Codec, &one_value),
            Err(Error::Protocol(ProtocolError::CommandTooShort(1)))
        ));

        let not_string = command_message(&[AmfValue::Number(1.0), AmfValue::Number(2.0)]);
        assert!(matches!(
            Command::decode(&Amf0Codec, &not_string),
            Err(Error::Protocol(ProtocolError::CommandNameNotString))
        ));

        let garbage = ChunkMessage::new(3, MSG_COMMAND_AMF0, 0, 0, Bytes::from_static(&[0xEE]));
        assert!(matches!(
            Command::decode(&Amf0Codec, &garbage),
            Err(Error::Amf(_))
        ));
    }

    #[test]
    fn test_amf3_command_skips_format_byte() {
        let body = Amf0Codec.encode(&["createStream".into(), AmfValue::Number(2.0), AmfValue::Null]);
        let mut payload = BytesMut::new();
        payload.put_u8(0);
        payload.put_slice(&body);
        let msg = ChunkMessage::new(3, MSG_COMMAND_AMF3, 0, 0, payload.freeze());

        let cmd = Command::decode(&Amf0Codec, &msg).unwrap();
        assert_eq!(cmd.name, "createStream");
        assert_eq!(cmd.transaction_id, 2.0);
    }

    #[test]
    fn test_status_command_shape() {
        let msg = Command::on_status("status", NS_PUBLISH_START, "go").into_message(&Amf0Codec, 1);
        assert_eq!(msg.stream_id, 1);
        assert_eq!(msg.type_id, MSG_COMMAND_AMF0);

        let cmd = Command::decode(&Amf0Codec, &msg).unwrap();
        assert_eq!(cmd.name, CMD_ON_STATUS);
        assert_eq!(cmd.command_object, AmfValue::Null);
        assert_eq!(cmd.arguments[0].get_string("code"), Some(NS_PUBLISH_START));
    }

    #[test]
    fn test_connect_params() {
        let cmd = Command::new(
            CMD_CONNECT,
            1.0,
            AmfValue::Object(
                AmfObject::new()
                    .with("app", "live/")
                    .with("tcUrl", "rtmp://localhost/live")
                    .with("flashVer", "FMLE/3.0")
                    .with("objectEncoding", 0.0),
            ),
        );
        let params = ConnectParams::from_command(&cmd).unwrap();
        assert_eq!(params.app, "live");
        assert_eq!(params.tc_url.as_deref(), Some("rtmp://localhost/live"));
        assert_eq!(params.flash_ver.as_deref(), Some("FMLE/3.0"));

        let bad = Command::new(CMD_CONNECT, 1.0, AmfValue::Null);
        assert!(ConnectParams::from_command(&bad).is_err());
    }

    #[test]
    fn test_publish_and_play_params() {
        let publish = Command::new(CMD_PUBLISH, 5.0, AmfValue::Null)
            .arg("key?token=abc")
            .arg("live");
        let params = PublishParams::from_command(&publish).unwrap();
        assert_eq!(params.stream_key, "key");
        assert_eq!(params.publish_type, "live");

        let missing = Command::new(CMD_PUBLISH, 5.0, AmfValue::Null);
        assert!(PublishParams::from_command(&missing).is_err());

        let play = Command::new(CMD_PLAY, 4.0, AmfValue::Null).arg("key");
        let params = PlayParams::from_command(&play).unwrap();
        assert_eq!(params.stream_key, "key");
        assert_eq!(params.start, -2.0);
        assert!(params.reset);

        let empty = Command::new(CMD_PLAY, 4.0, AmfValue::Null).arg("?x=1");
        assert!(PlayParams::from_command(&empty).is_err());
    }

    #[test]
    fn test_unwrap_data_frame() {
        let meta = AmfValue::EcmaArray(AmfObject::new().with("width", 1280.0));
        let wrapped = ChunkMessage::new(
            5,
            MSG_DATA_AMF0,
            1,
            0,
            Amf0Codec.encode(&[SET_DATA_FRAME.into(), ON_METADATA.into(), meta.clone()]),
        );

        let (payload, is_metadata) = unwrap_data_frame(&Amf0Codec, &wrapped).unwrap();
        assert!(is_metadata);
        assert_eq!(
            Amf0Codec.decode(&payload).unwrap(),
            vec![AmfValue::from(ON_METADATA), meta]
        );

        let other = ChunkMessage::new(
            5,
            MSG_DATA_AMF0,
            1,
            0,
            Amf0Codec.encode(&[AmfValue::from("onTextData")]),
        );
        let (payload, is_metadata) = unwrap_data_frame(&Amf0Codec, &other).unwrap();
        assert!(!is_metadata);
        assert_eq!(payload, other.payload);
    }
}
