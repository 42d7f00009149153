//! RTMP protocol constants

/// Handshake version byte (C0/S0)
pub const RTMP_VERSION: u8 = 3;

/// Size of C1/C2/S1/S2 handshake packets
pub const HANDSHAKE_SIZE: usize = 1536;

/// Chunk size every connection starts with
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Chunk size we announce after connect
pub const RECOMMENDED_CHUNK_SIZE: u32 = 4096;

/// Largest chunk size the protocol allows (31 bits)
pub const MAX_CHUNK_SIZE: u32 = 0x7FFF_FFFF;

/// Largest message we are willing to reassemble
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Window acknowledgement size assumed until the peer announces one
pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Peer bandwidth announced after connect
pub const DEFAULT_PEER_BANDWIDTH: u32 = 2_500_000;

/// 3-byte timestamp value signalling a following 4-byte extended timestamp
pub const EXTENDED_TIMESTAMP_MARKER: u32 = 0xFF_FFFF;

// Message type IDs
pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF3: u8 = 15;
pub const MSG_SHARED_OBJECT_AMF3: u8 = 16;
pub const MSG_COMMAND_AMF3: u8 = 17;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_SHARED_OBJECT_AMF0: u8 = 19;
pub const MSG_COMMAND_AMF0: u8 = 20;
pub const MSG_AGGREGATE: u8 = 22;

// Chunk stream IDs used for outgoing messages
pub const CSID_PROTOCOL_CONTROL: u32 = 2;
pub const CSID_COMMAND: u32 = 3;
pub const CSID_AUDIO: u32 = 4;
pub const CSID_DATA: u32 = 5;
pub const CSID_VIDEO: u32 = 6;

/// Range a basic header can encode; 0 and 1 escape to the longer forms
pub const MIN_CHUNK_STREAM_ID: u32 = 2;
pub const MAX_CHUNK_STREAM_ID: u32 = 65599;

// User control event types
pub const UC_STREAM_BEGIN: u16 = 0;
pub const UC_STREAM_EOF: u16 = 1;
pub const UC_SET_BUFFER_LENGTH: u16 = 3;
pub const UC_PING_REQUEST: u16 = 6;
pub const UC_PING_RESPONSE: u16 = 7;

// Command names
pub const CMD_CONNECT: &str = "connect";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_PLAY: &str = "play";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_CLOSE_STREAM: &str = "closeStream";
pub const CMD_RELEASE_STREAM: &str = "releaseStream";
pub const CMD_FC_PUBLISH: &str = "FCPublish";
pub const CMD_FC_UNPUBLISH: &str = "FCUnpublish";
pub const CMD_CHECK_BW: &str = "_checkbw";
pub const CMD_GET_STREAM_LENGTH: &str = "getStreamLength";
pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";
pub const CMD_ON_STATUS: &str = "onStatus";

/// Data message wrapper that encoders put in front of onMetaData
pub const SET_DATA_FRAME: &str = "@setDataFrame";
pub const ON_METADATA: &str = "onMetaData";

// NetConnection / NetStream status codes
pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";
pub const NC_CONNECT_REJECTED: &str = "NetConnection.Connect.Rejected";
pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NS_PUBLISH_BAD_NAME: &str = "NetStream.Publish.BadName";
pub const NS_PUBLISH_REJECTED: &str = "NetStream.Publish.Rejected";
pub const NS_PLAY_RESET: &str = "NetStream.Play.Reset";
pub const NS_PLAY_START: &str = "NetStream.Play.Start";
pub const NS_PLAY_STREAM_NOT_FOUND: &str = "NetStream.Play.StreamNotFound";
pub const NS_PLAY_UNPUBLISH_NOTIFY: &str = "NetStream.Play.UnpublishNotify";
pub const NS_PLAY_FAILED: &str = "NetStream.Play.Failed";
pub const NS_FAILED: &str = "NetStream.Failed";
