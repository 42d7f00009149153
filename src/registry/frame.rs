//! Stream keys and the frames fanned out to consumers

use std::fmt;

use bytes::Bytes;

use crate::protocol::chunk::ChunkMessage;
use crate::protocol::constants::{CSID_AUDIO, CSID_DATA, CSID_VIDEO, MSG_AUDIO, MSG_DATA_AMF0, MSG_VIDEO};

/// Identifies a published stream: application name plus stream key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub app: String,
    pub name: String,
}

impl StreamKey {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.name)
    }
}

/// What a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Audio,
    Video,
    /// `onMetaData`, cached for late joiners
    Metadata,
    /// Any other data message, forwarded but not cached
    Data,
}

/// One published message, as handed to every consumer
///
/// Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn audio(timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Audio,
            timestamp,
            payload,
        }
    }

    pub fn video(timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Video,
            timestamp,
            payload,
        }
    }

    /// Metadata body, already stripped of any `@setDataFrame` wrapper
    pub fn metadata(timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Metadata,
            timestamp,
            payload,
        }
    }

    pub fn data(timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            timestamp,
            payload,
        }
    }

    /// AVC or AAC decoder configuration record
    ///
    /// FLV video: codec id 7 (AVC) in the low nibble, AVC packet type 0.
    /// FLV audio: sound format 10 (AAC) in the high nibble, AAC packet type 0.
    pub fn is_sequence_header(&self) -> bool {
        let (Some(&first), Some(&second)) = (self.payload.first(), self.payload.get(1)) else {
            return false;
        };
        match self.kind {
            FrameKind::Video => first & 0x0F == 7 && second == 0,
            FrameKind::Audio => first >> 4 == 10 && second == 0,
            _ => false,
        }
    }

    /// Build the outgoing message for a given message stream
    pub fn to_message(&self, stream_id: u32) -> ChunkMessage {
        let (csid, type_id) = match self.kind {
            FrameKind::Audio => (CSID_AUDIO, MSG_AUDIO),
            FrameKind::Video => (CSID_VIDEO, MSG_VIDEO),
            FrameKind::Metadata | FrameKind::Data => (CSID_DATA, MSG_DATA_AMF0),
        };
        ChunkMessage::new(csid, type_id, stream_id, self.timestamp, self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(StreamKey::new("live", "abc").to_string(), "live/abc");
    }

    #[test]
    fn test_sequence_header_detection() {
        let avc_header = Frame::video(0, Bytes::from_static(&[0x17, 0x00, 0x00]));
        let avc_nalu = Frame::video(0, Bytes::from_static(&[0x17, 0x01, 0x00]));
        let vp6 = Frame::video(0, Bytes::from_static(&[0x14, 0x00]));
        assert!(avc_header.is_sequence_header());
        assert!(!avc_nalu.is_sequence_header());
        assert!(!vp6.is_sequence_header());

        let aac_header = Frame::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12]));
        let aac_raw = Frame::audio(0, Bytes::from_static(&[0xAF, 0x01]));
        let mp3 = Frame::audio(0, Bytes::from_static(&[0x2F, 0x00]));
        assert!(aac_header.is_sequence_header());
        assert!(!aac_raw.is_sequence_header());
        assert!(!mp3.is_sequence_header());

        assert!(!Frame::video(0, Bytes::from_static(&[0x17])).is_sequence_header());
    }

    #[test]
    fn test_to_message() {
        let msg = Frame::metadata(0, Bytes::from_static(b"meta")).to_message(1);
        assert_eq!(msg.type_id, MSG_DATA_AMF0);
        assert_eq!(msg.csid, CSID_DATA);
        assert_eq!(msg.stream_id, 1);

        let msg = Frame::video(40, Bytes::from_static(&[0x27, 0x01])).to_message(3);
        assert_eq!(msg.type_id, MSG_VIDEO);
        assert_eq!(msg.timestamp, 40);
    }
}
