//! Length-header message codec.
//!
//! Every message on the wire is a 4-byte big-endian payload length followed
//! by exactly that many bytes of UTF-8 JSON.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const LENGTH_HEADER_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frames JSON messages with a length header.
#[derive(Debug)]
pub struct MessageCodec {
    frames: LengthDelimitedCodec,
}

impl MessageCodec {
    pub fn new(max_frame_length: usize) -> Self {
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_HEADER_SIZE)
            .big_endian()
            .max_frame_length(max_frame_length)
            .new_codec();
        Self { frames }
    }

    pub fn max_frame_length(&self) -> usize {
        self.frames.max_frame_length()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(crate::config::FramingConfig::default().max_frame_length)
    }
}

impl Decoder for MessageCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, CodecError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_is_big_endian_payload_length() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(json!({"a": 1}), &mut buf).unwrap();

        let payload = br#"{"a":1}"#;
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], payload);
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 8]);
        buf.extend_from_slice(b"[1,2");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b",3] ");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!([1, 2, 3])));
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(json!("one"), &mut buf).unwrap();
        codec.encode(json!(2), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!("one")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(json!(2)));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_header_is_an_error() {
        let mut codec = MessageCodec::new(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1024u32.to_be_bytes());
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Io(_))));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"{{{");
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Json(_))));
    }
}
