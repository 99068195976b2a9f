//! Length-prefixed JSON frame codec.
//!
//! Each frame on the control channel is a big-endian u32 byte length followed
//! by exactly that many bytes of UTF-8 JSON. There is no streaming within a
//! frame; a frame longer than [`MAX_FRAME_SIZE`] closes the channel.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::Frame;

/// Maximum size of a single control-channel message (5 MiB).
pub const MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds {MAX_FRAME_SIZE} byte limit"),
            ));
        }

        if src.len() < 4 + len {
            // Reserve so the caller's next read_buf has room for the rest.
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(len);

        let frame = serde_json::from_slice(&body).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad frame: {e}"))
        })?;
        Ok(Some(frame))
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(frame).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("encode: {e}"))
        })?;

        if body.len() > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds {MAX_FRAME_SIZE} byte limit", body.len()),
            ));
        }

        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_round_trip() {
        let frame = Frame::request("notify", "42", json!({"title": "T", "message": "M"}));
        let mut buf = encode(&frame);
        let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let frame = Frame::event("stream_data", json!({"session": "s1", "data": "x"}));
        let full = encode(&frame);

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(FrameCodec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        let decoded = FrameCodec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let a = Frame::event("stream_data", json!({"seq": 1}));
        let b = Frame::event("stream_data", json!({"seq": 2}));
        let mut buf = encode(&a);
        buf.extend_from_slice(&encode(&b));

        assert_eq!(FrameCodec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(FrameCodec.decode(&mut buf).unwrap().unwrap(), b);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.extend_from_slice(b"xxxx");
        let err = FrameCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_invalid_json_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(b"{{{");
        let err = FrameCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
