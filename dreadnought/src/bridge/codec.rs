//! Framed codec for coordinator/worker pipes.
//!
//! Uses LengthDelimitedCodec for framing (4-byte big-endian length) + serde_json
//! for the payload. The same codec drives the blocking worker side and the async
//! coordinator side, so both transports share one wire format.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest payload either side will write or accept: 64 MiB.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// An item whose encoding exceeds the frame limit. Nothing was written.
#[derive(Debug, thiserror::Error)]
#[error("frame of {len} bytes exceeds the {max} byte limit")]
pub struct FrameTooLarge {
    pub len: usize,
    pub max: usize,
}

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// A partial frame at EOF means the peer went away mid-write.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None if buf.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("peer closed with {} bytes of a partial frame", buf.len()),
            )),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        if json.len() > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                FrameTooLarge {
                    len: json.len(),
                    max: self.max_frame_length,
                },
            ));
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Ident, Request, Response, WorkerCommand};

    #[test]
    fn frame_header_is_big_endian_length() {
        let mut codec = JsonCodec::<Response>::new();
        let mut buf = BytesMut::new();

        codec.encode(Response::Ack, &mut buf).unwrap();

        let payload = br#"{"type":"ack"}"#;
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], payload);
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut codec = JsonCodec::<WorkerCommand>::new();
        let mut full = BytesMut::new();
        codec
            .encode(WorkerCommand::StartStreaming { ident: Ident::new(3) }, &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 2..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert!(matches!(decoded, WorkerCommand::StartStreaming { ident } if ident == Ident::new(3)));
    }

    #[test]
    fn call_payload_survives_framing() {
        let mut codec = JsonCodec::<WorkerCommand>::new();
        let mut buf = BytesMut::new();

        let mut request = Request::new(Ident::new(0), "/echo");
        request
            .post_data
            .insert("payload".into(), serde_json::json!({"nested": [1, 2, 3]}));
        codec
            .encode(WorkerCommand::Call { request: request.clone() }, &mut buf)
            .unwrap();

        match codec.decode(&mut buf).unwrap().unwrap() {
            WorkerCommand::Call { request: decoded } => assert_eq!(decoded, request),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn partial_frame_at_eof_is_unexpected_eof() {
        let mut codec = JsonCodec::<Response>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Response::Error { error: "boom".into() }, &mut buf)
            .unwrap();
        buf.truncate(buf.len() - 1);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn clean_eof_is_none() {
        let mut codec = JsonCodec::<Response>::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_item_is_rejected_before_writing() {
        let mut codec = JsonCodec::<Response>::with_max_frame_length(16);
        let mut buf = BytesMut::new();

        let err = codec
            .encode(
                Response::Data {
                    data: serde_json::json!("x".repeat(32)),
                },
                &mut buf,
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let too_large = err.get_ref().unwrap().downcast_ref::<FrameTooLarge>().unwrap();
        assert_eq!(too_large.max, 16);
        assert_eq!(too_large.len, r#"{"type":"data","data":""}"#.len() + 32);
        assert!(buf.is_empty());

        codec.encode(Response::Ack, &mut buf).unwrap();
        assert!(!buf.is_empty());
    }

    #[test]
    fn garbage_payload_is_invalid_data() {
        let mut codec = JsonCodec::<Response>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"{{{");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
