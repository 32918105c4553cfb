//! Framed codec for worker communication.
//!
//! Length-prefixed frames (4 byte big-endian length) carrying one JSON
//! document each. Works over any AsyncRead/AsyncWrite (socket halves, duplex
//! streams in tests).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame; larger frames indicate a corrupted stream.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

const LARGE_FRAME_BYTES: usize = 100_000;

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
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

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        if json.len() > LARGE_FRAME_BYTES {
            tracing::info!(
                json_size_kb = json.len() / 1024,
                "Large IPC frame"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Envelope, Origin, ToWorker};

    #[test]
    fn decodes_frames_split_across_reads() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut encoded = BytesMut::new();
        codec.encode(Envelope::ready(), &mut encoded).unwrap();
        codec
            .encode(Envelope::debug_eval("1 + 1"), &mut encoded)
            .unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[3..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.is(Origin::Worker, "ready"));
        assert!(second.is(Origin::Debugger, "eval"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn invalid_json_is_invalid_data() {
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(b"{\"origin\":"), &mut buf)
            .unwrap();

        let err = JsonCodec::<Envelope>::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut small = JsonCodec::<ToWorker>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        let err = small
            .encode(ToWorker::Debugger(Envelope::debug_eval("a long command")), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
