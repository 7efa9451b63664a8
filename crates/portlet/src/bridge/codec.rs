//! Framed codec for envelope exchange.
//!
//! Uses LengthDelimitedCodec for framing (1, 2 or 4 byte big-endian prefix)
//! + serde_json for the envelope payload.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex).

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Envelope;
use crate::config::PacketWidth;

/// A complete frame whose payload is not a valid envelope.
///
/// Framing is intact, so the stream can continue with the next frame.
#[derive(Debug, thiserror::Error)]
#[error("malformed frame ({len} bytes): {source}")]
pub struct MalformedFrame {
    pub len: usize,
    #[source]
    source: serde_json::Error,
}

/// Codec that frames envelopes with a length prefix and serializes with JSON.
///
/// Decoding yields `Err(MalformedFrame)` items instead of failing the stream:
/// a bad payload must not tear down the session. Only framing errors
/// (oversized length, truncated stream) surface as `io::Error`.
pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
    packet: PacketWidth,
}

impl EnvelopeCodec {
    pub fn new(packet: PacketWidth) -> Self {
        Self::with_max_frame_length(packet, packet.max_frame_length())
    }

    pub fn with_max_frame_length(packet: PacketWidth, max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(packet.bytes())
                .max_frame_length(max_frame_length.min(packet.max_frame_length()))
                .big_endian()
                .new_codec(),
            packet,
        }
    }

    pub fn packet(&self) -> PacketWidth {
        self.packet
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Result<Envelope, MalformedFrame>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|source| {
                MalformedFrame {
                    len: bytes.len(),
                    source,
                }
            }))),
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(
            tag = %item.tag(),
            payload_bytes = json.len(),
            packet = %self.packet,
            "Encoding frame"
        );
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CallResult, RequestId};
    use serde_json::json;

    fn add_call() -> Envelope {
        Envelope::Call {
            id: RequestId::new(1),
            module: "math".to_string(),
            function: "add".to_string(),
            args: vec![json!(2), json!(3)],
        }
    }

    fn encoded_payload_len(env: &Envelope) -> usize {
        serde_json::to_vec(env).unwrap().len()
    }

    #[test]
    fn prefix_width_follows_packet_setting() {
        let env = add_call();
        let payload_len = encoded_payload_len(&env);

        for packet in [PacketWidth::One, PacketWidth::Two, PacketWidth::Four] {
            let mut codec = EnvelopeCodec::new(packet);
            let mut buf = BytesMut::new();
            codec.encode(env.clone(), &mut buf).unwrap();

            assert_eq!(buf.len(), packet.bytes() + payload_len);
            let prefix = buf[..packet.bytes()]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            assert_eq!(prefix, payload_len, "packet width {packet}");

            let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
            assert_eq!(decoded, env);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = EnvelopeCodec::new(PacketWidth::Four);
        let mut full = BytesMut::new();
        codec.encode(add_call(), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 1..]);
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_ok());
    }

    #[test]
    fn malformed_payload_does_not_poison_stream() {
        let mut codec = EnvelopeCodec::new(PacketWidth::Two);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 3]);
        buf.extend_from_slice(b"xyz");
        codec
            .encode(
                Envelope::Response {
                    id: RequestId::new(4),
                    result: CallResult::success(json!("ok")),
                },
                &mut buf,
            )
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let err = first.unwrap_err();
        assert_eq!(err.len, 3);

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(matches!(second, Envelope::Response { id, .. } if id == RequestId::new(4)));
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let mut codec = EnvelopeCodec::new(PacketWidth::One);
        let payload = br#"{"t":"Q","id":1}"#;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[payload.len() as u8]);
        buf.extend_from_slice(payload);

        assert!(codec.decode(&mut buf).unwrap().unwrap().is_err());
    }

    #[test]
    fn oversized_frame_rejected_on_encode() {
        let mut codec = EnvelopeCodec::new(PacketWidth::One);
        let mut buf = BytesMut::new();
        let env = Envelope::Notify {
            module: "log".to_string(),
            function: "write".to_string(),
            args: vec![json!("x".repeat(300))],
        };

        let err = codec.encode(env, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_rejected_on_decode() {
        let mut codec = EnvelopeCodec::with_max_frame_length(PacketWidth::Four, 16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 1, 0]);
        buf.extend_from_slice(&[b' '; 256]);

        assert!(codec.decode(&mut buf).is_err());
    }
}
