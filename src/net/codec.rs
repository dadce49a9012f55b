//! Length prefixed framing of [`Envelope`]s for stream transports.

use anyhow::ensure;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::Envelope;

/// Frames [`Envelope`]s as a big-endian `u32` length followed by the postcard encoding.
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        ensure!(
            frame_len <= MAX_MESSAGE_SIZE,
            "received message that is too large: {}",
            frame_len
        );
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        let envelope: Envelope = postcard::from_bytes(&src[4..4 + frame_len])?;
        src.advance(4 + frame_len);
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = postcard::to_stdvec(&item)?;
        ensure!(
            bytes.len() <= MAX_MESSAGE_SIZE,
            "attempting to send message that is too large {}",
            bytes.len()
        );
        dst.reserve(4 + bytes.len());
        dst.put_u32(bytes.len() as u32);
        dst.put_slice(&bytes);
        Ok(())
    }
}
