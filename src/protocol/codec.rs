use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::envelope::Envelope;
use super::{DEFAULT_MAX_FRAME_LEN, LENGTH_PREFIX_LEN};
use crate::error::{RelayError, Result};

/// Codec for length-prefixed JSON envelopes.
///
/// A frame is a big-endian `u32` payload length followed by that many bytes
/// of UTF-8 JSON. Frames longer than `max_frame_len` are refused in both
/// directions.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Serialize an envelope into a complete frame, prefix included
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| RelayError::MalformedFrame(e.to_string()))?;
        if payload.len() > self.max_frame_len || payload.len() > u32::MAX as usize {
            return Err(RelayError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Parse a frame payload (prefix already stripped)
    pub fn decode_payload(&self, payload: &[u8]) -> Result<Envelope> {
        serde_json::from_slice(payload).map_err(|e| RelayError::MalformedFrame(e.to_string()))
    }

    /// Read exactly one envelope, blocking until the whole frame arrived.
    ///
    /// A stream that closes anywhere inside a frame yields `EndOfStream`.
    pub async fn read_envelope<R>(&self, io: &mut R) -> Result<Envelope>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
        io.read_exact(&mut len_bytes).await.map_err(eof_to_end)?;
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > self.max_frame_len {
            return Err(RelayError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let mut buffer = vec![0u8; len];
        io.read_exact(&mut buffer).await.map_err(eof_to_end)?;

        self.decode_payload(&buffer)
    }

    pub async fn write_envelope<W>(&self, io: &mut W, envelope: &Envelope) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(envelope)?;
        write_frame(io, &frame).await
    }
}

/// Write an already encoded frame and flush it
pub async fn write_frame<W>(io: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(frame).await?;
    io.flush().await?;
    Ok(())
}

fn eof_to_end(err: io::Error) -> RelayError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        RelayError::EndOfStream
    } else {
        RelayError::Io(err)
    }
}
