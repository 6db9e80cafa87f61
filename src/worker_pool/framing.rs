// ABOUTME: Length-prefixed frame codec for worker sockets
// ABOUTME: Wire layout is [u32 BE length][u64 BE correlation id][payload]

//! Wire framing for worker channels.
//!
//! ```text
//! +----------------+----------------------+---------------------+
//! | length: u32 BE | correlation id: u64  | payload (opaque)    |
//! +----------------+----------------------+---------------------+
//!                  |<------------------ length ---------------->|
//! ```
//!
//! The correlation id lives in the transport header so the payload schema can
//! evolve without touching the channel. `FrameDecoder` keeps partial input
//! between calls, which makes `read_frame` safe to use inside `tokio::select!`.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the correlation id header that follows the length prefix.
pub const ID_HEADER_LEN: usize = 8;

/// Default upper bound for `length` (id header plus payload).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Errors produced while encoding or decoding frames
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame length exceeds the configured limit
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge {
        /// Declared or requested frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Declared length cannot even hold the correlation id
    #[error("Frame of {0} bytes is shorter than the correlation id header")]
    TooShort(usize),

    /// Stream ended in the middle of a frame
    #[error("Stream closed with {0} bytes of a partial frame buffered")]
    Truncated(usize),

    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlation id from the transport header
    pub id: u64,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

/// Encode a frame into a single buffer ready to be written.
pub fn encode_frame(id: u64, payload: &[u8], max_frame_len: usize) -> Result<Vec<u8>, FrameError> {
    let len = payload.len() + ID_HEADER_LEN;
    if len > max_frame_len {
        return Err(FrameError::TooLarge { len, max: max_frame_len });
    }
    let prefix = u32::try_from(len).map_err(|_| FrameError::TooLarge {
        len,
        max: u32::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + len);
    buf.extend_from_slice(&prefix.to_be_bytes());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Incremental decoder that accumulates bytes until whole frames are available.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Create a decoder enforcing `max_frame_len`.
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(8 * 1024),
            max_frame_len,
        }
    }

    /// Append raw bytes received from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// A length outside `[ID_HEADER_LEN, max_frame_len]` is an error; the
    /// stream cannot be resynchronised after that.
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len < ID_HEADER_LEN {
            return Err(FrameError::TooShort(len));
        }
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let total = LENGTH_PREFIX_LEN + len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut id_bytes = [0u8; ID_HEADER_LEN];
        id_bytes.copy_from_slice(&self.buf[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + ID_HEADER_LEN]);
        let payload = self.buf[LENGTH_PREFIX_LEN + ID_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);

        Ok(Some(Frame {
            id: u64::from_be_bytes(id_bytes),
            payload,
        }))
    }
}

/// Read the next frame from `reader`.
///
/// Returns `Ok(None)` on a clean EOF between frames. Cancel safe: bytes read
/// before cancellation stay in `decoder`.
pub async fn read_frame<R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decoder.decode()? {
            return Ok(Some(frame));
        }

        let n = reader.read_buf(&mut decoder.buf).await?;
        if n == 0 {
            return if decoder.buf.is_empty() {
                Ok(None)
            } else {
                Err(FrameError::Truncated(decoder.buf.len()))
            };
        }
    }
}

/// Encode and write one frame, flushing afterwards.
pub async fn write_frame<W>(
    writer: &mut W,
    id: u64,
    payload: &[u8],
    max_frame_len: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(id, payload, max_frame_len)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
