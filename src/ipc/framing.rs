//! Newline-delimited JSON framing for the bridge socket.
//!
//! Each frame is one compact JSON document followed by a single `\n` byte.
//! `serde_json` escapes newlines inside strings, so the delimiter can never
//! appear inside an encoded document.
//!
//! # Wire Format
//!
//! ```text
//! {"type":"CMD","module":"dns","action":"spoof_all","data":{...},"msg_id":"a1b2c3d4"}\n
//! ```
//!
//! Decoding is a pure function over a growing buffer: complete frames are
//! parsed, and the trailing fragment is handed back untouched for the next read.

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::models::Message;

/// Frame delimiter byte.
pub const DELIMITER: u8 = b'\n';

/// Maximum size of a single frame (16MB). A partial frame growing past this
/// without a delimiter is treated as a broken peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Number of raw bytes kept in a `FrameError` for logging.
const ERROR_EXCERPT_LEN: usize = 120;

/// A single frame that could not be decoded.
#[derive(Debug, Error)]
#[error("Malformed frame ({excerpt}): {source}")]
pub struct FrameError {
    /// Leading bytes of the offending frame, lossily decoded.
    pub excerpt: String,
    #[source]
    pub source: serde_json::Error,
}

/// Encode a message as one delimited frame.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized (e.g. a payload map
/// with non-string keys).
pub fn encode(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(DELIMITER);
    Ok(frame)
}

/// Split `buf` into decoded frames and the unconsumed remainder.
///
/// One result is produced per non-blank delimited segment, in order. A
/// malformed segment yields an `Err` for that frame only; later segments
/// are still decoded. The remainder is the suffix after the last delimiter
/// and is returned unchanged.
///
/// # Example
///
/// ```ignore
/// let (frames, rest) = decode(&buffer);
/// let consumed = buffer.len() - rest.len();
/// buffer.drain(..consumed);
/// ```
pub fn decode(buf: &[u8]) -> (Vec<Result<Message, FrameError>>, &[u8]) {
    let mut frames = Vec::new();
    let mut rest = buf;

    while let Some(pos) = rest.iter().position(|&b| b == DELIMITER) {
        let segment = rest[..pos].trim_ascii();
        rest = &rest[pos + 1..];

        // Blank lines (keepalives, stray CRLF) carry nothing
        if segment.is_empty() {
            continue;
        }

        frames.push(serde_json::from_slice(segment).map_err(|source| FrameError {
            excerpt: excerpt(segment),
            source,
        }));
    }

    (frames, rest)
}

/// Write an encoded frame and flush it.
///
/// The whole frame is written with a single `write_all` so that, as long as
/// the caller holds the writer exclusively, frames are never interleaved.
///
/// # Errors
///
/// Returns an error if the write or flush fails.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

fn excerpt(segment: &[u8]) -> String {
    let end = segment.len().min(ERROR_EXCERPT_LEN);
    String::from_utf8_lossy(&segment[..end]).into_owned()
}
