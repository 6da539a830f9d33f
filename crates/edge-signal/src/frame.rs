use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::message::{RawSignalMessage, SignalMessage};
use crate::{FrameSection, SignalError};

pub const LENGTH_PREFIX_LEN: usize = 4;
/// Largest payload accepted in either direction.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Serializes `message` into one frame: `u32` little-endian payload length
/// followed by the UTF-8 JSON payload.
pub fn encode(message: &SignalMessage) -> Result<Bytes, SignalError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(SignalError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Decodes one complete frame held in memory.
pub fn decode(frame: &[u8]) -> Result<SignalMessage, SignalError> {
    let Some((prefix, rest)) = frame.split_first_chunk::<LENGTH_PREFIX_LEN>() else {
        return Err(SignalError::Truncated {
            section: FrameSection::LengthPrefix,
            expected: LENGTH_PREFIX_LEN,
            received: frame.len(),
        });
    };
    let len = payload_len(*prefix)?;
    if rest.len() < len {
        return Err(SignalError::Truncated {
            section: FrameSection::Payload,
            expected: len,
            received: rest.len(),
        });
    }
    if rest.len() > len {
        return Err(SignalError::TrailingBytes(rest.len() - len));
    }
    parse_payload(rest)
}

pub async fn write_message<W>(writer: &mut W, message: &SignalMessage) -> Result<(), SignalError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    trace!(
        target = "edge_signal",
        kind = ?message.kind,
        bytes = frame.len(),
        "frame written"
    );
    Ok(())
}

/// Reads exactly one frame. End of stream anywhere inside the frame is a
/// [`SignalError::Truncated`] error.
pub async fn read_message<R>(reader: &mut R) -> Result<SignalMessage, SignalError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    read_section(reader, &mut prefix, FrameSection::LengthPrefix).await?;
    let len = payload_len(prefix)?;
    let mut payload = vec![0u8; len];
    read_section(reader, &mut payload, FrameSection::Payload).await?;
    let message = parse_payload(&payload)?;
    trace!(target = "edge_signal", kind = ?message.kind, bytes = len, "frame read");
    Ok(message)
}

async fn read_section<R>(
    reader: &mut R,
    buf: &mut [u8],
    section: FrameSection,
) -> Result<(), SignalError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            return Err(SignalError::Truncated {
                section,
                expected: buf.len(),
                received: filled,
            });
        }
        filled += read;
    }
    Ok(())
}

fn payload_len(prefix: [u8; LENGTH_PREFIX_LEN]) -> Result<usize, SignalError> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SignalError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

fn parse_payload(payload: &[u8]) -> Result<SignalMessage, SignalError> {
    let raw: RawSignalMessage = serde_json::from_slice(payload)?;
    raw.try_into()
}
