//! Length-prefixed multipart framing over TCP, shared by the heartbeat
//! publisher and the command channel.
//!
//! A message is a frame count byte followed by each frame as a 4-byte
//! big-endian length and its payload. Violations surface as
//! `InvalidData` I/O errors so receive loops can drop the connection.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Upper bound for frames per message.
pub const MAX_FRAMES: u8 = 8;

pub async fn write_message<W>(stream: &mut W, frames: &[Vec<u8>]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frames.is_empty() || frames.len() > usize::from(MAX_FRAMES) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid frame count {}", frames.len()),
        ));
    }
    stream.write_u8(frames.len() as u8).await?;
    for frame in frames {
        let len = u32::try_from(frame.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        stream.write_u32(len).await?;
        stream.write_all(frame).await?;
    }
    stream.flush().await
}

pub async fn read_message<R>(stream: &mut R) -> io::Result<Vec<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let count = stream.read_u8().await?;
    if count == 0 || count > MAX_FRAMES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame count {count}"),
        ));
    }

    let mut frames = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let len = stream.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }
        let mut frame = vec![0u8; len as usize];
        stream.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let frames = vec![b"header".to_vec(), b"verb".to_vec(), vec![0u8; 1024]];
        let mut buf = Vec::new();
        write_message(&mut buf, &frames).await.unwrap();

        let mut cursor = io::Cursor::new(buf);
        let decoded = read_message(&mut cursor).await.unwrap();
        assert_eq!(decoded, frames);
    }

    #[tokio::test]
    async fn empty_frame_allowed() {
        let frames = vec![Vec::new()];
        let mut buf = Vec::new();
        write_message(&mut buf, &frames).await.unwrap();
        let decoded = read_message(&mut io::Cursor::new(buf)).await.unwrap();
        assert_eq!(decoded, frames);
    }

    #[tokio::test]
    async fn zero_frames_rejected() {
        let mut buf = Vec::new();
        assert!(write_message(&mut buf, &[]).await.is_err());

        let mut cursor = io::Cursor::new(vec![0u8]);
        assert!(read_message(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        // forged header announcing a frame beyond the cap
        let mut buf = vec![1u8];
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = io::Cursor::new(buf);
        assert!(read_message(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn truncated_stream_errors() {
        let frames = vec![b"data".to_vec()];
        let mut buf = Vec::new();
        write_message(&mut buf, &frames).await.unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = io::Cursor::new(buf);
        assert!(read_message(&mut cursor).await.is_err());
    }
}
