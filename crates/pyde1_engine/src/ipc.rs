//! Length-prefixed framed messages over a pipe, one per subsystem boundary:
//! a 4-byte big-endian length prefix followed by the frame body, generalized
//! to a raw byte frame so either JSON or MQTT/HTTP payloads can ride it.
//!
//! The HTTP and MQTT subsystems in this daemon currently run as in-process
//! `tokio` tasks rather than separate OS processes (see DESIGN.md) — a
//! `tokio` task already gives the "never blocks the core on an external
//! subsystem" guarantee without the deployment complexity of child
//! processes. This module is the framing primitive, ready for a subsystem
//! that does need real process isolation (e.g. a future out-of-process BLE
//! bridge).

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames longer than this are rejected outright rather than trusted to
/// allocate; no legitimate message on this boundary approaches it.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds the {1} byte limit")]
    TooLarge(u32, u32),
    #[error("io error while framing a message: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes `payload` as a 4-byte big-endian length prefix followed by the
/// bytes themselves.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(FrameError::TooLarge(payload.len() as u32, MAX_FRAME_LEN));
    }
    let mut header = [0u8; 4];
    BigEndian::write_u32(&mut header, payload.len() as u32);
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame, or `Ok(None)` on a clean EOF at a
/// frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = BigEndian::read_u32(&header);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len, MAX_FRAME_LEN));
    }
    let mut buffer = vec![0u8; len as usize];
    reader.read_exact(&mut buffer).await?;
    Ok(Some(buffer))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_frame_through_an_in_memory_duplex() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_frame(&mut client, b"hello").await.unwrap();
        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(received, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocating() {
        let (mut client, _server) = tokio::io::duplex(256);
        let oversized = vec![0u8; (MAX_FRAME_LEN + 1) as usize];
        let result = write_frame(&mut client, &oversized).await;
        assert!(matches!(result, Err(FrameError::TooLarge(_, _))));
    }

    #[tokio::test]
    async fn clean_eof_at_a_frame_boundary_reads_as_none() {
        let (client, mut server) = tokio::io::duplex(256);
        drop(client);
        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(received, None);
    }
}
