//! Length-prefixed frame codec.
//!
//! Wire format:
//!
//! ```text
//! +--------------------+----------------------------+
//! | Length             | Payload                    |
//! | 4 bytes (BE32)     | UTF-8, exactly Length bytes|
//! +--------------------+----------------------------+
//! ```

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::constants::{FRAME_HEADER_SIZE, MAX_FRAME_LEN};
use crate::core::{ProtocolError, TransportError};
use crate::transport::envelope::Envelope;

/// Encode a payload into one wire frame.
pub fn encode(payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(bytes);
    frame
}

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` when the stream has closed (EOF on the header, EOF
/// mid-payload, or an empty payload). A length prefix at or above
/// [`MAX_FRAME_LEN`] is assumed corrupt or hostile and is surfaced as a
/// bare heartbeat envelope without allocating or reading the claimed
/// payload; the unread bytes will desynchronize the stream and the next
/// read tears the connection down through the normal error path.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = i32::from_be_bytes(header);
    if length < 0 {
        return Err(ProtocolError::NegativeLength(length).into());
    }
    let length = length as usize;
    if length >= MAX_FRAME_LEN {
        return Ok(Some(Envelope::heartbeat().encode()));
    }

    let mut payload = vec![0u8; length];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let payload = String::from_utf8(payload).map_err(ProtocolError::from)?;
    if payload.is_empty() {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Encode `payload` and write it to `writer` as one frame.
///
/// The caller is responsible for holding the connection's write lock so
/// that header and payload of concurrent senders are never interleaved.
pub async fn write_frame<W>(writer: &mut W, payload: &str) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(payload)).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(bytes: &[u8]) -> Result<Option<String>, TransportError> {
        let mut reader = bytes;
        read_frame(&mut reader).await
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let payloads = ["hello", "1#@%some business payload", "héllo wörld ✓"];
        for payload in payloads {
            let decoded = decode(&encode(payload)).await.unwrap();
            assert_eq!(decoded.as_deref(), Some(payload));
        }
    }

    #[tokio::test]
    async fn test_length_prefix_matches_byte_length() {
        // Multi-byte characters: prefix counts bytes, not chars.
        let frame = encode("héllo");
        assert_eq!(u32::from_be_bytes(frame[..4].try_into().unwrap()), 6);
    }

    #[tokio::test]
    async fn test_eof_on_header_is_stream_closed() {
        assert!(decode(&[]).await.unwrap().is_none());
        assert!(decode(&[0, 0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_payload_is_stream_closed() {
        let mut frame = encode("hello");
        frame.truncate(6);
        assert!(decode(&frame).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_payload_is_stream_closed() {
        assert!(decode(&encode("")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_negative_length_is_protocol_error() {
        let frame = (-1i32).to_be_bytes();
        match decode(&frame).await {
            Err(TransportError::Protocol(ProtocolError::NegativeLength(-1))) => {}
            other => panic!("expected negative-length error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversize_length_yields_heartbeat_sentinel() {
        // A hostile prefix must not trigger a multi-megabyte allocation.
        let frame = (MAX_FRAME_LEN as u32).to_be_bytes();
        let decoded = decode(&frame).await.unwrap().unwrap();
        assert_eq!(decoded, Envelope::heartbeat().encode());

        let frame = (i32::MAX).to_be_bytes();
        let decoded = decode(&frame).await.unwrap().unwrap();
        assert_eq!(decoded, Envelope::heartbeat().encode());
    }

    #[tokio::test]
    async fn test_boundary_length_below_guard_reads_normally() {
        let payload = "x".repeat(1024);
        let decoded = decode(&encode(&payload)).await.unwrap();
        assert_eq!(decoded.as_deref(), Some(payload.as_str()));
    }

    #[tokio::test]
    async fn test_two_frames_back_to_back() {
        let mut bytes = encode("first");
        bytes.extend_from_slice(&encode("second"));
        let mut reader = bytes.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("first"));
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("second"));
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_frame_through_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, "over the wire").await.unwrap();
        let decoded = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded.as_deref(), Some("over the wire"));
    }
}
