//! Length-prefixed framing.
//!
//! Every message is a 4-byte big-endian payload length followed by that many
//! payload bytes. The header is read on its own so an oversized frame can be
//! refused before any of its body is buffered.

use std::io::ErrorKind as IoErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use taskroot_core::{Error, Result};

/// Width of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Read a frame header. Returns `None` when the peer closed the stream.
pub async fn read_header<R>(reader: &mut R) -> Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => Ok(Some(u32::from_be_bytes(header) as usize)),
        Err(e) if e.kind() == IoErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Read exactly `len` payload bytes.
pub async fn read_body<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == IoErrorKind::UnexpectedEof {
            Error::ConnectionClosed("stream ended inside a frame".to_string())
        } else {
            Error::Io(e)
        }
    })?;
    Ok(body)
}

/// Read one whole frame, refusing bodies larger than `max_len` unread.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let Some(len) = read_header(reader).await? else {
        return Ok(None);
    };
    if len > max_len {
        return Err(Error::FrameTooLarge {
            size: len,
            max: max_len,
        });
    }
    read_body(reader, len).await.map(Some)
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_len || payload.len() > u32::MAX as usize {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            max: max_len,
        });
    }
    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_is_big_endian() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"hello", 1024).await.unwrap();

        let mut header = [0u8; HEADER_LEN];
        b.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0, 0, 0, 5]);
        assert_eq!(read_body(&mut b, 5).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_oversized_body_is_not_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&1000u32.to_be_bytes()).await.unwrap();
        a.write_all(b"xyz").await.unwrap();

        let err = read_frame(&mut b, 10).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { size: 1000, max: 10 }));

        // the body is still in the pipe
        let mut rest = [0u8; 3];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"xyz");
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_connection_closed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_write_refuses_oversized_payload() {
        let (mut a, _b) = tokio::io::duplex(64);
        let err = write_frame(&mut a, &[0u8; 11], 10).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { size: 11, max: 10 }));
    }
}
