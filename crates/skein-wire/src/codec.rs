//! Length-prefixed postcard framing.
//!
//! Each frame is a big-endian `u32` length followed by the postcard
//! serialization of the message. Postcard is canonical and deterministic,
//! so frames are byte-stable for a given message.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::WireError;

/// Upper bound on a single frame.
///
/// A `SendShuffleData` batch is bounded by the client's buffer thresholds,
/// which sit far below this; anything larger indicates a corrupt or
/// hostile peer.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Writes one framed message.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = postcard::to_allocvec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message.
///
/// Returns [`WireError::ConnectionClosed`] on a clean EOF between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(postcard::from_bytes(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Request, RequestId, RequestPayload};
    use skein_types::AppId;

    #[tokio::test]
    async fn frame_round_trip() {
        let req = Request::new(
            RequestId(7),
            RequestPayload::AppHeartbeat {
                app_id: AppId::from("app-7"),
            },
        );

        let mut buf = Vec::new();
        write_frame(&mut buf, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let back: Request = read_frame(&mut cursor).await.unwrap();
        assert_eq!(req, back);
    }

    #[tokio::test]
    async fn eof_between_frames_is_connection_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let err = read_frame::<_, Request>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, Request>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
    }
}
