use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, AppResult, SessionError};

pub(crate) const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Reads one newline-terminated JSON frame.
///
/// At most `MAX_FRAME_BYTES` plus the terminator is buffered; a longer line
/// fails with `FrameTooLarge` without waiting for its end.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> AppResult<T>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let limit = u64::try_from(MAX_FRAME_BYTES).unwrap_or(u64::MAX).saturating_add(1);
    let mut limited = (&mut *reader).take(limit);
    let bytes = limited.read_until(b'\n', &mut buffer).await.map_err(|err| {
        AppError::session(SessionError::Io {
            context: "read frame",
            source: err,
        })
    })?;
    if bytes == 0 {
        return Err(AppError::session(SessionError::ConnectionClosed));
    }
    if buffer.len() > MAX_FRAME_BYTES && !buffer.ends_with(b"\n") {
        return Err(AppError::session(SessionError::FrameTooLarge {
            max_bytes: MAX_FRAME_BYTES,
        }));
    }
    if buffer.ends_with(b"\n") {
        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }
    }
    let line = std::str::from_utf8(&buffer)
        .map_err(|err| AppError::session(SessionError::FrameInvalidUtf8 { source: err }))?;
    serde_json::from_str::<T>(line).map_err(|err| {
        AppError::session(SessionError::Deserialize {
            context: "frame",
            source: err,
        })
    })
}

pub(crate) async fn send_frame<W, T>(writer: &mut W, frame: &T) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut payload = serde_json::to_string(frame).map_err(|err| {
        AppError::session(SessionError::Serialize {
            context: "frame",
            source: err,
        })
    })?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await.map_err(|err| {
        AppError::session(SessionError::Io {
            context: "send frame",
            source: err,
        })
    })?;
    writer.flush().await.map_err(|err| {
        AppError::session(SessionError::Io {
            context: "flush frame",
            source: err,
        })
    })
}
