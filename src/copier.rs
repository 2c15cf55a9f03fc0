//! Byte relay that gives up when the source goes quiet

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),
    #[error("short write")]
    ShortWrite,
    #[error("writer reported more bytes than it was given")]
    InvalidWrite,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CopyError {
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, CopyError::IdleTimeout(_))
    }
}

/// Copy `src` into `dst` until EOF, returning the number of bytes moved.
///
/// Every read is raced against `idle_timeout`; `None` waits forever. Each
/// chunk is written in full and flushed before the next read.
pub async fn copy_with_idle_timeout<R, W>(
    dst: &mut W,
    src: &mut R,
    idle_timeout: Option<Duration>,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let read = src.read(&mut buf);
        let n = match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| CopyError::IdleTimeout(limit))??,
            None => read.await?,
        };

        if n == 0 {
            dst.flush().await?;
            return Ok(total);
        }

        write_chunk(dst, &buf[..n]).await?;
        total += n as u64;
    }
}

async fn write_chunk<W>(dst: &mut W, chunk: &[u8]) -> Result<(), CopyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < chunk.len() {
        let remaining = chunk.len() - written;
        let n = dst.write(&chunk[written..]).await?;
        if n > remaining {
            return Err(CopyError::InvalidWrite);
        }
        if n == 0 {
            return Err(CopyError::ShortWrite);
        }
        written += n;
    }
    dst.flush().await?;
    Ok(())
}
