//! Byte-stream views of a WebSocket connection
//!
//! The copier works on `AsyncRead`/`AsyncWrite`, while tungstenite speaks in
//! messages. `WsReader` yields the payload of every data message as a byte
//! stream and `WsWriter` sends each written chunk as one binary message.

use futures::{ready, Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;

pub struct WsReader<S> {
    inner: S,
    pending: Vec<u8>,
    offset: usize,
}

impl<S> WsReader<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl<S, E> AsyncRead for WsReader<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            if self.offset < self.pending.len() {
                let n = buf.remaining().min(self.pending.len() - self.offset);
                let start = self.offset;
                buf.put_slice(&self.pending[start..start + n]);
                self.offset += n;
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    self.pending = data;
                    self.offset = 0;
                }
                Some(Ok(Message::Text(text))) => {
                    self.pending = text.into_bytes();
                    self.offset = 0;
                }
                // control frames are answered by tungstenite itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
    }
}

pub struct WsWriter<S> {
    inner: S,
}

impl<S> WsWriter<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S, E> AsyncWrite for WsWriter<S>
where
    S: Sink<Message, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(io::Error::other)?;
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use futures::{stream, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::Error as WsError;

    #[tokio::test]
    async fn test_reader_concatenates_data_messages() {
        let messages: Vec<Result<Message, WsError>> = vec![
            Ok(Message::Binary(b"RFB ".to_vec())),
            Ok(Message::Ping(vec![1])),
            Ok(Message::Text("003.008\n".to_string())),
            Ok(Message::Close(None)),
            Ok(Message::Binary(b"ignored".to_vec())),
        ];
        let mut reader = WsReader::new(stream::iter(messages));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"RFB 003.008\n");
    }

    #[tokio::test]
    async fn test_reader_small_buffer() {
        let messages: Vec<Result<Message, WsError>> = vec![Ok(Message::Binary(b"abcdef".to_vec()))];
        let mut reader = WsReader::new(stream::iter(messages));

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reader_error() {
        let messages: Vec<Result<Message, WsError>> = vec![Err(WsError::ConnectionClosed)];
        let mut reader = WsReader::new(stream::iter(messages));
        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_writer_sends_binary_messages() {
        let (tx, rx) = mpsc::unbounded::<Message>();
        let mut writer = WsWriter::new(tx);
        writer.write_all(b"frame-1").await.unwrap();
        writer.flush().await.unwrap();
        writer.shutdown().await.unwrap();

        let sent: Vec<Message> = rx.collect().await;
        assert_eq!(sent, vec![Message::Binary(b"frame-1".to_vec())]);
    }
}
