use std::{
    future::Future,
    io::{self, IoSlice},
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
};

use bytes::{Buf, Bytes};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard},
};
use tokio_util::sync::CancellationToken;

use crate::{Result, WebSocketError};

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Byte stream the engine runs over, split into independently locked halves.
///
/// The write half lock doubles as the frame throttle: one frame is written at a
/// time, whether it comes from an application send, a close frame, a pong or a
/// keep-alive. A half set to `None` has been released by cleanup.
pub(crate) struct Transport {
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
}

/// Runs `fut` unless `token` fires first.
pub(crate) async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(WebSocketError::OperationCanceled),
        output = fut => Ok(output),
    }
}

/// A locked half. Dropping it after [`Transport::close`] releases the half, so an
/// operation that was in flight during the close lets go of the stream as it unwinds.
struct Half<'a, T> {
    guard: MutexGuard<'a, Option<T>>,
    closed: &'a AtomicBool,
}

impl<T> Deref for Half<'_, T> {
    type Target = Option<T>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for Half<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> Drop for Half<'_, T> {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            self.guard.take();
        }
    }
}

impl Transport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Some(Box::pin(reader))),
            writer: Mutex::new(Some(Box::pin(writer))),
            closed: AtomicBool::new(false),
        }
    }

    async fn lock<'a, T>(
        &'a self,
        half: &'a Mutex<Option<T>>,
        token: &CancellationToken,
    ) -> Result<Half<'a, T>> {
        let guard = cancellable(token, half.lock()).await?;
        Ok(Half {
            guard,
            closed: &self.closed,
        })
    }

    /// Reads into `buf`, returning 0 on end of stream.
    pub async fn read(&self, buf: &mut [u8], token: &CancellationToken) -> Result<usize> {
        let mut guard = self.lock(&self.reader, token).await?;
        let reader = guard
            .as_mut()
            .ok_or(WebSocketError::ConnectionClosedPrematurely)?;
        Ok(cancellable(token, reader.read(buf)).await??)
    }

    /// Writes the buffers of one frame, in order, and returns the number of bytes written.
    ///
    /// A header and payload pair goes out in a single vectored write when the
    /// stream supports it.
    pub async fn send_frame(&self, buffers: &[Bytes], token: &CancellationToken) -> Result<usize> {
        let total = buffers.iter().map(Bytes::len).sum();

        let mut guard = self.lock(&self.writer, token).await?;
        let writer = guard
            .as_mut()
            .ok_or(WebSocketError::ConnectionClosedPrematurely)?;
        Self::write_frame(writer, buffers, token).await?;
        Ok(total)
    }

    async fn write_frame(
        writer: &mut BoxedWriter,
        buffers: &[Bytes],
        token: &CancellationToken,
    ) -> Result<()> {
        match buffers {
            [header, payload] if writer.is_write_vectored() => {
                let mut frame = header.clone().chain(payload.clone());
                while frame.has_remaining() {
                    let mut slices = [IoSlice::new(&[]); 2];
                    let count = frame.chunks_vectored(&mut slices);
                    let n = cancellable(token, writer.write_vectored(&slices[..count])).await??;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }
                    frame.advance(n);
                }
            }
            _ => {
                for buffer in buffers {
                    cancellable(token, writer.write_all(buffer)).await??;
                }
            }
        }
        Ok(())
    }

    pub async fn flush(&self, token: &CancellationToken) -> Result<()> {
        let mut guard = self.lock(&self.writer, token).await?;
        let writer = guard
            .as_mut()
            .ok_or(WebSocketError::ConnectionClosedPrematurely)?;
        Ok(cancellable(token, writer.flush()).await??)
    }

    /// Shuts down the write direction of the underlying connection.
    pub async fn close_network_connection(&self, token: &CancellationToken) -> Result<()> {
        let mut guard = self.lock(&self.writer, token).await?;
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        Ok(cancellable(token, writer.shutdown()).await??)
    }

    /// Drops both halves. A half still held by an in-flight operation is dropped by
    /// that operation once it unwinds.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_send_frame_and_read() {
        let (local, mut remote) = duplex(64);
        let transport = Transport::new(local);
        let token = CancellationToken::new();

        let written = transport
            .send_frame(
                &[Bytes::from_static(&[0x82, 0x03]), Bytes::from_static(&[1, 2, 3])],
                &token,
            )
            .await
            .unwrap();
        assert_eq!(written, 5);

        let mut out = [0u8; 5];
        remote.read_exact(&mut out).await.unwrap();
        assert_eq!(out, [0x82, 0x03, 1, 2, 3]);

        remote.write_all(b"hey").await.unwrap();
        let mut buf = [0u8; 8];
        let n = transport.read(&mut buf, &token).await.unwrap();
        assert_eq!(&buf[..n], b"hey");
    }

    #[tokio::test]
    async fn test_read_is_cancellable() {
        let (local, _remote) = duplex(64);
        let transport = Transport::new(local);
        let token = CancellationToken::new();
        token.cancel();

        let mut buf = [0u8; 8];
        assert!(matches!(
            transport.read(&mut buf, &token).await,
            Err(WebSocketError::OperationCanceled)
        ));
    }

    #[tokio::test]
    async fn test_closed_transport() {
        let (local, _remote) = duplex(64);
        let transport = Transport::new(local);
        transport.close();

        let token = CancellationToken::new();
        let mut buf = [0u8; 8];
        assert!(matches!(
            transport.read(&mut buf, &token).await,
            Err(WebSocketError::ConnectionClosedPrematurely)
        ));
        assert!(transport.close_network_connection(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_during_read_releases_stream() {
        let (local, mut remote) = duplex(64);
        let transport = std::sync::Arc::new(Transport::new(local));
        let token = CancellationToken::new();

        let pending = tokio::spawn({
            let transport = transport.clone();
            let token = token.clone();
            async move {
                let mut buf = [0u8; 8];
                transport.read(&mut buf, &token).await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // the reader half is locked by the read, close can only take the writer
        transport.close();
        token.cancel();
        assert!(matches!(
            pending.await.unwrap(),
            Err(WebSocketError::OperationCanceled)
        ));

        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_during_dropped_write_releases_stream() {
        let (local, mut remote) = duplex(1);
        let transport = std::sync::Arc::new(Transport::new(local));

        let pending = tokio::spawn({
            let transport = transport.clone();
            async move {
                transport
                    .send_frame(&[Bytes::from_static(b"stalls")], &CancellationToken::new())
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        transport.close();
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"s");
    }

    #[tokio::test]
    async fn test_network_close_signals_eof() {
        let (local, mut remote) = duplex(64);
        let transport = Transport::new(local);
        let token = CancellationToken::new();

        transport.close_network_connection(&token).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }
}
