#![allow(dead_code)]

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex, Once},
    task::{Context, Poll},
};

use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use wsbase::{Options, WebSocket};

pub const MASK: [u8; 4] = [0x5a, 0x11, 0xc3, 0x7e];

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = simple_logger::init_with_level(log::Level::Debug);
    });
}

/// Small buffers and no heartbeat, so tests only see the frames they cause.
pub fn options() -> Options {
    Options::default()
        .with_receive_buffer_size(256)
        .with_send_buffer_size(64)
        .without_keep_alive()
}

/// A server connection and the client end of its stream.
pub async fn connect(options: Options) -> anyhow::Result<(WebSocket, DuplexStream)> {
    init_logging();
    let (server, client) = duplex(64 * 1024);
    let ws = WebSocket::accept(server, options).await?;
    Ok((ws, client))
}

/// A masked client frame.
pub fn client_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![(fin as u8) << 7 | opcode];
    match payload.len() {
        len if len < 126 => frame.push(0x80 | len as u8),
        len if len <= u16::MAX as usize => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(&MASK);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ MASK[i % 4]));
    frame
}

pub fn close_body(code: u16, reason: &str) -> Vec<u8> {
    let mut body = code.to_be_bytes().to_vec();
    body.extend_from_slice(reason.as_bytes());
    body
}

/// Reads one unmasked server frame, returning its first header byte and payload.
pub async fn read_frame(stream: &mut DuplexStream) -> anyhow::Result<(u8, Vec<u8>)> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    anyhow::ensure!(head[1] & 0x80 == 0, "server frames are never masked");

    let len = match head[1] & 0x7f {
        126 => stream.read_u16().await? as usize,
        127 => stream.read_u64().await? as usize,
        len => len as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((head[0], payload))
}

pub async fn send_client_frame(
    stream: &mut DuplexStream,
    fin: bool,
    opcode: u8,
    payload: &[u8],
) -> anyhow::Result<()> {
    stream.write_all(&client_frame(fin, opcode, payload)).await?;
    Ok(())
}

/// A stream that never yields data and records every write call.
#[derive(Clone, Default)]
pub struct Recorder {
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    pub vectored: Arc<Mutex<usize>>,
}

impl Recorder {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn vectored_writes(&self) -> usize {
        *self.vectored.lock().unwrap()
    }
}

impl AsyncRead for Recorder {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for Recorder {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.writes.lock().unwrap().push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let data: Vec<u8> = bufs.iter().flat_map(|buf| buf.iter().copied()).collect();
        let len = data.len();
        self.writes.lock().unwrap().push(data);
        *self.vectored.lock().unwrap() += 1;
        Poll::Ready(Ok(len))
    }

    fn is_write_vectored(&self) -> bool {
        true
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
