mod common;

use std::sync::{Arc, Mutex};

use common::{init_logging, options};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use wsbase::{
    codec::{
        Action, ActionContext, ActionQueue, ActionRequest, BufferType, CodecBuffer, Property,
        ProtocolCodec,
    },
    CancellationToken, MessageType, Result, WebSocket, WebSocketError, WebSocketState,
};

fn workspace(properties: &[Property]) -> (usize, usize) {
    properties
        .iter()
        .find_map(|property| match *property {
            Property::AllocatedBuffer { address, length } => Some((address, length)),
            _ => None,
        })
        .unwrap_or_default()
}

/// Frames are one length byte followed by the payload.
#[derive(Default)]
struct LengthPrefixCodec {
    base: usize,
    outgoing: Option<CodecBuffer>,
    written: bool,
    armed: bool,
    expected: Option<usize>,
    filled: usize,
}

const LENGTH_AT: usize = 0;
const PAYLOAD_AT: usize = 16;

impl LengthPrefixCodec {
    fn request(&self, action: Action, buffer_type: BufferType, buffers: Vec<CodecBuffer>) -> ActionRequest {
        ActionRequest {
            action,
            buffer_type,
            buffers,
            context: ActionContext::new(action as u64),
        }
    }
}

impl ProtocolCodec for LengthPrefixCodec {
    fn get_action(
        &mut self,
        queue: ActionQueue,
        workspace: &mut [u8],
        _max_buffers: usize,
    ) -> Result<ActionRequest> {
        match queue {
            ActionQueue::Send => {
                if let Some(payload) = self.outgoing.take() {
                    workspace[LENGTH_AT] = payload.len() as u8;
                    let header = CodecBuffer::data(self.base + LENGTH_AT, 1);
                    return Ok(self.request(
                        Action::SendToNetwork,
                        BufferType::BinaryMessage,
                        vec![header, payload],
                    ));
                }
                if std::mem::take(&mut self.written) {
                    return Ok(self.request(Action::IndicateSendComplete, BufferType::None, vec![]));
                }
            }
            ActionQueue::Receive if self.armed => {
                let request = match self.expected {
                    None => self.request(
                        Action::ReceiveFromNetwork,
                        BufferType::None,
                        vec![CodecBuffer::data(self.base + LENGTH_AT, 1)],
                    ),
                    Some(len) if self.filled < len => self.request(
                        Action::ReceiveFromNetwork,
                        BufferType::None,
                        vec![CodecBuffer::data(self.base + PAYLOAD_AT + self.filled, len - self.filled)],
                    ),
                    Some(len) => self.request(
                        Action::IndicateReceiveComplete,
                        BufferType::BinaryMessage,
                        vec![CodecBuffer::data(self.base + PAYLOAD_AT, len)],
                    ),
                };
                return Ok(request);
            }
            ActionQueue::Receive => {}
        }
        Ok(ActionRequest::none(ActionContext::new(0)))
    }

    fn complete_action(&mut self, context: ActionContext, workspace: &mut [u8], bytes: usize) -> Result<()> {
        match context.id() {
            id if id == Action::SendToNetwork as u64 => self.written = true,
            id if id == Action::ReceiveFromNetwork as u64 => match self.expected {
                None if bytes == 1 => self.expected = Some(workspace[LENGTH_AT] as usize),
                None => {}
                Some(_) => self.filled += bytes,
            },
            id if id == Action::IndicateReceiveComplete as u64 => {
                self.armed = false;
                self.expected = None;
                self.filled = 0;
            }
            _ => {}
        }
        Ok(())
    }

    fn send(&mut self, _buffer_type: BufferType, buffer: CodecBuffer) -> Result<()> {
        self.outgoing = Some(buffer);
        Ok(())
    }

    fn send_without_body(&mut self, _buffer_type: BufferType) -> Result<()> {
        Ok(())
    }

    fn receive(&mut self) -> Result<()> {
        self.armed = true;
        Ok(())
    }

    fn abort(&mut self) {}
}

/// Reports buffers that leave the memory it was given.
struct EscapingCodec {
    base: usize,
    length: usize,
    outgoing: Option<CodecBuffer>,
}

impl ProtocolCodec for EscapingCodec {
    fn get_action(
        &mut self,
        queue: ActionQueue,
        _workspace: &mut [u8],
        _max_buffers: usize,
    ) -> Result<ActionRequest> {
        let (action, buffer) = match (queue, self.outgoing) {
            (ActionQueue::Receive, _) => (
                Action::ReceiveFromNetwork,
                CodecBuffer::data(self.base + self.length, 1),
            ),
            (ActionQueue::Send, Some(payload)) => (
                Action::SendToNetwork,
                CodecBuffer::data(payload.address(), payload.len() + 1),
            ),
            (ActionQueue::Send, None) => return Ok(ActionRequest::none(ActionContext::new(0))),
        };
        Ok(ActionRequest {
            action,
            buffer_type: BufferType::BinaryMessage,
            buffers: vec![buffer],
            context: ActionContext::new(1),
        })
    }

    fn complete_action(&mut self, _context: ActionContext, _workspace: &mut [u8], _bytes: usize) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, _buffer_type: BufferType, buffer: CodecBuffer) -> Result<()> {
        self.outgoing = Some(buffer);
        Ok(())
    }

    fn send_without_body(&mut self, _buffer_type: BufferType) -> Result<()> {
        Ok(())
    }

    fn receive(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) {}
}

async fn escaping() -> anyhow::Result<(WebSocket, (usize, usize), tokio::io::DuplexStream)> {
    init_logging();
    let (server, client) = duplex(1024);
    let seen = Arc::new(Mutex::new((0, 0)));
    let ws = WebSocket::with_codec(server, options(), {
        let seen = seen.clone();
        move |properties: &[Property]| {
            let (base, length) = workspace(properties);
            *seen.lock().unwrap() = (base, length);
            Ok(EscapingCodec {
                base,
                length,
                outgoing: None,
            })
        }
    })
    .await?;
    let geometry = *seen.lock().unwrap();
    Ok((ws, geometry, client))
}

#[tokio::test]
async fn test_codec_properties() -> anyhow::Result<()> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (server, _client) = duplex(1024);
    WebSocket::with_codec(server, options().without_masking(), {
        let seen = seen.clone();
        move |properties: &[Property]| {
            seen.lock().unwrap().extend_from_slice(properties);
            Ok(LengthPrefixCodec::default())
        }
    })
    .await?;

    let properties = seen.lock().unwrap().clone();
    assert!(properties.contains(&Property::ReceiveBufferSize(256)));
    assert!(properties.contains(&Property::SendBufferSize(64)));
    assert!(properties.contains(&Property::DisableMasking(true)));
    assert!(properties.contains(&Property::DisableUtf8Verification(false)));
    assert!(properties.contains(&Property::KeepAliveInterval(0)));

    let (address, length) = workspace(&properties);
    assert_ne!(address, 0);
    assert!(length >= 256 + 64);
    Ok(())
}

#[tokio::test]
async fn test_custom_codec_round_trip() -> anyhow::Result<()> {
    init_logging();
    let (server, mut client) = duplex(1024);
    let ws = WebSocket::with_codec(server, options(), |properties: &[Property]| {
        Ok(LengthPrefixCodec {
            base: workspace(properties).0,
            ..Default::default()
        })
    })
    .await?;
    let token = CancellationToken::new();

    client.write_all(&[3, b'a', b'b', b'c']).await?;
    let mut buf = [0u8; 8];
    let result = ws.receive(&mut buf, &token).await?;
    assert_eq!(result.message_type, MessageType::Binary);
    assert!(result.end_of_message);
    assert_eq!(&buf[..result.count], b"abc");

    ws.send(&b"hi"[..], MessageType::Binary, true, &token).await?;
    let mut out = [0u8; 3];
    client.read_exact(&mut out).await?;
    assert_eq!(out, [2, b'h', b'i']);
    Ok(())
}

#[tokio::test]
async fn test_read_outside_workspace_is_a_contract_violation() -> anyhow::Result<()> {
    let (ws, (base, len), _client) = escaping().await?;

    let mut buf = [0u8; 8];
    let err = ws
        .receive(&mut buf, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_contract_violation());
    assert!(matches!(
        err,
        WebSocketError::BufferContractViolation { address, length: 1 } if address == base + len
    ));
    assert_eq!(ws.state(), WebSocketState::Aborted);
    Ok(())
}

#[tokio::test]
async fn test_write_past_pinned_payload_is_a_contract_violation() -> anyhow::Result<()> {
    let (ws, _, _client) = escaping().await?;

    let err = ws
        .send(&b"abc"[..], MessageType::Binary, true, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, WebSocketError::BufferContractViolation { length: 4, .. }),
        "{err:?}"
    );
    assert_eq!(ws.state(), WebSocketState::Aborted);
    Ok(())
}
