use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::{
    Action, ActionContext, ActionQueue, ActionRequest, BufferType, CodecBuffer, HeaderDecoder,
    Property, ProtocolCodec, Utf8Validator,
};
use crate::{
    close::CloseCode,
    frame::{FrameHeader, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask, Result, WebSocketError,
};

/// Frame currently being streamed out of the inbound buffer.
struct InboundFrame {
    header: FrameHeader,
    /// Payload bytes already delivered.
    consumed: usize,
}

/// Receive-queue action waiting for its completion.
#[derive(Clone, Copy)]
enum Inflight {
    Read,
    Pong,
    Indicate,
}

struct Outgoing {
    buffer_type: BufferType,
    body: Option<CodecBuffer>,
}

enum SendStage {
    Idle,
    Queued(Outgoing),
    Writing(ActionContext),
    Written,
    Flushing(ActionContext),
}

/// Frame type and buffer of something ready to be indicated to the engine.
type Delivery = (BufferType, Option<CodecBuffer>);

/// RFC 6455 server codec.
///
/// The native workspace is laid out as three consecutive areas:
///
/// ```text
/// [ receive area: receive size ][ header area: send size ][ control area ]
/// ```
///
/// Network reads land in the receive area and are moved into an internal inbound
/// buffer on completion. Unmasked payload chunks (at most one receive buffer each)
/// and close reasons are written back into the receive area before being indicated.
/// Outgoing frame headers are formatted in the header area, while pongs answering
/// pings are formatted, payload included, in the control area.
///
/// Pings are answered on the receive queue, so a pong only goes out while the
/// application is receiving.
pub struct ServerCodec {
    base: usize,
    length: usize,
    receive_size: usize,
    send_size: usize,
    require_mask: bool,
    check_utf8: bool,

    next_context: u64,
    aborted: bool,

    inbound: BytesMut,
    decoder: HeaderDecoder,
    frame: Option<InboundFrame>,
    /// Opcode of the data message being received, if any.
    message: Option<OpCode>,
    utf8: Utf8Validator,
    receive_armed: bool,
    receive_inflight: Option<(ActionContext, Inflight)>,
    pongs: VecDeque<Bytes>,
    indication: Option<Delivery>,
    close_received: bool,

    outbound: SendStage,
    send_continuation: bool,
    close_sent: bool,
}

impl ServerCodec {
    /// Creates the codec from the setup properties written by the engine.
    pub fn new(properties: &[Property]) -> Result<Self> {
        let mut receive_size = None;
        let mut send_size = None;
        let mut workspace = None;
        let mut require_mask = true;
        let mut check_utf8 = true;

        for property in properties {
            match *property {
                Property::ReceiveBufferSize(size) => receive_size = Some(size as usize),
                Property::SendBufferSize(size) => send_size = Some(size as usize),
                Property::AllocatedBuffer { address, length } => workspace = Some((address, length)),
                Property::DisableMasking(disabled) => require_mask = !disabled,
                Property::DisableUtf8Verification(disabled) => check_utf8 = !disabled,
                Property::KeepAliveInterval(_) => {}
            }
        }

        let (Some(receive_size), Some(send_size), Some((base, length))) =
            (receive_size, send_size, workspace)
        else {
            return Err(WebSocketError::InvalidAction("missing codec property"));
        };

        if receive_size < MAX_CONTROL_PAYLOAD
            || send_size < MAX_HEAD_SIZE + 2
            || length < receive_size + send_size + MAX_HEAD_SIZE + MAX_CONTROL_PAYLOAD
        {
            return Err(WebSocketError::InvalidAction("codec workspace too small"));
        }

        Ok(Self {
            base,
            length,
            receive_size,
            send_size,
            require_mask,
            check_utf8,
            next_context: 0,
            aborted: false,
            inbound: BytesMut::with_capacity(receive_size),
            decoder: HeaderDecoder::default(),
            frame: None,
            message: None,
            utf8: Utf8Validator::default(),
            receive_armed: false,
            receive_inflight: None,
            pongs: VecDeque::new(),
            indication: None,
            close_received: false,
            outbound: SendStage::Idle,
            send_continuation: false,
            close_sent: false,
        })
    }

    fn next_context(&mut self) -> ActionContext {
        self.next_context += 1;
        ActionContext::new(self.next_context)
    }

    fn next_receive_action(&mut self, workspace: &mut [u8]) -> Result<ActionRequest> {
        if self.receive_inflight.is_some() {
            return Err(WebSocketError::InvalidAction("receive action still outstanding"));
        }
        if !self.receive_armed {
            return Ok(ActionRequest::none(self.next_context()));
        }

        let delivery = match self.indication.take() {
            Some(delivery) => Some(delivery),
            None => self.poll_frame(workspace)?,
        };

        // a ping parsed above is answered before it is indicated
        if let Some(payload) = self.pongs.pop_front() {
            self.indication = delivery;

            let offset = self.receive_size + self.send_size;
            let header = FrameHeader::new(true, OpCode::Pong, payload.len());
            let n = header.format(&mut workspace[offset..]);
            workspace[offset + n..offset + n + payload.len()].copy_from_slice(&payload);

            let context = self.next_context();
            self.receive_inflight = Some((context, Inflight::Pong));
            return Ok(ActionRequest {
                action: Action::SendToNetwork,
                buffer_type: BufferType::PingPong,
                buffers: vec![CodecBuffer::data(self.base + offset, n + payload.len())],
                context,
            });
        }

        let context = self.next_context();
        match delivery {
            Some((buffer_type, buffer)) => {
                self.receive_inflight = Some((context, Inflight::Indicate));
                Ok(ActionRequest {
                    action: Action::IndicateReceiveComplete,
                    buffer_type,
                    buffers: buffer.into_iter().collect(),
                    context,
                })
            }
            None => {
                self.receive_inflight = Some((context, Inflight::Read));
                Ok(ActionRequest {
                    action: Action::ReceiveFromNetwork,
                    buffer_type: BufferType::None,
                    buffers: vec![CodecBuffer::data(self.base, self.receive_size)],
                    context,
                })
            }
        }
    }

    /// Decodes as much of the inbound buffer as needed to produce the next delivery.
    fn poll_frame(&mut self, workspace: &mut [u8]) -> Result<Option<Delivery>> {
        if self.frame.is_none() {
            let Some(header) = self.decoder.decode(&mut self.inbound)? else {
                return Ok(None);
            };
            self.accept_header(&header)?;
            self.frame = Some(InboundFrame {
                header,
                consumed: 0,
            });
        }

        let Some(frame) = self.frame.as_ref() else {
            return Ok(None);
        };
        let header = frame.header;
        let consumed = frame.consumed;

        if header.opcode.is_control() {
            if self.inbound.len() < header.payload_len {
                return Ok(None);
            }
            let mut payload = self.inbound.split_to(header.payload_len);
            if let Some(key) = header.mask {
                mask::unmask(&mut payload, key, 0);
            }
            self.frame = None;

            return match header.opcode {
                OpCode::Ping => {
                    self.pongs.push_back(payload.freeze());
                    Ok(Some((BufferType::PingPong, None)))
                }
                OpCode::Pong => Ok(Some((BufferType::PingPong, None))),
                _ => self.on_close(&payload, workspace).map(Some),
            };
        }

        let remaining = header.payload_len - consumed;
        let chunk = self.inbound.len().min(remaining).min(self.receive_size);
        if chunk == 0 && remaining > 0 {
            return Ok(None);
        }

        workspace[..chunk].copy_from_slice(&self.inbound[..chunk]);
        self.inbound.advance(chunk);
        if let Some(key) = header.mask {
            mask::unmask(&mut workspace[..chunk], key, consumed);
        }

        let Some(opcode) = self.message else {
            return Err(WebSocketError::InvalidContinuationFrame);
        };
        let consumed = consumed + chunk;
        let frame_done = consumed == header.payload_len;
        let message_done = frame_done && header.fin;
        let text = opcode == OpCode::Text;

        if text && self.check_utf8 {
            self.utf8.feed(&workspace[..chunk], message_done)?;
        }

        if frame_done {
            self.frame = None;
            if header.fin {
                self.message = None;
            }
        } else if let Some(frame) = self.frame.as_mut() {
            frame.consumed = consumed;
        }

        let buffer_type = match (text, message_done) {
            (true, true) => BufferType::Utf8Message,
            (true, false) => BufferType::Utf8Fragment,
            (false, true) => BufferType::BinaryMessage,
            (false, false) => BufferType::BinaryFragment,
        };

        Ok(Some((buffer_type, Some(CodecBuffer::data(self.base, chunk)))))
    }

    fn accept_header(&mut self, header: &FrameHeader) -> Result<()> {
        if header.mask.is_none() && self.require_mask {
            return Err(WebSocketError::UnmaskedFrame);
        }

        match header.opcode {
            OpCode::Continuation if self.message.is_none() => {
                Err(WebSocketError::InvalidContinuationFrame)
            }
            OpCode::Text | OpCode::Binary if self.message.is_some() => {
                Err(WebSocketError::InvalidFragment)
            }
            OpCode::Text | OpCode::Binary => {
                self.message = Some(header.opcode);
                self.utf8.reset();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_close(&mut self, payload: &[u8], workspace: &mut [u8]) -> Result<Delivery> {
        self.close_received = true;

        let (status, reason) = match payload.len() {
            0 => (CloseCode::Empty, &[][..]),
            1 => return Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let status = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                if !status.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }
                (status, &payload[2..])
            }
        };
        Utf8Validator::default().feed(reason, true)?;

        workspace[..reason.len()].copy_from_slice(reason);
        Ok((
            BufferType::Close,
            Some(CodecBuffer::Close {
                address: self.base,
                length: reason.len(),
                status: u16::from(status),
            }),
        ))
    }

    fn next_send_action(
        &mut self,
        workspace: &mut [u8],
        max_buffers: usize,
    ) -> Result<ActionRequest> {
        match std::mem::replace(&mut self.outbound, SendStage::Idle) {
            SendStage::Idle => Ok(ActionRequest::none(self.next_context())),
            SendStage::Queued(outgoing) => {
                let buffer_type = outgoing.buffer_type;
                let buffers = self.format_outgoing(outgoing, workspace)?;
                if buffers.len() > max_buffers {
                    return Err(WebSocketError::InvalidAction("too many send buffers"));
                }
                let context = self.next_context();
                self.outbound = SendStage::Writing(context);
                Ok(ActionRequest {
                    action: Action::SendToNetwork,
                    buffer_type,
                    buffers,
                    context,
                })
            }
            SendStage::Written => {
                let context = self.next_context();
                self.outbound = SendStage::Flushing(context);
                Ok(ActionRequest {
                    action: Action::IndicateSendComplete,
                    buffer_type: BufferType::None,
                    buffers: Vec::new(),
                    context,
                })
            }
            stage @ (SendStage::Writing(_) | SendStage::Flushing(_)) => {
                self.outbound = stage;
                Err(WebSocketError::InvalidAction("send action still outstanding"))
            }
        }
    }

    /// Writes the frame header into the header area and returns the header and payload buffers.
    fn format_outgoing(
        &mut self,
        outgoing: Outgoing,
        workspace: &mut [u8],
    ) -> Result<Vec<CodecBuffer>> {
        let (opcode, fin, status, payload) = match (outgoing.buffer_type, outgoing.body) {
            (
                BufferType::Utf8Message
                | BufferType::Utf8Fragment
                | BufferType::BinaryMessage
                | BufferType::BinaryFragment,
                body,
            ) => {
                let opcode = if self.send_continuation {
                    OpCode::Continuation
                } else if matches!(
                    outgoing.buffer_type,
                    BufferType::Utf8Message | BufferType::Utf8Fragment
                ) {
                    OpCode::Text
                } else {
                    OpCode::Binary
                };
                let fin = outgoing.buffer_type.is_end_of_message();
                self.send_continuation = !fin;
                (opcode, fin, None, body)
            }
            (BufferType::Close, Some(CodecBuffer::Close { address, length, status })) => {
                self.close_sent = true;
                (
                    OpCode::Close,
                    true,
                    Some(status),
                    Some(CodecBuffer::data(address, length)),
                )
            }
            (BufferType::Close, _) => {
                self.close_sent = true;
                (OpCode::Close, true, None, None)
            }
            (BufferType::PingPong | BufferType::UnsolicitedPong, body) => {
                (OpCode::Pong, true, None, body)
            }
            (BufferType::None, _) => {
                return Err(WebSocketError::InvalidAction("cannot send a frame without type"))
            }
        };

        let payload = payload.filter(|payload| !payload.is_empty());
        let payload_len =
            payload.map_or(0, |payload| payload.len()) + status.map_or(0, |_| 2);

        let offset = self.receive_size;
        let area = &mut workspace[offset..offset + self.send_size];
        let mut n = FrameHeader::new(fin, opcode, payload_len).format(area);
        if let Some(status) = status {
            area[n..n + 2].copy_from_slice(&status.to_be_bytes());
            n += 2;
        }

        let mut buffers = vec![CodecBuffer::data(self.base + offset, n)];
        if let Some(payload) = payload {
            buffers.push(CodecBuffer::data(payload.address(), payload.len()));
        }
        Ok(buffers)
    }

    fn queue_send(&mut self, buffer_type: BufferType, body: Option<CodecBuffer>) -> Result<()> {
        if self.aborted {
            return Err(WebSocketError::InvalidAction("codec aborted"));
        }
        if !matches!(self.outbound, SendStage::Idle) {
            return Err(WebSocketError::InvalidAction("send already queued"));
        }
        if self.close_sent {
            return Err(WebSocketError::InvalidAction("close frame already sent"));
        }

        let valid = match (buffer_type, body) {
            (
                BufferType::Utf8Message
                | BufferType::Utf8Fragment
                | BufferType::BinaryMessage
                | BufferType::BinaryFragment,
                Some(CodecBuffer::Data { .. }),
            ) => true,
            (BufferType::Close, None | Some(CodecBuffer::Close { .. })) => true,
            (BufferType::PingPong | BufferType::UnsolicitedPong, None) => true,
            (BufferType::PingPong | BufferType::UnsolicitedPong, Some(CodecBuffer::Data { length, .. })) => {
                length <= MAX_CONTROL_PAYLOAD
            }
            _ => false,
        };
        if !valid {
            return Err(WebSocketError::InvalidAction("buffer type does not match body"));
        }

        self.outbound = SendStage::Queued(Outgoing { buffer_type, body });
        Ok(())
    }
}

impl ProtocolCodec for ServerCodec {
    fn get_action(
        &mut self,
        queue: ActionQueue,
        workspace: &mut [u8],
        max_buffers: usize,
    ) -> Result<ActionRequest> {
        if self.aborted {
            return Err(WebSocketError::InvalidAction("codec aborted"));
        }
        if workspace.len() != self.length || workspace.as_ptr() as usize != self.base {
            return Err(WebSocketError::InvalidAction("unexpected codec workspace"));
        }

        match queue {
            ActionQueue::Send => self.next_send_action(workspace, max_buffers),
            ActionQueue::Receive => self.next_receive_action(workspace),
        }
    }

    fn complete_action(
        &mut self,
        context: ActionContext,
        workspace: &mut [u8],
        bytes: usize,
    ) -> Result<()> {
        if let Some((pending, inflight)) = self.receive_inflight {
            if pending == context {
                self.receive_inflight = None;
                match inflight {
                    Inflight::Read => {
                        if bytes > self.receive_size {
                            return Err(WebSocketError::InvalidAction("read past receive area"));
                        }
                        self.inbound.extend_from_slice(&workspace[..bytes]);
                    }
                    Inflight::Pong => {}
                    Inflight::Indicate => self.receive_armed = false,
                }
                return Ok(());
            }
        }

        match self.outbound {
            SendStage::Writing(pending) if pending == context => {
                self.outbound = SendStage::Written;
                Ok(())
            }
            SendStage::Flushing(pending) if pending == context => {
                self.outbound = SendStage::Idle;
                Ok(())
            }
            _ => Err(WebSocketError::InvalidAction("unknown action context")),
        }
    }

    fn send(&mut self, buffer_type: BufferType, buffer: CodecBuffer) -> Result<()> {
        self.queue_send(buffer_type, Some(buffer))
    }

    fn send_without_body(&mut self, buffer_type: BufferType) -> Result<()> {
        self.queue_send(buffer_type, None)
    }

    fn receive(&mut self) -> Result<()> {
        if self.aborted {
            return Err(WebSocketError::InvalidAction("codec aborted"));
        }
        if self.receive_armed {
            return Err(WebSocketError::InvalidAction("receive already pending"));
        }
        if self.close_received {
            return Err(WebSocketError::InvalidAction("close frame already received"));
        }
        self.receive_armed = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.receive_armed = false;
        self.receive_inflight = None;
        self.pongs.clear();
        self.indication = None;
        self.outbound = SendStage::Idle;
    }
}
