//! The drivers running one operation against the codec.
//!
//! Every operation runs the same loop:
//!
//! 1. initialize under the session lock (arm the receive state, or pin the payload and queue
//!    the frame with the codec);
//! 2. ask the operation whether another round is needed;
//! 3. pull actions from the codec and service them until it answers
//!    [`Action::NoAction`], performing I/O with the session lock released.
//!
//! The session lock is never held across an `.await`.
use std::ops::Range;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{Inner, MessageType, ReceiveResult, ReceiveState, Session, WebSocketState};
use crate::{
    close::CloseCode,
    codec::{Action, ActionContext, ActionQueue, ActionRequest, BufferType, CodecBuffer},
    Result, WebSocketError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Receive,
    Send,
    CloseOutput,
}

impl Kind {
    /// Most buffers the codec may report for a single action.
    fn buffer_count(self) -> usize {
        match self {
            Kind::Receive => 1,
            Kind::Send | Kind::CloseOutput => 2,
        }
    }

    fn queue(self) -> ActionQueue {
        match self {
            Kind::Receive => ActionQueue::Receive,
            Kind::Send | Kind::CloseOutput => ActionQueue::Send,
        }
    }
}

enum Request<'a> {
    Receive(&'a mut [u8]),
    Send { payload: Bytes, buffer_type: BufferType },
    KeepAlive,
    CloseOutput { status: CloseCode, reason: Bytes },
}

impl Request<'_> {
    fn kind(&self) -> Kind {
        match self {
            Request::Receive(_) => Kind::Receive,
            Request::Send { .. } | Request::KeepAlive => Kind::Send,
            Request::CloseOutput { .. } => Kind::CloseOutput,
        }
    }
}

#[derive(Default)]
struct Progress {
    completed: bool,
    pong_received: bool,
    pinned: bool,
    result: Option<ReceiveResult>,
}

/// What to do after an action was pulled, with the session lock released.
enum Step {
    /// The action was handled synchronously, pull the next one.
    Next,
    /// The codec is done with this round.
    Done,
    Read {
        context: ActionContext,
        range: Range<usize>,
    },
    Write {
        context: ActionContext,
        frame: Vec<Bytes>,
    },
    Flush,
}

/// Receives the next chunk of a message into `buffer`.
pub(super) async fn receive(
    inner: &Inner,
    buffer: &mut [u8],
    token: &CancellationToken,
) -> Result<ReceiveResult> {
    let mut progress = Progress::default();
    process(inner, &mut Request::Receive(buffer), &mut progress, token).await?;
    progress
        .result
        .ok_or(WebSocketError::InvalidAction("receive completed without an indication"))
}

/// Sends one frame carrying `payload`.
pub(super) async fn send(
    inner: &Inner,
    payload: Bytes,
    buffer_type: BufferType,
    token: &CancellationToken,
) -> Result<()> {
    let mut request = Request::Send {
        payload,
        buffer_type,
    };
    process(inner, &mut request, &mut Progress::default(), token).await
}

/// Sends an unsolicited pong without a body.
pub(super) async fn keep_alive(inner: &Inner, token: &CancellationToken) -> Result<()> {
    process(inner, &mut Request::KeepAlive, &mut Progress::default(), token).await
}

/// Sends the close frame. `CloseCode::Empty` goes out without a body.
pub(super) async fn close_output(
    inner: &Inner,
    status: CloseCode,
    reason: Option<&str>,
    token: &CancellationToken,
) -> Result<()> {
    let reason = reason.map_or_else(Bytes::new, |reason| Bytes::copy_from_slice(reason.as_bytes()));
    let mut request = Request::CloseOutput { status, reason };
    process(inner, &mut request, &mut Progress::default(), token).await
}

async fn process(
    inner: &Inner,
    request: &mut Request<'_>,
    progress: &mut Progress,
    token: &CancellationToken,
) -> Result<()> {
    let result = drive(inner, request, progress, token).await;
    if progress.pinned {
        inner.session().buffer.release_pinned_send_payload();
    }
    result
}

async fn drive(
    inner: &Inner,
    request: &mut Request<'_>,
    progress: &mut Progress,
    token: &CancellationToken,
) -> Result<()> {
    let kind = request.kind();

    {
        let mut session = inner.session();
        inner.throw_if_pending_exception()?;
        session.ensure_open()?;
        initialize(&mut session, request, progress)?;
    }

    loop {
        if !should_continue(inner, kind, progress, token)? {
            return Ok(());
        }

        loop {
            let step = next_step(inner, kind, request, progress)?;
            match step {
                Step::Next => {}
                Step::Done => break,
                Step::Read { context, range } => read(inner, context, range, token).await?,
                Step::Write { context, frame } => write(inner, context, frame, token).await?,
                Step::Flush => inner.transport.flush(token).await?,
            }
        }

        if finish_round(kind, progress) {
            if let Some(result) = &progress.result {
                let (status, reason) = (result.close_status, result.close_reason.clone());
                inner.on_close_received(status, reason, token).await?;
            }
        }
    }
}

fn initialize(session: &mut Session, request: &mut Request<'_>, progress: &mut Progress) -> Result<()> {
    let Session {
        codec,
        buffer,
        receive_state,
        ..
    } = session;

    match request {
        Request::Receive(dest) => {
            if *receive_state == ReceiveState::PayloadAvailable && buffer.has_buffered_payload() {
                let (result, more) = buffer.receive_from_buffered_payload(dest)?;
                if !more {
                    *receive_state = ReceiveState::Idle;
                }
                progress.result = Some(result);
                progress.completed = true;
            } else {
                *receive_state = ReceiveState::Application;
            }
        }
        Request::Send {
            payload,
            buffer_type,
        } => {
            let pinned = buffer.pin_send_payload(payload.clone())?;
            progress.pinned = true;
            codec.send(*buffer_type, pinned)?;
        }
        Request::KeepAlive => codec.send_without_body(BufferType::UnsolicitedPong)?,
        Request::CloseOutput { status, reason } => {
            if *status == CloseCode::Empty {
                codec.send_without_body(BufferType::Close)?;
            } else {
                let pinned = buffer.pin_send_payload(reason.clone())?;
                progress.pinned = true;
                codec.send(
                    BufferType::Close,
                    CodecBuffer::Close {
                        address: pinned.address(),
                        length: pinned.len(),
                        status: u16::from(*status),
                    },
                )?;
            }
        }
    }
    Ok(())
}

fn should_continue(
    inner: &Inner,
    kind: Kind,
    progress: &Progress,
    token: &CancellationToken,
) -> Result<bool> {
    if progress.completed {
        return Ok(false);
    }
    if token.is_cancelled() {
        return Err(WebSocketError::OperationCanceled);
    }
    if kind == Kind::Receive {
        let mut session = inner.session();
        session.ensure_open()?;
        session.codec.receive()?;
    }
    Ok(true)
}

/// Closes a round after [`Action::NoAction`]. Returns `true` when a receive round ended on the
/// peer's close frame.
fn finish_round(kind: Kind, progress: &mut Progress) -> bool {
    if kind != Kind::Receive {
        progress.completed = true;
        return false;
    }

    if progress.pong_received {
        // the pong was consumed internally, go for the next frame
        progress.pong_received = false;
        return false;
    }

    progress.completed = true;
    progress
        .result
        .as_ref()
        .is_some_and(|result| result.message_type == MessageType::Close)
}

/// Pulls one action from the codec and handles everything that needs no I/O.
fn next_step(
    inner: &Inner,
    kind: Kind,
    request: &mut Request<'_>,
    progress: &mut Progress,
) -> Result<Step> {
    let mut session = inner.session();
    session.ensure_open()?;

    let Session { codec, buffer, .. } = &mut *session;
    let action = codec.get_action(kind.queue(), buffer.native_mut(), kind.buffer_count())?;
    if action.buffers.len() > kind.buffer_count() {
        return Err(WebSocketError::InvalidAction("too many buffers"));
    }
    buffer.validate_native_buffers(action.action, &action.buffers)?;

    let context = action.context;
    match action.action {
        Action::NoAction => Ok(Step::Done),
        Action::IndicateReceiveComplete => {
            let Request::Receive(dest) = request else {
                return Err(WebSocketError::InvalidAction("receive indicated to a send"));
            };
            let delivered = deliver(&mut session, dest, progress, &action);
            let Session { codec, buffer, .. } = &mut *session;
            codec.complete_action(context, buffer.native_mut(), *delivered.as_ref().unwrap_or(&0))?;
            delivered.map(|_| Step::Next)
        }
        Action::ReceiveFromNetwork => {
            let Some(target) = action.buffers.first() else {
                return Err(WebSocketError::InvalidAction("read without a buffer"));
            };
            let range = buffer.convert_native_buffer(target)?;
            Ok(Step::Read { context, range })
        }
        Action::SendToNetwork => {
            let suppressed =
                action.buffer_type.is_control() && inner.state() == WebSocketState::CloseSent;
            if suppressed || action.buffers.is_empty() {
                codec.complete_action(context, buffer.native_mut(), 0)?;
                return Ok(Step::Next);
            }

            let frame = gather(&session, &action);
            if frame.is_err() {
                let Session { codec, buffer, .. } = &mut *session;
                codec.complete_action(context, buffer.native_mut(), 0)?;
            }
            Ok(Step::Write {
                context,
                frame: frame?,
            })
        }
        Action::IndicateSendComplete => {
            codec.complete_action(context, buffer.native_mut(), 0)?;
            Ok(Step::Flush)
        }
    }
}

/// Header out of the native workspace, payload out of the pinned send payload.
fn gather(session: &Session, action: &ActionRequest) -> Result<Vec<Bytes>> {
    let mut frame = Vec::with_capacity(action.buffers.len());
    for (index, buffer) in action.buffers.iter().enumerate() {
        if index == 0 {
            let range = session.buffer.convert_native_buffer(buffer)?;
            frame.push(Bytes::copy_from_slice(session.buffer.native(range)));
        } else {
            frame.push(session.buffer.convert_pinned_send_payload(buffer)?);
        }
    }
    Ok(frame)
}

/// Hands an indicated frame to the receive in progress. Returns the bytes copied to the caller.
fn deliver(
    session: &mut Session,
    dest: &mut [u8],
    progress: &mut Progress,
    action: &ActionRequest,
) -> Result<usize> {
    match action.buffer_type {
        BufferType::PingPong => {
            progress.pong_received = true;
            Ok(0)
        }
        BufferType::Close => {
            let buffer = action
                .buffers
                .first()
                .ok_or(WebSocketError::InvalidAction("close indicated without a buffer"))?;
            let (status, reason) = session.buffer.convert_close_buffer(buffer)?;
            session.receive_state = ReceiveState::Idle;
            progress.result = Some(ReceiveResult::close(status, reason));
            Ok(0)
        }
        buffer_type => {
            let message_type = match buffer_type {
                BufferType::Utf8Message | BufferType::Utf8Fragment => MessageType::Text,
                BufferType::BinaryMessage | BufferType::BinaryFragment => MessageType::Binary,
                _ => return Err(WebSocketError::InvalidAction("unexpected buffer type")),
            };
            let end_of_message = buffer_type.is_end_of_message();
            let range = match action.buffers.first() {
                Some(buffer) => session.buffer.convert_native_buffer(buffer)?,
                None => 0..0,
            };

            let count = range.len().min(dest.len());
            dest[..count].copy_from_slice(session.buffer.native(range.start..range.start + count));

            if count < range.len() {
                session
                    .buffer
                    .buffer_payload(range, count, message_type, end_of_message)?;
                session.receive_state = ReceiveState::PayloadAvailable;
                progress.result = Some(ReceiveResult::new(count, message_type, false));
            } else {
                session.receive_state = ReceiveState::Idle;
                progress.result = Some(ReceiveResult::new(count, message_type, end_of_message));
            }
            Ok(count)
        }
    }
}

async fn read(
    inner: &Inner,
    context: ActionContext,
    range: Range<usize>,
    token: &CancellationToken,
) -> Result<()> {
    let mut scratch = vec![0u8; range.len()];
    let read = inner.transport.read(&mut scratch, token).await;
    if matches!(read, Ok(n) if n > 0) {
        inner.keep_alive.on_data_received();
    }

    let mut session = inner.session();
    session.ensure_open()?;
    let count = *read.as_ref().unwrap_or(&0);
    let Session { codec, buffer, .. } = &mut *session;
    buffer.write_native(range.start..range.start + count, &scratch[..count]);
    codec.complete_action(context, buffer.native_mut(), count)?;
    inner.throw_if_pending_exception()?;

    if read? == 0 {
        return Err(WebSocketError::ConnectionClosedPrematurely);
    }
    Ok(())
}

async fn write(
    inner: &Inner,
    context: ActionContext,
    frame: Vec<Bytes>,
    token: &CancellationToken,
) -> Result<()> {
    let sent = inner.transport.send_frame(&frame, token).await;
    if sent.is_ok() {
        inner.keep_alive.on_data_sent();
    }

    let mut session = inner.session();
    session.ensure_open()?;
    let Session { codec, buffer, .. } = &mut *session;
    codec.complete_action(context, buffer.native_mut(), *sent.as_ref().unwrap_or(&0))?;
    inner.throw_if_pending_exception()?;

    sent.map(|_| ())
}
