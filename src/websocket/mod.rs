//! # Connection engine
//!
//! [`WebSocket`] owns the connection state machine:
//!
//! ```text
//! Open ──close_output──▶ CloseSent ─────peer close────▶ Closed
//!   └───peer close────▶ CloseReceived ──close_output──▶ Closed
//! any state ──abort / fault──▶ Aborted
//! ```
//!
//! Two locks protect the engine, always taken in this order: the session lock (codec,
//! buffer region, receive state) and the connection lock (state, close status). Neither is
//! held across an `.await`; the drivers in [`operation`] release the session lock around
//! every transport call.
mod guard;
mod keep_alive;
mod operation;
mod options;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

pub use options::Options;

use self::{guard::OperationGuard, keep_alive::KeepAliveTracker};
use crate::{
    buffer::{WebSocketBuffer, MIN_RECEIVE_BUFFER_SIZE},
    close::{validate_close_status, CloseCode},
    codec::{BufferType, Property, ProtocolCodec, ServerCodec},
    stream::{cancellable, Transport},
    Result, WebSocketError,
};

/// State of a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    /// The connection is established and both directions are open.
    Open,
    /// The local close frame was sent, the peer's one is still expected.
    CloseSent,
    /// The peer's close frame was received, the local one was not sent yet.
    CloseReceived,
    /// The close handshake completed.
    Closed,
    /// The connection was torn down without completing the close handshake.
    Aborted,
}

impl WebSocketState {
    /// `true` for [`WebSocketState::Closed`] and [`WebSocketState::Aborted`].
    pub fn is_terminal(self) -> bool {
        matches!(self, WebSocketState::Closed | WebSocketState::Aborted)
    }
}

impl fmt::Display for WebSocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WebSocketState::Open => "Open",
            WebSocketState::CloseSent => "CloseSent",
            WebSocketState::CloseReceived => "CloseReceived",
            WebSocketState::Closed => "Closed",
            WebSocketState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Kind of a WebSocket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
    /// Only ever returned by [`WebSocket::receive`].
    Close,
}

/// Outcome of a [`WebSocket::receive`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResult {
    /// Bytes written to the caller's buffer.
    pub count: usize,
    pub message_type: MessageType,
    /// `true` when `count` bytes complete the message.
    pub end_of_message: bool,
    /// Status of the peer's close frame, set when `message_type` is [`MessageType::Close`].
    pub close_status: Option<CloseCode>,
    pub close_reason: Option<String>,
}

impl ReceiveResult {
    pub(crate) fn new(count: usize, message_type: MessageType, end_of_message: bool) -> Self {
        Self {
            count,
            message_type,
            end_of_message,
            close_status: None,
            close_reason: None,
        }
    }

    pub(crate) fn close(status: CloseCode, reason: Option<String>) -> Self {
        Self {
            count: 0,
            message_type: MessageType::Close,
            end_of_message: true,
            close_status: Some(status),
            close_reason: reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    Idle,
    Application,
    /// Part of the last chunk is parked in the overflow segment.
    PayloadAvailable,
}

/// Everything the codec touches, guarded by the session lock.
struct Session {
    codec: Box<dyn ProtocolCodec>,
    buffer: WebSocketBuffer,
    receive_state: ReceiveState,
    /// Completion of the keep-alive send in flight.
    keep_alive_task: Option<watch::Receiver<bool>>,
    /// Set once the codec was aborted or released, to the state it happened in.
    released: Option<WebSocketState>,
}

impl Session {
    fn ensure_open(&self) -> Result<()> {
        match self.released {
            Some(state) => Err(WebSocketError::InvalidState(state)),
            None => Ok(()),
        }
    }
}

struct Connection {
    state: WebSocketState,
    close_status: Option<CloseCode>,
    close_reason: Option<String>,
    /// Completion of the close output in flight.
    close_output_task: Option<watch::Receiver<bool>>,
    /// `close` started its own receive for the peer's close frame.
    close_started_receive: bool,
}

pub(crate) struct Inner {
    session: Mutex<Session>,
    connection: Mutex<Connection>,
    transport: Transport,

    receive_guard: OperationGuard,
    send_guard: OperationGuard,
    close_output_guard: OperationGuard,
    close_guard: OperationGuard,

    keep_alive: KeepAliveTracker,
    pending_exception: Mutex<Option<WebSocketError>>,
    /// Set when the peer's close frame arrived or the connection was torn down.
    close_received: watch::Sender<bool>,
    sub_protocol: Option<String>,

    disposed: AtomicBool,
    cleaned_up: AtomicBool,
}

/// A server-side WebSocket connection.
///
/// The handle is cheap to clone; all clones drive the same connection. Dropping the last
/// handle disposes the connection, aborting it unless it was closed.
///
/// Each operation takes a [`CancellationToken`]. Cancelling it fails the operation with
/// [`WebSocketError::OperationCanceled`] and aborts the connection, since a frame cut in the
/// middle cannot be resumed. An operation failing because another task aborted the connection
/// reports [`WebSocketError::InvalidState`] with [`WebSocketState::Aborted`] instead.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn buffer_type_for(message_type: MessageType, end_of_message: bool) -> Result<BufferType> {
    Ok(match (message_type, end_of_message) {
        (MessageType::Text, true) => BufferType::Utf8Message,
        (MessageType::Text, false) => BufferType::Utf8Fragment,
        (MessageType::Binary, true) => BufferType::BinaryMessage,
        (MessageType::Binary, false) => BufferType::BinaryFragment,
        (MessageType::Close, _) => return Err(WebSocketError::InvalidMessageType),
    })
}

/// Waits until the watched task reports completion or goes away.
async fn completion(mut task: watch::Receiver<bool>) {
    let _ = task.wait_for(|done| *done).await.map(|_| ());
}

/// Aborts the connection when an operation future is dropped before it finished.
struct AbortOnDrop<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl<'a> AbortOnDrop<'a> {
    fn new(inner: &'a Inner) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            #[cfg(feature = "logging")]
            log::debug!("operation dropped while in flight, aborting");
            self.inner.abort();
        }
    }
}

impl WebSocket {
    /// Starts the engine with the built-in [`ServerCodec`] on a stream whose upgrade handshake
    /// has already completed.
    ///
    /// Must be called within a tokio runtime: the keep-alive heartbeat is a spawned task.
    pub async fn accept<S>(stream: S, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_codec(stream, options, ServerCodec::new).await
    }

    /// Starts the engine with a custom codec.
    ///
    /// `make_codec` receives the setup properties, including the address and length of the
    /// native workspace the codec will be handed on every call.
    pub async fn with_codec<S, C, F>(stream: S, options: Options, make_codec: F) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        C: ProtocolCodec + 'static,
        F: FnOnce(&[Property]) -> Result<C>,
    {
        options.validate()?;

        let mut buffer = WebSocketBuffer::new(options.receive_buffer_size, options.send_buffer_size)?;
        let properties = buffer.describe_for_codec(options.codec_settings())?;
        let codec = make_codec(&properties)?;

        let inner = Arc::new(Inner {
            session: Mutex::new(Session {
                codec: Box::new(codec),
                buffer,
                receive_state: ReceiveState::Idle,
                keep_alive_task: None,
                released: None,
            }),
            connection: Mutex::new(Connection {
                state: WebSocketState::Open,
                close_status: None,
                close_reason: None,
                close_output_task: None,
                close_started_receive: false,
            }),
            transport: Transport::new(stream),
            receive_guard: OperationGuard::default(),
            send_guard: OperationGuard::default(),
            close_output_guard: OperationGuard::default(),
            close_guard: OperationGuard::default(),
            keep_alive: KeepAliveTracker::new(options.effective_keep_alive()),
            pending_exception: Mutex::new(None),
            close_received: watch::Sender::new(false),
            sub_protocol: options.sub_protocol,
            disposed: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        });

        inner.keep_alive.start(Arc::downgrade(&inner));

        #[cfg(feature = "logging")]
        log::debug!(
            "websocket open (receive buffer {}, send buffer {}, keep-alive {:?})",
            options.receive_buffer_size,
            options.send_buffer_size,
            inner.keep_alive.interval()
        );

        Ok(Self { inner })
    }

    /// Sends `payload` as a whole message or, with `end_of_message` unset, as one fragment of it.
    ///
    /// Valid in [`WebSocketState::Open`] and [`WebSocketState::CloseReceived`]. Only one send
    /// may be outstanding at a time. A send racing the keep-alive heartbeat waits for the
    /// heartbeat instead of failing.
    pub async fn send(
        &self,
        payload: impl Into<Bytes>,
        message_type: MessageType,
        end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let buffer_type = buffer_type_for(message_type, end_of_message)?;
        self.inner.send(payload.into(), buffer_type, cancel).await
    }

    /// Serializes `value` as JSON and sends it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn send_json<T: serde::Serialize>(
        &self,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send(payload, MessageType::Text, true, cancel).await
    }

    /// Receives the next chunk of a message into `buf`.
    ///
    /// A chunk larger than `buf` is split over several calls; only the last one reports
    /// `end_of_message`. When the peer's close frame arrives, the result has
    /// [`MessageType::Close`] and carries the close status and reason.
    ///
    /// Valid in [`WebSocketState::Open`] and [`WebSocketState::CloseSent`].
    pub async fn receive(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<ReceiveResult> {
        self.inner.receive(buf, cancel).await
    }

    /// Sends the close frame without waiting for the peer's one.
    ///
    /// A no-op once the connection is closed or aborted. When another close output is in
    /// flight, waits for it instead. If the peer's close frame was already received, this
    /// completes the handshake and closes the connection.
    pub async fn close_output(
        &self,
        status: CloseCode,
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.close_output(status, reason, cancel).await
    }

    /// Runs the close handshake: sends the close frame if that did not happen yet, then waits
    /// for the peer's close frame and closes the connection.
    ///
    /// A data message arriving while waiting for the peer's close frame fails the handshake
    /// with [`WebSocketError::InvalidMessageType`].
    pub async fn close(
        &self,
        status: CloseCode,
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.close(status, reason, cancel).await
    }

    /// Tears the connection down immediately. Outstanding operations fail with
    /// [`WebSocketError::InvalidState`]. Idempotent.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Releases the connection, aborting it unless it was closed. Every later operation fails
    /// with [`WebSocketError::Disposed`]. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn state(&self) -> WebSocketState {
        self.inner.state()
    }

    /// Status of the peer's close frame, once received.
    pub fn close_status(&self) -> Option<CloseCode> {
        self.inner.connection().close_status
    }

    /// Reason of the peer's close frame, once received.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.connection().close_reason.clone()
    }

    pub fn sub_protocol(&self) -> Option<&str> {
        self.inner.sub_protocol.as_deref()
    }

    /// Keep-alive interval, `None` when the heartbeat is disabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.inner.keep_alive.interval()
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("state", &self.state())
            .field("sub_protocol", &self.sub_protocol())
            .finish()
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        lock(&self.connection)
    }

    fn state(&self) -> WebSocketState {
        self.connection().state
    }

    fn guards(&self) -> [&OperationGuard; 4] {
        [
            &self.receive_guard,
            &self.send_guard,
            &self.close_output_guard,
            &self.close_guard,
        ]
    }

    fn throw_if_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(WebSocketError::Disposed);
        }
        Ok(())
    }

    /// Reports a background fault, once.
    fn throw_if_pending_exception(&self) -> Result<()> {
        match lock(&self.pending_exception).take() {
            Some(err) => Err(WebSocketError::Faulted(Box::new(err))),
            None => Ok(()),
        }
    }

    fn ensure_state(&self, valid: &[WebSocketState]) -> Result<()> {
        let state = self.state();
        if valid.contains(&state) {
            Ok(())
        } else {
            Err(WebSocketError::InvalidState(state))
        }
    }

    fn on_background_exception(&self, err: WebSocketError) {
        {
            let mut pending = lock(&self.pending_exception);
            if pending.is_some() {
                return;
            }
            #[cfg(feature = "logging")]
            log::warn!("background fault: {err}");
            *pending = Some(err);
        }
        self.abort();
    }

    /// Aborts after a failed operation and tells the caller what happened.
    ///
    /// `linked` is the operation's token, which fires both for the caller's own
    /// cancellation and for an abort racing the operation.
    fn on_operation_failed<T>(
        &self,
        result: Result<T>,
        cancel: &CancellationToken,
        linked: &CancellationToken,
    ) -> Result<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let aborted = linked.is_cancelled();
        self.abort();

        #[cfg(feature = "logging")]
        log::debug!("operation failed (aborted={aborted}): {err}");

        Err(match err {
            err if err.is_contract_violation() => err,
            err @ WebSocketError::Faulted(_) => err,
            _ if cancel.is_cancelled() => WebSocketError::OperationCanceled,
            WebSocketError::OperationCanceled if !aborted => WebSocketError::OperationCanceled,
            _ if aborted => WebSocketError::InvalidState(WebSocketState::Aborted),
            err => err,
        })
    }

    /// Faults that may be swallowed while finishing a close handshake the peer already
    /// tore down.
    fn can_handle_exception_during_close(&self, err: &WebSocketError) -> bool {
        self.state() == WebSocketState::Closed && (err.is_cancellation() || err.is_protocol_error())
    }

    /// Claims the send guard. A keep-alive holding it is waited for, then the claim is retried once.
    async fn claim_send<'a>(
        &'a self,
        cancel: &CancellationToken,
    ) -> Result<guard::Ticket<'a>> {
        if let Some(ticket) = self.send_guard.try_start(cancel) {
            return Ok(ticket);
        }

        let keep_alive = self.session().keep_alive_task.clone();
        if let Some(task) = keep_alive {
            cancellable(cancel, completion(task)).await?;
            self.throw_if_pending_exception()?;
        }

        self.send_guard
            .try_start(cancel)
            .ok_or(WebSocketError::AlreadyOneOutstandingOperation("send"))
    }

    async fn send(&self, payload: Bytes, buffer_type: BufferType, cancel: &CancellationToken) -> Result<()> {
        self.throw_if_pending_exception()?;
        self.throw_if_disposed()?;
        self.ensure_state(&[WebSocketState::Open, WebSocketState::CloseReceived])?;

        let ticket = self.claim_send(cancel).await?;
        let linked = ticket.token().clone();

        let abort = AbortOnDrop::new(self);
        let result = operation::send(self, payload, buffer_type, &linked).await;
        abort.disarm();
        self.on_operation_failed(result, cancel, &linked)
    }

    async fn receive(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<ReceiveResult> {
        self.throw_if_pending_exception()?;
        self.throw_if_disposed()?;
        self.ensure_state(&[WebSocketState::Open, WebSocketState::CloseSent])?;

        let Some(ticket) = self.receive_guard.try_start(cancel) else {
            return Err(if self.connection().close_started_receive {
                WebSocketError::ReceiveAfterClose
            } else {
                WebSocketError::AlreadyOneOutstandingOperation("receive")
            });
        };
        let linked = ticket.token().clone();

        let abort = AbortOnDrop::new(self);
        let result = operation::receive(self, buf, &linked).await;
        abort.disarm();
        self.on_operation_failed(result, cancel, &linked)
    }

    async fn close_output(
        &self,
        status: CloseCode,
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        validate_close_status(status, reason)?;
        self.throw_if_pending_exception()?;
        if self.state().is_terminal() {
            return Ok(());
        }
        self.throw_if_disposed()?;
        self.ensure_state(&[WebSocketState::Open, WebSocketState::CloseReceived])?;

        let Some(ticket) = self.close_output_guard.try_start(cancel) else {
            let task = self.connection().close_output_task.clone();
            return match task {
                Some(task) => self.wait_close_output(task, cancel).await,
                None => self.throw_if_aborted(),
            };
        };
        let linked = ticket.token().clone();

        let (done, task) = watch::channel(false);
        self.connection().close_output_task = Some(task);

        let abort = AbortOnDrop::new(self);
        let result = self.run_close_output(status, reason, cancel, &linked).await;
        abort.disarm();
        let result = self.on_operation_failed(result, cancel, &linked);

        // settle the state before waking waiters
        self.connection().close_output_task = None;
        done.send_replace(true);
        result
    }

    /// Waits for another caller's close frame to go out.
    async fn wait_close_output(&self, task: watch::Receiver<bool>, token: &CancellationToken) -> Result<()> {
        cancellable(token, completion(task)).await?;
        self.throw_if_aborted()
    }

    fn throw_if_aborted(&self) -> Result<()> {
        match self.state() {
            WebSocketState::Aborted => Err(WebSocketError::InvalidState(WebSocketState::Aborted)),
            _ => Ok(()),
        }
    }

    async fn run_close_output(
        &self,
        status: CloseCode,
        reason: Option<&str>,
        cancel: &CancellationToken,
        linked: &CancellationToken,
    ) -> Result<()> {
        let send = self.claim_send(cancel).await?;

        #[cfg(feature = "logging")]
        log::debug!("sending close frame ({status:?})");

        let result = operation::close_output(self, status, reason, linked).await;
        drop(send);
        result?;

        if self.on_close_output_completed() {
            self.close_completed(linked).await?;
        }
        Ok(())
    }

    /// Moves to `CloseSent` after the close frame went out. Returns `true` when the peer's close
    /// frame was already received and the handshake is complete.
    fn on_close_output_completed(&self) -> bool {
        let mut connection = self.connection();
        match connection.state {
            WebSocketState::Open => {
                connection.state = WebSocketState::CloseSent;
                false
            }
            WebSocketState::CloseReceived => true,
            _ => false,
        }
    }

    async fn close(&self, status: CloseCode, reason: Option<&str>, cancel: &CancellationToken) -> Result<()> {
        validate_close_status(status, reason)?;
        self.throw_if_pending_exception()?;
        if self.state().is_terminal() {
            return Ok(());
        }
        self.throw_if_disposed()?;

        let Some(ticket) = self.close_guard.try_start(cancel) else {
            // another close runs the handshake, wait for it to see the peer's close frame
            cancellable(cancel, completion(self.close_received.subscribe())).await?;
            return match self.state() {
                WebSocketState::Aborted => Err(WebSocketError::InvalidState(WebSocketState::Aborted)),
                _ => Ok(()),
            };
        };
        let linked = ticket.token().clone();

        let abort = AbortOnDrop::new(self);
        let result = self.run_close(status, reason, &linked).await;
        abort.disarm();
        self.on_operation_failed(result, cancel, &linked)
    }

    async fn run_close(&self, status: CloseCode, reason: Option<&str>, linked: &CancellationToken) -> Result<()> {
        enum Output {
            Start,
            Wait(watch::Receiver<bool>),
            Sent,
        }

        let output = {
            let connection = self.connection();
            match (&connection.close_output_task, connection.state) {
                (Some(task), _) => Output::Wait(task.clone()),
                (None, WebSocketState::CloseSent) => Output::Sent,
                (None, _) => Output::Start,
            }
        };
        let sent = match output {
            Output::Start => self.close_output(status, reason, linked).await,
            Output::Wait(task) => self.wait_close_output(task, linked).await,
            Output::Sent => Ok(()),
        };
        if let Err(err) = sent {
            if !self.can_handle_exception_during_close(&err) {
                return Err(err);
            }
        }

        if self.on_close_output_completed() {
            self.close_completed(linked).await?;
        }
        if self.state().is_terminal() {
            return Ok(());
        }

        match self.receive_guard.try_start(linked) {
            Some(receive) => {
                self.connection().close_started_receive = true;
                let mut buf = vec![0u8; MIN_RECEIVE_BUFFER_SIZE];
                match operation::receive(self, &mut buf, receive.token()).await {
                    Ok(result) if result.message_type != MessageType::Close => {
                        return Err(WebSocketError::InvalidMessageType);
                    }
                    Ok(_) => {}
                    Err(err) if self.can_handle_exception_during_close(&err) => {}
                    Err(err) => return Err(err),
                }
            }
            None => {
                // the application's receive will see the close frame
                cancellable(linked, completion(self.close_received.subscribe())).await?;
            }
        }

        if !self.state().is_terminal() {
            let _send = self.send_guard.try_start(linked);
            self.close_completed(linked).await?;
        }
        Ok(())
    }

    /// Records the peer's close frame. Completes the handshake when the local close frame was
    /// already sent.
    async fn on_close_received(
        &self,
        status: Option<CloseCode>,
        reason: Option<String>,
        token: &CancellationToken,
    ) -> Result<()> {
        let complete = {
            let mut connection = self.connection();
            connection.close_status = status;
            connection.close_reason = reason;
            match connection.state {
                WebSocketState::Open => {
                    connection.state = WebSocketState::CloseReceived;
                    false
                }
                WebSocketState::CloseSent => true,
                _ => false,
            }
        };

        #[cfg(feature = "logging")]
        log::debug!("close frame received ({status:?})");

        if complete {
            self.close_completed(token).await?;
        }
        self.close_received.send_replace(true);
        Ok(())
    }

    /// Moves to `Closed`, shuts the stream down and releases everything.
    async fn close_completed(&self, token: &CancellationToken) -> Result<()> {
        {
            let mut connection = self.connection();
            if connection.state.is_terminal() {
                return Ok(());
            }
            connection.state = WebSocketState::Closed;
        }

        #[cfg(feature = "logging")]
        log::debug!("close handshake completed");

        if let Err(err) = self.transport.close_network_connection(token).await {
            if !self.can_handle_exception_during_close(&err) {
                return Err(err);
            }
            #[cfg(feature = "logging")]
            log::debug!("ignoring fault while closing the stream: {err}");
        }
        self.cleanup();
        Ok(())
    }

    fn abort(&self) {
        if self.state().is_terminal() {
            return;
        }

        let mut session = self.session();
        {
            let mut connection = self.connection();
            if connection.state.is_terminal() {
                return;
            }
            connection.state = WebSocketState::Aborted;
        }

        #[cfg(feature = "logging")]
        log::debug!("websocket aborted");

        session.codec.abort();
        session.released = Some(WebSocketState::Aborted);
        for guard in self.guards() {
            guard.cancel_all();
        }
        self.cleanup_locked(&mut session);
    }

    fn dispose(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if self.state().is_terminal() {
            self.cleanup();
        } else {
            self.abort();
        }
        self.disposed.store(true, Ordering::Release);
    }

    fn cleanup(&self) {
        let mut session = self.session();
        self.cleanup_locked(&mut session);
    }

    /// Runs once, on the first terminal transition or disposal.
    fn cleanup_locked(&self, session: &mut Session) {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return;
        }
        if session.released.is_none() {
            session.released = Some(self.state());
            session.codec.abort();
        }
        session.buffer.dispose();
        session.keep_alive_task = None;
        for guard in self.guards() {
            guard.dispose();
        }
        self.transport.close();
        self.keep_alive.dispose();
        self.close_received.send_replace(true);
    }

    /// One heartbeat tick. Returns the delay until the next tick, or `None` to stop the timer.
    async fn on_keep_alive(&self) -> Option<Duration> {
        let interval = self.keep_alive.interval()?;

        let (ticket, done) = {
            let mut session = self.session();
            if self.disposed.load(Ordering::Acquire) || session.released.is_some() {
                return None;
            }
            {
                let connection = self.connection();
                if connection.state != WebSocketState::Open || connection.close_output_task.is_some() {
                    return None;
                }
            }
            if let Some(remaining) = self.keep_alive.time_until_due() {
                return Some(remaining);
            }
            // best effort: an application send in flight counts as activity soon enough
            let Some(ticket) = self.send_guard.try_start(&CancellationToken::new()) else {
                return Some(interval);
            };
            let (done, task) = watch::channel(false);
            session.keep_alive_task = Some(task);
            (ticket, done)
        };

        #[cfg(feature = "logging")]
        log::debug!("sending keep-alive");

        let linked = ticket.token().clone();
        let result = operation::keep_alive(self, &linked).await;
        let next = match result {
            Ok(()) => Some(interval),
            Err(err) => {
                if !linked.is_cancelled() {
                    self.on_background_exception(err);
                }
                None
            }
        };

        // record the fault before waking a parked send
        self.session().keep_alive_task = None;
        drop(ticket);
        done.send_replace(true);
        next
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_terminal() {
        assert_eq!(WebSocketState::CloseReceived.to_string(), "CloseReceived");
        assert!(WebSocketState::Closed.is_terminal());
        assert!(WebSocketState::Aborted.is_terminal());
        assert!(!WebSocketState::CloseSent.is_terminal());
    }

    #[test]
    fn test_buffer_type_mapping() {
        assert_eq!(buffer_type_for(MessageType::Text, true).unwrap(), BufferType::Utf8Message);
        assert_eq!(buffer_type_for(MessageType::Text, false).unwrap(), BufferType::Utf8Fragment);
        assert_eq!(buffer_type_for(MessageType::Binary, true).unwrap(), BufferType::BinaryMessage);
        assert_eq!(
            buffer_type_for(MessageType::Binary, false).unwrap(),
            BufferType::BinaryFragment
        );
        assert!(matches!(
            buffer_type_for(MessageType::Close, true),
            Err(WebSocketError::InvalidMessageType)
        ));
    }

    #[test]
    fn test_close_result() {
        let result = ReceiveResult::close(CloseCode::Away, Some("bye".to_owned()));
        assert_eq!(result.count, 0);
        assert_eq!(result.message_type, MessageType::Close);
        assert!(result.end_of_message);
        assert_eq!(result.close_status, Some(CloseCode::Away));
    }
}
