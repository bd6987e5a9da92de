//! Connection manager for one task's log socket.
//!
//! [`TaskChannel::open`] spawns a tokio task that owns the socket and runs the
//! `Connecting -> Open -> Closed` state machine, reconnecting after the
//! configured interval until the channel is closed or the task completes.
//! Consumers observe the stream through a [`ChannelHandler`] and control it
//! through the returned [`ChannelHandle`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use opman_common::config::{task_url, DEFAULT_RECONNECT_INTERVAL_MS, DEFAULT_STREAM_BASE_URL};
use opman_common::{LogLevel, StreamConfig, TaskId};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connector::{Connector, FrameSocket};
use crate::error::ChannelError;
use crate::event::{decode, TaskEvent};

/// Frames queued by `send` beyond this are dropped until the socket catches up.
pub const OUTGOING_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closed,
}

impl SocketState {
    fn as_u8(self) -> u8 {
        match self {
            SocketState::Connecting => 0,
            SocketState::Open => 1,
            SocketState::Closed => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SocketState::Connecting,
            1 => SocketState::Open,
            _ => SocketState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Socket endpoint prefix; the task URL is `{base_url}/tasks/{id}`.
    pub base_url: String,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_STREAM_BASE_URL.to_string(),
            auto_reconnect: true,
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
        }
    }
}

impl From<&StreamConfig> for ChannelOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            auto_reconnect: config.auto_reconnect,
            reconnect_interval: config.reconnect_interval(),
        }
    }
}

impl ChannelOptions {
    pub fn url_for(&self, task_id: TaskId) -> String {
        task_url(&self.base_url, task_id)
    }
}

/// Callbacks invoked from the channel task, in frame arrival order.
///
/// Callbacks run while the channel holds its handler lock; they should return
/// quickly. Calling [`ChannelHandle::close`] from inside a callback is allowed.
pub trait ChannelHandler: Send + 'static {
    /// Every text frame, before decoding.
    fn on_raw_message(&mut self, _frame: &str) {}

    /// Every decoded event, `Unknown` included, before the kind-specific callback.
    fn on_message(&mut self, _event: &TaskEvent) {}

    fn on_log(&mut self, _level: LogLevel, _message: &str, _source: Option<&str>) {}

    fn on_progress(&mut self, _progress: u8, _message: Option<&str>) {}

    fn on_complete(&mut self, _success: bool, _output: Option<&str>, _error: Option<&str>) {}

    fn on_state_change(&mut self, _state: SocketState) {}

    fn on_transport_error(&mut self, _error: &ChannelError) {}
}

/// Kind-specific callback for a decoded event; `Welcome` and `Unknown` have none.
fn deliver(handler: &mut dyn ChannelHandler, event: &TaskEvent) {
    match event {
        TaskEvent::Log {
            level,
            message,
            source,
        } => handler.on_log(*level, message, source.as_deref()),
        TaskEvent::Progress { progress, message } => {
            handler.on_progress(*progress, message.as_deref())
        }
        TaskEvent::Completion {
            success,
            output,
            error,
        } => handler.on_complete(*success, output.as_deref(), error.as_deref()),
        TaskEvent::Welcome { .. } | TaskEvent::Unknown => {}
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    task_id: TaskId,
    state: AtomicU8,
    closed: AtomicBool,
    completion_observed: AtomicBool,
    handler: Mutex<Box<dyn ChannelHandler>>,
    /// Thread currently running a callback, so `close` can tell re-entry from a race.
    dispatching: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn new(task_id: TaskId, handler: Box<dyn ChannelHandler>) -> Self {
        Self {
            task_id,
            state: AtomicU8::new(SocketState::Connecting.as_u8()),
            closed: AtomicBool::new(false),
            completion_observed: AtomicBool::new(false),
            handler: Mutex::new(handler),
            dispatching: Mutex::new(None),
        }
    }

    fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn completion_observed(&self) -> bool {
        self.completion_observed.load(Ordering::SeqCst)
    }

    fn is_dispatching_here(&self) -> bool {
        *lock(&self.dispatching) == Some(thread::current().id())
    }

    /// Run `f` against the handler unless the channel was closed.
    fn with_handler<F>(&self, f: F)
    where
        F: FnOnce(&mut dyn ChannelHandler),
    {
        let mut handler = lock(&self.handler);
        if self.is_closed() {
            return;
        }
        *lock(&self.dispatching) = Some(thread::current().id());
        f(handler.as_mut());
        *lock(&self.dispatching) = None;
    }

    fn transition(&self, next: SocketState) {
        self.with_handler(|handler| {
            let previous = self.state.swap(next.as_u8(), Ordering::SeqCst);
            if previous != next.as_u8() {
                handler.on_state_change(next);
            }
        });
    }

    fn report(&self, error: &ChannelError) {
        warn!(task_id = %self.task_id, "task log channel: {}", error);
        self.with_handler(|handler| handler.on_transport_error(error));
    }

    /// Returns true when the frame carried the completion event.
    fn handle_frame(&self, frame: &str) -> bool {
        self.with_handler(|handler| handler.on_raw_message(frame));

        match decode(frame) {
            Err(err) => {
                warn!(task_id = %self.task_id, "dropping frame: {}", err);
                false
            }
            Ok(event) => {
                let terminal = event.is_terminal();
                if terminal {
                    self.completion_observed.store(true, Ordering::SeqCst);
                }
                // Separate dispatches so a close from on_message holds.
                self.with_handler(|handler| handler.on_message(&event));
                self.with_handler(|handler| deliver(handler, &event));
                terminal
            }
        }
    }
}

/// Opens task log channels.
pub struct TaskChannel;

impl TaskChannel {
    /// Start following `task_id`. Must be called inside a tokio runtime.
    pub fn open<C, H>(
        task_id: TaskId,
        options: ChannelOptions,
        connector: Arc<C>,
        handler: H,
    ) -> ChannelHandle
    where
        C: Connector,
        H: ChannelHandler,
    {
        let shared = Arc::new(Shared::new(task_id, Box::new(handler)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (terminated_tx, terminated_rx) = watch::channel(false);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);

        let session = Session {
            shared: shared.clone(),
            url: options.url_for(task_id),
            options,
            shutdown: shutdown_rx,
            outgoing: outgoing_rx,
        };
        tokio::spawn(async move {
            session.run(connector).await;
            let _ = terminated_tx.send(true);
        });

        ChannelHandle {
            shared,
            shutdown: shutdown_tx,
            outgoing: outgoing_tx,
            terminated: terminated_rx,
        }
    }
}

/// Control side of an open channel. Dropping it closes the channel.
pub struct ChannelHandle {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    outgoing: mpsc::Sender<String>,
    terminated: watch::Receiver<bool>,
}

impl ChannelHandle {
    pub fn task_id(&self) -> TaskId {
        self.shared.task_id
    }

    pub fn state(&self) -> SocketState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Whether a completion event has been received on this channel.
    pub fn completion_observed(&self) -> bool {
        self.shared.completion_observed()
    }

    /// Whether the connection task has exited.
    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Queue `payload` as a JSON text frame. Does nothing unless the socket is
    /// open, and drops the frame when [`OUTGOING_CAPACITY`] frames are pending.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) {
        if self.shared.is_closed() || self.shared.state() != SocketState::Open {
            debug!(task_id = %self.shared.task_id, "send ignored, socket not open");
            return;
        }
        match serde_json::to_string(payload) {
            Ok(frame) => {
                if let Err(TrySendError::Full(_)) = self.outgoing.try_send(frame) {
                    warn!(task_id = %self.shared.task_id, "outgoing queue full, frame dropped");
                }
            }
            Err(err) => debug!(task_id = %self.shared.task_id, "send ignored: {}", err),
        }
    }

    /// Close the socket and cancel any pending reconnect. Idempotent.
    ///
    /// No callback runs after this returns; a callback already in progress on
    /// another thread is waited for.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.is_dispatching_here() {
            if shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            shared
                .state
                .store(SocketState::Closed.as_u8(), Ordering::SeqCst);
        } else {
            let mut handler = lock(&shared.handler);
            if shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let previous = shared
                .state
                .swap(SocketState::Closed.as_u8(), Ordering::SeqCst);
            if previous != SocketState::Closed.as_u8() {
                handler.on_state_change(SocketState::Closed);
            }
        }

        let _ = self.shutdown.send(true);
        info!(task_id = %shared.task_id, "task log channel closed");
    }

    /// Resolves once the connection task has exited.
    pub async fn terminated(&self) {
        let mut rx = self.terminated.clone();
        flag_raised(&mut rx).await;
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

enum SessionEnd {
    Shutdown,
    Completed,
    Dropped(ChannelError),
}

struct Session {
    shared: Arc<Shared>,
    url: String,
    options: ChannelOptions,
    shutdown: watch::Receiver<bool>,
    outgoing: mpsc::Receiver<String>,
}

impl Session {
    async fn run<C: Connector>(mut self, connector: Arc<C>) {
        let task_id = self.shared.task_id;
        loop {
            if self.shared.is_closed() {
                break;
            }
            self.shared.transition(SocketState::Connecting);
            debug!(task_id = %task_id, url = %self.url, "connecting task log channel");

            let attempt = tokio::select! {
                _ = flag_raised(&mut self.shutdown) => break,
                result = connector.connect(&self.url) => result,
            };

            match attempt {
                Ok(socket) => {
                    // Frames queued for a previous socket are stale.
                    while self.outgoing.try_recv().is_ok() {}
                    self.shared.transition(SocketState::Open);
                    info!(task_id = %task_id, url = %self.url, "task log channel open");

                    match self.pump(socket).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Completed => {
                            info!(task_id = %task_id, "task completed, retiring channel");
                        }
                        SessionEnd::Dropped(err) => self.shared.report(&err),
                    }
                }
                Err(err) => self.shared.report(&err),
            }

            self.shared.transition(SocketState::Closed);

            if !self.options.auto_reconnect
                || self.shared.is_closed()
                || self.shared.completion_observed()
            {
                break;
            }

            debug!(
                task_id = %task_id,
                "reconnecting in {}ms",
                self.options.reconnect_interval.as_millis()
            );
            tokio::select! {
                _ = flag_raised(&mut self.shutdown) => break,
                _ = sleep(self.options.reconnect_interval) => {}
            }
        }
        debug!(task_id = %task_id, "task log channel task exiting");
    }

    async fn pump<S: FrameSocket>(&mut self, mut socket: S) -> SessionEnd {
        loop {
            tokio::select! {
                _ = flag_raised(&mut self.shutdown) => {
                    let _ = socket.close().await;
                    return SessionEnd::Shutdown;
                }
                Some(frame) = self.outgoing.recv() => {
                    if let Err(err) = socket.send(Message::Text(frame)).await {
                        return SessionEnd::Dropped(ChannelError::transport(err));
                    }
                }
                incoming = socket.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if self.shared.handle_frame(&text) {
                            let _ = socket.close().await;
                            return SessionEnd::Completed;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "no close frame".to_string());
                        return SessionEnd::Dropped(ChannelError::Transport(format!(
                            "server closed the connection ({})",
                            reason.trim()
                        )));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Dropped(ChannelError::transport(err)),
                    None => {
                        return SessionEnd::Dropped(ChannelError::Transport(
                            "connection ended".to_string(),
                        ))
                    }
                },
            }
        }
    }
}

/// Resolves once the flag is true or its sender is gone.
async fn flag_raised(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
