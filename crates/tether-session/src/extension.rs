//! Per-channel request/response runtime.
//!
//! An [`Extension`] is a named logical channel multiplexed over a session.
//! Outgoing calls are correlated to responses by a random 32-byte id held in
//! a pending-call table; incoming frames either resolve a pending call or are
//! dispatched to the user's message handler, whose return value (or error)
//! becomes the response on the wire.
//!
//! Frames for one extension are processed in arrival order by a dedicated
//! inbox task; different extensions dispatch concurrently. The table is
//! locked only around insert/remove, never across a handler await.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use tether_wire::{DecodedData, EnvelopeCodec, Payload, Schema, CALL_ID_LEN};

use crate::errors::{codes, ProtocolError};
use crate::session::Session;
use crate::INBOX_CHANNEL_SIZE;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// What a message handler returns: an optional response payload, or an error
/// that becomes an error response (its code travels verbatim; use
/// [`ProtocolError::system`] for generic failures).
pub type HandlerResult = Result<Option<Payload>, ProtocolError>;

type LifecycleHandler = Arc<dyn Fn(Session) -> BoxFuture<Result<(), ProtocolError>> + Send + Sync>;
type MessageHandler =
    Arc<dyn Fn(Session, Payload, MessageOptions) -> BoxFuture<HandlerResult> + Send + Sync>;
type FeedHandler = Arc<dyn Fn(Session, [u8; 32]) -> BoxFuture<()> + Send + Sync>;
type CloseHandler = Arc<dyn Fn(Option<ProtocolError>) -> BoxFuture<()> + Send + Sync>;

/// Options observed by a message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageOptions {
    /// The sender expects no response.
    pub oneway: bool,
}

/// Extension lifecycle, driven only by the owning session. `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtensionState {
    New = 0,
    Open = 1,
    Initialized = 2,
    Handshaken = 3,
    Running = 4,
    Closed = 5,
}

impl ExtensionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExtensionState::New,
            1 => ExtensionState::Open,
            2 => ExtensionState::Initialized,
            3 => ExtensionState::Handshaken,
            4 => ExtensionState::Running,
            _ => ExtensionState::Closed,
        }
    }
}

/// Read-only snapshot of an extension's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtensionStats {
    pub send: u64,
    pub receive: u64,
    pub error: u64,
}

type CallId = [u8; CALL_ID_LEN];

/// Pending-call bookkeeping.
///
/// `pending` holds calls awaiting a response; `done` remembers ids that were
/// answered (a second frame with such an id is a spurious duplicate);
/// `expired` remembers ids whose timer fired (a late response is dropped
/// silently).
#[derive(Default)]
struct CallTable {
    pending: HashMap<CallId, oneshot::Sender<Result<Payload, ProtocolError>>>,
    done: HashSet<CallId>,
    expired: HashSet<CallId>,
}

/// Back-reference to the owning session, present from open to close.
struct Link {
    session: Session,
    inbox_tx: mpsc::Sender<Vec<u8>>,
}

struct Handlers {
    on_init: Option<LifecycleHandler>,
    on_handshake: Option<LifecycleHandler>,
    on_message: Option<MessageHandler>,
    on_feed: Option<FeedHandler>,
    on_close: Option<CloseHandler>,
}

struct ExtensionShared {
    name: String,
    codec: EnvelopeCodec,
    timeout: Duration,
    state: AtomicU8,
    handlers: Handlers,
    calls: Mutex<CallTable>,
    link: Mutex<Option<Link>>,
    sent: AtomicU64,
    received: AtomicU64,
    errored: AtomicU64,
}

/// A named channel over a session.
///
/// Cheap to clone; all clones share state. Configure handlers through
/// [`Extension::builder`], register the result on a session, then use
/// [`call`](Extension::call) and [`send`](Extension::send) once the session
/// is past its handshake (or from `on_init` for pre-handshake traffic).
#[derive(Clone)]
pub struct Extension {
    shared: Arc<ExtensionShared>,
}

impl Extension {
    pub fn builder(name: impl Into<String>) -> ExtensionBuilder {
        ExtensionBuilder {
            name: name.into(),
            timeout: crate::DEFAULT_REQUEST_TIMEOUT,
            schema: Schema::new(),
            on_init: None,
            on_handshake: None,
            on_message: None,
            on_feed: None,
            on_close: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ExtensionState {
        ExtensionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> ExtensionStats {
        ExtensionStats {
            send: self.shared.sent.load(Ordering::Relaxed),
            receive: self.shared.received.load(Ordering::Relaxed),
            error: self.shared.errored.load(Ordering::Relaxed),
        }
    }

    /// Send a request and await its response.
    ///
    /// Resolves with the response payload, or rejects with the remote error
    /// response, `ERR_REQUEST_TIMEOUT` after the configured timeout, or
    /// `ERR_CLOSE` if the extension closes first.
    pub async fn call(&self, message: impl Into<Payload>) -> Result<Payload, ProtocolError> {
        let payload = message.into();
        let session = self.link_session()?;
        self.check_sendable(&payload)?;

        let id = new_call_id();
        let frame = self.shared.codec.encode_message(&id, &payload, false);

        let (tx, mut rx) = oneshot::channel();
        {
            let mut calls = self.shared.calls.lock().unwrap();
            calls.pending.insert(id, tx);
        }
        // The table may have been swept by a concurrent close between the
        // state check and the insert.
        if self.state() == ExtensionState::Closed {
            self.shared.calls.lock().unwrap().pending.remove(&id);
            return Err(self.close_reason());
        }

        if let Err(err) = session.send_frame(&self.shared.name, frame).await {
            self.shared.calls.lock().unwrap().pending.remove(&id);
            return Err(err);
        }
        self.shared.sent.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.shared.timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.close_reason()),
            Err(_elapsed) => {
                let raced = {
                    let mut calls = self.shared.calls.lock().unwrap();
                    if calls.pending.remove(&id).is_some() {
                        calls.expired.insert(id);
                        false
                    } else {
                        true
                    }
                };
                if raced {
                    // The response won the race against the timer.
                    match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(self.close_reason()),
                    }
                } else {
                    Err(ProtocolError::timeout())
                }
            }
        }
    }

    /// Send a one-way message. No pending-call entry is created and the
    /// receiver will not respond.
    pub async fn send(&self, message: impl Into<Payload>) -> Result<(), ProtocolError> {
        let payload = message.into();
        let session = self.link_session()?;
        self.check_sendable(&payload)?;

        let id = new_call_id();
        let frame = self.shared.codec.encode_message(&id, &payload, true);
        session.send_frame(&self.shared.name, frame).await?;
        self.shared.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn check_sendable(&self, payload: &Payload) -> Result<(), ProtocolError> {
        if self.shared.codec.accepts(payload) {
            Ok(())
        } else {
            Err(ProtocolError::invalid_argument(format!(
                "type '{}' is not registered on extension '{}'",
                payload.type_url(),
                self.shared.name
            )))
        }
    }

    fn link_session(&self) -> Result<Session, ProtocolError> {
        if self.state() == ExtensionState::Closed {
            return Err(self.close_reason());
        }
        let link = self.shared.link.lock().unwrap();
        match link.as_ref() {
            Some(link) => Ok(link.session.clone()),
            None => Err(self.close_reason()),
        }
    }

    fn close_reason(&self) -> ProtocolError {
        ProtocolError::closed()
    }

    // ========================================================================
    // Session-driven lifecycle
    // ========================================================================

    /// Bind to a session and start the inbox task. Called by the session
    /// exactly once; a second open fails with `ERR_ALREADY_OPEN`.
    pub(crate) fn open(&self, session: Session) -> Result<(), ProtocolError> {
        if self
            .shared
            .state
            .compare_exchange(
                ExtensionState::New as u8,
                ExtensionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ProtocolError::already_open(&self.shared.name));
        }

        let (inbox_tx, mut inbox_rx) = mpsc::channel::<Vec<u8>>(INBOX_CHANNEL_SIZE);
        *self.shared.link.lock().unwrap() = Some(Link { session, inbox_tx });

        let extension = self.clone();
        tokio::spawn(async move {
            while let Some(raw) = inbox_rx.recv().await {
                extension.handle_frame(raw).await;
            }
        });
        Ok(())
    }

    /// Queue an incoming frame for in-order dispatch. Frames for a closed
    /// extension are dropped.
    pub(crate) async fn deliver(&self, raw: Vec<u8>) {
        let inbox_tx = {
            let link = self.shared.link.lock().unwrap();
            link.as_ref().map(|link| link.inbox_tx.clone())
        };
        if let Some(tx) = inbox_tx {
            let _ = tx.send(raw).await;
        }
    }

    pub(crate) async fn run_init(&self) -> Result<(), ProtocolError> {
        if let Some(handler) = self.shared.handlers.on_init.clone() {
            let session = self.link_session()?;
            handler(session).await?;
        }
        self.set_state(ExtensionState::Initialized);
        Ok(())
    }

    pub(crate) async fn run_handshake(&self) -> Result<(), ProtocolError> {
        if let Some(handler) = self.shared.handlers.on_handshake.clone() {
            let session = self.link_session()?;
            handler(session).await?;
        }
        self.set_state(ExtensionState::Handshaken);
        Ok(())
    }

    pub(crate) fn set_running(&self) {
        self.set_state(ExtensionState::Running);
    }

    pub(crate) async fn run_feed(&self, discovery_key: [u8; 32]) {
        if let Some(handler) = self.shared.handlers.on_feed.clone() {
            match self.link_session() {
                Ok(session) => handler(session, discovery_key).await,
                Err(_) => {}
            }
        }
    }

    /// Close the extension: fire the user close handler, reject every
    /// outstanding pending call, clear the table, drop the session link.
    /// Idempotent.
    pub(crate) async fn close(&self, error: Option<ProtocolError>) {
        let prev = self
            .shared
            .state
            .swap(ExtensionState::Closed as u8, Ordering::AcqRel);
        if prev == ExtensionState::Closed as u8 {
            return;
        }

        if let Some(handler) = self.shared.handlers.on_close.clone() {
            handler(error.clone()).await;
        }

        let pending = {
            let mut calls = self.shared.calls.lock().unwrap();
            std::mem::take(&mut calls.pending)
        };
        let reason = error.unwrap_or_else(ProtocolError::closed);
        for (_, tx) in pending {
            let _ = tx.send(Err(reason.clone()));
        }

        *self.shared.link.lock().unwrap() = None;
    }

    fn set_state(&self, state: ExtensionState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    // ========================================================================
    // Incoming frames
    // ========================================================================

    /// Decode and dispatch one frame. Runs on the inbox task, so invocations
    /// are serialized per extension.
    pub(crate) async fn handle_frame(&self, raw: Vec<u8>) {
        if self.state() == ExtensionState::Closed {
            return;
        }

        let decoded = self.shared.codec.decode(&raw);
        let id = match decoded.call_id() {
            Some(id) => id,
            None => {
                warn!(extension = %self.shared.name, "dropping unparseable frame");
                self.shared.errored.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // Response correlation comes first.
        enum Matched {
            Deliver(oneshot::Sender<Result<Payload, ProtocolError>>),
            Duplicate,
            Expired,
            Unsolicited,
        }
        let matched = {
            let mut calls = self.shared.calls.lock().unwrap();
            if let Some(tx) = calls.pending.remove(&id) {
                calls.done.insert(id);
                Matched::Deliver(tx)
            } else if calls.done.contains(&id) {
                Matched::Duplicate
            } else if calls.expired.remove(&id) {
                Matched::Expired
            } else {
                Matched::Unsolicited
            }
        };

        match matched {
            Matched::Deliver(tx) => {
                self.shared.received.fetch_add(1, Ordering::Relaxed);
                let result = match decoded.error {
                    Some(detail) => Err(ProtocolError::new(detail.code, detail.message)),
                    None => match decoded.data {
                        DecodedData::Payload(payload) => Ok(payload),
                        DecodedData::Empty => Ok(Payload::Bytes(Vec::new())),
                        DecodedData::UnknownType(url) => {
                            Err(ProtocolError::system(format!("unknown payload type '{url}'")))
                        }
                    },
                };
                let _ = tx.send(result);
            }
            Matched::Duplicate => {
                warn!(extension = %self.shared.name, "dropping duplicate response frame");
            }
            Matched::Expired => {
                // Response to a call that already timed out; counters stay
                // untouched.
                debug!(extension = %self.shared.name, "dropping response to expired call");
            }
            Matched::Unsolicited => self.dispatch_message(id, decoded).await,
        }
    }

    async fn dispatch_message(&self, id: CallId, decoded: tether_wire::Decoded) {
        let oneway = decoded.oneway;

        if decoded.error.is_some() {
            warn!(extension = %self.shared.name, "dropping stray error response");
            self.shared.errored.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let session = match self.link_session() {
            Ok(session) => session,
            Err(_) => return,
        };

        let handler = match self.shared.handlers.on_message.clone() {
            Some(handler) => handler,
            None => {
                self.shared.errored.fetch_add(1, Ordering::Relaxed);
                session.emit_error(ProtocolError::no_handler(&self.shared.name));
                return;
            }
        };

        let payload = match decoded.data {
            DecodedData::Payload(payload) => payload,
            DecodedData::Empty => Payload::Bytes(Vec::new()),
            DecodedData::UnknownType(url) => {
                self.shared.errored.fetch_add(1, Ordering::Relaxed);
                if !oneway {
                    let message = format!("unknown payload type '{url}'");
                    self.respond_error(&session, &id, codes::ERR_SYSTEM, &message)
                        .await;
                }
                return;
            }
        };

        self.shared.received.fetch_add(1, Ordering::Relaxed);

        match handler(session.clone(), payload, MessageOptions { oneway }).await {
            Ok(response) => {
                if !oneway {
                    // A handler returning nothing still acknowledges with an
                    // empty payload; raw bytes are Buffer-wrapped by the
                    // codec.
                    let response = response.unwrap_or_else(|| Payload::Bytes(Vec::new()));
                    let frame = self.shared.codec.encode_message(&id, &response, false);
                    if session.send_frame(&self.shared.name, frame).await.is_ok() {
                        self.shared.sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(err) => {
                self.shared.errored.fetch_add(1, Ordering::Relaxed);
                if oneway {
                    warn!(
                        extension = %self.shared.name,
                        code = err.code(),
                        "one-way handler failed: {}",
                        err.message()
                    );
                } else {
                    self.respond_error(&session, &id, err.code(), err.message())
                        .await;
                }
            }
        }
    }

    async fn respond_error(&self, session: &Session, id: &CallId, code: &str, message: &str) {
        let frame = self.shared.codec.encode_error(id, code, message);
        let _ = session.send_frame(&self.shared.name, frame).await;
    }

    /// Number of outstanding pending calls. Exposed for tests.
    pub fn pending_calls(&self) -> usize {
        self.shared.calls.lock().unwrap().pending.len()
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn new_call_id() -> CallId {
    let mut id = [0u8; CALL_ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

// ============================================================================
// Builder
// ============================================================================

/// Configures an [`Extension`] before it is registered on a session.
pub struct ExtensionBuilder {
    name: String,
    timeout: Duration,
    schema: Schema,
    on_init: Option<LifecycleHandler>,
    on_handshake: Option<LifecycleHandler>,
    on_message: Option<MessageHandler>,
    on_feed: Option<FeedHandler>,
    on_close: Option<CloseHandler>,
}

impl ExtensionBuilder {
    /// Response timeout for [`Extension::call`]. Defaults to 2 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register the typed-payload schema for this extension. Without one the
    /// extension runs in raw-buffer mode.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Hook run while the session initializes extensions, before the init
    /// gate. Failing here vetoes the connection on both sides.
    pub fn on_init<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        self.on_init = Some(Arc::new(move |session| Box::pin(handler(session))));
        self
    }

    /// Hook run after the init gate passed on both sides.
    pub fn on_handshake<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        self.on_handshake = Some(Arc::new(move |session| Box::pin(handler(session))));
        self
    }

    /// Handler for incoming messages. Its `Ok` payload becomes the response;
    /// an `Err` becomes an error response carrying the error's code.
    pub fn on_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Session, Payload, MessageOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_message = Some(Arc::new(move |session, payload, options| {
            Box::pin(handler(session, payload, options))
        }));
        self
    }

    /// Hook run for every feed the peer references after the handshake.
    pub fn on_feed<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Session, [u8; 32]) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_feed = Some(Arc::new(move |session, key| Box::pin(handler(session, key))));
        self
    }

    /// Hook run when the extension closes, before pending calls are
    /// rejected. Receives the close reason, if any.
    pub fn on_close<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Option<ProtocolError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_close = Some(Arc::new(move |error| Box::pin(handler(error))));
        self
    }

    pub fn build(self) -> Extension {
        Extension {
            shared: Arc::new(ExtensionShared {
                name: self.name,
                codec: EnvelopeCodec::new(self.schema),
                timeout: self.timeout,
                state: AtomicU8::new(ExtensionState::New as u8),
                handlers: Handlers {
                    on_init: self.on_init,
                    on_handshake: self.on_handshake,
                    on_message: self.on_message,
                    on_feed: self.on_feed,
                    on_close: self.on_close,
                },
                calls: Mutex::new(CallTable::default()),
                link: Mutex::new(None),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                errored: AtomicU64::new(0),
            }),
        }
    }
}
