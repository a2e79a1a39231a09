//! Session lifecycle and frame routing.
//!
//! A [`Session`] wraps one duplex transport endpoint. An internal driver
//! task exclusively owns the transport: every outbound write funnels through
//! a single command channel so writes stay serialized and FIFO, and every
//! inbound event is demultiplexed to the registered extension by name. A
//! second task sequences the lifecycle: open hooks, transport handshake,
//! per-extension init, the init gate, user handshake callbacks, then the
//! running phase.
//!
//! ```text
//! constructed → opening → awaiting transport handshake → initializing
//!             → awaiting init gate → running → closed (terminal)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::context::Context;
use crate::errors::ProtocolError;
use crate::events::{EventSender, SessionEvent};
use crate::extension::{BoxFuture, Extension};
use crate::init::InitGate;
use crate::registry::ExtensionRegistry;
use crate::transport::{DynTransport, Transport, TransportEvent};
use crate::OUTBOUND_CHANNEL_SIZE;

/// Shared 32-byte key identifying the channel both peers join.
pub type Topic = [u8; 32];

/// Opaque JSON object exchanged once during the transport handshake.
pub type SessionData = serde_json::Map<String, serde_json::Value>;

type DiscoveryResolver = Arc<dyn Fn([u8; 32]) -> BoxFuture<Option<Vec<u8>>> + Send + Sync>;
type HandshakeHandler =
    Arc<dyn Fn(Session) -> BoxFuture<Result<(), ProtocolError>> + Send + Sync>;

/// Session construction options.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bound on the init-gate wait for the remote verdict.
    pub init_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            init_timeout: crate::DEFAULT_INIT_TIMEOUT,
        }
    }
}

/// Session lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Constructed,
    Opening,
    AwaitingHandshake,
    Initializing,
    AwaitingInitGate,
    Running,
    Closed,
}

/// All outbound work goes to the driver through one channel, so a frame
/// queued before a shutdown request is still written first.
enum DriverCommand {
    Frame { name: String, payload: Vec<u8> },
    Feed { key: Vec<u8> },
    Shutdown,
}

struct SessionShared {
    options: SessionOptions,
    resolver: Mutex<DiscoveryResolver>,
    registry: Mutex<ExtensionRegistry>,
    init_gate: InitGate,
    events: EventSender,
    state_tx: watch::Sender<SessionState>,
    handshake_tx: watch::Sender<bool>,
    driver_done_tx: watch::Sender<bool>,
    outbound_tx: mpsc::Sender<DriverCommand>,
    outbound_rx: Mutex<Option<mpsc::Receiver<DriverCommand>>>,
    feeds_tx: mpsc::Sender<[u8; 32]>,
    feeds_rx: Mutex<Option<mpsc::Receiver<[u8; 32]>>>,
    transport: Mutex<Option<Box<dyn DynTransport>>>,
    local_data: Mutex<SessionData>,
    remote_data: OnceLock<SessionData>,
    remote_id: OnceLock<[u8; 32]>,
    context: Mutex<Arc<Context>>,
    handshake_handlers: Mutex<Vec<HandshakeHandler>>,
    topic: Mutex<Option<Vec<u8>>>,
    started: AtomicBool,
    closing: AtomicBool,
    close_reason: Mutex<Option<ProtocolError>>,
}

/// One end of a peer connection.
///
/// Cheap to clone; all clones share state. Configure with the `set_*`
/// methods, then call [`init`](Session::init) to start the lifecycle.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Wrap a transport endpoint. Nothing happens until
    /// [`init`](Session::init).
    pub fn new<T: Transport>(transport: T, options: SessionOptions) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let (feeds_tx, feeds_rx) = mpsc::channel(16);
        let (state_tx, _) = watch::channel(SessionState::Constructed);
        let (handshake_tx, _) = watch::channel(false);
        let (driver_done_tx, _) = watch::channel(false);

        let init_gate = InitGate::new();
        let registry = ExtensionRegistry::new(init_gate.extension().clone());

        Self {
            shared: Arc::new(SessionShared {
                options,
                resolver: Mutex::new(identity_resolver()),
                registry: Mutex::new(registry),
                init_gate,
                events: EventSender::new(),
                state_tx,
                handshake_tx,
                driver_done_tx,
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                feeds_tx,
                feeds_rx: Mutex::new(Some(feeds_rx)),
                transport: Mutex::new(Some(Box::new(transport))),
                local_data: Mutex::new(SessionData::new()),
                remote_data: OnceLock::new(),
                remote_id: OnceLock::new(),
                context: Mutex::new(Arc::new(Context::new())),
                handshake_handlers: Mutex::new(Vec::new()),
                topic: Mutex::new(None),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                close_reason: Mutex::new(None),
            }),
        }
    }

    // ========================================================================
    // Pre-init configuration
    // ========================================================================

    /// Set the local session data sent to the peer during the handshake.
    ///
    /// # Panics
    ///
    /// Panics if called after [`init`](Session::init).
    pub fn set_session_data(&self, data: SessionData) -> &Self {
        self.assert_not_started();
        *self.shared.local_data.lock().unwrap() = data;
        self
    }

    /// Set the local, never-transmitted context handlers read through
    /// [`context`](Session::context).
    ///
    /// # Panics
    ///
    /// Panics if called after [`init`](Session::init).
    pub fn set_context(&self, context: Context) -> &Self {
        self.assert_not_started();
        *self.shared.context.lock().unwrap() = Arc::new(context);
        self
    }

    /// Register an extension.
    ///
    /// # Panics
    ///
    /// Panics if called after [`init`](Session::init) or if the name is
    /// already registered.
    pub fn set_extension(&self, extension: Extension) -> &Self {
        self.assert_not_started();
        let result = self.shared.registry.lock().unwrap().insert(extension);
        if let Err(err) = result {
            panic!("{err}");
        }
        self
    }

    /// Register several extensions in order.
    ///
    /// # Panics
    ///
    /// See [`set_extension`](Session::set_extension).
    pub fn set_extensions(&self, extensions: Vec<Extension>) -> &Self {
        for extension in extensions {
            self.set_extension(extension);
        }
        self
    }

    /// Append a handshake callback. Callbacks run sequentially after the
    /// init gate passes; a failure aborts the session with
    /// `ERR_PROTOCOL_HANDSHAKE_FAILED`.
    ///
    /// # Panics
    ///
    /// Panics if called after [`init`](Session::init).
    pub fn set_handshake_handler<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ProtocolError>> + Send + 'static,
    {
        self.assert_not_started();
        self.shared
            .handshake_handlers
            .lock()
            .unwrap()
            .push(Arc::new(move |session| Box::pin(handler(session))));
        self
    }

    /// Replace the discovery-key → public-key resolver. Defaults to
    /// identity (the discovery key is used as the key).
    ///
    /// # Panics
    ///
    /// Panics if called after [`init`](Session::init).
    pub fn set_discovery_resolver<F, Fut>(&self, resolver: F) -> &Self
    where
        F: Fn([u8; 32]) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Vec<u8>>> + Send + 'static,
    {
        self.assert_not_started();
        *self.shared.resolver.lock().unwrap() = Arc::new(move |key| Box::pin(resolver(key)));
        self
    }

    fn assert_not_started(&self) {
        assert!(
            !self.shared.started.load(Ordering::Acquire),
            "session setters must be called before init()"
        );
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// The local per-peer context.
    pub fn context(&self) -> Arc<Context> {
        self.shared.context.lock().unwrap().clone()
    }

    /// The peer's session data; available once the transport handshake
    /// completed, `{}` if the peer sent undecodable data.
    pub fn remote_session_data(&self) -> Option<SessionData> {
        self.shared.remote_data.get().cloned()
    }

    /// The peer's id; available once the transport handshake completed.
    pub fn remote_peer_id(&self) -> Option<[u8; 32]> {
        self.shared.remote_id.get().copied()
    }

    /// Look up a registered extension by name.
    pub fn extension(&self, name: &str) -> Option<Extension> {
        self.shared.registry.lock().unwrap().get(name).cloned()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the session, optionally seeding the transport with a topic.
    /// Idempotent; repeated calls are no-ops.
    pub fn init(&self, topic: Option<Topic>) -> &Self {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return self;
        }

        let transport = self.shared.transport.lock().unwrap().take();
        let outbound_rx = self.shared.outbound_rx.lock().unwrap().take();
        let feeds_rx = self.shared.feeds_rx.lock().unwrap().take();
        let (transport, outbound_rx, feeds_rx) = match (transport, outbound_rx, feeds_rx) {
            (Some(t), Some(o), Some(f)) => (t, o, f),
            _ => return self,
        };

        let driver_session = self.clone();
        tokio::spawn(async move {
            let result = drive(transport, driver_session.clone(), outbound_rx).await;
            driver_session.shared.driver_done_tx.send_replace(true);
            match result {
                Ok(()) => driver_session.shutdown(None).await,
                Err(err) => driver_session.shutdown(Some(err)).await,
            }
        });

        let lifecycle_session = self.clone();
        tokio::spawn(async move {
            if let Err(err) = open_sequence(lifecycle_session.clone(), topic, feeds_rx).await {
                lifecycle_session.shutdown(Some(err)).await;
            }
        });

        self
    }

    /// Wait until the session is running, or fail with the close reason.
    pub async fn ready(&self) -> Result<(), ProtocolError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        loop {
            match *state_rx.borrow_and_update() {
                SessionState::Running => return Ok(()),
                SessionState::Closed => return Err(self.close_reason_or_default()),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(self.close_reason_or_default());
            }
        }
    }

    /// Wait until the session closed; returns the close reason, if any.
    pub async fn closed(&self) -> Option<ProtocolError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        loop {
            if *state_rx.borrow_and_update() == SessionState::Closed {
                return self.shared.close_reason.lock().unwrap().clone();
            }
            if state_rx.changed().await.is_err() {
                return self.shared.close_reason.lock().unwrap().clone();
            }
        }
    }

    /// Close the session. Idempotent; repeated calls are no-ops.
    pub async fn close(&self) {
        self.shutdown(None).await;
    }

    // ========================================================================
    // Crate-internal plumbing
    // ========================================================================

    /// Queue a frame for the driver to write.
    pub(crate) async fn send_frame(
        &self,
        name: &str,
        payload: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        self.shared
            .outbound_tx
            .send(DriverCommand::Frame {
                name: name.to_owned(),
                payload,
            })
            .await
            .map_err(|_| ProtocolError::closed())
    }

    pub(crate) fn emit_error(&self, err: ProtocolError) {
        self.shared.events.emit(SessionEvent::Error(err));
    }

    /// Destroy the transport and close every extension, recording (and
    /// emitting) the reason if one is given. Idempotent: a second caller
    /// waits for the terminal state instead.
    pub(crate) async fn shutdown(&self, reason: Option<ProtocolError>) {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::AcqRel) {
            let mut state_rx = shared.state_tx.subscribe();
            loop {
                if *state_rx.borrow_and_update() == SessionState::Closed {
                    return;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        }

        if let Some(err) = &reason {
            debug!(code = err.code(), "session closing with error: {}", err.message());
            *shared.close_reason.lock().unwrap() = Some(err.clone());
            shared.events.emit(SessionEvent::Error(err.clone()));
        }

        // Stop the driver; it destroys the transport on the way out. A frame
        // queued before this command is still written first.
        let _ = shared.outbound_tx.send(DriverCommand::Shutdown).await;
        if shared.started.load(Ordering::Acquire) {
            let mut done_rx = shared.driver_done_tx.subscribe();
            loop {
                if *done_rx.borrow_and_update() {
                    break;
                }
                if done_rx.changed().await.is_err() {
                    break;
                }
            }
        }

        // Close extensions sequentially, the init gate first.
        let ordered = { shared.registry.lock().unwrap().ordered().to_vec() };
        for extension in &ordered {
            extension.close(reason.clone()).await;
        }

        self.set_state(SessionState::Closed);
        shared.events.emit(SessionEvent::Closed);
    }

    fn set_state(&self, state: SessionState) {
        self.shared.state_tx.send_replace(state);
    }

    fn close_reason_or_default(&self) -> ProtocolError {
        self.shared
            .close_reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(ProtocolError::closed)
    }

    fn resolver(&self) -> DiscoveryResolver {
        self.shared.resolver.lock().unwrap().clone()
    }

    async fn queue_feed(&self, key: Vec<u8>) -> Result<(), ProtocolError> {
        self.shared
            .outbound_tx
            .send(DriverCommand::Feed { key })
            .await
            .map_err(|_| ProtocolError::closed())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn identity_resolver() -> DiscoveryResolver {
    Arc::new(|key| Box::pin(async move { Some(key.to_vec()) }))
}

// ============================================================================
// Driver
// ============================================================================

/// Own the transport: apply the advertised extension list and user data,
/// start the handshake, then loop writing queued commands and demultiplexing
/// incoming events until shutdown or end of stream.
async fn drive(
    mut transport: Box<dyn DynTransport>,
    session: Session,
    mut outbound_rx: mpsc::Receiver<DriverCommand>,
) -> Result<(), ProtocolError> {
    let shared = session.shared.clone();

    let names = { shared.registry.lock().unwrap().sorted_names() };
    for name in &names {
        transport.advertise(name);
    }
    let user_data = {
        let data = shared.local_data.lock().unwrap();
        serde_json::to_vec(&*data).unwrap_or_default()
    };
    transport.set_user_data(user_data);

    if let Err(err) = transport.start().await {
        let _ = transport.destroy().await;
        return Err(ProtocolError::connection_invalid(format!(
            "transport start failed: {err}"
        )));
    }

    loop {
        tokio::select! {
            biased;

            command = outbound_rx.recv() => match command {
                Some(DriverCommand::Frame { name, payload }) => {
                    if let Err(err) = transport.send_extension(&name, payload).await {
                        let _ = transport.destroy().await;
                        return Err(ProtocolError::system(format!("transport write failed: {err}")));
                    }
                }
                Some(DriverCommand::Feed { key }) => {
                    if let Err(err) = transport.feed(&key).await {
                        let _ = transport.destroy().await;
                        return Err(ProtocolError::system(format!("transport feed failed: {err}")));
                    }
                }
                Some(DriverCommand::Shutdown) | None => {
                    let _ = transport.destroy().await;
                    return Ok(());
                }
            },

            event = transport.next_event() => match event {
                Ok(Some(TransportEvent::Handshake)) => {
                    let remote_user = transport.remote_user_data().unwrap_or_default();
                    let data = serde_json::from_slice::<SessionData>(&remote_user)
                        .unwrap_or_default();
                    let _ = shared.remote_data.set(data);
                    if let Some(id) = transport.remote_id() {
                        let _ = shared.remote_id.set(id);
                    }
                    shared.handshake_tx.send_replace(true);
                }
                Ok(Some(TransportEvent::Feed { discovery_key })) => {
                    let _ = shared.feeds_tx.send(discovery_key).await;
                }
                Ok(Some(TransportEvent::Extension { name, payload })) => {
                    let extension = { shared.registry.lock().unwrap().get(&name).cloned() };
                    match extension {
                        Some(extension) => extension.deliver(payload).await,
                        None => {
                            // Fatal: the peers disagree about the extension
                            // set.
                            let _ = transport.destroy().await;
                            return Err(ProtocolError::extension_missing(&name));
                        }
                    }
                }
                Ok(None) => {
                    // End of stream. Before the session is running this is a
                    // failed connection, not a regular close.
                    let _ = transport.destroy().await;
                    if session.state() == SessionState::Running {
                        return Ok(());
                    }
                    return Err(ProtocolError::connection_invalid(
                        "stream ended before the connection was established",
                    ));
                }
                Err(err) => {
                    let _ = transport.destroy().await;
                    return Err(ProtocolError::system(format!("transport error: {err}")));
                }
            },
        }
    }
}

// ============================================================================
// Lifecycle sequence
// ============================================================================

/// Run the open → init → init-gate → handshake sequence, then dispatch feed
/// references until the session closes. Returning `Err` makes the caller
/// shut the session down with that reason; an early `Ok` means another task
/// is already closing it.
async fn open_sequence(
    session: Session,
    topic: Option<Topic>,
    mut feeds_rx: mpsc::Receiver<[u8; 32]>,
) -> Result<(), ProtocolError> {
    let shared = session.shared.clone();
    session.set_state(SessionState::Opening);

    let (ordered, user_extensions) = {
        let registry = shared.registry.lock().unwrap();
        (
            registry.ordered().to_vec(),
            registry.user_extensions().to_vec(),
        )
    };

    // Open hooks: the init extension first, then user extensions in
    // registration order.
    for extension in &ordered {
        if let Err(err) = extension.open(session.clone()) {
            return Err(ProtocolError::init_failed(format!(
                "failed to open extension '{}': {}",
                extension.name(),
                err.message()
            )));
        }
    }

    session.set_state(SessionState::AwaitingHandshake);

    // Feed/topic bootstrap: a supplied topic is resolved and fed right away;
    // otherwise the first feed reference from the peer picks the key.
    if let Some(topic) = topic {
        let resolver = session.resolver();
        let key = resolver(topic)
            .await
            .ok_or_else(|| ProtocolError::connection_invalid("key not found"))?;
        *shared.topic.lock().unwrap() = Some(key.clone());
        session.queue_feed(key).await?;
    }

    // Wait for the transport handshake, resolving feed references that
    // arrive in the meantime.
    let mut handshake_rx = shared.handshake_tx.subscribe();
    let mut state_rx = shared.state_tx.subscribe();
    let mut early_feeds: Vec<[u8; 32]> = Vec::new();
    loop {
        if *handshake_rx.borrow_and_update() {
            break;
        }
        if *state_rx.borrow_and_update() == SessionState::Closed {
            return Ok(());
        }
        tokio::select! {
            changed = handshake_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            feed = feeds_rx.recv() => match feed {
                Some(key) => {
                    let have_topic = shared.topic.lock().unwrap().is_some();
                    if have_topic {
                        early_feeds.push(key);
                    } else {
                        let resolver = session.resolver();
                        let resolved = resolver(key)
                            .await
                            .ok_or_else(|| ProtocolError::connection_invalid("key not found"))?;
                        *shared.topic.lock().unwrap() = Some(resolved.clone());
                        session.queue_feed(resolved).await?;
                    }
                }
                None => return Ok(()),
            },
        }
    }

    session.set_state(SessionState::Initializing);

    // Init hooks in registration order. A failure vetoes the connection on
    // both sides before aborting locally.
    for extension in &user_extensions {
        if let Err(err) = extension.run_init().await {
            warn!(
                extension = extension.name(),
                code = err.code(),
                "extension init failed: {}",
                err.message()
            );
            shared.init_gate.abort().await;
            return Err(ProtocolError::init_failed(err.message().to_owned()));
        }
    }

    session.set_state(SessionState::AwaitingInitGate);
    let valid = match shared.init_gate.confirm(shared.options.init_timeout).await {
        Ok(valid) => valid,
        // The gate could not even speak: another task is tearing the
        // session down and owns the close reason.
        Err(err) if err.is(crate::errors::codes::ERR_CLOSE) => return Ok(()),
        Err(err) => return Err(err),
    };
    if !valid {
        return Err(ProtocolError::connection_invalid(
            "connection vetoed by init gate",
        ));
    }

    shared.events.emit(SessionEvent::ExtensionsInitialized);

    // User handshake callbacks run sequentially, then per-extension hooks.
    let handlers = { shared.handshake_handlers.lock().unwrap().clone() };
    for handler in handlers {
        if let Err(err) = handler(session.clone()).await {
            return Err(ProtocolError::handshake_failed(err.message().to_owned()));
        }
    }
    for extension in &user_extensions {
        if let Err(err) = extension.run_handshake().await {
            return Err(ProtocolError::handshake_failed(err.message().to_owned()));
        }
    }

    for extension in &ordered {
        extension.set_running();
    }
    session.set_state(SessionState::Running);
    shared.events.emit(SessionEvent::Handshake);

    // Feed listener: every later feed reference reaches each extension in
    // registration order.
    for key in early_feeds {
        for extension in &ordered {
            extension.run_feed(key).await;
        }
    }
    loop {
        tokio::select! {
            feed = feeds_rx.recv() => match feed {
                Some(key) => {
                    for extension in &ordered {
                        extension.run_feed(key).await;
                    }
                }
                None => break,
            },
            changed = state_rx.changed() => {
                if changed.is_err() || *state_rx.borrow() == SessionState::Closed {
                    break;
                }
            }
        }
    }

    Ok(())
}
