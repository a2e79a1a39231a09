//! Built-in init-gate extension.
//!
//! After both peers run their extensions' init hooks, each side reports the
//! outcome on this channel before any user handshake handler observes the
//! peer. The protocol is three literal ASCII tokens: `valid`, `invalid`, and
//! `destroy` (a one-way follow-up to `invalid` instructing the remote to tear
//! the stream down). All init-gate traffic is one-way.
//!
//! The extension registers first so its on-wire name advertises predictably.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use tether_wire::InitCommand;

use crate::extension::Extension;
use crate::ProtocolError;

/// Fixed on-wire name of the init-gate extension.
pub const INIT_EXTENSION_NAME: &str = "dxos.protocol.init";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteResult {
    Unknown,
    Valid,
    Invalid,
}

struct InitState {
    remote: Mutex<RemoteResult>,
    notify: Notify,
    aborted: AtomicBool,
}

impl InitState {
    fn record(&self, result: RemoteResult) {
        {
            let mut remote = self.remote.lock().unwrap();
            if *remote == RemoteResult::Unknown {
                *remote = result;
            }
        }
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> RemoteResult {
        loop {
            let notified = self.notify.notified();
            {
                let remote = *self.remote.lock().unwrap();
                if remote != RemoteResult::Unknown {
                    return remote;
                }
            }
            notified.await;
        }
    }
}

/// The init gate owned by every session.
pub(crate) struct InitGate {
    extension: Extension,
    state: Arc<InitState>,
}

impl InitGate {
    pub(crate) fn new() -> Self {
        let state = Arc::new(InitState {
            remote: Mutex::new(RemoteResult::Unknown),
            notify: Notify::new(),
            aborted: AtomicBool::new(false),
        });

        let on_message_state = state.clone();
        let on_close_state = state.clone();

        let extension = Extension::builder(INIT_EXTENSION_NAME)
            .on_message(move |session, payload, _options| {
                let state = on_message_state.clone();
                async move {
                    let command = payload.as_bytes().and_then(InitCommand::parse);
                    match command {
                        Some(InitCommand::Valid) => state.record(RemoteResult::Valid),
                        Some(InitCommand::Invalid) => state.record(RemoteResult::Invalid),
                        Some(InitCommand::Destroy) => {
                            debug!("remote requested teardown after init veto");
                            state.record(RemoteResult::Invalid);
                            session
                                .shutdown(Some(ProtocolError::connection_invalid(
                                    "remote vetoed the connection",
                                )))
                                .await;
                        }
                        None => {
                            warn!("ignoring unknown init-gate token");
                        }
                    }
                    Ok(None)
                }
            })
            .on_close(move |_error| {
                let state = on_close_state.clone();
                async move {
                    state.record(RemoteResult::Invalid);
                }
            })
            .build();

        Self { extension, state }
    }

    pub(crate) fn extension(&self) -> &Extension {
        &self.extension
    }

    /// Report local init success and wait for the remote verdict.
    ///
    /// Resolves `true` iff the remote reported `valid` before the timeout.
    pub(crate) async fn confirm(&self, timeout: Duration) -> Result<bool, ProtocolError> {
        self.extension
            .send(InitCommand::Valid.as_bytes())
            .await?;
        match tokio::time::timeout(timeout, self.state.wait()).await {
            Ok(result) => Ok(result == RemoteResult::Valid),
            Err(_elapsed) => {
                debug!("init gate timed out waiting for the remote verdict");
                Ok(false)
            }
        }
    }

    /// Veto the connection: report `invalid`, then best-effort `destroy`.
    /// Idempotent.
    pub(crate) async fn abort(&self) {
        if self.state.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.extension.send(InitCommand::Invalid.as_bytes()).await {
            debug!(code = err.code(), "failed to send init veto");
            return;
        }
        if let Err(err) = self.extension.send(InitCommand::Destroy.as_bytes()).await {
            debug!(code = err.code(), "failed to send teardown request");
        }
    }
}
