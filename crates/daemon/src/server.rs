//! TCP listener wiring: accept, handshake, register, initialize.
//!
//! No protocol logic lives here. Each accepted socket runs the handshake
//! engine; a success becomes a registered [`DeviceSession`] driven
//! through initialization, and a later connection from the same device
//! replaces the earlier session.

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::handshake::{HandshakeConfig, HandshakeEngine};
use crate::keys::KeyStore;
use crate::session::{DeviceSession, SessionEvent, SessionTimings};

/// The device-facing listener and its live-session registry.
pub struct DeviceServer {
    engine: Arc<HandshakeEngine>,
    sessions: Arc<DashMap<String, Arc<DeviceSession>>>,
    timings: SessionTimings,
    shutdown: CancellationToken,
}

impl DeviceServer {
    /// Builds the server from configuration, creating server keys on
    /// first run.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(KeyStore::new(&config.daemon.data_dir));
        let server_key = store
            .load_or_create_server_keys()
            .context("failed to load server keys")?;

        let handshake_config = HandshakeConfig {
            handshake_timeout: config.protocol.handshake_timeout(),
            read_timeout: config.protocol.read_timeout(),
            first_frame_timeout: config.protocol.read_timeout(),
        };
        let engine = Arc::new(HandshakeEngine::new(
            Arc::new(server_key),
            store,
            handshake_config,
        ));

        Ok(Self {
            engine,
            sessions: Arc::new(DashMap::new()),
            timings: SessionTimings {
                response_timeout: config.protocol.response_timeout(),
            },
            shutdown: CancellationToken::new(),
        })
    }

    /// Handle used to stop the accept loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A live session by device id.
    pub fn session(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.get(device_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Binds the configured address and accepts connections until the
    /// shutdown token fires.
    pub async fn run(&self, listen_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", listen_addr))?;
        self.run_listener(listener).await
    }

    /// Accepts connections on an already-bound listener.
    pub async fn run_listener(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "device listener up");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("device listener stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer) = accepted.context("accept failed")?;
                    let engine = Arc::clone(&self.engine);
                    let sessions = Arc::clone(&self.sessions);
                    let timings = self.timings.clone();
                    tokio::spawn(async move {
                        handle_connection(engine, sessions, timings, socket, peer.to_string())
                            .await;
                    });
                }
            }
        }
    }
}

/// One connection: handshake, register, initialize, deregister on close.
async fn handle_connection(
    engine: Arc<HandshakeEngine>,
    sessions: Arc<DashMap<String, Arc<DeviceSession>>>,
    timings: SessionTimings,
    socket: TcpStream,
    peer: String,
) {
    let outcome = match engine.run(socket).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // The device reconnects on its own schedule; nothing to keep.
            warn!(peer, error = %e, "handshake failed");
            return;
        }
    };

    let device_id = outcome.device_id.clone();
    let session = DeviceSession::attach(
        outcome.device_id,
        outcome.link,
        outcome.first_frame,
        timings,
    );

    // A fresh connection supersedes any lingering session for the device.
    if let Some(previous) = sessions.insert(device_id.clone(), Arc::clone(&session)) {
        previous.disconnect("superseded by new connection");
    }

    let mut events = session.subscribe_events();

    if let Err(e) = session.complete_initialization().await {
        warn!(device_id, error = %e, "initialization failed");
        session.disconnect("initialization failed");
    }

    // Hold the registry entry until the session dies.
    loop {
        match events.recv().await {
            Ok(SessionEvent::Disconnected { .. }) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    sessions.remove_if(&device_id, |_, current| Arc::ptr_eq(current, &session));
    info!(device_id, "session deregistered");
}
