//! Per-connection protocol state machine.
//!
//! A `DeviceSession` owns all traffic on one authenticated connection:
//! the wrapping send/receive counters, the token table correlating
//! requests to responses, the four-stage readiness gate, the fail-fast
//! ownership lock and the RPC helpers built on top of them.
//!
//! Each connection runs as one logical task: the run loop is the only
//! consumer of inbound frames, so sequence-numbered traffic is processed
//! strictly in arrival order. Acknowledgments bypass the sequence check
//! and may effectively race ahead of numbered traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use protocol::catalog::{self, MessageKind, MessageName};
use protocol::{Packet, ProtocolError, Result, Value, ValueType};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::Dispatch;
use crate::handshake::SecureLink;

/// Readiness gate a session climbs exactly once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    /// Connected, nothing heard yet.
    Initial = 1,
    /// The device's Hello arrived and seeded the receive counter.
    GotHello = 2,
    /// The function/variable manifest and module info are in hand.
    GotDescription = 3,
    /// Fully initialized; RPC traffic is allowed.
    Ready = 4,
}

/// Notifications a session broadcasts to its collaborators.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Initialization finished; the session accepts RPC traffic.
    Ready,
    /// The connection is gone; every outstanding wait has been rejected.
    Disconnected {
        /// Why the session ended.
        reason: String,
    },
    /// A firmware transfer started.
    FlashStarted,
    /// A firmware transfer completed.
    FlashSucceeded,
    /// A firmware transfer failed (after cleanup).
    FlashFailed {
        /// The surfaced failure.
        reason: String,
    },
}

/// Exclusive-ownership handle returned by [`DeviceSession::take_ownership`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner(u64);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Timing knobs for correlated waits.
#[derive(Debug, Clone)]
pub struct SessionTimings {
    /// Ceiling on any correlated response (RPC, description fetch).
    pub response_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything the device declared about itself in its description.
#[derive(Debug, Clone, Default)]
pub struct DeviceAttributes {
    /// Callable function names.
    pub functions: Vec<String>,
    /// Variable name to declared wire type.
    pub variables: HashMap<String, String>,
    /// Opaque firmware module information.
    pub modules: Option<serde_json::Value>,
    /// Platform identifier.
    pub platform_id: Option<u32>,
    /// Largest firmware image the device accepts.
    pub max_binary_size: Option<u32>,
    /// Chunk size the device prefers for OTA transfers.
    pub ota_chunk_size: Option<u16>,
    /// Whether the device supports fast OTA.
    pub fast_ota: bool,
}

impl DeviceAttributes {
    /// Folds one description fragment in. Returns which halves the
    /// fragment carried: (manifest, module info).
    fn absorb(&mut self, json: &serde_json::Value) -> (bool, bool) {
        let mut manifest = false;
        let mut modules = false;

        if let Some(functions) = json.get("f").and_then(|f| f.as_array()) {
            self.functions = functions
                .iter()
                .filter_map(|f| f.as_str().map(str::to_owned))
                .collect();
            manifest = true;
        }
        if let Some(variables) = json.get("v").and_then(|v| v.as_object()) {
            self.variables = variables
                .iter()
                .filter_map(|(name, ty)| ty.as_str().map(|t| (name.clone(), t.to_owned())))
                .collect();
            manifest = true;
        }

        if let Some(module_info) = json.get("m") {
            self.modules = Some(module_info.clone());
            modules = true;
        }
        if let Some(platform) = json.get("p").and_then(|p| p.as_u64()) {
            self.platform_id = u32::try_from(platform).ok();
            modules = true;
        }
        if let Some(max) = json.get("mbs").and_then(|m| m.as_u64()) {
            self.max_binary_size = u32::try_from(max).ok();
        }
        if let Some(chunk) = json.get("cs").and_then(|c| c.as_u64()) {
            self.ota_chunk_size = u16::try_from(chunk).ok();
        }
        if let Some(fast) = json.get("fo").and_then(|f| f.as_bool()) {
            self.fast_ota = fast;
        }

        (manifest, modules)
    }
}

/// Mutable per-connection state behind one short-lived lock.
struct SessionState {
    send_counter: u16,
    receive_counter: u16,
    send_token: u8,
    tokens: HashMap<u8, MessageName>,
    owner: Option<u64>,
    attributes: Option<DeviceAttributes>,
    dispatch: Dispatch,
    last_heard: Instant,
    first_frame: Option<Vec<u8>>,
}

/// Per-connection protocol state machine.
pub struct DeviceSession {
    device_id: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    disconnects: AtomicU32,
    timings: SessionTimings,
}

impl DeviceSession {
    /// Wires a session onto the encrypted link a handshake produced and
    /// spawns its run loop. `first_frame` is the device's Hello,
    /// consumed by [`complete_initialization`](Self::complete_initialization).
    pub fn attach(
        device_id: String,
        link: SecureLink,
        first_frame: Vec<u8>,
        timings: SessionTimings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (status_tx, _) = watch::channel(SessionStatus::Initial);

        let session = Arc::new(Self {
            device_id,
            outbound: link.outbound,
            shutdown: link.shutdown,
            state: Mutex::new(SessionState {
                send_counter: 0,
                receive_counter: 0,
                send_token: 0,
                tokens: HashMap::new(),
                owner: None,
                attributes: None,
                dispatch: Dispatch::new(),
                last_heard: Instant::now(),
                first_frame: Some(first_frame),
            }),
            status_tx,
            events,
            disconnects: AtomicU32::new(0),
            timings,
        });

        tokio::spawn(run_loop(Arc::clone(&session), link.inbound));
        session
    }

    /// The device identifier this session serves.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current readiness status.
    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// When the device last proved liveness.
    pub fn last_heard(&self) -> Instant {
        self.lock_state().last_heard
    }

    /// Whether the session has not been torn down.
    pub fn is_connected(&self) -> bool {
        self.disconnects.load(Ordering::SeqCst) == 0
    }

    /// Subscribes to session notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn timings(&self) -> &SessionTimings {
        &self.timings
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Status gate
    // ------------------------------------------------------------------

    /// Resolves once the session status reaches `target`.
    ///
    /// Immediate when the status already passed the target; otherwise
    /// suspends until a transition reaches it. Each concurrent caller
    /// resolves exactly once.
    pub async fn await_status(&self, target: SessionStatus) -> Result<()> {
        let mut rx = self.status_tx.subscribe();
        loop {
            if *rx.borrow() >= target {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ProtocolError::ConnectionClosed(
                            "session dropped while waiting for status".to_string(),
                        ));
                    }
                }
                _ = self.shutdown.cancelled() => {
                    return Err(ProtocolError::ConnectionClosed(
                        "disconnected while waiting for status".to_string(),
                    ));
                }
            }
        }
    }

    /// Raises the status; transitions are monotonically non-decreasing.
    fn set_status(&self, status: SessionStatus) {
        self.status_tx.send_if_modified(|current| {
            if status > *current {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    // ------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------

    /// Claims exclusive send rights. Fails fast when already held.
    pub fn take_ownership(&self) -> Option<Owner> {
        let mut state = self.lock_state();
        if state.owner.is_some() {
            return None;
        }
        let id = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
        state.owner = Some(id);
        Some(Owner(id))
    }

    /// Releases the lock. A release by a non-owner is a logged no-op.
    pub fn release_ownership(&self, owner: Owner) {
        let mut state = self.lock_state();
        if state.owner == Some(owner.0) {
            state.owner = None;
        } else {
            warn!(device_id = %self.device_id, "ownership release by non-owner ignored");
        }
    }

    fn check_owner(&self, state: &SessionState, caller: Option<Owner>) -> Result<()> {
        match state.owner {
            None => Ok(()),
            Some(holder) if caller == Some(Owner(holder)) => Ok(()),
            Some(_) => Err(ProtocolError::OwnershipConflict),
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Sends a catalog message with the next sequence number.
    ///
    /// Confirmable messages allocate a correlation token; fire-and-forget
    /// kinds never do. The write is deferred onto the link's write pump,
    /// so the caller is never blocked on socket I/O. Returns the token.
    pub fn send_message(
        &self,
        name: MessageName,
        params: &[(&str, String)],
        payload: &[u8],
        owner: Option<Owner>,
    ) -> Result<Option<u8>> {
        let built = {
            let mut state = self.lock_state();
            self.check_owner(&state, owner).and_then(|_| {
                let message_id = state.send_counter;
                state.send_counter = state.send_counter.wrapping_add(1);
                let token = Self::allocate_token(&mut state, name)?;
                let bytes = catalog::wrap(name, message_id, params, &[], payload, token)
                    .ok_or_else(|| {
                        ProtocolError::MalformedPacket(format!("failed to encode {}", name))
                    })?;
                Ok((bytes, token))
            })
        };
        let (bytes, token) = self.fatal_on_token_collision(built)?;

        self.transmit(bytes)?;
        Ok(token)
    }

    /// Sends a reply reusing the sequence number of the request it
    /// answers.
    pub fn send_reply(
        &self,
        name: MessageName,
        message_id: u16,
        payload: &[u8],
        token: Option<u8>,
        owner: Option<Owner>,
    ) -> Result<()> {
        let bytes = {
            let state = self.lock_state();
            self.check_owner(&state, owner)?;
            catalog::wrap(name, message_id, &[], &[], payload, token).ok_or_else(|| {
                ProtocolError::MalformedPacket(format!("failed to encode {}", name))
            })?
        };
        self.transmit(bytes)
    }

    /// Sends a confirmable message and registers a waiter for its
    /// correlated response in the same critical section, so the response
    /// cannot slip past before the waiter exists.
    pub(crate) fn send_with_waiter(
        &self,
        name: MessageName,
        params: &[(&str, String)],
        payload: &[u8],
        owner: Option<Owner>,
    ) -> Result<(u8, oneshot::Receiver<Packet>)> {
        let built = {
            let mut state = self.lock_state();
            self.check_owner(&state, owner).and_then(|_| {
                let message_id = state.send_counter;
                state.send_counter = state.send_counter.wrapping_add(1);
                let token = Self::allocate_token(&mut state, name)?.ok_or_else(|| {
                    ProtocolError::MalformedPacket(format!("{} has no response to wait for", name))
                })?;
                let reply = catalog::spec(name).reply_name();
                let waiter = state.dispatch.once(reply, Some(token));

                match catalog::wrap(name, message_id, params, &[], payload, Some(token)) {
                    Some(bytes) => Ok((bytes, token, waiter)),
                    None => {
                        state.tokens.remove(&token);
                        state.dispatch.cancel(reply, Some(token));
                        Err(ProtocolError::MalformedPacket(format!(
                            "failed to encode {}",
                            name
                        )))
                    }
                }
            })
        };
        let (bytes, token, waiter) = self.fatal_on_token_collision(built)?;

        self.transmit(bytes)?;
        Ok((token, waiter))
    }

    /// A token collision is fatal to the session; the disconnect happens
    /// here, outside the state lock.
    fn fatal_on_token_collision<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ProtocolError::TokenInUse(_)) = &result {
            self.disconnect("token already in use");
        }
        result
    }

    /// Issues the next token, enforcing the in-flight uniqueness
    /// invariant. A collision is a fatal protocol error.
    fn allocate_token(state: &mut SessionState, name: MessageName) -> Result<Option<u8>> {
        let entry = catalog::spec(name);
        if entry.kind != MessageKind::Con {
            return Ok(None);
        }
        let token = state.send_token;
        state.send_token = state.send_token.wrapping_add(1);
        if state.tokens.contains_key(&token) {
            // 256 distinguishable in-flight requests is the protocol
            // ceiling; colliding here means the peer stopped answering.
            return Err(ProtocolError::TokenInUse(token));
        }
        state.tokens.insert(token, entry.reply_name());
        Ok(Some(token))
    }

    fn transmit(&self, bytes: Vec<u8>) -> Result<()> {
        self.outbound.send(bytes).map_err(|_| {
            ProtocolError::ConnectionClosed("write channel closed".to_string())
        })
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Decodes and routes one inbound frame. Malformed bytes are logged
    /// and dropped; only fatal protocol violations return an error.
    fn process_frame(&self, frame: &[u8]) -> Result<()> {
        match catalog::unwrap(frame) {
            Some(packet) => self.process_packet(packet),
            None => Ok(()),
        }
    }

    fn process_packet(&self, packet: Packet) -> Result<()> {
        if packet.is_ack() {
            // Acknowledgments are exempt from the sequence check. The
            // token table resolves them back to the exchange they close;
            // an unmatched ack dispatches under the generic ping-ack
            // label.
            let name = {
                let mut state = self.lock_state();
                state.last_heard = Instant::now();
                packet
                    .token
                    .and_then(|token| state.tokens.remove(&token))
                    .unwrap_or(MessageName::PingAck)
            };
            self.lock_state().dispatch.dispatch(name, packet.token, &packet);
            return Ok(());
        }

        let expected = self.lock_state().receive_counter;
        if packet.message_id != expected {
            // A stale Ignored must never be answered with another
            // Ignored; every mismatch ends the session.
            warn!(
                device_id = %self.device_id,
                expected,
                got = packet.message_id,
                reset = packet.is_reset(),
                "sequence mismatch"
            );
            self.disconnect("bad counter");
            return Err(ProtocolError::BadCounter {
                expected,
                got: packet.message_id,
            });
        }
        {
            let mut state = self.lock_state();
            state.receive_counter = expected.wrapping_add(1);
            state.last_heard = Instant::now();
        }

        if packet.is_empty_ping() {
            if let Err(e) =
                self.send_reply(MessageName::PingAck, packet.message_id, &[], packet.token, None)
            {
                warn!(device_id = %self.device_id, error = %e, "could not answer ping");
            }
            return Ok(());
        }

        let name = catalog::resolve_route(&packet).or_else(|| {
            let mut state = self.lock_state();
            packet.token.and_then(|token| state.tokens.remove(&token))
        });

        match name {
            Some(name) => {
                if name == MessageName::Hello {
                    self.set_status(SessionStatus::GotHello);
                }
                if name == MessageName::GetTime {
                    self.answer_get_time(&packet);
                }
                let delivered = self
                    .lock_state()
                    .dispatch
                    .dispatch(name, packet.token, &packet);
                if !delivered {
                    debug!(device_id = %self.device_id, message = %name, "no listener for packet");
                }
            }
            None => {
                debug!(
                    device_id = %self.device_id,
                    code = %packet.code,
                    "dropping unrouteable packet"
                );
            }
        }
        Ok(())
    }

    /// Devices without a clock ask for the time; answer with epoch
    /// seconds as a big-endian uint32.
    fn answer_get_time(&self, request: &Packet) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        if let Err(e) = self.send_reply(
            MessageName::GetTimeReturn,
            request.message_id,
            &now.to_be_bytes(),
            request.token,
            None,
        ) {
            warn!(device_id = %self.device_id, error = %e, "could not answer time request");
        }
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Consumes the device's Hello, answers with the listener's Hello,
    /// fetches the device description and drives the status to `Ready`.
    pub async fn complete_initialization(&self) -> Result<DeviceAttributes> {
        let first = self
            .lock_state()
            .first_frame
            .take()
            .ok_or_else(|| ProtocolError::Handshake("already initialized".to_string()))?;

        let hello = catalog::unwrap(&first).ok_or_else(|| {
            ProtocolError::MalformedPacket("first frame did not decode".to_string())
        })?;
        if catalog::resolve_route(&hello) != Some(MessageName::Hello) {
            self.disconnect("first frame was not a hello");
            return Err(ProtocolError::Handshake(
                "first frame was not a hello".to_string(),
            ));
        }

        // The device's Hello seeds the receive sequence.
        self.lock_state().receive_counter = hello.message_id;
        self.process_packet(hello)?;

        self.send_message(MessageName::Hello, &[], &[], None)?;

        let attributes = self.describe().await?;
        self.lock_state().attributes = Some(attributes.clone());
        self.set_status(SessionStatus::GotDescription);

        self.set_status(SessionStatus::Ready);
        self.emit(SessionEvent::Ready);
        info!(device_id = %self.device_id, "session ready");
        Ok(attributes)
    }

    /// Fetches the device description.
    ///
    /// Firmware may deliver the module/system information and the
    /// function/variable manifest as separate frames, in either order;
    /// both halves are accumulated under a single timeout and the fetch
    /// resolves only once both are present.
    async fn describe(&self) -> Result<DeviceAttributes> {
        let mut fragments = self
            .lock_state()
            .dispatch
            .subscribe(MessageName::DescribeReturn, None);
        self.send_message(MessageName::Describe, &[], &[], None)?;

        let deadline = Instant::now() + self.timings.response_timeout;
        let mut attributes = DeviceAttributes::default();
        let (mut have_manifest, mut have_modules) = (false, false);

        while !(have_manifest && have_modules) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout("device description".to_string()));
            }
            let packet = tokio::select! {
                fragment = fragments.recv() => fragment.ok_or_else(|| {
                    ProtocolError::ConnectionClosed("during description".to_string())
                })?,
                _ = self.shutdown.cancelled() => {
                    return Err(ProtocolError::ConnectionClosed(
                        "during description".to_string(),
                    ));
                }
                _ = tokio::time::sleep(remaining) => {
                    return Err(ProtocolError::Timeout("device description".to_string()));
                }
            };

            let json: serde_json::Value = serde_json::from_slice(&packet.payload)?;
            let (manifest, modules) = attributes.absorb(&json);
            have_manifest |= manifest;
            have_modules |= modules;
        }

        self.lock_state()
            .dispatch
            .cancel(MessageName::DescribeReturn, None);
        Ok(attributes)
    }

    /// The attributes captured during initialization.
    pub fn attributes(&self) -> Option<DeviceAttributes> {
        self.lock_state().attributes.clone()
    }

    // ------------------------------------------------------------------
    // RPC helpers
    // ------------------------------------------------------------------

    /// Invokes a declared device function and returns its result.
    pub async fn call_function(&self, function: &str, argument: Option<Value>) -> Result<Value> {
        self.await_status(SessionStatus::Ready).await?;
        let declared = self
            .attributes()
            .map(|a| a.functions.iter().any(|f| f == function))
            .unwrap_or(false);
        if !declared {
            return Err(ProtocolError::UnknownCapability {
                kind: "function",
                name: function.to_string(),
            });
        }

        let payload = argument.map(|v| v.encode()).unwrap_or_default();
        let (token, waiter) = self.send_with_waiter(
            MessageName::FunctionCall,
            &[("name", function.to_string())],
            &payload,
            None,
        )?;
        let packet = self
            .bounded_wait(waiter, MessageName::FunctionReturn, token, "function call")
            .await?;

        if packet.code.class != 2 {
            return Err(ProtocolError::DeviceError {
                what: "function call",
                code: packet.code.to_string(),
            });
        }
        Value::decode(&packet.payload, ValueType::Int32)
    }

    /// Reads a declared device variable, decoded as its declared type.
    pub async fn get_variable_value(&self, variable: &str) -> Result<Value> {
        self.await_status(SessionStatus::Ready).await?;
        let declared_type = self
            .attributes()
            .and_then(|a| a.variables.get(variable).cloned());
        let Some(declared_type) = declared_type else {
            return Err(ProtocolError::UnknownCapability {
                kind: "variable",
                name: variable.to_string(),
            });
        };

        let (token, waiter) = self.send_with_waiter(
            MessageName::VariableRequest,
            &[("name", variable.to_string())],
            &[],
            None,
        )?;
        let packet = self
            .bounded_wait(waiter, MessageName::VariableValue, token, "variable read")
            .await?;

        if packet.code.class != 2 {
            return Err(ProtocolError::DeviceError {
                what: "variable read",
                code: packet.code.to_string(),
            });
        }
        let value_type = ValueType::from_name(&declared_type).unwrap_or(ValueType::Buffer);
        Value::decode(&packet.payload, value_type)
    }

    /// Asks the device to visually identify itself (signal / rainbow).
    pub async fn raise_your_hand(&self, on: bool) -> Result<()> {
        self.await_status(SessionStatus::Ready).await?;

        let (token, waiter) = self.send_with_waiter(
            MessageName::SignalStart,
            &[],
            &[u8::from(on)],
            None,
        )?;
        let packet = self
            .bounded_wait(waiter, MessageName::SignalStartReturn, token, "signal")
            .await?;

        if packet.code.class != 2 {
            return Err(ProtocolError::DeviceError {
                what: "signal",
                code: packet.code.to_string(),
            });
        }
        Ok(())
    }

    /// Round-trips a keepalive probe.
    pub async fn ping(&self) -> Result<()> {
        let (token, waiter) = self.send_with_waiter(MessageName::Ping, &[], &[], None)?;
        self.bounded_wait(waiter, MessageName::PingAck, token, "ping")
            .await?;
        Ok(())
    }

    /// Observes every future packet of one message kind. Used by flows
    /// that watch unsolicited traffic (missed-chunk reports, aborts).
    pub(crate) fn register_stream(&self, name: MessageName) -> mpsc::UnboundedReceiver<Packet> {
        self.lock_state().dispatch.subscribe(name, None)
    }

    /// Drops every observer of one message kind.
    pub(crate) fn cancel_stream(&self, name: MessageName) {
        self.lock_state().dispatch.cancel(name, None);
    }

    /// Abandons a correlated wait: the waiter and its token are released
    /// so the token can be reissued.
    pub(crate) fn abandon_wait(&self, reply: MessageName, token: u8) {
        let mut state = self.lock_state();
        state.dispatch.cancel(reply, Some(token));
        state.tokens.remove(&token);
    }

    /// Sends a confirmable catalog message without allocating a token.
    ///
    /// Fast OTA streams chunks back-to-back with no per-chunk
    /// acknowledgment; correlating them would exhaust the 256-token
    /// space on any firmware larger than 64 KiB.
    pub(crate) fn send_streamed(
        &self,
        name: MessageName,
        params: &[(&str, String)],
        payload: &[u8],
        owner: Option<Owner>,
    ) -> Result<()> {
        let bytes = {
            let mut state = self.lock_state();
            self.check_owner(&state, owner)?;
            let message_id = state.send_counter;
            state.send_counter = state.send_counter.wrapping_add(1);
            catalog::wrap(name, message_id, params, &[], payload, None).ok_or_else(|| {
                ProtocolError::MalformedPacket(format!("failed to encode {}", name))
            })?
        };
        self.transmit(bytes)
    }

    /// Races a correlated response against disconnect and the response
    /// deadline; the losing waits are torn down.
    pub(crate) async fn bounded_wait(
        &self,
        waiter: oneshot::Receiver<Packet>,
        reply: MessageName,
        token: u8,
        what: &'static str,
    ) -> Result<Packet> {
        let result = tokio::select! {
            response = waiter => response.map_err(|_| {
                ProtocolError::ConnectionClosed(what.to_string())
            }),
            _ = self.shutdown.cancelled() => {
                Err(ProtocolError::ConnectionClosed(what.to_string()))
            }
            _ = tokio::time::sleep(self.timings.response_timeout) => {
                Err(ProtocolError::Timeout(what.to_string()))
            }
        };
        if result.is_err() {
            let mut state = self.lock_state();
            state.dispatch.cancel(reply, Some(token));
            state.tokens.remove(&token);
        }
        result
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tears the session down. Idempotent: only the first call acts.
    ///
    /// Cancels the stream pumps, rejects every outstanding correlated
    /// wait and emits the disconnect notification.
    pub fn disconnect(&self, reason: &str) {
        if self.disconnects.fetch_add(1, Ordering::SeqCst) != 0 {
            return;
        }
        info!(device_id = %self.device_id, reason, "session disconnected");
        self.shutdown.cancel();
        {
            let mut state = self.lock_state();
            state.dispatch.fail_all();
            state.tokens.clear();
        }
        let _ = self.events.send(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

/// Drives inbound frames into the session until teardown.
async fn run_loop(session: Arc<DeviceSession>, mut inbound: mpsc::Receiver<Vec<u8>>) {
    loop {
        tokio::select! {
            _ = session.shutdown.cancelled() => {
                session.disconnect("link closed");
                break;
            }
            frame = inbound.recv() => {
                match frame {
                    Some(frame) => {
                        if session.process_frame(&frame).is_err() {
                            break;
                        }
                    }
                    None => {
                        session.disconnect("stream ended");
                        break;
                    }
                }
            }
        }
    }
}
