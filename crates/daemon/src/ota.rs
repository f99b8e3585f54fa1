//! Firmware update transfer over a device session.
//!
//! The flasher is a transient, exclusive borrower of a [`DeviceSession`]:
//! it negotiates the transfer with `UpdateBegin`, streams CRC-tagged
//! chunks (all at once in fast mode, lock-step in non-fast mode), runs
//! detect-then-resend recovery rounds over device-reported missed
//! chunks, and finalizes with `UpdateDone`. Ownership release and source
//! closure always happen before any failure is surfaced, and every wait
//! races the session's disconnect signal so nothing fires after
//! teardown.

use std::collections::BTreeSet;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::catalog::MessageName;
use protocol::{ProtocolError, Result};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::session::{DeviceSession, Owner, SessionEvent};

/// Default transfer chunk width; the final chunk is zero-padded to it.
pub const DEFAULT_CHUNK_SIZE: u16 = 256;

/// Ceiling on outstanding missed chunks before the transfer aborts.
const MAX_MISSED_CHUNKS: usize = 512;

/// Transfer knobs. The defaults are the production protocol values;
/// tests shrink the waits.
#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// Chunk width in bytes.
    pub chunk_size: u16,
    /// Offer fast (no per-chunk acknowledgment) transfer.
    pub fast_ota: bool,
    /// Accepted image ceiling when the device declares none.
    pub max_binary_size: u32,
    /// Escalating waits for `UpdateReady`; one attempt per entry.
    pub ready_retry_delays: Vec<Duration>,
    /// Ceiling on one missed-report collection pass.
    pub missed_wait_cap: Duration,
    /// Poll interval while collecting missed reports.
    pub missed_poll_interval: Duration,
    /// Settle window: stop collecting once reports go quiet this long.
    pub missed_settle: Duration,
    /// Detect-then-resend rounds before finalizing regardless.
    pub recovery_rounds: usize,
    /// Ceiling on the whole update.
    pub update_timeout: Duration,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fast_ota: true,
            max_binary_size: 128 * 1024,
            ready_retry_delays: vec![
                Duration::from_secs(6),
                Duration::from_secs(90),
                Duration::from_secs(90),
            ],
            missed_wait_cap: Duration::from_secs(5),
            missed_poll_interval: Duration::from_millis(250),
            missed_settle: Duration::from_secs(1),
            recovery_rounds: 3,
            update_timeout: Duration::from_secs(300),
        }
    }
}

/// Reason codes a device reports with `UpdateAbort`.
fn abort_reason(code: u8) -> String {
    match code {
        0 => "invalid size".to_string(),
        1 => "checksum mismatch".to_string(),
        2 => "not enough space".to_string(),
        3 => "flash write failure".to_string(),
        other => format!("unknown abort code {}", other),
    }
}

/// Seekable view over the firmware image, chunked and zero-padded.
struct ChunkSource {
    cursor: Cursor<Vec<u8>>,
    chunk_size: usize,
    closed: bool,
}

impl ChunkSource {
    fn new(firmware: Vec<u8>, chunk_size: u16) -> Self {
        Self {
            cursor: Cursor::new(firmware),
            chunk_size: usize::from(chunk_size),
            closed: false,
        }
    }

    fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    fn chunk_size(&self) -> u16 {
        self.chunk_size as u16
    }

    fn chunk_count(&self) -> usize {
        self.len().div_ceil(self.chunk_size)
    }

    /// Seeks to the chunk offset and reads one zero-padded chunk.
    fn chunk(&mut self, index: usize) -> Result<Vec<u8>> {
        if self.closed || index >= self.chunk_count() {
            return Err(ProtocolError::TransferFailed(format!(
                "chunk {} out of range",
                index
            )));
        }
        let offset = index * self.chunk_size;
        self.cursor.seek(SeekFrom::Start(offset as u64))?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.cursor.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        // The trailing bytes of the final chunk stay zero.
        Ok(buf)
    }

    fn close(&mut self) {
        self.closed = true;
        self.cursor.get_mut().clear();
    }
}

/// Shared record of device-reported missed chunk indices.
type MissedSet = Arc<Mutex<BTreeSet<u16>>>;

/// One firmware transfer over an exclusively-owned session.
pub struct FirmwareFlasher {
    session: Arc<DeviceSession>,
    options: FlashOptions,
}

impl FirmwareFlasher {
    /// Creates a flasher for one update attempt.
    pub fn new(session: Arc<DeviceSession>, options: FlashOptions) -> Self {
        Self { session, options }
    }

    /// Runs the whole update.
    ///
    /// Acquires exclusive session ownership for the duration; ownership
    /// release and source closure always precede the surfaced result,
    /// which collapses every internal failure into a single update
    /// error.
    pub async fn flash(
        &self,
        firmware: Vec<u8>,
        destination_store: u8,
        destination_address: u32,
    ) -> Result<()> {
        let max_size = self
            .session
            .attributes()
            .and_then(|a| a.max_binary_size)
            .unwrap_or(self.options.max_binary_size);
        if firmware.is_empty() {
            return Err(ProtocolError::TransferFailed(
                "firmware image is empty".to_string(),
            ));
        }
        if firmware.len() > max_size as usize {
            return Err(ProtocolError::TransferFailed(format!(
                "firmware image of {} bytes exceeds device maximum of {}",
                firmware.len(),
                max_size
            )));
        }

        let Some(owner) = self.session.take_ownership() else {
            return Err(ProtocolError::OwnershipConflict);
        };
        self.session.emit(SessionEvent::FlashStarted);
        info!(
            device_id = %self.session.device_id(),
            size = firmware.len(),
            "firmware update started"
        );

        // A device-declared chunk size wins over the configured default.
        let chunk_size = self
            .session
            .attributes()
            .and_then(|a| a.ota_chunk_size)
            .unwrap_or(self.options.chunk_size);
        let mut source = ChunkSource::new(firmware, chunk_size);
        let outcome = timeout(
            self.options.update_timeout,
            self.run(&mut source, owner, destination_store, destination_address),
        )
        .await
        .unwrap_or_else(|_| Err(ProtocolError::Timeout("firmware update".to_string())));

        // Cleanup happens whatever the outcome; only then is the result
        // surfaced.
        source.close();
        self.session.cancel_stream(MessageName::ChunkMissed);
        self.session.cancel_stream(MessageName::UpdateAbort);
        self.session.release_ownership(owner);

        match outcome {
            Ok(()) => {
                info!(device_id = %self.session.device_id(), "firmware update complete");
                self.session.emit(SessionEvent::FlashSucceeded);
                Ok(())
            }
            Err(e) => {
                warn!(device_id = %self.session.device_id(), error = %e, "firmware update failed");
                self.session.emit(SessionEvent::FlashFailed {
                    reason: e.to_string(),
                });
                Err(ProtocolError::TransferFailed("update failed".to_string()))
            }
        }
    }

    async fn run(
        &self,
        source: &mut ChunkSource,
        owner: Owner,
        destination_store: u8,
        destination_address: u32,
    ) -> Result<()> {
        // Watch unsolicited reports before any chunk can flow.
        let missed: MissedSet = Arc::new(Mutex::new(BTreeSet::new()));
        let collector = self.spawn_missed_collector(Arc::clone(&missed), owner);

        let protocol_version = self
            .negotiate(source, owner, destination_store, destination_address)
            .await?;
        let fast_mode = self.options.fast_ota && protocol_version > 0;
        debug!(protocol_version, fast_mode, "update negotiated");

        // Main pass.
        for index in 0..source.chunk_count() {
            self.send_chunk(source, index, fast_mode, owner).await?;
        }

        // Loss recovery applies to fast mode only; lock-step mode has
        // already confirmed every chunk.
        if fast_mode {
            for round in 0..self.options.recovery_rounds {
                self.collect_missed_reports(&missed).await?;
                let resend: Vec<u16> = {
                    let mut set = lock_missed(&missed);
                    let drained: Vec<u16> = set.iter().copied().collect();
                    set.clear();
                    drained
                };
                if resend.is_empty() {
                    break;
                }
                info!(round, missed = resend.len(), "resending missed chunks");
                for index in resend {
                    self.send_chunk(source, usize::from(index), fast_mode, owner)
                        .await?;
                }
            }
        }

        collector.abort();

        // Finalize; a send failure here is fatal.
        self.session
            .send_message(MessageName::UpdateDone, &[], &[], Some(owner))?;
        Ok(())
    }

    /// Sends `UpdateBegin` and races ready, abort and the retry timer.
    async fn negotiate(
        &self,
        source: &ChunkSource,
        owner: Owner,
        destination_store: u8,
        destination_address: u32,
    ) -> Result<u8> {
        let mut payload = Vec::with_capacity(12);
        payload.push(u8::from(self.options.fast_ota));
        payload.extend_from_slice(&source.chunk_size().to_be_bytes());
        payload.extend_from_slice(&(source.len() as u32).to_be_bytes());
        payload.push(destination_store);
        payload.extend_from_slice(&destination_address.to_be_bytes());

        let mut aborts = self.session.register_stream(MessageName::UpdateAbort);
        let shutdown = self.session.shutdown_token();

        for (attempt, delay) in self.options.ready_retry_delays.iter().enumerate() {
            let (token, ready) = self.session.send_with_waiter(
                MessageName::UpdateBegin,
                &[],
                &payload,
                Some(owner),
            )?;

            tokio::select! {
                response = ready => {
                    let packet = response.map_err(|_| {
                        ProtocolError::ConnectionClosed("awaiting update ready".to_string())
                    })?;
                    if packet.code.class != 2 {
                        let code = packet.payload.first().copied().unwrap_or(0);
                        return Err(ProtocolError::TransferFailed(format!(
                            "device aborted update: {}",
                            abort_reason(code)
                        )));
                    }
                    // The negotiated protocol version rides in the ready
                    // payload; absent means the original lock-step protocol.
                    return Ok(packet.payload.first().copied().unwrap_or(0));
                }
                report = aborts.recv() => {
                    self.session.abandon_wait(MessageName::UpdateReady, token);
                    let packet = report.ok_or_else(|| {
                        ProtocolError::ConnectionClosed("awaiting update ready".to_string())
                    })?;
                    let code = packet.payload.first().copied().unwrap_or(0);
                    return Err(ProtocolError::TransferFailed(format!(
                        "device aborted update: {}",
                        abort_reason(code)
                    )));
                }
                _ = shutdown.cancelled() => {
                    return Err(ProtocolError::ConnectionClosed(
                        "awaiting update ready".to_string(),
                    ));
                }
                _ = sleep(*delay) => {
                    self.session.abandon_wait(MessageName::UpdateReady, token);
                    debug!(attempt, "update ready timed out, retrying");
                }
            }
        }

        Err(ProtocolError::Timeout(
            "device never reported update ready".to_string(),
        ))
    }

    /// Sends one CRC-tagged chunk with the mode's send discipline.
    async fn send_chunk(
        &self,
        source: &mut ChunkSource,
        index: usize,
        fast_mode: bool,
        owner: Owner,
    ) -> Result<()> {
        let data = source.chunk(index)?;
        let crc = crc32fast::hash(&data);
        let params = vec![
            ("crc", format!("{:08x}", crc)),
            ("idx", index.to_string()),
        ];

        if fast_mode {
            // Back-to-back, no per-chunk acknowledgment; losses surface
            // through missed-chunk reports.
            self.session
                .send_streamed(MessageName::Chunk, &params, &data, Some(owner))?;
            return Ok(());
        }

        let (token, waiter) =
            self.session
                .send_with_waiter(MessageName::Chunk, &params, &data, Some(owner))?;
        let packet = self
            .session
            .bounded_wait(waiter, MessageName::ChunkReceived, token, "chunk ack")
            .await?;
        if packet.code.class != 2 {
            return Err(ProtocolError::TransferFailed(format!(
                "device rejected chunk {} with code {}",
                index, packet.code
            )));
        }
        Ok(())
    }

    /// Acknowledges and records missed-chunk reports as they arrive.
    fn spawn_missed_collector(&self, missed: MissedSet, owner: Owner) -> tokio::task::JoinHandle<()> {
        let mut reports = self.session.register_stream(MessageName::ChunkMissed);
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            while let Some(packet) = reports.recv().await {
                {
                    let mut set = lock_missed(&missed);
                    for pair in packet.payload.chunks_exact(2) {
                        set.insert(u16::from_be_bytes([pair[0], pair[1]]));
                    }
                    debug!(total = set.len(), "missed chunks reported");
                }
                if let Err(e) = session.send_reply(
                    MessageName::ChunkMissedAck,
                    packet.message_id,
                    &[],
                    packet.token,
                    Some(owner),
                ) {
                    warn!(error = %e, "could not acknowledge missed-chunk report");
                }
            }
        })
    }

    /// One collection pass: capped wait, fixed poll interval, and a
    /// short settle window once reports go quiet.
    async fn collect_missed_reports(&self, missed: &MissedSet) -> Result<()> {
        let started = Instant::now();
        let shutdown = self.session.shutdown_token();
        let mut last_len = lock_missed(missed).len();
        let mut quiet_since = Instant::now();

        loop {
            tokio::select! {
                _ = sleep(self.options.missed_poll_interval) => {}
                _ = shutdown.cancelled() => {
                    return Err(ProtocolError::ConnectionClosed(
                        "collecting missed chunks".to_string(),
                    ));
                }
            }

            let len = lock_missed(missed).len();
            if len > MAX_MISSED_CHUNKS {
                return Err(ProtocolError::TransferFailed(format!(
                    "{} missed chunks exceeds ceiling of {}",
                    len, MAX_MISSED_CHUNKS
                )));
            }
            if len != last_len {
                last_len = len;
                quiet_since = Instant::now();
            }
            if started.elapsed() >= self.options.missed_wait_cap {
                return Ok(());
            }
            if len > 0 && quiet_since.elapsed() >= self.options.missed_settle {
                return Ok(());
            }
        }
    }
}

fn lock_missed(missed: &MissedSet) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
    missed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decodes a chunk CRC from its query argument, used by tests and
/// device-side tooling.
pub fn parse_chunk_crc(arg: &str) -> Option<u32> {
    u32::from_str_radix(arg, 16).ok()
}

/// Encodes missed chunk indices the way devices report them.
pub fn encode_missed_report(indices: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(indices.len() * 2);
    for index in indices {
        out.extend_from_slice(&index.to_be_bytes());
    }
    out
}
