//! RSA-bootstrapped key exchange with a connecting device.
//!
//! The exchange runs in five steps over the raw socket:
//!
//! 1. send a 40-byte random nonce in plaintext
//! 2. read one RSA-encrypted blob and decrypt it with the server key
//! 3. verify the echoed nonce and extract the device id and (optionally)
//!    the device-presented public key
//! 4. resolve the device key: stored key first, else persist the
//!    presented one, else fail
//! 5. send the RSA-encrypted session material plus an RSA-signed
//!    HMAC-SHA1 of that ciphertext
//!
//! A successful exchange wires the socket through the frame accumulator
//! and the chained AES-CBC transforms in both directions and resolves
//! with the device id, the encrypted duplex link and the first decrypted
//! application frame. Any failure rejects the whole operation and the
//! caller tears the connection down.

use std::sync::Arc;
use std::time::Duration;

use protocol::crypto::{hmac_sha1, rsa_decrypt, rsa_encrypt, rsa_sign_raw, DeviceKey};
use protocol::framing::{encode_frame, FrameAccumulator};
use protocol::{ProtocolError, Result, SessionMaterial};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::keys::KeyStore;

/// Length of the plaintext nonce opening the exchange.
pub const NONCE_LEN: usize = 40;

/// Length of the device identifier inside the decrypted response.
pub const DEVICE_ID_LEN: usize = 12;

/// Timing bounds for one handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Ceiling on the whole exchange.
    pub handshake_timeout: Duration,
    /// Ceiling on each socket read.
    pub read_timeout: Duration,
    /// Ceiling on the wait for the first decrypted application frame.
    pub first_frame_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            first_frame_timeout: Duration::from_secs(30),
        }
    }
}

/// The encrypted duplex link produced by a successful handshake.
///
/// `outbound` carries plaintext frames to be length-prefixed, encrypted
/// and written to the socket; `inbound` yields decrypted frames as they
/// are reassembled. Cancelling `shutdown` stops both pumps.
pub struct SecureLink {
    /// Plaintext frames to transmit. Unbounded: senders are deferred
    /// onto the write pump, never blocked on socket I/O.
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Decrypted frames received.
    pub inbound: mpsc::Receiver<Vec<u8>>,
    /// Cancels both stream pumps.
    pub shutdown: CancellationToken,
}

/// Result of a completed handshake.
pub struct HandshakeOutcome {
    /// Lowercase hex device identifier.
    pub device_id: String,
    /// Encrypted duplex streams.
    pub link: SecureLink,
    /// The first application frame the device sent (its Hello).
    pub first_frame: Vec<u8>,
}

/// Per-listener handshake driver.
pub struct HandshakeEngine {
    server_key: Arc<RsaPrivateKey>,
    store: Arc<KeyStore>,
    config: HandshakeConfig,
}

impl HandshakeEngine {
    /// Creates an engine around the server private key and key store.
    pub fn new(server_key: Arc<RsaPrivateKey>, store: Arc<KeyStore>, config: HandshakeConfig) -> Self {
        Self {
            server_key,
            store,
            config,
        }
    }

    /// Runs the full exchange on a fresh connection.
    pub async fn run<S>(&self, stream: S) -> Result<HandshakeOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut stream = stream;

        let (device_id, material) = timeout(
            self.config.handshake_timeout,
            self.exchange(&mut stream),
        )
        .await
        .map_err(|_| ProtocolError::Timeout("handshake".to_string()))??;

        let mut link = spawn_pumps(stream, &material);

        // Early application data is queued in the inbound channel, not
        // dropped; recv() here observes the first frame whenever it
        // arrived.
        let first_frame = timeout(self.config.first_frame_timeout, link.inbound.recv())
            .await
            .map_err(|_| {
                link.shutdown.cancel();
                ProtocolError::Timeout("first application frame".to_string())
            })?
            .ok_or_else(|| {
                ProtocolError::ConnectionClosed("before first application frame".to_string())
            })?;

        info!(device_id, "handshake complete");
        Ok(HandshakeOutcome {
            device_id,
            link,
            first_frame,
        })
    }

    /// Steps 1-5: nonce, device response, key resolution, session key.
    async fn exchange<S>(&self, stream: &mut S) -> Result<(String, SessionMaterial)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Step 1: plaintext nonce.
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        stream.write_all(&nonce).await?;

        // Step 2: one RSA-encrypted blob, sized by the server modulus.
        let mut blob = vec![0u8; self.server_key.size()];
        timeout(self.config.read_timeout, stream.read_exact(&mut blob))
            .await
            .map_err(|_| ProtocolError::Timeout("device handshake response".to_string()))??;

        let plaintext = rsa_decrypt(&self.server_key, &blob)
            .map_err(|e| ProtocolError::Handshake(format!("device response: {}", e)))?;
        if plaintext.len() < NONCE_LEN + DEVICE_ID_LEN {
            return Err(ProtocolError::Handshake(format!(
                "device response undersized: {} bytes",
                plaintext.len()
            )));
        }

        // Step 3: nonce echo and identity.
        if plaintext[..NONCE_LEN] != nonce {
            return Err(ProtocolError::NonceMismatch);
        }
        let device_id = hex::encode(&plaintext[NONCE_LEN..NONCE_LEN + DEVICE_ID_LEN]);
        let presented = &plaintext[NONCE_LEN + DEVICE_ID_LEN..];

        // Step 4: stored key wins; a newly presented key is persisted.
        let device_key = match self.store.get_device_key(&device_id)? {
            Some(key) => key,
            None if !presented.is_empty() => {
                let key = DeviceKey::parse(presented)?;
                self.store.store_device_key(&device_id, &key)?;
                key
            }
            None => {
                warn!(device_id, "no public key found for device");
                return Err(ProtocolError::NoDeviceKey);
            }
        };
        let device_rsa = device_key.require_rsa()?;

        // Step 5: session material, encrypted and signed.
        let material = SessionMaterial::generate();
        let secret = material.to_bytes();
        let ciphertext = rsa_encrypt(device_rsa, &secret)?;
        let digest = hmac_sha1(&ciphertext, &secret);
        let signature = rsa_sign_raw(&self.server_key, &digest)?;

        let mut response = ciphertext;
        response.extend_from_slice(&signature);
        stream.write_all(&response).await?;

        debug!(device_id, "session material delivered");
        Ok((device_id, material))
    }
}

/// Wires the socket through the frame and cipher transforms in both
/// directions.
fn spawn_pumps<S>(stream: S, material: &SessionMaterial) -> SecureLink
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let shutdown = CancellationToken::new();

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::spawn(write_pump(
        write_half,
        out_rx,
        material.cipher(),
        shutdown.clone(),
    ));
    tokio::spawn(read_pump(
        read_half,
        in_tx,
        material.decipher(),
        shutdown.clone(),
    ));

    SecureLink {
        outbound: out_tx,
        inbound: in_rx,
        shutdown,
    }
}

async fn write_pump<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    mut cipher: protocol::CipherState,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = frames.recv() => {
                let Some(frame) = next else { break };
                let framed = match encode_frame(&frame) {
                    Ok(framed) => framed,
                    Err(e) => {
                        warn!(error = %e, "dropping oversized outbound frame");
                        continue;
                    }
                };
                let ciphertext = match cipher.encrypt(&framed) {
                    Ok(ciphertext) => ciphertext,
                    Err(e) => {
                        warn!(error = %e, "outbound encryption failed");
                        shutdown.cancel();
                        break;
                    }
                };
                if let Err(e) = writer.write_all(&ciphertext).await {
                    debug!(error = %e, "socket write failed");
                    shutdown.cancel();
                    break;
                }
            }
        }
    }
}

async fn read_pump<R>(
    mut reader: R,
    frames: mpsc::Sender<Vec<u8>>,
    mut decipher: protocol::DecipherState,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut accumulator = FrameAccumulator::new();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        debug!("peer closed connection");
                        shutdown.cancel();
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "socket read failed");
                        shutdown.cancel();
                        break;
                    }
                };
                // Decryption units mirror the peer's write units; a read
                // that splits one is a protocol violation of the chained
                // CBC scheme and ends the session.
                let plain = match decipher.decrypt(&buf[..n]) {
                    Ok(plain) => plain,
                    Err(e) => {
                        warn!(error = %e, "inbound decryption failed");
                        shutdown.cancel();
                        break;
                    }
                };
                for frame in accumulator.push(&plain) {
                    if frames.send(frame).await.is_err() {
                        shutdown.cancel();
                        break;
                    }
                }
            }
        }
    }
}
