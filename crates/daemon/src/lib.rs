//! # Emberlink Daemon Library
//!
//! This crate provides the device-facing half of the Emberlink
//! cloud-to-device messaging system.
//!
//! ## Overview
//!
//! The daemon is the service devices dial into over raw TCP. It
//! provides:
//!
//! - **Handshake**: RSA-bootstrapped key exchange deriving a symmetric
//!   session per connection
//! - **Device Sessions**: per-connection protocol state machines with
//!   strict ordering and request/response correlation
//! - **RPC**: function calls, variable reads, device signaling and
//!   keepalive over the session
//! - **Firmware Updates**: resumable chunked OTA transfer with
//!   missed-chunk recovery
//! - **Key Store**: file-backed server and device key material
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Device Server                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌──────────────┐   ┌──────────────┐   ┌────────────────┐  │
//! │  │  Handshake   │──▶│    Device    │◀──│   Firmware     │  │
//! │  │   Engine     │   │   Session    │   │   Flasher      │  │
//! │  └──────────────┘   └──────────────┘   └────────────────┘  │
//! │         │                                                   │
//! │  ┌──────────────┐                                           │
//! │  │  Key Store   │                                           │
//! │  └──────────────┘                                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`keys`]: Server and device key storage
//! - [`handshake`]: The RSA-bootstrapped key exchange
//! - [`session`]: Device session state machines
//! - [`ota`]: Firmware update transfers
//! - [`server`]: TCP accept loop and session registry

pub mod config;
pub mod handshake;
pub mod keys;
pub mod ota;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export handshake types for convenience
pub use handshake::{HandshakeConfig, HandshakeEngine, HandshakeOutcome, SecureLink};

// Re-export key store for convenience
pub use keys::KeyStore;

// Re-export session types for convenience
pub use session::{
    DeviceAttributes, DeviceSession, Owner, SessionEvent, SessionStatus, SessionTimings,
};

// Re-export OTA types for convenience
pub use ota::{FirmwareFlasher, FlashOptions, DEFAULT_CHUNK_SIZE};

// Re-export server for convenience
pub use server::DeviceServer;
