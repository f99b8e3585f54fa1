//! # Emberlink Protocol Library
//!
//! This crate provides the wire-level pieces of the Emberlink
//! cloud-to-device messaging protocol.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of the device-facing service,
//! providing:
//!
//! - **Message Catalog**: every protocol message with its code, kind,
//!   URI template and response pairing
//! - **Packet Codec**: binary encode/decode of CoAP-style packets
//! - **Value Codec**: the typed payload mapping for RPC values
//! - **Frame Codec**: 2-byte length-prefixed framing over a byte stream
//! - **Session Crypto**: session key material, the chained AES-CBC
//!   stream transforms, device key parsing and RSA/HMAC helpers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Catalog wrap / unwrap            │  named messages
//! ├─────────────────────────────────────────┤
//! │         CoAP-style packets              │  token, id, options
//! ├─────────────────────────────────────────┤
//! │             Framing                     │  2-byte length prefix
//! ├─────────────────────────────────────────┤
//! │        AES-128-CBC transform            │  chained per-chunk IV
//! ├─────────────────────────────────────────┤
//! │             TCP socket                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`catalog`]: message table, wrap/unwrap, route keys
//! - [`packet`]: binary packet format
//! - [`values`]: typed value codec
//! - [`framing`]: length-prefixed frame accumulator
//! - [`crypto`]: session material and key handling
//! - [`error`]: error types

pub mod catalog;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod packet;
pub mod values;

pub use catalog::{resolve_route, spec, unwrap, wrap, MessageKind, MessageName, MessageSpec, CATALOG};
pub use crypto::{
    hmac_sha1, rsa_decrypt, rsa_encrypt, rsa_sign_raw, rsa_verify_raw, CipherState, DecipherState,
    DeviceKey, SessionMaterial, BLOCK_LEN, HMAC_LEN, SESSION_MATERIAL_LEN,
};
pub use error::{ProtocolError, Result};
pub use framing::{encode_frame, FrameAccumulator, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use packet::{Code, OptionName, Packet, PacketKind, PACKET_VERSION};
pub use values::{Value, ValueType};
