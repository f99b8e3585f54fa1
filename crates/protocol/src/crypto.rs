//! Session key material and the symmetric stream transforms.
//!
//! A handshake derives 40 bytes of [`SessionMaterial`] (AES key, IV,
//! salt). All post-handshake traffic runs through [`CipherState`] /
//! [`DecipherState`]: each transform call is one complete AES-128-CBC
//! operation seeded with a running IV, which is then advanced from the
//! trailing cipher block so successive calls chain like block-cipher
//! feedback even though every call is logically independent.
//!
//! Device public keys come in two shapes ([`DeviceKey`]): RSA (the TCP
//! transport described here) and a 32-byte elliptic-curve key used by
//! other transports. Parsing tries RSA first and falls back to EC.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::error::{ProtocolError, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// AES block width; also the width of the running IV.
pub const BLOCK_LEN: usize = 16;

/// Total size of the session material blob.
pub const SESSION_MATERIAL_LEN: usize = 40;

/// Width of an HMAC-SHA1 digest.
pub const HMAC_LEN: usize = 20;

/// The 40-byte symmetric session secret: AES key, IV and salt.
///
/// Generated once per handshake and never persisted. The salt is carried
/// for wire compatibility but currently unused.
#[derive(Clone)]
pub struct SessionMaterial {
    key: [u8; BLOCK_LEN],
    iv: [u8; BLOCK_LEN],
    salt: [u8; 8],
}

impl SessionMaterial {
    /// Draws fresh material from the operating system RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_MATERIAL_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(&bytes)
    }

    /// Rebuilds material from a 40-byte blob (key ‖ iv ‖ salt).
    pub fn from_bytes(bytes: &[u8; SESSION_MATERIAL_LEN]) -> Self {
        let mut key = [0u8; BLOCK_LEN];
        let mut iv = [0u8; BLOCK_LEN];
        let mut salt = [0u8; 8];
        key.copy_from_slice(&bytes[..16]);
        iv.copy_from_slice(&bytes[16..32]);
        salt.copy_from_slice(&bytes[32..]);
        Self { key, iv, salt }
    }

    /// Parses a slice that must be exactly 40 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: &[u8; SESSION_MATERIAL_LEN] = bytes.try_into().map_err(|_| {
            ProtocolError::Handshake(format!(
                "session material must be {} bytes, got {}",
                SESSION_MATERIAL_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(arr))
    }

    /// The full 40-byte blob, for transport to the device.
    pub fn to_bytes(&self) -> [u8; SESSION_MATERIAL_LEN] {
        let mut out = [0u8; SESSION_MATERIAL_LEN];
        out[..16].copy_from_slice(&self.key);
        out[16..32].copy_from_slice(&self.iv);
        out[32..].copy_from_slice(&self.salt);
        out
    }

    /// Opens the outbound (encrypting) transform.
    pub fn cipher(&self) -> CipherState {
        CipherState {
            key: self.key,
            iv: self.iv,
        }
    }

    /// Opens the inbound (decrypting) transform.
    pub fn decipher(&self) -> DecipherState {
        DecipherState {
            key: self.key,
            iv: self.iv,
        }
    }
}

impl std::fmt::Debug for SessionMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMaterial")
            .field("key", &"[REDACTED]")
            .field("iv", &"[REDACTED]")
            .field("salt", &"[REDACTED]")
            .finish()
    }
}

/// Outbound stream transform: one padded CBC encryption per call.
pub struct CipherState {
    key: [u8; BLOCK_LEN],
    iv: [u8; BLOCK_LEN],
}

impl CipherState {
    /// Encrypts one chunk. The running IV advances to the trailing 16
    /// bytes of the produced ciphertext.
    ///
    /// An empty chunk is an error and produces no output; a truly empty
    /// application message would stall downstream framing.
    pub fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>> {
        if plain.is_empty() {
            return Err(ProtocolError::EmptyChunk);
        }
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plain);
        self.iv.copy_from_slice(&ciphertext[ciphertext.len() - BLOCK_LEN..]);
        Ok(ciphertext)
    }
}

/// Inbound stream transform: one padded CBC decryption per call.
pub struct DecipherState {
    key: [u8; BLOCK_LEN],
    iv: [u8; BLOCK_LEN],
}

impl DecipherState {
    /// Decrypts one chunk. The running IV advances to the trailing 16
    /// bytes of the *input* ciphertext.
    pub fn decrypt(&mut self, cipher: &[u8]) -> Result<Vec<u8>> {
        if cipher.is_empty() {
            return Err(ProtocolError::EmptyChunk);
        }
        if cipher.len() % BLOCK_LEN != 0 {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext length {} is not block aligned",
                cipher.len()
            )));
        }
        let next_iv: [u8; BLOCK_LEN] = cipher[cipher.len() - BLOCK_LEN..]
            .try_into()
            .expect("slice is exactly one block");
        let plain = Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(cipher)
            .map_err(|e| ProtocolError::Decryption(e.to_string()))?;
        self.iv = next_iv;
        Ok(plain)
    }
}

/// A device public key in one of the two supported shapes.
#[derive(Debug, Clone)]
pub enum DeviceKey {
    /// RSA key; required by the TCP handshake.
    Rsa(RsaPublicKey),
    /// Raw 32-byte elliptic-curve key used by other transports.
    Ec(ed25519_dalek::VerifyingKey),
}

impl DeviceKey {
    /// Parses key material, trying RSA formats first (PEM, then the
    /// PKCS#8 and PKCS#1 DER layouts) and falling back to the raw
    /// 32-byte EC form.
    pub fn parse(material: &[u8]) -> Result<Self> {
        if material.starts_with(b"-----") {
            let pem = std::str::from_utf8(material).map_err(|_| {
                ProtocolError::InvalidPublicKey("PEM is not valid utf-8".to_string())
            })?;
            if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
                return Ok(DeviceKey::Rsa(key));
            }
            return RsaPublicKey::from_pkcs1_pem(pem)
                .map(DeviceKey::Rsa)
                .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()));
        }

        if let Ok(key) = RsaPublicKey::from_public_key_der(material) {
            return Ok(DeviceKey::Rsa(key));
        }
        if let Ok(key) = RsaPublicKey::from_pkcs1_der(material) {
            return Ok(DeviceKey::Rsa(key));
        }

        let raw: &[u8; 32] = material.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "not an RSA key and not a 32-byte EC key ({} bytes)",
                material.len()
            ))
        })?;
        ed25519_dalek::VerifyingKey::from_bytes(raw)
            .map(DeviceKey::Ec)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))
    }

    /// The RSA key, or a handshake error for EC devices (their transport
    /// does not run over this listener).
    pub fn require_rsa(&self) -> Result<&RsaPublicKey> {
        match self {
            DeviceKey::Rsa(key) => Ok(key),
            DeviceKey::Ec(_) => Err(ProtocolError::Handshake(
                "device presented an elliptic-curve key; the TCP handshake requires RSA"
                    .to_string(),
            )),
        }
    }

    /// PEM rendering for persistence.
    pub fn to_pem(&self) -> Result<String> {
        match self {
            DeviceKey::Rsa(key) => key
                .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
                .map_err(|e| ProtocolError::KeyStore(e.to_string())),
            DeviceKey::Ec(key) => {
                // EC keys persist as bare hex; nothing downstream consumes
                // them beyond identification.
                Ok(format!(
                    "-----BEGIN EC DEVICE KEY-----\n{}\n-----END EC DEVICE KEY-----\n",
                    hex_lower(key.as_bytes())
                ))
            }
        }
    }

    /// Size in bytes of one ciphertext produced under this key.
    pub fn ciphertext_len(&self) -> usize {
        match self {
            DeviceKey::Rsa(key) => key.size(),
            DeviceKey::Ec(_) => 0,
        }
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// RSA-encrypts with PKCS#1 v1.5 padding.
pub fn rsa_encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))
}

/// RSA-decrypts with PKCS#1 v1.5 padding.
pub fn rsa_decrypt(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    key.decrypt(Pkcs1v15Encrypt, data)
        .map_err(|e| ProtocolError::Decryption(e.to_string()))
}

/// Signs a raw digest with the private key (PKCS#1 v1.5, no digest OID).
pub fn rsa_sign_raw(key: &RsaPrivateKey, digest: &[u8]) -> Result<Vec<u8>> {
    key.sign(Pkcs1v15Sign::new_unprefixed(), digest)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))
}

/// Verifies a raw-digest signature; used by device-side test doubles.
pub fn rsa_verify_raw(key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> Result<()> {
    key.verify(Pkcs1v15Sign::new_unprefixed(), digest, signature)
        .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))
}

/// HMAC-SHA1 of `data` keyed with `key`.
pub fn hmac_sha1(data: &[u8], key: &[u8]) -> [u8; HMAC_LEN] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; HMAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPublicKey;

    fn material() -> SessionMaterial {
        let mut bytes = [0u8; SESSION_MATERIAL_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = i as u8;
        }
        SessionMaterial::from_bytes(&bytes)
    }

    #[test]
    fn test_material_roundtrip() {
        let m = material();
        let rebuilt = SessionMaterial::from_slice(&m.to_bytes()).unwrap();
        assert_eq!(rebuilt.to_bytes(), m.to_bytes());
    }

    #[test]
    fn test_material_wrong_length() {
        assert!(SessionMaterial::from_slice(&[0u8; 39]).is_err());
        assert!(SessionMaterial::from_slice(&[0u8; 41]).is_err());
    }

    #[test]
    fn test_material_generate_is_random() {
        let a = SessionMaterial::generate();
        let b = SessionMaterial::generate();
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_material_debug_redacts() {
        let debug = format!("{:?}", material());
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("00"));
    }

    #[test]
    fn test_cipher_roundtrip_single_chunk() {
        let m = material();
        let mut enc = m.cipher();
        let mut dec = m.decipher();

        let ciphertext = enc.encrypt(b"hello device").unwrap();
        assert_eq!(ciphertext.len() % BLOCK_LEN, 0);
        let plain = dec.decrypt(&ciphertext).unwrap();
        assert_eq!(plain, b"hello device");
    }

    #[test]
    fn test_cipher_chains_across_chunks() {
        let m = material();
        let mut enc = m.cipher();
        let mut dec = m.decipher();

        for i in 0..10u32 {
            let message = format!("chunk number {}", i);
            let ciphertext = enc.encrypt(message.as_bytes()).unwrap();
            let plain = dec.decrypt(&ciphertext).unwrap();
            assert_eq!(plain, message.as_bytes());
        }
    }

    #[test]
    fn test_same_plaintext_differs_across_calls() {
        // The running IV makes repeated chunks encrypt differently.
        let m = material();
        let mut enc = m.cipher();
        let first = enc.encrypt(b"repeat").unwrap();
        let second = enc.encrypt(b"repeat").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_decrypt_with_stale_iv_fails_or_garbles() {
        let m = material();
        let mut enc = m.cipher();
        let _ = enc.encrypt(b"first chunk").unwrap();
        let second = enc.encrypt(b"second chunk").unwrap();

        // A decipher that never saw the first chunk has the wrong IV.
        let mut dec = m.decipher();
        match dec.decrypt(&second) {
            Ok(plain) => assert_ne!(plain, b"second chunk"),
            Err(e) => assert!(matches!(e, ProtocolError::Decryption(_))),
        }
    }

    #[test]
    fn test_empty_chunk_is_error() {
        let m = material();
        assert!(matches!(
            m.cipher().encrypt(&[]),
            Err(ProtocolError::EmptyChunk)
        ));
        assert!(matches!(
            m.decipher().decrypt(&[]),
            Err(ProtocolError::EmptyChunk)
        ));
    }

    #[test]
    fn test_unaligned_ciphertext_is_error() {
        let m = material();
        let result = m.decipher().decrypt(&[1, 2, 3]);
        assert!(matches!(result, Err(ProtocolError::Decryption(_))));
    }

    #[test]
    fn test_hmac_sha1_properties() {
        let a = hmac_sha1(b"payload", b"key one");
        let b = hmac_sha1(b"payload", b"key one");
        let c = hmac_sha1(b"payload", b"key two");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), HMAC_LEN);
    }

    #[test]
    fn test_rsa_encrypt_decrypt_roundtrip() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);

        let secret = material().to_bytes();
        let ciphertext = rsa_encrypt(&public, &secret).unwrap();
        assert_eq!(ciphertext.len(), 128);
        let plain = rsa_decrypt(&private, &ciphertext).unwrap();
        assert_eq!(plain, secret);
    }

    #[test]
    fn test_rsa_sign_verify_raw() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);

        let digest = hmac_sha1(b"ciphertext bytes", b"session key");
        let signature = rsa_sign_raw(&private, &digest).unwrap();
        assert!(rsa_verify_raw(&public, &digest, &signature).is_ok());

        let mut tampered = digest;
        tampered[0] ^= 0xFF;
        assert!(rsa_verify_raw(&public, &tampered, &signature).is_err());
    }

    #[test]
    fn test_device_key_parse_rsa_der_and_pem() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);

        let spki_der = public.to_public_key_der().unwrap();
        let parsed = DeviceKey::parse(spki_der.as_bytes()).unwrap();
        assert!(matches!(parsed, DeviceKey::Rsa(ref k) if *k == public));

        let pkcs1_der = public.to_pkcs1_der().unwrap();
        let parsed = DeviceKey::parse(pkcs1_der.as_bytes()).unwrap();
        assert!(matches!(parsed, DeviceKey::Rsa(ref k) if *k == public));

        let pem = public.to_public_key_pem(rsa::pkcs8::LineEnding::LF).unwrap();
        let parsed = DeviceKey::parse(pem.as_bytes()).unwrap();
        assert!(matches!(parsed, DeviceKey::Rsa(ref k) if *k == public));
    }

    #[test]
    fn test_device_key_falls_back_to_ec() {
        use ed25519_dalek::SigningKey;
        let signing = SigningKey::generate(&mut OsRng);
        let raw = signing.verifying_key().to_bytes();

        let parsed = DeviceKey::parse(&raw).unwrap();
        assert!(matches!(parsed, DeviceKey::Ec(_)));
        assert!(parsed.require_rsa().is_err());
    }

    #[test]
    fn test_device_key_garbage_rejected() {
        assert!(DeviceKey::parse(&[0xAB; 17]).is_err());
        assert!(DeviceKey::parse(b"-----BEGIN NONSENSE-----").is_err());
    }

    #[test]
    fn test_device_key_pem_roundtrip() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        let key = DeviceKey::Rsa(public.clone());

        let pem = key.to_pem().unwrap();
        let reparsed = DeviceKey::parse(pem.as_bytes()).unwrap();
        assert!(matches!(reparsed, DeviceKey::Rsa(ref k) if *k == public));
        assert_eq!(key.ciphertext_len(), 128);
    }
}
