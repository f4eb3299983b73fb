//! AES-CBC payload envelope
//!
//! The encrypted payload has a fixed byte layout:
//!
//! ```text
//! [16-byte random prefix][4-byte big-endian length][payload][target id]
//! ```
//!
//! padded to the cipher block size with PKCS7 bytes. The 32-byte key is
//! decoded from the platform's 43-character base64 key; the IV is the
//! first 16 bytes of the key. The random prefix and the explicit length
//! field are part of the platform protocol, as is the target-id binding
//! that ties a ciphertext to one receiving application.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const BLOCK_SIZE: usize = 16;
const PREFIX_LEN: usize = 16;
const LEN_FIELD: usize = 4;

/// Envelope construction or recovery failure.
///
/// The variants exist for logging; callers answering the webhook must
/// collapse them into one generic response.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The configured encryption key does not decode to 32 bytes
    #[error("encryption key must decode to 32 bytes")]
    KeyLength,
    /// Ciphertext is not valid base64
    #[error("ciphertext is not valid base64")]
    Decode,
    /// Ciphertext length is not a positive multiple of the block size
    #[error("ciphertext has an invalid length")]
    Ciphertext,
    /// PKCS7 padding is out of range or inconsistent
    #[error("invalid padding")]
    Padding,
    /// The declared payload length does not fit the decrypted content
    #[error("envelope layout is invalid")]
    Layout,
    /// The payload is not valid UTF-8
    #[error("payload is not valid UTF-8")]
    Encoding,
    /// The envelope is bound to a different receiving application
    #[error("target id mismatch")]
    TargetMismatch,
}

/// Encrypts and decrypts payload envelopes for one receiving application.
#[derive(Clone)]
pub struct EnvelopeCipher {
    key: [u8; 32],
    target_id: String,
}

impl EnvelopeCipher {
    /// Build a cipher from the platform's 43-character encoding key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyLength`] if the key does not decode to
    /// exactly 32 bytes.
    pub fn new(encoding_aes_key: &str, target_id: impl Into<String>) -> Result<Self, CryptoError> {
        // The console hands out the key without its trailing '='
        let decoded = BASE64
            .decode(format!("{encoding_aes_key}="))
            .map_err(|_| CryptoError::KeyLength)?;
        let key: [u8; 32] = decoded.try_into().map_err(|_| CryptoError::KeyLength)?;
        Ok(Self {
            key,
            target_id: target_id.into(),
        })
    }

    fn iv(&self) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&self.key[..16]);
        iv
    }

    /// Decrypt a base64 ciphertext and recover the payload text.
    ///
    /// # Errors
    ///
    /// Fails on undecodable base64, a broken block structure, bad
    /// padding, an inconsistent length field, or a target id that does
    /// not match this application.
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String, CryptoError> {
        let ciphertext = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|_| CryptoError::Decode)?;
        if ciphertext.is_empty() || !ciphertext.len().is_multiple_of(BLOCK_SIZE) {
            return Err(CryptoError::Ciphertext);
        }

        let cipher = Aes256CbcDec::new(&self.key.into(), &self.iv().into());
        let decrypted = cipher
            .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
            .map_err(|_| CryptoError::Ciphertext)?;

        let content = strip_pkcs7(&decrypted)?;
        self.parse_layout(content)
    }

    fn parse_layout(&self, content: &[u8]) -> Result<String, CryptoError> {
        if content.len() < PREFIX_LEN + LEN_FIELD {
            return Err(CryptoError::Layout);
        }
        let body = &content[PREFIX_LEN..];

        let mut len_bytes = [0u8; LEN_FIELD];
        len_bytes.copy_from_slice(&body[..LEN_FIELD]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;

        let rest = &body[LEN_FIELD..];
        if payload_len > rest.len() {
            return Err(CryptoError::Layout);
        }

        let payload =
            std::str::from_utf8(&rest[..payload_len]).map_err(|_| CryptoError::Encoding)?;
        let target =
            std::str::from_utf8(&rest[payload_len..]).map_err(|_| CryptoError::Encoding)?;
        if target != self.target_id {
            return Err(CryptoError::TargetMismatch);
        }

        Ok(payload.to_string())
    }

    /// Encrypt a payload into a base64 ciphertext bound to this
    /// application's target id.
    ///
    /// # Errors
    ///
    /// Returns an error only if the cipher rejects the buffer, which
    /// cannot happen for a correctly padded input.
    pub fn encrypt(&self, payload: &str) -> Result<String, CryptoError> {
        let mut prefix = [0u8; PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut prefix);

        let payload_bytes = payload.as_bytes();
        let mut buf = Vec::with_capacity(
            PREFIX_LEN + LEN_FIELD + payload_bytes.len() + self.target_id.len() + BLOCK_SIZE,
        );
        buf.extend_from_slice(&prefix);
        let declared_len =
            u32::try_from(payload_bytes.len()).map_err(|_| CryptoError::Layout)?;
        buf.extend_from_slice(&declared_len.to_be_bytes());
        buf.extend_from_slice(payload_bytes);
        buf.extend_from_slice(self.target_id.as_bytes());

        // Always pad; a full block of padding when already aligned
        let pad = BLOCK_SIZE - buf.len() % BLOCK_SIZE;
        buf.resize(buf.len() + pad, pad as u8);

        let cipher = Aes256CbcEnc::new(&self.key.into(), &self.iv().into());
        let encrypted = cipher.encrypt_padded_vec_mut::<NoPadding>(&buf);

        Ok(BASE64.encode(encrypted))
    }
}

fn strip_pkcs7(decrypted: &[u8]) -> Result<&[u8], CryptoError> {
    let Some(&pad) = decrypted.last() else {
        return Err(CryptoError::Padding);
    };
    let pad = pad as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > decrypted.len() {
        return Err(CryptoError::Padding);
    }
    let (content, padding) = decrypted.split_at(decrypted.len() - pad);
    if padding.iter().any(|&b| b as usize != pad) {
        return Err(CryptoError::Padding);
    }
    Ok(content)
}
