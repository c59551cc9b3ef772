use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::ser::Error as _;
use serde::{Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{record_violation, PhiError};

pub const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// AES-256-GCM key protecting questionnaire answers at rest. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PhiKey([u8; KEY_LENGTH]);

impl PhiKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses a 64-character hex key.
    pub fn from_hex(value: &str) -> Result<Self, PhiError> {
        let mut decoded = hex::decode(value.trim()).map_err(|_| PhiError::InvalidKey)?;
        if decoded.len() != KEY_LENGTH {
            decoded.zeroize();
            return Err(PhiError::InvalidKey);
        }
        let mut bytes = [0u8; KEY_LENGTH];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(bytes))
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for PhiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PhiKey([REDACTED])")
    }
}

/// Encrypted answer payload: nonce plus ciphertext with the GCM tag appended.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedAnswers {
    nonce: [u8; NONCE_LENGTH],
    ciphertext: Vec<u8>,
}

impl SealedAnswers {
    pub(crate) fn seal(key: &PhiKey, plaintext: &[u8]) -> Result<Self, PhiError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = key
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| PhiError::SealFailed)?;
        Ok(Self { nonce, ciphertext })
    }

    pub(crate) fn open(&self, key: &PhiKey) -> Result<Vec<u8>, PhiError> {
        key.cipher()
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_ref())
            .map_err(|_| PhiError::UnsealFailed)
    }

    /// Storage encoding: `[12-byte nonce][ciphertext]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(NONCE_LENGTH + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PhiError> {
        if bytes.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(PhiError::CorruptedPayload);
        }
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&bytes[..NONCE_LENGTH]);
        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_LENGTH..].to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

impl fmt::Debug for SealedAnswers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedAnswers({} bytes)", self.ciphertext.len())
    }
}

impl Serialize for SealedAnswers {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        record_violation("sealed answers");
        Err(S::Error::custom(PhiError::ExposureViolation {
            context: "sealed answers",
        }))
    }
}
