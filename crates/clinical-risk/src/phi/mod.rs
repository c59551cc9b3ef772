//! Protected health information boundary.
//!
//! Raw answers exist in plaintext only inside [`Answers`], which refuses to serialize and
//! redacts itself in debug output. Stored responses hold [`SealedAnswers`]; everything that
//! leaves the engine is built from [`RedactedView`] or derived scores.

mod sealed;

use std::collections::BTreeMap;
use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};
use sha2::Sha256;
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::domain::{InstrumentType, PatientRef, ProfileId, ResponseId};

pub use sealed::{PhiKey, SealedAnswers, KEY_LENGTH};

pub type AnswerValue = i32;

const VIOLATION_MARKER: &str = "PHI exposure violation";

/// Plaintext answers keyed by question id.
#[derive(Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(transparent)]
pub struct Answers(BTreeMap<String, AnswerValue>);

impl Answers {
    pub fn new(values: BTreeMap<String, AnswerValue>) -> Self {
        Self(values)
    }

    /// Builds `item_1..item_n` answers from an ordered list of values.
    pub fn from_sequence(values: &[AnswerValue]) -> Self {
        Self(
            values
                .iter()
                .enumerate()
                .map(|(index, value)| (format!("item_{}", index + 1), *value))
                .collect(),
        )
    }

    pub fn get(&self, question_id: &str) -> Option<AnswerValue> {
        self.0.get(question_id).copied()
    }

    pub fn question_ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, AnswerValue)> for Answers {
    fn from_iter<T: IntoIterator<Item = (String, AnswerValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Debug for Answers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Answers([REDACTED; {} items])", self.0.len())
    }
}

impl Serialize for Answers {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        record_violation("plaintext answers");
        Err(S::Error::custom(PhiError::ExposureViolation {
            context: "plaintext answers",
        }))
    }
}

/// A sealed questionnaire submission. Deliberately not serializable.
#[derive(Debug, Clone)]
pub struct QuestionnaireResponse {
    response_id: ResponseId,
    patient_ref: PatientRef,
    instrument: InstrumentType,
    submitted_at: DateTime<Utc>,
    answer_count: usize,
    sealed: SealedAnswers,
}

impl QuestionnaireResponse {
    pub fn response_id(&self) -> ResponseId {
        self.response_id
    }

    pub fn patient_ref(&self) -> &PatientRef {
        &self.patient_ref
    }

    pub fn instrument(&self) -> &InstrumentType {
        &self.instrument
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn sealed(&self) -> &SealedAnswers {
        &self.sealed
    }
}

/// Outward-safe projection of a stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedactedView {
    pub response_id: ResponseId,
    pub profile_id: ProfileId,
    pub instrument: InstrumentType,
    pub submitted_at: DateTime<Utc>,
    pub answer_count: usize,
    pub patient_ref_hash: String,
}

/// Why sealed answers are being opened. Logged on every access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPurpose {
    Rescoring,
    ClinicalReview,
}

impl AccessPurpose {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Rescoring => "rescoring",
            Self::ClinicalReview => "clinical_review",
        }
    }
}

/// Keyed hash for patient references crossing the engine boundary.
#[derive(Clone)]
pub struct PatientRefHasher {
    salt: Zeroizing<Vec<u8>>,
}

impl PatientRefHasher {
    pub fn new(salt: impl Into<Vec<u8>>) -> Self {
        Self {
            salt: Zeroizing::new(salt.into()),
        }
    }

    /// Random 32-byte salt; hashes are only stable for this hasher's lifetime.
    pub fn random() -> Self {
        let mut salt = vec![0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut salt);
        Self::new(salt)
    }

    /// Lowercase hex HMAC-SHA256 of the reference.
    pub fn hash(&self, patient_ref: &PatientRef) -> String {
        hex::encode(keyed_digest(&self.salt, patient_ref.as_bytes()))
    }
}

impl fmt::Debug for PatientRefHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PatientRefHasher([REDACTED])")
    }
}

/// Seals, exposes, and audits access to questionnaire answers.
#[derive(Debug)]
pub struct PhiGuard {
    key: PhiKey,
    hasher: PatientRefHasher,
}

impl PhiGuard {
    pub fn new(key: PhiKey, hasher: PatientRefHasher) -> Self {
        Self { key, hasher }
    }

    pub fn seal(
        &self,
        patient_ref: PatientRef,
        instrument: InstrumentType,
        answers: &Answers,
        submitted_at: DateTime<Utc>,
    ) -> Result<QuestionnaireResponse, PhiError> {
        let plaintext =
            Zeroizing::new(serde_json::to_vec(&answers.0).map_err(|_| PhiError::SealFailed)?);
        let sealed = SealedAnswers::seal(&self.key, &plaintext)?;
        Ok(QuestionnaireResponse {
            response_id: ResponseId::new(),
            patient_ref,
            instrument,
            submitted_at,
            answer_count: answers.len(),
            sealed,
        })
    }

    pub fn expose(&self, response: &QuestionnaireResponse) -> RedactedView {
        RedactedView {
            response_id: response.response_id,
            profile_id: ProfileId::for_response(response.response_id),
            instrument: response.instrument.clone(),
            submitted_at: response.submitted_at,
            answer_count: response.answer_count,
            patient_ref_hash: self.hasher.hash(&response.patient_ref),
        }
    }

    pub fn unseal(
        &self,
        response: &QuestionnaireResponse,
        purpose: AccessPurpose,
    ) -> Result<Answers, PhiError> {
        info!(
            target: "phi_access",
            response_id = %response.response_id,
            instrument = %response.instrument,
            purpose = purpose.label(),
            "sealed answers opened"
        );
        let plaintext = Zeroizing::new(response.sealed.open(&self.key)?);
        let values: BTreeMap<String, AnswerValue> =
            serde_json::from_slice(&plaintext).map_err(|_| PhiError::CorruptedPayload)?;
        Ok(Answers(values))
    }

    pub fn patient_hash(&self, patient_ref: &PatientRef) -> String {
        self.hasher.hash(patient_ref)
    }
}

/// Serializes an outward payload, failing closed if any protected value is reachable.
pub fn outward_json<T: Serialize>(value: &T, context: &'static str) -> Result<Vec<u8>, PhiError> {
    serde_json::to_vec(value).map_err(|err| {
        if err.to_string().contains(VIOLATION_MARKER) {
            PhiError::ExposureViolation { context }
        } else {
            PhiError::Encoding(err.to_string())
        }
    })
}

/// HMAC-SHA256 of `message` under `key`.
pub(crate) fn keyed_digest(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

pub(crate) fn record_violation(context: &'static str) {
    error!(
        target: "phi_guard",
        context,
        "blocked serialization of protected health information"
    );
    metrics::counter!("phi_exposure_violations_total").increment(1);
}

#[derive(Debug, thiserror::Error)]
pub enum PhiError {
    #[error("PHI exposure violation: {context} cannot leave the encryption boundary")]
    ExposureViolation { context: &'static str },
    #[error("PHI key must be 32 bytes encoded as 64 hex characters")]
    InvalidKey,
    #[error("failed to seal questionnaire answers")]
    SealFailed,
    #[error("failed to unseal questionnaire answers")]
    UnsealFailed,
    #[error("sealed answer payload is corrupted")]
    CorruptedPayload,
    #[error("failed to encode outward payload: {0}")]
    Encoding(String),
}
