use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::phi::keyed_digest;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const ALERT_ID_HEADER: &str = "X-Alert-Id";
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-Id";
pub const ATTEMPT_HEADER: &str = "X-Delivery-Attempt";
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";

/// Lowercase hex HMAC-SHA256 over the exact body bytes.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    hex::encode(keyed_digest(secret, body))
}

/// Constant-time check of a hex signature produced by [`sign`].
pub fn verify(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
