//! HMAC-SHA256 payload signing and secret handling
//!
//! Signatures cover the exact JSON body bytes sent on the wire and are
//! rendered as `sha256=<lowercase hex>`.

use crate::error::ValidationError;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Scheme prefix carried by every signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Prefix of server-generated secrets.
pub const SECRET_PREFIX: &str = "whsec_";

/// Random bytes in a generated secret.
const SECRET_BYTES: usize = 32;

/// Characters of a secret left visible when masked.
const MASK_VISIBLE_CHARS: usize = 8;

fn keyed_mac(secret: &str) -> Result<HmacSha256, ValidationError> {
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).map_err(|e| {
        ValidationError::InvalidValue {
            field: "secret".to_string(),
            reason: format!("failed to initialize HMAC: {e}"),
        }
    })
}

/// Sign a payload: `"sha256=" + hex(HMAC_SHA256(secret, body))`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, ValidationError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verify a signature header value against a payload.
///
/// The digest comparison is constant-time. Malformed headers (missing scheme,
/// non-hex digest) never verify.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(digest_hex) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(digest) = hex::decode(digest_hex) else {
        return false;
    };
    let Ok(mut mac) = keyed_mac(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&digest).is_ok()
}

/// Generate a fresh signing secret from the thread-local CSPRNG.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    format!("{SECRET_PREFIX}{}", hex::encode(bytes))
}

/// Masked form of a secret: a short prefix followed by an ellipsis.
///
/// Never reveals more than half of the secret.
pub fn mask_secret(secret: &str) -> String {
    let total = secret.chars().count();
    let visible = MASK_VISIBLE_CHARS.min(total / 2);
    let prefix: String = secret.chars().take(visible).collect();
    format!("{prefix}...")
}
