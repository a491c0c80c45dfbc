//! RFC 6238 time-based one-time codes for the two-factor login step.
//!
//! NDAX two-factor secrets are the usual base32-encoded authenticator
//! secrets: HMAC-SHA1, 30-second step, 6 digits.
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::errors::NdaxError;

const STEP_SECONDS: u64 = 30;
const DIGITS: u32 = 6;

/// The current one-time code for a base32 secret.
pub fn totp_now(secret_base32: &str) -> Result<String, NdaxError> {
    let unix_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| NdaxError::Other(format!("system clock before epoch: {e}")))?
        .as_secs();
    totp_at(secret_base32, unix_time)
}

/// The one-time code for a base32 secret at a given unix time.
pub fn totp_at(secret_base32: &str, unix_time: u64) -> Result<String, NdaxError> {
    let key = decode_secret(secret_base32)?;
    let counter = unix_time / STEP_SECONDS;

    let mut mac = Hmac::<Sha1>::new_from_slice(&key)
        .map_err(|e| NdaxError::AuthenticationFailed(format!("invalid TOTP key: {e}")))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);

    let code = binary % 10u32.pow(DIGITS);
    Ok(format!("{code:0width$}", width = DIGITS as usize))
}

/// Decode a base32 secret, tolerating lowercase, spaces, and missing
/// padding as authenticator apps emit them.
fn decode_secret(secret_base32: &str) -> Result<Vec<u8>, NdaxError> {
    let normalized: String = secret_base32
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .collect::<String>()
        .to_ascii_uppercase();

    base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &normalized).ok_or_else(|| {
        NdaxError::AuthenticationFailed("two-factor secret is not valid base32".into())
    })
}
