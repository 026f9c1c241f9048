//! Session tokens handed out for publish leases.
//!
//! A token is the base64 of a JSON record (public id, expiry, lease path,
//! MAC); the MAC is a keyed blake3 hash over the other three fields under a
//! random per-token secret. Whoever holds the secret can later check a
//! token and recover the lease path.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use data_encoding::{BASE64, HEXLOWER};
use rand::RngCore;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct SessionToken {
    pub token: String,
    pub public_id: String,
    /// Hex-encoded 32-byte MAC key; kept by the issuer, never embedded in
    /// the token.
    pub secret: String,
}

#[derive(Error, Debug, PartialEq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("malformed secret")]
    MalformedSecret,
    #[error("token MAC mismatch")]
    InvalidMac,
    #[error("token expired")]
    Expired,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct TokenPayload {
    public_id: String,
    expiry: u64,
    path: String,
    mac: String,
}

/// Issue a token for `path`, valid for `max_lease_time` seconds.
pub fn generate_session_token(
    key_id: &str,
    path: &str,
    max_lease_time: u64,
) -> Result<SessionToken, TokenError> {
    let mut rng = rand::thread_rng();

    let mut id_suffix = [0u8; 8];
    rng.fill_bytes(&mut id_suffix);
    let public_id = format!("{key_id}-{}", HEXLOWER.encode(&id_suffix));

    let mut key = [0u8; 32];
    rng.fill_bytes(&mut key);

    let expiry = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        + max_lease_time;

    let payload = TokenPayload {
        mac: compute_mac(&key, &public_id, expiry, path),
        public_id: public_id.clone(),
        expiry,
        path: path.to_string(),
    };
    let token = BASE64.encode(
        serde_json::to_string(&payload)
            .map_err(|_| TokenError::Malformed)?
            .as_bytes(),
    );

    Ok(SessionToken {
        token,
        public_id,
        secret: HEXLOWER.encode(&key),
    })
}

/// The public id can be read without knowing the secret.
pub fn get_token_public_id(token: &str) -> Result<String, TokenError> {
    Ok(decode_payload(token)?.public_id)
}

/// Validate a token against its secret; returns the lease path.
pub fn check_token(token: &str, secret: &str) -> Result<String, TokenError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    check_token_at(token, secret, now)
}

fn check_token_at(token: &str, secret: &str, now: u64) -> Result<String, TokenError> {
    let payload = decode_payload(token)?;

    let key_bytes = HEXLOWER
        .decode(secret.as_bytes())
        .map_err(|_| TokenError::MalformedSecret)?;
    let key: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| TokenError::MalformedSecret)?;

    let expected = compute_mac(&key, &payload.public_id, payload.expiry, &payload.path);
    if expected != payload.mac {
        return Err(TokenError::InvalidMac);
    }
    if now > payload.expiry {
        return Err(TokenError::Expired);
    }
    Ok(payload.path)
}

fn decode_payload(token: &str) -> Result<TokenPayload, TokenError> {
    let raw = BASE64
        .decode(token.as_bytes())
        .map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)
}

fn compute_mac(key: &[u8; 32], public_id: &str, expiry: u64, path: &str) -> String {
    let message = format!("{public_id}{expiry}{path}");
    HEXLOWER.encode(blake3::keyed_hash(key, message.as_bytes()).as_bytes())
}
