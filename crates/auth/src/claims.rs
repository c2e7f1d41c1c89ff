//! Unverified claim decoding for bearer credentials
//!
//! The access credential carries an `exp` claim that the client reads only to
//! schedule proactive refresh. The signature is never checked here; the
//! server is the sole authority on whether a credential is valid.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use log::debug;
use serde::Deserialize;

/// Result of reading the expiration claim from a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Seconds since the unix epoch.
    At(i64),
    /// The credential was malformed or had no usable `exp` claim.
    Unknown,
}

impl Expiration {
    /// Seconds left before expiry, negative once expired.
    pub fn remaining(&self, now: i64) -> Option<i64> {
        match self {
            Self::At(exp) => Some(exp - now),
            Self::Unknown => None,
        }
    }

    /// `true` only when the claim is known and already in the past.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self, Self::At(exp) if *exp <= now)
    }
}

#[derive(Deserialize)]
struct ExpClaim {
    exp: Option<serde_json::Number>,
}

/// Extract the `exp` claim from a three-segment bearer token.
///
/// Never fails: any malformed input yields [`Expiration::Unknown`].
pub fn decode_expiration(token: &str) -> Expiration {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        debug!(
            "Credential has {} segments, expected 3; expiration unknown",
            segments.len()
        );
        return Expiration::Unknown;
    }

    let payload = segments[1].trim_end_matches('=');
    let bytes = match URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| STANDARD_NO_PAD.decode(payload))
    {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Credential payload is not valid base64: {}", e);
            return Expiration::Unknown;
        }
    };

    let claim: ExpClaim = match serde_json::from_slice(&bytes) {
        Ok(claim) => claim,
        Err(e) => {
            debug!("Credential payload is not a JSON object: {}", e);
            return Expiration::Unknown;
        }
    };

    match claim.exp {
        Some(exp) => match exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64)) {
            Some(exp) => Expiration::At(exp),
            None => Expiration::Unknown,
        },
        None => {
            debug!("Credential payload has no exp claim");
            Expiration::Unknown
        }
    }
}
