//! Signed retry callbacks.
//!
//! External queues sign each delivery with HMAC-SHA256 over
//! `"{timestamp}.{body}"` and send `t=<unix>,v1=<hex>` in the
//! `x-slotwise-signature` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const SIGNATURE_HEADER: &str = "x-slotwise-signature";

/// Deliveries older than this are refused.
const MAX_AGE_SECS: i64 = 300;
/// Allowed clock skew for deliveries stamped in the future.
const MAX_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature header: {0}")]
    Malformed(&'static str),
    #[error("signature timestamp outside the accepted window")]
    Stale,
    #[error("signature mismatch")]
    Mismatch,
}

struct SignatureHeader {
    timestamp: i64,
    v1: Vec<u8>,
}

impl SignatureHeader {
    fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut v1 = None;

        for part in header.split(',') {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or(SignatureError::Malformed("expected key=value pairs"))?;
            match key {
                "t" => {
                    timestamp = Some(value.parse().map_err(|_| SignatureError::Malformed("bad timestamp"))?);
                }
                "v1" => {
                    v1 = Some(hex::decode(value).map_err(|_| SignatureError::Malformed("bad v1 hex"))?);
                }
                _ => {}
            }
        }

        Ok(Self {
            timestamp: timestamp.ok_or(SignatureError::Malformed("missing t"))?,
            v1: v1.ok_or(SignatureError::Malformed("missing v1"))?,
        })
    }
}

#[derive(Clone)]
pub struct CallbackVerifier {
    secret: String,
}

impl CallbackVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    pub fn verify(&self, payload: &[u8], header: &str, now_unix: i64) -> Result<(), SignatureError> {
        let header = SignatureHeader::parse(header)?;

        let age = now_unix - header.timestamp;
        if age > MAX_AGE_SECS || age < -MAX_SKEW_SECS {
            return Err(SignatureError::Stale);
        }

        let expected = mac(&self.secret, header.timestamp, payload);
        if expected.len() != header.v1.len() || !bool::from(expected.ct_eq(&header.v1)) {
            return Err(SignatureError::Mismatch);
        }
        Ok(())
    }
}

fn mac(secret: &str, timestamp: i64, payload: &[u8]) -> Vec<u8> {
    // new_from_slice only fails for fixed-size keys; HMAC takes any length.
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Header value for `payload` signed at `timestamp`. Used by queue adapters
/// that call back into this service, and by tests.
pub fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!("t={},v1={}", timestamp, hex::encode(mac(secret, timestamp, payload)))
}
