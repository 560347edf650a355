use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing signature header")]
    MissingSignature,

    #[error("Invalid format")]
    InvalidFormat,

    #[error("Timestamp outside tolerance")]
    TimestampOutOfTolerance,

    #[error("No signature matches the payload")]
    Mismatch,
}

impl From<SignatureError> for ServiceError {
    fn from(err: SignatureError) -> Self {
        ServiceError::InvalidSignature(err.to_string())
    }
}

/// Verifies `Stripe-Signature` style headers: `t=<unix>,v1=<hex>[,v1=<hex>...]`
/// where each `v1` is HMAC-SHA256 over `"{t}.{payload}"`.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    pub fn verify(&self, header: &str, payload: &[u8]) -> Result<(), SignatureError> {
        self.verify_at(header, payload, chrono::Utc::now().timestamp())
    }

    /// Verifies against an explicit clock, in unix seconds
    pub fn verify_at(&self, header: &str, payload: &[u8], now: i64) -> Result<(), SignatureError> {
        if header.trim().is_empty() {
            return Err(SignatureError::MissingSignature);
        }

        let mut timestamp: Option<&str> = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::InvalidFormat)?;
        if candidates.is_empty() {
            return Err(SignatureError::InvalidFormat);
        }
        let ts: i64 = timestamp
            .parse()
            .map_err(|_| SignatureError::InvalidFormat)?;

        if self.tolerance.as_secs() > 0 && (now - ts).unsigned_abs() > self.tolerance.as_secs() {
            return Err(SignatureError::TimestampOutOfTolerance);
        }

        let expected = self.sign(timestamp, payload);
        if candidates
            .iter()
            .any(|candidate| constant_time_eq(expected.as_bytes(), candidate.as_bytes()))
        {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Hex HMAC for `"{timestamp}.{payload}"`
    pub fn sign(&self, timestamp: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Builds a complete header value; used by tests and local tooling
    pub fn header_for(&self, timestamp: i64, payload: &[u8]) -> String {
        let ts = timestamp.to_string();
        format!("t={},v1={}", ts, self.sign(&ts, payload))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
