//! Stripe webhook signature verification
//!
//! Stripe signs `"{t}.{raw body}"` with HMAC-SHA256 keyed by the endpoint's
//! signing secret and sends the result in the `Stripe-Signature` header:
//!
//! ```text
//! Stripe-Signature: t=1700000000,v1=5257a869...,v0=6ffbb59b...
//! ```
//!
//! Verification runs on the raw body before it is parsed. A header may carry
//! several `v1` entries during secret rotation; any one matching is enough.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Header name Stripe uses for the signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Parsed `Stripe-Signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// Decoded `v1` signatures; other schemes are ignored
    pub signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    /// Parse the header: `t=timestamp,v1=signature[,v1=...][,v0=...]`
    pub fn parse(header: &str) -> BillingResult<Self> {
        let mut timestamp: Option<i64> = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => match hex::decode(value) {
                    Ok(sig) => signatures.push(sig),
                    Err(_) => {
                        tracing::debug!("Skipping non-hex v1 signature entry");
                    }
                },
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if signatures.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Verifies inbound webhook payloads against the endpoint signing secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Verify a payload against the current wall clock
    pub fn verify(&self, payload: &[u8], header: &str) -> BillingResult<()> {
        self.verify_at(payload, header, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify a payload as of `now` (unix seconds)
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> BillingResult<()> {
        if self.secret.is_empty() {
            tracing::error!("Webhook signing secret is not configured");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let header = SignatureHeader::parse(header)?;

        let age = (now - header.timestamp).abs();
        if age > self.tolerance_secs {
            tracing::warn!(
                timestamp = header.timestamp,
                now = now,
                diff = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mac = self.mac_for(payload, header.timestamp)?;

        // verify_slice compares in constant time
        let matched = header
            .signatures
            .iter()
            .any(|sig| mac.clone().verify_slice(sig).is_ok());

        if !matched {
            tracing::warn!(
                candidates = header.signatures.len(),
                "Webhook signature mismatch"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }

    /// Produce a `Stripe-Signature` header value for a payload
    ///
    /// Used by tests and local tooling that replays captured events.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> BillingResult<String> {
        let mac = self.mac_for(payload, timestamp)?;
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    fn mac_for(&self, payload: &[u8], timestamp: i64) -> BillingResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}
