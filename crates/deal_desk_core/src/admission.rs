//! crates/deal_desk_core/src/admission.rs
//!
//! The webhook admission gate: subscription handshakes and delivery signatures.
//!
//! Every rejection is written to the rejection log before the caller returns 403,
//! and nothing past this gate runs for a rejected request.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::domain::WebhookRejection;
use crate::ports::DatabaseService;
use crate::settings::PipelineSettings;

/// Header carrying `sha256=<hex>` over the raw request body.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";
const SUBSCRIBE_MODE: &str = "subscribe";

/// Why a request was turned away at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionRejection {
    #[error("webhook signature header is missing")]
    SignatureMissing,
    #[error("webhook signature does not match the request body")]
    SignatureInvalid,
    #[error("webhook verification token does not match")]
    VerifyTokenMismatch,
}

impl AdmissionRejection {
    /// Machine-readable code used in responses and in the rejection log.
    pub fn code(self) -> &'static str {
        match self {
            AdmissionRejection::SignatureMissing => "signature_missing",
            AdmissionRejection::SignatureInvalid => "signature_invalid",
            AdmissionRejection::VerifyTokenMismatch => "verify_token_mismatch",
        }
    }
}

/// A delivery that may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Verified,
    /// No secret is configured yet; the body was not checked.
    UnconfiguredSecret,
}

/// Query parameters of a subscription handshake.
#[derive(Debug, Clone, Default)]
pub struct HandshakeQuery {
    pub mode: Option<String>,
    pub verify_token: Option<String>,
    pub challenge: Option<String>,
}

pub struct AdmissionGate {
    db: Arc<dyn DatabaseService>,
}

impl AdmissionGate {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self { db }
    }

    /// Returns the challenge to echo, or logs and returns the rejection.
    pub async fn check_handshake(
        &self,
        settings: &PipelineSettings,
        source: &str,
        query: &HandshakeQuery,
        ip: Option<&str>,
    ) -> Result<String, AdmissionRejection> {
        match verify_handshake(settings, query) {
            Ok(challenge) => Ok(challenge),
            Err(rejection) => {
                let preview = format!(
                    "hub.mode={}",
                    query.mode.as_deref().unwrap_or_default()
                );
                self.reject(settings, source, rejection, ip, preview.as_bytes())
                    .await;
                Err(rejection)
            }
        }
    }

    /// Checks the signature header against the raw body.
    pub async fn check_delivery(
        &self,
        settings: &PipelineSettings,
        source: &str,
        signature: Option<&str>,
        body: &[u8],
        ip: Option<&str>,
    ) -> Result<Admission, AdmissionRejection> {
        match verify_delivery(settings, signature, body) {
            Ok(Admission::UnconfiguredSecret) => {
                warn!(
                    source,
                    "Webhook app secret is not configured; accepting unsigned delivery."
                );
                Ok(Admission::UnconfiguredSecret)
            }
            Ok(admission) => Ok(admission),
            Err(rejection) => {
                self.reject(settings, source, rejection, ip, body).await;
                Err(rejection)
            }
        }
    }

    async fn reject(
        &self,
        settings: &PipelineSettings,
        source: &str,
        rejection: AdmissionRejection,
        ip: Option<&str>,
        body: &[u8],
    ) {
        warn!(source, reason = rejection.code(), ip = ?ip, "Webhook request rejected.");
        let record = WebhookRejection {
            id: Uuid::new_v4(),
            source: source.to_string(),
            reason: rejection.code().to_string(),
            ip: ip.map(str::to_string),
            body_preview: body_preview(body, settings.body_preview_limit),
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.insert_webhook_rejection(&record).await {
            error!("Failed to store webhook rejection: {:?}", e);
        }
    }
}

//=========================================================================================
// Pure Checks
//=========================================================================================

pub fn verify_handshake(
    settings: &PipelineSettings,
    query: &HandshakeQuery,
) -> Result<String, AdmissionRejection> {
    let expected = settings
        .verify_token
        .as_deref()
        .ok_or(AdmissionRejection::VerifyTokenMismatch)?;
    let provided = query
        .verify_token
        .as_deref()
        .ok_or(AdmissionRejection::VerifyTokenMismatch)?;
    if query.mode.as_deref() != Some(SUBSCRIBE_MODE) || !tokens_match(expected, provided) {
        return Err(AdmissionRejection::VerifyTokenMismatch);
    }
    Ok(query.challenge.clone().unwrap_or_default())
}

pub fn verify_delivery(
    settings: &PipelineSettings,
    signature: Option<&str>,
    body: &[u8],
) -> Result<Admission, AdmissionRejection> {
    let Some(secret) = settings.app_secret.as_deref().filter(|s| !s.is_empty()) else {
        return Ok(Admission::UnconfiguredSecret);
    };
    let header = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(AdmissionRejection::SignatureMissing)?;
    let digest_hex = header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(AdmissionRejection::SignatureInvalid)?;
    let expected = hex::decode(digest_hex).map_err(|_| AdmissionRejection::SignatureInvalid)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| AdmissionRejection::SignatureInvalid)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| AdmissionRejection::SignatureInvalid)?;
    Ok(Admission::Verified)
}

/// Computes the `sha256=<hex>` header value a provider would send for `body`.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Lossy UTF-8 preview of at most `limit` characters.
pub fn body_preview(body: &[u8], limit: usize) -> String {
    String::from_utf8_lossy(body).chars().take(limit).collect()
}

fn tokens_match(expected: &str, provided: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(provided.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
