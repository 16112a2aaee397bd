//! # Signature Verification
//!
//! Validates inbound webhook payloads against a shared secret using the
//! provider's signature convention.
//!
//! | Scheme | Header value | Used by |
//! |--------|--------------|---------|
//! | [`SignatureEncoding::BareHex`] | `<hex>` | Linear, PagerDuty-style |
//! | [`SignatureEncoding::Prefixed`] | `sha256=<hex>` | GitHub, Stripe-style |
//! | [`SignatureEncoding::Versioned`] | `v1=<hex>[,v1=<hex>...]` | CircleCI |
//! | [`SignatureAlgorithm::BearerToken`] | `<secret>` | Token-only providers |
//!
//! All digest comparisons are constant time.
//!
//! # Examples
//!
//! ```rust
//! use hook_keeper_core::signature::{verify, SignatureScheme};
//! use hook_keeper_core::WebhookSecret;
//!
//! let secret = WebhookSecret::from_string("s3cret".to_string());
//! let scheme = SignatureScheme::circleci();
//! let result = verify(Some(&secret), b"{}", Some("v1=00"), &scheme);
//! assert!(result.is_err());
//! ```

use crate::WebhookSecret;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

// ============================================================================
// Scheme configuration
// ============================================================================

/// Algorithm used to sign webhook payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    /// HMAC-SHA256 over the raw body.
    HmacSha256,

    /// HMAC-SHA1 over the raw body, for legacy providers.
    HmacSha1,

    /// The header carries the secret itself.
    BearerToken,
}

/// How the digest is encoded in the signature header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SignatureEncoding {
    /// Lowercase or uppercase hex digest with nothing around it.
    BareHex,

    /// Hex digest after a fixed prefix such as `sha256=`.
    ///
    /// A header without the prefix is still accepted as bare hex.
    Prefixed { prefix: String },

    /// Comma-separated `version=hex` pairs; any entry for `version` may match.
    Versioned { version: String },
}

/// A provider's complete signature convention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureScheme {
    /// Header carrying the signature (matched case-insensitively).
    pub header: String,

    pub algorithm: SignatureAlgorithm,

    #[serde(default = "default_encoding")]
    pub encoding: SignatureEncoding,
}

fn default_encoding() -> SignatureEncoding {
    SignatureEncoding::BareHex
}

impl SignatureScheme {
    /// Bare hex HMAC-SHA256 in the given header
    pub fn bare_hex(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            algorithm: SignatureAlgorithm::HmacSha256,
            encoding: SignatureEncoding::BareHex,
        }
    }

    /// `sha256=<hex>` in `X-Hub-Signature-256`
    pub fn github() -> Self {
        Self {
            header: "x-hub-signature-256".to_string(),
            algorithm: SignatureAlgorithm::HmacSha256,
            encoding: SignatureEncoding::Prefixed {
                prefix: "sha256=".to_string(),
            },
        }
    }

    /// `v1=<hex>` in `Circleci-Signature`
    pub fn circleci() -> Self {
        Self {
            header: "circleci-signature".to_string(),
            algorithm: SignatureAlgorithm::HmacSha256,
            encoding: SignatureEncoding::Versioned {
                version: "v1".to_string(),
            },
        }
    }

    /// Bare hex HMAC-SHA256 in `Linear-Signature`
    pub fn linear() -> Self {
        Self::bare_hex("linear-signature")
    }

    /// The secret itself in the given header
    pub fn bearer(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            algorithm: SignatureAlgorithm::BearerToken,
            encoding: SignatureEncoding::BareHex,
        }
    }

    /// Header name normalized for lookups in lowercased header maps
    pub fn header_key(&self) -> String {
        self.header.to_ascii_lowercase()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Reasons an inbound payload fails verification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Signature header '{header}' is missing")]
    SignatureMissing { header: String },

    #[error("Signature is invalid: {reason}")]
    SignatureInvalid { reason: String },

    #[error("No webhook secret is provisioned for this subscription yet")]
    SecretUnavailable,
}

impl SignatureError {
    /// Get error category for monitoring
    pub fn error_category(&self) -> crate::ErrorCategory {
        match self {
            Self::SignatureMissing { .. } => crate::ErrorCategory::Security,
            Self::SignatureInvalid { .. } => crate::ErrorCategory::Security,
            Self::SecretUnavailable => crate::ErrorCategory::Transient,
        }
    }

    fn invalid(reason: &str) -> Self {
        Self::SignatureInvalid {
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Verification
// ============================================================================

/// Verify `provided_signature` over `raw_body` with `secret`
///
/// # Errors
///
/// - [`SignatureError::SecretUnavailable`] when `secret` is `None` or empty
/// - [`SignatureError::SignatureMissing`] when the header value is absent or blank
/// - [`SignatureError::SignatureInvalid`] when the value cannot be decoded or
///   does not match the computed digest
pub fn verify(
    secret: Option<&WebhookSecret>,
    raw_body: &[u8],
    provided_signature: Option<&str>,
    scheme: &SignatureScheme,
) -> Result<(), SignatureError> {
    let secret = match secret {
        Some(s) if !s.is_empty() => s,
        _ => return Err(SignatureError::SecretUnavailable),
    };

    let provided = match provided_signature.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => {
            return Err(SignatureError::SignatureMissing {
                header: scheme.header.clone(),
            })
        }
    };

    if scheme.algorithm == SignatureAlgorithm::BearerToken {
        let matches: bool = provided.as_bytes().ct_eq(secret.expose_bytes()).into();
        return if matches {
            Ok(())
        } else {
            Err(SignatureError::invalid("bearer token mismatch"))
        };
    }

    let candidates = digest_candidates(provided, &scheme.encoding)?;

    let mut decoded_any = false;
    for candidate in candidates {
        let Ok(digest) = hex::decode(candidate) else {
            continue;
        };
        decoded_any = true;

        if digest_matches(scheme.algorithm, secret, raw_body, &digest)? {
            return Ok(());
        }
    }

    if decoded_any {
        Err(SignatureError::invalid("digest mismatch"))
    } else {
        Err(SignatureError::invalid("signature is not valid hex"))
    }
}

/// Extract the hex digests a header value offers under `encoding`.
fn digest_candidates<'a>(
    provided: &'a str,
    encoding: &SignatureEncoding,
) -> Result<Vec<&'a str>, SignatureError> {
    match encoding {
        SignatureEncoding::BareHex => Ok(vec![provided]),
        SignatureEncoding::Prefixed { prefix } => {
            Ok(vec![provided.strip_prefix(prefix.as_str()).unwrap_or(provided)])
        }
        SignatureEncoding::Versioned { version } => {
            let entries: Vec<&str> = provided
                .split(',')
                .filter_map(|entry| entry.trim().split_once('='))
                .filter(|(key, _)| key.trim() == version)
                .map(|(_, digest)| digest.trim())
                .collect();

            if entries.is_empty() {
                return Err(SignatureError::SignatureInvalid {
                    reason: format!("no '{}' signature present", version),
                });
            }
            Ok(entries)
        }
    }
}

fn digest_matches(
    algorithm: SignatureAlgorithm,
    secret: &WebhookSecret,
    raw_body: &[u8],
    digest: &[u8],
) -> Result<bool, SignatureError> {
    match algorithm {
        SignatureAlgorithm::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(secret.expose_bytes())
                .map_err(|_| SignatureError::invalid("secret cannot be used as HMAC key"))?;
            mac.update(raw_body);
            Ok(mac.verify_slice(digest).is_ok())
        }
        SignatureAlgorithm::HmacSha1 => {
            let mut mac = HmacSha1::new_from_slice(secret.expose_bytes())
                .map_err(|_| SignatureError::invalid("secret cannot be used as HMAC key"))?;
            mac.update(raw_body);
            Ok(mac.verify_slice(digest).is_ok())
        }
        SignatureAlgorithm::BearerToken => Ok(false),
    }
}

/// Compute the hex HMAC-SHA256 of `raw_body`
///
/// Used by tests and by tooling that replays signed deliveries.
pub fn sign_hmac_sha256(secret: &WebhookSecret, raw_body: &[u8]) -> String {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.expose_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;
