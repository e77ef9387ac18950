//! Content fingerprint used to recognize the same email under a different transport id.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Body characters that contribute to the fingerprint.
pub const FINGERPRINT_BODY_CHARS: usize = 500;

/// SHA-256 hex digest of `from|subject|date|body[..500]`. Missing parts hash as empty.
pub fn fingerprint(
    original_from: Option<&str>,
    original_subject: Option<&str>,
    original_date: Option<DateTime<Utc>>,
    body: &str,
) -> String {
    let date = original_date
        .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();
    let body_prefix: String = body.chars().take(FINGERPRINT_BODY_CHARS).collect();

    let input = [
        original_from.unwrap_or_default(),
        original_subject.unwrap_or_default(),
        date.as_str(),
        body_prefix.as_str(),
    ]
    .join("|");

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
