//! DNS-label-safe unique name generation for disposable clusters.

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// DNS labels cap out at 63 characters (RFC 1123).
const DNS_LABEL_MAX_LEN: usize = 63;

/// Generate a unique, DNS-label-safe name by hashing the current time.
///
/// The result is the first 8 hex characters of a sha256 over the current
/// timestamp, prefixed with `{prefix}-` when a prefix is given. A non-empty
/// prefix that is not a valid RFC 1123 DNS label fails with
/// [`Error::InvalidName`]; callers treat that as fatal, not retryable.
pub fn generate_k8s_name(prefix: &str) -> Result<String> {
    if !prefix.is_empty() {
        validate_dns_label(prefix)?;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(format!("{}.{}", now.as_secs(), now.subsec_nanos()));
    let hash = format!("{:x}", hasher.finalize());
    let short = &hash[..8];

    if prefix.is_empty() {
        Ok(short.to_string())
    } else {
        Ok(format!("{prefix}-{short}"))
    }
}

/// Check that a string is a valid RFC 1123 DNS label: lowercase
/// alphanumerics and `-`, starting and ending alphanumeric, at most 63
/// characters.
fn validate_dns_label(label: &str) -> Result<()> {
    if label.len() > DNS_LABEL_MAX_LEN {
        return Err(Error::invalid_name(format!(
            "'{label}' exceeds {DNS_LABEL_MAX_LEN} characters"
        )));
    }
    let valid_chars = label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = label
        .chars()
        .next()
        .zip(label.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
    if !valid_chars || !valid_edges {
        return Err(Error::invalid_name(format!(
            "'{label}' is not an RFC 1123 compatible identifier"
        )));
    }
    Ok(())
}
