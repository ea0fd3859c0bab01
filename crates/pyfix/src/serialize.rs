//! Bounded, redacted string forms for runtime values.
//!
//! Every value string that leaves the sandbox flows through [`bounded_repr`]
//! and [`redact_if_sensitive`]:
//! - reprs longer than the cap are truncated and suffixed with the first 8 hex
//!   characters of a SHA-256 fingerprint of the full repr, so change detection
//!   keeps working without retaining the payload;
//! - variables with secret-looking names are replaced wholesale by the
//!   redaction marker.
//!
//! The fingerprint is a cryptographic hash so it is stable across processes.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::types::{MAX_SERIALIZED_LEN, REDACTED};

/// Variable names matching this pattern never leave the engine unredacted.
fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)password|secret|token|passwd").expect("secret pattern is valid")
    })
}

/// `true` if `name` looks like it holds a credential.
pub fn is_sensitive_name(name: &str) -> bool {
    secret_pattern().is_match(name)
}

/// Replace `value` by the redaction marker when `name` is secret-looking.
pub fn redact_if_sensitive(name: &str, value: String) -> String {
    if is_sensitive_name(name) {
        REDACTED.to_string()
    } else {
        value
    }
}

/// Bound `repr` to [`MAX_SERIALIZED_LEN`] bytes.
///
/// Short reprs pass through unchanged. Long reprs are cut at the last char
/// boundary within the budget and suffixed with `...<truncated:xxxxxxxx>`
/// where `xxxxxxxx` is the first 8 hex of `sha256(repr)`.
pub fn bounded_repr(repr: &str) -> String {
    bounded_repr_with(repr, MAX_SERIALIZED_LEN)
}

/// [`bounded_repr`] with an explicit byte budget (test hook).
pub fn bounded_repr_with(repr: &str, max_len: usize) -> String {
    if repr.len() <= max_len {
        return repr.to_string();
    }

    let fingerprint = fingerprint8(repr);
    let suffix = format!("...<truncated:{fingerprint}>");
    let budget = max_len.saturating_sub(suffix.len());

    let mut cut = budget.min(repr.len());
    while cut > 0 && !repr.is_char_boundary(cut) {
        cut -= 1;
    }

    format!("{}{suffix}", &repr[..cut])
}

/// First 8 hex characters of the SHA-256 digest of `text`.
pub fn fingerprint8(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    // 4 bytes render to exactly 8 hex chars.
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Bound an element repr used inside sequence/mapping previews.
pub fn element_repr(repr: &str) -> String {
    const ELEMENT_LEN: usize = 50;
    if repr.len() <= ELEMENT_LEN {
        return repr.to_string();
    }
    let mut cut = ELEMENT_LEN;
    while cut > 0 && !repr.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &repr[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNREPRABLE;

    // ── redaction ────────────────────────────────────────────────────────────

    #[test]
    fn test_sensitive_names_detected_case_insensitive() {
        for name in ["password", "PASSWORD", "api_token", "Secret_key", "passwd"] {
            assert!(is_sensitive_name(name), "'{name}' should be sensitive");
        }
    }

    #[test]
    fn test_ordinary_names_not_sensitive() {
        for name in ["x", "counter", "items", "passthrough_rate"] {
            // "passthrough_rate" does not contain "passwd"/"password".
            assert!(!is_sensitive_name(name), "'{name}' should not be sensitive");
        }
    }

    #[test]
    fn test_redact_replaces_value_entirely() {
        let out = redact_if_sensitive("db_password", "'hunter2'".to_string());
        assert_eq!(out, REDACTED);
    }

    #[test]
    fn test_redact_keeps_ordinary_values() {
        let out = redact_if_sensitive("x", "42".to_string());
        assert_eq!(out, "42");
    }

    // ── bounded repr ─────────────────────────────────────────────────────────

    #[test]
    fn test_short_repr_unchanged() {
        assert_eq!(bounded_repr("[1, 2, 3]"), "[1, 2, 3]");
    }

    #[test]
    fn test_long_repr_truncated_within_budget() {
        let long = "x".repeat(1000);
        let out = bounded_repr(&long);
        assert!(out.len() <= MAX_SERIALIZED_LEN, "len = {}", out.len());
        assert!(out.contains("<truncated:"), "got: {out}");
    }

    #[test]
    fn test_fingerprint_stable_and_distinct() {
        let a = "y".repeat(500);
        let b = "z".repeat(500);
        let fp_a1 = fingerprint8(&a);
        let fp_a2 = fingerprint8(&a);
        let fp_b = fingerprint8(&b);
        assert_eq!(fp_a1, fp_a2);
        assert_ne!(fp_a1, fp_b);
        assert_eq!(fp_a1.len(), 8);
    }

    #[test]
    fn test_truncation_distinguishes_different_payloads() {
        // Same prefix, different tails: the fingerprint must differ so change
        // detection still fires.
        let mut a = "p".repeat(300);
        let mut b = a.clone();
        a.push('1');
        b.push('2');
        assert_ne!(bounded_repr(&a), bounded_repr(&b));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long = "é".repeat(300);
        let out = bounded_repr(&long);
        assert!(out.len() <= MAX_SERIALIZED_LEN);
        // Must not panic and must still carry the fingerprint suffix.
        assert!(out.contains("<truncated:"));
    }

    #[test]
    fn test_element_repr_caps_at_50() {
        let long = "a".repeat(200);
        let out = element_repr(&long);
        assert!(out.len() <= 53); // 50 + "..."
        assert!(out.ends_with("..."));
        assert_eq!(element_repr("short"), "short");
    }

    #[test]
    fn test_unreprable_marker_is_short() {
        assert!(UNREPRABLE.len() <= MAX_SERIALIZED_LEN);
    }
}
