//! Stable failure fingerprints.
//!
//! Two workers that hit the same root cause must produce the same fingerprint,
//! so anything that varies between runs (timestamps, addresses, pids, temp
//! paths, counters) is stripped before hashing.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Maximum number of normalized message characters that feed the hash.
pub const MESSAGE_LIMIT: usize = 500;

/// Inputs that identify "the same" failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureShape<'a> {
    pub template: &'a str,
    pub stage: &'a str,
    pub error_class: &'a str,
    pub message: &'a str,
}

static VOLATILE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        // ISO-8601 timestamps with optional fraction and zone.
        (
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            "<ts>",
        ),
        (r"\b\d{2}:\d{2}:\d{2}(?:\.\d+)?\b", "<time>"),
        (
            r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
            "<uuid>",
        ),
        (r"(?i)\b0x[0-9a-f]+\b", "<addr>"),
        (r"(?i)\b[0-9a-f]{12,}\b", "<hex>"),
        (r"(?i)\bpid[ =:]*\d+", "pid <n>"),
        (r"(?:/tmp|/var/folders)/[^\s:'\x22]+", "<tmp>"),
        (r"\d+", "<n>"),
        (r"[ \t]+", " "),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), replacement))
    .collect()
});

/// Strip run-specific noise from an error message and truncate it.
pub fn normalize_message(message: &str) -> String {
    let mut normalized = message.trim().to_string();
    for (pattern, replacement) in VOLATILE.iter() {
        normalized = pattern.replace_all(&normalized, *replacement).into_owned();
    }
    let normalized: String = normalized
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    normalized.chars().take(MESSAGE_LIMIT).collect()
}

/// Compute the fingerprint: 16 hex chars of SHA-256 over the normalized shape.
pub fn fingerprint(shape: &FailureShape<'_>) -> String {
    let mut hasher = Sha256::new();
    for part in [
        shape.template,
        shape.stage,
        shape.error_class,
        &normalize_message(shape.message),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Marker embedded in fix-task descriptions so they can be found by fingerprint.
pub fn description_marker(fingerprint: &str) -> String {
    format!("[fingerprint:{fingerprint}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape<'a>(message: &'a str) -> FailureShape<'a> {
        FailureShape {
            template: "feature-login",
            stage: "test",
            error_class: "exit:1",
            message,
        }
    }

    #[test]
    fn timestamps_and_addresses_do_not_change_fingerprint() {
        let a = "2024-05-01T10:11:12.345Z panic at 0x7ffde0a1 in /tmp/relay-abc/src/a.rs:12";
        let b = "2025-01-09T23:59:01Z panic at 0x55aa01ff in /tmp/relay-xyz/src/a.rs:40";
        assert_eq!(fingerprint(&shape(a)), fingerprint(&shape(b)));
    }

    #[test]
    fn different_error_shapes_differ() {
        let a = fingerprint(&shape("assertion failed: left == right"));
        let b = fingerprint(&shape("connection refused"));
        assert_ne!(a, b);
    }

    #[test]
    fn stage_and_class_are_part_of_identity() {
        let base = shape("boom");
        let other_stage = FailureShape {
            stage: "lint",
            ..base.clone()
        };
        let timeout = FailureShape {
            error_class: "timeout",
            ..base.clone()
        };
        assert_ne!(fingerprint(&base), fingerprint(&other_stage));
        assert_ne!(fingerprint(&base), fingerprint(&timeout));
    }

    #[test]
    fn fingerprint_is_sixteen_hex_chars() {
        let fp = fingerprint(&shape("boom"));
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn normalize_truncates_long_messages() {
        let long = "x".repeat(MESSAGE_LIMIT * 2);
        assert_eq!(normalize_message(&long).chars().count(), MESSAGE_LIMIT);
    }

    #[test]
    fn normalize_collapses_pids_and_uuids() {
        let normalized =
            normalize_message("worker pid=4411 failed job 123e4567-e89b-12d3-a456-426614174000");
        assert_eq!(normalized, "worker pid <n> failed job <uuid>");
    }
}
