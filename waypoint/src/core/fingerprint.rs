//! Failure fingerprints for doom-loop detection.
//!
//! Two iterations fail "identically" when their fingerprints are equal. A
//! fingerprint hashes, for every failed gate in declaration order, the gate
//! name and its output after normalization. Normalization erases the parts of
//! gate output that change between otherwise identical runs: timestamps,
//! durations, hex addresses, and digit runs. Trailing whitespace is trimmed per
//! line.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::core::types::GateResult;

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?")
        .expect("timestamp regex is valid")
});
static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+(\.\d+)?\s?(ns|µs|us|ms|s|sec|secs|seconds)\b")
        .expect("duration regex is valid")
});
static HEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"0x[0-9a-fA-F]+").expect("hex regex is valid")
});
static DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("digits regex is valid"));

/// Normalize gate output so incidental noise does not defeat comparison.
pub fn normalize_output(output: &str) -> String {
    let text = TIMESTAMP_RE.replace_all(output, "<ts>");
    let text = DURATION_RE.replace_all(&text, "<dur>");
    let text = HEX_RE.replace_all(&text, "<hex>");
    let text = DIGITS_RE.replace_all(&text, "<n>");
    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Fingerprint the failures in `results`, or `None` when every gate passed.
pub fn failure_fingerprint(results: &[GateResult]) -> Option<String> {
    let mut hasher = Sha256::new();
    let mut any_failed = false;
    for result in results.iter().filter(|r| !r.passed) {
        any_failed = true;
        hasher.update(result.name.as_bytes());
        hasher.update([0u8]);
        if result.timed_out {
            hasher.update(b"timed_out");
        } else {
            hasher.update(normalize_output(&result.output).as_bytes());
        }
        hasher.update([0xffu8]);
    }
    any_failed.then(|| hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(name: &str, passed: bool, output: &str) -> GateResult {
        GateResult {
            name: name.to_string(),
            passed,
            output: output.to_string(),
            duration_ms: 5,
            timed_out: false,
        }
    }

    #[test]
    fn all_passing_has_no_fingerprint() {
        assert_eq!(failure_fingerprint(&[gate("validate", true, "ok")]), None);
    }

    #[test]
    fn noise_does_not_change_fingerprint() {
        let a = failure_fingerprint(&[gate(
            "validate",
            false,
            "2024-01-01T10:00:00Z error at 0x7ffd1 after 12ms (line 4)  \n",
        )]);
        let b = failure_fingerprint(&[gate(
            "validate",
            false,
            "2025-06-30T23:59:59Z error at 0xdeadbeef after 930ms (line 9)\n",
        )]);
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn different_gate_or_message_changes_fingerprint() {
        let base = failure_fingerprint(&[gate("validate", false, "missing field")]);
        let other_gate = failure_fingerprint(&[gate("dry", false, "missing field")]);
        let other_msg = failure_fingerprint(&[gate("validate", false, "bad type")]);
        assert_ne!(base, other_gate);
        assert_ne!(base, other_msg);
    }

    #[test]
    fn passing_gates_do_not_contribute() {
        let only_fail = failure_fingerprint(&[gate("validate", false, "boom")]);
        let with_pass = failure_fingerprint(&[
            gate("lint", true, "clean"),
            gate("validate", false, "boom"),
        ]);
        assert_eq!(only_fail, with_pass);
    }
}
