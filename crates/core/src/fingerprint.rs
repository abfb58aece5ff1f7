//! Request fingerprinting and prompt similarity.
//!
//! Cache keys must be stable across trivially different spellings of the
//! same request, so prompt text is normalized (lower-cased, whitespace
//! collapsed) before hashing. Fuzzy lookup scores candidates by token-set
//! (Jaccard) similarity over the same normalized form.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize prompt text: lower-case and collapse all whitespace runs to a
/// single space, trimming the ends.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

/// Fingerprint for a (prompt, model) generation request.
///
/// The model identifier participates in the hash so the same prompt against
/// different models never collides.
pub fn prompt_key(prompt: &str, model: &str) -> String {
    let normalized = normalize_prompt(prompt);
    sha256_hex(format!("{normalized}\n{model}").as_bytes())
}

/// Fingerprint for raw media bytes.
pub fn media_key(bytes: &[u8]) -> String {
    sha256_hex(bytes)
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// Token-set Jaccard similarity between two prompts, in `0.0..=1.0`.
///
/// Both prompts are normalized first, so identical prompts (up to case and
/// whitespace) always score exactly `1.0`. Two empty prompts are treated as
/// identical.
pub fn prompt_similarity(a: &str, b: &str) -> f64 {
    let tokens_a = normalize_tokens(a);
    let tokens_b = normalize_tokens(b);

    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }

    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    intersection as f64 / union as f64
}

fn normalize_tokens(prompt: &str) -> HashSet<String> {
    prompt
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
