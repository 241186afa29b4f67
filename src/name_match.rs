//! Masked-name verification.
//!
//! Privacy-constrained exports redact parts of a name (`홍*동`). A match-key
//! lookup shortlists customers broadly; this check then accepts only the
//! candidates whose real name fits the visible characters of the mask.

/// Characters treated as "any character" in a masked name.
pub const WILDCARDS: [char; 4] = ['*', '?', 'X', 'x'];

/// True when `masked_input` is a character-for-character fit for `real_name`.
///
/// Both strings must have the same number of characters. Every position must
/// either match exactly or hold a wildcard in `masked_input`. No
/// normalization happens here; callers normalize both sides first.
pub fn is_name_match(real_name: &str, masked_input: &str) -> bool {
    if real_name.is_empty() || masked_input.is_empty() {
        return false;
    }
    if real_name.chars().count() != masked_input.chars().count() {
        return false;
    }
    real_name
        .chars()
        .zip(masked_input.chars())
        .all(|(r, m)| WILDCARDS.contains(&m) || r == m)
}

/// True when the name carries at least one wildcard.
pub fn is_masked(name: &str) -> bool {
    name.chars().any(|c| WILDCARDS.contains(&c))
}
