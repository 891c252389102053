//! Classifies a raw credential string by its GitHub token shape without
//! making any network call.

use secrecy::{ExposeSecret, SecretString};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenShape {
    /// Personal access token, classic or fine-grained.
    Pat,
    /// GitHub App installation access token.
    Installation,
    Unknown,
}

const PAT_CLASSIC_PREFIX: &str = "ghp_";
const PAT_CLASSIC_SUFFIX_LEN: usize = 36;

const PAT_FINE_GRAINED_PREFIX: &str = "github_pat_";
const PAT_FINE_GRAINED_FIRST_SEGMENT_LEN: usize = 22;
const PAT_FINE_GRAINED_SECOND_SEGMENT_LEN: usize = 59;

const INSTALLATION_PREFIX: &str = "ghs_";
const INSTALLATION_SUFFIX_LEN: usize = 36;

/// The only total lengths any recognised shape can produce; used as a cheap
/// fast-path rejection before the per-shape prefix/segment checks run.
const RECOGNISED_LENGTHS: &[usize] = &[
    PAT_CLASSIC_PREFIX.len() + PAT_CLASSIC_SUFFIX_LEN,
    PAT_FINE_GRAINED_PREFIX.len() + PAT_FINE_GRAINED_FIRST_SEGMENT_LEN + 1 + PAT_FINE_GRAINED_SECOND_SEGMENT_LEN,
];

fn is_alphanumeric_ascii(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Pure length-first fast-path rejection, then a constant-shape match against
/// the three recognised forms. A value one character shorter or longer than
/// a recognised shape's exact length, or containing anything but ASCII
/// alphanumerics after the prefix, is rejected rather than sent upstream.
pub fn classify(credential: &SecretString) -> TokenShape {
    let value = credential.expose_secret();

    if !RECOGNISED_LENGTHS.contains(&value.len()) {
        return TokenShape::Unknown;
    }

    if let Some(suffix) = value.strip_prefix(PAT_CLASSIC_PREFIX)
        && suffix.len() == PAT_CLASSIC_SUFFIX_LEN
        && is_alphanumeric_ascii(suffix)
    {
        return TokenShape::Pat;
    }

    if let Some(suffix) = value.strip_prefix(INSTALLATION_PREFIX)
        && suffix.len() == INSTALLATION_SUFFIX_LEN
        && is_alphanumeric_ascii(suffix)
    {
        return TokenShape::Installation;
    }

    if let Some(rest) = value.strip_prefix(PAT_FINE_GRAINED_PREFIX)
        && let Some((first, second)) = rest.split_once('_')
        && first.len() == PAT_FINE_GRAINED_FIRST_SEGMENT_LEN
        && second.len() == PAT_FINE_GRAINED_SECOND_SEGMENT_LEN
        && is_alphanumeric_ascii(first)
        && is_alphanumeric_ascii(second)
    {
        return TokenShape::Pat;
    }

    TokenShape::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    fn classic_pat(suffix_len: usize) -> String {
        format!("ghp_{}", "a".repeat(suffix_len))
    }

    fn fine_grained_pat(first_len: usize, second_len: usize) -> String {
        format!("github_pat_{}_{}", "a".repeat(first_len), "b".repeat(second_len))
    }

    fn installation_token(suffix_len: usize) -> String {
        format!("ghs_{}", "a".repeat(suffix_len))
    }

    #[test]
    fn classifies_classic_pat() {
        assert_eq!(classify(&secret(&classic_pat(36))), TokenShape::Pat);
    }

    #[test]
    fn classifies_fine_grained_pat() {
        assert_eq!(classify(&secret(&fine_grained_pat(22, 59))), TokenShape::Pat);
    }

    #[test]
    fn classifies_installation_token() {
        assert_eq!(classify(&secret(&installation_token(36))), TokenShape::Installation);
    }

    #[test]
    fn classic_pat_boundary_lengths_are_rejected() {
        assert_eq!(classify(&secret(&classic_pat(35))), TokenShape::Unknown);
        assert_eq!(classify(&secret(&classic_pat(37))), TokenShape::Unknown);
    }

    #[test]
    fn installation_token_boundary_lengths_are_rejected() {
        assert_eq!(classify(&secret(&installation_token(35))), TokenShape::Unknown);
        assert_eq!(classify(&secret(&installation_token(37))), TokenShape::Unknown);
    }

    #[test]
    fn fine_grained_pat_boundary_lengths_are_rejected() {
        assert_eq!(classify(&secret(&fine_grained_pat(21, 59))), TokenShape::Unknown);
        assert_eq!(classify(&secret(&fine_grained_pat(23, 59))), TokenShape::Unknown);
        assert_eq!(classify(&secret(&fine_grained_pat(22, 58))), TokenShape::Unknown);
        assert_eq!(classify(&secret(&fine_grained_pat(22, 60))), TokenShape::Unknown);
    }

    #[test]
    fn rejects_non_alphanumeric_suffix() {
        let token = format!("ghp_{}-", "a".repeat(35));
        assert_eq!(classify(&secret(&token)), TokenShape::Unknown);
    }

    #[test]
    fn unrecognized_prefix_is_unknown() {
        let token = format!("sk_{}", "a".repeat(37));
        assert_eq!(classify(&secret(&token)), TokenShape::Unknown);
    }
}
