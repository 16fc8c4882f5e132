//! PKCE verification (RFC 7636)
//!
//! The challenge and method are captured at `/authorize` and copied onto the
//! authorization code. At the token endpoint the presented verifier must
//! reproduce the challenge.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use storage::{PkceChallenge, PkceMethod};
use subtle::ConstantTimeEq;

/// Generate a random code verifier: 32 random bytes as 43 base64url chars.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// 43 to 128 characters from the unreserved set `[A-Za-z0-9-._~]`.
pub fn is_well_formed_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// Check `verifier` against a stored challenge.
pub fn verify(pkce: &PkceChallenge, verifier: &str) -> bool {
    if !is_well_formed_verifier(verifier) {
        return false;
    }
    let derived = match pkce.method {
        PkceMethod::S256 => compute_challenge(verifier),
        PkceMethod::Plain => verifier.to_string(),
    };
    derived.as_bytes().ct_eq(pkce.challenge.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 appendix B
    const RFC_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn challenge_matches_rfc_example() {
        assert_eq!(compute_challenge(RFC_VERIFIER), RFC_CHALLENGE);
    }

    #[test]
    fn s256_accepts_matching_verifier() {
        let pkce = PkceChallenge {
            challenge: RFC_CHALLENGE.into(),
            method: PkceMethod::S256,
        };
        assert!(verify(&pkce, RFC_VERIFIER));
        assert!(!verify(&pkce, &generate_verifier()));
    }

    #[test]
    fn plain_compares_verbatim() {
        let pkce = PkceChallenge {
            challenge: RFC_VERIFIER.into(),
            method: PkceMethod::Plain,
        };
        assert!(verify(&pkce, RFC_VERIFIER));

        // The S256 challenge is not a valid plain verifier for itself
        let swapped = PkceChallenge {
            challenge: RFC_CHALLENGE.into(),
            method: PkceMethod::Plain,
        };
        assert!(!verify(&swapped, RFC_VERIFIER));
    }

    #[test]
    fn malformed_verifiers_are_rejected() {
        assert!(!is_well_formed_verifier("short"));
        assert!(!is_well_formed_verifier(&"a".repeat(129)));
        assert!(!is_well_formed_verifier(&format!("{}+", "a".repeat(43))));
        assert!(is_well_formed_verifier(&"a~.-_".repeat(9)));

        let pkce = PkceChallenge {
            challenge: "short".into(),
            method: PkceMethod::Plain,
        };
        assert!(!verify(&pkce, "short"));
    }

    #[test]
    fn generated_verifiers_are_well_formed_and_unique() {
        let a = generate_verifier();
        assert_eq!(a.len(), 43);
        assert!(is_well_formed_verifier(&a));
        assert_ne!(a, generate_verifier());
    }
}
