//! PKCE (RFC 7636) code verifier and challenge generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Unreserved characters permitted in a code verifier (RFC 7636 §4.1).
const VERIFIER_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Verifier length; the RFC allows 43-128 characters.
const VERIFIER_LEN: usize = 64;

/// Generates a random code verifier.
pub fn generate_verifier() -> String {
    let mut rng = rand::thread_rng();
    (0..VERIFIER_LEN)
        .map(|_| VERIFIER_CHARSET[rng.gen_range(0..VERIFIER_CHARSET.len())] as char)
        .collect()
}

/// Derives the S256 code challenge: `base64url(sha256(verifier))`, unpadded.
pub fn challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}
