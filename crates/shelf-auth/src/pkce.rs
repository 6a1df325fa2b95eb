//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! Generates the code verifier, its S256 challenge and the anti-CSRF state
//! token, and assembles the server's OpenID authorization URL. The verifier
//! is kept in the credential vault for the duration of one browser round
//! trip; only the challenge leaves the device before the code exchange.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::constants::AUTHORIZE_PATH;
use crate::http::endpoint;

/// Length of every generated verifier, in characters.
pub const VERIFIER_LEN: usize = 64;

/// 48 random bytes encode to exactly 64 base64url characters.
const VERIFIER_BYTES: usize = VERIFIER_LEN / 4 * 3;

/// A verifier and the challenge derived from it.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: Secret<String>,
    pub challenge: String,
}

/// Generate a fresh verifier/challenge pair.
pub fn generate() -> PkcePair {
    let verifier = generate_verifier();
    let challenge = compute_challenge(&verifier);
    PkcePair {
        verifier: Secret::new(verifier),
        challenge,
    }
}

/// Generate a 64-character URL-safe verifier from the thread-local CSPRNG.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `challenge = BASE64URL(SHA256(verifier))`, unpadded.
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate the opaque `state` value round-tripped through the redirect.
pub fn generate_state() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Build `{server}/auth/openid?redirect_uri=..&state=..&code_challenge=..&code_challenge_method=S256`.
pub fn build_authorization_url(
    server_url: &str,
    redirect_uri: &str,
    state: &str,
    challenge: &str,
) -> String {
    format!(
        "{}?redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        endpoint(server_url, AUTHORIZE_PATH),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(challenge),
    )
}
