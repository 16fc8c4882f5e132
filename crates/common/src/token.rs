//! Opaque bearer identifiers

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;

/// Generate an unguessable identifier: 32 random bytes, base64url without padding.
///
/// Used for authorization request ids, authorization codes and refresh tokens,
/// all of which double as bearer secrets.
pub fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
