//! ES256 key generation and conversion
//!
//! Keys are generated with `ring` and stored as PKCS#8 DER. The same DER is
//! what `jsonwebtoken` expects for EC signing keys; verification keys are
//! built from the JWK's affine coordinates.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair};
use storage::{PublicJwk, SigningKey};

use crate::error::{Error, Result};

pub const ALGORITHM: &str = "ES256";

/// Uncompressed SEC1 point: 0x04 || x (32 bytes) || y (32 bytes)
const P256_POINT_LEN: usize = 65;

/// Generate a fresh P-256 signing key, valid from `now`.
pub fn generate(now: DateTime<Utc>) -> Result<SigningKey> {
    let rng = SystemRandom::new();
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
        .map_err(|_| Error::KeyGeneration("generating P-256 key pair".into()))?;
    let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
        .map_err(|_| Error::KeyGeneration("parsing generated key pair".into()))?;

    let point = pair.public_key().as_ref();
    if point.len() != P256_POINT_LEN || point[0] != 0x04 {
        return Err(Error::KeyGeneration(
            "unexpected public key encoding".into(),
        ));
    }

    let key_id = uuid::Uuid::new_v4().as_simple().to_string();
    Ok(SigningKey {
        key_id: key_id.clone(),
        algorithm: ALGORITHM.into(),
        private_key: URL_SAFE_NO_PAD.encode(pkcs8.as_ref()),
        public_key: PublicJwk {
            kty: "EC".into(),
            crv: "P-256".into(),
            x: URL_SAFE_NO_PAD.encode(&point[1..33]),
            y: URL_SAFE_NO_PAD.encode(&point[33..]),
            kid: key_id,
            alg: ALGORITHM.into(),
            key_use: "sig".into(),
        },
        not_before: now,
    })
}

pub(crate) fn encoding_key(key: &SigningKey) -> Result<EncodingKey> {
    let der = URL_SAFE_NO_PAD
        .decode(&key.private_key)
        .map_err(|e| Error::KeyMaterial(format!("signing key {}: {e}", key.key_id)))?;
    Ok(EncodingKey::from_ec_der(&der))
}

pub(crate) fn decoding_key(jwk: &PublicJwk) -> Result<DecodingKey> {
    DecodingKey::from_ec_components(&jwk.x, &jwk.y)
        .map_err(|e| Error::KeyMaterial(format!("verification key {}: {e}", jwk.kid)))
}
