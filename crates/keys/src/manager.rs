//! Key rotation, signing and verification

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use storage::{Keys, PublicJwk, Storage, Updater, VerificationKey};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::material;

/// Conditional writes of the key set are retried this many times before the
/// conflict is reported.
const MAX_ROTATION_ATTEMPTS: usize = 5;

/// How often keys rotate and how long rotated keys must stay verifiable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub rotation_frequency: Duration,
    /// Lifetime of the longest-lived token signed with a key. A rotated key
    /// is retained for at least this long.
    pub id_token_valid_for: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            rotation_frequency: Duration::from_secs(6 * 60 * 60),
            id_token_valid_for: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Outcome of a rotation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    Rotated { key_id: String },
    /// The current key is still within its rotation period, or another
    /// instance rotated first.
    NotDue,
}

/// Public key set as served on the JWKS endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<PublicJwk>,
}

/// Decoded, ready-to-use form of the stored key set.
#[derive(Default)]
struct LoadedKeys {
    /// The stored record this snapshot was decoded from
    source: Keys,
    signing: Option<(String, EncodingKey)>,
    verifying: HashMap<String, DecodingKey>,
    jwks: Vec<PublicJwk>,
}

impl LoadedKeys {
    fn from_keys(keys: &Keys) -> Result<Self> {
        let mut loaded = LoadedKeys {
            source: keys.clone(),
            ..Default::default()
        };
        if let Some(signing) = &keys.signing_key {
            loaded.signing = Some((signing.key_id.clone(), material::encoding_key(signing)?));
            loaded.verifying.insert(
                signing.key_id.clone(),
                material::decoding_key(&signing.public_key)?,
            );
            loaded.jwks.push(signing.public_key.clone());
        }
        for retained in &keys.verification_keys {
            loaded.verifying.insert(
                retained.public_key.kid.clone(),
                material::decoding_key(&retained.public_key)?,
            );
            loaded.jwks.push(retained.public_key.clone());
        }
        Ok(loaded)
    }
}

fn rotation_due(keys: &Keys, now: DateTime<Utc>) -> bool {
    keys.signing_key.is_none() || keys.next_rotation.is_none_or(|next| now >= next)
}

fn chrono_duration(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::KeyGeneration(format!("rotation period out of range: {e}")))
}

/// Owns the signing key set.
///
/// Readers clone the current `Arc<LoadedKeys>` and never wait on a rotation
/// in progress; rotation replaces the snapshot once the store write landed.
pub struct KeyManager {
    storage: Arc<dyn Storage>,
    policy: RotationPolicy,
    snapshot: RwLock<Arc<LoadedKeys>>,
}

impl KeyManager {
    pub fn new(storage: Arc<dyn Storage>, policy: RotationPolicy) -> Self {
        Self {
            storage,
            policy,
            snapshot: RwLock::new(Arc::new(LoadedKeys::default())),
        }
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// Reload the key set from the store.
    pub async fn load(&self) -> Result<()> {
        let keys = self.storage.get_keys().await?;
        self.install(&keys).await?;
        Ok(())
    }

    async fn install(&self, keys: &Keys) -> Result<Arc<LoadedKeys>> {
        let loaded = Arc::new(LoadedKeys::from_keys(keys)?);
        *self.snapshot.write().await = loaded.clone();
        Ok(loaded)
    }

    async fn current(&self) -> Arc<LoadedKeys> {
        self.snapshot.read().await.clone()
    }

    /// Snapshot matching the stored key set. Another instance may have
    /// rotated since this one last looked; the snapshot is only re-decoded
    /// when the record changed.
    async fn synced(&self) -> Result<Arc<LoadedKeys>> {
        let keys = self.storage.get_keys().await?;
        let loaded = self.current().await;
        if loaded.source == keys {
            return Ok(loaded);
        }
        debug!(
            key_id = ?keys.signing_key.as_ref().map(|k| &k.key_id),
            "stored key set changed, reloading"
        );
        self.install(&keys).await
    }

    pub async fn rotate(&self) -> Result<Rotation> {
        self.rotate_at(Utc::now()).await
    }

    /// Rotate if the current key's period has ended at `now`.
    ///
    /// The new key is generated before the store is touched. The updater
    /// re-checks whether rotation is still due, so two instances racing on
    /// the same period produce exactly one new key.
    pub async fn rotate_at(&self, now: DateTime<Utc>) -> Result<Rotation> {
        let keys = self.storage.get_keys().await?;
        if !rotation_due(&keys, now) {
            self.install(&keys).await?;
            return Ok(Rotation::NotDue);
        }

        let fresh = material::generate(now)?;
        let key_id = fresh.key_id.clone();
        let frequency = chrono_duration(self.policy.rotation_frequency)?;
        let retain_for = chrono_duration(self.policy.id_token_valid_for)?;

        let mut attempts = 0;
        let stored = loop {
            attempts += 1;
            let fresh = fresh.clone();
            let updater: Updater<Keys> = Box::new(move |mut keys: Keys| {
                if !rotation_due(&keys, now) {
                    return Err(storage::Error::Rejected("keys already rotated".into()));
                }
                keys.verification_keys.retain(|k| k.expiry > now);
                if let Some(previous) = keys.signing_key.take() {
                    keys.verification_keys.push(VerificationKey {
                        public_key: previous.public_key,
                        expiry: now + retain_for,
                    });
                }
                keys.signing_key = Some(fresh);
                keys.next_rotation = Some(now + frequency);
                Ok(keys)
            });

            match self.storage.update_keys(updater).await {
                Ok(keys) => break keys,
                Err(storage::Error::Rejected(_)) => {
                    debug!("signing key already rotated by another instance");
                    self.load().await?;
                    return Ok(Rotation::NotDue);
                }
                Err(storage::Error::UpdateConflict(_)) if attempts < MAX_ROTATION_ATTEMPTS => {
                    debug!(attempts, "key set update conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.install(&stored).await?;
        info!(
            key_id = %key_id,
            retained = stored.verification_keys.len(),
            next_rotation = ?stored.next_rotation,
            "rotated signing key"
        );
        metrics::counter!("idbridge_key_rotations_total", "outcome" => "rotated").increment(1);
        Ok(Rotation::Rotated { key_id })
    }

    /// Sign `claims` as a compact JWS with the current key.
    ///
    /// Returns the token and the id of the key that signed it. The stored
    /// key set is checked first so that a key demoted by another instance is
    /// never used. If no key exists yet, one rotation runs inline first.
    pub async fn sign<T: Serialize>(&self, claims: &T) -> Result<(String, String)> {
        let mut loaded = self.synced().await?;
        if loaded.signing.is_none() {
            self.rotate().await?;
            loaded = self.current().await;
        }
        let (key_id, key) = loaded.signing.as_ref().ok_or(Error::NoSigningKey)?;

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(key_id.clone());
        let token = jsonwebtoken::encode(&header, claims, key)
            .map_err(|e| Error::Signing(e.to_string()))?;
        Ok((token, key_id.clone()))
    }

    /// Verify a token signed by this bridge and decode its claims.
    ///
    /// An unknown key id triggers one reload from the store, since another
    /// instance may have rotated.
    pub async fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| Error::Malformed(e.to_string()))?;
        let key_id = header
            .kid
            .ok_or_else(|| Error::Malformed("missing kid header".into()))?;

        let key = match self.current().await.verifying.get(&key_id).cloned() {
            Some(key) => key,
            None => {
                self.load().await?;
                self.current()
                    .await
                    .verifying
                    .get(&key_id)
                    .cloned()
                    .ok_or_else(|| Error::UnknownKey(key_id.clone()))?
            }
        };

        let mut validation = Validation::new(Algorithm::ES256);
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        jsonwebtoken::decode::<T>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => Error::Expired,
                ErrorKind::InvalidSignature => Error::InvalidSignature,
                _ => Error::Malformed(e.to_string()),
            })
    }

    /// Public keys of the current and all retained keys, as stored.
    pub async fn jwks(&self) -> Result<JwkSet> {
        Ok(JwkSet {
            keys: self.synced().await?.jwks.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemStorage;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestClaims {
        sub: String,
        exp: i64,
    }

    fn claims(sub: &str) -> TestClaims {
        TestClaims {
            sub: sub.into(),
            exp: (Utc::now() + chrono::Duration::hours(1)).timestamp(),
        }
    }

    fn manager(storage: Arc<dyn Storage>) -> KeyManager {
        KeyManager::new(storage, RotationPolicy::default())
    }

    #[tokio::test]
    async fn first_sign_creates_a_key() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let keys = manager(storage.clone());

        let (token, key_id) = keys.sign(&claims("alice")).await.unwrap();
        let stored = storage.get_keys().await.unwrap();
        assert_eq!(stored.signing_key.unwrap().key_id, key_id);

        let decoded: TestClaims = keys.verify(&token).await.unwrap();
        assert_eq!(decoded.sub, "alice");
    }

    #[tokio::test]
    async fn rotation_before_period_end_is_a_no_op() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let keys = manager(storage.clone());
        let t0 = Utc::now();

        let first = keys.rotate_at(t0).await.unwrap();
        assert!(matches!(first, Rotation::Rotated { .. }));
        let again = keys.rotate_at(t0 + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(again, Rotation::NotDue);
        assert!(storage.get_keys().await.unwrap().verification_keys.is_empty());
    }

    #[tokio::test]
    async fn rotated_key_verifies_until_retention_ends() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let keys = manager(storage.clone());
        let t0 = Utc::now();

        keys.rotate_at(t0).await.unwrap();
        let (old_token, old_kid) = keys.sign(&claims("before")).await.unwrap();

        // Next period: the old key is demoted but still verifies.
        let rotated = keys.rotate_at(t0 + chrono::Duration::hours(6)).await.unwrap();
        let Rotation::Rotated { key_id: new_kid } = rotated else {
            panic!("expected rotation, got {rotated:?}");
        };
        assert_ne!(old_kid, new_kid);
        let decoded: TestClaims = keys.verify(&old_token).await.unwrap();
        assert_eq!(decoded.sub, "before");

        // New tokens are never signed with the retired key.
        let (new_token, signed_by) = keys.sign(&claims("after")).await.unwrap();
        assert_eq!(signed_by, new_kid);
        assert!(keys.jwks().await.unwrap().keys.iter().any(|k| k.kid == old_kid));

        // Old key expires at t0+6h+24h; a rotation after that prunes it.
        keys.rotate_at(t0 + chrono::Duration::hours(36)).await.unwrap();
        assert!(matches!(
            keys.verify::<TestClaims>(&old_token).await,
            Err(Error::UnknownKey(kid)) if kid == old_kid
        ));
        assert!(keys.verify::<TestClaims>(&new_token).await.is_ok());
    }

    #[tokio::test]
    async fn racing_instances_rotate_once() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let a = manager(storage.clone());
        let b = manager(storage.clone());
        let now = Utc::now();

        let (ra, rb) = tokio::join!(a.rotate_at(now), b.rotate_at(now));
        let outcomes = [ra.unwrap(), rb.unwrap()];
        let rotated = outcomes
            .iter()
            .filter(|o| matches!(o, Rotation::Rotated { .. }))
            .count();
        assert_eq!(rotated, 1, "outcomes: {outcomes:?}");

        let (_, kid_a) = a.sign(&claims("a")).await.unwrap();
        let (_, kid_b) = b.sign(&claims("b")).await.unwrap();
        assert_eq!(kid_a, kid_b);
    }

    #[tokio::test]
    async fn signing_follows_rotation_by_another_instance() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let a = manager(storage.clone());
        let b = manager(storage.clone());
        let t0 = Utc::now();

        a.rotate_at(t0).await.unwrap();
        let (_, first_kid) = a.sign(&claims("before")).await.unwrap();

        // `b` rotates past the period while `a` still holds the old snapshot.
        let rotated = b.rotate_at(t0 + chrono::Duration::hours(7)).await.unwrap();
        let Rotation::Rotated { key_id: second_kid } = rotated else {
            panic!("expected rotation, got {rotated:?}");
        };

        let (token, signed_by) = a.sign(&claims("after")).await.unwrap();
        assert_eq!(signed_by, second_kid);
        assert_eq!(
            storage.get_keys().await.unwrap().signing_key.unwrap().key_id,
            signed_by
        );

        let published: Vec<String> = a
            .jwks()
            .await
            .unwrap()
            .keys
            .into_iter()
            .map(|k| k.kid)
            .collect();
        assert!(published.contains(&first_kid), "{published:?}");
        assert!(published.contains(&second_kid), "{published:?}");

        let decoded: TestClaims = b.verify(&token).await.unwrap();
        assert_eq!(decoded.sub, "after");
    }

    #[tokio::test]
    async fn other_instance_rotation_is_picked_up_on_verify() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let signer = manager(storage.clone());
        let verifier = manager(storage.clone());

        let (token, _) = signer.sign(&claims("carol")).await.unwrap();
        let decoded: TestClaims = verifier.verify(&token).await.unwrap();
        assert_eq!(decoded.sub, "carol");
    }

    #[tokio::test]
    async fn foreign_key_is_unknown() {
        let ours = manager(Arc::new(MemStorage::new()));
        let theirs = manager(Arc::new(MemStorage::new()));
        ours.rotate().await.unwrap();

        let (token, kid) = theirs.sign(&claims("mallory")).await.unwrap();
        assert!(matches!(
            ours.verify::<TestClaims>(&token).await,
            Err(Error::UnknownKey(k)) if k == kid
        ));
    }

    #[tokio::test]
    async fn spliced_signature_is_invalid() {
        let keys = manager(Arc::new(MemStorage::new()));
        let (first, _) = keys.sign(&claims("alice")).await.unwrap();
        let (second, _) = keys.sign(&claims("admin")).await.unwrap();

        let signature = second.rsplit('.').next().unwrap();
        let prefix = first.rsplit_once('.').unwrap().0;
        let forged = format!("{prefix}.{signature}");
        assert!(matches!(
            keys.verify::<TestClaims>(&forged).await,
            Err(Error::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let keys = manager(Arc::new(MemStorage::new()));
        let stale = TestClaims {
            sub: "alice".into(),
            exp: (Utc::now() - chrono::Duration::hours(1)).timestamp(),
        };
        let (token, _) = keys.sign(&stale).await.unwrap();
        assert!(matches!(
            keys.verify::<TestClaims>(&token).await,
            Err(Error::Expired)
        ));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let keys = manager(Arc::new(MemStorage::new()));
        assert!(matches!(
            keys.verify::<TestClaims>("not-a-jwt").await,
            Err(Error::Malformed(_))
        ));
    }
}
