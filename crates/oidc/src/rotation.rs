//! Refresh token rotation and reuse detection
//!
//! Every successful refresh retires the presented token and issues a
//! successor in the same family. A retired token presented again means the
//! token leaked or two parties race with it; the configured `ReusePolicy`
//! decides what gets revoked before the caller sees `invalid_grant`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Deadline;
use futures::TryStreamExt;
use serde::Deserialize;
use storage::{RefreshToken, Storage, Updater};
use tracing::{info, warn};

use crate::config::expiry_after;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReusePolicy {
    /// Delete every token in the family
    #[default]
    RevokeFamily,
    /// Delete only the successor issued to the losing request
    RevokeToken,
}

/// How long a retired token is kept so that replaying it is still detected.
pub const DEFAULT_RETIRED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub reuse: ReusePolicy,
    /// Maximum age of a family, measured from the code exchange
    pub absolute_lifetime: Option<Duration>,
    /// Maximum time a token may sit unused
    pub valid_if_not_used_for: Option<Duration>,
    /// Reuse-detection window. A retired token expires this long after its
    /// retirement (or with its family, if sooner) and is then collected.
    pub retired_retention: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            reuse: ReusePolicy::default(),
            absolute_lifetime: None,
            valid_if_not_used_for: None,
            retired_retention: DEFAULT_RETIRED_RETENTION,
        }
    }
}

impl RefreshPolicy {
    /// Hard expiry of a family born at `created_at`.
    pub fn family_expiry(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.absolute_lifetime
            .map(|lifetime| expiry_after(created_at, lifetime))
    }

    /// Reject a token that outlived either lifetime.
    pub fn check_lifetime(&self, token: &RefreshToken, now: DateTime<Utc>) -> Result<()> {
        if token.expiry.is_some_and(|expiry| expiry <= now) {
            return Err(Error::InvalidGrant("refresh token expired".into()));
        }
        let idle = self
            .valid_if_not_used_for
            .is_some_and(|idle| expiry_after(token.last_used, idle) <= now);
        if idle {
            return Err(Error::InvalidGrant(
                "refresh token expired from inactivity".into(),
            ));
        }
        Ok(())
    }

    /// Updater that retires a token, refusing if it already is retired.
    pub(crate) fn retire(&self, now: DateTime<Utc>) -> Updater<RefreshToken> {
        let cutoff = expiry_after(now, self.retired_retention);
        Box::new(move |mut token| {
            if token.retired {
                return Err(storage::Error::Rejected(
                    "refresh token already retired".into(),
                ));
            }
            token.retired = true;
            token.last_used = now;
            token.expiry = Some(token.expiry.map_or(cutoff, |family| family.min(cutoff)));
            Ok(token)
        })
    }

    /// Apply the reuse policy for `token` and return the error to report.
    ///
    /// `successor` is the token minted by a request that lost the retire race;
    /// a replay of an already retired token has none.
    pub(crate) async fn on_reuse(
        &self,
        storage: &Arc<dyn Storage>,
        token: &RefreshToken,
        successor: Option<&str>,
        deadline: Deadline,
    ) -> Error {
        metrics::counter!("idbridge_refresh_reuse_detected_total").increment(1);
        warn!(
            client_id = %token.client_id,
            family = %token.family,
            policy = ?self.reuse,
            "refresh token reuse detected"
        );

        let revoked = match self.reuse {
            ReusePolicy::RevokeFamily => revoke_family(storage, &token.family, deadline).await,
            ReusePolicy::RevokeToken => match successor {
                Some(id) => delete_token(storage, id, deadline).await.map(usize::from),
                None => Ok(0),
            },
        };
        match revoked {
            Ok(count) => {
                info!(family = %token.family, revoked = count, "revoked refresh tokens");
                Error::InvalidGrant("refresh token has already been used".into())
            }
            Err(e) => e,
        }
    }
}

/// Delete every refresh token of `family`. Returns how many were removed.
///
/// A refresh that was in flight when the family was listed can still land
/// its successor, so the family is listed again until a pass finds nothing.
pub async fn revoke_family(
    storage: &Arc<dyn Storage>,
    family: &str,
    deadline: Deadline,
) -> Result<usize> {
    let mut revoked = 0;
    loop {
        let ids: Vec<String> = deadline
            .run(
                storage
                    .list_refresh_tokens()
                    .try_filter(|token| futures::future::ready(token.family == family))
                    .map_ok(|token| token.id)
                    .try_collect(),
            )
            .await??;
        if ids.is_empty() {
            return Ok(revoked);
        }
        for id in ids {
            if delete_token(storage, &id, deadline).await? {
                revoked += 1;
            }
        }
    }
}

/// Delete one token; `false` if it was already gone.
async fn delete_token(storage: &Arc<dyn Storage>, id: &str, deadline: Deadline) -> Result<bool> {
    match deadline.run(storage.delete_refresh_token(id)).await? {
        Ok(()) => Ok(true),
        Err(storage::Error::NotFound(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{ConnectorData, Identity, MemStorage};

    fn token(id: &str, family: &str) -> RefreshToken {
        let now = Utc::now();
        RefreshToken {
            id: id.into(),
            client_id: "app".into(),
            connector_id: "mock".into(),
            identity: Identity::default(),
            connector_data: ConnectorData::default(),
            scopes: vec!["openid".into(), "offline_access".into()],
            nonce: None,
            family: family.into(),
            created_at: now,
            last_used: now,
            retired: false,
            expiry: None,
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[test]
    fn lifetimes_are_enforced() {
        let now = Utc::now();
        let policy = RefreshPolicy {
            absolute_lifetime: Some(Duration::from_secs(3600)),
            valid_if_not_used_for: Some(Duration::from_secs(600)),
            ..Default::default()
        };

        let mut fresh = token("a", "f");
        fresh.expiry = policy.family_expiry(now);
        assert!(policy.check_lifetime(&fresh, now).is_ok());

        let mut idle = fresh.clone();
        idle.last_used = now - chrono::Duration::seconds(601);
        assert!(matches!(
            policy.check_lifetime(&idle, now),
            Err(Error::InvalidGrant(_))
        ));

        let mut old = fresh.clone();
        old.expiry = Some(now - chrono::Duration::seconds(1));
        assert!(matches!(
            policy.check_lifetime(&old, now),
            Err(Error::InvalidGrant(_))
        ));
    }

    #[test]
    fn no_limits_by_default() {
        let mut ancient = token("a", "f");
        ancient.last_used = Utc::now() - chrono::Duration::days(3650);
        assert!(RefreshPolicy::default()
            .check_lifetime(&ancient, Utc::now())
            .is_ok());
    }

    #[tokio::test]
    async fn retired_token_is_collected_after_retention() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        storage.create_refresh_token(token("a1", "fa")).await.unwrap();
        storage.create_refresh_token(token("a2", "fa")).await.unwrap();

        let now = Utc::now();
        let policy = RefreshPolicy {
            retired_retention: Duration::from_secs(3600),
            ..Default::default()
        };
        let retired = storage
            .update_refresh_token("a1", policy.retire(now))
            .await
            .unwrap();
        assert_eq!(retired.expiry, Some(now + chrono::Duration::hours(1)));

        // Inside the window the retired token is still there to detect reuse.
        let early = storage
            .garbage_collect(now + chrono::Duration::minutes(59))
            .await
            .unwrap();
        assert_eq!(early.refresh_tokens, 0);

        let late = storage
            .garbage_collect(now + chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(late.refresh_tokens, 1);
        assert!(storage.get_refresh_token("a1").await.unwrap_err().is_not_found());
        assert!(storage.get_refresh_token("a2").await.is_ok());
    }

    #[test]
    fn retention_never_outlives_family() {
        let now = Utc::now();
        let family_end = now + chrono::Duration::minutes(5);
        let mut presented = token("a1", "fa");
        presented.expiry = Some(family_end);

        let retired = RefreshPolicy::default().retire(now)(presented).unwrap();
        assert_eq!(retired.expiry, Some(family_end));
    }

    #[tokio::test]
    async fn revoke_family_leaves_other_families() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        for (id, family) in [("a1", "fa"), ("a2", "fa"), ("b1", "fb")] {
            storage.create_refresh_token(token(id, family)).await.unwrap();
        }

        let revoked = revoke_family(&storage, "fa", deadline()).await.unwrap();
        assert_eq!(revoked, 2);
        assert!(storage.get_refresh_token("a1").await.unwrap_err().is_not_found());
        assert!(storage.get_refresh_token("b1").await.is_ok());
    }

    #[tokio::test]
    async fn revoke_token_policy_only_removes_successor() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let presented = token("a1", "fa");
        storage.create_refresh_token(presented.clone()).await.unwrap();
        storage.create_refresh_token(token("a2", "fa")).await.unwrap();
        storage.create_refresh_token(token("a3", "fa")).await.unwrap();

        let policy = RefreshPolicy {
            reuse: ReusePolicy::RevokeToken,
            ..Default::default()
        };
        let err = policy
            .on_reuse(&storage, &presented, Some("a3"), deadline())
            .await;
        assert!(matches!(err, Error::InvalidGrant(_)));
        assert!(storage.get_refresh_token("a2").await.is_ok());
        assert!(storage.get_refresh_token("a3").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn retire_refuses_second_retirement() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        storage.create_refresh_token(token("a1", "fa")).await.unwrap();

        let policy = RefreshPolicy::default();
        let retired = storage
            .update_refresh_token("a1", policy.retire(Utc::now()))
            .await
            .unwrap();
        assert!(retired.retired);

        let err = storage
            .update_refresh_token("a1", policy.retire(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, storage::Error::Rejected(_)));
    }
}
