//! In-memory reference implementation of the storage contract
//!
//! Each record carries a version number. `update_*` reads the record and its
//! version, releases the lock, runs the updater, then re-acquires the lock
//! and writes only if the version is unchanged. The lock is never held while
//! the updater runs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{
    AuthCode, AuthRequest, Client, ConnectorConfig, GcResult, Keys, Password, RefreshToken,
};
use crate::{Storage, Updater};

/// Behaviour shared by every record kind kept in a `Table`.
trait Record: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;

    fn expired(&self, _now: DateTime<Utc>) -> bool {
        false
    }

    /// Called with the new version on every successful write.
    fn stamp(&mut self, _version: u64) {}
}

impl Record for AuthRequest {
    fn key(&self) -> &str {
        &self.id
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

impl Record for AuthCode {
    fn key(&self) -> &str {
        &self.id
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

impl Record for RefreshToken {
    fn key(&self) -> &str {
        &self.id
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }
}

impl Record for Client {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Record for ConnectorConfig {
    fn key(&self) -> &str {
        &self.id
    }

    fn stamp(&mut self, version: u64) {
        self.resource_version = version.to_string();
    }
}

impl Record for Password {
    fn key(&self) -> &str {
        &self.email
    }
}

struct Versioned<T> {
    version: u64,
    value: T,
}

/// One record kind, keyed by id.
struct Table<T> {
    kind: &'static str,
    rows: Mutex<HashMap<String, Versioned<T>>>,
}

impl<T: Record> Table<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn not_found(&self) -> Error {
        Error::NotFound(self.kind.to_string())
    }

    async fn create(&self, mut value: T) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let key = value.key().to_owned();
        if rows.contains_key(&key) {
            return Err(Error::AlreadyExists(self.kind.to_string()));
        }
        value.stamp(1);
        rows.insert(key, Versioned { version: 1, value });
        debug!(kind = self.kind, "created record");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<T> {
        let now = Utc::now();
        let rows = self.rows.lock().await;
        rows.get(id)
            .filter(|row| !row.value.expired(now))
            .map(|row| row.value.clone())
            .ok_or_else(|| self.not_found())
    }

    async fn update(&self, id: &str, updater: Updater<T>) -> Result<T> {
        let (version, current) = {
            let now = Utc::now();
            let rows = self.rows.lock().await;
            let row = rows
                .get(id)
                .filter(|row| !row.value.expired(now))
                .ok_or_else(|| self.not_found())?;
            (row.version, row.value.clone())
        };

        let mut next = updater(current)?;
        if next.key() != id {
            return Err(Error::Backend(format!(
                "{} updater changed the record id",
                self.kind
            )));
        }

        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(id).ok_or_else(|| self.not_found())?;
        if row.version != version {
            debug!(kind = self.kind, "conditional write lost the race");
            return Err(Error::UpdateConflict(self.kind.to_string()));
        }
        row.version += 1;
        next.stamp(row.version);
        row.value = next.clone();
        Ok(next)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut rows = self.rows.lock().await;
        match rows.remove(id) {
            Some(_) => {
                debug!(kind = self.kind, "deleted record");
                Ok(())
            }
            None => Err(self.not_found()),
        }
    }

    async fn snapshot(&self) -> Vec<T> {
        let now = Utc::now();
        let rows = self.rows.lock().await;
        rows.values()
            .filter(|row| !row.value.expired(now))
            .map(|row| row.value.clone())
            .collect()
    }

    /// Lazy listing: nothing is read until the stream is first polled.
    fn list(&self) -> BoxStream<'_, Result<T>> {
        stream::once(self.snapshot())
            .flat_map(|values| stream::iter(values.into_iter().map(Ok)))
            .boxed()
    }

    async fn purge(&self, now: DateTime<Utc>) -> usize {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, row| !row.value.expired(now));
        before - rows.len()
    }
}

/// Reference storage backend holding everything in process memory.
pub struct MemStorage {
    auth_requests: Table<AuthRequest>,
    auth_codes: Table<AuthCode>,
    refresh_tokens: Table<RefreshToken>,
    clients: Table<Client>,
    connectors: Table<ConnectorConfig>,
    passwords: Table<Password>,
    keys: Mutex<Versioned<Keys>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            auth_requests: Table::new("auth request"),
            auth_codes: Table::new("auth code"),
            refresh_tokens: Table::new("refresh token"),
            clients: Table::new("client"),
            connectors: Table::new("connector"),
            passwords: Table::new("password"),
            keys: Mutex::new(Versioned {
                version: 0,
                value: Keys::default(),
            }),
        }
    }

    async fn update_keys_inner(&self, updater: Updater<Keys>) -> Result<Keys> {
        let (version, current) = {
            let keys = self.keys.lock().await;
            (keys.version, keys.value.clone())
        };

        let next = updater(current)?;

        let mut keys = self.keys.lock().await;
        if keys.version != version {
            debug!(kind = "keys", "conditional write lost the race");
            return Err(Error::UpdateConflict("keys".into()));
        }
        keys.version += 1;
        keys.value = next.clone();
        Ok(next)
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn create_auth_request(&self, request: AuthRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.auth_requests.create(request))
    }

    fn get_auth_request<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<AuthRequest>> {
        Box::pin(self.auth_requests.get(id))
    }

    fn update_auth_request<'a>(
        &'a self,
        id: &'a str,
        updater: Updater<AuthRequest>,
    ) -> BoxFuture<'a, Result<AuthRequest>> {
        Box::pin(self.auth_requests.update(id, updater))
    }

    fn delete_auth_request<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.auth_requests.delete(id))
    }

    fn create_auth_code(&self, code: AuthCode) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.auth_codes.create(code))
    }

    fn get_auth_code<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<AuthCode>> {
        Box::pin(self.auth_codes.get(id))
    }

    fn delete_auth_code<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.auth_codes.delete(id))
    }

    fn create_refresh_token(&self, token: RefreshToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.refresh_tokens.create(token))
    }

    fn get_refresh_token<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<RefreshToken>> {
        Box::pin(self.refresh_tokens.get(id))
    }

    fn update_refresh_token<'a>(
        &'a self,
        id: &'a str,
        updater: Updater<RefreshToken>,
    ) -> BoxFuture<'a, Result<RefreshToken>> {
        Box::pin(self.refresh_tokens.update(id, updater))
    }

    fn delete_refresh_token<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.refresh_tokens.delete(id))
    }

    fn list_refresh_tokens(&self) -> BoxStream<'_, Result<RefreshToken>> {
        self.refresh_tokens.list()
    }

    fn get_keys(&self) -> BoxFuture<'_, Result<Keys>> {
        Box::pin(async move { Ok(self.keys.lock().await.value.clone()) })
    }

    fn update_keys(&self, updater: Updater<Keys>) -> BoxFuture<'_, Result<Keys>> {
        Box::pin(self.update_keys_inner(updater))
    }

    fn create_client(&self, client: Client) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.clients.create(client))
    }

    fn get_client<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Client>> {
        Box::pin(self.clients.get(id))
    }

    fn update_client<'a>(
        &'a self,
        id: &'a str,
        updater: Updater<Client>,
    ) -> BoxFuture<'a, Result<Client>> {
        Box::pin(self.clients.update(id, updater))
    }

    fn delete_client<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.clients.delete(id))
    }

    fn list_clients(&self) -> BoxStream<'_, Result<Client>> {
        self.clients.list()
    }

    fn create_connector(&self, connector: ConnectorConfig) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.connectors.create(connector))
    }

    fn get_connector<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<ConnectorConfig>> {
        Box::pin(self.connectors.get(id))
    }

    fn update_connector<'a>(
        &'a self,
        id: &'a str,
        updater: Updater<ConnectorConfig>,
    ) -> BoxFuture<'a, Result<ConnectorConfig>> {
        Box::pin(self.connectors.update(id, updater))
    }

    fn delete_connector<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.connectors.delete(id))
    }

    fn list_connectors(&self) -> BoxStream<'_, Result<ConnectorConfig>> {
        self.connectors.list()
    }

    fn create_password(&self, mut password: Password) -> BoxFuture<'_, Result<()>> {
        password.email = password.email.to_lowercase();
        Box::pin(self.passwords.create(password))
    }

    fn get_password<'a>(&'a self, email: &'a str) -> BoxFuture<'a, Result<Password>> {
        Box::pin(async move { self.passwords.get(&email.to_lowercase()).await })
    }

    fn update_password<'a>(
        &'a self,
        email: &'a str,
        updater: Updater<Password>,
    ) -> BoxFuture<'a, Result<Password>> {
        Box::pin(async move { self.passwords.update(&email.to_lowercase(), updater).await })
    }

    fn delete_password<'a>(&'a self, email: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.passwords.delete(&email.to_lowercase()).await })
    }

    fn list_passwords(&self) -> BoxStream<'_, Result<Password>> {
        self.passwords.list()
    }

    fn garbage_collect(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<GcResult>> {
        Box::pin(async move {
            Ok(GcResult {
                auth_requests: self.auth_requests.purge(now).await,
                auth_codes: self.auth_codes.purge(now).await,
                refresh_tokens: self.refresh_tokens.purge(now).await,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectorData, Identity};
    use chrono::Duration;
    use futures::TryStreamExt;
    use std::sync::Arc;

    fn auth_request(id: &str, expiry: DateTime<Utc>) -> AuthRequest {
        AuthRequest {
            id: id.into(),
            client_id: "example-app".into(),
            response_types: vec!["code".into()],
            scopes: vec!["openid".into()],
            redirect_uri: "http://127.0.0.1:5555/callback".into(),
            state: "xyz".into(),
            nonce: None,
            pkce: None,
            connector_id: "mock".into(),
            login_hint: None,
            expiry,
            logged_in: false,
            identity: None,
            connector_data: None,
        }
    }

    fn refresh_token(id: &str, family: &str) -> RefreshToken {
        let now = Utc::now();
        RefreshToken {
            id: id.into(),
            client_id: "example-app".into(),
            connector_id: "mock".into(),
            identity: Identity {
                user_id: "u1".into(),
                username: "jane".into(),
                ..Default::default()
            },
            connector_data: ConnectorData::new(b"opaque".to_vec()),
            scopes: vec!["openid".into(), "offline_access".into()],
            nonce: None,
            family: family.into(),
            created_at: now,
            last_used: now,
            retired: false,
            expiry: None,
        }
    }

    fn client(id: &str) -> Client {
        Client {
            id: id.into(),
            secret_hash: String::new(),
            redirect_uris: vec!["http://127.0.0.1:5555/callback".into()],
            trusted_peers: vec![],
            public: true,
            name: "Example App".into(),
            grant_types: vec![],
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = MemStorage::new();
        store.create_client(client("a")).await.unwrap();
        let err = store.create_client(client("a")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn get_and_delete_missing_record_is_not_found() {
        let store = MemStorage::new();
        assert!(store.get_auth_code("nope").await.unwrap_err().is_not_found());
        assert!(store.delete_auth_code("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn expired_auth_request_reads_as_not_found() {
        let store = MemStorage::new();
        store
            .create_auth_request(auth_request("old", Utc::now() - Duration::seconds(1)))
            .await
            .unwrap();
        assert!(store.get_auth_request("old").await.unwrap_err().is_not_found());

        let updated = store
            .update_auth_request("old", Box::new(|req| Ok(req)))
            .await
            .unwrap_err();
        assert!(updated.is_not_found());
    }

    #[tokio::test]
    async fn update_applies_updater_output() {
        let store = MemStorage::new();
        store
            .create_auth_request(auth_request("r1", Utc::now() + Duration::minutes(5)))
            .await
            .unwrap();

        let updated = store
            .update_auth_request(
                "r1",
                Box::new(|mut req| {
                    req.logged_in = true;
                    Ok(req)
                }),
            )
            .await
            .unwrap();
        assert!(updated.logged_in);
        assert!(store.get_auth_request("r1").await.unwrap().logged_in);
    }

    #[tokio::test]
    async fn updater_error_writes_nothing() {
        let store = MemStorage::new();
        store.create_client(client("a")).await.unwrap();

        let err = store
            .update_client(
                "a",
                Box::new(|_client| Err(Error::Rejected("no".into()))),
            )
            .await
            .unwrap_err();
        assert_eq!(err, Error::Rejected("no".into()));
        assert_eq!(store.get_client("a").await.unwrap().name, "Example App");
    }

    #[tokio::test]
    async fn updater_cannot_change_record_id() {
        let store = MemStorage::new();
        store.create_client(client("a")).await.unwrap();
        let err = store
            .update_client(
                "a",
                Box::new(|mut c| {
                    c.id = "b".into();
                    Ok(c)
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_updates_have_exactly_one_winner() {
        let store = Arc::new(MemStorage::new());
        store.create_client(client("a")).await.unwrap();

        // Both updaters read version 1 before either writes.
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let mut handles = Vec::new();
        for name in ["first", "second"] {
            let store = store.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_client(
                        "a",
                        Box::new(move |mut c| {
                            barrier.wait();
                            c.name = name.to_string();
                            Ok(c)
                        }),
                    )
                    .await
            }));
        }

        let mut winners = Vec::new();
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(c) => winners.push(c.name),
                Err(Error::UpdateConflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts, 1);
        assert_eq!(store.get_client("a").await.unwrap().name, winners[0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retried_updates_lose_no_writes() {
        let store = Arc::new(MemStorage::new());
        store.create_client(client("counter")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let peer = format!("peer-{i}");
                    let result = store
                        .update_client(
                            "counter",
                            Box::new(move |mut c| {
                                c.trusted_peers.push(peer);
                                Ok(c)
                            }),
                        )
                        .await;
                    match result {
                        Ok(_) => break,
                        Err(Error::UpdateConflict(_)) => continue,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let c = store.get_client("counter").await.unwrap();
        assert_eq!(c.trusted_peers.len(), 20);
    }

    #[tokio::test]
    async fn connector_resource_version_changes_on_update() {
        let store = MemStorage::new();
        store
            .create_connector(ConnectorConfig {
                id: "mock".into(),
                kind: "mockCallback".into(),
                name: "Mock".into(),
                config: serde_json::Value::Null,
                resource_version: String::new(),
            })
            .await
            .unwrap();
        let v1 = store.get_connector("mock").await.unwrap().resource_version;

        store
            .update_connector(
                "mock",
                Box::new(|mut c| {
                    c.name = "Renamed".into();
                    Ok(c)
                }),
            )
            .await
            .unwrap();
        let v2 = store.get_connector("mock").await.unwrap().resource_version;
        assert_ne!(v1, v2);
    }

    #[tokio::test]
    async fn passwords_are_case_insensitive() {
        let store = MemStorage::new();
        store
            .create_password(Password {
                email: "Admin@Example.com".into(),
                hash: "$2b$10$hash".into(),
                username: "admin".into(),
                user_id: "08a8684b".into(),
            })
            .await
            .unwrap();
        let p = store.get_password("admin@example.COM").await.unwrap();
        assert_eq!(p.email, "admin@example.com");
        store.delete_password("ADMIN@example.com").await.unwrap();
        assert!(store.get_password("admin@example.com").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_streams_every_record() {
        let store = MemStorage::new();
        for (id, family) in [("t1", "f1"), ("t2", "f1"), ("t3", "f2")] {
            store.create_refresh_token(refresh_token(id, family)).await.unwrap();
        }
        let mut ids: Vec<String> = store
            .list_refresh_tokens()
            .map_ok(|t| t.id)
            .try_collect()
            .await
            .unwrap();
        ids.sort();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn keys_start_empty_and_update_conditionally() {
        let store = MemStorage::new();
        let keys = store.get_keys().await.unwrap();
        assert!(keys.signing_key.is_none());

        let next = Utc::now() + Duration::hours(6);
        store
            .update_keys(Box::new(move |mut k| {
                k.next_rotation = Some(next);
                Ok(k)
            }))
            .await
            .unwrap();
        assert_eq!(store.get_keys().await.unwrap().next_rotation, Some(next));
    }

    #[tokio::test]
    async fn garbage_collect_removes_only_expired_records() {
        let store = MemStorage::new();
        let now = Utc::now();
        store
            .create_auth_request(auth_request("stale", now - Duration::minutes(1)))
            .await
            .unwrap();
        store
            .create_auth_request(auth_request("fresh", now + Duration::minutes(10)))
            .await
            .unwrap();
        let mut expiring = refresh_token("t-old", "f1");
        expiring.expiry = Some(now - Duration::seconds(5));
        store.create_refresh_token(expiring).await.unwrap();
        store.create_refresh_token(refresh_token("t-new", "f2")).await.unwrap();

        let result = store.garbage_collect(now).await.unwrap();
        assert_eq!(
            result,
            GcResult {
                auth_requests: 1,
                auth_codes: 0,
                refresh_tokens: 1,
            }
        );
        assert!(store.get_auth_request("fresh").await.is_ok());
        assert!(store.get_refresh_token("t-new").await.is_ok());

        let second = store.garbage_collect(now).await.unwrap();
        assert!(second.is_empty());
    }
}
