//! Hot-reloadable connector registry
//!
//! Each lookup reads the connector's config record and compares its
//! `resource_version` with the version of the cached instance. The connector
//! is re-opened only when the version moved. Cached instances live in an
//! immutable map that is replaced wholesale, so a request holding a
//! `ResolvedConnector` keeps using the instance it resolved even while the
//! registry swaps in a newer one.

use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use storage::{ConnectorConfig, Storage};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{Connector, LocalConnector, MockAssertion, MockCallback, MockPassword};

/// Builds connector instances from stored configuration.
pub trait ConnectorFactory: Send + Sync {
    fn open(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>>;
}

/// Factory for the connector types shipped with the bridge.
pub struct BuiltinFactory {
    storage: Arc<dyn Storage>,
}

impl BuiltinFactory {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl ConnectorFactory for BuiltinFactory {
    fn open(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
        let connector: Arc<dyn Connector> = match config.kind.as_str() {
            "mockCallback" => Arc::new(MockCallback::from_config(&config.config)?),
            "mockPassword" => Arc::new(MockPassword::from_config(&config.config)?),
            "mockAssertion" => Arc::new(MockAssertion::from_config(&config.config)?),
            "local" => Arc::new(LocalConnector::new(self.storage.clone())),
            other => {
                return Err(Error::Config(format!("unknown connector type: {other}")));
            }
        };
        Ok(connector)
    }
}

/// A connector instance together with the config it was opened from.
#[derive(Clone)]
pub struct ResolvedConnector {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub resource_version: String,
    pub connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for ResolvedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConnector")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("resource_version", &self.resource_version)
            .finish()
    }
}

type Snapshot = Arc<HashMap<String, ResolvedConnector>>;

pub struct ConnectorRegistry {
    storage: Arc<dyn Storage>,
    factory: Arc<dyn ConnectorFactory>,
    snapshot: RwLock<Snapshot>,
}

impl ConnectorRegistry {
    pub fn new(storage: Arc<dyn Storage>, factory: Arc<dyn ConnectorFactory>) -> Self {
        Self {
            storage,
            factory,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Resolve a connector by id, re-opening it if its config changed.
    pub async fn get(&self, id: &str) -> Result<ResolvedConnector> {
        let config = match self.storage.get_connector(id).await {
            Ok(config) => config,
            Err(storage::Error::NotFound(_)) => {
                self.evict(id).await;
                return Err(Error::UnknownConnector(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let cached = self.snapshot.read().await.get(id).cloned();
        if let Some(cached) = cached {
            if cached.resource_version == config.resource_version {
                return Ok(cached);
            }
            debug!(
                connector_id = id,
                cached = %cached.resource_version,
                current = %config.resource_version,
                "connector config changed"
            );
        }

        let connector = self.factory.open(&config)?;
        let resolved = ResolvedConnector {
            id: config.id,
            name: config.name,
            kind: config.kind,
            resource_version: config.resource_version,
            connector,
        };
        info!(
            connector_id = id,
            kind = %resolved.kind,
            resource_version = %resolved.resource_version,
            "opened connector"
        );
        self.install(resolved.clone()).await;
        Ok(resolved)
    }

    /// All configured connectors, read from the store.
    pub async fn list(&self) -> Result<Vec<ConnectorConfig>> {
        Ok(self.storage.list_connectors().try_collect().await?)
    }

    async fn install(&self, resolved: ResolvedConnector) {
        let mut guard = self.snapshot.write().await;
        let mut next = HashMap::clone(&guard);
        next.insert(resolved.id.clone(), resolved);
        *guard = Arc::new(next);
    }

    async fn evict(&self, id: &str) {
        let mut guard = self.snapshot.write().await;
        if guard.contains_key(id) {
            let mut next = HashMap::clone(&guard);
            next.remove(id);
            *guard = Arc::new(next);
            info!(connector_id = id, "connector removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use storage::MemStorage;

    /// Delegates to the builtin factory and counts how often it is asked to open.
    struct CountingFactory {
        inner: BuiltinFactory,
        opens: AtomicUsize,
    }

    impl ConnectorFactory for CountingFactory {
        fn open(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.open(config)
        }
    }

    async fn setup() -> (Arc<dyn Storage>, Arc<CountingFactory>, ConnectorRegistry) {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        storage
            .create_connector(ConnectorConfig {
                id: "mock".into(),
                kind: "mockCallback".into(),
                name: "Mock".into(),
                config: serde_json::Value::Null,
                resource_version: String::new(),
            })
            .await
            .unwrap();
        let factory = Arc::new(CountingFactory {
            inner: BuiltinFactory::new(storage.clone()),
            opens: AtomicUsize::new(0),
        });
        let registry = ConnectorRegistry::new(storage.clone(), factory.clone());
        (storage, factory, registry)
    }

    #[tokio::test]
    async fn unchanged_config_reuses_instance() {
        let (_storage, factory, registry) = setup().await;
        let first = registry.get("mock").await.unwrap();
        let second = registry.get("mock").await.unwrap();
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first.connector, &second.connector));
    }

    #[tokio::test]
    async fn changed_config_reopens_without_disturbing_holders() {
        let (storage, factory, registry) = setup().await;
        let before = registry.get("mock").await.unwrap();

        storage
            .update_connector(
                "mock",
                Box::new(|mut c| {
                    c.kind = "mockPassword".into();
                    c.config = serde_json::json!({"username": "jane", "password": "pw"});
                    Ok(c)
                }),
            )
            .await
            .unwrap();

        let after = registry.get("mock").await.unwrap();
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
        assert_ne!(before.resource_version, after.resource_version);
        assert!(after.connector.as_password().is_some());
        // The earlier resolution is untouched.
        assert!(before.connector.as_callback().is_some());
    }

    #[tokio::test]
    async fn deleted_config_is_unknown() {
        let (storage, _factory, registry) = setup().await;
        registry.get("mock").await.unwrap();
        storage.delete_connector("mock").await.unwrap();
        assert!(matches!(
            registry.get("mock").await,
            Err(Error::UnknownConnector(_))
        ));
    }

    #[tokio::test]
    async fn unknown_type_is_config_error() {
        let (storage, _factory, registry) = setup().await;
        storage
            .create_connector(ConnectorConfig {
                id: "ldap".into(),
                kind: "ldap".into(),
                name: "LDAP".into(),
                config: serde_json::Value::Null,
                resource_version: String::new(),
            })
            .await
            .unwrap();
        assert!(matches!(registry.get("ldap").await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn list_returns_stored_configs() {
        let (_storage, _factory, registry) = setup().await;
        let configs = registry.list().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, "mock");
    }
}
