//! Backend registry and per-queue assignment.
//!
//! The registry maps backend-type names to factories; the manager resolves
//! which backend serves a given scope. Assignments change at runtime during
//! live migration, so readers take a snapshot per call.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use hoist_core::{BackendConfig, QueueError, QueueResult};

use crate::backend::{QueueScope, StorageBackend};

/// Constructs a backend from connection settings
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, config: &BackendConfig) -> QueueResult<Arc<dyn StorageBackend>>;

    /// Backend-type name this factory serves, e.g. "redis_lists"
    fn kind(&self) -> &'static str;
}

/// Maps backend-type names to factories
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<&'static str, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        info!(kind = factory.kind(), "registered backend factory");
        self.factories.insert(factory.kind(), factory);
    }

    pub fn get(&self, kind: &str) -> QueueResult<Arc<dyn BackendFactory>> {
        self.factories
            .get(kind)
            .cloned()
            .ok_or_else(|| QueueError::Validation(format!("unknown backend kind: {}", kind)))
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub async fn create(
        &self,
        kind: &str,
        config: &BackendConfig,
    ) -> QueueResult<Arc<dyn StorageBackend>> {
        self.get(kind)?.create(config).await
    }
}

/// Resolves which backend serves a scope. The default backend handles every
/// queue without an explicit assignment; migration installs per-scope
/// overrides while a queue moves between backends.
pub struct BackendManager {
    default: Arc<dyn StorageBackend>,
    assignments: RwLock<HashMap<QueueScope, Arc<dyn StorageBackend>>>,
}

impl BackendManager {
    pub fn new(default: Arc<dyn StorageBackend>) -> Self {
        Self {
            default,
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// Backend currently serving the scope
    pub fn backend_for(&self, scope: &QueueScope) -> Arc<dyn StorageBackend> {
        self.assignments
            .read()
            .get(scope)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn default_backend(&self) -> Arc<dyn StorageBackend> {
        self.default.clone()
    }

    /// Route a scope to a specific backend (used by migration)
    pub fn assign(&self, scope: QueueScope, backend: Arc<dyn StorageBackend>) {
        info!(scope = %scope, "assigned scope to backend");
        self.assignments.write().insert(scope, backend);
    }

    /// Remove a per-scope override, falling back to the default
    pub fn unassign(&self, scope: &QueueScope) {
        self.assignments.write().remove(scope);
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use hoist_core::TenantId;

    struct MemoryFactory;

    #[async_trait]
    impl BackendFactory for MemoryFactory {
        async fn create(&self, _config: &BackendConfig) -> QueueResult<Arc<dyn StorageBackend>> {
            Ok(Arc::new(MemoryBackend::new()))
        }

        fn kind(&self) -> &'static str {
            "memory"
        }
    }

    #[tokio::test]
    async fn registry_creates_by_kind() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(MemoryFactory));
        assert!(registry.kinds().contains(&"memory"));

        let backend = registry
            .create("memory", &BackendConfig::default())
            .await
            .unwrap();
        assert!(backend.health().await.healthy);

        assert!(registry
            .create("bogus", &BackendConfig::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn manager_routes_assignments() {
        let default: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let other: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let manager = BackendManager::new(default.clone());

        let scope = QueueScope::new(TenantId::new("acme").unwrap(), "q");
        assert!(Arc::ptr_eq(&manager.backend_for(&scope), &default));

        manager.assign(scope.clone(), other.clone());
        assert!(Arc::ptr_eq(&manager.backend_for(&scope), &other));

        manager.unassign(&scope);
        assert!(Arc::ptr_eq(&manager.backend_for(&scope), &default));
    }
}
