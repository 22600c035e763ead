use std::sync::Arc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::{RuntimeConfig, DIR_WORKFLOWS};
use crate::engine::service::WorkflowEngineService;
use crate::error::EngineError;
use crate::executor::WorkflowRuntime;
use crate::store::{DefinitionStore, EventStore};

/// Tenant id -> engine service. Services are created lazily on first access
/// and bootstrapped exactly once; concurrent first requests for the same
/// tenant collapse onto a single bootstrap.
pub struct TenantRegistry {
    config: RuntimeConfig,
    store: Arc<dyn DefinitionStore>,
    events: Arc<dyn EventStore>,
    runtime: Arc<dyn WorkflowRuntime>,
    services: DashMap<String, Arc<WorkflowEngineService>>,
    // one init slot per tenant; held only while bootstrapping
    init_slots: DashMap<String, Arc<Mutex<()>>>,
}

impl TenantRegistry {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn DefinitionStore>,
        events: Arc<dyn EventStore>,
        runtime: Arc<dyn WorkflowRuntime>,
    ) -> Self {
        Self {
            config,
            store,
            events,
            runtime,
            services: DashMap::new(),
            init_slots: DashMap::new(),
        }
    }

    /// The tenant's service, bootstrapping it on first access. A bootstrap
    /// failure is returned to every caller that raced for it and leaves no
    /// entry behind, so a later call retries.
    pub async fn get_or_init(
        &self,
        tenant: &str,
    ) -> Result<Arc<WorkflowEngineService>, EngineError> {
        if let Some(service) = self.get(tenant) {
            return Ok(service);
        }

        let slot = self
            .init_slots
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = slot.lock().await;

        // a racing caller may have finished while we waited
        if let Some(service) = self.get(tenant) {
            return Ok(service);
        }

        let service = WorkflowEngineService::bootstrap(
            tenant,
            self.config.for_tenant(tenant),
            self.store.clone(),
            self.events.clone(),
            self.runtime.clone(),
        )
        .await?;
        self.services.insert(tenant.to_string(), service.clone());
        Ok(service)
    }

    /// Already-bootstrapped services only; never triggers a bootstrap.
    pub fn get(&self, tenant: &str) -> Option<Arc<WorkflowEngineService>> {
        self.services.get(tenant).map(|kv| kv.value().clone())
    }

    pub fn tenants(&self) -> Vec<String> {
        self.services.iter().map(|kv| kv.key().clone()).collect()
    }

    /// Drop a tenant's service from the registry, stopping its instances.
    /// Persisted definitions are untouched.
    pub fn remove(&self, tenant: &str) {
        if let Some((_, service)) = self.services.remove(tenant) {
            service.shutdown();
            info!("Removed tenant `{}`", tenant);
        }
        self.init_slots.remove(tenant);
    }

    /// Bootstrap every tenant that already has a workspace directory on
    /// disk. A tenant that fails to come up is logged and skipped; the rest
    /// still load.
    pub async fn load_existing(&self) -> Result<(), EngineError> {
        let root = self.config.data_dir.join(DIR_WORKFLOWS);
        if !root.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let tenant = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Err(e) = self.get_or_init(&tenant).await {
                error!("Tenant `{}` failed to load: {e}", tenant);
            }
        }
        info!("Loaded {} tenants", self.services.len());
        Ok(())
    }

    pub fn shutdown(&self) {
        for kv in self.services.iter() {
            kv.value().shutdown();
        }
        info!("All tenant engines stopped");
    }
}
