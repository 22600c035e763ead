use std::path::{Path, PathBuf};
use std::sync::Arc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{RuntimeConfig, DIR_PLUGINS, DIR_RULES, DIR_SCRIPTS};
use crate::definition::{WorkflowBaseInfo, WorkflowDefinition, KEY_MESSAGE};
use crate::error::EngineError;
use crate::executor::{DebugHook, InstancePool, WorkflowRuntime};
use crate::message::Message;
use crate::store::{DefinitionStore, EventStore, Page, WorkflowKind};
use crate::trace::{DebugEvent, DebugTraceRecorder};

/// Callback a live debug subscriber receives: (workflow id, event).
pub type ObserverCallback = Arc<dyn Fn(&str, DebugEvent) + Send + Sync>;

struct DebugObserver {
    workflow_id: String,
    callback: ObserverCallback,
}

/// Records every debug event into the bounded trace buffers, then fans it
/// out to matching subscribers. Each notification runs on its own task, so a
/// slow subscriber cannot stall execution or its peers.
pub struct DebugHub {
    recorder: DebugTraceRecorder,
    // subscriber id -> observer
    observers: DashMap<String, DebugObserver>,
}

impl DebugHub {
    fn new(capacity: usize) -> Self {
        Self {
            recorder: DebugTraceRecorder::new(capacity),
            observers: DashMap::new(),
        }
    }

    pub fn recorder(&self) -> &DebugTraceRecorder {
        &self.recorder
    }

    pub fn on_debug(&self, workflow_id: &str, event: DebugEvent) {
        self.recorder.record(workflow_id, event.clone());

        for kv in self.observers.iter() {
            let observer = kv.value();
            if observer.workflow_id != workflow_id {
                continue;
            }
            let callback = observer.callback.clone();
            let workflow_id = workflow_id.to_string();
            let event = event.clone();
            tokio::spawn(async move {
                callback(&workflow_id, event);
            });
        }
    }

    pub fn add_observer(&self, workflow_id: &str, client_id: &str, callback: ObserverCallback) {
        self.observers.insert(
            client_id.to_string(),
            DebugObserver {
                workflow_id: workflow_id.to_string(),
                callback,
            },
        );
    }

    pub fn remove_observer(&self, client_id: &str) {
        self.observers.remove(client_id);
        debug!("debug observer count={}", self.observers.len());
    }
}

/// One tenant's engine: the instance pool, the persistence delegate, the
/// trace recorder plus subscribers, and the tenant-scoped script/plugin
/// extensions loaded at bootstrap.
pub struct WorkflowEngineService {
    tenant: String,
    config: RuntimeConfig,
    pool: InstancePool,
    store: Arc<dyn DefinitionStore>,
    events: Arc<dyn EventStore>,
    hub: Arc<DebugHub>,
    hook: DebugHook,
    scripts: DashMap<String, rhai::AST>,
    plugins: Vec<PathBuf>,
}

impl std::fmt::Debug for WorkflowEngineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngineService")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngineService {
    /// Bring a tenant's engine up: workspace dirs, compiled scripts (fatal on
    /// error), plugin scan (logged only), then every persisted non-disabled
    /// workflow into the instance pool (fatal on structural or compile
    /// errors). Fatal means this tenant cannot be served.
    pub async fn bootstrap(
        tenant: &str,
        config: RuntimeConfig,
        store: Arc<dyn DefinitionStore>,
        events: Arc<dyn EventStore>,
        runtime: Arc<dyn WorkflowRuntime>,
    ) -> Result<Arc<Self>, EngineError> {
        let workspace = config.workspace_dir(tenant);
        for sub in [DIR_RULES, DIR_SCRIPTS, DIR_PLUGINS] {
            std::fs::create_dir_all(workspace.join(sub))?;
        }

        let hub = Arc::new(DebugHub::new(config.node_log_size()));
        let hook: DebugHook = {
            let hub = hub.clone();
            Arc::new(move |workflow_id, event| hub.on_debug(workflow_id, event))
        };

        let scripts = load_scripts(&workspace.join(DIR_SCRIPTS))?;
        let plugins = scan_plugins(&workspace.join(DIR_PLUGINS));

        let service = Arc::new(Self {
            tenant: tenant.to_string(),
            pool: InstancePool::new(runtime),
            store,
            events,
            hub,
            hook,
            scripts,
            plugins,
            config,
        });

        for id in service.store.ids(tenant).await? {
            let bytes = service.store.get(tenant, &id).await?;
            let def = WorkflowDefinition::decode(&bytes)
                .map_err(|e| EngineError::Bootstrap(format!("workflow `{id}`: {e}")))?;
            if def.workflow.disabled {
                continue;
            }
            service
                .pool
                .deploy(&id, &bytes, service.config.clone(), service.hook.clone())
                .map_err(|e| EngineError::Bootstrap(format!("workflow `{id}`: {e}")))?;
        }

        info!(
            "Tenant `{}` ready: {} workflows, {} scripts, {} plugins",
            tenant,
            service.pool.len(),
            service.scripts.len(),
            service.plugins.len()
        );
        Ok(service)
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_deployed(&self, id: &str) -> bool {
        self.pool.contains(id)
    }

    pub fn script_names(&self) -> Vec<String> {
        self.scripts.iter().map(|kv| kv.key().clone()).collect()
    }

    pub fn plugin_paths(&self) -> &[PathBuf] {
        &self.plugins
    }

    /// The persisted declarative definition.
    pub async fn get(&self, id: &str) -> Result<Vec<u8>, EngineError> {
        self.store.get(&self.tenant, id).await
    }

    /// Decode, stamp, redeploy when enabled, and persist — in that order.
    ///
    /// A redeploy failure flips the definition to disabled with the error
    /// message recorded on it; the resulting bytes are still persisted and
    /// the error is returned to the caller.
    pub async fn save(&self, id: &str, dsl: &[u8]) -> Result<(), EngineError> {
        let mut def = WorkflowDefinition::decode(dsl)?;
        if def.workflow.id.is_empty() {
            def.workflow.id = id.to_string();
        }
        def.stamp(&self.tenant);

        let mut redeploy_err = None;
        if !def.workflow.disabled {
            let bytes = def.encode()?;
            if let Err(e) = self.redeploy(id, &bytes).await {
                self.pool.remove(id);
                def.workflow.disabled = true;
                def.workflow
                    .additional_info
                    .insert(KEY_MESSAGE.to_string(), Value::String(e.to_string()));
                redeploy_err = Some(e);
            }
        } else {
            self.pool.remove(id);
        }

        let bytes = def.encode()?;
        self.store.save(&self.tenant, id, &bytes).await?;

        match redeploy_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn list(
        &self,
        keywords: &str,
        kind: WorkflowKind,
        size: usize,
        page: usize,
    ) -> Result<Page<WorkflowDefinition>, EngineError> {
        self.store.list(&self.tenant, keywords, kind, size, page).await
    }

    /// Remove from the instance pool, then persistence, then purge dependent
    /// run records. Pool removal is not reverted when persistence fails.
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        self.pool.remove(id);
        self.hub.recorder().clear(id);
        self.store.delete(&self.tenant, id).await?;
        self.events.delete_by_workflow(&self.tenant, id).await
    }

    /// Update the descriptive fields. Deployed workflows are mutated through
    /// a snapshot-and-reload (never in place); otherwise a minimal definition
    /// is synthesized and deployed fresh. Persists the engine's compiled DSL.
    pub async fn save_base_info(
        &self,
        id: &str,
        info: WorkflowBaseInfo,
    ) -> Result<(), EngineError> {
        if id.is_empty() {
            return Err(EngineError::WorkflowNotFound(id.to_string()));
        }
        let instance = match self.pool.get(id) {
            Some(instance) => {
                let mut def = instance.definition();
                def.apply_base_info(&info);
                def.stamp(&self.tenant);
                instance.reload(&def.encode()?)?;
                instance
            }
            None => {
                let mut def = WorkflowDefinition::from_base_info(&info);
                def.workflow.id = id.to_string();
                def.stamp(&self.tenant);
                self.pool
                    .deploy(id, &def.encode()?, self.config.clone(), self.hook.clone())?
            }
        };
        let def = WorkflowDefinition::decode(&instance.dsl()?)?;
        self.store.save(&self.tenant, id, &def.encode_pretty()?).await
    }

    /// Merge one key into the configuration map of a deployed workflow,
    /// reload the instance from the result, and persist the compiled DSL.
    /// Reload failure aborts before anything is persisted.
    pub async fn save_configuration(
        &self,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let instance = self
            .pool
            .get(id)
            .ok_or_else(|| EngineError::NotDeployed(id.to_string()))?;

        let mut def = instance.definition();
        def.workflow.configuration.insert(key.to_string(), value);
        def.stamp(&self.tenant);
        instance.reload(&def.encode()?)?;

        let def = WorkflowDefinition::decode(&instance.dsl()?)?;
        self.store.save(&self.tenant, id, &def.encode_pretty()?).await
    }

    /// Clear the disabled flag and route through `save`, so both the
    /// redeploy and the persistence write happen.
    pub async fn deploy(&self, id: &str) -> Result<(), EngineError> {
        let bytes = self.get(id).await?;
        let mut def = WorkflowDefinition::decode(&bytes)?;
        def.workflow.disabled = false;
        self.save(id, &def.encode()?).await
    }

    /// Stop: set disabled, drop the instance, persist directly. Deliberately
    /// bypasses `save`'s redeploy path — stopping must not require the body
    /// to compile.
    pub async fn undeploy(&self, id: &str) -> Result<(), EngineError> {
        let bytes = self.get(id).await?;
        let mut def = WorkflowDefinition::decode(&bytes)?;
        self.pool.remove(id);
        def.workflow.disabled = true;
        self.store.save(&self.tenant, id, &def.encode()?).await
    }

    /// Reload in place when an instance exists, create fresh otherwise.
    /// Never persists; `save` owns the persistence write.
    pub async fn redeploy(&self, id: &str, dsl: &[u8]) -> Result<(), EngineError> {
        match self.pool.get(id) {
            Some(instance) => instance.reload(dsl),
            None => self
                .pool
                .deploy(id, dsl, self.config.clone(), self.hook.clone())
                .map(|_| ()),
        }
    }

    /// Run a message through a deployed workflow and wait for the result.
    pub async fn execute_and_wait(&self, id: &str, msg: Message) -> Result<Message, EngineError> {
        let instance = self
            .pool
            .get(id)
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))?;
        let result = instance.process(msg).await;
        if let Ok(envelope) = &result {
            if let Err(e) = self.events.save_run_log(&self.tenant, id, envelope).await {
                warn!("Run log for workflow `{}` was not persisted: {e}", id);
            }
        }
        result
    }

    /// Fire-and-forget: returns once the message is handed off.
    pub fn execute(&self, id: &str, msg: Message) -> Result<(), EngineError> {
        let instance = self
            .pool
            .get(id)
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))?;
        let workflow_id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = instance.process(msg).await {
                warn!("workflow `{}` failed: {e}", workflow_id);
            }
        });
        Ok(())
    }

    pub fn add_observer(&self, workflow_id: &str, client_id: &str, callback: ObserverCallback) {
        self.hub.add_observer(workflow_id, client_id, callback);
    }

    pub fn remove_observer(&self, client_id: &str) {
        self.hub.remove_observer(client_id);
    }

    /// Buffered debug events for one node, oldest first.
    pub fn debug_events(&self, workflow_id: &str, node_id: &str) -> Vec<DebugEvent> {
        self.hub.recorder().events(workflow_id, node_id)
    }

    pub fn debug_hub(&self) -> &DebugHub {
        &self.hub
    }

    pub fn deployed_ids(&self) -> Vec<String> {
        self.pool.ids()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown_all();
    }
}

/// Compile every `*.rhai` script in `dir`. A compile error is fatal for the
/// tenant.
fn load_scripts(dir: &Path) -> Result<DashMap<String, rhai::AST>, EngineError> {
    let scripts = DashMap::new();
    let engine = rhai::Engine::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("rhai") {
            continue;
        }
        let name = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };
        let contents = std::fs::read_to_string(&path)?;
        let ast = engine.compile(&contents).map_err(|e| EngineError::Script {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;
        scripts.insert(name, ast);
    }
    Ok(scripts)
}

/// Record native plugin libraries found in `dir`. Unreadable entries are
/// logged, never fatal.
fn scan_plugins(dir: &Path) -> Vec<PathBuf> {
    let mut plugins = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Could not scan plugin dir {}: {e}", dir.display());
            return plugins;
        }
    };
    for entry in entries {
        match entry {
            Ok(entry) => {
                let path = entry.path();
                if matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("so") | Some("dll") | Some("dylib")
                ) {
                    plugins.push(path);
                }
            }
            Err(e) => warn!("Skipping plugin entry in {}: {e}", dir.display()),
        }
    }
    plugins.sort();
    plugins
}
