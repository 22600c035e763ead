use std::sync::{Arc, RwLock};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::definition::WorkflowDefinition;
use crate::error::EngineError;
use crate::message::Message;
use crate::resource::SharedResourcePool;
use crate::trace::{DebugEvent, FlowDirection};

/// Relation label emitted on a node's outbound side.
pub const REL_SUCCESS: &str = "Success";

/// Hook invoked synchronously for every node transition:
/// (workflow id, event).
pub type DebugHook = Arc<dyn Fn(&str, DebugEvent) + Send + Sync>;

/// One compiled, running workflow.
#[async_trait]
pub trait WorkflowInstance: Send + Sync {
    fn id(&self) -> String;

    /// Snapshot of the live definition. Mutations go through `reload`, never
    /// through this value.
    fn definition(&self) -> WorkflowDefinition;

    /// The current compiled form, suitable for persisting.
    fn dsl(&self) -> Result<Vec<u8>, EngineError>;

    /// Recompile from new bytes and swap atomically. On failure the old
    /// compiled form keeps running.
    fn reload(&self, dsl: &[u8]) -> Result<(), EngineError>;

    /// Run a message through the workflow and wait for the result.
    async fn process(&self, msg: Message) -> Result<Message, EngineError>;

    fn stop(&self);
}

impl std::fmt::Debug for dyn WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// Factory for workflow instances; the execution-layer seam.
pub trait WorkflowRuntime: Send + Sync {
    fn new_instance(
        &self,
        id: &str,
        dsl: &[u8],
        config: RuntimeConfig,
        hook: DebugHook,
    ) -> Result<Arc<dyn WorkflowInstance>, EngineError>;
}

/// Workflow id -> running instance. The single source of truth for "is this
/// workflow currently deployed".
pub struct InstancePool {
    runtime: Arc<dyn WorkflowRuntime>,
    instances: DashMap<String, Arc<dyn WorkflowInstance>>,
}

impl InstancePool {
    pub fn new(runtime: Arc<dyn WorkflowRuntime>) -> Self {
        Self {
            runtime,
            instances: DashMap::new(),
        }
    }

    /// Compile and insert, replacing (and stopping) any previous instance.
    pub fn deploy(
        &self,
        id: &str,
        dsl: &[u8],
        config: RuntimeConfig,
        hook: DebugHook,
    ) -> Result<Arc<dyn WorkflowInstance>, EngineError> {
        let instance = self.runtime.new_instance(id, dsl, config, hook)?;
        if let Some(old) = self.instances.insert(id.to_string(), instance.clone()) {
            old.stop();
        }
        info!("Deployed workflow `{}`", id);
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn WorkflowInstance>> {
        self.instances.get(id).map(|kv| kv.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Stop and drop; no-op when absent.
    pub fn remove(&self, id: &str) {
        if let Some((_, instance)) = self.instances.remove(id) {
            instance.stop();
            info!("Undeployed workflow `{}`", id);
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.instances.iter().map(|kv| kv.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn shutdown_all(&self) {
        let ids = self.ids();
        for id in ids {
            self.remove(&id);
        }
    }
}

/// Default execution layer: decodes, validates, resolves shared-resource
/// references and walks the graph in topological order, emitting debug
/// events per node. Node semantics beyond pass-through routing live in the
/// embedding application.
pub struct GraphRuntime {
    resources: Arc<SharedResourcePool>,
}

impl GraphRuntime {
    pub fn new(resources: Arc<SharedResourcePool>) -> Self {
        Self { resources }
    }

    fn compile(
        resources: &SharedResourcePool,
        id: &str,
        dsl: &[u8],
    ) -> Result<Compiled, EngineError> {
        let fail = |reason: String| EngineError::Compile {
            id: id.to_string(),
            reason,
        };
        let def = WorkflowDefinition::decode(dsl).map_err(|e| fail(e.to_string()))?;
        let order = def.execution_order().map_err(|e| fail(e.to_string()))?;
        for r in def.shared_refs() {
            if resources.get(&r).is_none() {
                return Err(fail(format!("shared resource `{r}` is not registered")));
            }
        }
        Ok(Compiled { def, order })
    }
}

struct Compiled {
    def: WorkflowDefinition,
    order: Vec<String>,
}

struct GraphInstance {
    id: String,
    resources: Arc<SharedResourcePool>,
    hook: DebugHook,
    state: RwLock<Arc<Compiled>>,
}

impl WorkflowRuntime for GraphRuntime {
    fn new_instance(
        &self,
        id: &str,
        dsl: &[u8],
        _config: RuntimeConfig,
        hook: DebugHook,
    ) -> Result<Arc<dyn WorkflowInstance>, EngineError> {
        let compiled = Self::compile(&self.resources, id, dsl)?;
        Ok(Arc::new(GraphInstance {
            id: id.to_string(),
            resources: self.resources.clone(),
            hook,
            state: RwLock::new(Arc::new(compiled)),
        }))
    }
}

impl GraphInstance {
    fn compiled(&self) -> Arc<Compiled> {
        self.state.read().expect("compiled state poisoned").clone()
    }

    fn emit(&self, event: DebugEvent) {
        (self.hook)(&self.id, event);
    }
}

#[async_trait]
impl WorkflowInstance for GraphInstance {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn definition(&self) -> WorkflowDefinition {
        self.compiled().def.clone()
    }

    fn dsl(&self) -> Result<Vec<u8>, EngineError> {
        Ok(self.compiled().def.encode()?)
    }

    fn reload(&self, dsl: &[u8]) -> Result<(), EngineError> {
        let compiled = GraphRuntime::compile(&self.resources, &self.id, dsl)?;
        *self.state.write().expect("compiled state poisoned") = Arc::new(compiled);
        info!("Reloaded workflow `{}`", self.id);
        Ok(())
    }

    async fn process(&self, msg: Message) -> Result<Message, EngineError> {
        let compiled = self.compiled();
        let debug = compiled.def.workflow.debug_mode;
        for node_id in &compiled.order {
            if debug {
                self.emit(DebugEvent::new(
                    node_id,
                    FlowDirection::In,
                    msg.clone(),
                    "",
                    None,
                ));
                self.emit(DebugEvent::new(
                    node_id,
                    FlowDirection::Out,
                    msg.clone(),
                    REL_SUCCESS,
                    None,
                ));
            }
        }
        Ok(msg)
    }

    fn stop(&self) {
        warn!("Stopping workflow `{}`", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::tests::test_pool;
    use serde_json::json;
    use std::sync::Mutex;

    fn noop_hook() -> DebugHook {
        Arc::new(|_, _| {})
    }

    fn dsl(id: &str, debug: bool) -> Vec<u8> {
        json!({
            "workflow": {"id": id, "debugMode": debug},
            "metadata": {
                "nodes": [
                    {"id": "a", "type": "passthrough"},
                    {"id": "b", "type": "passthrough"}
                ],
                "connections": [{"fromId": "a", "toId": "b"}]
            }
        })
        .to_string()
        .into_bytes()
    }

    fn runtime() -> GraphRuntime {
        let (pool, _) = test_pool();
        GraphRuntime::new(Arc::new(pool))
    }

    #[tokio::test]
    async fn test_deploy_get_remove() {
        let pool = InstancePool::new(Arc::new(runtime()));
        pool.deploy("wf1", &dsl("wf1", false), RuntimeConfig::default(), noop_hook())
            .unwrap();
        assert!(pool.contains("wf1"));
        assert_eq!(pool.len(), 1);

        pool.remove("wf1");
        assert!(pool.get("wf1").is_none());
        pool.remove("wf1"); // idempotent
    }

    #[tokio::test]
    async fn test_compile_rejects_missing_shared_ref() {
        let pool = InstancePool::new(Arc::new(runtime()));
        let bad = json!({
            "workflow": {"id": "wf2"},
            "metadata": {
                "nodes": [
                    {"id": "a", "type": "client", "configuration": {"client": "ref://ghost"}}
                ]
            }
        })
        .to_string();
        let err = pool
            .deploy("wf2", bad.as_bytes(), RuntimeConfig::default(), noop_hook())
            .unwrap_err();
        assert!(matches!(err, EngineError::Compile { .. }));
        assert!(!pool.contains("wf2"));
    }

    #[tokio::test]
    async fn test_compile_resolves_registered_ref() {
        let (resources, _) = test_pool();
        resources
            .register_node(crate::definition::NodeDef {
                id: "db1".into(),
                kind: "netClient".into(),
                configuration: Default::default(),
            })
            .unwrap();
        let pool = InstancePool::new(Arc::new(GraphRuntime::new(Arc::new(resources))));

        let good = json!({
            "workflow": {"id": "wf3"},
            "metadata": {
                "nodes": [
                    {"id": "a", "type": "client", "configuration": {"client": "ref://db1"}}
                ]
            }
        })
        .to_string();
        pool.deploy("wf3", good.as_bytes(), RuntimeConfig::default(), noop_hook())
            .unwrap();
    }

    #[tokio::test]
    async fn test_reload_swaps_definition() {
        let pool = InstancePool::new(Arc::new(runtime()));
        let instance = pool
            .deploy("wf1", &dsl("wf1", false), RuntimeConfig::default(), noop_hook())
            .unwrap();
        assert!(!instance.definition().workflow.debug_mode);

        instance.reload(&dsl("wf1", true)).unwrap();
        assert!(instance.definition().workflow.debug_mode);

        // a broken reload keeps the previous compiled form
        assert!(instance.reload(b"not json").is_err());
        assert!(instance.definition().workflow.debug_mode);
    }

    #[tokio::test]
    async fn test_process_emits_debug_events_in_order() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let hook: DebugHook = {
            let seen = seen.clone();
            Arc::new(move |wf, ev| {
                seen.lock()
                    .unwrap()
                    .push((wf.to_string(), ev.node_id.clone()));
            })
        };
        let pool = InstancePool::new(Arc::new(runtime()));
        let instance = pool
            .deploy("wf1", &dsl("wf1", true), RuntimeConfig::default(), hook)
            .unwrap();

        let out = instance.process(Message::of(json!({"x": 1}))).await.unwrap();
        assert_eq!(out.payload(), json!({"x": 1}));

        let seen = seen.lock().unwrap();
        // two events per node, a before b
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|(wf, _)| wf == "wf1"));
        assert_eq!(seen[0].1, "a");
        assert_eq!(seen[3].1, "b");
    }

    #[tokio::test]
    async fn test_debug_mode_off_emits_nothing() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let hook: DebugHook = {
            let seen = seen.clone();
            Arc::new(move |_, ev| seen.lock().unwrap().push(ev.node_id.clone()))
        };
        let pool = InstancePool::new(Arc::new(runtime()));
        let instance = pool
            .deploy("wf1", &dsl("wf1", false), RuntimeConfig::default(), hook)
            .unwrap();
        instance.process(Message::of(json!(null))).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }
}
