use std::any::Any;
use std::sync::Arc;

use chainloom::config::RuntimeConfig;
use chainloom::definition::{NodeDef, WorkflowDefinition, KEY_MESSAGE};
use chainloom::engine::TenantRegistry;
use chainloom::error::EngineError;
use chainloom::executor::GraphRuntime;
use chainloom::message::Message;
use chainloom::resource::{
    BuilderRegistry, Component, ComponentBuilder, SharedComponent, SharedResourcePool,
};
use chainloom::store::{FileEventStore, FileStore, WorkflowKind};
use serde_json::json;

struct FakeClient {
    url: Arc<String>,
}

impl SharedComponent for FakeClient {
    fn instance(&self) -> Result<Arc<dyn Any + Send + Sync>, chainloom::ResourceError> {
        Ok(self.url.clone())
    }
}

impl Component for FakeClient {
    fn component_type(&self) -> &str {
        "fakeClient"
    }

    fn as_shared(&self) -> Option<&dyn SharedComponent> {
        Some(self)
    }
}

struct FakeClientBuilder;

impl ComponentBuilder for FakeClientBuilder {
    fn build(&self, def: &NodeDef) -> Result<Box<dyn Component>, chainloom::ResourceError> {
        let url = def
            .configuration
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("fake://localhost")
            .to_string();
        Ok(Box::new(FakeClient { url: Arc::new(url) }))
    }
}

fn test_registry(root: &std::path::Path) -> (TenantRegistry, Arc<SharedResourcePool>) {
    let builders = Arc::new(BuilderRegistry::new());
    builders.register("fakeClient", Arc::new(FakeClientBuilder));
    let resources = Arc::new(SharedResourcePool::new(builders));

    let config = RuntimeConfig {
        data_dir: root.to_path_buf(),
        ..Default::default()
    };
    let registry = TenantRegistry::new(
        config,
        Arc::new(FileStore::new(root.to_path_buf())),
        Arc::new(FileEventStore::new(root.to_path_buf())),
        Arc::new(GraphRuntime::new(resources.clone())),
    );
    (registry, resources)
}

fn pipeline_dsl(id: &str, client_ref: Option<&str>) -> Vec<u8> {
    let mut first = json!({"id": "fetch", "type": "fakeClient"});
    if let Some(res) = client_ref {
        first = json!({"id": "fetch", "type": "fakeClient", "configuration": {"ref": format!("ref://{res}")}});
    }
    json!({
        "workflow": {"id": id, "name": "pipeline", "root": true, "debugMode": true},
        "metadata": {
            "nodes": [first, {"id": "store", "type": "fakeClient"}],
            "connections": [{"fromId": "fetch", "toId": "store"}]
        }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn test_save_execute_and_survive_restart() {
    let root = tempfile::tempdir().unwrap();
    let (registry, _resources) = test_registry(root.path());

    let service = registry.get_or_init("alice").await.unwrap();
    service.save("wf1", &pipeline_dsl("wf1", None)).await.unwrap();
    assert!(service.is_deployed("wf1"));

    let out = service
        .execute_and_wait("wf1", Message::of(json!({"order": 42})))
        .await
        .unwrap();
    assert_eq!(out.payload(), json!({"order": 42}));

    // the definition landed on disk under the tenant's workspace
    let path = root.path().join("workflows/alice/rules/wf1.json");
    assert!(path.exists());

    // so did the run envelope, named after the message id
    let run = root
        .path()
        .join(format!("workflows/alice/runs/wf1/{}.json", out.id()));
    let logged: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&run).unwrap()).unwrap();
    assert_eq!(logged["payload"], json!({"order": 42}));

    // a fresh registry over the same root restores the deployment
    let (restarted, _) = test_registry(root.path());
    restarted.load_existing().await.unwrap();
    let service = restarted.get("alice").unwrap();
    assert!(service.is_deployed("wf1"));
}

#[tokio::test]
async fn test_shared_reference_gates_deployment() {
    let root = tempfile::tempdir().unwrap();
    let (registry, resources) = test_registry(root.path());
    let service = registry.get_or_init("alice").await.unwrap();

    // referenced resource does not exist yet
    let err = service
        .save("wf1", &pipeline_dsl("wf1", Some("db1")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Compile { .. }));
    assert!(!service.is_deployed("wf1"));

    let persisted =
        WorkflowDefinition::decode(&service.get("wf1").await.unwrap()).unwrap();
    assert!(persisted.workflow.disabled);
    assert!(persisted.workflow.additional_info.contains_key(KEY_MESSAGE));

    // register the resource, then deploy the persisted definition
    resources
        .register_node(NodeDef {
            id: "db1".into(),
            kind: "fakeClient".into(),
            configuration: [("url".to_string(), json!("fake://db1"))].into(),
        })
        .unwrap();
    service.deploy("wf1").await.unwrap();
    assert!(service.is_deployed("wf1"));
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let root = tempfile::tempdir().unwrap();
    let (registry, _) = test_registry(root.path());

    let alice = registry.get_or_init("alice").await.unwrap();
    let bob = registry.get_or_init("bob").await.unwrap();

    alice.save("wf1", &pipeline_dsl("wf1", None)).await.unwrap();
    assert!(alice.is_deployed("wf1"));
    assert!(!bob.is_deployed("wf1"));
    assert!(matches!(
        bob.get("wf1").await.unwrap_err(),
        EngineError::WorkflowNotFound(_)
    ));

    let page = alice.list("", WorkflowKind::All, 0, 1).await.unwrap();
    assert_eq!(page.total, 1);
    let page = bob.list("", WorkflowKind::All, 0, 1).await.unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn test_lifecycle_round_trip_on_disk() {
    let root = tempfile::tempdir().unwrap();
    let (registry, _) = test_registry(root.path());
    let service = registry.get_or_init("alice").await.unwrap();

    service.save("wf1", &pipeline_dsl("wf1", None)).await.unwrap();
    service.undeploy("wf1").await.unwrap();
    assert!(!service.is_deployed("wf1"));

    // a restart must not bring a disabled workflow back
    let (restarted, _) = test_registry(root.path());
    restarted.load_existing().await.unwrap();
    let service = restarted.get("alice").unwrap();
    assert!(!service.is_deployed("wf1"));

    service.deploy("wf1").await.unwrap();
    assert!(service.is_deployed("wf1"));

    service.delete("wf1").await.unwrap();
    assert!(!service.is_deployed("wf1"));
    assert!(!root.path().join("workflows/alice/rules/wf1.json").exists());
}

#[tokio::test]
async fn test_debug_trace_reachable_through_service() {
    let root = tempfile::tempdir().unwrap();
    let (registry, _) = test_registry(root.path());
    let service = registry.get_or_init("alice").await.unwrap();

    service.save("wf1", &pipeline_dsl("wf1", None)).await.unwrap();
    service
        .execute_and_wait("wf1", Message::of(json!("ping")))
        .await
        .unwrap();

    let events = service.debug_events("wf1", "fetch");
    assert_eq!(events.len(), 2);
    assert!(service.debug_events("wf1", "store").len() == 2);
    assert!(service.debug_events("wf1", "ghost").is_empty());
}
