use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::definition::{EndpointDef, NodeDef, WorkflowDefinition};
use crate::error::ResourceError;

/// The shared capability: a component that exposes one long-lived underlying
/// instance (a connection handle, a client, a server socket).
pub trait SharedComponent: Send + Sync {
    fn instance(&self) -> Result<Arc<dyn Any + Send + Sync>, ResourceError>;
}

/// A component built from a declarative node definition.
///
/// Only components that opt into `as_shared` may live in the pool; everything
/// else is rejected at registration time.
pub trait Component: Send + Sync {
    fn component_type(&self) -> &str;

    fn as_shared(&self) -> Option<&dyn SharedComponent> {
        None
    }

    /// Release whatever the component holds. Must be safe to call while a
    /// caller still holds a stale instance handle.
    fn destroy(&self) {}
}

pub trait ComponentBuilder: Send + Sync {
    fn build(&self, def: &NodeDef) -> Result<Box<dyn Component>, ResourceError>;
}

/// Component type name -> builder.
#[derive(Default)]
pub struct BuilderRegistry {
    builders: DashMap<String, Arc<dyn ComponentBuilder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: &str, builder: Arc<dyn ComponentBuilder>) {
        self.builders.insert(kind.to_string(), builder);
    }

    pub fn build(&self, def: &NodeDef) -> Result<Box<dyn Component>, ResourceError> {
        match self.builders.get(&def.kind) {
            Some(builder) => builder.build(def),
            None => Err(ResourceError::UnknownComponent(def.kind.clone())),
        }
    }
}

/// A registered entry: either an endpoint-style or a plain-node component,
/// dispatched through one surface.
pub enum SharedResourceEntry {
    Endpoint {
        dsl: Vec<u8>,
        component: Box<dyn Component>,
    },
    Node {
        dsl: Vec<u8>,
        component: Box<dyn Component>,
    },
}

impl std::fmt::Debug for SharedResourceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SharedResourceEntry::Endpoint { dsl, .. } => f
                .debug_struct("Endpoint")
                .field("dsl", dsl)
                .finish_non_exhaustive(),
            SharedResourceEntry::Node { dsl, .. } => f
                .debug_struct("Node")
                .field("dsl", dsl)
                .finish_non_exhaustive(),
        }
    }
}

impl SharedResourceEntry {
    fn component(&self) -> &dyn Component {
        match self {
            SharedResourceEntry::Endpoint { component, .. } => component.as_ref(),
            SharedResourceEntry::Node { component, .. } => component.as_ref(),
        }
    }

    pub fn component_type(&self) -> &str {
        self.component().component_type()
    }

    pub fn is_endpoint(&self) -> bool {
        matches!(self, SharedResourceEntry::Endpoint { .. })
    }

    /// The declarative blob this entry was registered from.
    pub fn dsl(&self) -> &[u8] {
        match self {
            SharedResourceEntry::Endpoint { dsl, .. } => dsl,
            SharedResourceEntry::Node { dsl, .. } => dsl,
        }
    }

    /// The live underlying instance, e.g. a connection handle.
    pub fn instance(&self) -> Result<Arc<dyn Any + Send + Sync>, ResourceError> {
        match self.component().as_shared() {
            Some(shared) => shared.instance(),
            None => Err(ResourceError::NotShared(
                self.component_type().to_string(),
            )),
        }
    }

    pub fn destroy(&self) {
        self.component().destroy();
    }
}

/// Registry of shared components keyed by resource id.
///
/// Duplicate ids are rejected, never replaced: two definitions racing to
/// create the same logical connection is a configuration error, not a
/// replace. Teardown is explicit; a caller that captured an instance before
/// a `remove` keeps using a released handle, so quiesce first.
pub struct SharedResourcePool {
    builders: Arc<BuilderRegistry>,
    entries: DashMap<String, Arc<SharedResourceEntry>>,
}

impl SharedResourcePool {
    pub fn new(builders: Arc<BuilderRegistry>) -> Self {
        Self {
            builders,
            entries: DashMap::new(),
        }
    }

    /// Register every shared resource a workflow definition declares,
    /// endpoints first, in declaration order. Stops at the first failure;
    /// earlier registrations stay in place.
    pub fn load(&self, dsl: &[u8]) -> Result<(), ResourceError> {
        let def = WorkflowDefinition::decode(dsl)?;
        for endpoint in &def.metadata.endpoints {
            self.register_endpoint(endpoint.clone())?;
        }
        for node in &def.metadata.nodes {
            self.register_node(node.clone())?;
        }
        Ok(())
    }

    pub fn register_endpoint(
        &self,
        def: EndpointDef,
    ) -> Result<Arc<SharedResourceEntry>, ResourceError> {
        let dsl = serde_json::to_vec(&def)?;
        self.insert(def.node.id.clone(), &def.node, dsl, true)
    }

    pub fn register_node(
        &self,
        def: NodeDef,
    ) -> Result<Arc<SharedResourceEntry>, ResourceError> {
        let dsl = serde_json::to_vec(&def)?;
        self.insert(def.id.clone(), &def, dsl, false)
    }

    fn insert(
        &self,
        id: String,
        node: &NodeDef,
        dsl: Vec<u8>,
        endpoint: bool,
    ) -> Result<Arc<SharedResourceEntry>, ResourceError> {
        if self.entries.contains_key(&id) {
            return Err(ResourceError::Duplicate(id));
        }
        let component = self.builders.build(node)?;
        if component.as_shared().is_none() {
            return Err(ResourceError::NotShared(node.kind.clone()));
        }
        let entry = Arc::new(if endpoint {
            SharedResourceEntry::Endpoint { dsl, component }
        } else {
            SharedResourceEntry::Node { dsl, component }
        });
        // re-check under the shard lock; a racing insert wins and we report
        // the duplicate
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => {
                entry.destroy();
                Err(ResourceError::Duplicate(id))
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                debug!("Registered shared resource `{}`", id);
                Ok(entry)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<SharedResourceEntry>> {
        self.entries.get(id).map(|kv| kv.value().clone())
    }

    /// The live underlying instance for `id`.
    pub fn instance(&self, id: &str) -> Result<Arc<dyn Any + Send + Sync>, ResourceError> {
        match self.get(id) {
            Some(entry) => entry.instance(),
            None => Err(ResourceError::NotFound(id.to_string())),
        }
    }

    /// Tear down and drop one entry. No-op when absent.
    pub fn remove(&self, id: &str) {
        if let Some((_, entry)) = self.entries.remove(id) {
            entry.destroy();
            info!("Removed shared resource `{}`", id);
        }
    }

    /// Tear down everything; used at shutdown.
    pub fn stop_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|kv| kv.key().clone()).collect();
        for id in ids {
            self.remove(&id);
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|kv| kv.key().clone()).collect()
    }

    pub fn all(&self) -> Vec<Arc<SharedResourceEntry>> {
        self.entries.iter().map(|kv| kv.value().clone()).collect()
    }

    /// Decode every entry's stored blob back into its declarative form,
    /// grouped by component type. The first decode failure aborts the whole
    /// enumeration.
    pub fn all_definitions(&self) -> Result<HashMap<String, Vec<NodeDef>>, ResourceError> {
        let mut result: HashMap<String, Vec<NodeDef>> = HashMap::new();
        for kv in self.entries.iter() {
            let entry = kv.value();
            let def: NodeDef = serde_json::from_slice(entry.dsl())?;
            result
                .entry(entry.component_type().to_string())
                .or_default()
                .push(def);
        }
        Ok(result)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A shared component standing in for a network client.
    pub struct TestClient {
        kind: String,
        handle: Arc<String>,
        destroyed: Arc<AtomicBool>,
    }

    impl SharedComponent for TestClient {
        fn instance(&self) -> Result<Arc<dyn Any + Send + Sync>, ResourceError> {
            Ok(self.handle.clone())
        }
    }

    impl Component for TestClient {
        fn component_type(&self) -> &str {
            &self.kind
        }

        fn as_shared(&self) -> Option<&dyn SharedComponent> {
            Some(self)
        }

        fn destroy(&self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    /// A component without the shared capability.
    struct PlainComponent;

    impl Component for PlainComponent {
        fn component_type(&self) -> &str {
            "plain"
        }
    }

    pub struct TestClientBuilder {
        pub destroyed: Arc<AtomicBool>,
    }

    impl ComponentBuilder for TestClientBuilder {
        fn build(&self, def: &NodeDef) -> Result<Box<dyn Component>, ResourceError> {
            if def.configuration.get("broken").is_some() {
                return Err(ResourceError::Build("refused to connect".into()));
            }
            Ok(Box::new(TestClient {
                kind: def.kind.clone(),
                handle: Arc::new(format!("conn:{}", def.id)),
                destroyed: self.destroyed.clone(),
            }))
        }
    }

    struct PlainBuilder;

    impl ComponentBuilder for PlainBuilder {
        fn build(&self, _def: &NodeDef) -> Result<Box<dyn Component>, ResourceError> {
            Ok(Box::new(PlainComponent))
        }
    }

    pub fn test_pool() -> (SharedResourcePool, Arc<AtomicBool>) {
        let destroyed = Arc::new(AtomicBool::new(false));
        let builders = Arc::new(BuilderRegistry::new());
        builders.register(
            "netClient",
            Arc::new(TestClientBuilder {
                destroyed: destroyed.clone(),
            }),
        );
        builders.register("plain", Arc::new(PlainBuilder));
        (SharedResourcePool::new(builders), destroyed)
    }

    fn node(id: &str) -> NodeDef {
        NodeDef {
            id: id.to_string(),
            kind: "netClient".to_string(),
            configuration: HashMap::new(),
        }
    }

    #[test]
    fn test_duplicate_then_delete_then_reregister() {
        let (pool, _) = test_pool();

        pool.register_node(node("db1")).unwrap();
        let err = pool.register_node(node("db1")).unwrap_err();
        assert!(matches!(err, ResourceError::Duplicate(ref id) if id == "db1"));

        // the first entry is untouched
        let handle = pool.instance("db1").unwrap();
        assert_eq!(
            handle.downcast_ref::<String>().map(String::as_str),
            Some("conn:db1")
        );

        pool.remove("db1");
        pool.register_node(node("db1")).unwrap();
    }

    #[test]
    fn test_instance_not_found() {
        let (pool, _) = test_pool();
        let err = pool.instance("missing").unwrap_err();
        assert!(matches!(err, ResourceError::NotFound(_)));
    }

    #[test]
    fn test_non_shared_component_rejected() {
        let (pool, _) = test_pool();
        let def = NodeDef {
            id: "p1".into(),
            kind: "plain".into(),
            configuration: HashMap::new(),
        };
        let err = pool.register_node(def).unwrap_err();
        assert!(matches!(err, ResourceError::NotShared(_)));
        assert!(pool.get("p1").is_none());
    }

    #[test]
    fn test_unknown_component_type() {
        let (pool, _) = test_pool();
        let def = NodeDef {
            id: "x".into(),
            kind: "teleporter".into(),
            configuration: HashMap::new(),
        };
        assert!(matches!(
            pool.register_node(def).unwrap_err(),
            ResourceError::UnknownComponent(_)
        ));
    }

    #[test]
    fn test_remove_destroys_component() {
        let (pool, destroyed) = test_pool();
        pool.register_node(node("db1")).unwrap();
        assert!(!destroyed.load(Ordering::SeqCst));
        pool.remove("db1");
        assert!(destroyed.load(Ordering::SeqCst));
        // removing again is a no-op
        pool.remove("db1");
    }

    #[test]
    fn test_load_stops_at_first_failure_keeping_prior() {
        let (pool, _) = test_pool();
        let dsl = json!({
            "workflow": {"id": "wf"},
            "metadata": {
                "endpoints": [
                    {"id": "http1", "type": "netClient"}
                ],
                "nodes": [
                    {"id": "db1", "type": "netClient"},
                    {"id": "db2", "type": "netClient", "configuration": {"broken": true}},
                    {"id": "db3", "type": "netClient"}
                ]
            }
        })
        .to_string();

        let err = pool.load(dsl.as_bytes()).unwrap_err();
        assert!(matches!(err, ResourceError::Build(_)));

        // endpoints first, then nodes up to the failure; no rollback
        assert!(pool.get("http1").is_some());
        assert!(pool.get("db1").is_some());
        assert!(pool.get("db2").is_none());
        assert!(pool.get("db3").is_none());
        assert!(pool.get("http1").unwrap().is_endpoint());
    }

    #[test]
    fn test_all_definitions_grouped_by_type() {
        let (pool, _) = test_pool();
        pool.register_node(node("db1")).unwrap();
        pool.register_node(node("db2")).unwrap();

        let defs = pool.all_definitions().unwrap();
        let clients = defs.get("netClient").unwrap();
        let mut ids: Vec<&str> = clients.iter().map(|d| d.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["db1", "db2"]);
    }

    #[test]
    fn test_stop_all_empties_pool() {
        let (pool, _) = test_pool();
        pool.register_node(node("a")).unwrap();
        pool.register_node(node("b")).unwrap();
        pool.stop_all();
        assert!(pool.ids().is_empty());
    }
}
