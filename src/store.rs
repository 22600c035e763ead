use std::path::PathBuf;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::config::{DIR_RULES, DIR_RUNS, DIR_WORKFLOWS};
use crate::definition::WorkflowDefinition;
use crate::error::EngineError;
use crate::message::Message;

/// Filter for `DefinitionStore::list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowKind {
    #[default]
    All,
    Root,
    Sub,
}

impl WorkflowKind {
    fn matches(&self, def: &WorkflowDefinition) -> bool {
        match self {
            WorkflowKind::All => true,
            WorkflowKind::Root => def.workflow.root,
            WorkflowKind::Sub => !def.workflow.root,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Persistence delegate for workflow documents. One declarative document per
/// workflow id per tenant; the medium is opaque to the engine.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn get(&self, tenant: &str, id: &str) -> Result<Vec<u8>, EngineError>;

    async fn save(&self, tenant: &str, id: &str, dsl: &[u8]) -> Result<(), EngineError>;

    /// Keyword is a case-insensitive substring match over id and name.
    /// `page` is 1-based; `size == 0` disables pagination.
    async fn list(
        &self,
        tenant: &str,
        keywords: &str,
        kind: WorkflowKind,
        size: usize,
        page: usize,
    ) -> Result<Page<WorkflowDefinition>, EngineError>;

    async fn delete(&self, tenant: &str, id: &str) -> Result<(), EngineError>;

    /// Every persisted workflow id for a tenant, for bootstrap enumeration.
    async fn ids(&self, tenant: &str) -> Result<Vec<String>, EngineError>;
}

/// Execution-log collaborator: run snapshots out, dependent records purged
/// when a workflow is deleted.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist the resulting envelope of one run, message id and session
    /// included.
    async fn save_run_log(
        &self,
        tenant: &str,
        workflow_id: &str,
        result: &Message,
    ) -> Result<(), EngineError>;

    async fn delete_by_workflow(&self, tenant: &str, workflow_id: &str)
        -> Result<(), EngineError>;
}

fn page_slice<T>(mut items: Vec<T>, size: usize, page: usize) -> Page<T> {
    let total = items.len();
    if size == 0 {
        return Page { items, total };
    }
    let page = page.max(1);
    let start = (page - 1) * size;
    let items = if start >= total {
        Vec::new()
    } else {
        items.drain(start..total.min(start + size)).collect()
    };
    Page { items, total }
}

fn filter_sort(
    mut defs: Vec<WorkflowDefinition>,
    keywords: &str,
    kind: WorkflowKind,
) -> Vec<WorkflowDefinition> {
    let needle = keywords.to_lowercase();
    defs.retain(|def| {
        kind.matches(def)
            && (needle.is_empty()
                || def.workflow.id.to_lowercase().contains(&needle)
                || def.workflow.name.to_lowercase().contains(&needle))
    });
    // newest first
    defs.sort_by(|a, b| {
        b.update_time()
            .unwrap_or_default()
            .cmp(a.update_time().unwrap_or_default())
    });
    defs
}

/// File-backed store: `<root>/workflows/<tenant>/rules/<id>.json`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn rules_dir(&self, tenant: &str) -> PathBuf {
        self.root.join(DIR_WORKFLOWS).join(tenant).join(DIR_RULES)
    }

    fn rule_path(&self, tenant: &str, id: &str) -> PathBuf {
        self.rules_dir(tenant).join(format!("{id}.json"))
    }

    async fn read_all(&self, tenant: &str) -> Result<Vec<WorkflowDefinition>, EngineError> {
        let dir = self.rules_dir(tenant);
        let mut defs = Vec::new();
        if !dir.exists() {
            return Ok(defs);
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match WorkflowDefinition::decode(&bytes) {
                Ok(def) => defs.push(def),
                Err(e) => warn!("Skipping undecodable workflow file {}: {e}", path.display()),
            }
        }
        Ok(defs)
    }
}

#[async_trait]
impl DefinitionStore for FileStore {
    async fn get(&self, tenant: &str, id: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.rule_path(tenant, id);
        tokio::fs::read(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EngineError::WorkflowNotFound(id.to_string()),
                _ => EngineError::Persistence(e.to_string()),
            })
    }

    async fn save(&self, tenant: &str, id: &str, dsl: &[u8]) -> Result<(), EngineError> {
        let dir = self.rules_dir(tenant);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        tokio::fs::write(self.rule_path(tenant, id), dsl)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    async fn list(
        &self,
        tenant: &str,
        keywords: &str,
        kind: WorkflowKind,
        size: usize,
        page: usize,
    ) -> Result<Page<WorkflowDefinition>, EngineError> {
        let defs = filter_sort(self.read_all(tenant).await?, keywords, kind);
        Ok(page_slice(defs, size, page))
    }

    async fn delete(&self, tenant: &str, id: &str) -> Result<(), EngineError> {
        let path = self.rule_path(tenant, id);
        tokio::fs::remove_file(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::WorkflowNotFound(id.to_string()),
            _ => EngineError::Persistence(e.to_string()),
        })
    }

    async fn ids(&self, tenant: &str) -> Result<Vec<String>, EngineError> {
        let dir = self.rules_dir(tenant);
        let mut ids = Vec::new();
        if !dir.exists() {
            return Ok(ids);
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Run snapshots under `<root>/workflows/<tenant>/runs/<workflow>/`.
pub struct FileEventStore {
    root: PathBuf,
}

impl FileEventStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn runs_dir(&self, tenant: &str, workflow_id: &str) -> PathBuf {
        self.root
            .join(DIR_WORKFLOWS)
            .join(tenant)
            .join(DIR_RUNS)
            .join(workflow_id)
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn save_run_log(
        &self,
        tenant: &str,
        workflow_id: &str,
        result: &Message,
    ) -> Result<(), EngineError> {
        let dir = self.runs_dir(tenant, workflow_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let path = dir.join(format!("{}.json", result.id()));
        let bytes =
            serde_json::to_vec_pretty(result).map_err(|e| EngineError::Persistence(e.to_string()))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    async fn delete_by_workflow(
        &self,
        tenant: &str,
        workflow_id: &str,
    ) -> Result<(), EngineError> {
        let dir = self.runs_dir(tenant, workflow_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Persistence(e.to_string())),
        }
    }
}

/// Hermetic in-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    // tenant -> workflow id -> document bytes
    docs: DashMap<String, DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn get(&self, tenant: &str, id: &str) -> Result<Vec<u8>, EngineError> {
        self.docs
            .get(tenant)
            .and_then(|docs| docs.get(id).map(|kv| kv.value().clone()))
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))
    }

    async fn save(&self, tenant: &str, id: &str, dsl: &[u8]) -> Result<(), EngineError> {
        self.docs
            .entry(tenant.to_string())
            .or_default()
            .insert(id.to_string(), dsl.to_vec());
        Ok(())
    }

    async fn list(
        &self,
        tenant: &str,
        keywords: &str,
        kind: WorkflowKind,
        size: usize,
        page: usize,
    ) -> Result<Page<WorkflowDefinition>, EngineError> {
        let mut defs = Vec::new();
        if let Some(docs) = self.docs.get(tenant) {
            for kv in docs.iter() {
                if let Ok(def) = WorkflowDefinition::decode(kv.value()) {
                    defs.push(def);
                }
            }
        }
        Ok(page_slice(filter_sort(defs, keywords, kind), size, page))
    }

    async fn delete(&self, tenant: &str, id: &str) -> Result<(), EngineError> {
        let removed = self
            .docs
            .get(tenant)
            .and_then(|docs| docs.remove(id));
        match removed {
            Some(_) => Ok(()),
            None => Err(EngineError::WorkflowNotFound(id.to_string())),
        }
    }

    async fn ids(&self, tenant: &str) -> Result<Vec<String>, EngineError> {
        let mut ids: Vec<String> = self
            .docs
            .get(tenant)
            .map(|docs| docs.iter().map(|kv| kv.key().clone()).collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }
}

/// Discards run logs; purge is a no-op.
#[derive(Default)]
pub struct NoopEventStore;

#[async_trait]
impl EventStore for NoopEventStore {
    async fn save_run_log(
        &self,
        _tenant: &str,
        _workflow_id: &str,
        _result: &Message,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn delete_by_workflow(
        &self,
        _tenant: &str,
        _workflow_id: &str,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}
