use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::PathBuf};
use tracing::info;

pub const DIR_WORKFLOWS: &str = "workflows";
pub const DIR_RULES: &str = "rules";
pub const DIR_SCRIPTS: &str = "scripts";
pub const DIR_PLUGINS: &str = "plugins";
pub const DIR_RUNS: &str = "runs";

/// How many debug events each (workflow, node) buffer keeps by default.
pub const DEFAULT_NODE_LOG_SIZE: usize = 40;

/// Runtime configuration: global defaults plus per-tenant overrides.
/// A service receives a merged snapshot at bootstrap, never the live value.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeConfig {
    /// Root of the on-disk workspace tree.
    #[serde(default = "RuntimeConfig::default_data_dir")]
    pub data_dir: PathBuf,

    /// Per-node debug buffer capacity. Zero means the default.
    #[serde(default)]
    pub max_node_log_size: usize,

    /// Upper bound handed to the script engine, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_max_execution_ms: Option<u64>,

    /// Free-form key/values made available to every workflow instance.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,

    /// Tenant-specific overrides, keyed by tenant id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tenants: HashMap<String, TenantOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TenantOverrides {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_node_log_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_max_execution_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            max_node_log_size: 0,
            script_max_execution_ms: None,
            properties: HashMap::new(),
            tenants: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from("./chainloom")
    }

    /// Read `config.json` from `dir`, falling back to defaults when absent.
    pub fn load(dir: &PathBuf) -> anyhow::Result<Self> {
        let path = dir.join("config.json");
        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let mut config: RuntimeConfig = serde_json::from_str(&contents)?;
            config.data_dir = dir.clone();
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            Ok(Self {
                data_dir: dir.clone(),
                ..Default::default()
            })
        }
    }

    /// Effective per-node buffer capacity.
    pub fn node_log_size(&self) -> usize {
        if self.max_node_log_size == 0 {
            DEFAULT_NODE_LOG_SIZE
        } else {
            self.max_node_log_size
        }
    }

    /// Merge the global defaults with a tenant's overrides into a snapshot.
    /// Tenant properties win on key collision.
    pub fn for_tenant(&self, tenant: &str) -> RuntimeConfig {
        let mut merged = self.clone();
        merged.tenants.clear();
        if let Some(overrides) = self.tenants.get(tenant) {
            for (k, v) in &overrides.properties {
                merged.properties.insert(k.clone(), v.clone());
            }
            if let Some(size) = overrides.max_node_log_size {
                merged.max_node_log_size = size;
            }
            if let Some(ms) = overrides.script_max_execution_ms {
                merged.script_max_execution_ms = Some(ms);
            }
        }
        merged
    }

    /// `<data_dir>/workflows/<tenant>`
    pub fn workspace_dir(&self, tenant: &str) -> PathBuf {
        self.data_dir.join(DIR_WORKFLOWS).join(tenant)
    }
}
