pub mod registry;
pub mod service;

pub use registry::TenantRegistry;
pub use service::{DebugHub, ObserverCallback, WorkflowEngineService};
