pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logger;
pub mod message;
pub mod resource;
pub mod store;
pub mod trace;

pub use config::RuntimeConfig;
pub use definition::WorkflowDefinition;
pub use engine::{TenantRegistry, WorkflowEngineService};
pub use error::{EngineError, ResourceError};
pub use message::Message;
pub use resource::SharedResourcePool;
