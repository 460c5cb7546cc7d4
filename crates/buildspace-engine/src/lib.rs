//! Per-session conversation engine, tool dispatch table, and the tools the
//! two gateways expose.

pub mod conversation;
pub mod error;
pub mod plan_source;
pub mod registry;
pub mod tools;
pub mod workspace;

pub use conversation::{Conversation, ServerInfo};
pub use error::EngineError;
pub use plan_source::{HttpPlanSource, PlanSource, PlanSourceError};
pub use registry::ToolRegistry;
pub use workspace::{AcquirerConfig, WorkspaceAcquirer, WorkspaceError};
