pub mod analyzer;
pub mod catalog;
pub mod config;
pub mod context_init;
pub mod dispatcher;
pub mod execution;
pub mod persist;
pub mod pipeline;
pub mod router;
pub mod session_lock;

#[cfg(test)]
pub(crate) mod testutil;

pub use analyzer::{analysis_schema, Analyzer};
pub use catalog::TopToolsCatalog;
pub use config::Config;
pub use context_init::{ContextInitializer, TurnContext};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use execution::ExecutionContext;
pub use persist::PersistWriter;
pub use pipeline::ChatPipeline;
pub use router::{PreparedTools, RouteDecision, ToolPreparer, ToolRouter};
pub use session_lock::{SessionLockGuard, SessionLockManager};
