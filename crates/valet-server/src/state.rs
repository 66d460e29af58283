use std::sync::Arc;

use valet_broker::ToolBroker;
use valet_cache::Cache;
use valet_catalog::ToolCatalog;
use valet_core::ChatPipeline;
use valet_store::ConnectionRegistry;

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ChatPipeline>,
    pub registry: ConnectionRegistry,
    pub broker: Arc<dyn ToolBroker>,
    pub catalog: ToolCatalog,
    pub cache: Cache,
}
