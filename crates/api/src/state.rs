use askgate_agents::Dispatcher;
use askgate_core::{MetricsHandle, TenantRegistry};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TenantRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: MetricsHandle,
    /// Where the tenants document was loaded from, for `/admin/reload`.
    pub config_path: Option<PathBuf>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}
