pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod metrics;
pub mod registry;

pub use config::{
    AgentType, FeatureFlags, GlobalSettings, KnowledgeBaseBinding, SearchType, TenantConfig,
    TenantSettings, TenantsDocument,
};
pub use context::{CancelGuard, RequestContext};
pub use database::{PoolSettings, check_health};
pub use error::{Error, ErrorCode, Result};
pub use metrics::{GatewayMetrics, MetricsHandle, QuotaPolicy, UnlimitedQuota};
pub use registry::{Generation, ResolveHint, TenantRegistry, TenantRuntime};

// Re-export commonly used types from dependencies
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
