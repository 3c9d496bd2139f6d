//! Prometheus metrics for the gateway.
//!
//! A single [`GatewayMetrics`] instance is built at startup, registered
//! into one registry, and shared through the application state. Token
//! usage is accounted per tenant; no quota is enforced in core, but the
//! [`QuotaPolicy`] seam is where enforcement would plug in.

pub mod gateway_metrics;

pub use gateway_metrics::GatewayMetrics;

use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tracing::warn;

/// Centralized metrics registry wrapper.
#[derive(Clone)]
pub struct MetricsHandle {
    registry: Arc<Registry>,
    pub gateway: GatewayMetrics,
}

impl MetricsHandle {
    pub fn new(namespace: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some(namespace.to_string()), None)
            .unwrap_or_else(|_| {
                warn!("failed to create namespaced registry, using default");
                Registry::new()
            });
        let gateway = GatewayMetrics::new()?;
        gateway.register_on(&registry)?;
        Ok(Self {
            registry: Arc::new(registry),
            gateway,
        })
    }

    /// Text exposition for `GET /metrics`.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            warn!("failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Reserved enforcement hook. Token usage is recorded per tenant but no
/// threshold is configured in core.
pub trait QuotaPolicy: Send + Sync {
    /// Returns false to refuse further LLM calls for the tenant.
    fn admit(&self, tenant_id: &str, tokens_used_total: u64) -> bool;
}

/// The default policy admits everything.
pub struct UnlimitedQuota;

impl QuotaPolicy for UnlimitedQuota {
    fn admit(&self, _tenant_id: &str, _tokens_used_total: u64) -> bool {
        true
    }
}
