//! # Tenant Registry
//!
//! Single source of truth for tenant identity, credentials, and policy.
//!
//! ```text
//! ┌───────────────────┐   swap    ┌───────────────────┐
//! │  Generation N     │ ────────▶ │  Generation N+1   │
//! │                   │           │                   │
//! │  tenant ──▶ rt ───┼─▶ PgPool  │  tenant ──▶ rt ───┼─▶ PgPool
//! │  tenant ──▶ rt    │           │  tenant ──▶ rt    │
//! └───────────────────┘           └───────────────────┘
//!        ▲ readers hold an Arc for the whole request
//! ```
//!
//! The registry is read-mostly. Readers take an `Arc<Generation>` snapshot
//! once per request and resolve against it, so a reload mid-request can
//! never expose a mixed configuration. Writers build a complete new
//! generation, swap the pointer, and drain the old generation's pools
//! after a grace window.
//!
//! Isolation invariant: a [`TenantRuntime`] owns its pool exclusively.
//! There is no path from one tenant's runtime to another tenant's pool.

use crate::config::{GlobalSettings, TenantConfig, TenantsDocument};
use crate::database::{self, PoolSettings};
use crate::error::{Error, ErrorCode, Result};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Grace window before a retired generation's pools are closed.
const DRAIN_GRACE: Duration = Duration::from_secs(60);

/// A tenant's live state: immutable config plus a lazily built pool.
#[derive(Debug)]
pub struct TenantRuntime {
    pub config: TenantConfig,
    pool_settings: PoolSettings,
    pool: OnceCell<PgPool>,
}

impl TenantRuntime {
    fn new(config: TenantConfig, pool_settings: PoolSettings) -> Self {
        Self {
            config,
            pool_settings,
            pool: OnceCell::new(),
        }
    }

    /// The tenant's pool, constructed on first use.
    pub async fn pool(&self) -> Result<&PgPool> {
        self.pool
            .get_or_try_init(|| async {
                info!(tenant = %self.config.id, "building tenant pool");
                database::build_tenant_pool(
                    &self.config.id,
                    &self.config.database,
                    &self.pool_settings,
                )
            })
            .await
    }

    /// The pool if a previous request already built it.
    pub fn pool_if_built(&self) -> Option<&PgPool> {
        self.pool.get()
    }

    /// Connects and probes the tenant database.
    pub async fn smoke_connect(&self) -> Result<()> {
        let pool = self.pool().await?;
        database::check_health(pool).await
    }
}

/// A coherent snapshot of the configuration document plus runtimes.
pub struct Generation {
    pub serial: u64,
    pub document: Arc<TenantsDocument>,
    runtimes: BTreeMap<String, Arc<TenantRuntime>>,
}

/// Where the request carried tenant identity from. Ordered by precedence.
#[derive(Debug, Clone, Default)]
pub struct ResolveHint {
    /// `X-Tenant-ID` header (or the configured header name)
    pub header: Option<String>,
    /// Bearer token from `Authorization`, possibly `sk-<tenant>`
    pub bearer: Option<String>,
    /// `model` field, possibly `<tenant>-<model>`
    pub model: Option<String>,
    /// `tenant_id` field in the request body
    pub body: Option<String>,
}

impl Generation {
    fn build(serial: u64, document: TenantsDocument, pool_settings: &PoolSettings) -> Self {
        let runtimes = document
            .tenants
            .iter()
            .map(|(id, config)| {
                (
                    id.clone(),
                    Arc::new(TenantRuntime::new(config.clone(), pool_settings.clone())),
                )
            })
            .collect();
        Self {
            serial,
            document: Arc::new(document),
            runtimes,
        }
    }

    pub fn policy(&self) -> &GlobalSettings {
        &self.document.global_settings
    }

    pub fn tenant_ids(&self) -> impl Iterator<Item = &str> {
        self.runtimes.keys().map(String::as_str)
    }

    pub fn runtime(&self, tenant_id: &str) -> Option<Arc<TenantRuntime>> {
        self.runtimes.get(tenant_id).cloned()
    }

    /// Resolves the originating tenant for a request.
    ///
    /// Search order: explicit header, API-key convention `sk-<tenant>`,
    /// model-name convention `<tenant>-<model>`, body `tenant_id`, then
    /// the default tenant when policy allows. A header and body that both
    /// name a tenant but disagree is a client error, not a precedence
    /// question.
    pub fn resolve(&self, hint: &ResolveHint) -> Result<Arc<TenantRuntime>> {
        let security = &self.policy().security;

        if let (Some(h), Some(b)) = (&hint.header, &hint.body) {
            if h != b {
                return Err(Error::new(
                    ErrorCode::TenantConflict,
                    format!("header names tenant '{h}' but body names '{b}'"),
                ));
            }
        }

        if let Some(id) = &hint.header {
            return self.resolve_id(id);
        }

        if security.require_tenant_header {
            return Err(Error::tenant_required());
        }

        if let Some(bearer) = &hint.bearer {
            if let Some(rest) = bearer.strip_prefix("sk-") {
                if let Some(id) = self.match_id_prefix(rest) {
                    return self.resolve_id(&id);
                }
            }
        }

        if let Some(model) = &hint.model {
            if let Some(id) = self.match_id_prefix(model) {
                return self.resolve_id(&id);
            }
        }

        if let Some(id) = &hint.body {
            return self.resolve_id(id);
        }

        if security.default_tenant_on_missing {
            if let Some(id) = &self.document.default_tenant {
                return self.resolve_id(id);
            }
        }

        Err(Error::tenant_required())
    }

    fn resolve_id(&self, id: &str) -> Result<Arc<TenantRuntime>> {
        self.runtimes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::tenant_unknown(id))
    }

    /// Finds the configured tenant id that prefixes `value` (either the
    /// whole value or followed by `-`). Tenant ids may themselves contain
    /// dashes, so the longest configured id wins.
    fn match_id_prefix(&self, value: &str) -> Option<String> {
        self.runtimes
            .keys()
            .filter(|id| {
                value == id.as_str()
                    || value
                        .strip_prefix(id.as_str())
                        .is_some_and(|rest| rest.starts_with('-'))
            })
            .max_by_key(|id| id.len())
            .cloned()
    }

    /// Checks a presented API key against the tenant's configured keys.
    /// Tenants with no keys configured accept any caller that already
    /// resolved to them by id conventions.
    pub fn authorize(&self, runtime: &TenantRuntime, bearer: Option<&str>) -> Result<()> {
        if runtime.config.api_keys.is_empty() {
            return Ok(());
        }
        let presented = bearer.ok_or_else(|| {
            Error::new(
                ErrorCode::UnauthorizedTenant,
                format!("tenant '{}' requires an API key", runtime.config.id),
            )
        })?;
        let accepted = presented == format!("sk-{}", runtime.config.id)
            || runtime.config.api_keys.values().any(|k| k == presented);
        if accepted {
            Ok(())
        } else {
            Err(Error::new(
                ErrorCode::UnauthorizedTenant,
                format!("API key not valid for tenant '{}'", runtime.config.id),
            ))
        }
    }
}

/// Process-wide registry holding the current generation.
pub struct TenantRegistry {
    current: RwLock<Arc<Generation>>,
    serial: AtomicU64,
    pool_settings: PoolSettings,
}

impl TenantRegistry {
    /// Builds the registry from a validated document.
    pub fn load(document: TenantsDocument) -> Self {
        let pool_settings = PoolSettings::default();
        let generation = Arc::new(Generation::build(1, document, &pool_settings));
        info!(
            tenants = generation.runtimes.len(),
            "tenant registry loaded"
        );
        Self {
            current: RwLock::new(generation),
            serial: AtomicU64::new(1),
            pool_settings,
        }
    }

    /// The current generation. Callers hold the returned `Arc` for the
    /// duration of one request so they observe a single coherent config.
    pub fn snapshot(&self) -> Arc<Generation> {
        self.current.read().expect("registry lock poisoned").clone()
    }

    /// Atomically publishes a new generation and drains the old one.
    pub fn reload(&self, document: TenantsDocument) -> Arc<Generation> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        let next = Arc::new(Generation::build(serial, document, &self.pool_settings));
        let previous = {
            let mut slot = self.current.write().expect("registry lock poisoned");
            std::mem::replace(&mut *slot, next.clone())
        };
        info!(
            old = previous.serial,
            new = next.serial,
            "tenant configuration reloaded"
        );
        tokio::spawn(drain_generation(previous, DRAIN_GRACE));
        next
    }

    /// Strict-mode startup probe: every tenant database must answer.
    pub async fn smoke_connect_all(&self) -> Result<()> {
        let generation = self.snapshot();
        for (id, runtime) in &generation.runtimes {
            runtime
                .smoke_connect()
                .await
                .map_err(|e| e.with_tenant(id.clone()))?;
        }
        Ok(())
    }

    /// Closes every pool in the current generation. Called at shutdown.
    pub async fn close_all(&self) {
        let generation = self.snapshot();
        for (id, runtime) in &generation.runtimes {
            if let Some(pool) = runtime.pool_if_built() {
                database::close_pool(id, pool).await;
            }
        }
    }
}

/// Waits out in-flight requests on a retired generation, then closes pools.
async fn drain_generation(generation: Arc<Generation>, grace: Duration) {
    tokio::time::sleep(grace).await;
    for (id, runtime) in &generation.runtimes {
        if let Some(pool) = runtime.pool_if_built() {
            database::close_pool(id, pool).await;
        }
    }
    warn!(serial = generation.serial, "retired generation drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantsDocument;

    const DOC: &str = r#"
default_tenant: company-a
tenants:
  company-a:
    name: "Company A"
    database: {host: a.db, port: 5432, database: a, user: u, password: p}
  company-b:
    name: "Company B"
    database: {host: b.db, port: 5432, database: b, user: u, password: p}
  company-b-eu:
    name: "Company B EU"
    database: {host: eu.db, port: 5432, database: eu, user: u, password: p}
global_settings:
  llm: {endpoint: "http://llm:8081/v1", model: qa-large}
"#;

    fn registry() -> TenantRegistry {
        TenantRegistry::load(TenantsDocument::parse(DOC).unwrap())
    }

    #[tokio::test]
    async fn header_wins_over_everything() {
        let generation = registry().snapshot();
        let hint = ResolveHint {
            header: Some("company-b".into()),
            bearer: Some("sk-company-a".into()),
            model: Some("company-a-qa-large".into()),
            body: None,
        };
        assert_eq!(generation.resolve(&hint).unwrap().config.id, "company-b");
    }

    #[tokio::test]
    async fn key_prefix_then_model_prefix_then_body() {
        let generation = registry().snapshot();

        let hint = ResolveHint {
            bearer: Some("sk-company-b".into()),
            model: Some("company-a-qa-large".into()),
            ..Default::default()
        };
        assert_eq!(generation.resolve(&hint).unwrap().config.id, "company-b");

        let hint = ResolveHint {
            model: Some("company-a-qa-large".into()),
            body: Some("company-b".into()),
            ..Default::default()
        };
        assert_eq!(generation.resolve(&hint).unwrap().config.id, "company-a");

        let hint = ResolveHint {
            body: Some("company-b".into()),
            ..Default::default()
        };
        assert_eq!(generation.resolve(&hint).unwrap().config.id, "company-b");
    }

    #[tokio::test]
    async fn longest_tenant_id_wins_model_prefix() {
        let generation = registry().snapshot();
        let hint = ResolveHint {
            model: Some("company-b-eu-qa-large".into()),
            ..Default::default()
        };
        assert_eq!(generation.resolve(&hint).unwrap().config.id, "company-b-eu");
    }

    #[tokio::test]
    async fn header_body_conflict_is_an_error() {
        let generation = registry().snapshot();
        let hint = ResolveHint {
            header: Some("company-a".into()),
            body: Some("company-b".into()),
            ..Default::default()
        };
        assert_eq!(
            generation.resolve(&hint).unwrap_err().code,
            ErrorCode::TenantConflict
        );
    }

    #[tokio::test]
    async fn defaults_when_policy_allows() {
        let generation = registry().snapshot();
        let resolved = generation.resolve(&ResolveHint::default()).unwrap();
        assert_eq!(resolved.config.id, "company-a");
    }

    #[tokio::test]
    async fn missing_identity_without_default_is_required_error() {
        let doc = DOC.replace("default_tenant: company-a\n", "");
        let doc = doc.replace(
            "  llm:",
            "  security: {default_tenant_on_missing: false}\n  llm:",
        );
        let generation = TenantRegistry::load(TenantsDocument::parse(&doc).unwrap()).snapshot();
        assert_eq!(
            generation.resolve(&ResolveHint::default()).unwrap_err().code,
            ErrorCode::TenantRequired
        );
    }

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let generation = registry().snapshot();
        let first = generation
            .resolve(&ResolveHint {
                bearer: Some("sk-company-a".into()),
                ..Default::default()
            })
            .unwrap();
        let again = generation
            .resolve(&ResolveHint {
                header: Some(first.config.id.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(first.config.id, again.config.id);
    }

    #[tokio::test]
    async fn reload_publishes_new_generation_and_keeps_old_snapshot_coherent() {
        let registry = registry();
        let before = registry.snapshot();
        let renamed = DOC.replace("Company A", "Company A (renamed)");
        registry.reload(TenantsDocument::parse(&renamed).unwrap());
        let after = registry.snapshot();

        assert_eq!(before.runtime("company-a").unwrap().config.name, "Company A");
        assert_eq!(
            after.runtime("company-a").unwrap().config.name,
            "Company A (renamed)"
        );
        assert!(after.serial > before.serial);
    }

    #[tokio::test]
    async fn unknown_tenant_surfaces() {
        let generation = registry().snapshot();
        let hint = ResolveHint {
            header: Some("nobody".into()),
            ..Default::default()
        };
        assert_eq!(generation.resolve(&hint).unwrap_err().code, ErrorCode::TenantUnknown);
    }
}
