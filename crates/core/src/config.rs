//! # Tenant Configuration
//!
//! The gateway is driven by a single YAML document describing every tenant
//! plus the global policy. Loading happens once at startup (and again on an
//! admin-triggered reload):
//!
//! 1. Read the raw document (path argument > `ASKGATE_CONFIG` env >
//!    `config/tenants.yaml`).
//! 2. Expand `${NAME}` environment references in the raw text. An
//!    unresolved name fails the load: silently-empty credentials are worse
//!    than a refused start.
//! 3. Deserialize and validate. Duplicate tenant ids, malformed agent
//!    types, out-of-range generation settings and missing credentials are
//!    all `ConfigInvalid`.
//!
//! ## Example document
//!
//! ```yaml
//! default_tenant: company-a
//! tenants:
//!   company-a:
//!     name: "Company A"
//!     language: th
//!     database:
//!       host: db-a.internal
//!       port: 5432
//!       database: companya
//!       user: gateway
//!       password: ${COMPANY_A_DB_PASSWORD}
//!     knowledge_base:
//!       id: kb-0001
//!       prefix: company-a/
//!       bucket: askgate-kb
//!       region: ap-southeast-1
//!       search_type: HYBRID
//!       max_results: 5
//!     settings:
//!       max_tokens: 1024
//!       temperature: 0.2
//!       response_language: th
//!       enable_postgres_agent: true
//!       enable_knowledge_base_agent: true
//! global_settings:
//!   fallback_agent: fallback
//!   retry_count: 3
//!   timeout_seconds: 60
//!   security:
//!     require_tenant_header: false
//!     default_tenant_on_missing: true
//!     tenant_header_name: X-Tenant-ID
//!   logging:
//!     level: info
//!     log_queries: true
//! ```
//!
//! Sensitive values (DB passwords, API keys) should always arrive through
//! `${...}` references, never as literals in the document.

use crate::error::{Error, ErrorCode, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Agent kinds the dispatcher can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Structured-data SQL agent against the tenant database
    Postgres,
    /// Retrieval-augmented knowledge-base agent
    KnowledgeBase,
    /// Best-effort generative fallback
    Fallback,
    /// Let the dispatcher classify the question
    Auto,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Postgres => "postgres",
            AgentType::KnowledgeBase => "knowledge_base",
            AgentType::Fallback => "fallback",
            AgentType::Auto => "auto",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knowledge-base search mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SearchType {
    Semantic,
    Hybrid,
}

/// Per-tenant PostgreSQL connection settings. Consumed field-by-field by
/// the pool builder; there is deliberately no connection-URL rendering,
/// so passwords never need URL escaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Knowledge-base binding for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseBinding {
    pub id: String,
    pub prefix: String,
    pub bucket: String,
    pub region: String,
    pub search_type: SearchType,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

fn default_max_results() -> u32 {
    5
}

/// Generation and routing settings for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSettings {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Preferred agent when the request does not name one and keyword
    /// classification is ambiguous.
    #[serde(default)]
    pub default_agent_type: Option<AgentType>,
    #[serde(default = "default_language")]
    pub response_language: String,
    #[serde(default = "default_true")]
    pub enable_postgres_agent: bool,
    #[serde(default = "default_true")]
    pub enable_knowledge_base_agent: bool,
    #[serde(default = "default_true")]
    pub enable_fallback_agent: bool,
    /// Model identifier override; falls back to the global model.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.2
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            default_agent_type: None,
            response_language: default_language(),
            enable_postgres_agent: true,
            enable_knowledge_base_agent: true,
            enable_fallback_agent: true,
            model: None,
        }
    }
}

/// Immutable per-tenant configuration, keyed by the opaque tenant id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    #[serde(skip)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub knowledge_base: Option<KnowledgeBaseBinding>,
    /// Named API keys accepted for this tenant (`Authorization: Bearer`).
    #[serde(default)]
    pub api_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub settings: TenantSettings,
    /// External orchestrator endpoints. Parsed and listed, never called.
    #[serde(default)]
    pub webhooks: BTreeMap<String, String>,
    #[serde(default)]
    pub contact_info: BTreeMap<String, String>,
}

impl TenantConfig {
    /// The model identifier used for this tenant's LLM calls.
    pub fn model<'a>(&'a self, global: &'a GlobalSettings) -> &'a str {
        self.settings
            .model
            .as_deref()
            .unwrap_or(&global.llm.model)
    }

    /// True when the named agent is enabled for this tenant.
    pub fn agent_enabled(&self, agent: AgentType) -> bool {
        match agent {
            AgentType::Postgres => self.settings.enable_postgres_agent,
            AgentType::KnowledgeBase => {
                self.settings.enable_knowledge_base_agent && self.knowledge_base.is_some()
            }
            AgentType::Fallback => self.settings.enable_fallback_agent,
            AgentType::Auto => true,
        }
    }
}

/// Security posture for tenant resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub require_tenant_header: bool,
    #[serde(default = "default_true")]
    pub default_tenant_on_missing: bool,
    #[serde(default = "default_tenant_header")]
    pub tenant_header_name: String,
}

fn default_tenant_header() -> String {
    "X-Tenant-ID".to_string()
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            require_tenant_header: false,
            default_tenant_on_missing: true,
            tenant_header_name: default_tenant_header(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub log_queries: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_queries: false,
        }
    }
}

/// Upstream LLM completion service (OpenAI-compatible surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
}

/// Managed knowledge-base retrieval service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbServiceSettings {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// HTTP bind address for the façade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsSettings {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub bedrock_model: Option<String>,
}

/// Global (cross-tenant) policy and service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_fallback_agent")]
    pub fallback_agent: AgentType,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Strict startup probes upstream dependencies before serving.
    #[serde(default)]
    pub strict_startup: bool,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    pub llm: LlmSettings,
    #[serde(default)]
    pub knowledge_base: Option<KbServiceSettings>,
    #[serde(default)]
    pub aws: AwsSettings,
}

fn default_fallback_agent() -> AgentType {
    AgentType::Fallback
}

fn default_retry_count() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub enable_hybrid_search: bool,
    #[serde(default = "default_true")]
    pub enable_streaming_responses: bool,
    #[serde(default)]
    pub enable_conversation_history: bool,
}

/// The whole parsed configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantsDocument {
    #[serde(default)]
    pub default_tenant: Option<String>,
    pub tenants: BTreeMap<String, TenantConfig>,
    pub global_settings: GlobalSettings,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
}

static ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env ref pattern"));

/// Expands `${NAME}` environment references in the raw document text.
/// Every referenced variable must be set; the first missing one fails the load.
pub fn interpolate_env(raw: &str) -> Result<String> {
    let mut missing: Option<String> = None;
    let expanded = ENV_REF.replace_all(raw, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(Error::new(
            ErrorCode::CredentialMissing,
            format!("environment variable '{name}' referenced in configuration is not set"),
        ));
    }
    Ok(expanded.into_owned())
}

impl TenantsDocument {
    /// Loads and validates the document from an explicit path, the
    /// `ASKGATE_CONFIG` variable, or `config/tenants.yaml`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("ASKGATE_CONFIG")
                .map(Into::into)
                .unwrap_or_else(|_| "config/tenants.yaml".into()),
        };
        let raw = std::fs::read_to_string(&resolved).map_err(|e| {
            Error::config(format!(
                "cannot read tenant configuration '{}': {e}",
                resolved.display()
            ))
        })?;
        Self::parse(&raw)
    }

    /// Parses and validates a raw YAML document.
    pub fn parse(raw: &str) -> Result<Self> {
        let expanded = interpolate_env(raw)?;
        let mut doc: TenantsDocument = serde_yaml::from_str(&expanded)?;
        doc.hydrate_ids();
        doc.validate()?;
        Ok(doc)
    }

    /// Copies the map key into each tenant's `id` field.
    fn hydrate_ids(&mut self) {
        for (id, tenant) in self.tenants.iter_mut() {
            tenant.id = id.clone();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.tenants.is_empty() {
            return Err(Error::config("configuration declares no tenants"));
        }

        if let Some(default) = &self.default_tenant {
            if !self.tenants.contains_key(default) {
                return Err(Error::config(format!(
                    "default_tenant '{default}' is not a configured tenant"
                )));
            }
        }

        for (id, tenant) in &self.tenants {
            if id.trim().is_empty() {
                return Err(Error::new(ErrorCode::TenantDuplicate, "empty tenant id"));
            }
            if !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(Error::config(format!(
                    "tenant id '{id}' may only contain alphanumerics, '-' and '_'"
                )));
            }
            if tenant.database.host.is_empty() || tenant.database.database.is_empty() {
                return Err(Error::new(
                    ErrorCode::CredentialMissing,
                    format!("tenant '{id}' is missing database host or name"),
                ));
            }
            if tenant.database.user.is_empty() {
                return Err(Error::new(
                    ErrorCode::CredentialMissing,
                    format!("tenant '{id}' is missing a database user"),
                ));
            }
            if !matches!(tenant.language.as_str(), "th" | "en") {
                return Err(Error::config(format!(
                    "tenant '{id}': language must be 'th' or 'en', got '{}'",
                    tenant.language
                )));
            }
            if !(0.0..=2.0).contains(&tenant.settings.temperature) {
                return Err(Error::config(format!(
                    "tenant '{id}': temperature must be in [0.0, 2.0]"
                )));
            }
            if tenant.settings.max_tokens == 0 {
                return Err(Error::config(format!(
                    "tenant '{id}': max_tokens must be positive"
                )));
            }
            if matches!(tenant.settings.default_agent_type, Some(AgentType::Auto)) {
                return Err(Error::config(format!(
                    "tenant '{id}': default_agent_type cannot be 'auto'"
                )));
            }
            if let Some(kb) = &tenant.knowledge_base {
                if kb.max_results == 0 {
                    return Err(Error::config(format!(
                        "tenant '{id}': knowledge_base.max_results must be positive"
                    )));
                }
            }
        }

        let g = &self.global_settings;
        if g.retry_count == 0 || g.retry_count > 10 {
            return Err(Error::config("retry_count must be in 1..=10"));
        }
        if g.timeout_seconds == 0 || g.timeout_seconds > 600 {
            return Err(Error::config("timeout_seconds must be in 1..=600"));
        }
        if g.llm.endpoint.is_empty() || g.llm.model.is_empty() {
            return Err(Error::config("global_settings.llm requires endpoint and model"));
        }
        if g.fallback_agent == AgentType::Auto {
            return Err(Error::config("fallback_agent cannot be 'auto'"));
        }

        Ok(())
    }

    pub fn tenant(&self, id: &str) -> Option<&TenantConfig> {
        self.tenants.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
default_tenant: company-a
tenants:
  company-a:
    name: "Company A"
    language: th
    database:
      host: localhost
      port: 5432
      database: companya
      user: gateway
      password: secret
    settings:
      response_language: th
global_settings:
  llm:
    endpoint: http://localhost:8081/v1
    model: qa-large
"#;

    #[test]
    fn parses_minimal_document() {
        let doc = TenantsDocument::parse(MINIMAL).unwrap();
        assert_eq!(doc.default_tenant.as_deref(), Some("company-a"));
        let tenant = doc.tenant("company-a").unwrap();
        assert_eq!(tenant.id, "company-a");
        assert_eq!(tenant.language, "th");
        assert!(tenant.settings.enable_postgres_agent);
        assert_eq!(doc.global_settings.retry_count, 3);
        assert_eq!(doc.global_settings.timeout_seconds, 60);
    }

    #[test]
    fn rejects_unknown_default_tenant() {
        let raw = MINIMAL.replace("default_tenant: company-a", "default_tenant: nobody");
        let err = TenantsDocument::parse(&raw).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalid);
    }

    #[test]
    fn rejects_bad_language() {
        let raw = MINIMAL.replace("language: th", "language: fr");
        assert!(TenantsDocument::parse(&raw).is_err());
    }

    #[test]
    fn env_interpolation_expands_and_fails_on_missing() {
        std::env::set_var("ASKGATE_TEST_PW", "s3cret");
        let raw = MINIMAL.replace("password: secret", "password: ${ASKGATE_TEST_PW}");
        let doc = TenantsDocument::parse(&raw).unwrap();
        assert_eq!(doc.tenant("company-a").unwrap().database.password, "s3cret");

        let raw = MINIMAL.replace("password: secret", "password: ${ASKGATE_TEST_DEFINITELY_UNSET}");
        let err = TenantsDocument::parse(&raw).unwrap_err();
        assert_eq!(err.code, ErrorCode::CredentialMissing);
    }

    #[test]
    fn kb_binding_search_type_round_trips() {
        let raw = MINIMAL.replace(
            "    settings:\n      response_language: th",
            "    knowledge_base:\n      id: kb-1\n      prefix: company-a/\n      bucket: kb\n      region: ap-southeast-1\n      search_type: HYBRID\n      max_results: 5\n    settings:\n      response_language: th",
        );
        let doc = TenantsDocument::parse(&raw).unwrap();
        let kb = doc
            .tenant("company-a")
            .unwrap()
            .knowledge_base
            .as_ref()
            .unwrap();
        assert_eq!(kb.search_type, SearchType::Hybrid);
    }

    #[test]
    fn url_hostile_password_survives_parsing() {
        std::env::set_var("ASKGATE_TEST_HOSTILE_PW", "p@ss:word/100%");
        let raw = MINIMAL.replace("password: secret", "password: ${ASKGATE_TEST_HOSTILE_PW}");
        let doc = TenantsDocument::parse(&raw).unwrap();
        assert_eq!(
            doc.tenant("company-a").unwrap().database.password,
            "p@ss:word/100%"
        );
    }

    #[test]
    fn retry_budget_bounds() {
        let raw = format!("{MINIMAL}  retry_count: 0\n");
        assert!(TenantsDocument::parse(&raw).is_err());
    }
}
