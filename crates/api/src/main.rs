//! # Askgate API Server
//!
//! OpenAI-compatible chat façade over the multi-tenant query gateway.
//! Requests flow through request-id and tracing middleware into the
//! dispatcher, which selects the SQL, knowledge-base, or fallback agent
//! for the resolved tenant.
//!
//! Process exit codes:
//! - `0`  clean shutdown
//! - `64` invalid configuration
//! - `65` a tenant database was unreachable in strict mode
//! - `69` the LLM provider was unreachable in strict mode

use askgate_agents::{
    Dispatcher, FallbackAgent, KbClient, KnowledgeBaseAgent, OpenAiCompatProvider, PostgresAgent,
    PostgresAgentSettings,
};
use askgate_core::{MetricsHandle, TenantRegistry, TenantsDocument};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api_middleware;
mod error;
mod handlers;
mod health;
mod state;
mod wire;

use crate::state::AppState;

const EXIT_BAD_CONFIG: i32 = 64;
const EXIT_DB_UNREACHABLE: i32 = 65;
const EXIT_PROVIDER_UNREACHABLE: i32 = 69;

#[tokio::main]
async fn main() {
    let config_path: Option<PathBuf> = std::env::args().nth(1).map(Into::into);

    // The document carries the log level, so load before tracing init and
    // keep early failures on stderr.
    let document = match TenantsDocument::load(config_path.as_deref()) {
        Ok(document) => document,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    init_tracing(&document.global_settings.logging.level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        tenants = document.tenants.len(),
        strict = document.global_settings.strict_startup,
        "starting askgate server"
    );

    let metrics = match MetricsHandle::new("askgate") {
        Ok(metrics) => metrics,
        Err(e) => {
            eprintln!("metrics registry error: {e}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    let global = document.global_settings.clone();
    let registry = Arc::new(TenantRegistry::load(document));

    let provider = Arc::new(OpenAiCompatProvider::new(
        global.llm.endpoint.clone(),
        global.llm.api_key.clone(),
        global.retry_count,
        metrics.clone(),
    ));

    if global.strict_startup {
        if let Err(e) = registry.smoke_connect_all().await {
            eprintln!("tenant database unreachable in strict mode: {e}");
            std::process::exit(EXIT_DB_UNREACHABLE);
        }
        info!("all tenant databases answered the startup probe");

        if let Err(e) = provider.probe().await {
            eprintln!("LLM provider unreachable in strict mode: {e}");
            std::process::exit(EXIT_PROVIDER_UNREACHABLE);
        }
        info!("LLM provider answered the startup probe");
    }

    let kb_client = global
        .knowledge_base
        .as_ref()
        .map(|kb| KbClient::new(kb.endpoint.clone(), kb.api_key.clone()));

    let postgres_agent = Arc::new(PostgresAgent::new(
        provider.clone(),
        metrics.clone(),
        PostgresAgentSettings {
            log_queries: global.logging.log_queries,
            ..PostgresAgentSettings::default()
        },
    ));
    let kb_agent = Arc::new(KnowledgeBaseAgent::new(
        kb_client,
        provider.clone(),
        metrics.clone(),
    ));
    let fallback_agent = Arc::new(FallbackAgent::new(provider.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        provider,
        postgres_agent,
        kb_agent,
        fallback_agent,
        metrics.clone(),
    ));

    let app_state = AppState {
        registry: registry.clone(),
        dispatcher,
        metrics,
        config_path,
        started_at: chrono::Utc::now(),
    };

    let app = build_router(app_state);

    let addr: SocketAddr = match format!("{}:{}", global.server.host, global.server.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("invalid server address: {e}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };
    info!("listening on {addr}");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("cannot bind {addr}: {e}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }

    registry.close_all().await;
    info!("shutdown complete");
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat::chat_completions))
        .route("/v1/models", get(handlers::models::list_models))
        .route("/tenants", get(handlers::admin::list_tenants))
        .route("/admin/reload", post(handlers::admin::reload))
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(
                    api_middleware::request_id::request_id_middleware,
                ))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CompressionLayer::new())
                // chat front-ends run in browsers; the API itself carries
                // no cookies, so a permissive policy is safe here
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

fn init_tracing(level: &str) {
    let default_filter = format!(
        "askgate_api={level},askgate_agents={level},askgate_core={level},tower_http=info"
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C");
        },
        _ = terminate => {
            info!("received terminate signal");
        },
    }
}
