//! # PostgreSQL question-answering agent
//!
//! The pipeline, one request at a time:
//!
//! ```text
//! question ──▶ schema snapshot ──▶ SQL generation ──▶ safety gate
//!                                        ▲                │ reject
//!                                        └── re-prompt ◀──┘ (once)
//!                                                          │ pass
//!                              rendering ◀── execution ◀───┘
//! ```
//!
//! The gate re-prompts once with the failing rule; a second rejection is
//! fatal when the rule is malicious-classed, otherwise the user gets a
//! clarifying question. Statement timeouts retry once with a tenth of the
//! row budget before surfacing `QueryTooExpensive`.

pub mod execute;
pub mod generate;
pub mod render;
pub mod safety;
pub mod schema;

use crate::agent::{Agent, AgentRequest};
use crate::llm::{CompletionParams, LlmProvider};
use crate::outcome::{AgentOutcome, Answer, TokenUsage};
use askgate_core::{
    AgentType, Error, ErrorCode, GlobalSettings, MetricsHandle, RequestContext, TenantRuntime,
};
use async_trait::async_trait;
use safety::{GateRejection, GateRule};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tuning knobs for the SQL agent.
#[derive(Debug, Clone)]
pub struct PostgresAgentSettings {
    /// Hard cap on returned rows.
    pub max_rows: u64,
    /// Byte budget for the schema summary in the prompt.
    pub schema_budget: usize,
    /// Snapshot staleness window.
    pub snapshot_ttl: Duration,
    /// Sub-deadline for one query execution.
    pub sql_timeout: Duration,
    /// Log every executed query (`logging.log_queries` policy).
    pub log_queries: bool,
}

impl Default for PostgresAgentSettings {
    fn default() -> Self {
        Self {
            max_rows: 500,
            schema_budget: 4096,
            snapshot_ttl: Duration::from_secs(600),
            sql_timeout: Duration::from_secs(30),
            log_queries: false,
        }
    }
}

pub struct PostgresAgent {
    provider: Arc<dyn LlmProvider>,
    metrics: MetricsHandle,
    schema_cache: schema::SchemaCache,
    settings: PostgresAgentSettings,
}

impl PostgresAgent {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        metrics: MetricsHandle,
        settings: PostgresAgentSettings,
    ) -> Self {
        let schema_cache = schema::SchemaCache::new(settings.snapshot_ttl);
        Self {
            provider,
            metrics,
            schema_cache,
            settings,
        }
    }

    async fn try_answer(
        &self,
        ctx: &RequestContext,
        runtime: &TenantRuntime,
        global: &GlobalSettings,
        request: &AgentRequest,
    ) -> AgentOutcome {
        let tenant_id = &runtime.config.id;
        let language = &runtime.config.settings.response_language;

        let pool = match runtime.pool().await {
            Ok(pool) => pool,
            Err(err) => return AgentOutcome::from_error(err),
        };

        // Introspection failure blocks this agent, not the dispatcher.
        let snapshot = match ctx
            .run(self.schema_cache.snapshot(tenant_id, pool))
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(tenant = %tenant_id, "schema introspection failed: {}", err.message);
                return AgentOutcome::Recoverable(
                    Error::new(ErrorCode::DbUnavailable, "schema introspection failed")
                        .with_details(err.message),
                );
            }
        };

        let summary = snapshot.summary(&request.question, self.settings.schema_budget);
        let params = CompletionParams {
            model: runtime.config.model(global).to_string(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut usage = TokenUsage::default();
        let mut rejection: Option<GateRejection> = None;

        for attempt in 0..2 {
            let generated = generate::generate(
                self.provider.as_ref(),
                ctx,
                &params,
                &summary,
                &request.question,
                language,
                rejection.as_ref(),
            )
            .await;

            let (candidate, generation_usage) = match generated {
                Ok(pair) => pair,
                Err(err) if err.code == ErrorCode::Internal && attempt == 0 => {
                    // Unusable model output is handled like a gate
                    // rejection: one re-prompt with the reason.
                    rejection = Some(GateRejection {
                        rule: GateRule::Unparsable,
                        detail: err.message.clone(),
                    });
                    continue;
                }
                Err(err) => return AgentOutcome::from_error(err),
            };
            usage.add(generation_usage);

            let checked = match safety::check(
                &candidate.sql,
                snapshot.allowed_schemas(),
                candidate.params.len(),
            ) {
                Ok(checked) => checked,
                Err(reject) => {
                    self.metrics
                        .gateway
                        .safety_rejected_total
                        .with_label_values(&[tenant_id, reject.rule.as_str()])
                        .inc();
                    warn!(tenant = %tenant_id, rule = reject.rule.as_str(), "safety gate rejection");
                    if attempt == 0 {
                        rejection = Some(reject);
                        continue;
                    }
                    if reject.rule.is_malicious() {
                        return AgentOutcome::Fatal(
                            Error::new(ErrorCode::SqlRejected, "generated SQL failed the safety gate")
                                .with_details(reject.to_string())
                                .with_tenant(tenant_id.clone()),
                        );
                    }
                    return AgentOutcome::Clarification(
                        Answer::new(
                            AgentType::Postgres,
                            render::render_clarification(language, &request.question),
                        )
                        .with_usage(usage),
                    );
                }
            };

            debug!(rationale = candidate.rationale.as_deref().unwrap_or(""), "candidate accepted");

            let table = match self
                .execute_with_reduction(ctx, runtime, &candidate, &checked)
                .await
            {
                Ok(table) => table,
                Err(err) if execute::suggests_schema_drift(&err) => {
                    self.schema_cache.invalidate(tenant_id);
                    return AgentOutcome::Recoverable(err);
                }
                Err(err) => return AgentOutcome::from_error(err),
            };

            self.metrics
                .gateway
                .sql_executed_total
                .with_label_values(&[tenant_id])
                .inc();

            if table.rows.is_empty() && zero_row_hint(&request.question, &candidate.params) {
                return AgentOutcome::Clarification(
                    Answer::new(
                        AgentType::Postgres,
                        render::render_clarification(language, &request.question),
                    )
                    .with_usage(usage),
                );
            }

            let rows = table.rows.len() as u64;
            let text =
                render::render_answer(&table, language, &checked.tables, self.settings.max_rows);
            let mut answer = Answer::new(AgentType::Postgres, text).with_usage(usage);
            answer.tables_used = checked.tables.clone();
            answer.rows_returned = Some(rows);
            return AgentOutcome::Success(answer);
        }

        // Both generation attempts were unusable.
        AgentOutcome::Clarification(
            Answer::new(
                AgentType::Postgres,
                render::render_clarification(language, &request.question),
            )
            .with_usage(usage),
        )
    }

    /// Runs the query; on a statement timeout, retries once with a tenth
    /// of the row budget before surfacing `QueryTooExpensive`.
    async fn execute_with_reduction(
        &self,
        ctx: &RequestContext,
        runtime: &TenantRuntime,
        candidate: &generate::GeneratedQuery,
        checked: &safety::CheckedQuery,
    ) -> askgate_core::Result<execute::QueryTable> {
        let pool = runtime.pool().await?;
        let tenant_id = &runtime.config.id;
        let deadline = ctx.sub_deadline(self.settings.sql_timeout);

        let first = ctx
            .run_until(
                deadline,
                execute::run(
                    pool,
                    tenant_id,
                    &candidate.sql,
                    &candidate.params,
                    checked,
                    self.settings.max_rows,
                    self.settings.log_queries,
                ),
            )
            .await;

        match first {
            Err(err) if err.code == ErrorCode::QueryTooExpensive => {
                let reduced = (self.settings.max_rows / 10).max(10);
                warn!(
                    tenant = %tenant_id,
                    reduced_rows = reduced,
                    "statement timeout, retrying with reduced row budget"
                );
                let deadline = ctx.sub_deadline(self.settings.sql_timeout);
                ctx.run_until(
                    deadline,
                    execute::run(
                        pool,
                        tenant_id,
                        &candidate.sql,
                        &candidate.params,
                        checked,
                        reduced,
                        self.settings.log_queries,
                    ),
                )
                .await
            }
            other => other,
        }
    }
}

/// True when a zero-row result probably means the user's filter missed
/// the data: the query was filtered by a concrete value, or the question
/// pins a specific year or date.
fn zero_row_hint(question: &str, params: &[serde_json::Value]) -> bool {
    if !params.is_empty() {
        return true;
    }
    question
        .split(|c: char| !c.is_ascii_digit())
        .any(|chunk| chunk.len() == 4 && chunk.parse::<u32>().map_or(false, |y| (1990..2600).contains(&y)))
}

#[async_trait]
impl Agent for PostgresAgent {
    fn kind(&self) -> AgentType {
        AgentType::Postgres
    }

    async fn answer(
        &self,
        ctx: &RequestContext,
        runtime: &TenantRuntime,
        global: &GlobalSettings,
        request: &AgentRequest,
    ) -> AgentOutcome {
        self.try_answer(ctx, runtime, global, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_row_hint_fires_on_params_or_years() {
        assert!(zero_row_hint("how many employees", &[serde_json::json!("IT")]));
        assert!(zero_row_hint("sales in 2031", &[]));
        assert!(zero_row_hint("ยอดขายปี 2568", &[]));
        assert!(!zero_row_hint("list all employees", &[]));
    }
}
