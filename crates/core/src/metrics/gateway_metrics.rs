use prometheus::{HistogramVec, IntCounterVec, Opts, Registry};

/// Request, agent, and SQL counters for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub agent_attempts_total: IntCounterVec,
    pub agent_fallback_total: IntCounterVec,
    pub sql_executed_total: IntCounterVec,
    pub safety_rejected_total: IntCounterVec,
    pub llm_tokens_total: IntCounterVec,
    pub kb_retrievals_total: IntCounterVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Chat completion requests"),
            &["tenant_id", "agent", "outcome"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "End-to-end chat completion latency",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["tenant_id"],
        )?;

        let agent_attempts_total = IntCounterVec::new(
            Opts::new("agent_attempts_total", "Agent execution attempts"),
            &["tenant_id", "agent"],
        )?;

        let agent_fallback_total = IntCounterVec::new(
            Opts::new(
                "agent_fallback_total",
                "Recoverable failures consumed by falling back to another agent",
            ),
            &["tenant_id", "from", "to"],
        )?;

        let sql_executed_total = IntCounterVec::new(
            Opts::new("sql_executed_total", "Queries executed against tenant databases"),
            &["tenant_id"],
        )?;

        let safety_rejected_total = IntCounterVec::new(
            Opts::new("safety_rejected_total", "Generated SQL rejected by the safety gate"),
            &["tenant_id", "rule"],
        )?;

        let llm_tokens_total = IntCounterVec::new(
            Opts::new("llm_tokens_total", "LLM tokens consumed per tenant"),
            &["tenant_id", "kind"],
        )?;

        let kb_retrievals_total = IntCounterVec::new(
            Opts::new("kb_retrievals_total", "Knowledge-base retrieval calls"),
            &["tenant_id", "outcome"],
        )?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            agent_attempts_total,
            agent_fallback_total,
            sql_executed_total,
            safety_rejected_total,
            llm_tokens_total,
            kb_retrievals_total,
        })
    }

    pub fn register_on(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.requests_total.clone()))?;
        registry.register(Box::new(self.request_duration_seconds.clone()))?;
        registry.register(Box::new(self.agent_attempts_total.clone()))?;
        registry.register(Box::new(self.agent_fallback_total.clone()))?;
        registry.register(Box::new(self.sql_executed_total.clone()))?;
        registry.register(Box::new(self.safety_rejected_total.clone()))?;
        registry.register(Box::new(self.llm_tokens_total.clone()))?;
        registry.register(Box::new(self.kb_retrievals_total.clone()))?;
        Ok(())
    }

    pub fn record_tokens(&self, tenant_id: &str, prompt: u64, completion: u64) {
        self.llm_tokens_total
            .with_label_values(&[tenant_id, "prompt"])
            .inc_by(prompt);
        self.llm_tokens_total
            .with_label_values(&[tenant_id, "completion"])
            .inc_by(completion);
    }
}
