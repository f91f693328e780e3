use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Process-wide cycle counters, registered once at startup and shared across the manager and
/// every executor instance. Ambient observability: carried regardless of any feature Non-goal.
pub struct CycleMetrics {
    pub registry: Registry,
    pub cycles_total: IntCounter,
    pub decisions_accepted_total: IntCounter,
    pub decisions_rejected_total: IntCounter,
    pub llm_call_duration_seconds: prometheus::Histogram,
    pub trader_status: IntGaugeVec,
    pub decisions_rejected_by_reason: IntCounterVec,
}

impl CycleMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cycles_total = IntCounter::new("cycles_total", "total decision cycles run")?;
        let decisions_accepted_total =
            IntCounter::new("decisions_accepted_total", "total decisions accepted by risk evaluator")?;
        let decisions_rejected_total =
            IntCounter::new("decisions_rejected_total", "total decisions rejected by risk evaluator")?;
        let decisions_rejected_by_reason = IntCounterVec::new(
            Opts::new("decisions_rejected_by_reason_total", "decisions rejected, by reason"),
            &["reason"],
        )?;
        let llm_call_duration_seconds = prometheus::Histogram::with_opts(
            prometheus::HistogramOpts::new("llm_call_duration_seconds", "LLM call latency"),
        )?;
        let trader_status = IntGaugeVec::new(
            Opts::new("trader_status", "current status of each trader, one gauge series per trader"),
            &["trader_id", "status"],
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(decisions_accepted_total.clone()))?;
        registry.register(Box::new(decisions_rejected_total.clone()))?;
        registry.register(Box::new(decisions_rejected_by_reason.clone()))?;
        registry.register(Box::new(llm_call_duration_seconds.clone()))?;
        registry.register(Box::new(trader_status.clone()))?;

        Ok(Self {
            registry,
            cycles_total,
            decisions_accepted_total,
            decisions_rejected_total,
            llm_call_duration_seconds,
            trader_status,
            decisions_rejected_by_reason,
        })
    }
}
