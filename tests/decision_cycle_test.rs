use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use perpetron::context::ContextBuilder;
use perpetron::domain::errors::{LLMError, PersistenceError, PromptError};
use perpetron::domain::ports::{
    ConversationRecorder, Deadline, ExchangeProvider, LLMClient, MarketProvider,
    PersistenceService, PromptRenderer, StructuredChatRequest, StructuredResponse,
};
use perpetron::domain::types::{
    AccountSyncSnapshot, AnalyticsSnapshot, ConversationRecord, DecisionCycleRecord, ExecGuards,
    ExecutorContext, PositionEvent, RiskParams, TraderConfig, TraderRuntimeState, TraderStatus,
};
use perpetron::executor::cycle::{ExecutorDeps, RetryConfig};
use perpetron::executor::Executor;
use perpetron::infrastructure::exchange::MockExchangeProvider;
use perpetron::infrastructure::market::MockMarketProvider;
use perpetron::metrics::CycleMetrics;

/// Returns scripted assistant responses from a queue, one per call, so tests can deterministically
/// drive retry and failure paths.
struct ScriptedLLM {
    responses: Mutex<VecDeque<Result<String, LLMError>>>,
}

impl ScriptedLLM {
    fn new(responses: Vec<Result<String, LLMError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }
}

#[async_trait]
impl LLMClient for ScriptedLLM {
    async fn chat_structured(
        &self,
        _request: StructuredChatRequest,
        _schema: &serde_json::Value,
        _deadline: Deadline,
    ) -> Result<StructuredResponse, LLMError> {
        let mut queue = self.responses.lock().unwrap();
        match queue.pop_front() {
            Some(Ok(text)) => Ok(StructuredResponse { raw_text: text, tokens_used: Some(10) }),
            Some(Err(e)) => Err(e),
            None => Err(LLMError::Upstream("scripted responses exhausted".into())),
        }
    }
}

struct NoopPromptRenderer;

#[async_trait]
impl PromptRenderer for NoopPromptRenderer {
    async fn render(&self, _context: &ExecutorContext) -> Result<(String, String), PromptError> {
        Ok(("rendered prompt".to_string(), "digest".to_string()))
    }
}

#[derive(Default)]
struct InMemoryPersistence {
    cycles: Mutex<Vec<DecisionCycleRecord>>,
    events: Mutex<Vec<PositionEvent>>,
}

#[async_trait]
impl PersistenceService for InMemoryPersistence {
    async fn record_position_event(&self, event: PositionEvent) -> Result<(), PersistenceError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn record_decision_cycle(&self, record: DecisionCycleRecord) -> Result<(), PersistenceError> {
        self.cycles.lock().unwrap().push(record);
        Ok(())
    }

    async fn record_account_snapshot(&self, _snapshot: AccountSyncSnapshot) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn record_analytics(&self, _snapshot: AnalyticsSnapshot) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn recent_cycles(&self, _trader_id: &str, _limit: u32) -> Result<Vec<DecisionCycleRecord>, PersistenceError> {
        Ok(vec![])
    }

    async fn hydrate_caches(&self, _trader_ids: &[String]) -> Result<HashMap<String, u64>, PersistenceError> {
        Ok(HashMap::new())
    }
}

struct NoopConversationRecorder;

#[async_trait]
impl ConversationRecorder for NoopConversationRecorder {
    async fn record_conversation(&self, _record: ConversationRecord) -> Result<(), PersistenceError> {
        Ok(())
    }
}

fn trader_config() -> TraderConfig {
    TraderConfig {
        id: "alpha".into(),
        display_name: "Alpha".into(),
        exchange_provider: "mock".into(),
        market_provider: "mock".into(),
        model_alias: "test-model".into(),
        prompt_template_path: "prompts/default.txt".into(),
        allocation_pct: dec!(100),
        auto_start: true,
        risk_params: RiskParams {
            min_confidence: 60,
            min_risk_reward: dec!(1.0),
            max_position_size_usd: dec!(1000),
            max_positions: 3,
            major_coin_leverage: 10,
            altcoin_leverage: 5,
            reserve_equity_pct: dec!(0.1),
        },
        exec_guards: ExecGuards {
            candidate_limit: 5,
            max_consecutive_failures: 2,
            symbol_whitelist: vec!["BTC".into()],
            cooldown_seconds: 60,
        },
    }
}

fn executor_with_retry(retry: RetryConfig) -> Executor {
    let context_builder = ContextBuilder::new(Duration::from_secs(2), Duration::from_secs(2));
    let metrics = Arc::new(CycleMetrics::new().unwrap());
    Executor::new(context_builder, retry, Duration::from_secs(5), metrics)
}

fn deps_with_llm(llm: Arc<dyn LLMClient>) -> (ExecutorDeps, Arc<InMemoryPersistence>) {
    let exchange: Arc<dyn ExchangeProvider> = Arc::new(MockExchangeProvider::new(dec!(100000), &["BTC"]));
    let market: Arc<dyn MarketProvider> = Arc::new(MockMarketProvider::new(&["BTC"]));
    let persistence = Arc::new(InMemoryPersistence::default());
    let deps = ExecutorDeps {
        exchange,
        market,
        llm,
        prompt_renderer: Arc::new(NoopPromptRenderer),
        persistence: persistence.clone(),
        conversation_recorder: Arc::new(NoopConversationRecorder),
    };
    (deps, persistence)
}

#[tokio::test]
async fn happy_path_opens_a_position() {
    let llm: Arc<dyn LLMClient> = Arc::new(ScriptedLLM::new(vec![Ok(
        r#"[{"symbol":"BTC","action":"OPEN_LONG","confidence":85,"position_size_usd":500,"entry_price":100}]"#
            .to_string(),
    )]));
    let (deps, _persistence) = deps_with_llm(llm);
    let executor = executor_with_retry(RetryConfig::default());
    let config = trader_config();
    let mut state = TraderRuntimeState::new(Utc::now());
    state.status = TraderStatus::Running;

    let outcome = executor.run_cycle(&config, &mut state, &deps, &CancellationToken::new()).await;
    match outcome {
        perpetron::executor::CycleOutcome::Completed(record) => {
            assert!(record.success);
            assert_eq!(record.decisions.len(), 1);
            assert_eq!(record.decisions[0].outcome, "executed");
        }
        _ => panic!("expected a completed cycle"),
    }
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn oversized_position_is_clamped_not_rejected() {
    let llm: Arc<dyn LLMClient> = Arc::new(ScriptedLLM::new(vec![Ok(
        r#"[{"symbol":"BTC","action":"OPEN_LONG","confidence":85,"position_size_usd":50000,"entry_price":100}]"#
            .to_string(),
    )]));
    let (deps, _persistence) = deps_with_llm(llm);
    let executor = executor_with_retry(RetryConfig::default());
    let config = trader_config();
    let mut state = TraderRuntimeState::new(Utc::now());
    state.status = TraderStatus::Running;

    let outcome = executor.run_cycle(&config, &mut state, &deps, &CancellationToken::new()).await;
    match outcome {
        perpetron::executor::CycleOutcome::Completed(record) => {
            assert_eq!(record.decisions[0].outcome, "executed");
            assert_eq!(record.decisions[0].decision.position_size_usd, Some(dec!(1000)));
        }
        _ => panic!("expected a completed cycle"),
    }
}

#[tokio::test]
async fn low_confidence_decision_is_rejected_not_executed() {
    let llm: Arc<dyn LLMClient> = Arc::new(ScriptedLLM::new(vec![Ok(
        r#"[{"symbol":"BTC","action":"OPEN_LONG","confidence":10,"position_size_usd":500,"entry_price":100}]"#
            .to_string(),
    )]));
    let (deps, _persistence) = deps_with_llm(llm);
    let executor = executor_with_retry(RetryConfig::default());
    let config = trader_config();
    let mut state = TraderRuntimeState::new(Utc::now());
    state.status = TraderStatus::Running;

    let outcome = executor.run_cycle(&config, &mut state, &deps, &CancellationToken::new()).await;
    match outcome {
        perpetron::executor::CycleOutcome::Completed(record) => {
            assert_eq!(record.decisions[0].outcome, "rejected");
        }
        _ => panic!("expected a completed cycle"),
    }
}

#[tokio::test]
async fn transient_llm_failure_recovers_on_retry() {
    let llm: Arc<dyn LLMClient> = Arc::new(ScriptedLLM::new(vec![
        Err(LLMError::Upstream("temporary 503".into())),
        Ok(r#"[{"symbol":"BTC","action":"HOLD","confidence":50}]"#.to_string()),
    ]));
    let (deps, _persistence) = deps_with_llm(llm);
    let executor = executor_with_retry(RetryConfig {
        max_retries: 2,
        base_delay: Duration::from_millis(5),
        enable_retry: true,
    });
    let config = trader_config();
    let mut state = TraderRuntimeState::new(Utc::now());
    state.status = TraderStatus::Running;

    let outcome = executor.run_cycle(&config, &mut state, &deps, &CancellationToken::new()).await;
    assert!(matches!(outcome, perpetron::executor::CycleOutcome::Completed(_)));
}

#[tokio::test]
async fn repeated_failures_pause_the_trader() {
    let llm: Arc<dyn LLMClient> = Arc::new(ScriptedLLM::new(vec![
        Ok("not valid json".to_string()),
        Ok("still not valid json".to_string()),
    ]));
    let (deps, _persistence) = deps_with_llm(llm);
    let executor = executor_with_retry(RetryConfig::default());
    let config = trader_config();
    let mut state = TraderRuntimeState::new(Utc::now());
    state.status = TraderStatus::Running;

    for _ in 0..2 {
        executor.run_cycle(&config, &mut state, &deps, &CancellationToken::new()).await;
    }

    assert_eq!(state.status, TraderStatus::Paused);
    assert!(state.pause_until.is_some());
}

#[tokio::test]
async fn skips_cycle_when_not_running() {
    let llm: Arc<dyn LLMClient> = Arc::new(ScriptedLLM::new(vec![]));
    let (deps, _persistence) = deps_with_llm(llm);
    let executor = executor_with_retry(RetryConfig::default());
    let config = trader_config();
    let mut state = TraderRuntimeState::new(Utc::now());
    state.status = TraderStatus::Paused;
    state.pause_until = Some(Utc::now() + chrono::Duration::seconds(60));

    let outcome = executor.run_cycle(&config, &mut state, &deps, &CancellationToken::new()).await;
    assert!(matches!(outcome, perpetron::executor::CycleOutcome::Skipped));
}

/// An LLM client that never resolves, so a cycle blocked on it can only be torn down by the
/// cancellation token racing against the in-flight call.
struct HangingLLM;

#[async_trait]
impl LLMClient for HangingLLM {
    async fn chat_structured(
        &self,
        _request: StructuredChatRequest,
        _schema: &serde_json::Value,
        _deadline: Deadline,
    ) -> Result<StructuredResponse, LLMError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn shutdown_signal_cancels_an_in_flight_cycle() {
    let llm: Arc<dyn LLMClient> = Arc::new(HangingLLM);
    let (deps, _persistence) = deps_with_llm(llm);
    let executor = executor_with_retry(RetryConfig::default());
    let config = trader_config();
    let mut state = TraderRuntimeState::new(Utc::now());
    state.status = TraderStatus::Running;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_clone.cancel();
    });

    let outcome = executor.run_cycle(&config, &mut state, &deps, &cancel).await;
    assert!(matches!(outcome, perpetron::executor::CycleOutcome::Cancelled));
}
