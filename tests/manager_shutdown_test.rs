use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;

use perpetron::domain::errors::{LLMError, PersistenceError, PromptError};
use perpetron::domain::ports::{
    ConversationRecorder, Deadline, ExchangeProvider, LLMClient, MarketProvider,
    PersistenceService, PromptRenderer, StructuredChatRequest, StructuredResponse,
};
use perpetron::domain::types::{
    AccountSyncSnapshot, AnalyticsSnapshot, ConversationRecord, DecisionCycleRecord, ExecGuards,
    ExecutorContext, PositionEvent, RiskParams, TraderConfig,
};
use perpetron::infrastructure::exchange::MockExchangeProvider;
use perpetron::infrastructure::market::MockMarketProvider;
use perpetron::manager::{Manager, ManagerSettings, ProviderRegistry};
use perpetron::metrics::CycleMetrics;

/// Never resolves, so a dispatched cycle can only be torn down by shutdown cancellation, not by
/// racing it to completion.
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

struct NoopPromptRenderer;

#[async_trait]
impl PromptRenderer for NoopPromptRenderer {
    async fn render(&self, _context: &ExecutorContext) -> Result<(String, String), PromptError> {
        Ok(("rendered prompt".to_string(), "digest".to_string()))
    }
}

#[derive(Default)]
struct InMemoryStore {
    cycles: Mutex<Vec<DecisionCycleRecord>>,
}

#[async_trait]
impl PersistenceService for InMemoryStore {
    async fn record_position_event(&self, _event: PositionEvent) -> Result<(), PersistenceError> {
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

#[async_trait]
impl ConversationRecorder for InMemoryStore {
    async fn record_conversation(&self, _record: ConversationRecord) -> Result<(), PersistenceError> {
        Ok(())
    }
}

fn trader_config(id: &str) -> TraderConfig {
    TraderConfig {
        id: id.into(),
        display_name: id.into(),
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

/// A trader stuck on a hanging LLM call must still honor `Shutdown`: the scheduler forces the
/// cycle to tear down once the grace period elapses instead of waiting on it forever.
#[tokio::test]
async fn shutdown_forces_a_stuck_trader_within_the_grace_period() {
    let metrics = Arc::new(CycleMetrics::new().unwrap());
    let store = Arc::new(InMemoryStore::default());
    let llm: Arc<dyn LLMClient> = Arc::new(HangingLLM);
    let prompt_renderer_factory: Arc<dyn Fn(&str) -> Arc<dyn PromptRenderer> + Send + Sync> =
        Arc::new(|_path: &str| Arc::new(NoopPromptRenderer) as Arc<dyn PromptRenderer>);

    let settings = ManagerSettings {
        tick_interval: Duration::from_millis(10),
        decision_interval: Duration::from_secs(60),
        decision_timeout: Duration::from_secs(30),
        shutdown_grace: Duration::from_millis(50),
        max_concurrent_decisions: 2,
        total_equity_usd: dec!(10000),
        reserve_equity_pct: dec!(0.1),
    };

    let manager = Manager::new(
        settings,
        llm,
        prompt_renderer_factory,
        store.clone(),
        store,
        metrics,
    );

    let mut registry = ProviderRegistry::new();
    registry.register_exchange("mock", Arc::new(MockExchangeProvider::new(dec!(100000), &["BTC"])) as Arc<dyn ExchangeProvider>);
    registry.register_market("mock", Arc::new(MockMarketProvider::new(&["BTC"])) as Arc<dyn MarketProvider>);

    manager.register_trader(trader_config("alpha"), &registry).await.unwrap();
    manager.adapt_equity().await;
    manager.hydrate_state().await.unwrap();

    let handle = manager.commands();
    let manager_task = tokio::spawn(manager.run());

    // Give the scheduler a couple of ticks to dispatch the trader onto the hanging LLM call.
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.shutdown().await;

    // Bounded well above shutdown_grace: if forced cancellation didn't actually tear the task
    // down, this would hang until the test harness's own timeout instead.
    let result = tokio::time::timeout(Duration::from_secs(2), manager_task).await;
    assert!(result.is_ok(), "manager did not shut down within the grace period + abort window");
    assert!(result.unwrap().is_ok(), "manager run task returned an error");
}
