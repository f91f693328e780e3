use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use super::errors::{ExchangeError, LLMError, MarketError, PersistenceError, PromptError};
use super::types::{
    AccountState, AccountSyncSnapshot, AnalyticsSnapshot, Asset, ConversationRecord,
    DecisionCycleRecord, ExecutorContext, MarketSnapshot, Order, OrderResponse, OrderStatus,
    Position, PositionEvent,
};

/// A bounded wait for a single capability call. Callers derive this from the cycle deadline.
pub type Deadline = Duration;

#[async_trait]
pub trait MarketProvider: Send + Sync {
    async fn snapshot(&self, symbol: &str, deadline: Deadline) -> Result<MarketSnapshot, MarketError>;
    async fn list_assets(&self, deadline: Deadline) -> Result<Vec<Asset>, MarketError>;
}

#[async_trait]
pub trait ExchangeProvider: Send + Sync {
    async fn place_order(&self, order: Order, deadline: Deadline) -> Result<OrderResponse, ExchangeError>;
    async fn cancel_order(&self, asset_index: u32, order_id: u64, deadline: Deadline) -> Result<(), ExchangeError>;
    async fn get_open_orders(&self, deadline: Deadline) -> Result<Vec<OrderStatus>, ExchangeError>;
    async fn get_positions(&self, deadline: Deadline) -> Result<Vec<Position>, ExchangeError>;
    async fn get_account_state(&self, deadline: Deadline) -> Result<AccountState, ExchangeError>;
    async fn get_account_value(&self, deadline: Deadline) -> Result<rust_decimal::Decimal, ExchangeError>;
    async fn close_position(&self, symbol: &str, deadline: Deadline) -> Result<OrderResponse, ExchangeError>;
    async fn update_leverage(&self, asset_index: u32, is_cross: bool, leverage: u32, deadline: Deadline) -> Result<(), ExchangeError>;
    async fn asset_index(&self, symbol: &str) -> Result<u32, ExchangeError>;
}

/// A single chat turn handed to the LLM, plus the JSON schema the response must conform to.
#[derive(Debug, Clone)]
pub struct StructuredChatRequest {
    pub model_alias: String,
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Debug, Clone)]
pub struct StructuredResponse {
    pub raw_text: String,
    pub tokens_used: Option<u32>,
}

#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn chat_structured(
        &self,
        request: StructuredChatRequest,
        schema: &serde_json::Value,
        deadline: Deadline,
    ) -> Result<StructuredResponse, LLMError>;
}

#[async_trait]
pub trait PromptRenderer: Send + Sync {
    /// Returns `(rendered prompt, sha256-hex digest of the rendered text)`.
    async fn render(&self, context: &ExecutorContext) -> Result<(String, String), PromptError>;
}

#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn record_position_event(&self, event: PositionEvent) -> Result<(), PersistenceError>;
    async fn record_decision_cycle(&self, record: DecisionCycleRecord) -> Result<(), PersistenceError>;
    async fn record_account_snapshot(&self, snapshot: AccountSyncSnapshot) -> Result<(), PersistenceError>;
    async fn record_analytics(&self, snapshot: AnalyticsSnapshot) -> Result<(), PersistenceError>;
    async fn recent_cycles(&self, trader_id: &str, limit: u32) -> Result<Vec<DecisionCycleRecord>, PersistenceError>;
    /// Restores the durable state needed to resume after a restart: the last cycle number run
    /// per trader, keyed by trader id. Traders with no prior history are simply absent.
    async fn hydrate_caches(&self, trader_ids: &[String]) -> Result<HashMap<String, u64>, PersistenceError>;
}

#[async_trait]
pub trait ConversationRecorder: Send + Sync {
    async fn record_conversation(&self, record: ConversationRecord) -> Result<(), PersistenceError>;
}
