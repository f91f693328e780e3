use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    Close,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraderStatus {
    Registered,
    Running,
    Paused,
    Stopped,
    Error,
}

/// Static, per-trader configuration loaded at startup. Immutable for the life of the run.
#[derive(Debug, Clone, Deserialize)]
pub struct TraderConfig {
    pub id: String,
    pub display_name: String,
    pub exchange_provider: String,
    pub market_provider: String,
    pub model_alias: String,
    pub prompt_template_path: String,
    pub allocation_pct: Decimal,
    #[serde(default)]
    pub auto_start: bool,
    pub risk_params: RiskParams,
    pub exec_guards: ExecGuards,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskParams {
    pub min_confidence: u8,
    pub min_risk_reward: Decimal,
    pub max_position_size_usd: Decimal,
    pub max_positions: usize,
    pub major_coin_leverage: u32,
    pub altcoin_leverage: u32,
    #[serde(default = "default_reserve_pct")]
    pub reserve_equity_pct: Decimal,
}

fn default_reserve_pct() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecGuards {
    pub candidate_limit: usize,
    pub max_consecutive_failures: u32,
    pub symbol_whitelist: Vec<String>,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,
}

fn default_cooldown_seconds() -> i64 {
    300
}

/// Major-coin classification used by the risk evaluator's leverage-cap rule.
pub fn is_major_coin(symbol: &str) -> bool {
    matches!(symbol, "BTC" | "ETH")
}

/// Mutable scheduling/runtime state for a trader, owned exclusively by the Manager.
#[derive(Debug, Clone)]
pub struct TraderRuntimeState {
    pub status: TraderStatus,
    pub last_decision_at: Option<DateTime<Utc>>,
    pub next_due_at: DateTime<Utc>,
    pub pause_until: Option<DateTime<Utc>>,
    pub cooldowns: HashMap<String, DateTime<Utc>>,
    pub cycle_number: u64,
    pub consecutive_failures: u32,
    pub in_flight: bool,
    pub effective_equity_usd: Decimal,
}

impl TraderRuntimeState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: TraderStatus::Registered,
            last_decision_at: None,
            next_due_at: now,
            pause_until: None,
            cooldowns: HashMap::new(),
            cycle_number: 0,
            consecutive_failures: 0,
            in_flight: false,
            effective_equity_usd: Decimal::ZERO,
        }
    }

    pub fn cooldown_active(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.cooldowns.get(symbol).is_some_and(|deadline| *deadline > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
    pub liquidation_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub account_value_usd: Decimal,
    pub total_margin_used_usd: Decimal,
    pub available_balance_usd: Decimal,
    pub positions: Vec<Position>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorBundle {
    pub ema: HashMap<u32, Decimal>,
    pub macd: Option<(Decimal, Decimal, Decimal)>,
    pub rsi: HashMap<u32, Decimal>,
    pub bollinger: Option<(Decimal, Decimal, Decimal)>,
    pub atr: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: Decimal,
    pub change_1h_pct: Decimal,
    pub change_4h_pct: Decimal,
    pub indicators: IndicatorBundle,
    pub open_interest_latest: Option<Decimal>,
    pub open_interest_avg: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
    pub intraday_closes: Vec<Decimal>,
    pub long_term_closes: Vec<Decimal>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSummary {
    pub min_confidence: u8,
    pub min_risk_reward: Decimal,
    pub max_position_size_usd: Decimal,
    pub max_positions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorContext {
    pub trader_id: String,
    pub timestamp: DateTime<Utc>,
    pub account_state: AccountState,
    pub candidate_symbols: Vec<String>,
    pub snapshots: HashMap<String, MarketSnapshot>,
    pub recent_cycles_digest: String,
    pub risk_summary: RiskSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: DecisionAction,
    pub confidence: u8,
    pub leverage: Option<u32>,
    pub position_size_usd: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub risk_usd: Option<Decimal>,
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClampNote {
    pub field: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub enum RiskOutcome {
    Accept(Decision),
    Clamp(Decision, Vec<ClampNote>),
    Reject(Decision, crate::domain::errors::RiskRejectReason),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcomeRecord {
    pub decision: Decision,
    pub outcome: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionCycleRecord {
    pub id: Uuid,
    pub trader_id: String,
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub prompt_digest: String,
    pub cot_trace: String,
    pub decisions: Vec<DecisionOutcomeRecord>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionEventKind {
    Open,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEvent {
    pub trader_id: String,
    pub symbol: String,
    pub decision: Decision,
    pub kind: PositionEventKind,
    pub fill_price: Decimal,
    pub fill_size: Decimal,
    pub raw_response: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSyncSnapshot {
    pub trader_id: String,
    pub account_state: AccountState,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub trader_id: String,
    pub realized_pnl_usd: Decimal,
    pub cycles_run: u64,
    pub decisions_accepted: u64,
    pub decisions_rejected: u64,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub conversation_id: Uuid,
    pub trader_id: String,
    pub role: String,
    pub content: String,
    pub model: String,
    pub tokens: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    pub asset_index: u32,
}

/// Abstract order payload submitted to an `ExchangeProvider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub asset_index: u32,
    pub is_buy: bool,
    pub limit_price: Decimal,
    pub size: Decimal,
    pub reduce_only: bool,
    pub time_in_force: TimeInForce,
    pub cloid: Option<Uuid>,
    pub trigger_price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Alo,
    Ioc,
    Gtc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderLegStatus {
    Resting { order_id: u64 },
    Filled { avg_price: Decimal, total_size: Decimal, order_id: u64 },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub statuses: Vec<OrderLegStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: u64,
    pub symbol: String,
    pub is_buy: bool,
    pub size: Decimal,
    pub limit_price: Decimal,
}
