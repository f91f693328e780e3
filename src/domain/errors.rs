use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("unknown symbol: {0}")]
    SymbolUnknown(String),
    #[error("upstream market data error: {0}")]
    Upstream(String),
    #[error("market data call timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("insufficient balance for order")]
    InsufficientBalance,
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("upstream exchange error: {0}")]
    Upstream(String),
    #[error("exchange call timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("upstream LLM error: {0}")]
    Upstream(String),
    #[error("LLM call timed out")]
    Timeout,
    #[error("response did not conform to schema: {0}")]
    SchemaViolation(String),
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("template error: {0}")]
    TemplateError(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("assistant output was not valid JSON: {0}")]
    NotJson(String),
    #[error("decision list did not conform to schema: {0}")]
    SchemaViolation(String),
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("trader id already registered: {0}")]
    DuplicateTrader(String),
    #[error("unresolved provider: {0}")]
    ProviderUnresolved(String),
    #[error("invalid prompt template: {0}")]
    InvalidPrompt(String),
    #[error("unknown trader: {0}")]
    UnknownTrader(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("context unavailable: {0}")]
    ContextUnavailable(String),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Llm(#[from] LLMError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("trader skipped (not running or in cooldown)")]
    Skipped,
}

/// Reasons the risk evaluator can reject a decision outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskRejectReason {
    SymbolNotAllowed,
    LowConfidence,
    PoorRiskReward,
    TooManyPositions,
    InsufficientEquity,
    Cooldown,
}

impl RiskRejectReason {
    /// Short, stable label suitable for a metric's `reason` dimension.
    pub fn label(&self) -> &'static str {
        match self {
            RiskRejectReason::SymbolNotAllowed => "symbol_not_allowed",
            RiskRejectReason::LowConfidence => "low_confidence",
            RiskRejectReason::PoorRiskReward => "poor_risk_reward",
            RiskRejectReason::TooManyPositions => "too_many_positions",
            RiskRejectReason::InsufficientEquity => "insufficient_equity",
            RiskRejectReason::Cooldown => "cooldown",
        }
    }
}

impl std::fmt::Display for RiskRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskRejectReason::SymbolNotAllowed => "symbol not in whitelist",
            RiskRejectReason::LowConfidence => "confidence below minimum",
            RiskRejectReason::PoorRiskReward => "risk/reward below minimum",
            RiskRejectReason::TooManyPositions => "too many open positions",
            RiskRejectReason::InsufficientEquity => "insufficient equity for notional exposure",
            RiskRejectReason::Cooldown => "symbol is in cooldown",
        };
        write!(f, "{s}")
    }
}
