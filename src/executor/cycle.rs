use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::decision::parser::decision_list_schema;
use crate::decision::DecisionParser;
use crate::domain::errors::{CycleError, ExchangeError, LLMError};
use crate::domain::ports::{
    ConversationRecorder, ExchangeProvider, LLMClient, MarketProvider, PersistenceService,
    PromptRenderer, StructuredChatRequest,
};
use crate::domain::types::{
    ConversationRecord, Decision, DecisionAction, DecisionCycleRecord, DecisionOutcomeRecord,
    Order, OrderLegStatus, PositionEvent, PositionEventKind, RiskOutcome, TimeInForce,
    TraderConfig, TraderRuntimeState, TraderStatus,
};
use crate::context::ContextBuilder;
use crate::metrics::CycleMetrics;
use crate::risk::RiskEvaluator;

/// Retry policy for the LLM call step, exponential with jitter, bounded by the cycle deadline.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub enable_retry: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            enable_retry: true,
        }
    }
}

pub enum CycleOutcome {
    Skipped,
    Completed(DecisionCycleRecord),
    Failed(DecisionCycleRecord),
    /// The cycle was torn down mid-flight by a shutdown signal before it could complete.
    Cancelled,
}

pub struct ExecutorDeps {
    pub exchange: Arc<dyn ExchangeProvider>,
    pub market: Arc<dyn MarketProvider>,
    pub llm: Arc<dyn LLMClient>,
    pub prompt_renderer: Arc<dyn PromptRenderer>,
    pub persistence: Arc<dyn PersistenceService>,
    pub conversation_recorder: Arc<dyn ConversationRecorder>,
}

/// Runs one decision cycle for a single trader. Stateless between cycles; all mutable state
/// lives in the caller-owned [`TraderRuntimeState`].
pub struct Executor {
    context_builder: ContextBuilder,
    risk_evaluator: RiskEvaluator,
    parser: DecisionParser,
    retry: RetryConfig,
    decision_timeout: Duration,
    metrics: Arc<CycleMetrics>,
}

impl Executor {
    pub fn new(
        context_builder: ContextBuilder,
        retry: RetryConfig,
        decision_timeout: Duration,
        metrics: Arc<CycleMetrics>,
    ) -> Self {
        Self {
            context_builder,
            risk_evaluator: RiskEvaluator::new(),
            parser: DecisionParser::new(),
            retry,
            decision_timeout,
            metrics,
        }
    }

    #[instrument(skip_all, fields(trader_id = %config.id, cycle = state.cycle_number + 1))]
    pub async fn run_cycle(
        &self,
        config: &TraderConfig,
        state: &mut TraderRuntimeState,
        deps: &ExecutorDeps,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let now = Utc::now();

        if state.status != TraderStatus::Running || state.pause_until.is_some_and(|p| p > now) {
            return CycleOutcome::Skipped;
        }

        state.cycle_number += 1;
        let cycle_number = state.cycle_number;

        let inner_result = tokio::select! {
            result = self.run_cycle_inner(config, state, deps, now) => result,
            _ = cancel.cancelled() => {
                warn!(trader_id = %config.id, cycle_number, "decision cycle cancelled during shutdown");
                return CycleOutcome::Cancelled;
            }
        };

        match inner_result {
            Ok(record) => {
                state.consecutive_failures = 0;
                state.last_decision_at = Some(now);
                self.metrics.cycles_total.inc();
                CycleOutcome::Completed(record)
            }
            Err((error, cot_trace)) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= config.exec_guards.max_consecutive_failures {
                    warn!(
                        trader_id = %config.id,
                        failures = state.consecutive_failures,
                        "pausing trader after consecutive failures"
                    );
                    state.status = TraderStatus::Paused;
                    state.pause_until = Some(now + chrono::Duration::seconds(config.exec_guards.cooldown_seconds));
                }
                error!(trader_id = %config.id, %error, "decision cycle failed");
                CycleOutcome::Failed(DecisionCycleRecord {
                    id: Uuid::new_v4(),
                    trader_id: config.id.clone(),
                    cycle_number,
                    timestamp: now,
                    prompt_digest: String::new(),
                    cot_trace,
                    decisions: vec![],
                    success: false,
                    error_message: Some(error.to_string()),
                })
            }
        }
    }

    async fn run_cycle_inner(
        &self,
        config: &TraderConfig,
        state: &mut TraderRuntimeState,
        deps: &ExecutorDeps,
        now: chrono::DateTime<Utc>,
    ) -> Result<DecisionCycleRecord, (CycleError, String)> {
        let recent_cycles_digest = deps
            .persistence
            .recent_cycles(&config.id, 5)
            .await
            .map(|records| summarize_recent_cycles(&records))
            .unwrap_or_default();

        let context = self
            .context_builder
            .build(config, &deps.exchange, &deps.market, recent_cycles_digest)
            .await
            .map_err(|e| (e, String::new()))?;

        let (rendered, prompt_digest) = deps
            .prompt_renderer
            .render(&context)
            .await
            .map_err(|e| (CycleError::from(e), String::new()))?;

        let request = StructuredChatRequest {
            model_alias: config.model_alias.clone(),
            system_prompt: String::new(),
            user_prompt: rendered,
        };
        let schema = decision_list_schema();

        let response = self
            .call_llm_with_retry(&deps.llm, request, &schema)
            .await
            .map_err(|e| (CycleError::from(e), String::new()))?;

        let _ = deps
            .conversation_recorder
            .record_conversation(ConversationRecord {
                conversation_id: Uuid::new_v4(),
                trader_id: config.id.clone(),
                role: "assistant".into(),
                content: response.raw_text.clone(),
                model: config.model_alias.clone(),
                tokens: response.tokens_used,
                timestamp: now,
            })
            .await;

        let decisions = self
            .parser
            .parse(&response.raw_text)
            .map_err(|e| (CycleError::from(e), response.raw_text.clone()))?;

        let mut outcome_records = Vec::with_capacity(decisions.len());

        for decision in decisions {
            let symbol = decision.symbol.clone();
            let cooldown_until = state.cooldowns.get(&symbol).copied();
            let outcome = self.risk_evaluator.evaluate(
                decision,
                &config.risk_params,
                &config.exec_guards,
                &context.account_state,
                now,
                cooldown_until,
            );

            match outcome {
                RiskOutcome::Reject(decision, reason) => {
                    self.metrics.decisions_rejected_total.inc();
                    self.metrics
                        .decisions_rejected_by_reason
                        .with_label_values(&[reason.label()])
                        .inc();
                    outcome_records.push(DecisionOutcomeRecord {
                        decision,
                        outcome: "rejected".into(),
                        error: Some(reason.to_string()),
                    });
                }
                RiskOutcome::Accept(decision) | RiskOutcome::Clamp(decision, _) => {
                    self.metrics.decisions_accepted_total.inc();
                    let record = self.execute_decision(config, state, deps, decision, now).await;
                    outcome_records.push(record);
                }
            }
        }

        Ok(DecisionCycleRecord {
            id: Uuid::new_v4(),
            trader_id: config.id.clone(),
            cycle_number: state.cycle_number,
            timestamp: now,
            prompt_digest,
            cot_trace: response.raw_text,
            decisions: outcome_records,
            success: true,
            error_message: None,
        })
    }

    async fn execute_decision(
        &self,
        config: &TraderConfig,
        state: &mut TraderRuntimeState,
        deps: &ExecutorDeps,
        decision: Decision,
        now: chrono::DateTime<Utc>,
    ) -> DecisionOutcomeRecord {
        let symbol = decision.symbol.clone();
        let cooldown_deadline = now + chrono::Duration::seconds(config.exec_guards.cooldown_seconds);

        let result = match decision.action {
            DecisionAction::Hold => Ok(None),
            DecisionAction::OpenLong | DecisionAction::OpenShort => {
                self.open_position(config, deps, &decision).await
            }
            DecisionAction::Close => self.close_position(config, deps, &decision).await,
        };

        match result {
            Ok(Some(event)) => {
                if !matches!(decision.action, DecisionAction::Hold) {
                    state.cooldowns.insert(symbol.clone(), cooldown_deadline);
                }
                let _ = deps.persistence.record_position_event(event).await;
                DecisionOutcomeRecord {
                    decision,
                    outcome: "executed".into(),
                    error: None,
                }
            }
            Ok(None) => DecisionOutcomeRecord {
                decision,
                outcome: "held".into(),
                error: None,
            },
            Err(e) => {
                if is_unsafe_exchange_error(&e) {
                    state.status = TraderStatus::Paused;
                }
                DecisionOutcomeRecord {
                    decision,
                    outcome: "error".into(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn open_position(
        &self,
        config: &TraderConfig,
        deps: &ExecutorDeps,
        decision: &Decision,
    ) -> Result<Option<PositionEvent>, ExchangeError> {
        let asset_index = deps.exchange.asset_index(&decision.symbol).await?;
        let is_major = crate::domain::types::is_major_coin(&decision.symbol);
        let leverage = decision.leverage.unwrap_or(if is_major {
            config.risk_params.major_coin_leverage
        } else {
            config.risk_params.altcoin_leverage
        });
        deps.exchange
            .update_leverage(asset_index, true, leverage, self.decision_timeout)
            .await?;

        let notional = decision.position_size_usd.unwrap_or_default();
        let price = decision.entry_price.unwrap_or_default();
        let size = if price.is_zero() { notional } else { notional / price };

        let order = Order {
            asset_index,
            is_buy: matches!(decision.action, DecisionAction::OpenLong),
            limit_price: price,
            size,
            reduce_only: false,
            time_in_force: TimeInForce::Ioc,
            cloid: Some(Uuid::new_v4()),
            trigger_price: None,
        };

        let response = deps.exchange.place_order(order, self.decision_timeout).await?;
        let fill = fill_from_response(&response);

        // Stop-loss/take-profit triggers are placed only after a confirmed fill: the venue
        // rejects reduce-only triggers against a position that does not yet exist.
        if let Some((fill_price, fill_size)) = fill {
            if fill_size > rust_decimal::Decimal::ZERO {
                if let Some(stop) = decision.stop_loss {
                    let _ = self
                        .place_reduce_only_trigger(deps, asset_index, decision, stop, fill_size)
                        .await;
                }
                if let Some(tp) = decision.take_profit {
                    let _ = self
                        .place_reduce_only_trigger(deps, asset_index, decision, tp, fill_size)
                        .await;
                }
                return Ok(Some(PositionEvent {
                    trader_id: config.id.clone(),
                    symbol: decision.symbol.clone(),
                    decision: decision.clone(),
                    kind: PositionEventKind::Open,
                    fill_price,
                    fill_size,
                    raw_response: format!("{response:?}"),
                    occurred_at: Utc::now(),
                }));
            }
        }

        Ok(None)
    }

    async fn place_reduce_only_trigger(
        &self,
        deps: &ExecutorDeps,
        asset_index: u32,
        decision: &Decision,
        trigger_price: rust_decimal::Decimal,
        size: rust_decimal::Decimal,
    ) -> Result<(), ExchangeError> {
        let order = Order {
            asset_index,
            is_buy: !matches!(decision.action, DecisionAction::OpenLong),
            limit_price: trigger_price,
            size,
            reduce_only: true,
            time_in_force: TimeInForce::Gtc,
            cloid: Some(Uuid::new_v4()),
            trigger_price: Some(trigger_price),
        };
        deps.exchange.place_order(order, self.decision_timeout).await?;
        Ok(())
    }

    async fn close_position(
        &self,
        config: &TraderConfig,
        deps: &ExecutorDeps,
        decision: &Decision,
    ) -> Result<Option<PositionEvent>, ExchangeError> {
        let response = deps
            .exchange
            .close_position(&decision.symbol, self.decision_timeout)
            .await?;
        let fill = fill_from_response(&response);
        Ok(fill.map(|(fill_price, fill_size)| PositionEvent {
            trader_id: config.id.clone(),
            symbol: decision.symbol.clone(),
            decision: decision.clone(),
            kind: PositionEventKind::Close,
            fill_price,
            fill_size,
            raw_response: format!("{response:?}"),
            occurred_at: Utc::now(),
        }))
    }

    async fn call_llm_with_retry(
        &self,
        llm: &Arc<dyn LLMClient>,
        request: StructuredChatRequest,
        schema: &serde_json::Value,
    ) -> Result<crate::domain::ports::StructuredResponse, LLMError> {
        let mut attempt = 0u32;
        loop {
            let started = std::time::Instant::now();
            let result = llm.chat_structured(request.clone(), schema, self.decision_timeout).await;
            self.metrics
                .llm_call_duration_seconds
                .observe(started.elapsed().as_secs_f64());
            match result {
                Ok(response) => return Ok(response),
                Err(e @ (LLMError::RateLimited | LLMError::Upstream(_)))
                    if self.retry.enable_retry && attempt < self.retry.max_retries =>
                {
                    attempt += 1;
                    let jitter_ms: u64 = rand::rng().random_range(0..100);
                    let delay = self.retry.base_delay * 2u32.pow(attempt - 1)
                        + Duration::from_millis(jitter_ms);
                    warn!(attempt, ?delay, error = %e, "retrying LLM call after transient failure");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn fill_from_response(
    response: &crate::domain::types::OrderResponse,
) -> Option<(rust_decimal::Decimal, rust_decimal::Decimal)> {
    response.statuses.iter().find_map(|status| match status {
        OrderLegStatus::Filled { avg_price, total_size, .. } => Some((*avg_price, *total_size)),
        _ => None,
    })
}

fn is_unsafe_exchange_error(error: &ExchangeError) -> bool {
    matches!(error, ExchangeError::Auth(_) | ExchangeError::InvalidOrder(_))
}

fn summarize_recent_cycles(records: &[DecisionCycleRecord]) -> String {
    records
        .iter()
        .map(|r| {
            format!(
                "cycle #{} at {}: {} decisions, success={}",
                r.cycle_number,
                r.timestamp,
                r.decisions.len(),
                r.success
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[allow(dead_code)]
fn notional_as_f64(value: rust_decimal::Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
