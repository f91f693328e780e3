use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::warn;

use crate::domain::errors::CycleError;
use crate::domain::ports::{ExchangeProvider, MarketProvider};
use crate::domain::types::{ExecutorContext, Position, RiskSummary, TraderConfig};

/// Assembles an [`ExecutorContext`] for one cycle. Pure given its inputs: once snapshots are
/// fetched it performs no further I/O.
pub struct ContextBuilder {
    account_timeout: Duration,
    snapshot_timeout: Duration,
}

impl ContextBuilder {
    pub fn new(account_timeout: Duration, snapshot_timeout: Duration) -> Self {
        Self {
            account_timeout,
            snapshot_timeout,
        }
    }

    #[tracing::instrument(skip_all, fields(trader_id = %config.id))]
    pub async fn build(
        &self,
        config: &TraderConfig,
        exchange: &Arc<dyn ExchangeProvider>,
        market: &Arc<dyn MarketProvider>,
        recent_cycles_digest: String,
    ) -> Result<ExecutorContext, CycleError> {
        let account_state = exchange
            .get_account_state(self.account_timeout)
            .await
            .map_err(|e| CycleError::ContextUnavailable(format!("account state: {e}")))?;

        let candidates = self.select_candidates(config, market, &account_state.positions).await?;

        let fetches = candidates.iter().map(|symbol| {
            let market = market.clone();
            let symbol = symbol.clone();
            let timeout = self.snapshot_timeout;
            async move {
                let result = market.snapshot(&symbol, timeout).await;
                (symbol, result)
            }
        });

        let mut snapshots = HashMap::new();
        for (symbol, result) in join_all(fetches).await {
            match result {
                Ok(snapshot) => {
                    snapshots.insert(symbol, snapshot);
                }
                Err(e) => warn!(%symbol, error = %e, "snapshot fetch failed, continuing cycle"),
            }
        }

        if snapshots.is_empty() && !candidates.is_empty() {
            return Err(CycleError::ContextUnavailable(
                "no market snapshots were obtained for any candidate symbol".into(),
            ));
        }

        Ok(ExecutorContext {
            trader_id: config.id.clone(),
            timestamp: Utc::now(),
            account_state,
            candidate_symbols: candidates,
            snapshots,
            recent_cycles_digest,
            risk_summary: RiskSummary {
                min_confidence: config.risk_params.min_confidence,
                min_risk_reward: config.risk_params.min_risk_reward,
                max_position_size_usd: config.risk_params.max_position_size_usd,
                max_positions: config.risk_params.max_positions,
            },
        })
    }

    async fn select_candidates(
        &self,
        config: &TraderConfig,
        market: &Arc<dyn MarketProvider>,
        positions: &[Position],
    ) -> Result<Vec<String>, CycleError> {
        let assets = market
            .list_assets(self.snapshot_timeout)
            .await
            .map_err(|e| CycleError::ContextUnavailable(format!("list assets: {e}")))?;

        let mut candidates: Vec<String> = Vec::new();

        for position in positions {
            if config.exec_guards.symbol_whitelist.contains(&position.symbol)
                && !candidates.contains(&position.symbol)
            {
                candidates.push(position.symbol.clone());
            }
        }

        for asset in assets {
            if candidates.len() >= config.exec_guards.candidate_limit {
                break;
            }
            if config.exec_guards.symbol_whitelist.contains(&asset.symbol)
                && !candidates.contains(&asset.symbol)
            {
                candidates.push(asset.symbol);
            }
        }

        candidates.truncate(config.exec_guards.candidate_limit);
        Ok(candidates)
    }
}
