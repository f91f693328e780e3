use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::errors::RiskRejectReason;
use crate::domain::types::{
    AccountState, ClampNote, Decision, DecisionAction, ExecGuards, RiskOutcome, RiskParams,
    is_major_coin,
};

/// Pure, ordered-rule risk validator. Mirrors the broker's validator-pipeline convention but
/// replaces a priority-sorted list of independent validators with a fixed rule sequence: the
/// first rule to fail dictates the outcome, and size/leverage clamps accumulate rather than
/// short-circuiting.
pub struct RiskEvaluator;

impl RiskEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        decision: Decision,
        params: &RiskParams,
        guards: &ExecGuards,
        account: &AccountState,
        now: DateTime<Utc>,
        cooldown_until: Option<DateTime<Utc>>,
    ) -> RiskOutcome {
        let is_flatten = matches!(decision.action, DecisionAction::Hold | DecisionAction::Close);

        // Rule 1: whitelist. Applies to every action, including flattens.
        if !guards.symbol_whitelist.iter().any(|s| s == &decision.symbol) {
            return RiskOutcome::Reject(decision, RiskRejectReason::SymbolNotAllowed);
        }

        // Rule 8: cooldown. Applies to every action.
        if let Some(deadline) = cooldown_until {
            if deadline > now {
                return RiskOutcome::Reject(decision, RiskRejectReason::Cooldown);
            }
        }

        // `Hold` and `Close` skip rules 2-7: rule 6 is honored trivially since flattening never
        // grows the open-position count.
        if is_flatten {
            return RiskOutcome::Accept(decision);
        }

        // Rule 2: confidence floor.
        if decision.confidence < params.min_confidence {
            return RiskOutcome::Reject(decision, RiskRejectReason::LowConfidence);
        }

        let mut decision = decision;
        let mut notes = Vec::new();

        // Rule 3: risk/reward, only when both stop and take-profit are present.
        if let (Some(entry), Some(stop), Some(tp)) =
            (decision.entry_price, decision.stop_loss, decision.take_profit)
        {
            let risk = (entry - stop).abs();
            let reward = (tp - entry).abs();
            if risk > Decimal::ZERO {
                let rr = reward / risk;
                if rr < params.min_risk_reward {
                    return RiskOutcome::Reject(decision, RiskRejectReason::PoorRiskReward);
                }
            }
        }

        // Rule 4: position size cap.
        if let Some(size) = decision.position_size_usd {
            if size > params.max_position_size_usd {
                notes.push(ClampNote {
                    field: "position_size_usd".into(),
                    from: size.to_string(),
                    to: params.max_position_size_usd.to_string(),
                });
                decision.position_size_usd = Some(params.max_position_size_usd);
            }
        }

        // Rule 5: leverage cap, major vs. altcoin.
        let leverage_cap = if is_major_coin(&decision.symbol) {
            params.major_coin_leverage
        } else {
            params.altcoin_leverage
        };
        if let Some(leverage) = decision.leverage {
            if leverage > leverage_cap {
                notes.push(ClampNote {
                    field: "leverage".into(),
                    from: leverage.to_string(),
                    to: leverage_cap.to_string(),
                });
                decision.leverage = Some(leverage_cap);
            }
        }

        // Rule 6: max open positions, applied unconditionally at the cap.
        if account.positions.len() >= params.max_positions {
            return RiskOutcome::Reject(decision, RiskRejectReason::TooManyPositions);
        }

        // Rule 7: notional exposure after execution must respect the equity reserve.
        let existing_notional: Decimal = account
            .positions
            .iter()
            .map(|p| p.size.abs() * p.entry_price)
            .sum();
        let added_notional = decision.position_size_usd.unwrap_or(Decimal::ZERO);
        let allowed = account.account_value_usd * (Decimal::ONE - params.reserve_equity_pct);
        if existing_notional + added_notional > allowed {
            return RiskOutcome::Reject(decision, RiskRejectReason::InsufficientEquity);
        }

        if notes.is_empty() {
            RiskOutcome::Accept(decision)
        } else {
            RiskOutcome::Clamp(decision, notes)
        }
    }
}

impl Default for RiskEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AccountState, DecisionAction, Position, PositionSide};
    use rust_decimal_macros::dec;

    fn params() -> RiskParams {
        RiskParams {
            min_confidence: 60,
            min_risk_reward: dec!(1.5),
            max_position_size_usd: dec!(1000),
            max_positions: 3,
            major_coin_leverage: 10,
            altcoin_leverage: 5,
            reserve_equity_pct: dec!(0.1),
        }
    }

    fn guards() -> ExecGuards {
        ExecGuards {
            candidate_limit: 10,
            max_consecutive_failures: 3,
            symbol_whitelist: vec!["BTC".into(), "SOL".into()],
            cooldown_seconds: 300,
        }
    }

    fn account() -> AccountState {
        AccountState {
            account_value_usd: dec!(10000),
            total_margin_used_usd: dec!(0),
            available_balance_usd: dec!(10000),
            positions: vec![],
        }
    }

    fn open_decision(symbol: &str, size: Decimal, leverage: u32, confidence: u8) -> Decision {
        Decision {
            symbol: symbol.into(),
            action: DecisionAction::OpenLong,
            confidence,
            leverage: Some(leverage),
            position_size_usd: Some(size),
            entry_price: Some(dec!(100)),
            stop_loss: Some(dec!(95)),
            take_profit: Some(dec!(115)),
            risk_usd: None,
            rationale: None,
        }
    }

    #[test]
    fn accepts_a_well_formed_decision() {
        let eval = RiskEvaluator::new();
        let outcome = eval.evaluate(
            open_decision("BTC", dec!(500), 5, 80),
            &params(),
            &guards(),
            &account(),
            Utc::now(),
            None,
        );
        assert!(matches!(outcome, RiskOutcome::Accept(_)));
    }

    #[test]
    fn rejects_symbol_outside_whitelist() {
        let eval = RiskEvaluator::new();
        let outcome = eval.evaluate(
            open_decision("DOGE", dec!(500), 5, 80),
            &params(),
            &guards(),
            &account(),
            Utc::now(),
            None,
        );
        assert!(matches!(
            outcome,
            RiskOutcome::Reject(_, RiskRejectReason::SymbolNotAllowed)
        ));
    }

    #[test]
    fn rejects_low_confidence() {
        let eval = RiskEvaluator::new();
        let outcome = eval.evaluate(
            open_decision("BTC", dec!(500), 5, 40),
            &params(),
            &guards(),
            &account(),
            Utc::now(),
            None,
        );
        assert!(matches!(
            outcome,
            RiskOutcome::Reject(_, RiskRejectReason::LowConfidence)
        ));
    }

    #[test]
    fn clamps_oversized_position() {
        let eval = RiskEvaluator::new();
        let outcome = eval.evaluate(
            open_decision("BTC", dec!(5000), 5, 80),
            &params(),
            &guards(),
            &account(),
            Utc::now(),
            None,
        );
        match outcome {
            RiskOutcome::Clamp(d, notes) => {
                assert_eq!(d.position_size_usd, Some(dec!(1000)));
                assert!(notes.iter().any(|n| n.field == "position_size_usd"));
            }
            other => panic!("expected clamp, got {other:?}"),
        }
    }

    #[test]
    fn clamps_excess_leverage_for_altcoin() {
        let eval = RiskEvaluator::new();
        let outcome = eval.evaluate(
            open_decision("SOL", dec!(500), 20, 80),
            &params(),
            &guards(),
            &account(),
            Utc::now(),
            None,
        );
        match outcome {
            RiskOutcome::Clamp(d, notes) => {
                assert_eq!(d.leverage, Some(5));
                assert!(notes.iter().any(|n| n.field == "leverage"));
            }
            other => panic!("expected clamp, got {other:?}"),
        }
    }

    #[test]
    fn rejects_when_max_positions_reached() {
        let eval = RiskEvaluator::new();
        let mut acct = account();
        acct.positions = vec![
            Position {
                symbol: "ETH".into(),
                side: PositionSide::Long,
                size: dec!(1),
                entry_price: dec!(2000),
                leverage: 5,
                unrealized_pnl: dec!(0),
                liquidation_price: None,
            },
            Position {
                symbol: "SOL".into(),
                side: PositionSide::Long,
                size: dec!(10),
                entry_price: dec!(100),
                leverage: 5,
                unrealized_pnl: dec!(0),
                liquidation_price: None,
            },
            Position {
                symbol: "AVAX".into(),
                side: PositionSide::Long,
                size: dec!(10),
                entry_price: dec!(30),
                leverage: 5,
                unrealized_pnl: dec!(0),
                liquidation_price: None,
            },
        ];
        let outcome = eval.evaluate(
            open_decision("BTC", dec!(500), 5, 80),
            &params(),
            &guards(),
            &acct,
            Utc::now(),
            None,
        );
        assert!(matches!(
            outcome,
            RiskOutcome::Reject(_, RiskRejectReason::TooManyPositions)
        ));
    }

    #[test]
    fn rejects_adding_to_an_already_held_symbol_at_the_cap() {
        let eval = RiskEvaluator::new();
        let mut acct = account();
        acct.positions = vec![
            Position {
                symbol: "BTC".into(),
                side: PositionSide::Long,
                size: dec!(1),
                entry_price: dec!(100),
                leverage: 5,
                unrealized_pnl: dec!(0),
                liquidation_price: None,
            },
            Position {
                symbol: "SOL".into(),
                side: PositionSide::Long,
                size: dec!(10),
                entry_price: dec!(100),
                leverage: 5,
                unrealized_pnl: dec!(0),
                liquidation_price: None,
            },
            Position {
                symbol: "AVAX".into(),
                side: PositionSide::Long,
                size: dec!(10),
                entry_price: dec!(30),
                leverage: 5,
                unrealized_pnl: dec!(0),
                liquidation_price: None,
            },
        ];
        let outcome = eval.evaluate(
            open_decision("BTC", dec!(500), 5, 80),
            &params(),
            &guards(),
            &acct,
            Utc::now(),
            None,
        );
        assert!(matches!(
            outcome,
            RiskOutcome::Reject(_, RiskRejectReason::TooManyPositions)
        ));
    }

    #[test]
    fn rejects_insufficient_equity() {
        let eval = RiskEvaluator::new();
        let mut acct = account();
        acct.account_value_usd = dec!(100);
        let outcome = eval.evaluate(
            open_decision("BTC", dec!(500), 5, 80),
            &params(),
            &guards(),
            &acct,
            Utc::now(),
            None,
        );
        assert!(matches!(
            outcome,
            RiskOutcome::Reject(_, RiskRejectReason::InsufficientEquity)
        ));
    }

    #[test]
    fn rejects_while_symbol_cooling_down() {
        let eval = RiskEvaluator::new();
        let now = Utc::now();
        let outcome = eval.evaluate(
            open_decision("BTC", dec!(500), 5, 80),
            &params(),
            &guards(),
            &account(),
            now,
            Some(now + chrono::Duration::seconds(60)),
        );
        assert!(matches!(
            outcome,
            RiskOutcome::Reject(_, RiskRejectReason::Cooldown)
        ));
    }

    #[test]
    fn hold_and_close_skip_size_and_rr_rules() {
        let eval = RiskEvaluator::new();
        let decision = Decision {
            symbol: "BTC".into(),
            action: DecisionAction::Hold,
            confidence: 80,
            leverage: None,
            position_size_usd: None,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            risk_usd: None,
            rationale: None,
        };
        let outcome = eval.evaluate(decision, &params(), &guards(), &account(), Utc::now(), None);
        assert!(matches!(outcome, RiskOutcome::Accept(_)));
    }
}
