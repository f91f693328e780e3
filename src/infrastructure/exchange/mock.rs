use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::errors::ExchangeError;
use crate::domain::ports::{Deadline, ExchangeProvider};
use crate::domain::types::{
    AccountState, Order, OrderLegStatus, OrderResponse, OrderStatus, Position, PositionSide,
};

/// In-memory [`ExchangeProvider`] used for tests and local development. Fills every order
/// immediately at its limit price; tracks positions so `get_positions`/`close_position` reflect
/// prior fills within the same process.
pub struct MockExchangeProvider {
    account_value: Decimal,
    positions: Mutex<HashMap<String, Position>>,
    asset_indices: HashMap<String, u32>,
    next_order_id: Mutex<u64>,
}

impl MockExchangeProvider {
    pub fn new(account_value: Decimal, symbols: &[&str]) -> Self {
        let asset_indices = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i as u32))
            .collect();
        Self {
            account_value,
            positions: Mutex::new(HashMap::new()),
            asset_indices,
            next_order_id: Mutex::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        let mut guard = self.next_order_id.lock().expect("mock exchange mutex poisoned");
        let id = *guard;
        *guard += 1;
        id
    }
}

#[async_trait]
impl ExchangeProvider for MockExchangeProvider {
    async fn place_order(&self, order: Order, _deadline: Deadline) -> Result<OrderResponse, ExchangeError> {
        let order_id = self.next_id();
        if !order.reduce_only {
            let symbol = self
                .asset_indices
                .iter()
                .find(|(_, idx)| **idx == order.asset_index)
                .map(|(symbol, _)| symbol.clone())
                .ok_or_else(|| ExchangeError::UnknownSymbol(order.asset_index.to_string()))?;

            let mut positions = self.positions.lock().expect("mock exchange mutex poisoned");
            positions.insert(
                symbol.clone(),
                Position {
                    symbol,
                    side: if order.is_buy { PositionSide::Long } else { PositionSide::Short },
                    size: order.size,
                    entry_price: order.limit_price,
                    leverage: 1,
                    unrealized_pnl: Decimal::ZERO,
                    liquidation_price: None,
                },
            );
        }

        Ok(OrderResponse {
            statuses: vec![OrderLegStatus::Filled {
                avg_price: order.limit_price,
                total_size: order.size,
                order_id,
            }],
        })
    }

    async fn cancel_order(&self, _asset_index: u32, _order_id: u64, _deadline: Deadline) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn get_open_orders(&self, _deadline: Deadline) -> Result<Vec<OrderStatus>, ExchangeError> {
        Ok(vec![])
    }

    async fn get_positions(&self, _deadline: Deadline) -> Result<Vec<Position>, ExchangeError> {
        Ok(self.positions.lock().expect("mock exchange mutex poisoned").values().cloned().collect())
    }

    async fn get_account_state(&self, _deadline: Deadline) -> Result<AccountState, ExchangeError> {
        let positions: Vec<Position> = self.positions.lock().expect("mock exchange mutex poisoned").values().cloned().collect();
        let margin_used: Decimal = positions.iter().map(|p| p.size.abs() * p.entry_price / Decimal::from(p.leverage.max(1))).sum();
        Ok(AccountState {
            account_value_usd: self.account_value,
            total_margin_used_usd: margin_used,
            available_balance_usd: self.account_value - margin_used,
            positions,
        })
    }

    async fn get_account_value(&self, _deadline: Deadline) -> Result<Decimal, ExchangeError> {
        Ok(self.account_value)
    }

    async fn close_position(&self, symbol: &str, _deadline: Deadline) -> Result<OrderResponse, ExchangeError> {
        let mut positions = self.positions.lock().expect("mock exchange mutex poisoned");
        let position = positions
            .remove(symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;
        Ok(OrderResponse {
            statuses: vec![OrderLegStatus::Filled {
                avg_price: position.entry_price,
                total_size: position.size,
                order_id: self.next_id(),
            }],
        })
    }

    async fn update_leverage(&self, _asset_index: u32, _is_cross: bool, _leverage: u32, _deadline: Deadline) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn asset_index(&self, symbol: &str) -> Result<u32, ExchangeError> {
        self.asset_indices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TimeInForce;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn place_order_then_close_round_trips() {
        let exchange = MockExchangeProvider::new(dec!(10000), &["BTC"]);
        let asset_index = exchange.asset_index("BTC").await.unwrap();
        let order = Order {
            asset_index,
            is_buy: true,
            limit_price: dec!(100),
            size: dec!(1),
            reduce_only: false,
            time_in_force: TimeInForce::Ioc,
            cloid: None,
            trigger_price: None,
        };

        exchange.place_order(order, std::time::Duration::from_secs(1)).await.unwrap();
        let positions = exchange.get_positions(std::time::Duration::from_secs(1)).await.unwrap();
        assert_eq!(positions.len(), 1);

        exchange.close_position("BTC", std::time::Duration::from_secs(1)).await.unwrap();
        let positions = exchange.get_positions(std::time::Duration::from_secs(1)).await.unwrap();
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn closing_unknown_symbol_errors() {
        let exchange = MockExchangeProvider::new(dec!(10000), &["BTC"]);
        let result = exchange.close_position("ETH", std::time::Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
