//! Pre-close unwind: a timer fires shortly before each interval's rollover
//! and sells down most of the standing position so it doesn't ride into
//! settlement, retaining a small residual for fee/slippage slack.
//!
//! Distinct from [`crate::liquidator`]: this runs on every interval close
//! regardless of kill-switch state, and only ever sells a fixed retained
//! fraction rather than chasing a directional-imbalance target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::planner;
use crate::position::PositionTracker;
use crate::state::ExecutionState;
use crate::types::{IntervalMapping, Side, Venue};
use crate::venue::VenueClients;

/// Tracks whether pre-close selling is currently active for the interval in
/// progress. Reset at rollover by the caller via [`PreCloseUnwind::reset`].
pub struct PreCloseUnwind {
    active: AtomicBool,
}

impl Default for PreCloseUnwind {
    fn default() -> Self {
        Self::new()
    }
}

impl PreCloseUnwind {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Clears the pre-close-active flag; called on interval rollover.
    pub fn reset(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Runs the pre-close sell-down. Defers entirely if a liquidation is in
    /// progress; waits up to 5s for the busy lock to free up before giving
    /// up and deferring to the next tick.
    pub async fn run(
        &self,
        positions: &PositionTracker,
        mapping: &IntervalMapping,
        clients: &VenueClients,
        config: &ExecutionConfig,
        state: &ExecutionState,
    ) {
        if state.is_liquidation_in_progress() {
            info!("pre-close unwind deferred: liquidation in progress");
            return;
        }

        self.active.store(true, Ordering::SeqCst);

        const BUSY_WAIT_STEP: Duration = Duration::from_millis(100);
        const BUSY_WAIT_MAX: Duration = Duration::from_secs(5);
        let mut waited = Duration::ZERO;
        while state.is_busy() && waited < BUSY_WAIT_MAX {
            tokio::time::sleep(BUSY_WAIT_STEP).await;
            waited += BUSY_WAIT_STEP;
        }
        if state.is_busy() {
            warn!("pre-close unwind deferred: execution still busy after 5s wait");
            return;
        }

        let retain_pct = config.pre_close_retain_pct();
        let open_positions = positions.open_positions();
        if open_positions.is_empty() {
            info!("pre-close unwind: no open positions to sell");
            return;
        }

        let sells: Vec<_> = open_positions
            .into_iter()
            .map(|(venue, side, qty)| {
                let sell_qty = (qty * (Decimal::ONE - retain_pct)).floor();
                (venue, side, sell_qty)
            })
            .filter(|(_, _, qty)| *qty > Decimal::ZERO)
            .collect();

        let results = futures_join_all(sells.iter().map(|&(venue, side, qty)| {
            sell_one(venue, side, qty, positions, mapping, clients)
        }))
        .await;

        for ((venue, side, qty), succeeded) in sells.iter().zip(results) {
            if succeeded {
                continue;
            }
            warn!(venue = %venue, side = %side, qty = %qty, "pre-close sell failed, retrying once after 2s");
            tokio::time::sleep(Duration::from_secs(2)).await;
            let retried = sell_one(*venue, *side, *qty, positions, mapping, clients).await;
            if !retried {
                warn!(venue = %venue, side = %side, qty = %qty, "pre-close sell retry also failed, leaving residual position");
            }
        }
    }
}

async fn sell_one(
    venue: Venue,
    side: Side,
    qty: Decimal,
    positions: &PositionTracker,
    mapping: &IntervalMapping,
    clients: &VenueClients,
) -> bool {
    const POLYMARKET_BALANCE_CAP_PCT: Decimal = Decimal::from_parts(95, 0, 0, false, 2);

    let qty = if venue == Venue::Polymarket {
        match positions.market_id(venue, side) {
            Some(token_id) => {
                let balance = clients
                    .get(venue)
                    .get_conditional_token_balance(&token_id)
                    .await
                    .unwrap_or(qty);
                qty.min(balance * POLYMARKET_BALANCE_CAP_PCT)
            }
            None => qty,
        }
    } else {
        qty
    };

    if qty <= Decimal::ZERO {
        return true;
    }

    let price = match venue {
        Venue::Kalshi => Decimal::ZERO,
        Venue::Polymarket => Decimal::new(1, 2),
    };
    let Ok(params) = planner::plan_cleanup_sell(venue, side, mapping, price, qty) else {
        warn!(venue = %venue, "pre-close sell aborted: mapping missing market id");
        return false;
    };

    match clients.get(venue).place_order(&params).await {
        Ok(result) if result.has_fill() => {
            positions.record_fill(
                venue,
                side,
                crate::types::Action::Sell,
                result.fill_qty,
                result.fill_price,
                params.market_id.clone(),
                mapping.interval_key,
            );
            info!(venue = %venue, side = %side, filled_qty = %result.fill_qty, "pre-close sell filled");
            true
        }
        Ok(_) => false,
        Err(err) => {
            warn!(venue = %venue, error = %err, "pre-close sell rejected");
            false
        }
    }
}

/// Small local stand-in for `futures::future::join_all` so this crate
/// doesn't need to pull in the `futures` crate for one call site.
async fn futures_join_all<F, Fut>(futures: impl IntoIterator<Item = Fut>) -> Vec<bool>
where
    Fut: std::future::Future<Output = bool>,
{
    let mut results = Vec::new();
    for fut in futures {
        results.push(fut.await);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use crate::error::ExecutionError;
    use crate::types::{Action, IntervalKey, KalshiMapping, OrderParams, OrderResult, OrderStatus, PolymarketMapping};
    use crate::venue::{Fill, NormalizedQuote, OrderStatusSnapshot, PositionsSnapshot, VenueClient};

    struct ScriptedClient {
        venue: Venue,
        balance: Decimal,
        responses: Mutex<VecDeque<OrderResult>>,
    }

    impl ScriptedClient {
        fn new(venue: Venue, balance: Decimal, responses: Vec<OrderResult>) -> Self {
            Self {
                venue,
                balance,
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl VenueClient for ScriptedClient {
        fn venue(&self) -> Venue {
            self.venue
        }

        async fn place_order(&self, params: &OrderParams) -> Result<OrderResult, ExecutionError> {
            let mut queue = self.responses.lock();
            Ok(queue.pop_front().unwrap_or(OrderResult::rejected(params.venue, "no more scripted responses")))
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<bool, ExecutionError> {
            Ok(true)
        }

        async fn get_order_status(&self, _order_id: &str) -> Result<OrderStatusSnapshot, ExecutionError> {
            Ok(OrderStatusSnapshot {
                filled: false,
                fill_qty: None,
                fill_price: None,
                status: OrderStatus::Rejected,
            })
        }

        async fn get_conditional_token_balance(&self, _token_id: &str) -> Result<Decimal, ExecutionError> {
            Ok(self.balance)
        }

        async fn get_fills(&self, _order_id: &str) -> Result<Vec<Fill>, ExecutionError> {
            Ok(Vec::new())
        }

        async fn get_portfolio_positions(&self) -> Result<PositionsSnapshot, ExecutionError> {
            Ok(PositionsSnapshot::default())
        }

        async fn get_collateral_balance(&self) -> Result<Decimal, ExecutionError> {
            Ok(Decimal::ZERO)
        }

        fn get_quote(&self) -> Option<NormalizedQuote> {
            None
        }
    }

    fn filled(venue: Venue, qty: Decimal, price: Decimal) -> OrderResult {
        OrderResult {
            success: true,
            order_id: Some("order-1".into()),
            fill_qty: qty,
            fill_price: price,
            venue,
            status: OrderStatus::Filled,
            submitted_at: Utc::now(),
            filled_at: Some(Utc::now()),
            error: None,
        }
    }

    fn mapping() -> IntervalMapping {
        IntervalMapping {
            interval_key: IntervalKey::starting_at(0),
            polymarket: Some(PolymarketMapping {
                up_token_id: "up".into(),
                down_token_id: "down".into(),
            }),
            kalshi: Some(KalshiMapping {
                ticker: "KXBTC-TEST".into(),
            }),
        }
    }

    #[tokio::test]
    async fn sells_down_to_retained_fraction() {
        let positions = PositionTracker::new();
        positions.record_fill(Venue::Polymarket, Side::Yes, Action::Buy, dec!(10), dec!(0.42), "up", IntervalKey::starting_at(0));
        positions.record_fill(Venue::Kalshi, Side::No, Action::Buy, dec!(10), dec!(0.56), "KXBTC-TEST", IntervalKey::starting_at(0));

        let poly = ScriptedClient::new(Venue::Polymarket, dec!(1000), vec![filled(Venue::Polymarket, dec!(9), dec!(0.40))]);
        let kalshi = ScriptedClient::new(Venue::Kalshi, dec!(1000), vec![filled(Venue::Kalshi, dec!(9), dec!(0.55))]);
        let clients = VenueClients::new(Arc::new(poly), Arc::new(kalshi));
        let config = ExecutionConfig::default();
        let state = ExecutionState::new();

        let preclose = PreCloseUnwind::new();
        preclose.run(&positions, &mapping(), &clients, &config, &state).await;

        assert!(preclose.is_active());
        assert_eq!(positions.quantity(Venue::Polymarket, Side::Yes), dec!(1));
        assert_eq!(positions.quantity(Venue::Kalshi, Side::No), dec!(1));
        preclose.reset();
        assert!(!preclose.is_active());
    }

    #[tokio::test]
    async fn defers_when_liquidation_in_progress() {
        let positions = PositionTracker::new();
        positions.record_fill(Venue::Polymarket, Side::Yes, Action::Buy, dec!(100), dec!(0.42), "up", IntervalKey::starting_at(0));

        let poly = ScriptedClient::new(Venue::Polymarket, dec!(1000), vec![]);
        let kalshi = ScriptedClient::new(Venue::Kalshi, dec!(1000), vec![]);
        let clients = VenueClients::new(Arc::new(poly), Arc::new(kalshi));
        let config = ExecutionConfig::default();
        let state = ExecutionState::new();
        state.start_liquidation();

        let preclose = PreCloseUnwind::new();
        preclose.run(&positions, &mapping(), &clients, &config, &state).await;

        assert!(!preclose.is_active());
    }

    #[tokio::test]
    async fn no_open_positions_is_a_no_op() {
        let positions = PositionTracker::new();
        let poly = ScriptedClient::new(Venue::Polymarket, dec!(1000), vec![]);
        let kalshi = ScriptedClient::new(Venue::Kalshi, dec!(1000), vec![]);
        let clients = VenueClients::new(Arc::new(poly), Arc::new(kalshi));
        let config = ExecutionConfig::default();
        let state = ExecutionState::new();

        let preclose = PreCloseUnwind::new();
        preclose.run(&positions, &mapping(), &clients, &config, &state).await;
        assert!(preclose.is_active());
    }
}
