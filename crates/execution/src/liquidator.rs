//! Forced liquidator: once the kill switch trips, sells down whatever
//! directional (unhedged) excess remains on the dominant side, preferring
//! Polymarket first since its on-chain settlement is slower to reverse.
//!
//! Runs independently of the executor's per-trade unwind — this is a
//! standing cleanup pass over the whole book, not a single leg.

use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::error::LiquidatorError;
use crate::planner;
use crate::position::PositionTracker;
use crate::state::ExecutionState;
use crate::types::{IntervalMapping, Side, Venue};
use crate::venue::VenueClients;

/// One venue's contribution to a liquidation target.
#[derive(Debug, Clone, Copy)]
struct VenueShare {
    venue: Venue,
    qty: Decimal,
}

/// Outcome of one liquidation pass.
#[derive(Debug, Clone)]
pub struct LiquidationOutcome {
    pub dominant_side: Side,
    pub target_qty: Decimal,
    pub sold_qty: Decimal,
    pub attempts: u32,
}

/// Sells down the unhedged excess on the book's dominant side.
///
/// # Errors
/// Returns [`LiquidatorError::OvershootCapExceeded`] if total sells would
/// exceed `1.1 * target_qty`, or [`LiquidatorError::RetriesExhausted`] if
/// the configured retry budget runs out with quantity still unsold.
pub async fn liquidate(
    positions: &PositionTracker,
    mapping: &IntervalMapping,
    clients: &VenueClients,
    config: &ExecutionConfig,
    state: &ExecutionState,
) -> Result<LiquidationOutcome, LiquidatorError> {
    state.start_liquidation();
    let outcome = run(positions, mapping, clients, config).await;
    state.finish_liquidation();
    outcome
}

async fn run(
    positions: &PositionTracker,
    mapping: &IntervalMapping,
    clients: &VenueClients,
    config: &ExecutionConfig,
) -> Result<LiquidationOutcome, LiquidatorError> {
    let total_yes = positions.total_yes();
    let total_no = positions.total_no();
    let (dominant_side, target_qty) = if total_yes > total_no {
        (Side::Yes, total_yes - total_no)
    } else {
        (Side::No, total_no - total_yes)
    };

    if target_qty <= Decimal::ZERO {
        info!("liquidator found no directional excess, nothing to sell");
        return Ok(LiquidationOutcome {
            dominant_side,
            target_qty: Decimal::ZERO,
            sold_qty: Decimal::ZERO,
            attempts: 0,
        });
    }

    let overshoot_cap = target_qty * config.liquidator_overshoot_cap_pct();
    let mut sold_qty = Decimal::ZERO;
    let mut attempt = 0u32;

    warn!(
        side = %dominant_side,
        target_qty = %target_qty,
        "starting forced liquidation"
    );

    while remaining_excess(positions, dominant_side) > Decimal::ZERO
        && attempt < config.liquidator_max_retries
    {
        attempt += 1;
        // Re-derived from the live position tracker on every retry, not from
        // the local `sold_qty` counter, so a sell that silently failed to
        // register server-side is caught on the next pass rather than
        // assumed to have landed.
        let remaining = remaining_excess(positions, dominant_side);
        let shares = apportion(positions, dominant_side, remaining, clients).await;

        if shares.is_empty() {
            warn!(attempt, "no venue reports a sellable position on the dominant side");
        }

        for share in shares {
            if remaining_excess(positions, dominant_side) <= Decimal::ZERO {
                break;
            }
            let qty = share.qty.min(remaining);
            if qty <= Decimal::ZERO {
                continue;
            }
            let price = clamp_sell_price(share.venue, mapping, dominant_side, config);
            let Ok(params) = planner::plan_cleanup_sell(share.venue, dominant_side, mapping, price, qty) else {
                warn!(venue = %share.venue, "liquidation sell aborted: mapping missing market id");
                continue;
            };

            let client = clients.get(share.venue);
            match client.place_order(&params).await {
                Ok(result) if result.has_fill() => {
                    let filled = fill_qty_for(client, &result, share.venue).await;
                    sold_qty += filled;
                    positions.record_fill(
                        share.venue,
                        dominant_side,
                        crate::types::Action::Sell,
                        filled,
                        result.fill_price,
                        params.market_id.clone(),
                        mapping.interval_key,
                    );
                    info!(
                        venue = %share.venue,
                        attempt,
                        filled_qty = %filled,
                        sold_qty = %sold_qty,
                        "liquidation sell filled"
                    );
                }
                Ok(_) => {
                    warn!(venue = %share.venue, attempt, "liquidation sell had no fill");
                }
                Err(err) => {
                    warn!(venue = %share.venue, attempt, error = %err, "liquidation sell rejected");
                }
            }

            if sold_qty > overshoot_cap {
                return Err(LiquidatorError::OvershootCapExceeded {
                    sold: sold_qty.to_string(),
                    target: target_qty.to_string(),
                });
            }
        }

        if remaining_excess(positions, dominant_side) > Decimal::ZERO {
            let delay_ms = (config.liquidator_retry_base_delay_ms * u64::from(attempt))
                .min(config.liquidator_retry_max_delay_ms);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    if remaining_excess(positions, dominant_side) > Decimal::ZERO {
        return Err(LiquidatorError::RetriesExhausted {
            venue: Venue::Polymarket,
            side: dominant_side,
            remaining: remaining_excess(positions, dominant_side).to_string(),
        });
    }

    Ok(LiquidationOutcome {
        dominant_side,
        target_qty,
        sold_qty,
        attempts: attempt,
    })
}

/// Unhedged excess still outstanding on `dominant_side`, re-derived from the
/// live position tracker rather than a running counter.
fn remaining_excess(positions: &PositionTracker, dominant_side: Side) -> Decimal {
    let total_yes = positions.total_yes();
    let total_no = positions.total_no();
    match dominant_side {
        Side::Yes => (total_yes - total_no).max(Decimal::ZERO),
        Side::No => (total_no - total_yes).max(Decimal::ZERO),
    }
}

/// Kalshi IOC sells land near-instantly but the fills feed lags the order
/// response by roughly 200ms and is authoritative over it.
async fn fill_qty_for(
    client: &std::sync::Arc<dyn crate::venue::VenueClient>,
    result: &crate::types::OrderResult,
    venue: Venue,
) -> Decimal {
    if venue != Venue::Kalshi {
        return result.fill_qty;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    match result.order_id.as_deref() {
        Some(order_id) => match client.get_fills(order_id).await {
            Ok(fills) if !fills.is_empty() => fills.iter().map(|f| f.qty).sum(),
            _ => result.fill_qty,
        },
        None => result.fill_qty,
    }
}

/// Splits `remaining` across venues currently holding the dominant side,
/// Polymarket first, each capped at 95% of its on-chain/live balance.
async fn apportion(
    positions: &PositionTracker,
    side: Side,
    remaining: Decimal,
    clients: &VenueClients,
) -> Vec<VenueShare> {
    const POLYMARKET_BALANCE_CAP_PCT: Decimal = Decimal::from_parts(95, 0, 0, false, 2);

    let mut shares = Vec::new();
    let mut still_needed = remaining;

    for venue in [Venue::Polymarket, Venue::Kalshi] {
        if still_needed <= Decimal::ZERO {
            break;
        }
        let held = positions.quantity(venue, side);
        if held <= Decimal::ZERO {
            continue;
        }

        let capped_held = if venue == Venue::Polymarket {
            let market_id = positions.market_id(venue, side);
            match market_id {
                Some(token_id) => {
                    let balance = clients
                        .get(venue)
                        .get_conditional_token_balance(&token_id)
                        .await
                        .unwrap_or(held);
                    held.min(balance * POLYMARKET_BALANCE_CAP_PCT)
                }
                None => held,
            }
        } else {
            held
        };

        let take = capped_held.min(still_needed);
        if take > Decimal::ZERO {
            shares.push(VenueShare { venue, qty: take });
            still_needed -= take;
        }
    }

    shares
}

fn clamp_sell_price(venue: Venue, _mapping: &IntervalMapping, _side: Side, _config: &ExecutionConfig) -> Decimal {
    match venue {
        Venue::Kalshi => Decimal::ZERO,
        Venue::Polymarket => Decimal::new(1, 2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
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

    use chrono::Utc;

    #[tokio::test]
    async fn no_excess_position_returns_zero_target() {
        let positions = PositionTracker::new();
        positions.record_fill(Venue::Polymarket, Side::Yes, Action::Buy, dec!(5), dec!(0.42), "up", IntervalKey::starting_at(0));
        positions.record_fill(Venue::Kalshi, Side::No, Action::Buy, dec!(5), dec!(0.56), "KXBTC-TEST", IntervalKey::starting_at(0));

        let poly = ScriptedClient::new(Venue::Polymarket, dec!(1000), vec![]);
        let kalshi = ScriptedClient::new(Venue::Kalshi, dec!(1000), vec![]);
        let clients = VenueClients::new(Arc::new(poly), Arc::new(kalshi));
        let config = ExecutionConfig::default();
        let state = ExecutionState::new();

        let outcome = liquidate(&positions, &mapping(), &clients, &config, &state).await.unwrap();
        assert_eq!(outcome.target_qty, Decimal::ZERO);
        assert!(!state.is_liquidation_in_progress());
    }

    #[tokio::test]
    async fn liquidates_excess_preferring_polymarket_first() {
        let positions = PositionTracker::new();
        positions.record_fill(Venue::Polymarket, Side::Yes, Action::Buy, dec!(10), dec!(0.42), "up", IntervalKey::starting_at(0));
        positions.record_fill(Venue::Kalshi, Side::No, Action::Buy, dec!(5), dec!(0.56), "KXBTC-TEST", IntervalKey::starting_at(0));

        let poly = ScriptedClient::new(Venue::Polymarket, dec!(1000), vec![filled(Venue::Polymarket, dec!(5), dec!(0.41))]);
        let kalshi = ScriptedClient::new(Venue::Kalshi, dec!(1000), vec![]);
        let clients = VenueClients::new(Arc::new(poly), Arc::new(kalshi));
        let config = ExecutionConfig::default();
        let state = ExecutionState::new();

        let outcome = liquidate(&positions, &mapping(), &clients, &config, &state).await.unwrap();
        assert_eq!(outcome.dominant_side, Side::Yes);
        assert_eq!(outcome.target_qty, dec!(5));
        assert_eq!(outcome.sold_qty, dec!(5));
        assert_eq!(positions.quantity(Venue::Polymarket, Side::Yes), dec!(5));
    }

    #[tokio::test]
    async fn exhausts_retries_when_nothing_fills() {
        let positions = PositionTracker::new();
        positions.record_fill(Venue::Polymarket, Side::Yes, Action::Buy, dec!(10), dec!(0.42), "up", IntervalKey::starting_at(0));

        let poly = ScriptedClient::new(Venue::Polymarket, dec!(1000), vec![]);
        let kalshi = ScriptedClient::new(Venue::Kalshi, dec!(1000), vec![]);
        let clients = VenueClients::new(Arc::new(poly), Arc::new(kalshi));
        let mut config = ExecutionConfig::default();
        config.liquidator_max_retries = 2;
        config.liquidator_retry_base_delay_ms = 1;
        config.liquidator_retry_max_delay_ms = 2;
        let state = ExecutionState::new();

        let result = liquidate(&positions, &mapping(), &clients, &config, &state).await;
        assert!(matches!(result, Err(LiquidatorError::RetriesExhausted { .. })));
        assert!(!state.is_liquidation_in_progress());
    }

    #[tokio::test]
    async fn polymarket_share_capped_at_ninety_five_percent_of_balance() {
        let positions = PositionTracker::new();
        positions.record_fill(Venue::Polymarket, Side::Yes, Action::Buy, dec!(10), dec!(0.42), "up", IntervalKey::starting_at(0));

        let poly = ScriptedClient::new(Venue::Polymarket, dec!(4), vec![]);
        let kalshi = ScriptedClient::new(Venue::Kalshi, dec!(1000), vec![]);
        let clients = VenueClients::new(Arc::new(poly), Arc::new(kalshi));

        let shares = apportion(&positions, Side::Yes, dec!(10), &clients).await;
        assert_eq!(shares.len(), 1);
        // balance 4 * 0.95 = 3.80
        assert_eq!(shares[0].qty, dec!(3.80));
    }
}
