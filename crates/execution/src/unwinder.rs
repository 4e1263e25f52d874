//! Unwinder: the two-phase ladder-then-market sell algorithm the executor
//! invokes whenever a filled leg cannot be hedged.
//!
//! Phase 1 walks a limit-price ladder down from the original buy price,
//! one step at a time, collecting whatever partial fills arrive. Phase 2
//! falls back to an aggressive market order for anything still open.
//! Market orders on thin books routinely leak five or more cents of
//! slippage; starting one cent below the entry price and working down
//! usually clears full size for a fraction of that cost.

use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::planner;
use crate::types::{IntervalMapping, LegExecution, OrderParams, UnwindRecord, UnwindResult};
use crate::venue::VenueClients;

/// Runs the ladder-then-market unwind for one already-filled leg.
///
/// Never returns `result.success = true` with a nonzero remaining
/// quantity — the pessimistic loss accounting in [`synthesize`] depends
/// on that invariant holding.
pub async fn unwind(
    leg: &LegExecution,
    mapping: &IntervalMapping,
    clients: &VenueClients,
    config: &ExecutionConfig,
    reason: impl Into<String>,
) -> UnwindRecord {
    let reason = reason.into();
    let start_ts = Utc::now();
    let buy_price = leg.params.price;
    let filled_qty = leg
        .result
        .as_ref()
        .map_or(Decimal::ZERO, |r| r.fill_qty);

    warn!(
        venue = %leg.leg.venue,
        side = %leg.leg.side,
        buy_price = %buy_price,
        filled_qty = %filled_qty,
        reason = %reason,
        "starting unwind"
    );

    let mut remaining_qty = filled_qty;
    let mut total_filled = Decimal::ZERO;
    let mut total_cost = Decimal::ZERO;
    let mut submitted_params = Vec::new();

    let deadline = Instant::now() + Duration::from_millis(config.unwind_max_total_time_ms);
    let step_size = config.unwind_ladder_step_size();

    for step in 0..config.unwind_ladder_steps {
        if remaining_qty <= Decimal::ZERO || Instant::now() >= deadline {
            break;
        }
        let ladder_price = buy_price - step_size * Decimal::from(step + 1);
        let Ok(params) = planner::plan_ladder_step(&leg.leg, mapping, ladder_price, remaining_qty)
        else {
            warn!("unwind ladder step aborted: mapping missing market id");
            break;
        };
        submitted_params.push(params.clone());

        let client = clients.get(params.venue);
        let step_timeout = Duration::from_millis(config.unwind_ladder_step_timeout_ms);
        let result = tokio::time::timeout(step_timeout, client.place_order(&params)).await;

        match result {
            Ok(Ok(order_result)) if order_result.has_fill() => {
                total_filled += order_result.fill_qty;
                total_cost += order_result.fill_qty * order_result.fill_price;
                remaining_qty = (remaining_qty - order_result.fill_qty).max(Decimal::ZERO);
                info!(
                    step,
                    ladder_price = %ladder_price,
                    fill_qty = %order_result.fill_qty,
                    remaining_qty = %remaining_qty,
                    "unwind ladder step filled"
                );
            }
            Ok(Ok(_)) => {
                info!(step, ladder_price = %ladder_price, "unwind ladder step had no fill");
            }
            Ok(Err(err)) => {
                warn!(step, error = %err, "unwind ladder step rejected");
            }
            Err(_) => {
                warn!(step, "unwind ladder step timed out");
            }
        }
    }

    if remaining_qty > Decimal::ZERO {
        total_cost = market_fallback(
            leg,
            mapping,
            clients,
            remaining_qty,
            &mut total_filled,
            &mut remaining_qty,
            total_cost,
            &mut submitted_params,
        )
        .await;
    }

    synthesize(leg, buy_price, total_filled, total_cost, remaining_qty, start_ts, reason, submitted_params)
}

/// Phase 2: up to two market-order retries for whatever the ladder could
/// not close, 100ms apart.
#[allow(clippy::too_many_arguments)]
async fn market_fallback(
    leg: &LegExecution,
    mapping: &IntervalMapping,
    clients: &VenueClients,
    mut qty_to_fill: Decimal,
    total_filled: &mut Decimal,
    remaining_qty: &mut Decimal,
    mut total_cost: Decimal,
    submitted_params: &mut Vec<OrderParams>,
) -> Decimal {
    const MAX_RETRIES: u32 = 2;
    const RETRY_DELAY: Duration = Duration::from_millis(100);

    for attempt in 0..=MAX_RETRIES {
        if qty_to_fill <= Decimal::ZERO {
            break;
        }
        let Ok(params) = planner::plan_unwind_market(&leg.leg, mapping, qty_to_fill) else {
            warn!("unwind market fallback aborted: mapping missing market id");
            break;
        };
        submitted_params.push(params.clone());

        let client = clients.get(params.venue);
        match client.place_order(&params).await {
            Ok(order_result) if order_result.has_fill() => {
                *total_filled += order_result.fill_qty;
                total_cost += order_result.fill_qty * order_result.fill_price;
                *remaining_qty = (*remaining_qty - order_result.fill_qty).max(Decimal::ZERO);
                qty_to_fill = *remaining_qty;
                info!(
                    attempt,
                    fill_qty = %order_result.fill_qty,
                    remaining_qty = %remaining_qty,
                    "unwind market fallback filled"
                );
            }
            Ok(_) => {
                warn!(attempt, "unwind market fallback had no fill");
            }
            Err(err) => {
                warn!(attempt, error = %err, "unwind market fallback rejected");
            }
        }

        if attempt < MAX_RETRIES && qty_to_fill > Decimal::ZERO {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    total_cost
}

#[allow(clippy::too_many_arguments)]
fn synthesize(
    leg: &LegExecution,
    buy_price: Decimal,
    total_filled: Decimal,
    total_cost: Decimal,
    remaining_qty: Decimal,
    start_ts: chrono::DateTime<Utc>,
    reason: String,
    submitted_params: Vec<OrderParams>,
) -> UnwindRecord {
    let vwap = if total_filled > Decimal::ZERO {
        total_cost / total_filled
    } else {
        Decimal::ZERO
    };
    let loss_on_filled = (buy_price - vwap).max(Decimal::ZERO) * total_filled;
    let loss_on_unfilled = buy_price * remaining_qty;
    let realized_loss = loss_on_filled + loss_on_unfilled;
    let success = remaining_qty <= Decimal::ZERO;

    if success {
        info!(
            venue = %leg.leg.venue,
            filled_qty = %total_filled,
            vwap = %vwap,
            realized_loss = %realized_loss,
            "unwind succeeded"
        );
    } else {
        warn!(
            venue = %leg.leg.venue,
            remaining_qty = %remaining_qty,
            realized_loss = %realized_loss,
            "unwind exhausted ladder and market fallback with exposure remaining"
        );
    }

    UnwindRecord {
        leg_to_unwind: leg.clone(),
        unwind_params: submitted_params,
        result: Some(UnwindResult {
            success,
            filled_qty: total_filled,
            vwap,
            remaining_qty,
        }),
        start_ts,
        end_ts: Some(Utc::now()),
        realized_loss,
        reason,
    }
}
