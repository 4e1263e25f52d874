//! Risk guards: pure predicates over execution state, position tracker and
//! an [`Opportunity`], run before any order is submitted.
//!
//! Every function here is a pure read — nothing in this module mutates
//! [`ExecutionState`] or [`PositionTracker`]; it only inspects them. The
//! notional-capping helper lives here too since it is guard-shaped (it
//! rejects rather than silently clamping past the point of tradeability).

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::config::ExecutionConfig;
use crate::error::GuardError;
use crate::position::PositionTracker;
use crate::state::ExecutionState;
use crate::types::{IntervalMapping, Opportunity, Venue};

/// Polymarket's price-dependent minimum tradeable size: `max(5, ceil(1 /
/// price))`. At very low prices, a handful of contracts can be worth
/// fractions of a cent, so the venue enforces a floor that rises as price
/// falls.
#[must_use]
pub fn polymarket_min_qty(price: Decimal) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::new(5, 0);
    }
    let inverse = Decimal::ONE / price;
    let ceiling = inverse.ceil();
    ceiling.max(Decimal::new(5, 0))
}

/// Reduces `opportunity.qty` so that `qty * cost_per_contract` fits in the
/// remaining notional headroom, then rejects if what's left can't clear
/// Polymarket's minimum tradeable size.
///
/// # Errors
/// Returns [`GuardError::InsufficientNotionalHeadroom`] when the
/// notional-capped quantity is below the venue's price-dependent minimum.
pub fn cap_qty_to_notional(
    opportunity: &Opportunity,
    max_notional: Decimal,
    current_notional: Decimal,
) -> Result<Decimal, GuardError> {
    let cost_per_contract = opportunity.cost / opportunity.qty.max(Decimal::ONE);
    let headroom = (max_notional - current_notional).max(Decimal::ZERO);
    let headroom_qty = if cost_per_contract > Decimal::ZERO {
        (headroom / cost_per_contract).trunc()
    } else {
        Decimal::ZERO
    };
    let capped = opportunity.qty.min(headroom_qty);

    let poly_price = opportunity
        .leg_for_venue(Venue::Polymarket)
        .map_or(Decimal::ONE, |leg| leg.price);
    let minimum = polymarket_min_qty(poly_price);

    if capped < minimum {
        return Err(GuardError::InsufficientNotionalHeadroom {
            headroom: headroom.to_string(),
            minimum: minimum.to_string(),
        });
    }
    Ok(capped)
}

/// Everything a guard pass needs to evaluate one candidate execution.
pub struct GuardInputs<'a> {
    pub opportunity: &'a Opportunity,
    pub capped_qty: Decimal,
    pub mapping: &'a IntervalMapping,
    pub config: &'a ExecutionConfig,
    pub state: &'a ExecutionState,
    pub positions: &'a PositionTracker,
    pub open_orders_per_venue: &'a HashMap<Venue, u32>,
}

/// Position-balance tolerance: rounding across two venues' decimal
/// representations can leave a few-thousandths imbalance even on a
/// perfectly hedged book.
const IMBALANCE_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

/// Runs every risk guard in order, short-circuiting on the first failure.
///
/// # Errors
/// Returns the first [`GuardError`] encountered.
pub fn run_guards(inputs: &GuardInputs<'_>) -> Result<(), GuardError> {
    mapping_guard(inputs.opportunity, inputs.mapping)?;
    edge_guard(inputs.opportunity, inputs.config)?;
    open_orders_guard(inputs)?;
    position_balance_guard(inputs.positions)?;
    liquidation_guard(inputs.state)?;
    Ok(())
}

fn mapping_guard(opportunity: &Opportunity, mapping: &IntervalMapping) -> Result<(), GuardError> {
    if mapping.interval_key.start_ts != opportunity.interval_key.start_ts || !mapping.is_valid() {
        return Err(GuardError::MappingMismatch {
            interval_start: opportunity.interval_key.start_ts,
        });
    }
    Ok(())
}

fn edge_guard(opportunity: &Opportunity, config: &ExecutionConfig) -> Result<(), GuardError> {
    let required = config.min_edge_net();
    if opportunity.edge_net < required {
        return Err(GuardError::EdgeTooThin {
            actual: opportunity.edge_net.to_string(),
            required: required.to_string(),
        });
    }
    Ok(())
}

fn open_orders_guard(inputs: &GuardInputs<'_>) -> Result<(), GuardError> {
    let limit = inputs.config.max_open_orders_per_venue;
    for leg in &inputs.opportunity.legs {
        let count = inputs
            .open_orders_per_venue
            .get(&leg.venue)
            .copied()
            .unwrap_or(0);
        if count >= limit {
            return Err(GuardError::TooManyOpenOrders {
                venue: leg.venue,
                count,
                limit,
            });
        }
    }
    Ok(())
}

fn position_balance_guard(positions: &PositionTracker) -> Result<(), GuardError> {
    let imbalance = positions.imbalance();
    if imbalance > IMBALANCE_EPSILON {
        return Err(GuardError::PositionImbalance {
            total_yes: positions.total_yes().to_string(),
            total_no: positions.total_no().to_string(),
        });
    }
    Ok(())
}

/// Refuses new executions while the forced liquidator is cleaning up a
/// directional imbalance — the liquidator owns the book until it finishes,
/// per the same precedence the pre-close and volatility-exit paths observe.
fn liquidation_guard(state: &ExecutionState) -> Result<(), GuardError> {
    if state.is_liquidation_in_progress() {
        return Err(GuardError::LiquidationInProgress);
    }
    Ok(())
}
