//! Order planner: maps an [`Opportunity`]/[`IntervalMapping`] pair into
//! concrete [`OrderParams`] for every leg the executor, unwinder and
//! liquidator need to submit.
//!
//! Pure module — no I/O, no shared state. The planner never branches on
//! venue beyond picking which field of the mapping to read; leg-ordering
//! policy (Polymarket always Leg A) is expressed by which function the
//! caller invokes, not by an if-tree inside one function.

use rand::Rng;
use rust_decimal::Decimal;

use crate::error::PlannerError;
use crate::types::{
    Action, ArbLeg, IntervalMapping, LegExecution, OrderParams, Side, TimeInForce, Venue,
};

/// The role a client-order-id's submission plays, encoded into the id
/// itself so logs and venue dashboards can tell at a glance which leg of
/// which phase an order belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRole {
    /// Leg A of a two-phase commit (always Polymarket).
    LegA,
    /// Leg B of a two-phase commit (always Kalshi).
    LegB,
    /// Any unwind, ladder step, or liquidation sell.
    Unwind,
}

impl OrderRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::LegA => "A",
            Self::LegB => "B",
            Self::Unwind => "U",
        }
    }
}

/// Builds `{venue}-{role}-{unix_ms}-{rand6}`. The random suffix is a
/// convenience against collisions, not a correctness mechanism — venues
/// are expected to reject on true duplicates.
#[must_use]
pub fn generate_client_order_id(venue: Venue, role: OrderRole) -> String {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let suffix: String = (0..6)
        .map(|_| {
            let n = rand::thread_rng().gen_range(0..36);
            std::char::from_digit(n, 36).unwrap_or('0')
        })
        .collect();
    format!("{}-{}-{}-{}", venue.as_str(), role.as_str(), now_ms, suffix)
}

/// Clamps a ladder-step price into the venue-legal range.
#[must_use]
pub fn clamp_ladder_price(price: Decimal) -> Decimal {
    price.clamp(Decimal::new(1, 2), Decimal::new(99, 2))
}

fn market_id_for(mapping: &IntervalMapping, venue: Venue, side: Side) -> Result<String, PlannerError> {
    mapping
        .market_id(venue, side)
        .ok_or(PlannerError::MissingMarketId { venue, side })
}

/// Plans Leg A: a Polymarket IOC buy for `leg` at `qty`.
///
/// # Errors
/// Returns [`PlannerError::MissingMarketId`] if the mapping has no
/// Polymarket entry for this side.
pub fn plan_leg_a(leg: &ArbLeg, mapping: &IntervalMapping, qty: Decimal) -> Result<OrderParams, PlannerError> {
    debug_assert_eq!(leg.venue, Venue::Polymarket, "Leg A is always Polymarket");
    let market_id = market_id_for(mapping, Venue::Polymarket, leg.side)?;
    Ok(OrderParams {
        venue: Venue::Polymarket,
        side: leg.side,
        action: Action::Buy,
        price: leg.price,
        qty,
        time_in_force: TimeInForce::Ioc,
        market_id,
        client_order_id: generate_client_order_id(Venue::Polymarket, OrderRole::LegA),
        reduce_only: false,
    })
}

/// Plans Leg B: a Kalshi FOK buy for `leg`, sized to the integer quantity
/// Leg A actually filled (`qty` is expected to already be floored by the
/// caller per the partial-fill-adequacy rule).
///
/// # Errors
/// Returns [`PlannerError::MissingMarketId`] if the mapping has no Kalshi
/// entry for this interval.
pub fn plan_leg_b(leg: &ArbLeg, mapping: &IntervalMapping, qty: Decimal) -> Result<OrderParams, PlannerError> {
    debug_assert_eq!(leg.venue, Venue::Kalshi, "Leg B is always Kalshi");
    let market_id = market_id_for(mapping, Venue::Kalshi, leg.side)?;
    Ok(OrderParams {
        venue: Venue::Kalshi,
        side: leg.side,
        action: Action::Buy,
        price: leg.price,
        qty,
        time_in_force: TimeInForce::Fok,
        market_id,
        client_order_id: generate_client_order_id(Venue::Kalshi, OrderRole::LegB),
        reduce_only: false,
    })
}

/// Plans one incremental ladder-sell step for an unwind, at `ladder_price`
/// for `remaining_qty`, selling the side/venue of the already-filled leg.
///
/// # Errors
/// Returns [`PlannerError::MissingMarketId`] if the mapping has no entry
/// for this leg's venue.
pub fn plan_ladder_step(
    filled_leg: &ArbLeg,
    mapping: &IntervalMapping,
    ladder_price: Decimal,
    remaining_qty: Decimal,
) -> Result<OrderParams, PlannerError> {
    let market_id = market_id_for(mapping, filled_leg.venue, filled_leg.side)?;
    let tif = match filled_leg.venue {
        Venue::Kalshi => TimeInForce::Ioc,
        Venue::Polymarket => TimeInForce::Fok,
    };
    Ok(OrderParams {
        venue: filled_leg.venue,
        side: filled_leg.side,
        action: Action::Sell,
        price: clamp_ladder_price(ladder_price),
        qty: remaining_qty,
        time_in_force: tif,
        market_id,
        client_order_id: generate_client_order_id(filled_leg.venue, OrderRole::Unwind),
        reduce_only: true,
    })
}

/// Plans the market-order fallback that closes out whatever quantity the
/// ladder couldn't. Price is the most aggressive legal price for the
/// venue: `0` for Kalshi (ignored), `0.01` for Polymarket (minimum).
///
/// # Errors
/// Returns [`PlannerError::MissingMarketId`] if the mapping has no entry
/// for this leg's venue.
pub fn plan_unwind_market(
    filled_leg: &ArbLeg,
    mapping: &IntervalMapping,
    remaining_qty: Decimal,
) -> Result<OrderParams, PlannerError> {
    let market_id = market_id_for(mapping, filled_leg.venue, filled_leg.side)?;
    let price = match filled_leg.venue {
        Venue::Kalshi => Decimal::ZERO,
        Venue::Polymarket => Decimal::new(1, 2),
    };
    Ok(OrderParams {
        venue: filled_leg.venue,
        side: filled_leg.side,
        action: Action::Sell,
        price,
        qty: remaining_qty,
        time_in_force: TimeInForce::Market,
        market_id,
        client_order_id: generate_client_order_id(filled_leg.venue, OrderRole::Unwind),
        reduce_only: true,
    })
}

/// Plans a plain reduce-only sell for pre-close or liquidation cleanup
/// (no ladder, submitted once at `price`).
///
/// # Errors
/// Returns [`PlannerError::MissingMarketId`] if the mapping has no entry
/// for `venue`/`side`.
pub fn plan_cleanup_sell(
    venue: Venue,
    side: Side,
    mapping: &IntervalMapping,
    price: Decimal,
    qty: Decimal,
) -> Result<OrderParams, PlannerError> {
    let market_id = market_id_for(mapping, venue, side)?;
    let tif = match venue {
        Venue::Kalshi => TimeInForce::Ioc,
        Venue::Polymarket => TimeInForce::Fok,
    };
    Ok(OrderParams {
        venue,
        side,
        action: Action::Sell,
        price: clamp_ladder_price(price),
        qty,
        time_in_force: tif,
        market_id,
        client_order_id: generate_client_order_id(venue, OrderRole::Unwind),
        reduce_only: true,
    })
}

/// Wraps a just-built [`OrderParams`] with its source leg into a fresh,
/// not-yet-submitted [`LegExecution`].
#[must_use]
pub fn to_leg_execution(leg: ArbLeg, params: OrderParams) -> LegExecution {
    LegExecution::new(leg, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use crate::types::{IntervalKey, KalshiMapping, PolymarketMapping};

    fn mapping() -> IntervalMapping {
        IntervalMapping {
            interval_key: IntervalKey::starting_at(0),
            polymarket: Some(PolymarketMapping {
                up_token_id: "up-token".into(),
                down_token_id: "down-token".into(),
            }),
            kalshi: Some(KalshiMapping {
                ticker: "KXBTC-TEST".into(),
            }),
        }
    }

    fn poly_leg() -> ArbLeg {
        ArbLeg {
            venue: Venue::Polymarket,
            side: Side::Yes,
            price: dec!(0.42),
            size: dec!(50),
        }
    }

    fn kalshi_leg() -> ArbLeg {
        ArbLeg {
            venue: Venue::Kalshi,
            side: Side::No,
            price: dec!(0.56),
            size: dec!(50),
        }
    }

    // ==================== client_order_id ====================

    #[test]
    fn client_order_id_encodes_venue_and_role() {
        let id = generate_client_order_id(Venue::Polymarket, OrderRole::LegA);
        assert!(id.starts_with("polymarket-A-"));
        let id = generate_client_order_id(Venue::Kalshi, OrderRole::Unwind);
        assert!(id.starts_with("kalshi-U-"));
    }

    #[test]
    fn client_order_ids_are_unique_across_calls() {
        let a = generate_client_order_id(Venue::Polymarket, OrderRole::LegA);
        let b = generate_client_order_id(Venue::Polymarket, OrderRole::LegA);
        assert_ne!(a, b);
    }

    // ==================== leg planning always orders Polymarket first ====================

    #[test]
    fn plan_leg_a_is_always_polymarket_ioc() {
        let params = plan_leg_a(&poly_leg(), &mapping(), dec!(5)).unwrap();
        assert_eq!(params.venue, Venue::Polymarket);
        assert_eq!(params.time_in_force, TimeInForce::Ioc);
        assert_eq!(params.action, Action::Buy);
        assert_eq!(params.market_id, "up-token");
    }

    #[test]
    fn plan_leg_b_is_always_kalshi_fok() {
        let params = plan_leg_b(&kalshi_leg(), &mapping(), dec!(5)).unwrap();
        assert_eq!(params.venue, Venue::Kalshi);
        assert_eq!(params.time_in_force, TimeInForce::Fok);
        assert_eq!(params.market_id, "KXBTC-TEST");
    }

    #[test]
    fn plan_leg_a_picks_down_token_for_no_side() {
        let mut leg = poly_leg();
        leg.side = Side::No;
        let params = plan_leg_a(&leg, &mapping(), dec!(5)).unwrap();
        assert_eq!(params.market_id, "down-token");
    }

    #[test]
    fn plan_leg_a_errors_without_polymarket_mapping() {
        let mut m = mapping();
        m.polymarket = None;
        assert!(matches!(
            plan_leg_a(&poly_leg(), &m, dec!(5)),
            Err(PlannerError::MissingMarketId { .. })
        ));
    }

    // ==================== unwind / ladder ====================

    #[test]
    fn ladder_step_tif_differs_by_venue() {
        let kalshi_step = plan_ladder_step(&kalshi_leg(), &mapping(), dec!(0.55), dec!(2)).unwrap();
        assert_eq!(kalshi_step.time_in_force, TimeInForce::Ioc);
        let poly_step = plan_ladder_step(&poly_leg(), &mapping(), dec!(0.41), dec!(2)).unwrap();
        assert_eq!(poly_step.time_in_force, TimeInForce::Fok);
    }

    #[test]
    fn ladder_step_is_a_reduce_only_sell() {
        let step = plan_ladder_step(&poly_leg(), &mapping(), dec!(0.41), dec!(5)).unwrap();
        assert_eq!(step.action, Action::Sell);
        assert!(step.reduce_only);
    }

    #[test]
    fn ladder_price_clamps_to_legal_range() {
        assert_eq!(clamp_ladder_price(dec!(0.0)), dec!(0.01));
        assert_eq!(clamp_ladder_price(dec!(1.5)), dec!(0.99));
        assert_eq!(clamp_ladder_price(dec!(0.41)), dec!(0.41));
    }

    #[test]
    fn unwind_market_price_is_zero_for_kalshi_and_min_for_polymarket() {
        let kalshi_market = plan_unwind_market(&kalshi_leg(), &mapping(), dec!(3)).unwrap();
        assert_eq!(kalshi_market.price, Decimal::ZERO);
        assert_eq!(kalshi_market.time_in_force, TimeInForce::Market);

        let poly_market = plan_unwind_market(&poly_leg(), &mapping(), dec!(3)).unwrap();
        assert_eq!(poly_market.price, dec!(0.01));
    }

    #[test]
    fn cleanup_sell_uses_venue_appropriate_tif() {
        let sell = plan_cleanup_sell(Venue::Polymarket, Side::Yes, &mapping(), dec!(0.40), dec!(9)).unwrap();
        assert_eq!(sell.time_in_force, TimeInForce::Fok);
        assert_eq!(sell.qty, dec!(9));
    }
}
