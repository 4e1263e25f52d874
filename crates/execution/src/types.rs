//! Core data types shared by every component of the execution pipeline.
//!
//! These types carry no behavior beyond small pure helpers; the logic that
//! produces and consumes them lives in [`crate::planner`], [`crate::executor`],
//! [`crate::unwinder`], [`crate::liquidator`], [`crate::preclose`] and
//! [`crate::volatility`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A half-open 15-minute settlement window, in UTC seconds.
///
/// Invariant: `end_ts == start_ts + 900`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntervalKey {
    pub start_ts: i64,
    pub end_ts: i64,
}

impl IntervalKey {
    pub const DURATION_SECS: i64 = 900;

    /// Builds the interval starting at `start_ts`, deriving `end_ts`.
    #[must_use]
    pub fn starting_at(start_ts: i64) -> Self {
        Self {
            start_ts,
            end_ts: start_ts + Self::DURATION_SECS,
        }
    }

    #[must_use]
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start_ts && ts < self.end_ts
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.end_ts == self.start_ts + Self::DURATION_SECS
    }
}

/// The two venues this system trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    Polymarket,
    Kalshi,
}

impl Venue {
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Polymarket => Self::Kalshi,
            Self::Kalshi => Self::Polymarket,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Polymarket => "polymarket",
            Self::Kalshi => "kalshi",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which side of the binary outcome a position or order refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Yes => Self::No,
            Self::No => Self::Yes,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Buy or sell an order places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy,
    Sell,
}

/// Time-in-force an order is submitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Fill-or-kill: all-or-nothing, no partial fills.
    Fok,
    /// Immediate-or-cancel: fill what's available now, cancel the remainder.
    Ioc,
    /// Unconditional market order.
    Market,
}

/// Per-interval venue-specific market identifiers.
///
/// Invariant: `polymarket` and `kalshi` are never both `None` for an
/// interval the executor is asked to touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalMapping {
    pub interval_key: IntervalKey,
    pub polymarket: Option<PolymarketMapping>,
    pub kalshi: Option<KalshiMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolymarketMapping {
    pub up_token_id: String,
    pub down_token_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalshiMapping {
    pub ticker: String,
}

impl IntervalMapping {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.polymarket.is_some() || self.kalshi.is_some()
    }

    /// The market id an order for `venue`/`side` should target.
    #[must_use]
    pub fn market_id(&self, venue: Venue, side: Side) -> Option<String> {
        match venue {
            Venue::Polymarket => self.polymarket.as_ref().map(|m| match side {
                Side::Yes => m.up_token_id.clone(),
                Side::No => m.down_token_id.clone(),
            }),
            Venue::Kalshi => self.kalshi.as_ref().map(|m| m.ticker.clone()),
        }
    }
}

/// One half of a two-leg arbitrage opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbLeg {
    pub venue: Venue,
    pub side: Side,
    pub price: Decimal,
    /// Quoted depth available at `price`, not necessarily the size traded.
    pub size: Decimal,
}

/// A detected, pre-validated cross-venue arbitrage opportunity.
///
/// Invariants (checked at construction by the opportunity scanner, assumed
/// to hold by everything downstream): the two legs name complementary sides
/// and distinct venues; `cost == sum(leg.price * qty)`; `edge_net >= 0`; both
/// leg prices lie within `[0.01, 0.99]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub interval_key: IntervalKey,
    pub decision_ts: DateTime<Utc>,
    pub legs: [ArbLeg; 2],
    pub cost: Decimal,
    pub edge_gross: Decimal,
    pub edge_net: Decimal,
    pub qty: Decimal,
}

impl Opportunity {
    #[must_use]
    pub fn leg_for_venue(&self, venue: Venue) -> Option<&ArbLeg> {
        self.legs.iter().find(|leg| leg.venue == venue)
    }

    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let [a, b] = &self.legs;
        a.venue != b.venue
            && a.side == b.side.opposite()
            && self.edge_net >= Decimal::ZERO
            && (Decimal::new(1, 2)..=Decimal::new(99, 2)).contains(&a.price)
            && (Decimal::new(1, 2)..=Decimal::new(99, 2)).contains(&b.price)
    }
}

/// Parameters for a single order submission, fully determined before it is
/// sent to a venue client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderParams {
    pub venue: Venue,
    pub side: Side,
    pub action: Action,
    pub price: Decimal,
    pub qty: Decimal,
    pub time_in_force: TimeInForce,
    pub market_id: String,
    pub client_order_id: String,
    #[serde(default)]
    pub reduce_only: bool,
}

/// Terminal or in-flight status of a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitting,
    Filled,
    PartiallyFilled,
    Rejected,
    Timeout,
}

impl OrderStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::PartiallyFilled | Self::Rejected | Self::Timeout
        )
    }
}

/// The outcome of submitting (or checking) one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub fill_qty: Decimal,
    pub fill_price: Decimal,
    pub venue: Venue,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OrderResult {
    #[must_use]
    pub fn has_fill(&self) -> bool {
        self.fill_qty > Decimal::ZERO
    }

    #[must_use]
    pub fn rejected(venue: Venue, error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            fill_qty: Decimal::ZERO,
            fill_price: Decimal::ZERO,
            venue,
            status: OrderStatus::Rejected,
            submitted_at: Utc::now(),
            filled_at: None,
            error: Some(error.into()),
        }
    }
}

/// One leg's full execution trail: the plan, the submission, and the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegExecution {
    pub leg: ArbLeg,
    pub params: OrderParams,
    pub result: Option<OrderResult>,
    pub submit_ts: Option<DateTime<Utc>>,
    pub fill_ts: Option<DateTime<Utc>>,
}

impl LegExecution {
    #[must_use]
    pub fn new(leg: ArbLeg, params: OrderParams) -> Self {
        Self {
            leg,
            params,
            result: None,
            submit_ts: None,
            fill_ts: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> OrderStatus {
        self.result
            .as_ref()
            .map_or(OrderStatus::Pending, |r| r.status)
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.result.as_ref().is_some_and(OrderResult::has_fill)
    }
}

/// Record of an attempt to unwind one already-filled leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwindRecord {
    pub leg_to_unwind: LegExecution,
    pub unwind_params: Vec<OrderParams>,
    pub result: Option<UnwindResult>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub realized_loss: Decimal,
    pub reason: String,
}

/// The synthesized result of a (possibly multi-step) unwind attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwindResult {
    pub success: bool,
    pub filled_qty: Decimal,
    pub vwap: Decimal,
    pub remaining_qty: Decimal,
}

/// The lifecycle status of one [`ExecutionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    LegASubmitting,
    LegAFailed,
    LegBSubmitting,
    Success,
    Unwinding,
    Unwound,
    Aborted,
}

impl ExecutionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::LegAFailed | Self::Unwound | Self::Aborted
        )
    }
}

/// The full audit trail of one `execute_opportunity` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub opportunity: Opportunity,
    pub status: ExecutionStatus,
    pub leg_a: Option<LegExecution>,
    pub leg_b: Option<LegExecution>,
    pub unwind: Option<UnwindRecord>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub expected_edge_net: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub poly_quote_snapshot: Option<Decimal>,
    pub kalshi_quote_snapshot: Option<Decimal>,
}

impl ExecutionRecord {
    #[must_use]
    pub fn new(opportunity: Opportunity) -> Self {
        Self {
            id: Uuid::new_v4(),
            expected_edge_net: opportunity.edge_net,
            opportunity,
            status: ExecutionStatus::Pending,
            leg_a: None,
            leg_b: None,
            unwind: None,
            start_ts: Utc::now(),
            end_ts: None,
            realized_pnl: None,
            poly_quote_snapshot: None,
            kalshi_quote_snapshot: None,
        }
    }
}

/// A box whose legs are both filled, awaiting interval settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSettlement {
    pub execution_id: Uuid,
    pub interval_key: IntervalKey,
    pub settles_at: i64,
    pub expected_pnl: Decimal,
    pub actual_cost: Decimal,
    pub qty: Decimal,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // ==================== IntervalKey ====================

    #[test]
    fn interval_key_starting_at_derives_end() {
        let key = IntervalKey::starting_at(1_000);
        assert_eq!(key.end_ts, 1_900);
        assert!(key.is_valid());
    }

    #[test]
    fn interval_key_contains_is_half_open() {
        let key = IntervalKey::starting_at(0);
        assert!(key.contains(0));
        assert!(key.contains(899));
        assert!(!key.contains(900));
    }

    // ==================== Venue / Side ====================

    #[test]
    fn venue_other_round_trips() {
        assert_eq!(Venue::Polymarket.other(), Venue::Kalshi);
        assert_eq!(Venue::Kalshi.other(), Venue::Polymarket);
        assert_eq!(Venue::Polymarket.other().other(), Venue::Polymarket);
    }

    #[test]
    fn side_opposite_round_trips() {
        assert_eq!(Side::Yes.opposite(), Side::No);
        assert_eq!(Side::No.opposite().opposite(), Side::No);
    }

    // ==================== IntervalMapping ====================

    fn mapping_with_both() -> IntervalMapping {
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

    #[test]
    fn mapping_market_id_picks_up_or_down_by_side() {
        let mapping = mapping_with_both();
        assert_eq!(
            mapping.market_id(Venue::Polymarket, Side::Yes),
            Some("up".to_string())
        );
        assert_eq!(
            mapping.market_id(Venue::Polymarket, Side::No),
            Some("down".to_string())
        );
        assert_eq!(
            mapping.market_id(Venue::Kalshi, Side::Yes),
            Some("KXBTC-TEST".to_string())
        );
    }

    #[test]
    fn mapping_invalid_when_both_absent() {
        let mapping = IntervalMapping {
            interval_key: IntervalKey::starting_at(0),
            polymarket: None,
            kalshi: None,
        };
        assert!(!mapping.is_valid());
    }

    // ==================== Opportunity ====================

    fn happy_path_opportunity() -> Opportunity {
        Opportunity {
            interval_key: IntervalKey::starting_at(0),
            decision_ts: Utc::now(),
            legs: [
                ArbLeg {
                    venue: Venue::Polymarket,
                    side: Side::Yes,
                    price: dec!(0.42),
                    size: dec!(50),
                },
                ArbLeg {
                    venue: Venue::Kalshi,
                    side: Side::No,
                    price: dec!(0.56),
                    size: dec!(50),
                },
            ],
            cost: dec!(0.98),
            edge_gross: dec!(0.02),
            edge_net: dec!(0.02),
            qty: dec!(5),
        }
    }

    #[test]
    fn opportunity_is_well_formed_happy_path() {
        assert!(happy_path_opportunity().is_well_formed());
    }

    #[test]
    fn opportunity_leg_for_venue() {
        let opp = happy_path_opportunity();
        assert_eq!(opp.leg_for_venue(Venue::Polymarket).unwrap().side, Side::Yes);
        assert_eq!(opp.leg_for_venue(Venue::Kalshi).unwrap().side, Side::No);
    }

    #[test]
    fn opportunity_not_well_formed_same_venue() {
        let mut opp = happy_path_opportunity();
        opp.legs[1].venue = Venue::Polymarket;
        assert!(!opp.is_well_formed());
    }

    #[test]
    fn opportunity_not_well_formed_matching_sides() {
        let mut opp = happy_path_opportunity();
        opp.legs[1].side = Side::Yes;
        assert!(!opp.is_well_formed());
    }

    #[test]
    fn opportunity_not_well_formed_price_out_of_range() {
        let mut opp = happy_path_opportunity();
        opp.legs[0].price = dec!(0.0);
        assert!(!opp.is_well_formed());
    }

    // ==================== OrderResult / ExecutionStatus ====================

    #[test]
    fn order_result_rejected_has_no_fill() {
        let result = OrderResult::rejected(Venue::Polymarket, "market_closed");
        assert!(!result.has_fill());
        assert_eq!(result.status, OrderStatus::Rejected);
    }

    #[test]
    fn execution_status_terminal_set() {
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::LegAFailed.is_terminal());
        assert!(ExecutionStatus::Unwound.is_terminal());
        assert!(ExecutionStatus::Aborted.is_terminal());
        assert!(!ExecutionStatus::LegBSubmitting.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
    }

    #[test]
    fn execution_record_new_starts_pending() {
        let record = ExecutionRecord::new(happy_path_opportunity());
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert!(record.leg_a.is_none());
        assert_eq!(record.expected_edge_net, dec!(0.02));
    }
}
