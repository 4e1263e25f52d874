//! Order execution for cross-venue arbitrage between Kalshi and Polymarket
//! 15-minute binary markets.
//!
//! This crate owns everything that happens once a detector hands over an
//! [`Opportunity`](types::Opportunity): guarding it against stale or
//! oversized fills, submitting the two legs in the required order, and
//! cleaning up whatever is left behind when one leg doesn't cooperate.
//!
//! # Overview
//!
//! An opportunity pays out only if both legs fill. Leg A (Polymarket, IOC)
//! is always submitted and confirmed before Leg B (Kalshi, FOK) is even
//! built — not in parallel — because an unhedged Polymarket fill is easier
//! to unwind than an unhedged Kalshi one:
//!
//! ```text
//! detect -> guard -> submit Leg A -> submit Leg B -> settle
//!                        |               |
//!                        v               v
//!                   unwind on fail   unwind on fail
//! ```
//!
//! If a leg fails to fill adequately, [`unwinder`] sells down whatever did
//! fill through a price ladder and then a market-order fallback, always
//! accounting for the full notional of any quantity it can't clear.
//! [`liquidator`] handles the kill-switch case where positions accumulate a
//! directional imbalance across intervals. [`preclose`] sells down standing
//! positions shortly before every rollover regardless of kill-switch state.
//! [`volatility`] watches BTC ticks near rollover for an early, profitable
//! exit when the market oscillates enough to make one available.
//!
//! # Modules
//!
//! - [`types`]: Core types shared across the execution pipeline
//! - [`error`]: Per-stage error enums and transient/permanent classification
//! - [`config`]: Runtime configuration, loaded from TOML + environment
//! - [`venue`]: The venue-agnostic client trait and per-venue dispatch
//! - [`position`]: Tracks open positions and notional per venue/side
//! - [`state`]: Kill switch, cooldown, busy lock, daily P&L
//! - [`guards`]: Pre-submission sanity checks (notional cap, min qty, edge
//!   threshold, open-order backpressure, position balance, liquidation lock)
//! - [`planner`]: Builds [`OrderParams`](types::OrderParams) for every order role
//! - [`unwinder`]: Price-ladder-then-market unwind of a partially filled leg
//! - [`executor`]: The sequential two-leg submission pipeline
//! - [`liquidator`]: Kill-switch-driven directional cleanup
//! - [`preclose`]: Per-interval sell-down ahead of rollover
//! - [`volatility`]: BTC-tick-driven early exit on oscillation
//!
//! # Safety
//!
//! **CRITICAL**: this crate submits real orders against real capital.
//! Before wiring it into a live feed, verify:
//!
//! 1. [`ExecutionConfig::validate`](config::ExecutionConfig::validate) has
//!    been called and passed at startup.
//! 2. The kill switch ([`ExecutionState::trigger_kill_switch`](state::ExecutionState::trigger_kill_switch))
//!    is wired to page someone, not just log.
//! 3. `dry_run` is set while testing against live venue credentials.
//! 4. Every unwind path is exercised in a venue sandbox, not just unit tests —
//!    this crate's own tests script venue responses and cannot catch wire-format
//!    drift.

pub mod config;
pub mod error;
pub mod executor;
pub mod guards;
pub mod liquidator;
pub mod planner;
pub mod position;
pub mod preclose;
pub mod state;
pub mod types;
pub mod unwinder;
pub mod venue;
pub mod volatility;

pub use config::{ExecutionConfig, ExecutionConfigLoader};
pub use error::{ErrorClass, ExecutionError, GuardError, LiquidatorError, PlannerError, UnwinderError};
pub use executor::Executor;
pub use guards::GuardInputs;
pub use liquidator::LiquidationOutcome;
pub use position::PositionTracker;
pub use preclose::PreCloseUnwind;
pub use state::ExecutionState;
pub use types::{
    Action, ArbLeg, ExecutionRecord, ExecutionStatus, IntervalKey, IntervalMapping, KalshiMapping,
    LegExecution, Opportunity, OrderParams, OrderResult, OrderStatus, PendingSettlement,
    PolymarketMapping, Side, TimeInForce, UnwindRecord, UnwindResult, Venue,
};
pub use venue::{
    Fill, IntervalClock, MarketDataCoordinator, NormalizedQuote, OrderStatusSnapshot,
    PositionsSnapshot, RolloverEvent, SystemIntervalClock, VenueClient, VenueClients,
};
pub use volatility::{ExitState, VolatilityExitManager};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_exports() {
        let _ = ExecutionConfig::default();
        let _ = PositionTracker::new();
        let _ = ExecutionState::new();
        let _ = PreCloseUnwind::new();
        let _ = VolatilityExitManager::new();
    }

    #[test]
    fn test_types_accessible() {
        let _ = Side::Yes;
        let _ = Side::No;
        let _ = Venue::Kalshi;
        let _ = Venue::Polymarket;
        let _ = Action::Buy;
        let _ = Action::Sell;
        let _ = TimeInForce::Ioc;
        let _ = TimeInForce::Fok;
    }

    #[test]
    fn test_error_classification_accessible() {
        assert_eq!(error::classify_error_text("insufficient balance"), ErrorClass::Permanent);
    }
}
