//! External collaborator interfaces: venue clients, the market-data
//! coordinator, and the interval clock.
//!
//! This crate does not implement venue REST/WS clients, market discovery,
//! or quote normalization — those are out of scope (§1) and are modeled
//! here purely as the trait boundary this pipeline consumes. Concrete
//! implementations live in a separate venue-integration crate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::ExecutionError;
use crate::types::{IntervalKey, OrderParams, OrderResult, Side, Venue};

/// One fill reported by a venue's fills API — authoritative for IOC orders
/// whose synchronous response may under-report.
#[derive(Debug, Clone)]
pub struct Fill {
    pub order_id: String,
    pub qty: Decimal,
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Terminal-or-not status snapshot for an order, as returned by
/// `get_order_status`.
#[derive(Debug, Clone)]
pub struct OrderStatusSnapshot {
    pub filled: bool,
    pub fill_qty: Option<Decimal>,
    pub fill_price: Option<Decimal>,
    pub status: crate::types::OrderStatus,
}

/// Net positions for one venue, as reported by its portfolio API.
#[derive(Debug, Clone, Default)]
pub struct PositionsSnapshot {
    pub positions: Vec<(Side, Decimal)>,
}

impl PositionsSnapshot {
    #[must_use]
    pub fn quantity(&self, side: Side) -> Decimal {
        self.positions
            .iter()
            .find(|(s, _)| *s == side)
            .map_or(Decimal::ZERO, |(_, qty)| *qty)
    }
}

/// A normalized top-of-book quote, as cached by the market-data
/// coordinator.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedQuote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub as_of: DateTime<Utc>,
}

/// The capability set every venue implementation must provide.
///
/// Modeled as one trait with per-venue implementations rather than an
/// enum-dispatch per operation — the planner and executor branch on
/// `Venue` only to pick which client to call, never to reimplement the
/// operation itself.
#[async_trait]
pub trait VenueClient: Send + Sync {
    fn venue(&self) -> Venue;

    async fn place_order(&self, params: &OrderParams) -> Result<OrderResult, ExecutionError>;

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExecutionError>;

    async fn get_order_status(
        &self,
        order_id: &str,
    ) -> Result<OrderStatusSnapshot, ExecutionError>;

    /// Polymarket only: on-chain conditional-token balance. Other venues
    /// may return `Ok(Decimal::MAX)` to signal "not applicable, don't cap".
    async fn get_conditional_token_balance(
        &self,
        token_id: &str,
    ) -> Result<Decimal, ExecutionError>;

    /// Kalshi only: the authoritative fills feed for IOC orders. Other
    /// venues may return an empty vec.
    async fn get_fills(&self, order_id: &str) -> Result<Vec<Fill>, ExecutionError>;

    async fn get_portfolio_positions(&self) -> Result<PositionsSnapshot, ExecutionError>;

    async fn get_collateral_balance(&self) -> Result<Decimal, ExecutionError>;

    fn get_quote(&self) -> Option<NormalizedQuote>;
}

/// Holds one [`VenueClient`] per venue so the executor, unwinder,
/// liquidator, pre-close unwind and volatility exit manager can all
/// dispatch on a [`Venue`] tag without matching on concrete client types.
#[derive(Clone)]
pub struct VenueClients {
    polymarket: Arc<dyn VenueClient>,
    kalshi: Arc<dyn VenueClient>,
}

impl VenueClients {
    #[must_use]
    pub fn new(polymarket: Arc<dyn VenueClient>, kalshi: Arc<dyn VenueClient>) -> Self {
        Self { polymarket, kalshi }
    }

    #[must_use]
    pub fn get(&self, venue: Venue) -> &Arc<dyn VenueClient> {
        match venue {
            Venue::Polymarket => &self.polymarket,
            Venue::Kalshi => &self.kalshi,
        }
    }
}

/// Events the market-data coordinator emits across an interval rollover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloverEvent {
    RolloverStarted(IntervalKey),
    RolloverCompleted(IntervalKey),
    MarketDiscovered(IntervalKey),
}

/// Supplies the current interval mapping, cached quotes, and a BTC-tick
/// subscription. This crate only consumes it.
pub trait MarketDataCoordinator: Send + Sync {
    fn current_mapping(&self) -> Option<crate::types::IntervalMapping>;
    fn get_quote(&self, venue: Venue) -> Option<NormalizedQuote>;
}

/// Computes interval boundaries and time-to-rollover.
pub trait IntervalClock: Send + Sync {
    fn get_interval_key(&self, now: DateTime<Utc>) -> IntervalKey;
    fn ms_until_rollover(&self, now: DateTime<Utc>) -> i64;
}

/// Wall-clock implementation: boundaries at `:00`, `:15`, `:30`, `:45` UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIntervalClock;

impl IntervalClock for SystemIntervalClock {
    fn get_interval_key(&self, now: DateTime<Utc>) -> IntervalKey {
        let ts = now.timestamp();
        let start = ts - ts.rem_euclid(IntervalKey::DURATION_SECS);
        IntervalKey::starting_at(start)
    }

    fn ms_until_rollover(&self, now: DateTime<Utc>) -> i64 {
        let interval = self.get_interval_key(now);
        (interval.end_ts - now.timestamp()) * 1000 - i64::from(now.timestamp_subsec_millis())
    }
}
