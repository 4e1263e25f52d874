//! Volatility exit manager: watches BTC spot ticks near the end of an
//! interval and, if the price oscillates enough, locks in a profitable
//! early exit on both legs rather than riding into settlement.
//!
//! State machine: `Idle -> Monitoring -> SellingFirst -> (WaitingForProfitability)
//! -> SellingSecond -> Done`, reset back to `Idle` by [`VolatilityExitManager::reset_for_interval`]
//! at rollover. Overlapping ticks are dropped by a reentrancy guard rather
//! than queued — a tick arrives roughly once a second and a stale decision
//! is worse than a skipped one.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::error::{classify_error_text, ErrorClass};
use crate::planner;
use crate::position::PositionTracker;
use crate::state::ExecutionState;
use crate::types::{IntervalMapping, Side, Venue};
use crate::venue::VenueClients;

const RING_CAPACITY: usize = 500;

/// Which side of the reference price (first tick of the interval) the
/// current BTC price sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickSide {
    Above,
    Below,
}

/// Incrementally tracks range and crossing count over a capped window of
/// recent ticks using a pair of monotonic deques, so `min`/`max` stay O(1)
/// amortized per push regardless of window size.
struct TickTracker {
    ticks: VecDeque<Decimal>,
    max_deque: VecDeque<Decimal>,
    min_deque: VecDeque<Decimal>,
    reference_price: Option<Decimal>,
    current_side: Option<TickSide>,
    crossing_count: u32,
}

impl TickTracker {
    fn new() -> Self {
        Self {
            ticks: VecDeque::with_capacity(RING_CAPACITY),
            max_deque: VecDeque::new(),
            min_deque: VecDeque::new(),
            reference_price: None,
            current_side: None,
            crossing_count: 0,
        }
    }

    fn reset(&mut self) {
        self.ticks.clear();
        self.max_deque.clear();
        self.min_deque.clear();
        self.reference_price = None;
        self.current_side = None;
        self.crossing_count = 0;
    }

    fn push(&mut self, price: Decimal) {
        if self.reference_price.is_none() {
            self.reference_price = Some(price);
        }
        let reference = self.reference_price.unwrap_or(price);
        let side = if price >= reference { TickSide::Above } else { TickSide::Below };
        if let Some(previous) = self.current_side {
            if previous != side {
                self.crossing_count += 1;
            }
        }
        self.current_side = Some(side);

        while self.max_deque.back().is_some_and(|&v| v < price) {
            self.max_deque.pop_back();
        }
        self.max_deque.push_back(price);
        while self.min_deque.back().is_some_and(|&v| v > price) {
            self.min_deque.pop_back();
        }
        self.min_deque.push_back(price);

        self.ticks.push_back(price);
        if self.ticks.len() > RING_CAPACITY {
            if let Some(evicted) = self.ticks.pop_front() {
                if self.max_deque.front() == Some(&evicted) {
                    self.max_deque.pop_front();
                }
                if self.min_deque.front() == Some(&evicted) {
                    self.min_deque.pop_front();
                }
            }
        }
    }

    fn range(&self) -> Decimal {
        match (self.max_deque.front(), self.min_deque.front()) {
            (Some(&max), Some(&min)) => max - min,
            _ => Decimal::ZERO,
        }
    }
}

/// The state machine's current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Idle,
    Monitoring,
    SellingFirst,
    WaitingForProfitability,
    SellingSecond,
    Done,
}

struct ReentrancyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// One interval's worth of volatility-exit state.
pub struct VolatilityExitManager {
    state: RwLock<ExitState>,
    tracker: RwLock<TickTracker>,
    failed_sides: RwLock<HashSet<Side>>,
    first_sold: RwLock<Option<(Side, Decimal)>>,
    in_tick: AtomicBool,
    last_trigger_failure_ts: RwLock<Option<DateTime<Utc>>>,
}

impl Default for VolatilityExitManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VolatilityExitManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ExitState::Idle),
            tracker: RwLock::new(TickTracker::new()),
            failed_sides: RwLock::new(HashSet::new()),
            first_sold: RwLock::new(None),
            in_tick: AtomicBool::new(false),
            last_trigger_failure_ts: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> ExitState {
        *self.state.read()
    }

    /// Whether the manager is actively exiting and new scanning/execution
    /// should hold off until it reaches `Done` or `Idle`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(*self.state.read(), ExitState::Idle)
    }

    /// Read-only predicate other modules consult before scanning: true only
    /// inside the configured halt window and only while the same crossing/range
    /// conditions that would trigger a sell are live, independent of whether
    /// this manager's own state machine has actually fired.
    #[must_use]
    pub fn should_halt_trading(&self, ms_until_rollover: i64, config: &ExecutionConfig) -> bool {
        let halt_window = i64::try_from(config.volatility_halt_window_ms).unwrap_or(i64::MAX);
        if ms_until_rollover > halt_window {
            return false;
        }
        let (crossing_count, range) = {
            let tracker = self.tracker.read();
            (tracker.crossing_count, tracker.range())
        };
        crossing_count >= config.volatility_exit_crossing_threshold
            && range >= config.volatility_exit_range_threshold_min_usd()
            && range <= config.volatility_exit_range_threshold_max_usd()
    }

    /// Clears all interval-scoped state. Called by the caller at rollover.
    pub fn reset_for_interval(&self) {
        *self.state.write() = ExitState::Idle;
        self.tracker.write().reset();
        self.failed_sides.write().clear();
        *self.first_sold.write() = None;
        *self.last_trigger_failure_ts.write() = None;
    }

    /// Manual stop: same as [`Self::reset_for_interval`], named separately
    /// since callers reach for it from a different control path (operator
    /// abort vs. automatic rollover).
    pub fn stop(&self) {
        self.reset_for_interval();
    }

    fn in_failed_trigger_cooldown(&self, now: DateTime<Utc>, config: &ExecutionConfig) -> bool {
        self.last_trigger_failure_ts.read().is_some_and(|ts| {
            (now - ts).num_milliseconds() < i64::try_from(config.volatility_exit_failed_trigger_cooldown_ms).unwrap_or(0)
        })
    }

    /// Feeds one BTC tick through the state machine. Drops the tick (a
    /// no-op) if a previous call is still in flight.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_tick(
        &self,
        price: Decimal,
        now: DateTime<Utc>,
        ms_until_rollover: i64,
        positions: &PositionTracker,
        mapping: &IntervalMapping,
        clients: &VenueClients,
        config: &ExecutionConfig,
        exec_state: &ExecutionState,
    ) {
        if !config.volatility_exit_enabled {
            return;
        }
        if self
            .in_tick
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let _guard = ReentrancyGuard { flag: &self.in_tick };

        self.tracker.write().push(price);

        let current_state = *self.state.read();
        match current_state {
            ExitState::Idle => {
                let holding_positions = !positions.open_positions().is_empty();
                let within_window = ms_until_rollover
                    <= i64::try_from(config.volatility_exit_window_ms).unwrap_or(i64::MAX);
                if holding_positions && within_window {
                    self.tracker.write().crossing_count = 0;
                    *self.state.write() = ExitState::Monitoring;
                    info!("volatility exit manager entered monitoring");
                }
            }
            ExitState::Monitoring => {
                self.try_trigger(now, ms_until_rollover, positions, mapping, clients, config, exec_state)
                    .await;
            }
            ExitState::WaitingForProfitability => {
                self.attempt_first_sell(ms_until_rollover, positions, mapping, clients, config)
                    .await;
            }
            ExitState::SellingSecond => {
                self.attempt_second_sell(ms_until_rollover, positions, mapping, clients, config)
                    .await;
            }
            ExitState::SellingFirst | ExitState::Done => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_trigger(
        &self,
        now: DateTime<Utc>,
        ms_until_rollover: i64,
        positions: &PositionTracker,
        mapping: &IntervalMapping,
        clients: &VenueClients,
        config: &ExecutionConfig,
        exec_state: &ExecutionState,
    ) {
        let (crossing_count, range) = {
            let tracker = self.tracker.read();
            (tracker.crossing_count, tracker.range())
        };
        let range_min = config.volatility_exit_range_threshold_min_usd();
        let range_max = config.volatility_exit_range_threshold_max_usd();

        let triggered = crossing_count >= config.volatility_exit_crossing_threshold
            && range >= range_min
            && range <= range_max
            && !self.in_failed_trigger_cooldown(now, config)
            && !exec_state.is_busy()
            && !exec_state.is_liquidation_in_progress();

        if !triggered {
            return;
        }

        info!(crossing_count, range = %range, "volatility exit triggered");
        *self.state.write() = ExitState::SellingFirst;
        self.attempt_first_sell(ms_until_rollover, positions, mapping, clients, config).await;
    }

    /// Sells the most profitable eligible side. Transitions to
    /// `SellingSecond` on a fill, `WaitingForProfitability` if every
    /// candidate is below the current zone's threshold.
    async fn attempt_first_sell(
        &self,
        ms_until_rollover: i64,
        positions: &PositionTracker,
        mapping: &IntervalMapping,
        clients: &VenueClients,
        config: &ExecutionConfig,
    ) {
        let threshold = profit_threshold(ms_until_rollover, config);
        let mut targets = self.eligible_targets(positions, clients, config);
        targets.sort_by(|a, b| b.profit.cmp(&a.profit));

        let mut any_above_threshold = false;
        for target in &targets {
            if target.profit < threshold {
                continue;
            }
            any_above_threshold = true;
            if threshold == Decimal::MIN {
                info!(side = %target.side, profit = %target.profit, "EMERGENCY sell: rollover imminent, selling at any price");
            }
            let (filled, permanent) = attempt_sell(
                target.venue,
                target.side,
                target.qty,
                positions,
                mapping,
                clients,
                config,
            )
            .await;

            if permanent {
                self.failed_sides.write().insert(target.side);
                continue;
            }
            if filled > Decimal::ZERO {
                *self.first_sold.write() = Some((target.side, filled));
                *self.state.write() = ExitState::SellingSecond;
                info!(side = %target.side, filled_qty = %filled, "volatility exit: first leg sold");
                return;
            }
        }

        if !any_above_threshold {
            *self.state.write() = ExitState::WaitingForProfitability;
        } else {
            *self.last_trigger_failure_ts.write() = Some(Utc::now());
        }
    }

    /// Sells the paired side, capped at the quantity the first leg sold.
    async fn attempt_second_sell(
        &self,
        ms_until_rollover: i64,
        positions: &PositionTracker,
        mapping: &IntervalMapping,
        clients: &VenueClients,
        config: &ExecutionConfig,
    ) {
        let Some((first_side, cap_qty)) = *self.first_sold.read() else {
            *self.state.write() = ExitState::Done;
            return;
        };
        let threshold = profit_threshold(ms_until_rollover, config);
        let mut targets = self.eligible_targets(positions, clients, config);
        targets.retain(|t| t.side != first_side);
        targets.sort_by(|a, b| b.profit.cmp(&a.profit));

        for target in &targets {
            if target.profit < threshold {
                continue;
            }
            if threshold == Decimal::MIN {
                info!(side = %target.side, profit = %target.profit, "EMERGENCY sell: rollover imminent, selling at any price");
            }
            let qty = target.qty.min(cap_qty);
            let (filled, permanent) = attempt_sell(
                target.venue,
                target.side,
                qty,
                positions,
                mapping,
                clients,
                config,
            )
            .await;
            if permanent {
                self.failed_sides.write().insert(target.side);
                continue;
            }
            if filled > Decimal::ZERO {
                info!(side = %target.side, filled_qty = %filled, "volatility exit: second leg sold");
                *self.state.write() = ExitState::Done;
                return;
            }
        }
    }

    fn eligible_targets(
        &self,
        positions: &PositionTracker,
        clients: &VenueClients,
        _config: &ExecutionConfig,
    ) -> Vec<SellTarget> {
        let failed = self.failed_sides.read();
        positions
            .open_positions()
            .into_iter()
            .filter(|(_, side, _)| !failed.contains(side))
            .filter_map(|(venue, side, qty)| {
                let quote = clients.get(venue).get_quote()?;
                let entry_vwap = positions.entry_vwap(venue, side);
                let profit = quote.bid - entry_vwap;
                Some(SellTarget { venue, side, qty, profit })
            })
            .collect()
    }
}

struct SellTarget {
    venue: Venue,
    side: Side,
    qty: Decimal,
    profit: Decimal,
}

/// Zone-gated profit threshold: patient far from rollover, breakeven
/// closer, unconditional ("emergency") once the window is nearly out.
fn profit_threshold(ms_until_rollover: i64, config: &ExecutionConfig) -> Decimal {
    let patient_ms = i64::try_from(config.volatility_exit_patient_threshold_ms).unwrap_or(i64::MAX);
    let breakeven_ms = i64::try_from(config.volatility_exit_breakeven_threshold_ms).unwrap_or(0);
    if ms_until_rollover > patient_ms {
        config.volatility_exit_min_profit_per_share()
    } else if ms_until_rollover > breakeven_ms {
        Decimal::ZERO
    } else {
        Decimal::MIN
    }
}

/// Sells `qty` of `side` on `venue`, retrying up to twice at stepped-down
/// offsets 300ms apart on a partial fill. Returns `(filled_qty,
/// permanent_failure)`.
async fn attempt_sell(
    venue: Venue,
    side: Side,
    qty: Decimal,
    positions: &PositionTracker,
    mapping: &IntervalMapping,
    clients: &VenueClients,
    config: &ExecutionConfig,
) -> (Decimal, bool) {
    const MAX_RETRIES: u32 = 2;
    const RETRY_DELAY: Duration = Duration::from_millis(300);
    const POLYMARKET_BALANCE_CAP_PCT: Decimal = Decimal::from_parts(95, 0, 0, false, 2);

    let offset = config.volatility_exit_sell_price_offset();
    let client = clients.get(venue);

    let mut remaining = if venue == Venue::Polymarket {
        match positions.market_id(venue, side) {
            Some(token_id) => {
                let balance = client.get_conditional_token_balance(&token_id).await.unwrap_or(qty);
                qty.min(balance * POLYMARKET_BALANCE_CAP_PCT)
            }
            None => qty,
        }
    } else {
        qty
    };

    let mut price = client.get_quote().map_or(Decimal::new(1, 2), |q| q.bid);
    let mut filled_total = Decimal::ZERO;

    for attempt in 0..=MAX_RETRIES {
        if remaining <= Decimal::ZERO {
            break;
        }
        let Ok(params) = planner::plan_cleanup_sell(venue, side, mapping, price, remaining) else {
            warn!(venue = %venue, "volatility exit sell aborted: mapping missing market id");
            break;
        };

        match client.place_order(&params).await {
            Ok(result) if result.has_fill() => {
                let filled = settled_fill_qty(client, &result, venue).await;
                filled_total += filled;
                remaining -= filled;
                positions.record_fill(
                    venue,
                    side,
                    crate::types::Action::Sell,
                    filled,
                    result.fill_price,
                    params.market_id.clone(),
                    mapping.interval_key,
                );
            }
            Ok(result) => {
                if let Some(text) = &result.error {
                    if classify_error_text(text) == ErrorClass::Permanent {
                        return (filled_total, true);
                    }
                }
            }
            Err(err) => {
                if classify_error_text(&err.to_string()) == ErrorClass::Permanent {
                    return (filled_total, true);
                }
                warn!(venue = %venue, error = %err, "volatility exit sell rejected, will retry");
            }
        }

        if remaining > Decimal::ZERO && attempt < MAX_RETRIES {
            price = planner::clamp_ladder_price(price - offset);
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    (filled_total, false)
}

/// Kalshi's fills feed is authoritative over the synchronous IOC response,
/// arriving roughly 200ms later.
async fn settled_fill_qty(
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
