//! Process-wide execution state singleton: busy lock, cooldown, daily PnL,
//! kill switch, notional tracking, and pending settlements.
//!
//! Owned as an `Arc<ExecutionState>` by the top-level runtime and passed by
//! reference to every component — never captured in an implicit global,
//! per the design note on singleton state.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::types::{IntervalKey, PendingSettlement};

/// Process-wide mutable execution state.
///
/// Concurrency note: all mutation happens from a single logical actor, but
/// async continuations can interleave, so every field is still guarded.
/// Hot test-and-set fields (`busy`) use atomics; everything else sits
/// behind a `parking_lot::RwLock`, matching this codebase's circuit-breaker
/// idiom rather than an async mutex.
pub struct ExecutionState {
    busy: AtomicBool,
    current_execution: RwLock<Option<Uuid>>,
    last_failure_ts: RwLock<Option<DateTime<Utc>>>,
    daily_realized_pnl: RwLock<Decimal>,
    daily_unwind_loss: RwLock<Decimal>,
    daily_start_ts: RwLock<DateTime<Utc>>,
    kill_switch_triggered: AtomicBool,
    kill_switch_reason: RwLock<Option<String>>,
    total_notional: RwLock<Decimal>,
    // Stored as millis since epoch so the field stays Sync without extra locking ceremony.
    cooldown_until_ms: AtomicI64,
    pending_settlements: RwLock<Vec<PendingSettlement>>,
    liquidation_in_progress: AtomicBool,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            current_execution: RwLock::new(None),
            last_failure_ts: RwLock::new(None),
            daily_realized_pnl: RwLock::new(Decimal::ZERO),
            daily_unwind_loss: RwLock::new(Decimal::ZERO),
            daily_start_ts: RwLock::new(Utc::now()),
            kill_switch_triggered: AtomicBool::new(false),
            kill_switch_reason: RwLock::new(None),
            total_notional: RwLock::new(Decimal::ZERO),
            cooldown_until_ms: AtomicI64::new(0),
            pending_settlements: RwLock::new(Vec::new()),
            liquidation_in_progress: AtomicBool::new(false),
        }
    }

    // ==================== Busy lock ====================

    /// Test-and-set: returns `true` if this call acquired the lock.
    pub fn acquire_busy_lock(&self, execution_id: Uuid) -> bool {
        let acquired = self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if acquired {
            *self.current_execution.write() = Some(execution_id);
        }
        acquired
    }

    pub fn release_busy_lock(&self) {
        *self.current_execution.write() = None;
        self.busy.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn current_execution(&self) -> Option<Uuid> {
        *self.current_execution.read()
    }

    // ==================== Cooldown ====================

    pub fn enter_cooldown(&self, now: DateTime<Utc>, duration_ms: i64) {
        *self.last_failure_ts.write() = Some(now);
        self.cooldown_until_ms
            .store(now.timestamp_millis() + duration_ms, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_in_cooldown(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() < self.cooldown_until_ms.load(Ordering::SeqCst)
    }

    // ==================== Daily PnL ====================

    /// Accumulates signed realized PnL, rolling the accumulator at UTC
    /// midnight. The kill switch is never reset by this call.
    pub fn record_pnl(&self, pnl: Decimal, now: DateTime<Utc>) {
        self.maybe_roll_day(now);
        *self.daily_realized_pnl.write() += pnl;
        if pnl < Decimal::ZERO {
            *self.daily_unwind_loss.write() += -pnl;
        }
    }

    #[must_use]
    pub fn get_daily_loss(&self) -> Decimal {
        let pnl = *self.daily_realized_pnl.read();
        if pnl < Decimal::ZERO {
            -pnl
        } else {
            Decimal::ZERO
        }
    }

    #[must_use]
    pub fn get_daily_realized_pnl(&self) -> Decimal {
        *self.daily_realized_pnl.read()
    }

    #[must_use]
    pub fn get_daily_unwind_loss(&self) -> Decimal {
        *self.daily_unwind_loss.read()
    }

    fn maybe_roll_day(&self, now: DateTime<Utc>) {
        let start = *self.daily_start_ts.read();
        if now.date_naive() != start.date_naive() {
            *self.daily_realized_pnl.write() = Decimal::ZERO;
            *self.daily_unwind_loss.write() = Decimal::ZERO;
            *self.daily_start_ts.write() = Utc
                .from_utc_datetime(&now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default());
            tracing::info!("daily PnL accumulator reset at UTC midnight crossing");
        }
    }

    // ==================== Kill switch ====================

    pub fn trigger_kill_switch(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(reason = %reason, "kill switch triggered");
        *self.kill_switch_reason.write() = Some(reason);
        self.kill_switch_triggered.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_kill_switch_triggered(&self) -> bool {
        self.kill_switch_triggered.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn kill_switch_reason(&self) -> Option<String> {
        self.kill_switch_reason.read().clone()
    }

    /// Manual-only reset; never called automatically by this crate.
    pub fn reset_kill_switch(&self) {
        self.kill_switch_triggered.store(false, Ordering::SeqCst);
        *self.kill_switch_reason.write() = None;
        tracing::info!("kill switch manually reset");
    }

    // ==================== Notional ====================

    pub fn add_notional(&self, amount: Decimal) {
        let mut total = self.total_notional.write();
        *total += amount;
        if *total < Decimal::ZERO {
            *total = Decimal::ZERO;
        }
    }

    pub fn remove_notional(&self, amount: Decimal) {
        let mut total = self.total_notional.write();
        *total -= amount;
        if *total < Decimal::ZERO {
            *total = Decimal::ZERO;
        }
    }

    #[must_use]
    pub fn get_total_notional(&self) -> Decimal {
        *self.total_notional.read()
    }

    // ==================== Pending settlements ====================

    pub fn add_pending_settlement(&self, settlement: PendingSettlement) {
        self.pending_settlements.write().push(settlement);
    }

    /// Removes and returns all pending settlements for an interval that has
    /// ended, so the caller can realize their PnL.
    pub fn settle_pending(&self, interval_key: IntervalKey) -> Vec<PendingSettlement> {
        let mut guard = self.pending_settlements.write();
        let (settled, remaining): (Vec<_>, Vec<_>) = guard
            .drain(..)
            .partition(|ps| ps.interval_key.start_ts == interval_key.start_ts);
        *guard = remaining;
        settled
    }

    #[must_use]
    pub fn get_unrealized_pnl(&self) -> Decimal {
        self.pending_settlements
            .read()
            .iter()
            .map(|ps| ps.expected_pnl)
            .sum()
    }

    #[must_use]
    pub fn pending_settlement_count(&self) -> usize {
        self.pending_settlements.read().len()
    }

    // ==================== Liquidation flag ====================

    pub fn start_liquidation(&self) {
        self.liquidation_in_progress.store(true, Ordering::SeqCst);
    }

    pub fn finish_liquidation(&self) {
        self.liquidation_in_progress.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_liquidation_in_progress(&self) -> bool {
        self.liquidation_in_progress.load(Ordering::SeqCst)
    }

    /// Test-only full reset, gated so it can never ship in the production
    /// API surface.
    #[cfg(any(test, feature = "test-util"))]
    pub fn reset_all(&self) {
        self.busy.store(false, Ordering::SeqCst);
        *self.current_execution.write() = None;
        *self.last_failure_ts.write() = None;
        *self.daily_realized_pnl.write() = Decimal::ZERO;
        *self.daily_unwind_loss.write() = Decimal::ZERO;
        *self.daily_start_ts.write() = Utc::now();
        self.kill_switch_triggered.store(false, Ordering::SeqCst);
        *self.kill_switch_reason.write() = None;
        *self.total_notional.write() = Decimal::ZERO;
        self.cooldown_until_ms.store(0, Ordering::SeqCst);
        self.pending_settlements.write().clear();
        self.liquidation_in_progress.store(false, Ordering::SeqCst);
    }
}
