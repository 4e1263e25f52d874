//! The two-phase-commit executor: submits Leg A (Polymarket, IOC), then
//! Leg B (Kalshi, FOK), and unwinds Leg A if Leg B cannot be hedged.
//!
//! Legs are submitted strictly sequentially, never via `tokio::join!`.
//! Leg A must be confirmed filled before Leg B is even planned — submitting
//! both concurrently would mean paying for an unhedged Leg A fill with no
//! chance to abort before money moves on the second venue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::error::ExecutionError;
use crate::guards::{self, GuardInputs};
use crate::planner;
use crate::position::PositionTracker;
use crate::state::ExecutionState;
use crate::types::{
    Action, ExecutionRecord, ExecutionStatus, IntervalMapping, LegExecution, OrderParams,
    OrderResult, Opportunity, PendingSettlement, Venue,
};
use crate::unwinder;
use crate::venue::VenueClients;

/// Releases the execution busy lock on every exit path, including early
/// returns and panics during `run`.
struct BusyGuard<'a> {
    state: &'a ExecutionState,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.state.release_busy_lock();
    }
}

/// Orchestrates one `execute_opportunity` call end to end.
pub struct Executor {
    state: Arc<ExecutionState>,
    positions: Arc<PositionTracker>,
    clients: VenueClients,
    config: ExecutionConfig,
}

impl Executor {
    #[must_use]
    pub fn new(
        state: Arc<ExecutionState>,
        positions: Arc<PositionTracker>,
        clients: VenueClients,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            state,
            positions,
            clients,
            config,
        }
    }

    /// Attempts to execute one detected opportunity. Always returns a
    /// terminal-or-near-terminal [`ExecutionRecord`]; never panics on a
    /// venue failure.
    pub async fn execute_opportunity(
        &self,
        opportunity: Opportunity,
        mapping: &IntervalMapping,
        open_orders_per_venue: &HashMap<Venue, u32>,
    ) -> ExecutionRecord {
        let mut record = ExecutionRecord::new(opportunity);

        if self.state.is_kill_switch_triggered() {
            warn!(execution_id = %record.id, "rejected: kill switch is active");
            record.status = ExecutionStatus::Aborted;
            record.end_ts = Some(Utc::now());
            return record;
        }
        if self.state.is_in_cooldown(Utc::now()) {
            warn!(execution_id = %record.id, "rejected: in cooldown");
            record.status = ExecutionStatus::Aborted;
            record.end_ts = Some(Utc::now());
            return record;
        }
        if !self.state.acquire_busy_lock(record.id) {
            warn!(execution_id = %record.id, "rejected: another execution is in progress");
            record.status = ExecutionStatus::Aborted;
            record.end_ts = Some(Utc::now());
            return record;
        }
        let _busy_guard = BusyGuard { state: &self.state };

        self.run(&mut record, mapping, open_orders_per_venue).await;
        record.end_ts = Some(Utc::now());
        record
    }

    async fn run(
        &self,
        record: &mut ExecutionRecord,
        mapping: &IntervalMapping,
        open_orders_per_venue: &HashMap<Venue, u32>,
    ) {
        let capped_qty = match guards::cap_qty_to_notional(
            &record.opportunity,
            self.config.max_notional(),
            self.state.get_total_notional(),
        ) {
            Ok(qty) => qty,
            Err(err) => {
                warn!(execution_id = %record.id, error = %err, "rejected by notional cap");
                record.status = ExecutionStatus::Aborted;
                return;
            }
        };

        let guard_inputs = GuardInputs {
            opportunity: &record.opportunity,
            capped_qty,
            mapping,
            config: &self.config,
            state: &self.state,
            positions: &self.positions,
            open_orders_per_venue,
        };
        if let Err(err) = guards::run_guards(&guard_inputs) {
            warn!(execution_id = %record.id, error = %err, "rejected by risk guards");
            record.status = ExecutionStatus::Aborted;
            return;
        }

        let Some(leg_a_arb) = record.opportunity.leg_for_venue(Venue::Polymarket).cloned() else {
            warn!(execution_id = %record.id, "opportunity has no Polymarket leg");
            record.status = ExecutionStatus::Aborted;
            return;
        };
        let Some(leg_b_arb) = record.opportunity.leg_for_venue(Venue::Kalshi).cloned() else {
            warn!(execution_id = %record.id, "opportunity has no Kalshi leg");
            record.status = ExecutionStatus::Aborted;
            return;
        };

        let leg_a_params = match planner::plan_leg_a(&leg_a_arb, mapping, capped_qty) {
            Ok(params) => params,
            Err(err) => {
                warn!(execution_id = %record.id, error = %err, "leg A planning failed");
                record.status = ExecutionStatus::Aborted;
                return;
            }
        };

        if self.config.dry_run {
            info!(execution_id = %record.id, market_id = %leg_a_params.market_id, qty = %leg_a_params.qty, "dry run: stopping before submission");
            record.leg_a = Some(planner::to_leg_execution(leg_a_arb, leg_a_params));
            record.status = ExecutionStatus::Success;
            record.realized_pnl = Some(record.opportunity.edge_net);
            return;
        }

        record.status = ExecutionStatus::LegASubmitting;
        let mut leg_a_exec = planner::to_leg_execution(leg_a_arb.clone(), leg_a_params.clone());
        leg_a_exec.submit_ts = Some(Utc::now());

        let leg_a_result = match self.submit_with_timeout(Venue::Polymarket, &leg_a_params).await {
            Ok(result) => result,
            Err(err) => {
                warn!(execution_id = %record.id, error = %err, "leg A submission failed");
                leg_a_exec.result = Some(OrderResult::rejected(Venue::Polymarket, err.to_string()));
                record.leg_a = Some(leg_a_exec);
                record.status = ExecutionStatus::LegAFailed;
                self.enter_cooldown();
                return;
            }
        };
        leg_a_exec.fill_ts = leg_a_result.filled_at;
        leg_a_exec.result = Some(leg_a_result.clone());
        record.leg_a = Some(leg_a_exec.clone());

        if !leg_a_result.has_fill() {
            warn!(execution_id = %record.id, "leg A had no fill");
            record.status = ExecutionStatus::LegAFailed;
            self.enter_cooldown();
            return;
        }

        let qty_a = leg_a_result.fill_qty;
        if qty_a < self.config.min_partial_fill_qty() {
            warn!(
                execution_id = %record.id,
                qty_a = %qty_a,
                "leg A fill below minimum partial-fill size, unwinding immediately"
            );
            self.unwind_and_finish(record, &leg_a_exec, mapping, "partial fill below minimum size")
                .await;
            return;
        }

        self.positions.record_fill(
            Venue::Polymarket,
            leg_a_arb.side,
            Action::Buy,
            qty_a,
            leg_a_result.fill_price,
            leg_a_params.market_id.clone(),
            record.opportunity.interval_key,
        );
        self.state.add_notional(qty_a * leg_a_result.fill_price);

        let qty_b = qty_a.trunc();
        let leg_b_params = match planner::plan_leg_b(&leg_b_arb, mapping, qty_b) {
            Ok(params) => params,
            Err(err) => {
                warn!(execution_id = %record.id, error = %err, "leg B planning failed, unwinding leg A");
                self.unwind_and_finish(record, &leg_a_exec, mapping, "leg B planning failed")
                    .await;
                return;
            }
        };

        record.status = ExecutionStatus::LegBSubmitting;
        let mut leg_b_exec = planner::to_leg_execution(leg_b_arb.clone(), leg_b_params.clone());
        leg_b_exec.submit_ts = Some(Utc::now());

        match self.submit_leg_b(&leg_b_params).await {
            Some(result) if result.has_fill() => {
                leg_b_exec.fill_ts = result.filled_at;
                leg_b_exec.result = Some(result.clone());
                record.leg_b = Some(leg_b_exec);

                let filled_qty = qty_a.min(result.fill_qty);
                let total_cost = leg_a_result.fill_price * qty_a + result.fill_price * result.fill_qty;
                let expected_pnl = filled_qty - total_cost;

                self.positions.record_fill(
                    Venue::Kalshi,
                    leg_b_arb.side,
                    Action::Buy,
                    result.fill_qty,
                    result.fill_price,
                    leg_b_params.market_id.clone(),
                    record.opportunity.interval_key,
                );
                self.state.add_notional(result.fill_qty * result.fill_price);
                self.state.add_pending_settlement(PendingSettlement {
                    execution_id: record.id,
                    interval_key: record.opportunity.interval_key,
                    settles_at: record.opportunity.interval_key.end_ts,
                    expected_pnl,
                    actual_cost: total_cost,
                    qty: filled_qty,
                    completed_at: Utc::now(),
                });
                record.status = ExecutionStatus::Success;
                info!(execution_id = %record.id, expected_pnl = %expected_pnl, "execution succeeded");
            }
            Some(result) => {
                leg_b_exec.result = Some(result);
                record.leg_b = Some(leg_b_exec);
                warn!(execution_id = %record.id, "leg B had no fill, unwinding leg A");
                self.unwind_and_finish(record, &leg_a_exec, mapping, "leg B had no fill")
                    .await;
            }
            None => {
                record.leg_b = Some(leg_b_exec);
                warn!(execution_id = %record.id, "leg B submission failed or timed out, unwinding leg A");
                self.unwind_and_finish(record, &leg_a_exec, mapping, "leg B submission failed")
                    .await;
            }
        }
    }

    async fn submit_with_timeout(
        &self,
        venue: Venue,
        params: &OrderParams,
    ) -> Result<OrderResult, ExecutionError> {
        let client = self.clients.get(venue);
        let timeout = Duration::from_millis(self.config.leg_order_timeout_ms);
        match tokio::time::timeout(timeout, client.place_order(params)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ExecutionError::Transport("leg order timed out".into())),
        }
    }

    /// Submits Leg B. On a timeout, cancels by client-order-id and checks
    /// order status once before giving up — the synchronous timeout is not
    /// treated as a definitive non-fill until that check also fails.
    async fn submit_leg_b(&self, params: &OrderParams) -> Option<OrderResult> {
        let client = self.clients.get(Venue::Kalshi);
        let timeout = Duration::from_millis(self.config.leg_order_timeout_ms);
        match tokio::time::timeout(timeout, client.place_order(params)).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(err)) => {
                warn!(error = %err, "leg B rejected");
                None
            }
            Err(_) => {
                warn!("leg B timed out, cancelling and verifying order status");
                let _ = client.cancel_order(&params.client_order_id).await;
                match client.get_order_status(&params.client_order_id).await {
                    Ok(snapshot) if snapshot.filled => Some(OrderResult {
                        success: true,
                        order_id: Some(params.client_order_id.clone()),
                        fill_qty: snapshot.fill_qty.unwrap_or(Decimal::ZERO),
                        fill_price: snapshot.fill_price.unwrap_or(Decimal::ZERO),
                        venue: Venue::Kalshi,
                        status: snapshot.status,
                        submitted_at: Utc::now(),
                        filled_at: Some(Utc::now()),
                        error: None,
                    }),
                    Ok(_) => None,
                    Err(err) => {
                        warn!(error = %err, "order status check after leg B timeout failed, treating timeout result as authoritative");
                        None
                    }
                }
            }
        }
    }

    async fn unwind_and_finish(
        &self,
        record: &mut ExecutionRecord,
        filled_leg: &LegExecution,
        mapping: &IntervalMapping,
        reason: &str,
    ) {
        record.status = ExecutionStatus::Unwinding;
        let unwind_record = unwinder::unwind(filled_leg, mapping, &self.clients, &self.config, reason).await;

        let fill_qty = filled_leg.result.as_ref().map_or(Decimal::ZERO, |r| r.fill_qty);
        let fill_price = filled_leg.result.as_ref().map_or(Decimal::ZERO, |r| r.fill_price);
        self.state.remove_notional(fill_qty * fill_price);

        if let Some(result) = &unwind_record.result {
            if result.filled_qty > Decimal::ZERO {
                self.positions.record_fill(
                    filled_leg.leg.venue,
                    filled_leg.leg.side,
                    Action::Sell,
                    result.filled_qty,
                    result.vwap,
                    filled_leg.params.market_id.clone(),
                    record.opportunity.interval_key,
                );
            }
        }

        let realized_loss = unwind_record.realized_loss;
        self.state.record_pnl(-realized_loss, Utc::now());
        let success = unwind_record.result.as_ref().is_some_and(|r| r.success);
        record.realized_pnl = Some(-realized_loss);
        record.unwind = Some(unwind_record);

        if success {
            record.status = ExecutionStatus::Unwound;
            if self.state.get_daily_loss() >= self.config.max_daily_loss() {
                self.state.trigger_kill_switch("Daily loss limit reached");
            }
        } else {
            record.status = ExecutionStatus::Aborted;
            self.state
                .trigger_kill_switch("Unwind failed — unhedged directional exposure");
        }
        self.enter_cooldown();
    }

    fn enter_cooldown(&self) {
        self.state
            .enter_cooldown(Utc::now(), i64::try_from(self.config.cooldown_ms_after_failure).unwrap_or(i64::MAX));
    }
}
