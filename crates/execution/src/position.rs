//! Position tracker: per-venue/per-side net quantity and entry VWAP,
//! keyed so positions remain actionable across interval rollovers.

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::types::{Action, IntervalKey, Side, Venue};

#[derive(Debug, Clone, Default)]
struct Ledger {
    quantity: Decimal,
    cost_basis: Decimal,
    market_id: Option<String>,
}

impl Ledger {
    fn vwap(&self) -> Decimal {
        if self.quantity.is_zero() {
            Decimal::ZERO
        } else {
            self.cost_basis / self.quantity
        }
    }
}

/// Net quantity and entry VWAP per `(venue, side)`, with a best-effort
/// per-interval ledger for post-rollover recovery.
///
/// Invariant: quantity is never negative; a `Sell` beyond the held quantity
/// clamps at zero rather than going short (this pipeline never shorts).
pub struct PositionTracker {
    ledgers: RwLock<HashMap<(Venue, Side), Ledger>>,
    interval_ledgers: RwLock<HashMap<(Venue, Side, i64), Ledger>>,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
            interval_ledgers: RwLock::new(HashMap::new()),
        }
    }

    /// Records a fill. `Buy` increases quantity and cost basis; `Sell`
    /// decreases quantity (clamped at zero) and reduces cost basis
    /// proportionally so VWAP of the remainder is unchanged.
    pub fn record_fill(
        &self,
        venue: Venue,
        side: Side,
        action: Action,
        qty: Decimal,
        price: Decimal,
        market_id: impl Into<String>,
        interval_key: IntervalKey,
    ) {
        let market_id = market_id.into();
        self.apply(
            &mut self.ledgers.write(),
            (venue, side),
            action,
            qty,
            price,
            market_id.clone(),
        );
        self.apply(
            &mut self.interval_ledgers.write(),
            (venue, side, interval_key.start_ts),
            action,
            qty,
            price,
            market_id,
        );
    }

    fn apply<K: std::hash::Hash + Eq + Copy>(
        &self,
        map: &mut HashMap<K, Ledger>,
        key: K,
        action: Action,
        qty: Decimal,
        price: Decimal,
        market_id: String,
    ) {
        let ledger = map.entry(key).or_default();
        match action {
            Action::Buy => {
                ledger.quantity += qty;
                ledger.cost_basis += qty * price;
            }
            Action::Sell => {
                let sell_qty = qty.min(ledger.quantity);
                if !ledger.quantity.is_zero() {
                    let fraction = sell_qty / ledger.quantity;
                    ledger.cost_basis -= ledger.cost_basis * fraction;
                }
                ledger.quantity -= sell_qty;
                if ledger.quantity <= Decimal::ZERO {
                    ledger.quantity = Decimal::ZERO;
                    ledger.cost_basis = Decimal::ZERO;
                }
            }
        }
        ledger.market_id = Some(market_id);
    }

    #[must_use]
    pub fn quantity(&self, venue: Venue, side: Side) -> Decimal {
        self.ledgers
            .read()
            .get(&(venue, side))
            .map_or(Decimal::ZERO, |l| l.quantity)
    }

    #[must_use]
    pub fn entry_vwap(&self, venue: Venue, side: Side) -> Decimal {
        self.ledgers
            .read()
            .get(&(venue, side))
            .map_or(Decimal::ZERO, Ledger::vwap)
    }

    #[must_use]
    pub fn market_id(&self, venue: Venue, side: Side) -> Option<String> {
        self.ledgers
            .read()
            .get(&(venue, side))
            .and_then(|l| l.market_id.clone())
    }

    #[must_use]
    pub fn total_yes(&self) -> Decimal {
        self.ledgers
            .read()
            .iter()
            .filter(|((_, side), _)| *side == Side::Yes)
            .map(|(_, l)| l.quantity)
            .sum()
    }

    #[must_use]
    pub fn total_no(&self) -> Decimal {
        self.ledgers
            .read()
            .iter()
            .filter(|((_, side), _)| *side == Side::No)
            .map(|(_, l)| l.quantity)
            .sum()
    }

    #[must_use]
    pub fn imbalance(&self) -> Decimal {
        (self.total_yes() - self.total_no()).abs()
    }

    /// All `(venue, side)` pairs currently holding a non-zero position.
    #[must_use]
    pub fn open_positions(&self) -> Vec<(Venue, Side, Decimal)> {
        self.ledgers
            .read()
            .iter()
            .filter(|(_, l)| l.quantity > Decimal::ZERO)
            .map(|((venue, side), l)| (*venue, *side, l.quantity))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn interval() -> IntervalKey {
        IntervalKey::starting_at(0)
    }

    // ==================== Buy / Sell ====================

    #[test]
    fn buy_then_sell_round_trips_to_zero() {
        let tracker = PositionTracker::new();
        tracker.record_fill(
            Venue::Polymarket,
            Side::Yes,
            Action::Buy,
            dec!(5),
            dec!(0.42),
            "up-token",
            interval(),
        );
        tracker.record_fill(
            Venue::Polymarket,
            Side::Yes,
            Action::Sell,
            dec!(5),
            dec!(0.50),
            "up-token",
            interval(),
        );
        assert_eq!(tracker.quantity(Venue::Polymarket, Side::Yes), Decimal::ZERO);
    }

    #[test]
    fn quantity_never_goes_negative() {
        let tracker = PositionTracker::new();
        tracker.record_fill(
            Venue::Kalshi,
            Side::No,
            Action::Sell,
            dec!(10),
            dec!(0.50),
            "KXBTC-TEST",
            interval(),
        );
        assert_eq!(tracker.quantity(Venue::Kalshi, Side::No), Decimal::ZERO);
    }

    #[test]
    fn vwap_tracks_weighted_average_cost() {
        let tracker = PositionTracker::new();
        tracker.record_fill(
            Venue::Polymarket,
            Side::Yes,
            Action::Buy,
            dec!(3),
            dec!(0.40),
            "up-token",
            interval(),
        );
        tracker.record_fill(
            Venue::Polymarket,
            Side::Yes,
            Action::Buy,
            dec!(2),
            dec!(0.50),
            "up-token",
            interval(),
        );
        // (3*0.40 + 2*0.50) / 5 = 2.2/5 = 0.44
        assert_eq!(tracker.entry_vwap(Venue::Polymarket, Side::Yes), dec!(0.44));
    }

    #[test]
    fn partial_sell_preserves_vwap_of_remainder() {
        let tracker = PositionTracker::new();
        tracker.record_fill(
            Venue::Kalshi,
            Side::No,
            Action::Buy,
            dec!(10),
            dec!(0.56),
            "KXBTC-TEST",
            interval(),
        );
        tracker.record_fill(
            Venue::Kalshi,
            Side::No,
            Action::Sell,
            dec!(4),
            dec!(0.60),
            "KXBTC-TEST",
            interval(),
        );
        assert_eq!(tracker.quantity(Venue::Kalshi, Side::No), dec!(6));
        assert_eq!(tracker.entry_vwap(Venue::Kalshi, Side::No), dec!(0.56));
    }

    // ==================== Imbalance ====================

    #[test]
    fn imbalance_zero_when_hedged() {
        let tracker = PositionTracker::new();
        tracker.record_fill(
            Venue::Polymarket,
            Side::Yes,
            Action::Buy,
            dec!(5),
            dec!(0.42),
            "up-token",
            interval(),
        );
        tracker.record_fill(
            Venue::Kalshi,
            Side::No,
            Action::Buy,
            dec!(5),
            dec!(0.56),
            "KXBTC-TEST",
            interval(),
        );
        assert_eq!(tracker.total_yes(), dec!(5));
        assert_eq!(tracker.total_no(), dec!(5));
        assert_eq!(tracker.imbalance(), Decimal::ZERO);
    }

    #[test]
    fn imbalance_nonzero_after_partial_hedge() {
        let tracker = PositionTracker::new();
        tracker.record_fill(
            Venue::Polymarket,
            Side::Yes,
            Action::Buy,
            dec!(5),
            dec!(0.42),
            "up-token",
            interval(),
        );
        assert_eq!(tracker.imbalance(), dec!(5));
    }

    #[test]
    fn market_id_remembered_for_rollover_recovery() {
        let tracker = PositionTracker::new();
        tracker.record_fill(
            Venue::Kalshi,
            Side::Yes,
            Action::Buy,
            dec!(5),
            dec!(0.55),
            "KXBTC-26JUL28-B100000",
            interval(),
        );
        assert_eq!(
            tracker.market_id(Venue::Kalshi, Side::Yes),
            Some("KXBTC-26JUL28-B100000".to_string())
        );
    }

    #[test]
    fn open_positions_lists_only_nonzero() {
        let tracker = PositionTracker::new();
        tracker.record_fill(
            Venue::Polymarket,
            Side::Yes,
            Action::Buy,
            dec!(5),
            dec!(0.42),
            "up-token",
            interval(),
        );
        tracker.record_fill(
            Venue::Polymarket,
            Side::Yes,
            Action::Sell,
            dec!(5),
            dec!(0.50),
            "up-token",
            interval(),
        );
        tracker.record_fill(
            Venue::Kalshi,
            Side::No,
            Action::Buy,
            dec!(3),
            dec!(0.56),
            "KXBTC-TEST",
            interval(),
        );
        let open = tracker.open_positions();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0], (Venue::Kalshi, Side::No, dec!(3)));
    }
}
