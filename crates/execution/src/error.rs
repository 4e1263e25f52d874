//! Error types for the execution pipeline.
//!
//! Every module-level error (guard rejection, planner misuse, unwind
//! exhaustion, liquidation failure) rolls up into [`ExecutionError`] so
//! callers at the top of the pipeline have one error type to match on.

use thiserror::Error;

use crate::types::Venue;

/// Errors produced while evaluating risk guards.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("edge_net {actual} below minimum {required}")]
    EdgeTooThin { actual: String, required: String },

    #[error("notional headroom {headroom} below minimum tradeable size {minimum}")]
    InsufficientNotionalHeadroom { headroom: String, minimum: String },

    #[error("position imbalance |{total_yes} - {total_no}| exceeds epsilon")]
    PositionImbalance { total_yes: String, total_no: String },

    #[error("mapping does not cover interval {interval_start}")]
    MappingMismatch { interval_start: i64 },

    #[error("too many open orders on {venue}: {count} >= {limit}")]
    TooManyOpenOrders {
        venue: Venue,
        count: u32,
        limit: u32,
    },

    #[error("forced liquidation is in progress")]
    LiquidationInProgress,
}

/// Errors produced by the order planner.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlannerError {
    #[error("interval mapping has no market id for {venue} side {side:?}")]
    MissingMarketId { venue: Venue, side: crate::types::Side },
}

/// Errors produced during unwind (ladder + market fallback).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnwinderError {
    #[error("unwind exhausted: {remaining_qty} still unfilled after ladder and market fallback")]
    Exhausted { remaining_qty: String },
}

/// Errors produced by the forced liquidator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LiquidatorError {
    #[error("liquidation exceeded overshoot cap: sold {sold} against target {target}")]
    OvershootCapExceeded { sold: String, target: String },

    #[error("liquidation exhausted retries for {venue} {side:?}, {remaining} unsold")]
    RetriesExhausted {
        venue: Venue,
        side: crate::types::Side,
        remaining: String,
    },
}

/// Transient vs. permanent classification of a venue-reported failure.
///
/// Permanent failures (insufficient balance, market/trading closed, expired
/// event) disable retries for that `(venue, side)` pair until the next
/// interval; everything else is treated as transient and bounded-retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Permanent,
    Transient,
}

const PERMANENT_MARKERS: &[&str] = &[
    "insufficient_balance",
    "insufficient balance",
    "market_closed",
    "trading_closed",
    "event_expired",
];

/// Classifies a raw venue error string.
///
/// This is the one place in the crate allowed to string-match on error text
/// (per the venue-client contract, some failures only arrive as free text);
/// every other call site consumes the typed [`ErrorClass`] this returns,
/// never the raw string.
#[must_use]
pub fn classify_error_text(text: &str) -> ErrorClass {
    let lower = text.to_ascii_lowercase();
    if PERMANENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Transient
    }
}

/// Unified error type for the execution pipeline's public entry points.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("guard rejected: {0}")]
    Guard(#[from] GuardError),

    #[error("planner error: {0}")]
    Planner(#[from] PlannerError),

    #[error("unwind error: {0}")]
    Unwind(#[from] UnwinderError),

    #[error("liquidator error: {0}")]
    Liquidator(#[from] LiquidatorError),

    #[error("kill switch triggered: {0}")]
    KillSwitchTriggered(String),

    #[error("execution already in progress")]
    Busy,

    #[error("in cooldown after a recent failure")]
    Cooldown,

    #[error("venue transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
