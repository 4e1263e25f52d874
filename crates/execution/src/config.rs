//! Typed configuration surface for the execution pipeline, loaded via
//! `figment` the same way this codebase's `ConfigLoader` assembles
//! `AppConfig` — TOML file merged with environment overrides.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Parses a config string field to `Decimal`, falling back to `default` on
/// a malformed value rather than panicking at call time — malformed config
/// is caught once at startup by [`ExecutionConfig::validate`].
fn parse_decimal(raw: &str, default: Decimal) -> Decimal {
    raw.parse().unwrap_or(default)
}

/// Full configuration surface for the execution pipeline (§6 of the design).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub min_edge_net: String,
    pub max_notional: String,
    pub max_daily_loss: String,
    pub max_open_orders_per_venue: u32,
    pub cooldown_ms_after_failure: u64,
    pub leg_order_timeout_ms: u64,
    pub min_partial_fill_qty: String,
    pub slippage_buffer_per_leg: String,

    pub unwind_ladder_steps: u32,
    pub unwind_ladder_step_size: String,
    pub unwind_ladder_step_timeout_ms: u64,
    pub unwind_max_total_time_ms: u64,

    pub pre_close_unwind_ms: u64,
    pub pre_close_retain_pct: String,

    pub volatility_exit_enabled: bool,
    pub volatility_exit_window_ms: u64,
    pub volatility_halt_window_ms: u64,
    pub volatility_exit_crossing_threshold: u32,
    pub volatility_exit_range_threshold_min_usd: String,
    pub volatility_exit_range_threshold_max_usd: String,
    pub volatility_exit_patient_threshold_ms: u64,
    pub volatility_exit_breakeven_threshold_ms: u64,
    pub volatility_exit_min_profit_per_share: String,
    pub volatility_exit_sell_price_offset: String,
    pub volatility_exit_failed_trigger_cooldown_ms: u64,

    pub liquidator_max_retries: u32,
    pub liquidator_retry_base_delay_ms: u64,
    pub liquidator_retry_max_delay_ms: u64,
    pub liquidator_overshoot_cap_pct: String,

    #[serde(default = "default_true")]
    pub dry_run: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_edge_net: "0.01".into(),
            max_notional: "5000".into(),
            max_daily_loss: "250".into(),
            max_open_orders_per_venue: 10,
            cooldown_ms_after_failure: 30_000,
            leg_order_timeout_ms: 5_000,
            min_partial_fill_qty: "1".into(),
            slippage_buffer_per_leg: "0.01".into(),

            unwind_ladder_steps: 5,
            unwind_ladder_step_size: "0.01".into(),
            unwind_ladder_step_timeout_ms: 1_500,
            unwind_max_total_time_ms: 15_000,

            pre_close_unwind_ms: 10_000,
            pre_close_retain_pct: "0.05".into(),

            volatility_exit_enabled: true,
            volatility_exit_window_ms: 450_000,
            volatility_halt_window_ms: 30_000,
            volatility_exit_crossing_threshold: 4,
            volatility_exit_range_threshold_min_usd: "40".into(),
            volatility_exit_range_threshold_max_usd: "500".into(),
            volatility_exit_patient_threshold_ms: 120_000,
            volatility_exit_breakeven_threshold_ms: 60_000,
            volatility_exit_min_profit_per_share: "0.02".into(),
            volatility_exit_sell_price_offset: "0.01".into(),
            volatility_exit_failed_trigger_cooldown_ms: 20_000,

            liquidator_max_retries: 10,
            liquidator_retry_base_delay_ms: 5_000,
            liquidator_retry_max_delay_ms: 30_000,
            liquidator_overshoot_cap_pct: "1.1".into(),

            dry_run: true,
        }
    }
}

impl ExecutionConfig {
    /// Small, tight limits suitable for a first live run with real money.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_notional: "500".into(),
            max_daily_loss: "25".into(),
            unwind_ladder_steps: 3,
            liquidator_max_retries: 5,
            dry_run: false,
            ..Self::default()
        }
    }

    /// Paper/dry-run sizing for local iteration.
    #[must_use]
    pub fn micro_testing() -> Self {
        Self {
            max_notional: "50".into(),
            max_daily_loss: "5".into(),
            dry_run: true,
            ..Self::default()
        }
    }

    /// Fails loudly at startup if any decimal-shaped field cannot parse,
    /// rather than silently falling back at first use.
    ///
    /// # Errors
    /// Returns an error naming the first field that fails to parse.
    pub fn validate(&self) -> anyhow::Result<()> {
        let fields: &[(&str, &str)] = &[
            ("min_edge_net", &self.min_edge_net),
            ("max_notional", &self.max_notional),
            ("max_daily_loss", &self.max_daily_loss),
            ("min_partial_fill_qty", &self.min_partial_fill_qty),
            ("slippage_buffer_per_leg", &self.slippage_buffer_per_leg),
            ("unwind_ladder_step_size", &self.unwind_ladder_step_size),
            ("pre_close_retain_pct", &self.pre_close_retain_pct),
            (
                "volatility_exit_range_threshold_min_usd",
                &self.volatility_exit_range_threshold_min_usd,
            ),
            (
                "volatility_exit_range_threshold_max_usd",
                &self.volatility_exit_range_threshold_max_usd,
            ),
            (
                "volatility_exit_min_profit_per_share",
                &self.volatility_exit_min_profit_per_share,
            ),
            (
                "volatility_exit_sell_price_offset",
                &self.volatility_exit_sell_price_offset,
            ),
            (
                "liquidator_overshoot_cap_pct",
                &self.liquidator_overshoot_cap_pct,
            ),
        ];
        for (name, raw) in fields {
            raw.parse::<Decimal>()
                .map_err(|e| anyhow::anyhow!("config field `{name}` = {raw:?} is not a valid decimal: {e}"))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn min_edge_net(&self) -> Decimal {
        parse_decimal(&self.min_edge_net, Decimal::new(1, 2))
    }

    #[must_use]
    pub fn max_notional(&self) -> Decimal {
        parse_decimal(&self.max_notional, Decimal::new(5000, 0))
    }

    #[must_use]
    pub fn max_daily_loss(&self) -> Decimal {
        parse_decimal(&self.max_daily_loss, Decimal::new(250, 0))
    }

    #[must_use]
    pub fn min_partial_fill_qty(&self) -> Decimal {
        parse_decimal(&self.min_partial_fill_qty, Decimal::ONE)
    }

    #[must_use]
    pub fn slippage_buffer_per_leg(&self) -> Decimal {
        parse_decimal(&self.slippage_buffer_per_leg, Decimal::new(1, 2))
    }

    #[must_use]
    pub fn unwind_ladder_step_size(&self) -> Decimal {
        parse_decimal(&self.unwind_ladder_step_size, Decimal::new(1, 2))
    }

    #[must_use]
    pub fn pre_close_retain_pct(&self) -> Decimal {
        parse_decimal(&self.pre_close_retain_pct, Decimal::new(5, 2))
    }

    #[must_use]
    pub fn volatility_exit_range_threshold_min_usd(&self) -> Decimal {
        parse_decimal(&self.volatility_exit_range_threshold_min_usd, Decimal::new(40, 0))
    }

    #[must_use]
    pub fn volatility_exit_range_threshold_max_usd(&self) -> Decimal {
        parse_decimal(&self.volatility_exit_range_threshold_max_usd, Decimal::new(500, 0))
    }

    #[must_use]
    pub fn volatility_exit_min_profit_per_share(&self) -> Decimal {
        parse_decimal(&self.volatility_exit_min_profit_per_share, Decimal::new(2, 2))
    }

    #[must_use]
    pub fn volatility_exit_sell_price_offset(&self) -> Decimal {
        parse_decimal(&self.volatility_exit_sell_price_offset, Decimal::new(1, 2))
    }

    #[must_use]
    pub fn liquidator_overshoot_cap_pct(&self) -> Decimal {
        parse_decimal(&self.liquidator_overshoot_cap_pct, Decimal::new(11, 1))
    }
}

/// Loads [`ExecutionConfig`] from `config/Execution.toml` overlaid with
/// `EXEC_`-prefixed environment variables, mirroring this codebase's
/// existing `ConfigLoader` for `AppConfig`.
pub struct ExecutionConfigLoader;

impl ExecutionConfigLoader {
    /// # Errors
    /// Returns an error if the configuration file or environment overrides
    /// cannot be parsed into [`ExecutionConfig`].
    pub fn load() -> anyhow::Result<ExecutionConfig> {
        let config: ExecutionConfig = Figment::from(figment::providers::Serialized::defaults(
            ExecutionConfig::default(),
        ))
        .merge(Toml::file("config/Execution.toml"))
        .merge(Env::prefixed("EXEC_"))
        .extract()?;

        Ok(config)
    }
}
