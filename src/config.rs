//! Simulation configuration.
//!
//! Values resolve in this order: built-in defaults, an optional JSON file,
//! `GRAVITA_SIM_*` environment overrides, then CLI flags (applied by the
//! binary). `validate()` runs last.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SimulationError};
use crate::price_path::PricePathConfig;

pub const DEFAULT_OUTPUT: &str = "tests/simulation.csv";

/// Protocol constants the ledger enforces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolParams {
    /// Minimum collateral ratio, below which a vessel is liquidatable.
    pub mcr: f64,
    /// Critical collateral ratio. TCR below this means recovery mode.
    pub ccr: f64,
    /// VUSD reserved per vessel to pay the liquidator.
    pub gas_compensation: f64,
    pub min_net_debt: f64,
    pub borrowing_fee_floor: f64,
    pub max_borrowing_fee: f64,
    pub redemption_fee_floor: f64,
    /// Divisor applied to redeemed supply fraction when bumping the base rate.
    pub beta: f64,
    pub base_rate_half_life_minutes: f64,
    /// Collateral share paid to the liquidator is `1 / divisor`.
    pub coll_gas_comp_divisor: f64,
    pub grvt_total_supply: f64,
    pub community_issuance_cap: f64,
    pub issuance_half_life_years: f64,
    pub bounty_allocation: f64,
    pub lp_rewards_allocation: f64,
    pub sorted_vessels_max_size: usize,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            mcr: 1.1,
            ccr: 1.5,
            gas_compensation: 200.0,
            min_net_debt: 1800.0,
            borrowing_fee_floor: 0.005,
            max_borrowing_fee: 0.05,
            redemption_fee_floor: 0.005,
            beta: 2.0,
            base_rate_half_life_minutes: 720.0,
            coll_gas_comp_divisor: 200.0,
            grvt_total_supply: 100_000_000.0,
            community_issuance_cap: 32_000_000.0,
            issuance_half_life_years: 1.0,
            bounty_allocation: 2_000_000.0,
            lp_rewards_allocation: 1_333_333.33,
            sorted_vessels_max_size: 100_000,
        }
    }
}

impl ProtocolParams {
    /// Per-minute decay applied to the base rate.
    pub fn minute_decay_factor(&self) -> f64 {
        0.5_f64.powf(1.0 / self.base_rate_half_life_minutes)
    }

    /// Per-minute factor by which unissued community GRVT shrinks.
    pub fn issuance_factor_per_minute(&self) -> f64 {
        let minutes_per_year = 365.0 * 24.0 * 60.0;
        0.5_f64.powf(1.0 / (self.issuance_half_life_years * minutes_per_year))
    }
}

/// The account that bootstraps the system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhaleConfig {
    pub coll: f64,
    pub debt: f64,
    pub stability_initial: f64,
    pub grvt_stake: f64,
}

impl Default for WhaleConfig {
    fn default() -> Self {
        Self {
            coll: 30_000.0,
            debt: 10_000_000.0,
            stability_initial: 1_000_000.0,
            grvt_stake: 1_000_000.0,
        }
    }
}

/// Borrower behaviour: how vessels are opened, adjusted and closed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VesselBehaviour {
    pub collateral_gamma_k: f64,
    pub collateral_gamma_theta: f64,
    pub target_cr_a: f64,
    pub target_cr_b: f64,
    pub target_cr_chi_square_df: f64,
    pub rational_inattention_gamma_k: f64,
    pub rational_inattention_gamma_theta: f64,
    /// Vessels opened in the first period.
    pub initial_open: usize,
    pub n_steady: f64,
    pub sd_open: f64,
    /// Extra opens per percentage point VUSD trades above 1 + fee.
    pub beta_open: f64,
    pub close_warmup: usize,
    pub n_close: f64,
    pub sd_close: f64,
    /// Extra closes per percentage point VUSD trades below peg.
    pub beta_close: f64,
    pub max_fee: f64,
}

impl Default for VesselBehaviour {
    fn default() -> Self {
        Self {
            collateral_gamma_k: 10.0,
            collateral_gamma_theta: 0.5,
            target_cr_a: 1.1,
            target_cr_b: 0.03,
            target_cr_chi_square_df: 16.0,
            rational_inattention_gamma_k: 4.0,
            rational_inattention_gamma_theta: 0.08,
            initial_open: 10,
            n_steady: 0.5,
            sd_open: 1.5,
            beta_open: 0.2,
            close_warmup: 240,
            n_close: 0.3,
            sd_close: 0.5,
            beta_close: 0.2,
            max_fee: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Annual return depositors would get elsewhere.
    pub natural_rate: f64,
    pub sd_natural_rate: f64,
    pub sd_stability: f64,
    pub sensitivity: f64,
    /// Cap on the pool as a share of VUSD supply.
    pub max_share: f64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            natural_rate: 0.2,
            sd_natural_rate: 0.002,
            sd_stability: 0.001,
            sensitivity: 0.1,
            max_share: 0.9,
        }
    }
}

/// VUSD liquidity market and GRVT valuation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub sd_liquidity: f64,
    pub liquidity_elasticity: f64,
    pub peg_reversion: f64,
    pub price_ceiling: f64,
    pub price_grvt_initial: f64,
    pub drift_grvt: f64,
    pub sd_grvt: f64,
    pub grvt_warmup: usize,
    pub pe_ratio: f64,
    pub min_grvt_price: f64,
    /// Periods of fee history averaged into annualized earnings.
    pub earning_window: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            sd_liquidity: 0.01,
            liquidity_elasticity: 2.0,
            peg_reversion: 0.1,
            price_ceiling: 1.1,
            price_grvt_initial: 0.4,
            drift_grvt: 0.0035,
            sd_grvt: 0.005,
            grvt_warmup: 480,
            pe_ratio: 50.0,
            min_grvt_price: 0.001,
            earning_window: 24,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of periods, including the bootstrap period 0.
    pub n_sim: usize,
    pub seed: u64,
    /// Borrower accounts besides the whale.
    pub accounts: usize,
    pub account_eth: f64,
    pub period_seconds: u64,
    pub periods_per_year: f64,
    pub output: PathBuf,
    pub price_path: PricePathConfig,
    pub whale: WhaleConfig,
    pub vessels: VesselBehaviour,
    pub stability: StabilityConfig,
    pub market: MarketConfig,
    pub protocol: ProtocolParams,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            n_sim: 720,
            seed: 1,
            accounts: 200,
            account_eth: 100_000.0,
            period_seconds: 3600,
            periods_per_year: 24.0 * 365.0,
            output: PathBuf::from(DEFAULT_OUTPUT),
            price_path: PricePathConfig::default(),
            whale: WhaleConfig::default(),
            vessels: VesselBehaviour::default(),
            stability: StabilityConfig::default(),
            market: MarketConfig::default(),
            protocol: ProtocolParams::default(),
        }
    }
}

impl SimulationConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| SimulationError::Config(format!("{}: {e}", path.display())))
    }

    /// Applies `GRAVITA_SIM_*` overrides. Values that fail to parse are
    /// ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_override::<usize>("GRAVITA_SIM_N_SIM", self.n_sim) {
            self.n_sim = v;
        }
        if let Some(v) = env_override::<u64>("GRAVITA_SIM_SEED", self.seed) {
            self.seed = v;
        }
        if let Some(v) = env_override::<usize>("GRAVITA_SIM_ACCOUNTS", self.accounts) {
            self.accounts = v;
        }
        if let Ok(raw) = env::var("GRAVITA_SIM_OUTPUT") {
            info!(value = %raw, "GRAVITA_SIM_OUTPUT overrode default");
            self.output = PathBuf::from(raw);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(SimulationError::Config(msg.to_string()));

        if self.n_sim < 1 {
            return fail("n_sim must be at least 1");
        }
        if self.period_seconds == 0 || self.periods_per_year <= 0.0 {
            return fail("period length must be positive");
        }
        if !(self.account_eth >= 0.0) {
            return fail("account_eth must be non-negative");
        }
        if self.whale.coll <= 0.0 || self.whale.debt <= 0.0 {
            return fail("whale collateral and debt must be positive");
        }
        if self.whale.stability_initial < 0.0 || self.whale.stability_initial > self.whale.debt {
            return fail("whale stability deposit must lie within its debt");
        }
        let p = &self.protocol;
        if !(p.mcr > 1.0 && p.ccr >= p.mcr) {
            return fail("collateral ratios must satisfy 1 < MCR <= CCR");
        }
        if p.gas_compensation < 0.0 || p.min_net_debt <= 0.0 {
            return fail("gas compensation and minimum net debt must be positive");
        }
        if p.borrowing_fee_floor > p.max_borrowing_fee {
            return fail("borrowing fee floor exceeds its cap");
        }
        if self.market.liquidity_elasticity <= 0.0 || self.market.price_ceiling <= 1.0 {
            return fail("liquidity elasticity must be positive and the price ceiling above 1");
        }
        if self.market.price_grvt_initial <= 0.0 || self.market.min_grvt_price <= 0.0 {
            return fail("GRVT prices must be positive");
        }
        self.price_path.validate(self.n_sim)
    }
}

fn env_override<T>(key: &str, current: T) -> Option<T>
where
    T: std::str::FromStr + std::fmt::Display,
{
    let raw = env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => {
            info!("{key} = {v} (overrode {current})");
            Some(v)
        }
        Err(_) => {
            warn!("could not parse {key} = {raw:?}; keeping {current}");
            None
        }
    }
}
