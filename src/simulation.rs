//! The period loop.
//!
//! Period 0 bootstraps the system: the whale opens the anchoring vessel,
//! seeds the stability pool and stakes GRVT. Every later period runs the
//! actions in a fixed order:
//!
//! 1. publish the period's ETH price
//! 2. liquidations
//! 3. closes
//! 4. adjustments
//! 5. opens
//! 6. stability pool update
//! 7. VUSD price stabilizer (issuance / redemption)
//! 8. fee bookkeeping
//! 9. GRVT market
//! 10. global state, CSV row
//!
//! Any failed step aborts the run.

use std::collections::BTreeSet;
use std::io::Write;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::accounts::AccountPool;
use crate::actions;
use crate::config::SimulationConfig;
use crate::contracts::{Address, Contracts};
use crate::error::{Result, SimulationError};
use crate::price_path::generate_price_path;
use crate::report::{log_global_state, CsvRow, SimulationCsv};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarketState {
    pub price_eth: f64,
    pub price_vusd: f64,
    pub price_grvt: f64,
}

/// Cumulative flows. Increments must be non-negative.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RunningTotals {
    pub coll_added: f64,
    pub coll_liquidated: f64,
    pub vusd_redeemed: f64,
}

impl RunningTotals {
    fn bump(total: &mut f64, amount: f64, what: &str, index: usize) -> Result<()> {
        if !(amount.is_finite() && amount >= 0.0) {
            return Err(SimulationError::Invariant {
                index,
                reason: format!("{what} increment {amount} is negative"),
            });
        }
        *total += amount;
        Ok(())
    }

    pub fn add_coll_added(&mut self, amount: f64, index: usize) -> Result<()> {
        Self::bump(&mut self.coll_added, amount, "collateral added", index)
    }

    pub fn add_coll_liquidated(&mut self, amount: f64, index: usize) -> Result<()> {
        Self::bump(&mut self.coll_liquidated, amount, "collateral liquidated", index)
    }

    pub fn add_vusd_redeemed(&mut self, amount: f64, index: usize) -> Result<()> {
        Self::bump(&mut self.vusd_redeemed, amount, "VUSD redeemed", index)
    }
}

/// Per-period series, one slot per period, written in place.
#[derive(Clone, Debug, PartialEq)]
pub struct PeriodData {
    pub airdrop_gain: Vec<f64>,
    pub liquidation_gain: Vec<f64>,
    pub issuance_fee: Vec<f64>,
    pub redemption_fee: Vec<f64>,
}

impl PeriodData {
    pub fn new(n_sim: usize) -> Self {
        Self {
            airdrop_gain: vec![0.0; n_sim],
            liquidation_gain: vec![0.0; n_sim],
            issuance_fee: vec![0.0; n_sim],
            redemption_fee: vec![0.0; n_sim],
        }
    }

    fn window_mean(series: &[&[f64]], index: usize, window: usize) -> f64 {
        let window = window.max(1).min(index + 1);
        let start = index + 1 - window;
        let sum: f64 = series
            .iter()
            .map(|s| s[start..=index].iter().sum::<f64>())
            .sum();
        sum / window as f64
    }

    /// Mean stability pool gain per period over the trailing window.
    pub fn stability_gains(&self, index: usize, window: usize) -> f64 {
        Self::window_mean(&[&self.airdrop_gain, &self.liquidation_gain], index, window)
    }

    /// Mean protocol fee revenue per period over the trailing window.
    pub fn fee_earnings(&self, index: usize, window: usize) -> f64 {
        Self::window_mean(&[&self.issuance_fee, &self.redemption_fee], index, window)
    }
}

/// Everything the actions read and mutate, passed explicitly.
pub struct SimulationContext {
    pub config: SimulationConfig,
    pub contracts: Contracts,
    pub accounts: AccountPool,
    pub whale: Address,
    pub rng: ChaCha8Rng,
    pub market: MarketState,
    pub totals: RunningTotals,
    pub data: PeriodData,
    pub index: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub periods: usize,
    pub final_price_eth: f64,
    pub final_price_vusd: f64,
    pub final_price_grvt: f64,
    pub num_vessels: usize,
    pub tcr: f64,
    pub totals: RunningTotals,
}

impl RunSummary {
    /// Share of all collateral ever added that ended up liquidated.
    pub fn liquidated_ratio(&self) -> f64 {
        if self.totals.coll_added > 0.0 {
            self.totals.coll_liquidated / self.totals.coll_added
        } else {
            0.0
        }
    }

    pub fn print(&self) {
        println!("  Periods:                 {}", self.periods);
        println!("  Final ETH price:         ${:.2}", self.final_price_eth);
        println!("  Final VUSD price:        ${:.4}", self.final_price_vusd);
        println!("  Final GRVT price:        ${:.4}", self.final_price_grvt);
        println!("  Open vessels:            {}", self.num_vessels);
        println!("  TCR:                     {:.2}%", self.tcr * 100.0);
        println!("  Collateral added:        {:.2} ETH", self.totals.coll_added);
        println!("  Collateral liquidated:   {:.2} ETH", self.totals.coll_liquidated);
        println!("  Liquidated share:        {:.2}%", self.liquidated_ratio() * 100.0);
        println!("  VUSD redeemed:           {:.2}", self.totals.vusd_redeemed);
    }
}

pub struct Simulation {
    ctx: SimulationContext,
    prices: Vec<f64>,
    universe: BTreeSet<Address>,
    periods_run: usize,
}

impl Simulation {
    /// Validates the configuration, generates the price path and deploys a
    /// wired contract set. The whale (account 0) is the deployer.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let prices = generate_price_path(
            &config.price_path,
            config.n_sim,
            config.periods_per_year,
            &mut rng,
        )?;

        let whale = Address::account(0);
        let mut contracts = Contracts::deploy(whale, config.protocol.clone());
        contracts.set_addresses(whale)?;
        contracts
            .wallets
            .credit(whale, config.whale.coll + config.account_eth);

        let universe: BTreeSet<Address> = (1..=config.accounts).map(Address::account).collect();
        for account in &universe {
            contracts.wallets.credit(*account, config.account_eth);
        }
        let accounts = AccountPool::new(universe.iter().copied());

        let market = MarketState {
            price_eth: prices[0],
            price_vusd: 1.0,
            price_grvt: config.market.price_grvt_initial,
        };
        let data = PeriodData::new(config.n_sim);

        info!(
            n_sim = config.n_sim,
            seed = config.seed,
            accounts = config.accounts,
            model = config.price_path.model.name(),
            "simulation initialized"
        );

        Ok(Self {
            ctx: SimulationContext {
                config,
                contracts,
                accounts,
                whale,
                rng,
                market,
                totals: RunningTotals::default(),
                data,
                index: 0,
            },
            prices,
            universe,
            periods_run: 0,
        })
    }

    pub fn context(&self) -> &SimulationContext {
        &self.ctx
    }

    pub fn into_context(self) -> SimulationContext {
        self.ctx
    }

    pub fn prices(&self) -> &[f64] {
        &self.prices
    }

    fn row(&self) -> CsvRow {
        CsvRow {
            iteration: self.ctx.index,
            price_vusd: self.ctx.market.price_vusd,
            price_grvt: self.ctx.market.price_grvt,
            state: log_global_state(&self.ctx.contracts),
            totals: self.ctx.totals,
        }
    }

    /// Period 0.
    pub fn bootstrap(&mut self) -> Result<CsvRow> {
        let ctx = &mut self.ctx;
        let whale = ctx.whale;
        let w = ctx.config.whale.clone();
        ctx.index = 0;

        ctx.contracts.price_feed.set_price(self.prices[0])?;
        ctx.contracts
            .open_vessel(whale, ctx.config.vessels.max_fee, w.debt, w.coll)?;
        if w.stability_initial > 0.0 {
            ctx.contracts.provide_to_stability_pool(whale, w.stability_initial)?;
        }
        if w.grvt_stake > 0.0 {
            ctx.contracts.stake_grvt(whale, w.grvt_stake)?;
        }
        ctx.totals.add_coll_added(w.coll, 0)?;

        self.periods_run = 1;
        let row = self.row();
        row.log();
        Ok(row)
    }

    /// Runs period `index` (1-based) and returns its CSV row.
    pub fn run_period(&mut self, index: usize) -> Result<CsvRow> {
        let previous = self.ctx.totals;
        let ctx = &mut self.ctx;
        ctx.index = index;

        // 1
        let price_eth = self.prices[index];
        let period_seconds = ctx.config.period_seconds;
        ctx.contracts.advance_time(period_seconds);
        ctx.contracts.price_feed.set_price(price_eth)?;
        ctx.market.price_eth = price_eth;

        // 2-5
        let liquidation = actions::liquidate_vessels(ctx)?;
        ctx.totals
            .add_coll_liquidated(liquidation.coll_liquidated, index)?;
        let closed = actions::close_vessels(ctx)?;
        let adjusted = actions::adjust_vessels(ctx)?;
        ctx.totals.add_coll_added(adjusted.coll_added, index)?;
        let opened = actions::open_vessels(ctx)?;
        ctx.totals.add_coll_added(opened.coll_added, index)?;

        // 6-7
        let stability = actions::stability_update(ctx, liquidation.stability_return)?;
        let stabilizer = actions::price_stabilizer(ctx)?;
        ctx.totals.add_vusd_redeemed(stabilizer.vusd_redeemed, index)?;

        // 8
        ctx.data.issuance_fee[index] = stabilizer.price_vusd
            * (adjusted.borrowing_fees + opened.borrowing_fees + stabilizer.borrowing_fees);
        ctx.data.redemption_fee[index] = stabilizer.redemption_fee;

        // 9
        let grvt = actions::grvt_market(ctx)?;

        debug!(
            index,
            liquidated = liquidation.liquidated,
            closed = closed.closed,
            adjusted = adjusted.adjusted,
            opened = opened.opened,
            sp_deposited = stability.deposited,
            sp_withdrawn = stability.withdrawn,
            redeemed = stabilizer.vusd_redeemed,
            issued = adjusted.vusd_issued + opened.vusd_issued + stabilizer.vusd_issued,
            grvt_market_cap = grvt.market_cap,
            "period actions done"
        );

        // 10
        if !(stabilizer.price_vusd > 0.0) {
            return Err(SimulationError::Invariant {
                index,
                reason: format!("VUSD price {} is not positive", stabilizer.price_vusd),
            });
        }
        self.check_invariants(&previous, index)?;
        self.periods_run = index + 1;
        let row = self.row();
        row.log();
        Ok(row)
    }

    fn check_invariants(&self, previous: &RunningTotals, index: usize) -> Result<()> {
        self.ctx.accounts.check_partition(&self.universe, index)?;
        let t = &self.ctx.totals;
        if t.coll_added < previous.coll_added
            || t.coll_liquidated < previous.coll_liquidated
            || t.vusd_redeemed < previous.vusd_redeemed
        {
            return Err(SimulationError::Invariant {
                index,
                reason: "running totals decreased".to_string(),
            });
        }
        Ok(())
    }

    /// Bootstrap plus periods `1..n_sim`, one CSV row each.
    pub fn run<W: Write>(&mut self, csv: &mut SimulationCsv<W>) -> Result<RunSummary> {
        let row = self.bootstrap()?;
        csv.write_row(&row)?;
        for index in 1..self.ctx.config.n_sim {
            let row = self.run_period(index)?;
            csv.write_row(&row)?;
        }
        Ok(self.summary())
    }

    /// `run` writing to the configured output path.
    pub fn run_to_file(&mut self) -> Result<RunSummary> {
        let mut csv = SimulationCsv::create(&self.ctx.config.output)?;
        let summary = self.run(&mut csv)?;
        info!(
            path = %self.ctx.config.output.display(),
            rows = csv.rows(),
            "simulation written"
        );
        Ok(summary)
    }

    pub fn summary(&self) -> RunSummary {
        let contracts = &self.ctx.contracts;
        let price = contracts.get_price();
        RunSummary {
            periods: self.periods_run,
            final_price_eth: self.ctx.market.price_eth,
            final_price_vusd: self.ctx.market.price_vusd,
            final_price_grvt: self.ctx.market.price_grvt,
            num_vessels: contracts.vessel_manager.get_vessel_owners_count(),
            tcr: contracts.get_tcr(price),
            totals: self.ctx.totals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_path::PricePathConfig;

    fn config(prices: Vec<f64>) -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.n_sim = prices.len();
        config.accounts = 20;
        config.price_path = PricePathConfig::fixed(prices);
        config
    }

    #[test]
    fn test_totals_reject_negative_increments() {
        let mut t = RunningTotals::default();
        t.add_coll_added(5.0, 1).unwrap();
        assert!(matches!(
            t.add_coll_added(-1.0, 2),
            Err(SimulationError::Invariant { index: 2, .. })
        ));
        assert_eq!(t.coll_added, 5.0);
    }

    #[test]
    fn test_window_mean_clips_at_start() {
        let mut data = PeriodData::new(5);
        data.issuance_fee = vec![0.0, 2.0, 4.0, 6.0, 8.0];
        data.redemption_fee[4] = 2.0;
        assert_eq!(data.fee_earnings(1, 10), 1.0);
        assert_eq!(data.fee_earnings(4, 2), 8.0);
    }

    #[test]
    fn test_bootstrap_opens_whale_vessel() {
        let mut sim = Simulation::new(config(vec![2000.0, 2000.0])).unwrap();
        let row = sim.bootstrap().unwrap();
        assert_eq!(row.iteration, 0);
        assert_eq!(row.state.num_vessels, 1);
        assert_eq!(row.totals.coll_added, 30_000.0);
        assert_eq!(row.state.sp_vusd, 1_000_000.0);
    }

    #[test]
    fn test_run_period_publishes_price() {
        let mut sim = Simulation::new(config(vec![2000.0, 1900.0, 2100.0])).unwrap();
        sim.bootstrap().unwrap();
        let row = sim.run_period(1).unwrap();
        assert_eq!(row.state.price_eth, 1900.0);
        assert!(row.price_vusd > 0.0);
        assert!(row.state.num_vessels >= 1);
        assert_eq!(sim.context().contracts.now(), 3600);
    }

    #[test]
    fn test_same_seed_same_run() {
        let mut cfg = SimulationConfig::default();
        cfg.n_sim = 30;
        cfg.accounts = 30;
        let run = |cfg: SimulationConfig| {
            let mut sim = Simulation::new(cfg).unwrap();
            let mut csv = SimulationCsv::new(Vec::new()).unwrap();
            sim.run(&mut csv).unwrap();
            String::from_utf8(csv.into_inner()).unwrap()
        };
        assert_eq!(run(cfg.clone()), run(cfg));
    }
}
