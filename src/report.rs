//! Global state reads, CSV output and console summaries.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::config::SimulationConfig;
use crate::contracts::Contracts;
use crate::error::Result;
use crate::simulation::RunningTotals;

pub const CSV_HEADER: [&str; 15] = [
    "iteration",
    "ETH_price",
    "price_USDV",
    "price_GRVT",
    "num_vessels",
    "total_coll",
    "total_debt",
    "TCR",
    "recovery_mode",
    "last_ICR",
    "SP_USDV",
    "SP_ETH",
    "total_coll_added",
    "total_coll_liquidated",
    "total_USDV_redempted",
];

/// Aggregate protocol state at one point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalState {
    pub price_eth: f64,
    pub num_vessels: usize,
    pub total_coll: f64,
    pub total_debt: f64,
    pub tcr: f64,
    pub recovery_mode: bool,
    /// ICR of the riskiest vessel, 0 when there is none.
    pub last_icr: f64,
    pub sp_vusd: f64,
    pub sp_eth: f64,
}

/// Pure read of the ledger.
pub fn log_global_state(contracts: &Contracts) -> GlobalState {
    let price = contracts.get_price();
    let last_icr = contracts
        .sorted_vessels
        .get_last()
        .and_then(|last| contracts.get_current_icr(last, price))
        .unwrap_or(0.0);

    GlobalState {
        price_eth: price,
        num_vessels: contracts.vessel_manager.get_vessel_owners_count(),
        total_coll: contracts.get_entire_system_coll(),
        total_debt: contracts.get_entire_system_debt(),
        tcr: contracts.get_tcr(price),
        recovery_mode: contracts.check_recovery_mode(price),
        last_icr,
        sp_vusd: contracts.stability_pool.get_total_vusd_deposits(),
        sp_eth: contracts.stability_pool.get_eth(),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CsvRow {
    pub iteration: usize,
    pub price_vusd: f64,
    pub price_grvt: f64,
    pub state: GlobalState,
    pub totals: RunningTotals,
}

impl CsvRow {
    pub fn fields(&self) -> Vec<String> {
        let s = &self.state;
        vec![
            self.iteration.to_string(),
            format!("{:.6}", s.price_eth),
            format!("{:.6}", self.price_vusd),
            format!("{:.6}", self.price_grvt),
            s.num_vessels.to_string(),
            format!("{:.6}", s.total_coll),
            format!("{:.6}", s.total_debt),
            format!("{:.6}", s.tcr),
            s.recovery_mode.to_string(),
            format!("{:.6}", s.last_icr),
            format!("{:.6}", s.sp_vusd),
            format!("{:.6}", s.sp_eth),
            format!("{:.6}", self.totals.coll_added),
            format!("{:.6}", self.totals.coll_liquidated),
            format!("{:.6}", self.totals.vusd_redeemed),
        ]
    }

    pub fn log(&self) {
        let s = &self.state;
        info!(
            iteration = self.iteration,
            eth = s.price_eth,
            vusd = self.price_vusd,
            grvt = self.price_grvt,
            vessels = s.num_vessels,
            tcr = s.tcr,
            recovery_mode = s.recovery_mode,
            sp_vusd = s.sp_vusd,
            "period complete"
        );
    }
}

/// Append-only CSV writer. The header goes out on creation; every row is
/// flushed as soon as it is written, so a failed run keeps its progress.
pub struct SimulationCsv<W: Write> {
    out: W,
    rows: usize,
}

impl SimulationCsv<BufWriter<File>> {
    /// Creates (or truncates) `path`, creating parent directories.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> SimulationCsv<W> {
    pub fn new(mut out: W) -> Result<Self> {
        writeln!(out, "{}", CSV_HEADER.join(","))?;
        out.flush()?;
        Ok(Self { out, rows: 0 })
    }

    pub fn write_row(&mut self, row: &CsvRow) -> Result<()> {
        writeln!(self.out, "{}", row.fields().join(","))?;
        self.out.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

const HOURS_PER_MONTH: i32 = 24 * 30;

/// Analytical expectations of the behavioural distributions.
#[derive(Clone, Debug, PartialEq)]
pub struct Expectations {
    pub grvt_price_one_month: f64,
    pub vessel_coll_mean: f64,
    pub vessel_coll_sd: f64,
    pub target_cr_mean: f64,
    pub target_cr_sd: f64,
    pub inattention_mean: f64,
    pub inattention_sd: f64,
}

impl Expectations {
    pub fn from_config(config: &SimulationConfig) -> Self {
        let v = &config.vessels;
        let m = &config.market;
        Self {
            grvt_price_one_month: m.price_grvt_initial * (1.0 + m.drift_grvt).powi(HOURS_PER_MONTH),
            vessel_coll_mean: v.collateral_gamma_k * v.collateral_gamma_theta,
            vessel_coll_sd: v.collateral_gamma_k.sqrt() * v.collateral_gamma_theta,
            target_cr_mean: v.target_cr_a + v.target_cr_b * v.target_cr_chi_square_df,
            target_cr_sd: v.target_cr_b * (2.0 * v.target_cr_chi_square_df).sqrt(),
            inattention_mean: v.rational_inattention_gamma_k * v.rational_inattention_gamma_theta,
            inattention_sd: v.rational_inattention_gamma_k.sqrt()
                * v.rational_inattention_gamma_theta,
        }
    }

    pub fn print(&self) {
        println!("Expectations:");
        println!("  GRVT price after one month:     ${:.4}", self.grvt_price_one_month);
        println!(
            "  Vessel collateral:              {:.2} ETH (sd {:.2})",
            self.vessel_coll_mean, self.vessel_coll_sd
        );
        println!(
            "  Target CR:                      {:.2}% (sd {:.2}%)",
            self.target_cr_mean * 100.0,
            self.target_cr_sd * 100.0
        );
        println!(
            "  Rational inattention:           {:.2}% (sd {:.2}%)",
            self.inattention_mean * 100.0,
            self.inattention_sd * 100.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{Address, Contracts};
    use crate::config::ProtocolParams;

    fn row(iteration: usize) -> CsvRow {
        CsvRow {
            iteration,
            price_vusd: 1.0,
            price_grvt: 0.4,
            state: GlobalState {
                price_eth: 2000.0,
                num_vessels: 1,
                total_coll: 10.0,
                total_debt: 5000.0,
                tcr: 4.0,
                recovery_mode: false,
                last_icr: 4.0,
                sp_vusd: 0.0,
                sp_eth: 0.0,
            },
            totals: RunningTotals::default(),
        }
    }

    #[test]
    fn test_header_and_rows() {
        let mut csv = SimulationCsv::new(Vec::new()).unwrap();
        csv.write_row(&row(0)).unwrap();
        csv.write_row(&row(1)).unwrap();
        assert_eq!(csv.rows(), 2);

        let text = String::from_utf8(csv.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("iteration,ETH_price,price_USDV"));
        assert!(lines[2].starts_with("1,2000.000000,1.000000,0.400000,1,"));
        assert_eq!(lines[1].split(',').count(), CSV_HEADER.len());
    }

    #[test]
    fn test_create_makes_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.csv");
        SimulationCsv::create(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn test_empty_ledger_state() {
        let mut c = Contracts::deploy(Address::account(0), ProtocolParams::default());
        c.price_feed.set_price(1500.0).unwrap();
        let state = log_global_state(&c);
        assert_eq!(state.num_vessels, 0);
        assert_eq!(state.last_icr, 0.0);
        assert_eq!(state.tcr, f64::INFINITY);
        assert!(!state.recovery_mode);
    }

    #[test]
    fn test_expectations() {
        let e = Expectations::from_config(&SimulationConfig::default());
        assert!((e.vessel_coll_mean - 5.0).abs() < 1e-12);
        assert!((e.target_cr_mean - 1.58).abs() < 1e-12);
        assert!(e.grvt_price_one_month > 0.4);
    }

    #[test]
    fn test_one_month_grvt_expectation_ignores_warmup() {
        let mut cfg = SimulationConfig::default();
        let full = Expectations::from_config(&cfg).grvt_price_one_month;
        cfg.market.grvt_warmup = 10;
        let e = Expectations::from_config(&cfg);
        assert_eq!(e.grvt_price_one_month, full);
        let expected = 0.4 * 1.0035_f64.powi(720);
        assert!((full - expected).abs() < 1e-9);
    }
}
