use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use gravita_simulation::contracts::Address;
use gravita_simulation::price_path::{PriceModel, PricePathConfig};
use gravita_simulation::report::CSV_HEADER;
use gravita_simulation::{Simulation, SimulationConfig};

fn read_rows(path: &Path) -> (String, Vec<Vec<String>>) {
    let text = fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    let header = lines.next().unwrap().to_string();
    let rows = lines
        .map(|l| l.split(',').map(str::to_string).collect())
        .collect();
    (header, rows)
}

fn column(name: &str) -> usize {
    CSV_HEADER.iter().position(|h| *h == name).unwrap()
}

fn value(row: &[String], name: &str) -> f64 {
    row[column(name)].parse().unwrap()
}

#[test]
fn test_two_period_whale_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = SimulationConfig::default();
    cfg.n_sim = 2;
    cfg.accounts = 0;
    cfg.price_path = PricePathConfig::fixed(vec![2000.0, 1800.0]);
    cfg.output = dir.path().join("simulation.csv");

    let mut sim = Simulation::new(cfg.clone()).unwrap();
    let summary = sim.run_to_file().unwrap();

    let (header, rows) = read_rows(&cfg.output);
    assert_eq!(header, CSV_HEADER.join(","));
    assert_eq!(rows.len(), 2);
    assert_eq!(value(&rows[1], "ETH_price"), 1800.0);
    assert!(value(&rows[1], "num_vessels") >= 1.0);
    assert!(value(&rows[1], "price_USDV") > 0.0);
    assert_eq!(summary.periods, 2);
}

#[test]
fn test_crash_liquidates_active_vessels() {
    let mut cfg = SimulationConfig::default();
    cfg.n_sim = 3;
    cfg.accounts = 20;
    cfg.market.sd_liquidity = 1e-12;
    cfg.price_path = PricePathConfig::fixed(vec![2000.0, 2000.0, 800.0]);

    let mut sim = Simulation::new(cfg).unwrap();
    sim.bootstrap().unwrap();
    let before = sim.run_period(1).unwrap();
    let opened: Vec<Address> = sim
        .context()
        .accounts
        .active()
        .iter()
        .map(|a| a.address)
        .collect();
    assert!(!opened.is_empty());

    let after = sim.run_period(2).unwrap();
    let accounts = &sim.context().accounts;
    for owner in &opened {
        assert!(accounts.is_inactive(*owner), "{owner} still active");
    }
    assert!(after.totals.coll_liquidated > before.totals.coll_liquidated);
    assert!(after.state.num_vessels >= 1);
}

#[test]
fn test_default_run_invariants() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = SimulationConfig::default();
    cfg.n_sim = 60;
    cfg.accounts = 40;
    cfg.seed = 11;
    cfg.output = dir.path().join("out").join("run.csv");

    let mut sim = Simulation::new(cfg.clone()).unwrap();
    sim.run_to_file().unwrap();

    let (_, rows) = read_rows(&cfg.output);
    assert_eq!(rows.len(), cfg.n_sim);

    let totals = ["total_coll_added", "total_coll_liquidated", "total_USDV_redempted"];
    for (i, pair) in rows.windows(2).enumerate() {
        for name in totals {
            assert!(
                value(&pair[1], name) >= value(&pair[0], name),
                "{name} decreased at row {}",
                i + 1
            );
        }
    }
    for row in &rows {
        assert!(value(row, "price_USDV") > 0.0);
        assert_eq!(row.len(), CSV_HEADER.len());
    }

    let ctx = sim.context();
    let universe: BTreeSet<Address> = (1..=cfg.accounts).map(Address::account).collect();
    ctx.accounts.check_partition(&universe, cfg.n_sim).unwrap();
    assert_eq!(ctx.accounts.len(), cfg.accounts);
    // every active account holds a vessel, plus the whale
    assert_eq!(
        ctx.contracts.vessel_manager.get_vessel_owners_count(),
        ctx.accounts.active_len() + 1
    );
}

#[test]
fn test_full_length_default_runs_complete() {
    let dir = tempfile::tempdir().unwrap();
    let models = [PriceModel::RandomWalk, PriceModel::Gbm, PriceModel::JumpDiffusion];
    for (seed, model) in (1..=3u64).zip(models) {
        let mut cfg = SimulationConfig::default();
        cfg.seed = seed;
        cfg.price_path.model = model;
        cfg.output = dir.path().join(format!("run_{seed}.csv"));

        let mut sim = Simulation::new(cfg.clone()).unwrap();
        let summary = sim
            .run_to_file()
            .unwrap_or_else(|e| panic!("seed {seed} ({}) aborted: {e}", model.name()));
        assert_eq!(summary.periods, cfg.n_sim);

        let (_, rows) = read_rows(&cfg.output);
        assert_eq!(rows.len(), cfg.n_sim);
        let ctx = sim.context();
        let sp = ctx.contracts.stability_pool.address;
        assert!(ctx.contracts.grvt_token.balance_of(sp) >= 0.0);
        assert!(ctx.contracts.stability_pool.get_eth() >= 0.0);
    }
}

#[test]
fn test_wiring_twice_fails_without_side_effects() {
    let mut cfg = SimulationConfig::default();
    cfg.n_sim = 2;
    cfg.accounts = 0;
    let sim = Simulation::new(cfg).unwrap();
    let mut contracts = sim.into_context().contracts;
    let deployer = contracts.deployer;
    let before = contracts.borrower_operations.links.peers().to_vec();

    assert!(contracts.set_addresses(deployer).is_err());
    assert_eq!(contracts.borrower_operations.links.peers(), before.as_slice());
    assert!(contracts.is_wired());
}
