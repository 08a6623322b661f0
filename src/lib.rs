//! Gravita Vessel Protocol Simulation Library
//!
//! Monte Carlo simulation of a collateralized-debt stablecoin: borrowers
//! open vessels against ETH to mint VUSD, a stability pool absorbs
//! liquidations, redemptions defend the peg and GRVT captures protocol
//! fees.
//!
//! ## Modules
//!
//! - `contracts`: in-process protocol ledger (vessels, pools, tokens)
//! - `price_path`: exogenous ETH price paths
//! - `accounts`: active/inactive borrower accounts
//! - `actions`: per-period agent behaviour
//! - `simulation`: the period loop
//! - `report`: global state reads, CSV output and summaries
//! - `config`: parameters, JSON and environment overrides
//!
//! ## Usage
//!
//! ```bash
//! # Run the default 720-period simulation
//! cargo run --bin simulate --release
//!
//! # Shorter run with a different seed and price model
//! cargo run --bin simulate --release -- --n-sim 200 --seed 7 --price-model gbm
//! ```

pub mod accounts;
pub mod actions;
pub mod config;
pub mod contracts;
pub mod error;
pub mod price_path;
pub mod report;
pub mod simulation;

pub use config::SimulationConfig;
pub use error::{ProtocolError, Result, SimulationError};
pub use simulation::{RunSummary, Simulation};
