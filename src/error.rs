use thiserror::Error;

use crate::contracts::Address;

/// Reasons a protocol call is rejected. A rejected call leaves the ledger
/// untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("{contract}: caller {caller} is not the owner")]
    NotOwner {
        contract: &'static str,
        caller: Address,
    },

    #[error("{contract}: collaborator addresses not set")]
    NotWired { contract: &'static str },

    #[error("{contract}: caller {caller} is not authorized")]
    UnauthorizedCaller {
        contract: &'static str,
        caller: Address,
    },

    #[error("vessel of {0} is already active")]
    VesselActive(Address),

    #[error("vessel of {0} does not exist or is closed")]
    VesselNotActive(Address),

    #[error("net debt {net_debt:.2} is below the minimum {min:.2}")]
    DebtBelowMinimum { net_debt: f64, min: f64 },

    #[error("ICR {icr:.4} is below the minimum collateral ratio")]
    IcrBelowMcr { icr: f64 },

    #[error("ICR {icr:.4} is below the critical collateral ratio in recovery mode")]
    IcrBelowCcr { icr: f64 },

    #[error("operation would push TCR to {tcr:.4}, below the critical collateral ratio")]
    TcrBelowCcr { tcr: f64 },

    #[error("operation not permitted during recovery mode")]
    RecoveryMode,

    #[error("fee rate {rate:.4} exceeds the accepted maximum {max:.4}")]
    FeeExceedsMax { rate: f64, max: f64 },

    #[error("{account} has {available:.4} {asset}, needs {needed:.4}")]
    InsufficientBalance {
        account: Address,
        asset: &'static str,
        needed: f64,
        available: f64,
    },

    #[error("only one vessel in the system")]
    OnlyOneVessel,

    #[error("nothing to liquidate")]
    NothingToLiquidate,

    #[error("unable to redeem any amount")]
    UnableToRedeem,

    #[error("amount must be positive and finite, got {0}")]
    InvalidAmount(f64),

    #[error("price must be positive and finite, got {0}")]
    InvalidPrice(f64),

    #[error("sorted vessel list is full")]
    ListFull,

    #[error("no collateral available to claim for {0}")]
    NothingToClaim(Address),

    #[error("recovery mode: ICR {new:.4} must not fall below {old:.4}")]
    IcrNotImproved { old: f64, new: f64 },

    #[error("{0} has no stability pool deposit")]
    NoDeposit(Address),

    #[error("{0} has no GRVT staked")]
    NoStake(Address),

    #[error("cannot withdraw while undercollateralized vessels exist")]
    UndercollateralizedVessels,
}

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("protocol call reverted: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid distribution parameters: {0}")]
    Distribution(String),

    #[error("invariant violated at period {index}: {reason}")]
    Invariant { index: usize, reason: String },
}

pub type Result<T, E = SimulationError> = std::result::Result<T, E>;
