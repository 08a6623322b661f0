//! In-process protocol ledger.
//!
//! Stands in for the deployed contract set: one struct per contract, each
//! with its own address and collaborator registry. Cross-contract flows
//! (borrowing, liquidation, redemption, stability pool deposits) are
//! methods on [`Contracts`], which owns every instance. Amounts are plain
//! `f64` token units (1.0 = one ETH / VUSD / GRVT).
//!
//! ## Lifecycle
//! 1. [`Contracts::deploy`] constructs everything, owned by the deployer.
//! 2. [`Contracts::set_addresses`] registers collaborators once and
//!    renounces ownership; a second call fails with `NotOwner`.
//! 3. Protocol calls reject unwired contracts (`NotWired`) and check
//!    privileged callers against the registry (`UnauthorizedCaller`).
//!
//! Flows validate before they mutate, so a rejected call leaves balances
//! as they were.

mod borrower_operations;
mod pools;
mod price_feed;
mod sorted_vessels;
mod stability_pool;
mod staking;
mod tokens;
mod vessel_manager;

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::config::ProtocolParams;
use crate::error::ProtocolError;

pub use borrower_operations::{BorrowerOperations, OpenedVessel, VesselAdjustment};
pub use pools::{ActivePool, CollSurplusPool, DefaultPool, GasPool};
pub use price_feed::PriceFeedTestnet;
pub use sorted_vessels::{HintHelpers, RedemptionHints, SortedVessels};
pub use stability_pool::{Deposit, DepositChange, StabilityPool};
pub use staking::{CommunityIssuance, GrvtStaking, StakingGains};
pub use tokens::{GrvtToken, VusdToken};
pub use vessel_manager::{
    compute_cr, compute_nominal_cr, EntireVessel, LiquidationOutcome, RedemptionOutcome, Vessel,
    VesselManager, VesselStatus,
};

const CONTRACT_ADDRESS_BASE: u64 = 0x1000_0000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u64);

impl Address {
    /// Externally owned account number `i`.
    pub fn account(i: usize) -> Self {
        Address(i as u64 + 1)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:040x}", self.0)
    }
}

/// Collaborator registry of one contract.
#[derive(Clone, Debug)]
pub struct Links {
    contract: &'static str,
    owner: Option<Address>,
    peers: Vec<Address>,
}

impl Links {
    pub fn new(contract: &'static str, owner: Address) -> Self {
        Self {
            contract,
            owner: Some(owner),
            peers: Vec::new(),
        }
    }

    /// Registry fixed at construction time; no owner to renounce.
    pub fn constructed(contract: &'static str, peers: Vec<Address>) -> Self {
        Self {
            contract,
            owner: None,
            peers,
        }
    }

    /// Owner-only, one shot: ownership is renounced on success.
    pub fn register(&mut self, caller: Address, peers: &[Address]) -> Result<(), ProtocolError> {
        if self.owner != Some(caller) {
            return Err(ProtocolError::NotOwner {
                contract: self.contract,
                caller,
            });
        }
        self.peers = peers.to_vec();
        self.owner = None;
        debug!(contract = self.contract, peers = peers.len(), "collaborators registered");
        Ok(())
    }

    pub fn require_wired(&self) -> Result<(), ProtocolError> {
        if self.peers.is_empty() {
            return Err(ProtocolError::NotWired {
                contract: self.contract,
            });
        }
        Ok(())
    }

    pub fn require_caller(&self, caller: Address) -> Result<(), ProtocolError> {
        self.require_wired()?;
        if !self.peers.contains(&caller) {
            return Err(ProtocolError::UnauthorizedCaller {
                contract: self.contract,
                caller,
            });
        }
        Ok(())
    }

    pub fn peers(&self) -> &[Address] {
        &self.peers
    }

    pub fn owner(&self) -> Option<Address> {
        self.owner
    }
}

/// Native ETH balances of externally owned accounts.
#[derive(Clone, Debug, Default)]
pub struct Wallets {
    balances: BTreeMap<Address, f64>,
}

impl Wallets {
    pub fn balance(&self, account: Address) -> f64 {
        self.balances.get(&account).copied().unwrap_or(0.0)
    }

    pub fn credit(&mut self, account: Address, amount: f64) {
        *self.balances.entry(account).or_insert(0.0) += amount;
    }

    pub fn require_balance(&self, account: Address, amount: f64) -> Result<(), ProtocolError> {
        let available = self.balance(account);
        if available < amount {
            return Err(ProtocolError::InsufficientBalance {
                account,
                asset: "ETH",
                needed: amount,
                available,
            });
        }
        Ok(())
    }

    pub fn debit(&mut self, account: Address, amount: f64) -> Result<(), ProtocolError> {
        self.require_balance(account, amount)?;
        *self.balances.entry(account).or_insert(0.0) -= amount;
        Ok(())
    }
}

pub(crate) fn require_positive(amount: f64) -> Result<(), ProtocolError> {
    if !(amount.is_finite() && amount > 0.0) {
        return Err(ProtocolError::InvalidAmount(amount));
    }
    Ok(())
}

pub(crate) fn require_non_negative(amount: f64) -> Result<(), ProtocolError> {
    if !(amount.is_finite() && amount >= 0.0) {
        return Err(ProtocolError::InvalidAmount(amount));
    }
    Ok(())
}

struct Deployer {
    next: u64,
}

impl Deployer {
    fn next_address(&mut self) -> Address {
        let address = Address(CONTRACT_ADDRESS_BASE + self.next);
        self.next += 1;
        address
    }
}

/// The full contract set, one typed field per contract.
#[derive(Clone, Debug)]
pub struct Contracts {
    pub deployer: Address,
    pub params: ProtocolParams,
    pub price_feed: PriceFeedTestnet,
    pub sorted_vessels: SortedVessels,
    pub vessel_manager: VesselManager,
    pub active_pool: ActivePool,
    pub stability_pool: StabilityPool,
    pub gas_pool: GasPool,
    pub default_pool: DefaultPool,
    pub coll_surplus_pool: CollSurplusPool,
    pub borrower_operations: BorrowerOperations,
    pub hint_helpers: HintHelpers,
    pub vusd_token: VusdToken,
    pub grvt_staking: GrvtStaking,
    pub community_issuance: CommunityIssuance,
    pub grvt_token: GrvtToken,
    pub wallets: Wallets,
    now: u64,
}

impl Contracts {
    /// Deploys every contract from `deployer`. Tokens receive their
    /// collaborators through constructor arguments; everything else waits
    /// for [`Contracts::set_addresses`].
    pub fn deploy(deployer: Address, params: ProtocolParams) -> Self {
        let mut d = Deployer { next: 0 };

        let price_feed = PriceFeedTestnet::new(d.next_address());
        let sorted_vessels = SortedVessels::new(d.next_address(), deployer);
        let vessel_manager = VesselManager::new(d.next_address(), deployer, params.clone());
        let active_pool = ActivePool::new(d.next_address(), deployer);
        let stability_pool = StabilityPool::new(d.next_address(), deployer);
        let gas_pool = GasPool::new(d.next_address());
        let default_pool = DefaultPool::new(d.next_address(), deployer);
        let coll_surplus_pool = CollSurplusPool::new(d.next_address(), deployer);
        let borrower_operations = BorrowerOperations::new(d.next_address(), deployer);
        let hint_helpers = HintHelpers::new(d.next_address(), deployer);
        let vusd_token = VusdToken::new(
            d.next_address(),
            vessel_manager.address,
            stability_pool.address,
            borrower_operations.address,
        );
        let grvt_staking = GrvtStaking::new(d.next_address(), deployer);
        let community_issuance = CommunityIssuance::new(d.next_address(), deployer, &params, 0);
        let grvt_token = GrvtToken::new(
            d.next_address(),
            community_issuance.address,
            grvt_staking.address,
            deployer, // bounty
            deployer, // lp rewards
            deployer, // multisig
            &params,
        );

        debug!(%deployer, contracts = d.next, "contracts deployed");

        Self {
            deployer,
            params,
            price_feed,
            sorted_vessels,
            vessel_manager,
            active_pool,
            stability_pool,
            gas_pool,
            default_pool,
            coll_surplus_pool,
            borrower_operations,
            hint_helpers,
            vusd_token,
            grvt_staking,
            community_issuance,
            grvt_token,
            wallets: Wallets::default(),
            now: 0,
        }
    }

    /// One-time cross registration. Every call is owner-only and renounces
    /// ownership, so invoking this twice fails on the first contract and
    /// changes nothing.
    pub fn set_addresses(&mut self, caller: Address) -> Result<(), ProtocolError> {
        let bo = self.borrower_operations.address;
        let vm = self.vessel_manager.address;
        let ap = self.active_pool.address;
        let dp = self.default_pool.address;
        let sp = self.stability_pool.address;
        let gas = self.gas_pool.address;
        let csp = self.coll_surplus_pool.address;
        let feed = self.price_feed.address;
        let vusd = self.vusd_token.address;
        let sorted = self.sorted_vessels.address;
        let grvt = self.grvt_token.address;
        let staking = self.grvt_staking.address;
        let issuance = self.community_issuance.address;

        let max_size = self.params.sorted_vessels_max_size;
        self.sorted_vessels.set_params(caller, max_size, vm, bo)?;
        self.vessel_manager.links.register(
            caller,
            &[bo, ap, dp, sp, gas, csp, feed, vusd, sorted, grvt, staking],
        )?;
        self.borrower_operations.links.register(
            caller,
            &[vm, ap, dp, sp, gas, csp, feed, sorted, vusd, staking],
        )?;
        self.stability_pool
            .links
            .register(caller, &[bo, vm, ap, vusd, sorted, feed, issuance])?;
        self.active_pool.links.register(caller, &[bo, vm, sp, dp])?;
        self.default_pool.links.register(caller, &[vm, ap])?;
        self.coll_surplus_pool.links.register(caller, &[bo, vm, ap])?;
        self.hint_helpers.links.register(caller, &[sorted, vm])?;
        self.grvt_staking
            .links
            .register(caller, &[grvt, vusd, vm, bo, ap])?;
        self.community_issuance.links.register(caller, &[grvt, sp])?;

        debug!("collaborator registration complete");
        Ok(())
    }

    pub fn is_wired(&self) -> bool {
        self.vessel_manager.links.require_wired().is_ok()
            && self.borrower_operations.links.require_wired().is_ok()
            && self.stability_pool.links.require_wired().is_ok()
    }

    /// Seconds of protocol time since deployment.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn advance_time(&mut self, seconds: u64) {
        self.now += seconds;
    }

    pub fn get_price(&self) -> f64 {
        self.price_feed.get_price()
    }

    pub fn get_entire_system_coll(&self) -> f64 {
        self.active_pool.get_coll() + self.default_pool.get_coll()
    }

    pub fn get_entire_system_debt(&self) -> f64 {
        self.active_pool.get_debt() + self.default_pool.get_debt()
    }

    pub fn get_tcr(&self, price: f64) -> f64 {
        let debt = self.get_entire_system_debt();
        if debt <= 0.0 {
            return f64::INFINITY;
        }
        self.get_entire_system_coll() * price / debt
    }

    pub fn check_recovery_mode(&self, price: f64) -> bool {
        self.get_tcr(price) < self.params.ccr
    }

    /// TCR after applying the given collateral and debt deltas.
    pub fn new_tcr(&self, coll_delta: f64, debt_delta: f64, price: f64) -> f64 {
        let debt = self.get_entire_system_debt() + debt_delta;
        if debt <= 0.0 {
            return f64::INFINITY;
        }
        (self.get_entire_system_coll() + coll_delta) * price / debt
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub const PRICE: f64 = 2000.0;

    /// Deployed, wired, priced at 2000 and with funded accounts 1..=n.
    pub fn wired(n_accounts: usize) -> Contracts {
        let deployer = Address::account(0);
        let mut c = Contracts::deploy(deployer, ProtocolParams::default());
        c.set_addresses(deployer).unwrap();
        c.price_feed.set_price(PRICE).unwrap();
        for i in 0..=n_accounts {
            c.wallets.credit(Address::account(i), 1_000_000.0);
        }
        c
    }

    /// `wired` plus a large deployer vessel anchoring the system.
    pub fn with_whale(n_accounts: usize) -> Contracts {
        let mut c = wired(n_accounts);
        c.open_vessel(Address::account(0), 1.0, 1_000_000.0, 10_000.0)
            .unwrap();
        c
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_unwired_contracts_reject_calls() {
        let deployer = Address::account(0);
        let mut c = Contracts::deploy(deployer, ProtocolParams::default());
        c.price_feed.set_price(PRICE).unwrap();
        c.wallets.credit(deployer, 100.0);

        let err = c.open_vessel(deployer, 1.0, 2000.0, 10.0).unwrap_err();
        assert!(matches!(err, ProtocolError::NotWired { .. }));
    }

    #[test]
    fn test_second_wiring_fails_cleanly() {
        let deployer = Address::account(0);
        let mut c = Contracts::deploy(deployer, ProtocolParams::default());
        c.set_addresses(deployer).unwrap();
        let peers_before = c.vessel_manager.links.peers().to_vec();

        let err = c.set_addresses(deployer).unwrap_err();
        assert!(matches!(err, ProtocolError::NotOwner { .. }));
        assert_eq!(c.vessel_manager.links.peers(), peers_before.as_slice());
        assert_eq!(c.active_pool.links.peers().len(), 4);
        assert!(c.is_wired());
    }

    #[test]
    fn test_only_deployer_can_wire() {
        let mut c = Contracts::deploy(Address::account(0), ProtocolParams::default());
        let err = c.set_addresses(Address::account(5)).unwrap_err();
        assert!(matches!(err, ProtocolError::NotOwner { .. }));
        assert!(!c.is_wired());
    }

    #[test]
    fn test_pools_reject_outside_callers() {
        let mut c = wired(1);
        let err = c
            .active_pool
            .increase_debt(Address::account(1), 10.0)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnauthorizedCaller { .. }));
    }

    #[test]
    fn test_recovery_mode_follows_tcr() {
        let mut c = with_whale(0);
        assert!(!c.check_recovery_mode(PRICE));
        // 10_000 ETH against ~1_005_200 VUSD: TCR < 1.5 once ETH < ~150.8
        c.price_feed.set_price(140.0).unwrap();
        assert!(c.check_recovery_mode(c.get_price()));
    }
}
