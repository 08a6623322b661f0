//! Borrower accounts.
//!
//! The account universe is split between accounts holding an open vessel
//! (active) and accounts free to open one (inactive). Every account is in
//! exactly one of the two at all times; moves go through `activate` and
//! `deactivate`.

use std::collections::{BTreeSet, VecDeque};

use crate::contracts::Address;
use crate::error::{Result, SimulationError};

/// How a borrower manages its vessel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VesselProfile {
    /// Collateral ratio the borrower aims for.
    pub cr_initial: f64,
    /// Relative drift from `cr_initial` tolerated before adjusting.
    pub rational_inattention: f64,
}

impl VesselProfile {
    pub fn lower_bound(&self) -> f64 {
        self.cr_initial * (1.0 - self.rational_inattention)
    }

    pub fn upper_bound(&self) -> f64 {
        self.cr_initial * (1.0 + self.rational_inattention)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActiveAccount {
    pub address: Address,
    pub profile: VesselProfile,
}

#[derive(Clone, Debug, Default)]
pub struct AccountPool {
    active: Vec<ActiveAccount>,
    inactive: VecDeque<Address>,
}

impl AccountPool {
    /// All accounts start inactive, in the given order.
    pub fn new(accounts: impl IntoIterator<Item = Address>) -> Self {
        Self {
            active: Vec::new(),
            inactive: accounts.into_iter().collect(),
        }
    }

    pub fn active(&self) -> &[ActiveAccount] {
        &self.active
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn inactive_len(&self) -> usize {
        self.inactive.len()
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.inactive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_active(&self, address: Address) -> bool {
        self.active.iter().any(|a| a.address == address)
    }

    pub fn is_inactive(&self, address: Address) -> bool {
        self.inactive.contains(&address)
    }

    pub fn profile(&self, address: Address) -> Option<VesselProfile> {
        self.active
            .iter()
            .find(|a| a.address == address)
            .map(|a| a.profile)
    }

    /// First available account, if any, without moving it.
    pub fn next_inactive(&self) -> Option<Address> {
        self.inactive.front().copied()
    }

    /// Moves the first inactive account to the active set.
    pub fn activate_next(&mut self, profile: VesselProfile) -> Option<Address> {
        let address = self.inactive.pop_front()?;
        self.active.push(ActiveAccount { address, profile });
        Some(address)
    }

    /// Moves `address` back to the inactive queue. Returns false if it was
    /// not active.
    pub fn deactivate(&mut self, address: Address) -> bool {
        match self.active.iter().position(|a| a.address == address) {
            Some(at) => {
                self.active.remove(at);
                self.inactive.push_back(address);
                true
            }
            None => false,
        }
    }

    /// Checks that active and inactive are disjoint and together contain
    /// exactly `universe`.
    pub fn check_partition(&self, universe: &BTreeSet<Address>, index: usize) -> Result<()> {
        let active: BTreeSet<Address> = self.active.iter().map(|a| a.address).collect();
        let inactive: BTreeSet<Address> = self.inactive.iter().copied().collect();

        let fail = |reason: String| Err(SimulationError::Invariant { index, reason });
        if active.len() != self.active.len() || inactive.len() != self.inactive.len() {
            return fail("duplicate account in a pool".to_string());
        }
        if let Some(a) = active.intersection(&inactive).next() {
            return fail(format!("{a} is both active and inactive"));
        }
        let union: BTreeSet<Address> = active.union(&inactive).copied().collect();
        if &union != universe {
            return fail(format!(
                "account pools cover {} accounts, expected {}",
                union.len(),
                universe.len()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> VesselProfile {
        VesselProfile {
            cr_initial: 1.5,
            rational_inattention: 0.1,
        }
    }

    fn universe(n: usize) -> BTreeSet<Address> {
        (1..=n).map(Address::account).collect()
    }

    #[test]
    fn test_activate_pops_first_inactive() {
        let mut pool = AccountPool::new((1..=3).map(Address::account));
        assert_eq!(pool.activate_next(profile()), Some(Address::account(1)));
        assert_eq!(pool.next_inactive(), Some(Address::account(2)));
        assert!(pool.is_active(Address::account(1)));
        pool.check_partition(&universe(3), 0).unwrap();
    }

    #[test]
    fn test_deactivate_returns_to_back_of_queue() {
        let mut pool = AccountPool::new((1..=2).map(Address::account));
        pool.activate_next(profile());
        assert!(pool.deactivate(Address::account(1)));
        assert!(!pool.deactivate(Address::account(1)));
        assert_eq!(pool.next_inactive(), Some(Address::account(2)));
        assert_eq!(pool.inactive_len(), 2);
        pool.check_partition(&universe(2), 3).unwrap();
    }

    #[test]
    fn test_partition_detects_missing_account() {
        let pool = AccountPool::new((1..=2).map(Address::account));
        let err = pool.check_partition(&universe(3), 5).unwrap_err();
        assert!(matches!(err, SimulationError::Invariant { index: 5, .. }));
    }

    #[test]
    fn test_inattention_band() {
        let p = profile();
        assert!((p.lower_bound() - 1.35).abs() < 1e-12);
        assert!((p.upper_bound() - 1.65).abs() < 1e-12);
    }

    #[test]
    fn test_exhausted_pool() {
        let mut pool = AccountPool::new(std::iter::empty());
        assert!(pool.is_empty());
        assert_eq!(pool.activate_next(profile()), None);
    }
}
