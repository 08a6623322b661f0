//! Stability pool: VUSD deposits that absorb liquidated debt in exchange
//! for the liquidated collateral, plus GRVT community issuance.
//!
//! Depositor balances are tracked exactly. Every offset scales each
//! deposit down by the same fraction and credits collateral in proportion
//! to the deposit it replaced.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{require_positive, Address, Contracts, Links};
use crate::error::ProtocolError;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Deposit {
    pub vusd: f64,
    pub eth_gain: f64,
    pub grvt_gain: f64,
}

#[derive(Clone, Debug)]
pub struct StabilityPool {
    pub address: Address,
    pub links: Links,
    deposits: BTreeMap<Address, Deposit>,
    total_vusd: f64,
    eth: f64,
}

impl StabilityPool {
    pub fn new(address: Address, owner: Address) -> Self {
        Self {
            address,
            links: Links::new("StabilityPool", owner),
            deposits: BTreeMap::new(),
            total_vusd: 0.0,
            eth: 0.0,
        }
    }

    pub fn get_total_vusd_deposits(&self) -> f64 {
        self.total_vusd
    }

    pub fn get_eth(&self) -> f64 {
        self.eth
    }

    pub fn get_deposit(&self, depositor: Address) -> Option<&Deposit> {
        self.deposits.get(&depositor)
    }

    pub fn get_compounded_vusd_deposit(&self, depositor: Address) -> f64 {
        self.deposits.get(&depositor).map_or(0.0, |d| d.vusd)
    }

    pub fn get_depositor_eth_gain(&self, depositor: Address) -> f64 {
        self.deposits.get(&depositor).map_or(0.0, |d| d.eth_gain)
    }

    pub fn get_depositor_grvt_gain(&self, depositor: Address) -> f64 {
        self.deposits.get(&depositor).map_or(0.0, |d| d.grvt_gain)
    }

    /// Depositors with a non-zero balance, in address order.
    pub fn depositors(&self) -> impl Iterator<Item = Address> + '_ {
        self.deposits
            .iter()
            .filter(|(_, d)| d.vusd > 0.0)
            .map(|(a, _)| *a)
    }

    pub fn receive_coll(&mut self, caller: Address, amount: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        self.eth += amount;
        Ok(())
    }

    /// Cancels `debt` against deposits and credits `coll` as gains.
    fn absorb(&mut self, debt: f64, coll: f64) {
        if self.total_vusd <= 0.0 {
            return;
        }
        let loss_fraction = (debt / self.total_vusd).min(1.0);
        let coll_per_unit = coll / self.total_vusd;
        for d in self.deposits.values_mut() {
            d.eth_gain += d.vusd * coll_per_unit;
            d.vusd -= d.vusd * loss_fraction;
        }
        self.sync_total();
    }

    /// Keeps the pool total equal to the sum of the deposits it pays on.
    fn sync_total(&mut self) {
        self.total_vusd = self.deposits.values().map(|d| d.vusd.max(0.0)).sum();
    }

    fn distribute_grvt(&mut self, amount: f64) {
        if self.total_vusd <= 0.0 {
            return;
        }
        let per_unit = amount / self.total_vusd;
        for d in self.deposits.values_mut() {
            d.grvt_gain += d.vusd * per_unit;
        }
    }

    /// Removes and returns the depositor's pending gains. The ETH gain
    /// never exceeds what the pool holds.
    fn take_gains(&mut self, depositor: Address) -> (f64, f64) {
        match self.deposits.get_mut(&depositor) {
            Some(d) => {
                let eth = d.eth_gain.min(self.eth).max(0.0);
                let grvt = d.grvt_gain;
                d.eth_gain = 0.0;
                d.grvt_gain = 0.0;
                self.eth -= eth;
                (eth, grvt)
            }
            None => (0.0, 0.0),
        }
    }
}

/// Gains paid out when a deposit changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DepositChange {
    pub vusd: f64,
    pub eth_gain: f64,
    pub grvt_gain: f64,
}

impl Contracts {
    /// Burns `debt` VUSD held by the pool and moves `coll` from the active
    /// pool into it.
    pub(super) fn offset_in_stability_pool(&mut self, debt: f64, coll: f64) -> Result<(), ProtocolError> {
        let sp = self.stability_pool.address;
        let vm = self.vessel_manager.address;
        self.stability_pool.absorb(debt, coll);
        self.active_pool.decrease_debt(sp, debt)?;
        self.vusd_token.burn(sp, sp, debt)?;
        let moved = self.active_pool.send_coll(vm, coll)?;
        self.stability_pool
            .receive_coll(self.active_pool.address, moved)
    }

    /// Releases GRVT accrued since the last trigger to depositors. Nothing
    /// is issued while the pool is empty.
    pub fn trigger_grvt_issuance(&mut self) -> Result<f64, ProtocolError> {
        self.stability_pool.links.require_wired()?;
        if self.stability_pool.get_total_vusd_deposits() <= 0.0 {
            return Ok(0.0);
        }
        let sp = self.stability_pool.address;
        let now = self.now();
        let issued = self.community_issuance.issue_grvt(sp, now)?;
        if issued > 0.0 {
            self.grvt_token
                .transfer(self.community_issuance.address, sp, issued)?;
            self.stability_pool.distribute_grvt(issued);
            debug!(issued, "GRVT issued to stability pool");
        }
        Ok(issued)
    }

    fn pay_out_deposit_gains(&mut self, depositor: Address) -> Result<(f64, f64), ProtocolError> {
        let (eth, grvt) = self.stability_pool.take_gains(depositor);
        let sp = self.stability_pool.address;
        let grvt = grvt.min(self.grvt_token.balance_of(sp));
        if eth > 0.0 {
            self.wallets.credit(depositor, eth);
        }
        if grvt > 0.0 {
            self.grvt_token.transfer(sp, depositor, grvt)?;
        }
        Ok((eth, grvt))
    }

    pub fn provide_to_stability_pool(
        &mut self,
        depositor: Address,
        amount: f64,
    ) -> Result<DepositChange, ProtocolError> {
        self.stability_pool.links.require_wired()?;
        require_positive(amount)?;
        self.vusd_token.require_balance(depositor, amount)?;

        self.trigger_grvt_issuance()?;
        let (eth_gain, grvt_gain) = self.pay_out_deposit_gains(depositor)?;
        let sp = self.stability_pool.address;
        self.vusd_token.send_to_pool(sp, depositor, sp, amount)?;
        let pool = &mut self.stability_pool;
        pool.deposits.entry(depositor).or_default().vusd += amount;
        pool.sync_total();

        debug!(%depositor, amount, eth_gain, "stability pool deposit");
        Ok(DepositChange {
            vusd: amount,
            eth_gain,
            grvt_gain,
        })
    }

    /// Withdraws up to `amount` (capped at the compounded deposit) and pays
    /// out pending gains.
    pub fn withdraw_from_stability_pool(
        &mut self,
        depositor: Address,
        amount: f64,
    ) -> Result<DepositChange, ProtocolError> {
        self.stability_pool.links.require_wired()?;
        let deposit = self.stability_pool.get_compounded_vusd_deposit(depositor);
        if deposit <= 0.0 {
            return Err(ProtocolError::NoDeposit(depositor));
        }
        let price = self.get_price();
        if amount > 0.0 {
            if let Some(last) = self.sorted_vessels.get_last() {
                let icr = self.get_current_icr(last, price).unwrap_or(f64::INFINITY);
                if icr < self.params.mcr {
                    return Err(ProtocolError::UndercollateralizedVessels);
                }
            }
        }

        self.trigger_grvt_issuance()?;
        let (eth_gain, grvt_gain) = self.pay_out_deposit_gains(depositor)?;
        let withdrawn = amount.max(0.0).min(deposit);
        if withdrawn > 0.0 {
            let sp = self.stability_pool.address;
            self.vusd_token.return_from_pool(sp, sp, depositor, withdrawn)?;
            let pool = &mut self.stability_pool;
            if let Some(d) = pool.deposits.get_mut(&depositor) {
                d.vusd = (d.vusd - withdrawn).max(0.0);
            }
            pool.sync_total();
        }

        info!(%depositor, withdrawn, eth_gain, grvt_gain, "stability pool withdrawal");
        Ok(DepositChange {
            vusd: withdrawn,
            eth_gain,
            grvt_gain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn account(i: usize) -> Address {
        Address::account(i)
    }

    #[test]
    fn test_absorb_is_proportional() {
        let mut sp = StabilityPool::new(Address(1), Address(2));
        sp.deposits.insert(Address(10), Deposit { vusd: 300.0, ..Deposit::default() });
        sp.deposits.insert(Address(11), Deposit { vusd: 100.0, ..Deposit::default() });
        sp.total_vusd = 400.0;

        sp.absorb(200.0, 1.0);
        assert_eq!(sp.get_compounded_vusd_deposit(Address(10)), 150.0);
        assert_eq!(sp.get_compounded_vusd_deposit(Address(11)), 50.0);
        assert!((sp.get_depositor_eth_gain(Address(10)) - 0.75).abs() < 1e-12);
        assert_eq!(sp.get_total_vusd_deposits(), 200.0);
    }

    #[test]
    fn test_deposit_and_withdraw() {
        let mut c = with_whale(0);
        c.provide_to_stability_pool(account(0), 1_000.0).unwrap();
        assert_eq!(c.stability_pool.get_total_vusd_deposits(), 1_000.0);
        assert_eq!(c.vusd_token.balance_of(c.stability_pool.address), 1_000.0);

        let out = c.withdraw_from_stability_pool(account(0), 5_000.0).unwrap();
        assert_eq!(out.vusd, 1_000.0);
        assert_eq!(c.stability_pool.get_total_vusd_deposits(), 0.0);
        assert!(matches!(
            c.withdraw_from_stability_pool(account(0), 1.0),
            Err(ProtocolError::NoDeposit(_))
        ));
    }

    #[test]
    fn test_liquidation_gain_paid_on_withdrawal() {
        let mut c = with_whale(2);
        c.provide_to_stability_pool(account(0), 100_000.0).unwrap();
        c.open_vessel(account(1), 1.0, 10_000.0, 6.04).unwrap();
        c.price_feed.set_price(1500.0).unwrap();
        let out = c.liquidate(account(2), account(1)).unwrap();

        let eth_before = c.wallets.balance(account(0));
        let change = c.withdraw_from_stability_pool(account(0), 0.0).unwrap();
        assert!((change.eth_gain - out.coll_to_sp).abs() < 1e-9);
        assert!((c.wallets.balance(account(0)) - eth_before - out.coll_to_sp).abs() < 1e-9);
        assert!(c.stability_pool.get_eth().abs() < 1e-9);
    }

    #[test]
    fn test_grvt_issuance_accrues_over_time() {
        let mut c = with_whale(0);
        c.provide_to_stability_pool(account(0), 1_000.0).unwrap();
        c.advance_time(30 * 24 * 3600);
        let issued = c.trigger_grvt_issuance().unwrap();
        assert!(issued > 0.0);
        assert!((c.stability_pool.get_depositor_grvt_gain(account(0)) - issued).abs() < 1e-6);
    }

    #[test]
    fn test_total_tracks_deposits_after_offsets() {
        let mut c = with_whale(3);
        c.provide_to_stability_pool(account(0), 300_000.0).unwrap();
        c.open_vessel(account(1), 1.0, 10_000.0, 6.04).unwrap();
        c.open_vessel(account(2), 1.0, 7_000.0, 4.3).unwrap();
        c.vusd_token.transfer(account(0), account(3), 1_000.0).unwrap();
        c.provide_to_stability_pool(account(3), 1_000.0).unwrap();

        c.price_feed.set_price(1500.0).unwrap();
        c.liquidate(account(0), account(1)).unwrap();
        c.liquidate(account(0), account(2)).unwrap();

        let sum: f64 = c
            .stability_pool
            .depositors()
            .map(|d| c.stability_pool.get_compounded_vusd_deposit(d))
            .sum();
        assert_eq!(c.stability_pool.get_total_vusd_deposits(), sum);
    }

    #[test]
    fn test_payouts_never_exceed_pool_holdings() {
        let mut c = with_whale(1);
        c.vusd_token.transfer(account(0), account(1), 3_000.0).unwrap();
        c.provide_to_stability_pool(account(0), 7_000.0).unwrap();
        c.provide_to_stability_pool(account(1), 3_000.0).unwrap();
        // credited gains slightly above what the pool holds
        c.stability_pool.total_vusd *= 1.0 - 1e-9;
        c.stability_pool.eth = 1.0;
        for d in c.stability_pool.deposits.values_mut() {
            d.eth_gain = 0.75;
        }
        c.advance_time(7 * 24 * 3600);
        c.trigger_grvt_issuance().unwrap();

        let sp = c.stability_pool.address;
        let first = c.withdraw_from_stability_pool(account(0), 7_000.0).unwrap();
        let second = c.withdraw_from_stability_pool(account(1), 3_000.0).unwrap();
        assert!((first.eth_gain + second.eth_gain - 1.0).abs() < 1e-12);
        assert!(c.stability_pool.get_eth() >= 0.0);
        assert!(c.grvt_token.balance_of(sp) >= 0.0);
        assert!(second.grvt_gain > 0.0);
    }
}
