//! GRVT staking (the protocol fee sink) and community issuance.

use std::collections::BTreeMap;

use tracing::debug;

use super::{require_non_negative, require_positive, Address, Contracts, Links};
use crate::config::ProtocolParams;
use crate::error::ProtocolError;

#[derive(Clone, Debug, Default, PartialEq)]
struct Stake {
    amount: f64,
    f_eth_snapshot: f64,
    f_vusd_snapshot: f64,
}

/// Redemption fees (ETH) and borrowing fees (VUSD) accrue to GRVT stakers
/// pro rata through the running sums `f_eth` and `f_vusd`.
#[derive(Clone, Debug)]
pub struct GrvtStaking {
    pub address: Address,
    pub links: Links,
    stakes: BTreeMap<Address, Stake>,
    total_staked: f64,
    f_eth: f64,
    f_vusd: f64,
    eth: f64,
}

impl GrvtStaking {
    pub fn new(address: Address, owner: Address) -> Self {
        Self {
            address,
            links: Links::new("GRVTStaking", owner),
            stakes: BTreeMap::new(),
            total_staked: 0.0,
            f_eth: 0.0,
            f_vusd: 0.0,
            eth: 0.0,
        }
    }

    pub fn get_total_staked(&self) -> f64 {
        self.total_staked
    }

    pub fn get_stake(&self, staker: Address) -> f64 {
        self.stakes.get(&staker).map_or(0.0, |s| s.amount)
    }

    pub fn get_eth(&self) -> f64 {
        self.eth
    }

    pub fn get_pending_eth_gain(&self, staker: Address) -> f64 {
        self.stakes
            .get(&staker)
            .map_or(0.0, |s| s.amount * (self.f_eth - s.f_eth_snapshot))
    }

    pub fn get_pending_vusd_gain(&self, staker: Address) -> f64 {
        self.stakes
            .get(&staker)
            .map_or(0.0, |s| s.amount * (self.f_vusd - s.f_vusd_snapshot))
    }

    pub fn increase_f_eth(&mut self, caller: Address, fee: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        require_non_negative(fee)?;
        self.eth += fee;
        if self.total_staked > 0.0 {
            self.f_eth += fee / self.total_staked;
        }
        Ok(())
    }

    pub fn increase_f_vusd(&mut self, caller: Address, fee: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        require_non_negative(fee)?;
        if self.total_staked > 0.0 {
            self.f_vusd += fee / self.total_staked;
        }
        Ok(())
    }

    fn update_snapshots(&mut self, staker: Address) {
        let (f_eth, f_vusd) = (self.f_eth, self.f_vusd);
        let s = self.stakes.entry(staker).or_default();
        s.f_eth_snapshot = f_eth;
        s.f_vusd_snapshot = f_vusd;
    }
}

/// Releases the community GRVT allocation to the stability pool on a
/// yearly halving schedule: after `t` minutes the cumulative issuance is
/// `cap * (1 - factor^t)`.
#[derive(Clone, Debug)]
pub struct CommunityIssuance {
    pub address: Address,
    pub links: Links,
    supply_cap: f64,
    factor_per_minute: f64,
    deployment_time: u64,
    total_issued: f64,
}

impl CommunityIssuance {
    pub fn new(address: Address, owner: Address, params: &ProtocolParams, deployment_time: u64) -> Self {
        Self {
            address,
            links: Links::new("CommunityIssuance", owner),
            supply_cap: params.community_issuance_cap,
            factor_per_minute: params.issuance_factor_per_minute(),
            deployment_time,
            total_issued: 0.0,
        }
    }

    pub fn get_total_issued(&self) -> f64 {
        self.total_issued
    }

    fn cumulative_fraction(&self, now: u64) -> f64 {
        let minutes = (now.saturating_sub(self.deployment_time) / 60) as f64;
        1.0 - self.factor_per_minute.powf(minutes)
    }

    /// Stability pool only. Returns the GRVT newly issued since the last call.
    pub fn issue_grvt(&mut self, caller: Address, now: u64) -> Result<f64, ProtocolError> {
        self.links.require_caller(caller)?;
        let cumulative = self.supply_cap * self.cumulative_fraction(now);
        let issued = (cumulative - self.total_issued).max(0.0);
        self.total_issued = cumulative.max(self.total_issued);
        Ok(issued)
    }
}

/// Fee gains paid out on a stake change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StakingGains {
    pub eth: f64,
    pub vusd: f64,
}

impl Contracts {
    fn pay_out_staking_gains(&mut self, staker: Address) -> Result<StakingGains, ProtocolError> {
        let gains = StakingGains {
            eth: self.grvt_staking.get_pending_eth_gain(staker),
            vusd: self.grvt_staking.get_pending_vusd_gain(staker),
        };
        let staking = self.grvt_staking.address;
        if gains.vusd > 0.0 {
            self.vusd_token.transfer(staking, staker, gains.vusd)?;
        }
        if gains.eth > 0.0 {
            self.grvt_staking.eth = (self.grvt_staking.eth - gains.eth).max(0.0);
            self.wallets.credit(staker, gains.eth);
        }
        self.grvt_staking.update_snapshots(staker);
        Ok(gains)
    }

    /// Stakes `amount` GRVT, paying out any fee gains accrued so far.
    pub fn stake_grvt(&mut self, staker: Address, amount: f64) -> Result<StakingGains, ProtocolError> {
        self.grvt_staking.links.require_wired()?;
        require_positive(amount)?;
        if self.grvt_token.balance_of(staker) < amount {
            return Err(ProtocolError::InsufficientBalance {
                account: staker,
                asset: "GRVT",
                needed: amount,
                available: self.grvt_token.balance_of(staker),
            });
        }
        let gains = self.pay_out_staking_gains(staker)?;
        let staking = self.grvt_staking.address;
        self.grvt_token.send_to_staking(staking, staker, amount)?;
        if let Some(s) = self.grvt_staking.stakes.get_mut(&staker) {
            s.amount += amount;
        }
        self.grvt_staking.total_staked += amount;
        debug!(%staker, amount, "GRVT staked");
        Ok(gains)
    }

    /// Unstakes up to `amount` and pays out accrued gains.
    pub fn unstake_grvt(&mut self, staker: Address, amount: f64) -> Result<StakingGains, ProtocolError> {
        self.grvt_staking.links.require_wired()?;
        let staked = self.grvt_staking.get_stake(staker);
        if staked <= 0.0 {
            return Err(ProtocolError::NoStake(staker));
        }
        let gains = self.pay_out_staking_gains(staker)?;
        let withdrawn = amount.max(0.0).min(staked);
        if withdrawn > 0.0 {
            let staking = self.grvt_staking.address;
            self.grvt_token.transfer(staking, staker, withdrawn)?;
            if let Some(s) = self.grvt_staking.stakes.get_mut(&staker) {
                s.amount -= withdrawn;
            }
            self.grvt_staking.total_staked -= withdrawn;
        }
        Ok(gains)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_issuance_halves_yearly() {
        let params = ProtocolParams::default();
        let mut ci = CommunityIssuance::new(Address(1), Address(2), &params, 0);
        ci.links.register(Address(2), &[Address(3)]).unwrap();

        let year = 365 * 24 * 3600;
        let first = ci.issue_grvt(Address(3), year).unwrap();
        assert!((first - params.community_issuance_cap / 2.0).abs() < 1.0);
        let second = ci.issue_grvt(Address(3), 2 * year).unwrap();
        assert!((second - params.community_issuance_cap / 4.0).abs() < 1.0);
        assert_eq!(ci.issue_grvt(Address(3), 2 * year).unwrap(), 0.0);
    }

    #[test]
    fn test_issuance_only_for_stability_pool() {
        let mut ci = CommunityIssuance::new(Address(1), Address(2), &ProtocolParams::default(), 0);
        ci.links.register(Address(2), &[Address(3)]).unwrap();
        assert!(matches!(
            ci.issue_grvt(Address(4), 100),
            Err(ProtocolError::UnauthorizedCaller { .. })
        ));
    }

    #[test]
    fn test_stakers_collect_borrowing_fees() {
        let mut c = wired(1);
        let staker = Address::account(0);
        c.stake_grvt(staker, 1_000.0).unwrap();

        let opened = c.open_vessel(Address::account(1), 1.0, 10_000.0, 10.0).unwrap();
        assert!((c.grvt_staking.get_pending_vusd_gain(staker) - opened.fee).abs() < 1e-9);

        let gains = c.unstake_grvt(staker, 1_000.0).unwrap();
        assert!((gains.vusd - opened.fee).abs() < 1e-9);
        assert!((c.vusd_token.balance_of(staker) - opened.fee).abs() < 1e-9);
        assert_eq!(c.grvt_staking.get_total_staked(), 0.0);
    }
}
