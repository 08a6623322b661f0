//! Vessel bookkeeping, liquidation and redemption.
//!
//! Liquidation offsets a vessel's debt against the stability pool and
//! redistributes what the pool cannot absorb to every other vessel in
//! proportion to its stake (the `l_coll` / `l_debt` running sums). A vessel
//! picks up its share of redistributed collateral and debt the next time it
//! is touched.
//!
//! Redemption walks vessels from the lowest NICR upwards, swapping VUSD for
//! collateral at face value. A vessel that would be left with less than the
//! minimum net debt stops the walk (partial redemption cancelled).

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{require_positive, Address, Contracts, Links};
use crate::config::ProtocolParams;
use crate::error::ProtocolError;

const SECONDS_IN_ONE_MINUTE: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VesselStatus {
    NonExistent,
    Active,
    ClosedByOwner,
    ClosedByLiquidation,
    ClosedByRedemption,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Vessel {
    pub coll: f64,
    pub debt: f64,
    pub stake: f64,
    pub status: VesselStatus,
    snapshot_coll: f64,
    snapshot_debt: f64,
}

/// Collateral and debt including not yet applied redistribution rewards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EntireVessel {
    pub coll: f64,
    pub debt: f64,
    pub pending_coll: f64,
    pub pending_debt: f64,
}

/// Price-independent ordering key.
pub fn compute_nominal_cr(coll: f64, debt: f64) -> f64 {
    if debt > 0.0 {
        coll / debt
    } else {
        f64::INFINITY
    }
}

pub fn compute_cr(coll: f64, debt: f64, price: f64) -> f64 {
    if debt > 0.0 {
        coll * price / debt
    } else {
        f64::INFINITY
    }
}

#[derive(Clone, Debug)]
pub struct VesselManager {
    pub address: Address,
    pub links: Links,
    params: ProtocolParams,
    vessels: BTreeMap<Address, Vessel>,
    owners: Vec<Address>,
    total_stakes: f64,
    total_stakes_snapshot: f64,
    total_coll_snapshot: f64,
    l_coll: f64,
    l_debt: f64,
    base_rate: f64,
    last_fee_operation_time: u64,
}

impl VesselManager {
    pub fn new(address: Address, owner: Address, params: ProtocolParams) -> Self {
        Self {
            address,
            links: Links::new("VesselManager", owner),
            params,
            vessels: BTreeMap::new(),
            owners: Vec::new(),
            total_stakes: 0.0,
            total_stakes_snapshot: 0.0,
            total_coll_snapshot: 0.0,
            l_coll: 0.0,
            l_debt: 0.0,
            base_rate: 0.0,
            last_fee_operation_time: 0,
        }
    }

    pub fn get_vessel(&self, owner: Address) -> Option<&Vessel> {
        self.vessels.get(&owner)
    }

    pub fn get_vessel_status(&self, owner: Address) -> VesselStatus {
        self.vessels
            .get(&owner)
            .map(|v| v.status)
            .unwrap_or(VesselStatus::NonExistent)
    }

    pub fn is_active(&self, owner: Address) -> bool {
        self.get_vessel_status(owner) == VesselStatus::Active
    }

    pub fn get_vessel_owners_count(&self) -> usize {
        self.owners.len()
    }

    pub fn vessel_owners(&self) -> &[Address] {
        &self.owners
    }

    pub fn get_total_stakes(&self) -> f64 {
        self.total_stakes
    }

    pub fn get_base_rate(&self) -> f64 {
        self.base_rate
    }

    pub fn get_pending_rewards(&self, owner: Address) -> (f64, f64) {
        match self.vessels.get(&owner) {
            Some(v) if v.status == VesselStatus::Active => (
                v.stake * (self.l_coll - v.snapshot_coll),
                v.stake * (self.l_debt - v.snapshot_debt),
            ),
            _ => (0.0, 0.0),
        }
    }

    pub fn get_entire_debt_and_coll(&self, owner: Address) -> Option<EntireVessel> {
        let v = self.vessels.get(&owner)?;
        if v.status != VesselStatus::Active {
            return None;
        }
        let (pending_coll, pending_debt) = self.get_pending_rewards(owner);
        Some(EntireVessel {
            coll: v.coll + pending_coll,
            debt: v.debt + pending_debt,
            pending_coll,
            pending_debt,
        })
    }

    /// ICR including pending rewards; `None` for inactive vessels.
    pub fn get_current_icr(&self, owner: Address, price: f64) -> Option<f64> {
        self.get_entire_debt_and_coll(owner)
            .map(|v| compute_cr(v.coll, v.debt, price))
    }

    pub fn get_nominal_icr(&self, owner: Address) -> Option<f64> {
        self.get_entire_debt_and_coll(owner)
            .map(|v| compute_nominal_cr(v.coll, v.debt))
    }

    fn minutes_passed_since_last_fee_op(&self, now: u64) -> f64 {
        (now.saturating_sub(self.last_fee_operation_time) / SECONDS_IN_ONE_MINUTE) as f64
    }

    pub fn calc_decayed_base_rate(&self, now: u64) -> f64 {
        let minutes = self.minutes_passed_since_last_fee_op(now);
        self.base_rate * self.params.minute_decay_factor().powf(minutes)
    }

    pub fn get_borrowing_rate_with_decay(&self, now: u64) -> f64 {
        (self.params.borrowing_fee_floor + self.calc_decayed_base_rate(now))
            .min(self.params.max_borrowing_fee)
    }

    pub fn get_borrowing_fee_with_decay(&self, amount: f64, now: u64) -> f64 {
        self.get_borrowing_rate_with_decay(now) * amount
    }

    pub fn get_redemption_rate_with_decay(&self, now: u64) -> f64 {
        (self.params.redemption_fee_floor + self.calc_decayed_base_rate(now)).min(1.0)
    }

    /// Base rate after redeeming `redeemed_fraction` of the VUSD supply.
    pub fn calc_base_rate_after_redemption(&self, redeemed_fraction: f64, now: u64) -> f64 {
        (self.calc_decayed_base_rate(now) + redeemed_fraction / self.params.beta).min(1.0)
    }

    fn update_last_fee_op_time(&mut self, now: u64) {
        if now.saturating_sub(self.last_fee_operation_time) >= SECONDS_IN_ONE_MINUTE {
            self.last_fee_operation_time = now;
        }
    }

    pub(super) fn decay_base_rate_from_borrowing(&mut self, now: u64) {
        self.base_rate = self.calc_decayed_base_rate(now);
        self.update_last_fee_op_time(now);
    }

    pub(super) fn set_base_rate_from_redemption(&mut self, base_rate: f64, now: u64) {
        self.base_rate = base_rate;
        self.update_last_fee_op_time(now);
    }

    fn compute_new_stake(&self, coll: f64) -> f64 {
        if self.total_coll_snapshot > 0.0 {
            coll * self.total_stakes_snapshot / self.total_coll_snapshot
        } else {
            coll
        }
    }

    fn update_stake(&mut self, owner: Address) {
        let Some(coll) = self.vessels.get(&owner).map(|v| v.coll) else {
            return;
        };
        let new_stake = self.compute_new_stake(coll);
        if let Some(v) = self.vessels.get_mut(&owner) {
            self.total_stakes += new_stake - v.stake;
            v.stake = new_stake;
        }
    }

    pub(super) fn create_vessel(&mut self, owner: Address, coll: f64, debt: f64) {
        let vessel = Vessel {
            coll,
            debt,
            stake: 0.0,
            status: VesselStatus::Active,
            snapshot_coll: self.l_coll,
            snapshot_debt: self.l_debt,
        };
        self.vessels.insert(owner, vessel);
        self.owners.push(owner);
        self.update_stake(owner);
    }

    /// Folds pending rewards into the stored vessel and resets its snapshots.
    pub(super) fn apply_rewards(&mut self, owner: Address) -> (f64, f64) {
        let (pending_coll, pending_debt) = self.get_pending_rewards(owner);
        let (l_coll, l_debt) = (self.l_coll, self.l_debt);
        if let Some(v) = self.vessels.get_mut(&owner) {
            v.coll += pending_coll;
            v.debt += pending_debt;
            v.snapshot_coll = l_coll;
            v.snapshot_debt = l_debt;
        }
        (pending_coll, pending_debt)
    }

    pub(super) fn update_vessel(&mut self, owner: Address, coll: f64, debt: f64) {
        if let Some(v) = self.vessels.get_mut(&owner) {
            v.coll = coll;
            v.debt = debt;
        }
        self.update_stake(owner);
    }

    pub(super) fn close_vessel(&mut self, owner: Address, status: VesselStatus) {
        if let Some(v) = self.vessels.get_mut(&owner) {
            self.total_stakes -= v.stake;
            v.stake = 0.0;
            v.coll = 0.0;
            v.debt = 0.0;
            v.status = status;
        }
        if let Some(at) = self.owners.iter().position(|a| *a == owner) {
            self.owners.swap_remove(at);
        }
    }

    pub(super) fn redistribute(&mut self, debt: f64, coll: f64) {
        if self.total_stakes <= 0.0 {
            return;
        }
        self.l_coll += coll / self.total_stakes;
        self.l_debt += debt / self.total_stakes;
    }

    pub(super) fn update_system_snapshots(&mut self, total_coll: f64) {
        self.total_stakes_snapshot = self.total_stakes;
        self.total_coll_snapshot = total_coll;
    }
}

/// What a single liquidation did with a vessel's collateral and debt.
#[derive(Clone, Debug, PartialEq)]
pub struct LiquidationOutcome {
    pub owner: Address,
    pub coll: f64,
    pub debt: f64,
    pub icr: f64,
    pub recovery_mode: bool,
    pub debt_offset: f64,
    pub coll_to_sp: f64,
    pub debt_redistributed: f64,
    pub coll_redistributed: f64,
    pub coll_surplus: f64,
    pub coll_gas_compensation: f64,
    pub vusd_gas_compensation: f64,
}

impl LiquidationOutcome {
    fn new(owner: Address, coll: f64, debt: f64, icr: f64, recovery_mode: bool) -> Self {
        Self {
            owner,
            coll,
            debt,
            icr,
            recovery_mode,
            debt_offset: 0.0,
            coll_to_sp: 0.0,
            debt_redistributed: 0.0,
            coll_redistributed: 0.0,
            coll_surplus: 0.0,
            coll_gas_compensation: 0.0,
            vusd_gas_compensation: 0.0,
        }
    }

    fn offset_and_redistribute(&mut self, coll: f64, sp_deposits: f64) {
        if sp_deposits > 0.0 && self.debt > 0.0 {
            self.debt_offset = self.debt.min(sp_deposits);
            self.coll_to_sp = coll * self.debt_offset / self.debt;
        }
        self.debt_redistributed = self.debt - self.debt_offset;
        self.coll_redistributed = coll - self.coll_to_sp;
    }

    pub fn total_coll(&self) -> f64 {
        self.coll_to_sp + self.coll_redistributed + self.coll_surplus + self.coll_gas_compensation
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RedemptionOutcome {
    pub vusd_redeemed: f64,
    pub eth_drawn: f64,
    pub eth_fee: f64,
    pub base_rate: f64,
    /// Vessels fully redeemed and closed.
    pub closed: Vec<Address>,
}

#[derive(Clone, Debug)]
pub(super) struct RedemptionLot {
    pub owner: Address,
    pub vusd: f64,
    pub eth: f64,
    pub new_coll: f64,
    pub new_debt: f64,
    pub new_nicr: f64,
    pub closes: bool,
}

#[derive(Clone, Debug, Default)]
pub(super) struct RedemptionPlan {
    pub lots: Vec<RedemptionLot>,
}

impl RedemptionPlan {
    pub fn vusd_total(&self) -> f64 {
        self.lots.iter().map(|l| l.vusd).sum()
    }

    pub fn eth_total(&self) -> f64 {
        self.lots.iter().map(|l| l.eth).sum()
    }
}

impl Contracts {
    pub fn get_current_icr(&self, owner: Address, price: f64) -> Option<f64> {
        self.vessel_manager.get_current_icr(owner, price)
    }

    /// Moves the vessel's pending redistribution rewards from the default
    /// pool into the active pool and onto the vessel.
    pub(super) fn apply_pending_rewards(&mut self, owner: Address) -> Result<(), ProtocolError> {
        let vm = self.vessel_manager.address;
        let (coll, debt) = self.vessel_manager.apply_rewards(owner);
        if coll > 0.0 || debt > 0.0 {
            self.default_pool.decrease_debt(vm, debt)?;
            self.active_pool.increase_debt(vm, debt)?;
            let moved = self.default_pool.send_coll_to_active_pool(vm, coll)?;
            self.active_pool.receive_coll(self.default_pool.address, moved)?;
        }
        Ok(())
    }

    fn plan_liquidation(&self, owner: Address, price: f64) -> Option<LiquidationOutcome> {
        let v = self.vessel_manager.get_entire_debt_and_coll(owner)?;
        let p = &self.params;
        let icr = compute_cr(v.coll, v.debt, price);
        let recovery = self.check_recovery_mode(price);
        let tcr = self.get_tcr(price);
        let sp_deposits = self.stability_pool.get_total_vusd_deposits();

        let mut out = LiquidationOutcome::new(owner, v.coll, v.debt, icr, recovery);
        out.vusd_gas_compensation = p.gas_compensation.min(v.debt);

        if recovery && icr <= 1.0 {
            out.coll_gas_compensation = v.coll / p.coll_gas_comp_divisor;
            out.debt_redistributed = v.debt;
            out.coll_redistributed = v.coll - out.coll_gas_compensation;
        } else if icr < p.mcr {
            out.coll_gas_compensation = v.coll / p.coll_gas_comp_divisor;
            out.offset_and_redistribute(v.coll - out.coll_gas_compensation, sp_deposits);
        } else if recovery && icr < tcr && v.debt <= sp_deposits {
            // collateral capped at MCR, the rest is claimable by the owner
            let capped = (v.debt * p.mcr / price).min(v.coll);
            out.coll_gas_compensation = capped / p.coll_gas_comp_divisor;
            out.debt_offset = v.debt;
            out.coll_to_sp = capped - out.coll_gas_compensation;
            out.coll_surplus = v.coll - capped;
        } else {
            return None;
        }
        Some(out)
    }

    /// Riskiest vessel if it can be liquidated at `price` under the current
    /// mode rules.
    pub fn liquidation_candidate(&self, price: f64) -> Option<Address> {
        if self.vessel_manager.get_vessel_owners_count() <= 1 {
            return None;
        }
        let last = self.sorted_vessels.get_last()?;
        self.plan_liquidation(last, price).map(|_| last)
    }

    pub fn liquidate(&mut self, liquidator: Address, owner: Address) -> Result<LiquidationOutcome, ProtocolError> {
        self.vessel_manager.links.require_wired()?;
        if !self.vessel_manager.is_active(owner) {
            return Err(ProtocolError::VesselNotActive(owner));
        }
        if self.vessel_manager.get_vessel_owners_count() <= 1 {
            return Err(ProtocolError::OnlyOneVessel);
        }
        let price = self.get_price();
        let out = self
            .plan_liquidation(owner, price)
            .ok_or(ProtocolError::NothingToLiquidate)?;

        let vm = self.vessel_manager.address;
        let ap = self.active_pool.address;

        self.apply_pending_rewards(owner)?;
        self.vessel_manager
            .close_vessel(owner, VesselStatus::ClosedByLiquidation);
        self.sorted_vessels.remove(vm, owner)?;

        if out.debt_offset > 0.0 {
            self.offset_in_stability_pool(out.debt_offset, out.coll_to_sp)?;
        }

        if out.debt_redistributed > 0.0 || out.coll_redistributed > 0.0 {
            self.vessel_manager
                .redistribute(out.debt_redistributed, out.coll_redistributed);
            self.active_pool.decrease_debt(vm, out.debt_redistributed)?;
            self.default_pool.increase_debt(vm, out.debt_redistributed)?;
            let moved = self.active_pool.send_coll(vm, out.coll_redistributed)?;
            self.default_pool.receive_coll(ap, moved)?;
        }

        if out.coll_surplus > 0.0 {
            let moved = self.active_pool.send_coll(vm, out.coll_surplus)?;
            self.coll_surplus_pool.receive_coll(ap, moved)?;
            self.coll_surplus_pool
                .account_surplus(vm, owner, out.coll_surplus)?;
        }

        let gas_coll = self.active_pool.send_coll(vm, out.coll_gas_compensation)?;
        self.wallets.credit(liquidator, gas_coll);
        self.vusd_token.return_from_pool(
            vm,
            self.gas_pool.address,
            liquidator,
            out.vusd_gas_compensation,
        )?;

        let total_coll = self.get_entire_system_coll();
        self.vessel_manager.update_system_snapshots(total_coll);

        info!(
            owner = %owner,
            icr = out.icr,
            coll = out.coll,
            debt = out.debt,
            offset = out.debt_offset,
            redistributed = out.debt_redistributed,
            recovery_mode = out.recovery_mode,
            "vessel liquidated"
        );
        Ok(out)
    }

    pub(super) fn plan_redemption(&self, amount: f64, price: f64) -> RedemptionPlan {
        let p = &self.params;
        let gas = p.gas_compensation;
        let mut remaining = amount;
        let mut open = self.vessel_manager.get_vessel_owners_count();
        let mut plan = RedemptionPlan::default();

        for owner in self.sorted_vessels.iter_from_last() {
            if remaining <= 0.0 {
                break;
            }
            let Some(v) = self.vessel_manager.get_entire_debt_and_coll(owner) else {
                continue;
            };
            if compute_cr(v.coll, v.debt, price) < p.mcr {
                continue;
            }

            let vusd = remaining.min(v.debt - gas);
            if vusd <= 0.0 {
                continue;
            }
            let eth = vusd / price;
            let new_debt = v.debt - vusd;
            let new_coll = v.coll - eth;
            let closes = new_debt - gas <= 1e-9;

            if closes {
                if open <= 1 {
                    break;
                }
                open -= 1;
            } else if new_debt - gas < p.min_net_debt {
                break;
            }

            plan.lots.push(RedemptionLot {
                owner,
                vusd,
                eth,
                new_coll,
                new_debt,
                new_nicr: compute_nominal_cr(new_coll, new_debt),
                closes,
            });
            remaining -= vusd;
        }
        plan
    }

    /// Swaps `amount` VUSD of `redeemer` for collateral at face value,
    /// minus the redemption fee which goes to GRVT stakers.
    pub fn redeem_collateral(
        &mut self,
        redeemer: Address,
        amount: f64,
        max_fee: f64,
    ) -> Result<RedemptionOutcome, ProtocolError> {
        self.vessel_manager.links.require_wired()?;
        require_positive(amount)?;
        let floor = self.params.redemption_fee_floor;
        if !(max_fee >= floor && max_fee <= 1.0) {
            return Err(ProtocolError::FeeExceedsMax {
                rate: floor,
                max: max_fee,
            });
        }
        let price = self.get_price();
        let tcr = self.get_tcr(price);
        if tcr < self.params.mcr {
            return Err(ProtocolError::IcrBelowMcr { icr: tcr });
        }
        self.vusd_token.require_balance(redeemer, amount)?;

        let plan = self.plan_redemption(amount, price);
        let eth_drawn = plan.eth_total();
        if eth_drawn <= 0.0 {
            return Err(ProtocolError::UnableToRedeem);
        }
        let vusd_redeemed = plan.vusd_total();
        let now = self.now();
        let supply = self.vusd_token.total_supply();
        let base_rate = self
            .vessel_manager
            .calc_base_rate_after_redemption(vusd_redeemed / supply, now);
        let rate = (floor + base_rate).min(1.0);
        if rate > max_fee {
            return Err(ProtocolError::FeeExceedsMax { rate, max: max_fee });
        }
        let eth_fee = rate * eth_drawn;

        let vm = self.vessel_manager.address;
        let ap = self.active_pool.address;
        let gas = self.params.gas_compensation;
        self.vessel_manager.set_base_rate_from_redemption(base_rate, now);

        let mut closed = Vec::new();
        for lot in &plan.lots {
            self.apply_pending_rewards(lot.owner)?;
            if lot.closes {
                self.vusd_token.burn(vm, self.gas_pool.address, gas)?;
                self.active_pool.decrease_debt(vm, gas)?;
                self.vessel_manager
                    .close_vessel(lot.owner, VesselStatus::ClosedByRedemption);
                self.sorted_vessels.remove(vm, lot.owner)?;
                let moved = self.active_pool.send_coll(vm, lot.new_coll)?;
                self.coll_surplus_pool.receive_coll(ap, moved)?;
                self.coll_surplus_pool
                    .account_surplus(vm, lot.owner, lot.new_coll)?;
                closed.push(lot.owner);
            } else {
                self.vessel_manager
                    .update_vessel(lot.owner, lot.new_coll, lot.new_debt);
                self.sorted_vessels.re_insert(vm, lot.owner, lot.new_nicr)?;
            }
            debug!(owner = %lot.owner, vusd = lot.vusd, eth = lot.eth, closes = lot.closes, "vessel redeemed");
        }

        self.vusd_token.burn(vm, redeemer, vusd_redeemed)?;
        self.active_pool.decrease_debt(vm, vusd_redeemed)?;
        let fee = self.active_pool.send_coll(vm, eth_fee)?;
        self.grvt_staking.increase_f_eth(vm, fee)?;
        let proceeds = self.active_pool.send_coll(vm, eth_drawn - eth_fee)?;
        self.wallets.credit(redeemer, proceeds);

        info!(
            redeemer = %redeemer,
            vusd_redeemed,
            eth_drawn,
            eth_fee,
            base_rate,
            closed = closed.len(),
            "collateral redeemed"
        );
        Ok(RedemptionOutcome {
            vusd_redeemed,
            eth_drawn,
            eth_fee,
            base_rate,
            closed,
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
    fn test_collateral_ratio() {
        assert!((compute_cr(10.0, 10_000.0, 2000.0) - 2.0).abs() < 1e-12);
        assert!((compute_cr(10.0, 10_000.0, 1000.0) - 1.0).abs() < 1e-12);
        assert_eq!(compute_nominal_cr(1.0, 0.0), f64::INFINITY);
    }

    #[test]
    fn test_base_rate_decays() {
        let mut vm = VesselManager::new(Address(1), Address(2), ProtocolParams::default());
        vm.set_base_rate_from_redemption(0.1, 3600);
        let half_life = 720 * 60;
        assert!((vm.calc_decayed_base_rate(3600 + half_life) - 0.05).abs() < 1e-9);
        assert!(
            (vm.get_borrowing_rate_with_decay(3600) - 0.05).abs() < 1e-12,
            "capped at the maximum borrowing fee"
        );
    }

    #[test]
    fn test_liquidation_offsets_against_stability_pool() {
        let mut c = with_whale(2);
        c.provide_to_stability_pool(account(0), 500_000.0).unwrap();
        // ICR 1.2 at 2000
        c.open_vessel(account(1), 1.0, 10_000.0, 6.04).unwrap();

        c.price_feed.set_price(1500.0).unwrap();
        assert_eq!(c.liquidation_candidate(1500.0), Some(account(1)));

        let debt_before = c.get_entire_system_debt();
        let out = c.liquidate(account(2), account(1)).unwrap();
        assert_eq!(out.debt_redistributed, 0.0);
        assert!((out.debt_offset - out.debt).abs() < 1e-9);
        assert!((out.total_coll() - 6.04).abs() < 1e-9);
        assert!((debt_before - c.get_entire_system_debt() - out.debt).abs() < 1e-6);
        assert_eq!(
            c.vessel_manager.get_vessel_status(account(1)),
            VesselStatus::ClosedByLiquidation
        );
        assert!(!c.sorted_vessels.contains(account(1)));
        assert_eq!(c.vusd_token.balance_of(account(2)), 200.0);
        assert!((c.stability_pool.get_eth() - out.coll_to_sp).abs() < 1e-9);
    }

    #[test]
    fn test_liquidation_redistributes_without_stability_pool() {
        let mut c = with_whale(2);
        c.open_vessel(account(1), 1.0, 10_000.0, 6.04).unwrap();
        c.price_feed.set_price(1500.0).unwrap();

        let out = c.liquidate(account(2), account(1)).unwrap();
        assert_eq!(out.debt_offset, 0.0);
        assert!((c.default_pool.get_debt() - out.debt).abs() < 1e-9);

        // the whale, as the only remaining staker, inherits everything
        let (pc, pd) = c.vessel_manager.get_pending_rewards(account(0));
        assert!((pc - out.coll_redistributed).abs() < 1e-9);
        assert!((pd - out.debt).abs() < 1e-6);

        c.apply_pending_rewards(account(0)).unwrap();
        assert!(c.default_pool.get_debt().abs() < 1e-9);
        assert!(c.default_pool.get_coll().abs() < 1e-9);
    }

    /// Anchor vessel at ICR ~1.66 plus `account(1)` with 10k VUSD against `coll`.
    fn thin_system(coll: f64) -> Contracts {
        let mut c = wired(2);
        c.open_vessel(account(0), 1.0, 120_000.0, 100.0).unwrap();
        c.open_vessel(account(1), 1.0, 10_000.0, coll).unwrap();
        c
    }

    #[test]
    fn test_recovery_mode_redistributes_underwater_vessel() {
        let mut c = thin_system(6.04);
        c.provide_to_stability_pool(account(0), 50_000.0).unwrap();
        c.price_feed.set_price(1600.0).unwrap();
        assert!(c.check_recovery_mode(1600.0));

        let out = c.liquidate(account(2), account(1)).unwrap();
        assert!(out.recovery_mode);
        assert!(out.icr <= 1.0);
        assert_eq!(out.debt_offset, 0.0);
        assert_eq!(out.debt_redistributed, out.debt);
        assert!((out.coll_gas_compensation - 6.04 / c.params.coll_gas_comp_divisor).abs() < 1e-12);
        assert!((c.default_pool.get_debt() - out.debt).abs() < 1e-9);
        assert_eq!(c.stability_pool.get_total_vusd_deposits(), 50_000.0);
    }

    #[test]
    fn test_recovery_mode_caps_collateral_at_mcr() {
        let mut c = thin_system(8.0);
        c.provide_to_stability_pool(account(0), 20_000.0).unwrap();
        let price = 1800.0;
        c.price_feed.set_price(price).unwrap();
        assert!(c.check_recovery_mode(price));
        let icr = c.get_current_icr(account(1), price).unwrap();
        assert!(icr >= c.params.mcr && icr < c.get_tcr(price));

        let out = c.liquidate(account(2), account(1)).unwrap();
        let capped = out.debt * c.params.mcr / price;
        assert!((out.debt_offset - out.debt).abs() < 1e-9);
        assert_eq!(out.debt_redistributed, 0.0);
        assert!((out.coll_surplus - (8.0 - capped)).abs() < 1e-9);
        assert!((c.coll_surplus_pool.get_collateral(account(1)) - out.coll_surplus).abs() < 1e-9);

        let before = c.wallets.balance(account(1));
        let claimed = c.claim_collateral(account(1)).unwrap();
        assert!((claimed - out.coll_surplus).abs() < 1e-9);
        assert!((c.wallets.balance(account(1)) - before - claimed).abs() < 1e-9);
    }

    #[test]
    fn test_cannot_liquidate_last_or_healthy_vessel() {
        let mut c = with_whale(1);
        assert!(matches!(
            c.liquidate(account(1), account(0)),
            Err(ProtocolError::OnlyOneVessel)
        ));
        c.open_vessel(account(1), 1.0, 10_000.0, 20.0).unwrap();
        assert!(matches!(
            c.liquidate(account(0), account(1)),
            Err(ProtocolError::NothingToLiquidate)
        ));
        assert_eq!(c.liquidation_candidate(PRICE), None);
    }

    #[test]
    fn test_redemption_hits_riskiest_vessel_first() {
        let mut c = with_whale(2);
        c.open_vessel(account(1), 1.0, 10_000.0, 7.0).unwrap();
        c.open_vessel(account(2), 1.0, 10_000.0, 9.0).unwrap();
        c.advance_time(3600);

        let coll_before = c.vessel_manager.get_vessel(account(1)).unwrap().coll;
        let hints = c.get_redemption_hints(1_000.0, PRICE).unwrap();
        assert_eq!(hints.first_redemption_hint, Some(account(1)));
        let out = c.redeem_collateral(account(0), 1_000.0, 1.0).unwrap();
        let nicr = c.vessel_manager.get_nominal_icr(account(1)).unwrap();
        assert!((hints.partial_redemption_hint_nicr.unwrap() / nicr - 1.0).abs() < 1e-9);

        assert!((out.vusd_redeemed - 1_000.0).abs() < 1e-9);
        assert!((out.eth_drawn - 0.5).abs() < 1e-12);
        assert!(out.eth_fee > 0.0 && out.eth_fee < out.eth_drawn);
        assert!(out.closed.is_empty());
        let v = c.vessel_manager.get_vessel(account(1)).unwrap();
        assert!((coll_before - v.coll - 0.5).abs() < 1e-9);
        assert!(c.vessel_manager.get_base_rate() > 0.0);
    }

    #[test]
    fn test_full_redemption_closes_vessel_and_leaves_surplus() {
        let mut c = with_whale(1);
        let opened = c.open_vessel(account(1), 1.0, 2_000.0, 5.0).unwrap();
        let net = opened.composite_debt - c.params.gas_compensation;

        let out = c.redeem_collateral(account(0), net, 1.0).unwrap();
        assert_eq!(out.closed, vec![account(1)]);
        assert_eq!(
            c.vessel_manager.get_vessel_status(account(1)),
            VesselStatus::ClosedByRedemption
        );
        let surplus = c.coll_surplus_pool.get_collateral(account(1));
        assert!((surplus - (5.0 - net / PRICE)).abs() < 1e-9);
    }

    #[test]
    fn test_partial_redemption_below_min_debt_is_cancelled() {
        let mut c = with_whale(1);
        c.open_vessel(account(1), 1.0, 2_000.0, 5.0).unwrap();

        let hints = c.get_redemption_hints(500.0, PRICE).unwrap();
        assert_eq!(hints.truncated_amount, 0.0);
        assert!(matches!(
            c.redeem_collateral(account(0), 500.0, 1.0),
            Err(ProtocolError::UnableToRedeem)
        ));
    }
}
