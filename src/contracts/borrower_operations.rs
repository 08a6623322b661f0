//! Borrower-facing vessel operations: open, adjust, close, and claiming
//! collateral surplus.

use tracing::{debug, info};

use super::vessel_manager::{compute_cr, compute_nominal_cr, VesselStatus};
use super::{require_non_negative, require_positive, Address, Contracts, Links};
use crate::error::ProtocolError;

#[derive(Clone, Debug)]
pub struct BorrowerOperations {
    pub address: Address,
    pub links: Links,
}

impl BorrowerOperations {
    pub fn new(address: Address, owner: Address) -> Self {
        Self {
            address,
            links: Links::new("BorrowerOperations", owner),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpenedVessel {
    /// Borrowing fee in VUSD, added to the debt.
    pub fee: f64,
    /// Requested amount + fee + gas compensation.
    pub composite_debt: f64,
    pub icr: f64,
}

/// Requested change to an existing vessel. Collateral can be deposited or
/// withdrawn, not both.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VesselAdjustment {
    pub coll_deposit: f64,
    pub coll_withdrawal: f64,
    pub debt_change: f64,
    pub is_debt_increase: bool,
    pub max_fee: f64,
}

impl VesselAdjustment {
    pub fn add_coll(amount: f64) -> Self {
        Self {
            coll_deposit: amount,
            ..Self::default()
        }
    }

    pub fn withdraw_coll(amount: f64) -> Self {
        Self {
            coll_withdrawal: amount,
            ..Self::default()
        }
    }

    pub fn withdraw_debt(amount: f64, max_fee: f64) -> Self {
        Self {
            debt_change: amount,
            is_debt_increase: true,
            max_fee,
            ..Self::default()
        }
    }

    pub fn repay_debt(amount: f64) -> Self {
        Self {
            debt_change: amount,
            ..Self::default()
        }
    }
}

impl Contracts {
    fn require_valid_max_fee(&self, max_fee: f64, recovery: bool) -> Result<(), ProtocolError> {
        let floor = if recovery {
            0.0
        } else {
            self.params.borrowing_fee_floor
        };
        if !(max_fee >= floor && max_fee <= 1.0) {
            return Err(ProtocolError::FeeExceedsMax {
                rate: floor,
                max: max_fee,
            });
        }
        Ok(())
    }

    fn require_icr_for_mode(&self, icr: f64, recovery: bool) -> Result<(), ProtocolError> {
        if recovery {
            if icr < self.params.ccr {
                return Err(ProtocolError::IcrBelowCcr { icr });
            }
        } else if icr < self.params.mcr {
            return Err(ProtocolError::IcrBelowMcr { icr });
        }
        Ok(())
    }

    fn require_tcr_above_ccr(&self, tcr: f64) -> Result<(), ProtocolError> {
        if tcr < self.params.ccr {
            return Err(ProtocolError::TcrBelowCcr { tcr });
        }
        Ok(())
    }

    fn require_min_net_debt(&self, net_debt: f64) -> Result<(), ProtocolError> {
        if net_debt + 1e-9 < self.params.min_net_debt {
            return Err(ProtocolError::DebtBelowMinimum {
                net_debt,
                min: self.params.min_net_debt,
            });
        }
        Ok(())
    }

    /// Borrowing fee for `amount`, outside recovery mode only. Rejects fees
    /// above `max_fee`.
    fn borrowing_fee(&self, amount: f64, max_fee: f64, recovery: bool) -> Result<f64, ProtocolError> {
        if recovery {
            return Ok(0.0);
        }
        let now = self.now();
        let rate = self.vessel_manager.get_borrowing_rate_with_decay(now);
        if rate > max_fee {
            return Err(ProtocolError::FeeExceedsMax { rate, max: max_fee });
        }
        Ok(self.vessel_manager.get_borrowing_fee_with_decay(amount, now))
    }

    fn pay_borrowing_fee(&mut self, fee: f64) -> Result<(), ProtocolError> {
        let now = self.now();
        self.vessel_manager.decay_base_rate_from_borrowing(now);
        if fee > 0.0 {
            let bo = self.borrower_operations.address;
            let staking = self.grvt_staking.address;
            self.vusd_token.mint(bo, staking, fee)?;
            self.grvt_staking.increase_f_vusd(bo, fee)?;
        }
        Ok(())
    }

    /// Locks `coll` ETH from `from` and draws `vusd_amount`.
    pub fn open_vessel(
        &mut self,
        from: Address,
        max_fee: f64,
        vusd_amount: f64,
        coll: f64,
    ) -> Result<OpenedVessel, ProtocolError> {
        self.borrower_operations.links.require_wired()?;
        require_positive(coll)?;
        require_non_negative(vusd_amount)?;
        let price = self.get_price();
        let recovery = self.check_recovery_mode(price);
        self.require_valid_max_fee(max_fee, recovery)?;
        if self.vessel_manager.is_active(from) {
            return Err(ProtocolError::VesselActive(from));
        }
        self.wallets.require_balance(from, coll)?;

        let fee = self.borrowing_fee(vusd_amount, max_fee, recovery)?;
        let net_debt = vusd_amount + fee;
        self.require_min_net_debt(net_debt)?;
        let composite_debt = net_debt + self.params.gas_compensation;
        let icr = compute_cr(coll, composite_debt, price);
        self.require_icr_for_mode(icr, recovery)?;
        if !recovery {
            self.require_tcr_above_ccr(self.new_tcr(coll, composite_debt, price))?;
        }
        if self.sorted_vessels.get_size() >= self.sorted_vessels.get_max_size() {
            return Err(ProtocolError::ListFull);
        }

        let bo = self.borrower_operations.address;
        self.pay_borrowing_fee(fee)?;
        self.vessel_manager.create_vessel(from, coll, composite_debt);
        self.sorted_vessels
            .insert(bo, from, compute_nominal_cr(coll, composite_debt))?;

        self.wallets.debit(from, coll)?;
        self.active_pool.receive_coll(bo, coll)?;
        self.active_pool.increase_debt(bo, composite_debt)?;
        self.vusd_token.mint(bo, from, vusd_amount)?;
        self.vusd_token
            .mint(bo, self.gas_pool.address, self.params.gas_compensation)?;

        debug!(owner = %from, coll, debt = composite_debt, fee, icr, "vessel opened");
        Ok(OpenedVessel {
            fee,
            composite_debt,
            icr,
        })
    }

    /// Applies a collateral and/or debt change to `from`'s vessel. Returns
    /// the borrowing fee charged.
    pub fn adjust_vessel(&mut self, from: Address, adj: &VesselAdjustment) -> Result<f64, ProtocolError> {
        self.borrower_operations.links.require_wired()?;
        require_non_negative(adj.coll_deposit)?;
        require_non_negative(adj.coll_withdrawal)?;
        require_non_negative(adj.debt_change)?;
        if adj.coll_deposit > 0.0 && adj.coll_withdrawal > 0.0 {
            return Err(ProtocolError::InvalidAmount(adj.coll_withdrawal));
        }
        if adj.coll_deposit == 0.0 && adj.coll_withdrawal == 0.0 && adj.debt_change == 0.0 {
            return Err(ProtocolError::InvalidAmount(0.0));
        }
        let v = self
            .vessel_manager
            .get_entire_debt_and_coll(from)
            .ok_or(ProtocolError::VesselNotActive(from))?;

        let price = self.get_price();
        let recovery = self.check_recovery_mode(price);
        let increase = adj.is_debt_increase && adj.debt_change > 0.0;
        if increase {
            self.require_valid_max_fee(adj.max_fee, recovery)?;
        }
        if recovery && adj.coll_withdrawal > 0.0 {
            return Err(ProtocolError::RecoveryMode);
        }
        if adj.coll_withdrawal > v.coll {
            return Err(ProtocolError::InsufficientBalance {
                account: from,
                asset: "ETH",
                needed: adj.coll_withdrawal,
                available: v.coll,
            });
        }
        self.wallets.require_balance(from, adj.coll_deposit)?;

        let fee = if increase {
            self.borrowing_fee(adj.debt_change, adj.max_fee, recovery)?
        } else {
            0.0
        };
        let debt_delta = if increase {
            adj.debt_change + fee
        } else {
            -adj.debt_change
        };
        let coll_delta = adj.coll_deposit - adj.coll_withdrawal;
        let new_coll = v.coll + coll_delta;
        let new_debt = v.debt + debt_delta;

        if !increase && adj.debt_change > 0.0 {
            self.require_min_net_debt(new_debt - self.params.gas_compensation)?;
            self.vusd_token.require_balance(from, adj.debt_change)?;
        }

        let old_icr = compute_cr(v.coll, v.debt, price);
        let new_icr = compute_cr(new_coll, new_debt, price);
        if recovery {
            if increase {
                self.require_icr_for_mode(new_icr, true)?;
                if new_icr < old_icr {
                    return Err(ProtocolError::IcrNotImproved {
                        old: old_icr,
                        new: new_icr,
                    });
                }
            }
        } else {
            self.require_icr_for_mode(new_icr, false)?;
            self.require_tcr_above_ccr(self.new_tcr(coll_delta, debt_delta, price))?;
        }

        let bo = self.borrower_operations.address;
        self.apply_pending_rewards(from)?;
        if increase {
            self.pay_borrowing_fee(fee)?;
        }
        self.vessel_manager.update_vessel(from, new_coll, new_debt);
        self.sorted_vessels
            .re_insert(bo, from, compute_nominal_cr(new_coll, new_debt))?;

        if adj.coll_deposit > 0.0 {
            self.wallets.debit(from, adj.coll_deposit)?;
            self.active_pool.receive_coll(bo, adj.coll_deposit)?;
        }
        if adj.coll_withdrawal > 0.0 {
            let coll = self.active_pool.send_coll(bo, adj.coll_withdrawal)?;
            self.wallets.credit(from, coll);
        }
        if increase {
            self.active_pool.increase_debt(bo, debt_delta)?;
            self.vusd_token.mint(bo, from, adj.debt_change)?;
        } else if adj.debt_change > 0.0 {
            self.vusd_token.burn(bo, from, adj.debt_change)?;
            self.active_pool.decrease_debt(bo, adj.debt_change)?;
        }

        debug!(owner = %from, coll = new_coll, debt = new_debt, icr = new_icr, "vessel adjusted");
        Ok(fee)
    }

    /// Repays the whole net debt from the owner's VUSD and releases the
    /// collateral. Not allowed in recovery mode or for the last vessel.
    pub fn close_vessel(&mut self, from: Address) -> Result<f64, ProtocolError> {
        self.borrower_operations.links.require_wired()?;
        let v = self
            .vessel_manager
            .get_entire_debt_and_coll(from)
            .ok_or(ProtocolError::VesselNotActive(from))?;
        let price = self.get_price();
        if self.check_recovery_mode(price) {
            return Err(ProtocolError::RecoveryMode);
        }
        if self.vessel_manager.get_vessel_owners_count() <= 1 {
            return Err(ProtocolError::OnlyOneVessel);
        }
        self.require_tcr_above_ccr(self.new_tcr(-v.coll, -v.debt, price))?;
        let gas = self.params.gas_compensation;
        let repay = v.debt - gas;
        self.vusd_token.require_balance(from, repay)?;

        let bo = self.borrower_operations.address;
        self.apply_pending_rewards(from)?;
        self.vessel_manager
            .close_vessel(from, VesselStatus::ClosedByOwner);
        self.sorted_vessels.remove(bo, from)?;

        self.vusd_token.burn(bo, from, repay)?;
        self.vusd_token.burn(bo, self.gas_pool.address, gas)?;
        self.active_pool.decrease_debt(bo, v.debt)?;
        let coll = self.active_pool.send_coll(bo, v.coll)?;
        self.wallets.credit(from, coll);

        debug!(owner = %from, coll, debt = v.debt, "vessel closed");
        Ok(coll)
    }

    /// Withdraws collateral surplus left by a recovery-mode liquidation or
    /// a full redemption.
    pub fn claim_collateral(&mut self, from: Address) -> Result<f64, ProtocolError> {
        self.borrower_operations.links.require_wired()?;
        let bo = self.borrower_operations.address;
        let coll = self.coll_surplus_pool.claim_coll(bo, from)?;
        self.wallets.credit(from, coll);
        info!(owner = %from, coll, "collateral surplus claimed");
        Ok(coll)
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
    fn test_open_vessel_books_debt_and_fee() {
        let mut c = wired(1);
        let opened = c.open_vessel(account(0), 1.0, 10_000.0, 10.0).unwrap();

        assert!((opened.fee - 50.0).abs() < 1e-9);
        assert!((opened.composite_debt - 10_250.0).abs() < 1e-9);
        assert_eq!(c.active_pool.get_debt(), opened.composite_debt);
        assert_eq!(c.active_pool.get_coll(), 10.0);
        assert_eq!(c.vusd_token.balance_of(account(0)), 10_000.0);
        assert_eq!(c.vusd_token.balance_of(c.gas_pool.address), 200.0);
        assert_eq!(c.vusd_token.balance_of(c.grvt_staking.address), 50.0);
        assert_eq!(c.wallets.balance(account(0)), 1_000_000.0 - 10.0);
        assert_eq!(c.sorted_vessels.get_size(), 1);
    }

    #[test]
    fn test_open_vessel_rejects_small_or_risky_debt() {
        let mut c = wired(1);
        assert!(matches!(
            c.open_vessel(account(0), 1.0, 1_000.0, 10.0),
            Err(ProtocolError::DebtBelowMinimum { .. })
        ));
        assert!(matches!(
            c.open_vessel(account(0), 1.0, 10_000.0, 5.0),
            Err(ProtocolError::IcrBelowMcr { .. })
        ));
        // ICR ~1.3 passes MCR but the first vessel defines TCR
        assert!(matches!(
            c.open_vessel(account(0), 1.0, 10_000.0, 6.7),
            Err(ProtocolError::TcrBelowCcr { .. })
        ));
        assert_eq!(c.active_pool.get_debt(), 0.0);
    }

    #[test]
    fn test_open_twice_fails() {
        let mut c = with_whale(1);
        assert!(matches!(
            c.open_vessel(account(0), 1.0, 2_000.0, 10.0),
            Err(ProtocolError::VesselActive(_))
        ));
    }

    #[test]
    fn test_max_fee_is_enforced() {
        let mut c = wired(1);
        assert!(matches!(
            c.open_vessel(account(0), 0.001, 10_000.0, 10.0),
            Err(ProtocolError::FeeExceedsMax { .. })
        ));
    }

    #[test]
    fn test_adjust_vessel_moves_collateral_and_debt() {
        let mut c = with_whale(1);
        c.open_vessel(account(1), 1.0, 10_000.0, 10.0).unwrap();
        let debt_before = c.vessel_manager.get_vessel(account(1)).unwrap().debt;

        c.adjust_vessel(account(1), &VesselAdjustment::add_coll(2.0))
            .unwrap();
        assert_eq!(c.vessel_manager.get_vessel(account(1)).unwrap().coll, 12.0);

        c.adjust_vessel(account(1), &VesselAdjustment::repay_debt(1_000.0))
            .unwrap();
        let v = c.vessel_manager.get_vessel(account(1)).unwrap();
        assert!((v.debt - (debt_before - 1_000.0)).abs() < 1e-9);

        let fee = c
            .adjust_vessel(account(1), &VesselAdjustment::withdraw_debt(500.0, 1.0))
            .unwrap();
        assert!(fee > 0.0);
    }

    #[test]
    fn test_adjust_rejects_repaying_below_min_debt() {
        let mut c = with_whale(1);
        c.open_vessel(account(1), 1.0, 2_000.0, 10.0).unwrap();
        let err = c
            .adjust_vessel(account(1), &VesselAdjustment::repay_debt(500.0))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DebtBelowMinimum { .. }));
    }

    #[test]
    fn test_close_vessel_returns_collateral() {
        let mut c = with_whale(1);
        c.open_vessel(account(1), 1.0, 10_000.0, 10.0).unwrap();
        // cover the borrowing fee
        c.vusd_token.transfer(account(0), account(1), 100.0).unwrap();

        let coll = c.close_vessel(account(1)).unwrap();
        assert_eq!(coll, 10.0);
        assert_eq!(
            c.vessel_manager.get_vessel_status(account(1)),
            VesselStatus::ClosedByOwner
        );
        assert_eq!(c.vessel_manager.get_vessel_owners_count(), 1);
        assert!(matches!(
            c.close_vessel(account(0)),
            Err(ProtocolError::OnlyOneVessel)
        ));
    }

    #[test]
    fn test_close_requires_enough_vusd() {
        let mut c = with_whale(1);
        c.open_vessel(account(1), 1.0, 10_000.0, 10.0).unwrap();
        let err = c.close_vessel(account(1)).unwrap_err();
        assert!(matches!(err, ProtocolError::InsufficientBalance { .. }));
        assert!(c.vessel_manager.is_active(account(1)));
    }
}
