//! Collateral and debt holders. Pools only book-keep; the flows that move
//! value between them live on `Contracts`.

use std::collections::BTreeMap;

use super::{require_non_negative, Address, Links};
use crate::error::ProtocolError;

fn require_funds(
    pool: Address,
    held: f64,
    amount: f64,
) -> Result<(), ProtocolError> {
    require_non_negative(amount)?;
    if held + 1e-9 < amount {
        return Err(ProtocolError::InsufficientBalance {
            account: pool,
            asset: "ETH",
            needed: amount,
            available: held,
        });
    }
    Ok(())
}

/// Collateral and debt of active vessels.
#[derive(Clone, Debug)]
pub struct ActivePool {
    pub address: Address,
    pub links: Links,
    coll: f64,
    debt: f64,
}

impl ActivePool {
    pub fn new(address: Address, owner: Address) -> Self {
        Self {
            address,
            links: Links::new("ActivePool", owner),
            coll: 0.0,
            debt: 0.0,
        }
    }

    pub fn get_coll(&self) -> f64 {
        self.coll
    }

    pub fn get_debt(&self) -> f64 {
        self.debt
    }

    pub fn receive_coll(&mut self, caller: Address, amount: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        require_non_negative(amount)?;
        self.coll += amount;
        Ok(())
    }

    pub fn send_coll(&mut self, caller: Address, amount: f64) -> Result<f64, ProtocolError> {
        self.links.require_caller(caller)?;
        require_funds(self.address, self.coll, amount)?;
        self.coll = (self.coll - amount).max(0.0);
        Ok(amount)
    }

    pub fn increase_debt(&mut self, caller: Address, amount: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        require_non_negative(amount)?;
        self.debt += amount;
        Ok(())
    }

    pub fn decrease_debt(&mut self, caller: Address, amount: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        require_non_negative(amount)?;
        self.debt = (self.debt - amount).max(0.0);
        Ok(())
    }
}

/// Collateral and debt redistributed by liquidations, awaiting their
/// owners' next touch.
#[derive(Clone, Debug)]
pub struct DefaultPool {
    pub address: Address,
    pub links: Links,
    coll: f64,
    debt: f64,
}

impl DefaultPool {
    pub fn new(address: Address, owner: Address) -> Self {
        Self {
            address,
            links: Links::new("DefaultPool", owner),
            coll: 0.0,
            debt: 0.0,
        }
    }

    pub fn get_coll(&self) -> f64 {
        self.coll
    }

    pub fn get_debt(&self) -> f64 {
        self.debt
    }

    pub fn receive_coll(&mut self, caller: Address, amount: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        require_non_negative(amount)?;
        self.coll += amount;
        Ok(())
    }

    pub fn send_coll_to_active_pool(&mut self, caller: Address, amount: f64) -> Result<f64, ProtocolError> {
        self.links.require_caller(caller)?;
        require_funds(self.address, self.coll, amount)?;
        self.coll = (self.coll - amount).max(0.0);
        Ok(amount)
    }

    pub fn increase_debt(&mut self, caller: Address, amount: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        require_non_negative(amount)?;
        self.debt += amount;
        Ok(())
    }

    pub fn decrease_debt(&mut self, caller: Address, amount: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        require_non_negative(amount)?;
        self.debt = (self.debt - amount).max(0.0);
        Ok(())
    }
}

/// Collateral left over from recovery-mode liquidations and full
/// redemptions, claimable by the former vessel owner.
#[derive(Clone, Debug)]
pub struct CollSurplusPool {
    pub address: Address,
    pub links: Links,
    coll: f64,
    claimable: BTreeMap<Address, f64>,
}

impl CollSurplusPool {
    pub fn new(address: Address, owner: Address) -> Self {
        Self {
            address,
            links: Links::new("CollSurplusPool", owner),
            coll: 0.0,
            claimable: BTreeMap::new(),
        }
    }

    pub fn get_coll(&self) -> f64 {
        self.coll
    }

    pub fn get_collateral(&self, account: Address) -> f64 {
        self.claimable.get(&account).copied().unwrap_or(0.0)
    }

    pub fn receive_coll(&mut self, caller: Address, amount: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        require_non_negative(amount)?;
        self.coll += amount;
        Ok(())
    }

    pub fn account_surplus(&mut self, caller: Address, account: Address, amount: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        require_non_negative(amount)?;
        *self.claimable.entry(account).or_insert(0.0) += amount;
        Ok(())
    }

    /// Releases everything owed to `account`.
    pub fn claim_coll(&mut self, caller: Address, account: Address) -> Result<f64, ProtocolError> {
        self.links.require_caller(caller)?;
        let amount = self.get_collateral(account);
        if amount <= 0.0 {
            return Err(ProtocolError::NothingToClaim(account));
        }
        self.claimable.remove(&account);
        self.coll = (self.coll - amount).max(0.0);
        Ok(amount)
    }
}

/// Holds the VUSD gas compensation of every open vessel. The balance
/// itself lives in the VUSD ledger under this address.
#[derive(Clone, Debug)]
pub struct GasPool {
    pub address: Address,
}

impl GasPool {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}
