use std::collections::BTreeMap;

use super::{require_non_negative, Address, Links};
use crate::config::ProtocolParams;
use crate::error::ProtocolError;

#[derive(Clone, Debug, Default)]
struct Balances {
    balances: BTreeMap<Address, f64>,
    total_supply: f64,
}

impl Balances {
    fn balance_of(&self, account: Address) -> f64 {
        self.balances.get(&account).copied().unwrap_or(0.0)
    }

    fn require(&self, account: Address, amount: f64, asset: &'static str) -> Result<(), ProtocolError> {
        require_non_negative(amount)?;
        let available = self.balance_of(account);
        if available < amount {
            return Err(ProtocolError::InsufficientBalance {
                account,
                asset,
                needed: amount,
                available,
            });
        }
        Ok(())
    }

    fn credit(&mut self, account: Address, amount: f64) {
        *self.balances.entry(account).or_insert(0.0) += amount;
    }

    fn debit(&mut self, account: Address, amount: f64) {
        *self.balances.entry(account).or_insert(0.0) -= amount;
    }

    fn transfer(
        &mut self,
        from: Address,
        to: Address,
        amount: f64,
        asset: &'static str,
    ) -> Result<(), ProtocolError> {
        self.require(from, amount, asset)?;
        self.debit(from, amount);
        self.credit(to, amount);
        Ok(())
    }
}

/// The stablecoin. Minted by borrower operations, burned by borrower
/// operations, the vessel manager and the stability pool.
#[derive(Clone, Debug)]
pub struct VusdToken {
    pub address: Address,
    pub links: Links,
    vessel_manager: Address,
    stability_pool: Address,
    borrower_operations: Address,
    ledger: Balances,
}

impl VusdToken {
    pub const SYMBOL: &'static str = "VUSD";

    pub fn new(
        address: Address,
        vessel_manager: Address,
        stability_pool: Address,
        borrower_operations: Address,
    ) -> Self {
        Self {
            address,
            links: Links::constructed(
                "VUSDToken",
                vec![vessel_manager, stability_pool, borrower_operations],
            ),
            vessel_manager,
            stability_pool,
            borrower_operations,
            ledger: Balances::default(),
        }
    }

    fn require_one_of(&self, caller: Address, allowed: &[Address]) -> Result<(), ProtocolError> {
        if !allowed.contains(&caller) {
            return Err(ProtocolError::UnauthorizedCaller {
                contract: "VUSDToken",
                caller,
            });
        }
        Ok(())
    }

    pub fn balance_of(&self, account: Address) -> f64 {
        self.ledger.balance_of(account)
    }

    pub fn total_supply(&self) -> f64 {
        self.ledger.total_supply
    }

    pub fn require_balance(&self, account: Address, amount: f64) -> Result<(), ProtocolError> {
        self.ledger.require(account, amount, Self::SYMBOL)
    }

    pub fn mint(&mut self, caller: Address, to: Address, amount: f64) -> Result<(), ProtocolError> {
        self.require_one_of(caller, &[self.borrower_operations])?;
        require_non_negative(amount)?;
        self.ledger.credit(to, amount);
        self.ledger.total_supply += amount;
        Ok(())
    }

    pub fn burn(&mut self, caller: Address, from: Address, amount: f64) -> Result<(), ProtocolError> {
        self.require_one_of(
            caller,
            &[self.borrower_operations, self.vessel_manager, self.stability_pool],
        )?;
        self.ledger.require(from, amount, Self::SYMBOL)?;
        self.ledger.debit(from, amount);
        self.ledger.total_supply -= amount;
        Ok(())
    }

    /// Moves a depositor's tokens into the stability pool.
    pub fn send_to_pool(
        &mut self,
        caller: Address,
        from: Address,
        pool: Address,
        amount: f64,
    ) -> Result<(), ProtocolError> {
        self.require_one_of(caller, &[self.stability_pool])?;
        self.ledger.transfer(from, pool, amount, Self::SYMBOL)
    }

    /// Pays tokens held by a pool (stability pool, gas pool, staking) out to
    /// an account.
    pub fn return_from_pool(
        &mut self,
        caller: Address,
        pool: Address,
        to: Address,
        amount: f64,
    ) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        self.ledger.transfer(pool, to, amount, Self::SYMBOL)
    }

    pub fn transfer(&mut self, from: Address, to: Address, amount: f64) -> Result<(), ProtocolError> {
        if to == self.address || to == self.stability_pool || to == self.vessel_manager {
            return Err(ProtocolError::UnauthorizedCaller {
                contract: "VUSDToken",
                caller: from,
            });
        }
        self.ledger.transfer(from, to, amount, Self::SYMBOL)
    }
}

/// The governance token. The whole supply is minted at construction:
/// the community issuance share, bounty and LP allocations, and the
/// remainder to the multisig.
#[derive(Clone, Debug)]
pub struct GrvtToken {
    pub address: Address,
    pub links: Links,
    staking: Address,
    ledger: Balances,
}

impl GrvtToken {
    pub const SYMBOL: &'static str = "GRVT";

    pub fn new(
        address: Address,
        community_issuance: Address,
        staking: Address,
        bounty: Address,
        lp_rewards: Address,
        multisig: Address,
        params: &ProtocolParams,
    ) -> Self {
        let mut ledger = Balances::default();
        let community = params.community_issuance_cap;
        let bounty_amount = params.bounty_allocation;
        let lp_amount = params.lp_rewards_allocation;
        let multisig_amount = params.grvt_total_supply - community - bounty_amount - lp_amount;

        ledger.credit(community_issuance, community);
        ledger.credit(bounty, bounty_amount);
        ledger.credit(lp_rewards, lp_amount);
        ledger.credit(multisig, multisig_amount.max(0.0));
        ledger.total_supply = community + bounty_amount + lp_amount + multisig_amount.max(0.0);

        Self {
            address,
            links: Links::constructed("GRVTToken", vec![community_issuance, staking]),
            staking,
            ledger,
        }
    }

    pub fn balance_of(&self, account: Address) -> f64 {
        self.ledger.balance_of(account)
    }

    pub fn total_supply(&self) -> f64 {
        self.ledger.total_supply
    }

    pub fn transfer(&mut self, from: Address, to: Address, amount: f64) -> Result<(), ProtocolError> {
        self.ledger.transfer(from, to, amount, Self::SYMBOL)
    }

    pub fn send_to_staking(
        &mut self,
        caller: Address,
        from: Address,
        amount: f64,
    ) -> Result<(), ProtocolError> {
        if caller != self.staking {
            return Err(ProtocolError::UnauthorizedCaller {
                contract: "GRVTToken",
                caller,
            });
        }
        self.ledger.transfer(from, self.staking, amount, Self::SYMBOL)
    }
}
