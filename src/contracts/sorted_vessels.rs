use super::{Address, Contracts, Links};
use crate::error::ProtocolError;

/// Active vessels ordered by nominal collateral ratio, highest first.
/// The last entry is the riskiest vessel: first in line for liquidation
/// and redemption.
#[derive(Clone, Debug)]
pub struct SortedVessels {
    pub address: Address,
    pub links: Links,
    max_size: usize,
    // (owner, NICR), NICR descending
    nodes: Vec<(Address, f64)>,
}

impl SortedVessels {
    pub fn new(address: Address, owner: Address) -> Self {
        Self {
            address,
            links: Links::new("SortedVessels", owner),
            max_size: 0,
            nodes: Vec::new(),
        }
    }

    pub fn set_params(
        &mut self,
        caller: Address,
        max_size: usize,
        vessel_manager: Address,
        borrower_operations: Address,
    ) -> Result<(), ProtocolError> {
        self.links
            .register(caller, &[vessel_manager, borrower_operations])?;
        self.max_size = max_size;
        Ok(())
    }

    pub fn insert(&mut self, caller: Address, id: Address, nicr: f64) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        if self.nodes.len() >= self.max_size {
            return Err(ProtocolError::ListFull);
        }
        if self.contains(id) {
            return Err(ProtocolError::VesselActive(id));
        }
        let at = self.nodes.partition_point(|(_, n)| *n >= nicr);
        self.nodes.insert(at, (id, nicr));
        Ok(())
    }

    pub fn remove(&mut self, caller: Address, id: Address) -> Result<(), ProtocolError> {
        self.links.require_caller(caller)?;
        let at = self
            .position(id)
            .ok_or(ProtocolError::VesselNotActive(id))?;
        self.nodes.remove(at);
        Ok(())
    }

    pub fn re_insert(&mut self, caller: Address, id: Address, nicr: f64) -> Result<(), ProtocolError> {
        self.remove(caller, id)?;
        self.insert(caller, id, nicr)
    }

    fn position(&self, id: Address) -> Option<usize> {
        self.nodes.iter().position(|(a, _)| *a == id)
    }

    pub fn contains(&self, id: Address) -> bool {
        self.position(id).is_some()
    }

    pub fn get_size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get_max_size(&self) -> usize {
        self.max_size
    }

    pub fn get_first(&self) -> Option<Address> {
        self.nodes.first().map(|(a, _)| *a)
    }

    pub fn get_last(&self) -> Option<Address> {
        self.nodes.last().map(|(a, _)| *a)
    }

    /// Owners from the riskiest vessel upwards.
    pub fn iter_from_last(&self) -> impl Iterator<Item = Address> + '_ {
        self.nodes.iter().rev().map(|(a, _)| *a)
    }
}

/// Read-only helper that pre-computes redemption outcomes.
#[derive(Clone, Debug)]
pub struct HintHelpers {
    pub address: Address,
    pub links: Links,
}

impl HintHelpers {
    pub fn new(address: Address, owner: Address) -> Self {
        Self {
            address,
            links: Links::new("HintHelpers", owner),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RedemptionHints {
    /// First vessel a redemption would touch.
    pub first_redemption_hint: Option<Address>,
    /// NICR the partially redeemed vessel would end up with, if any.
    pub partial_redemption_hint_nicr: Option<f64>,
    /// Largest amount not exceeding the request that can be redeemed
    /// without hitting a cancelled partial redemption.
    pub truncated_amount: f64,
}

impl Contracts {
    pub fn get_redemption_hints(&self, amount: f64, price: f64) -> Result<RedemptionHints, ProtocolError> {
        self.hint_helpers.links.require_wired()?;
        let plan = self.plan_redemption(amount, price);
        Ok(RedemptionHints {
            first_redemption_hint: plan.lots.first().map(|lot| lot.owner),
            partial_redemption_hint_nicr: plan
                .lots
                .last()
                .filter(|lot| !lot.closes)
                .map(|lot| lot.new_nicr),
            truncated_amount: plan.vusd_total(),
        })
    }
}
