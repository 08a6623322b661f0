use tracing::debug;

use super::Address;
use crate::error::ProtocolError;

/// Settable ETH/USD feed.
#[derive(Clone, Debug)]
pub struct PriceFeedTestnet {
    pub address: Address,
    price: f64,
}

impl PriceFeedTestnet {
    pub fn new(address: Address) -> Self {
        Self { address, price: 0.0 }
    }

    pub fn get_price(&self) -> f64 {
        self.price
    }

    pub fn set_price(&mut self, price: f64) -> Result<(), ProtocolError> {
        if !(price.is_finite() && price > 0.0) {
            return Err(ProtocolError::InvalidPrice(price));
        }
        self.price = price;
        debug!(price, "price feed updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_positive_price() {
        let mut feed = PriceFeedTestnet::new(Address(1));
        assert!(feed.set_price(0.0).is_err());
        assert!(feed.set_price(f64::NAN).is_err());
        feed.set_price(1234.5).unwrap();
        assert_eq!(feed.get_price(), 1234.5);
    }
}
