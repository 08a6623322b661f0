//! Exogenous ETH price paths.
//!
//! ## Price Models
//! - Random walk (per-period drift plus Gaussian noise, the harness default)
//! - Geometric Brownian Motion
//! - Jump-diffusion (Merton model)
//! - Fixed (explicit list, for scenarios)
//!
//! Every path has exactly `n_sim` entries and never drops below the floor.

use rand::Rng;
use rand_distr::{Distribution, Normal, Poisson};
use serde::{Deserialize, Serialize};
use std::f64::consts::E;

use crate::error::{Result, SimulationError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceModel {
    RandomWalk,
    Gbm,
    JumpDiffusion,
    Fixed,
}

impl PriceModel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RandomWalk => "Random walk",
            Self::Gbm => "GBM",
            Self::JumpDiffusion => "Jump-Diffusion",
            Self::Fixed => "Fixed path",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricePathConfig {
    pub model: PriceModel,
    pub initial_price: f64,
    /// Per-period drift for the random walk, annual drift (mu) otherwise.
    pub drift: f64,
    /// Per-period sd for the random walk, annual volatility (sigma) otherwise.
    pub volatility: f64,
    pub jump_intensity: f64, // Jumps per year (lambda)
    pub jump_mean: f64,
    pub jump_std: f64,
    pub floor: f64,
    /// Used verbatim by `PriceModel::Fixed`.
    pub fixed: Vec<f64>,
}

impl Default for PricePathConfig {
    fn default() -> Self {
        Self {
            model: PriceModel::RandomWalk,
            initial_price: 2000.0,
            drift: 0.0,
            volatility: 0.02,
            jump_intensity: 5.0,
            jump_mean: -0.15,
            jump_std: 0.10,
            floor: 1.0,
            fixed: Vec::new(),
        }
    }
}

impl PricePathConfig {
    pub fn fixed(prices: Vec<f64>) -> Self {
        Self {
            model: PriceModel::Fixed,
            initial_price: prices.first().copied().unwrap_or(0.0),
            fixed: prices,
            ..Self::default()
        }
    }

    pub fn validate(&self, n_sim: usize) -> Result<()> {
        match self.model {
            PriceModel::Fixed => {
                if self.fixed.len() != n_sim {
                    return Err(SimulationError::Config(format!(
                        "fixed price path has {} entries, n_sim is {n_sim}",
                        self.fixed.len()
                    )));
                }
                if let Some(bad) = self.fixed.iter().find(|p| !(p.is_finite() && **p > 0.0)) {
                    return Err(SimulationError::Config(format!(
                        "fixed price path contains non-positive price {bad}"
                    )));
                }
            }
            _ => {
                if !(self.initial_price > 0.0 && self.floor > 0.0) {
                    return Err(SimulationError::Config(
                        "initial price and floor must be positive".to_string(),
                    ));
                }
                if self.volatility < 0.0 || self.jump_std < 0.0 || self.jump_intensity < 0.0 {
                    return Err(SimulationError::Config(
                        "volatility and jump parameters must be non-negative".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn normal(mean: f64, std_dev: f64) -> Result<Normal<f64>> {
    Normal::new(mean, std_dev).map_err(|e| SimulationError::Distribution(e.to_string()))
}

/// Generates `n_sim` prices; index 0 is the initial price.
pub fn generate_price_path(
    config: &PricePathConfig,
    n_sim: usize,
    periods_per_year: f64,
    rng: &mut impl Rng,
) -> Result<Vec<f64>> {
    config.validate(n_sim)?;
    if config.model == PriceModel::Fixed {
        return Ok(config.fixed.clone());
    }

    let dt = 1.0 / periods_per_year;
    let mut prices = Vec::with_capacity(n_sim);
    let mut price = config.initial_price;
    prices.push(price);

    let unit = normal(0.0, 1.0)?;
    let jump_size = normal(config.jump_mean, config.jump_std)?;
    let lambda_dt = config.jump_intensity * dt;

    for _ in 1..n_sim {
        match config.model {
            PriceModel::RandomWalk => {
                let z: f64 = unit.sample(rng);
                price *= 1.0 + config.drift + config.volatility * z;
            }

            PriceModel::Gbm => {
                let z: f64 = unit.sample(rng);
                let ret = (config.drift - 0.5 * config.volatility.powi(2)) * dt
                    + config.volatility * dt.sqrt() * z;
                price *= E.powf(ret);
            }

            PriceModel::JumpDiffusion => {
                let z: f64 = unit.sample(rng);
                let diffusion = (config.drift - 0.5 * config.volatility.powi(2)) * dt
                    + config.volatility * dt.sqrt() * z;

                let num_jumps = if lambda_dt > 0.0 {
                    let poisson = Poisson::new(lambda_dt)
                        .map_err(|e| SimulationError::Distribution(e.to_string()))?;
                    poisson.sample(rng) as u64
                } else {
                    0
                };

                let mut jump_component = 0.0;
                for _ in 0..num_jumps {
                    jump_component += jump_size.sample(rng);
                }

                price *= E.powf(diffusion + jump_component);
            }

            PriceModel::Fixed => unreachable!("fixed paths return early"),
        }

        price = price.max(config.floor);
        prices.push(price);
    }

    Ok(prices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_price_path_generation() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let config = PricePathConfig::default();
        let path = generate_price_path(&config, 100, 8760.0, &mut rng).unwrap();

        assert_eq!(path.len(), 100);
        assert!((path[0] - config.initial_price).abs() < 0.01);
        assert!(path.iter().all(|p| *p >= config.floor));
    }

    #[test]
    fn test_same_seed_same_path() {
        let config = PricePathConfig {
            model: PriceModel::JumpDiffusion,
            volatility: 1.5,
            jump_intensity: 500.0,
            ..PricePathConfig::default()
        };
        let a = generate_price_path(&config, 50, 8760.0, &mut ChaCha8Rng::seed_from_u64(3)).unwrap();
        let b = generate_price_path(&config, 50, 8760.0, &mut ChaCha8Rng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_floor_holds_under_crash() {
        let config = PricePathConfig {
            drift: -0.5,
            volatility: 0.0,
            floor: 50.0,
            ..PricePathConfig::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let path = generate_price_path(&config, 20, 8760.0, &mut rng).unwrap();
        assert_eq!(*path.last().unwrap(), 50.0);
    }

    #[test]
    fn test_fixed_path_must_match_length() {
        let config = PricePathConfig::fixed(vec![2000.0, 1900.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(
            generate_price_path(&config, 2, 8760.0, &mut rng).unwrap(),
            vec![2000.0, 1900.0]
        );
        assert!(generate_price_path(&config, 3, 8760.0, &mut rng).is_err());
        assert!(PricePathConfig::fixed(vec![2000.0, 0.0]).validate(2).is_err());
    }
}
