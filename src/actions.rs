//! Per-period agent behaviour.
//!
//! Each action reads the simulation context, issues protocol calls and
//! returns a named outcome. Actions only attempt calls the ledger will
//! accept: candidates that would be rejected (minimum debt, collateral
//! ratio, recovery mode) are skipped rather than submitted, so any error
//! that does surface is a genuine failure and aborts the run.

use rand::Rng;
use rand_distr::{ChiSquared, Distribution, Gamma};
use tracing::{debug, warn};

use crate::accounts::VesselProfile;
use crate::contracts::{Address, VesselAdjustment};
use crate::error::{Result, SimulationError};
use crate::price_path::normal;
use crate::simulation::SimulationContext;

/// Tolerance above the hard collateral ratio limits when sizing vessels.
const RATIO_MARGIN: f64 = 1e-6;

fn gamma(shape: f64, scale: f64) -> Result<Gamma<f64>> {
    Gamma::new(shape, scale).map_err(|e| SimulationError::Distribution(e.to_string()))
}

fn chi_squared(df: f64) -> Result<ChiSquared<f64>> {
    ChiSquared::new(df).map_err(|e| SimulationError::Distribution(e.to_string()))
}

/// Samples a vessel count, never negative.
fn draw_count(ctx: &mut SimulationContext, mean: f64, sd: f64) -> Result<usize> {
    let n: f64 = normal(mean, sd)?.sample(&mut ctx.rng);
    Ok(n.round().max(0.0) as usize)
}

/// Sends `amount` VUSD from the whale to `to` if the whale can afford it.
fn whale_top_up(ctx: &mut SimulationContext, to: Address, amount: f64) -> Result<bool> {
    if amount <= 0.0 {
        return Ok(true);
    }
    if ctx.contracts.vusd_token.balance_of(ctx.whale) < amount {
        return Ok(false);
    }
    ctx.contracts.vusd_token.transfer(ctx.whale, to, amount)?;
    Ok(true)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiquidationStep {
    pub liquidated: usize,
    pub coll_liquidated: f64,
    pub airdrop_gain: f64,
    pub liquidation_gain: f64,
    /// Annualized stability pool return per unit of VUSD deposited.
    pub stability_return: f64,
}

/// Triggers the GRVT airdrop to the stability pool, then liquidates the
/// riskiest vessel for as long as one is liquidatable.
pub fn liquidate_vessels(ctx: &mut SimulationContext) -> Result<LiquidationStep> {
    let index = ctx.index;
    let price = ctx.market.price_eth;
    let mut step = LiquidationStep::default();

    let issued = ctx.contracts.trigger_grvt_issuance()?;
    step.airdrop_gain = issued * ctx.market.price_grvt;

    while let Some(owner) = ctx.contracts.liquidation_candidate(price) {
        let out = ctx.contracts.liquidate(ctx.whale, owner)?;
        step.liquidated += 1;
        step.coll_liquidated += out.coll;
        step.liquidation_gain += out.coll_to_sp * price - out.debt_offset * ctx.market.price_vusd;

        if owner == ctx.whale {
            warn!(index, "whale vessel liquidated");
        } else if !ctx.accounts.deactivate(owner) {
            warn!(index, owner = %owner, "liquidated vessel had no active account");
        }
        if ctx.contracts.coll_surplus_pool.get_collateral(owner) > 0.0 {
            ctx.contracts.claim_collateral(owner)?;
        }
    }

    ctx.data.airdrop_gain[index] = step.airdrop_gain;
    ctx.data.liquidation_gain[index] = step.liquidation_gain;

    let deposits = ctx.contracts.stability_pool.get_total_vusd_deposits() * ctx.market.price_vusd;
    if deposits > 0.0 {
        let window = ctx.config.market.earning_window;
        step.stability_return =
            ctx.data.stability_gains(index, window) * ctx.config.periods_per_year / deposits;
    }

    if step.liquidated > 0 {
        debug!(
            index,
            liquidated = step.liquidated,
            coll = step.coll_liquidated,
            "liquidations processed"
        );
    }
    Ok(step)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloseStep {
    pub closed: usize,
    pub coll_returned: f64,
}

/// Closes a random selection of vessels. Owners short of VUSD to repay are
/// topped up by the whale. Nothing closes in recovery mode.
pub fn close_vessels(ctx: &mut SimulationContext) -> Result<CloseStep> {
    let mut step = CloseStep::default();
    let price = ctx.market.price_eth;
    if ctx.contracts.check_recovery_mode(price) {
        return Ok(step);
    }

    let b = &ctx.config.vessels;
    let (warmup, n_close, sd_close, beta_close) = (b.close_warmup, b.n_close, b.sd_close, b.beta_close);
    let n = if ctx.index < warmup {
        ctx.rng.gen_range(0.0..1.0_f64).round() as usize
    } else {
        let below_peg = (1.0 - ctx.market.price_vusd).max(0.0) * 100.0;
        draw_count(ctx, n_close + beta_close * below_peg, sd_close)?
    };
    let gas = ctx.contracts.params.gas_compensation;
    let ccr = ctx.contracts.params.ccr;

    for _ in 0..n.min(ctx.accounts.active_len()) {
        if ctx.contracts.vessel_manager.get_vessel_owners_count() <= 1 {
            break;
        }
        let pick = ctx.rng.gen_range(0..ctx.accounts.active_len());
        let owner = ctx.accounts.active()[pick].address;
        let Some(v) = ctx.contracts.vessel_manager.get_entire_debt_and_coll(owner) else {
            continue;
        };
        if ctx.contracts.new_tcr(-v.coll, -v.debt, price) < ccr {
            continue;
        }
        let shortfall = (v.debt - gas) - ctx.contracts.vusd_token.balance_of(owner);
        if shortfall > 0.0 && !whale_top_up(ctx, owner, shortfall + RATIO_MARGIN)? {
            continue;
        }
        step.coll_returned += ctx.contracts.close_vessel(owner)?;
        ctx.accounts.deactivate(owner);
        step.closed += 1;
    }
    Ok(step)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdjustStep {
    pub adjusted: usize,
    pub coll_added: f64,
    pub vusd_issued: f64,
    pub borrowing_fees: f64,
}

/// Pushes every vessel whose ICR drifted outside its owner's inattention
/// band back to the owner's target ratio.
pub fn adjust_vessels(ctx: &mut SimulationContext) -> Result<AdjustStep> {
    let mut step = AdjustStep::default();
    let price = ctx.market.price_eth;
    let p = ctx.contracts.params.clone();
    let max_fee = ctx.config.vessels.max_fee;

    for account in ctx.accounts.active().to_vec() {
        let owner = account.address;
        let profile = account.profile;
        let Some(v) = ctx.contracts.vessel_manager.get_entire_debt_and_coll(owner) else {
            continue;
        };
        let icr = v.coll * price / v.debt;
        let target = profile.cr_initial;
        let recovery = ctx.contracts.check_recovery_mode(price);
        let coin: bool = ctx.rng.gen_bool(0.5);

        let adjustment = if icr < profile.lower_bound() {
            let coll_needed = target * v.debt / price - v.coll;
            let repay_room = v.debt - p.gas_compensation - p.min_net_debt;
            let repay = (v.debt - v.coll * price / target)
                .min(repay_room)
                .min(ctx.contracts.vusd_token.balance_of(owner));
            if coin && repay > 0.0 {
                Some(VesselAdjustment::repay_debt(repay))
            } else if coll_needed > 0.0 && ctx.contracts.wallets.balance(owner) >= coll_needed {
                Some(VesselAdjustment::add_coll(coll_needed))
            } else {
                None
            }
        } else if icr > profile.upper_bound() && !recovery && target >= p.mcr {
            if coin {
                let rate = ctx
                    .contracts
                    .vessel_manager
                    .get_borrowing_rate_with_decay(ctx.contracts.now());
                let draw = (v.coll * price / target - v.debt) / (1.0 + rate);
                let debt_delta = draw * (1.0 + rate);
                let ok = draw > 0.0
                    && rate <= max_fee
                    && ctx.contracts.new_tcr(0.0, debt_delta, price) >= p.ccr + RATIO_MARGIN
                    && v.coll * price / (v.debt + debt_delta) >= p.mcr + RATIO_MARGIN;
                ok.then(|| VesselAdjustment::withdraw_debt(draw, max_fee))
            } else {
                let withdraw = v.coll - target * v.debt / price;
                let ok = withdraw > 0.0
                    && ctx.contracts.new_tcr(-withdraw, 0.0, price) >= p.ccr + RATIO_MARGIN
                    && (v.coll - withdraw) * price / v.debt >= p.mcr + RATIO_MARGIN;
                ok.then(|| VesselAdjustment::withdraw_coll(withdraw))
            }
        } else {
            None
        };

        let Some(adj) = adjustment else {
            continue;
        };
        let fee = ctx.contracts.adjust_vessel(owner, &adj)?;
        step.adjusted += 1;
        step.coll_added += adj.coll_deposit;
        if adj.is_debt_increase {
            step.vusd_issued += adj.debt_change;
            step.borrowing_fees += fee;
        }
    }
    Ok(step)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OpenStep {
    pub opened: usize,
    pub coll_added: f64,
    pub vusd_issued: f64,
    pub borrowing_fees: f64,
}

/// Opens new vessels for inactive accounts. Demand rises when VUSD trades
/// above one plus the borrowing fee.
pub fn open_vessels(ctx: &mut SimulationContext) -> Result<OpenStep> {
    let mut step = OpenStep::default();
    let price = ctx.market.price_eth;
    let p = ctx.contracts.params.clone();
    let b = ctx.config.vessels.clone();

    let n = if ctx.index == 1 {
        b.initial_open
    } else {
        let rate = ctx
            .contracts
            .vessel_manager
            .get_borrowing_rate_with_decay(ctx.contracts.now());
        let premium = (ctx.market.price_vusd - 1.0 - rate).max(0.0) * 100.0;
        draw_count(ctx, b.n_steady + b.beta_open * premium, b.sd_open)?
    };

    let coll_dist = gamma(b.collateral_gamma_k, b.collateral_gamma_theta)?;
    let cr_dist = chi_squared(b.target_cr_chi_square_df)?;
    let inattention_dist = gamma(b.rational_inattention_gamma_k, b.rational_inattention_gamma_theta)?;

    for _ in 0..n.min(ctx.accounts.inactive_len()) {
        // earlier opens in this loop can move the system out of recovery mode
        let recovery = ctx.contracts.check_recovery_mode(price);
        let rate = if recovery {
            0.0
        } else {
            ctx.contracts
                .vessel_manager
                .get_borrowing_rate_with_decay(ctx.contracts.now())
        };
        if rate > b.max_fee {
            break;
        }
        let Some(owner) = ctx.accounts.next_inactive() else {
            break;
        };
        let coll = coll_dist.sample(&mut ctx.rng);
        let mut cr_initial = b.target_cr_a + b.target_cr_b * cr_dist.sample(&mut ctx.rng);
        let rational_inattention = inattention_dist.sample(&mut ctx.rng);
        if recovery {
            cr_initial = cr_initial.max(p.ccr * (1.0 + RATIO_MARGIN) + RATIO_MARGIN);
        }

        let vusd_amount = (coll * price / cr_initial - p.gas_compensation) / (1.0 + rate);
        let composite = vusd_amount * (1.0 + rate) + p.gas_compensation;
        let icr = coll * price / composite;
        let min_icr = if recovery { p.ccr } else { p.mcr };
        if vusd_amount * (1.0 + rate) < p.min_net_debt + RATIO_MARGIN
            || icr < min_icr + RATIO_MARGIN
            || ctx.contracts.wallets.balance(owner) < coll
        {
            continue;
        }
        if !recovery && ctx.contracts.new_tcr(coll, composite, price) < p.ccr + RATIO_MARGIN {
            continue;
        }

        let opened = ctx.contracts.open_vessel(owner, b.max_fee, vusd_amount, coll)?;
        ctx.accounts.activate_next(VesselProfile {
            cr_initial,
            rational_inattention,
        });
        step.opened += 1;
        step.coll_added += coll;
        step.vusd_issued += vusd_amount;
        step.borrowing_fees += opened.fee;
    }
    Ok(step)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StabilityStep {
    pub deposited: f64,
    pub withdrawn: f64,
    pub target: f64,
}

/// Moves the stability pool towards the size implied by its return
/// relative to the natural rate.
pub fn stability_update(ctx: &mut SimulationContext, stability_return: f64) -> Result<StabilityStep> {
    let s = ctx.config.stability.clone();
    let current = ctx.contracts.stability_pool.get_total_vusd_deposits();
    let supply = ctx.contracts.vusd_token.total_supply();

    let natural_rate = normal(s.natural_rate, s.sd_natural_rate)?.sample(&mut ctx.rng);
    let noise = normal(0.0, s.sd_stability)?.sample(&mut ctx.rng);
    let target = (current * (1.0 + s.sensitivity * (stability_return - natural_rate) + noise))
        .clamp(0.0, s.max_share * supply);

    let mut step = StabilityStep {
        target,
        ..StabilityStep::default()
    };
    let delta = target - current;

    if delta > 0.0 {
        let mut remaining = delta;
        let mut depositors: Vec<Address> = ctx.accounts.active().iter().map(|a| a.address).collect();
        depositors.push(ctx.whale);
        for depositor in depositors {
            if remaining <= RATIO_MARGIN {
                break;
            }
            let amount = remaining.min(ctx.contracts.vusd_token.balance_of(depositor));
            if amount <= RATIO_MARGIN {
                continue;
            }
            ctx.contracts.provide_to_stability_pool(depositor, amount)?;
            remaining -= amount;
            step.deposited += amount;
        }
    } else if delta < 0.0 {
        let price = ctx.market.price_eth;
        let blocked = ctx
            .contracts
            .sorted_vessels
            .get_last()
            .and_then(|last| ctx.contracts.get_current_icr(last, price))
            .is_some_and(|icr| icr < ctx.contracts.params.mcr);
        if blocked {
            return Ok(step);
        }
        let mut remaining = -delta;
        // the whale withdraws last
        let mut depositors: Vec<Address> = ctx
            .contracts
            .stability_pool
            .depositors()
            .filter(|d| *d != ctx.whale)
            .collect();
        depositors.push(ctx.whale);
        for depositor in depositors {
            if remaining <= RATIO_MARGIN {
                break;
            }
            let deposit = ctx.contracts.stability_pool.get_compounded_vusd_deposit(depositor);
            if deposit <= 0.0 {
                continue;
            }
            let change = ctx
                .contracts
                .withdraw_from_stability_pool(depositor, remaining.min(deposit))?;
            remaining -= change.vusd;
            step.withdrawn += change.vusd;
        }
    }
    Ok(step)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StabilizerStep {
    pub price_vusd: f64,
    pub vusd_redeemed: f64,
    /// Redemption fee valued in USD.
    pub redemption_fee: f64,
    pub vusd_issued: f64,
    pub borrowing_fees: f64,
}

/// Moves the VUSD price with a liquidity shock and peg reversion, then
/// lets the whale arbitrage it back inside `[1 - redemption rate,
/// ceiling]` by issuing or redeeming VUSD.
pub fn price_stabilizer(ctx: &mut SimulationContext) -> Result<StabilizerStep> {
    let m = ctx.config.market.clone();
    let max_fee = ctx.config.vessels.max_fee;
    let p = ctx.contracts.params.clone();
    let price_eth = ctx.market.price_eth;
    let whale = ctx.whale;
    let now = ctx.contracts.now();

    let shock = normal(0.0, m.sd_liquidity)?.sample(&mut ctx.rng);
    let previous = ctx.market.price_vusd;
    let mut price = (previous + m.peg_reversion * (1.0 - previous) + shock).max(RATIO_MARGIN);
    let supply = ctx.contracts.vusd_token.total_supply();
    let redemption_rate = ctx
        .contracts
        .vessel_manager
        .get_redemption_rate_with_decay(now);
    let floor = 1.0 - redemption_rate;
    let mut step = StabilizerStep::default();

    if price > m.price_ceiling && supply > 0.0 {
        // supply needed to push the price down to the ceiling
        let wanted = supply * ((price / m.price_ceiling).powf(m.liquidity_elasticity) - 1.0);
        let recovery = ctx.contracts.check_recovery_mode(price_eth);
        let rate = ctx.contracts.vessel_manager.get_borrowing_rate_with_decay(now);
        if let Some(v) = ctx.contracts.vessel_manager.get_entire_debt_and_coll(whale) {
            let debt_delta = wanted * (1.0 + rate);
            let ok = !recovery
                && rate <= max_fee
                && ctx.contracts.new_tcr(0.0, debt_delta, price_eth) >= p.ccr + RATIO_MARGIN
                && v.coll * price_eth / (v.debt + debt_delta) >= p.mcr + RATIO_MARGIN;
            if ok {
                let fee = ctx
                    .contracts
                    .adjust_vessel(whale, &VesselAdjustment::withdraw_debt(wanted, max_fee))?;
                step.vusd_issued = wanted;
                step.borrowing_fees = fee;
                price = m.price_ceiling;
            }
        }
    } else if price < floor && supply > 0.0 {
        // supply to remove to lift the price back to the floor
        let wanted = supply * (1.0 - (price / floor).powf(m.liquidity_elasticity));
        let amount = wanted.min(ctx.contracts.vusd_token.balance_of(whale) - RATIO_MARGIN);
        let tcr = ctx.contracts.get_tcr(price_eth);
        if amount > 0.0 && tcr >= p.mcr {
            let hints = ctx.contracts.get_redemption_hints(amount, price_eth)?;
            debug!(
                requested = amount,
                truncated = hints.truncated_amount,
                first = ?hints.first_redemption_hint,
                partial_nicr = ?hints.partial_redemption_hint_nicr,
                "redemption hints"
            );
            if hints.truncated_amount > 0.0 {
                let out = ctx
                    .contracts
                    .redeem_collateral(whale, hints.truncated_amount, 1.0)?;
                for owner in &out.closed {
                    ctx.accounts.deactivate(*owner);
                    if ctx.contracts.coll_surplus_pool.get_collateral(*owner) > 0.0 {
                        ctx.contracts.claim_collateral(*owner)?;
                    }
                }
                step.vusd_redeemed = out.vusd_redeemed;
                step.redemption_fee = out.eth_fee * price_eth;
                let remaining = supply - out.vusd_redeemed;
                if remaining > 0.0 {
                    price = (price * (supply / remaining).powf(1.0 / m.liquidity_elasticity)).min(floor);
                }
            }
        }
    }

    step.price_vusd = price;
    ctx.market.price_vusd = price;
    Ok(step)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GrvtMarketStep {
    pub price_grvt: f64,
    pub annualized_earning: f64,
    pub market_cap: f64,
}

/// GRVT follows a drifting random walk during warm-up, then trades at a
/// fixed P/E multiple of annualized protocol fee earnings.
pub fn grvt_market(ctx: &mut SimulationContext) -> Result<GrvtMarketStep> {
    let m = ctx.config.market.clone();
    let index = ctx.index;
    let circulating = ctx.contracts.community_issuance.get_total_issued()
        + ctx.contracts.grvt_staking.get_total_staked();
    let annualized_earning =
        ctx.data.fee_earnings(index, m.earning_window) * ctx.config.periods_per_year;

    let mut price = ctx.market.price_grvt;
    if index < m.grvt_warmup {
        let change = normal(m.drift_grvt, m.sd_grvt)?.sample(&mut ctx.rng);
        price *= 1.0 + change;
    } else if circulating > 0.0 {
        price = m.pe_ratio * annualized_earning / circulating;
    }
    price = price.max(m.min_grvt_price);

    ctx.market.price_grvt = price;
    Ok(GrvtMarketStep {
        price_grvt: price,
        annualized_earning,
        market_cap: price * circulating,
    })
}
