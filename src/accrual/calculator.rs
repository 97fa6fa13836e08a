use rust_decimal::{Decimal, RoundingStrategy};

use super::models::{OrderGood, RewardRule, RewardType};
use crate::error::{AppError, AppResult};

/// Accruals are stored with cent precision.
pub const ACCRUAL_SCALE: u32 = 2;

/// Compute the accrual for an order's line items.
///
/// Every `(item, rule)` pair where `rule.match_key` is a substring of the
/// item description contributes: `price * reward / 100` for percent rules,
/// a flat `reward` for point rules. Matching is plain, case-sensitive
/// substring containment, so one item can collect several rules.
///
/// The sum is rounded once, half-up (midpoint away from zero), to two places.
/// Amounts outside the decimal range are an error, never a panic.
pub fn compute_accrual(goods: &[OrderGood], rules: &[RewardRule]) -> AppResult<Decimal> {
    let mut accrual = Decimal::ZERO;

    for good in goods {
        for rule in rules {
            if !good.description.contains(rule.match_key.as_str()) {
                continue;
            }

            let reward = match rule.reward_type {
                RewardType::Percent => good
                    .price
                    .checked_mul(rule.reward)
                    .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED)),
                RewardType::Points => Some(rule.reward),
            };

            accrual = reward
                .and_then(|reward| accrual.checked_add(reward))
                .ok_or_else(|| {
                    AppError::Calculation(format!(
                        "accrual overflow on item {:?} with rule {:?}",
                        good.description, rule.match_key
                    ))
                })?;
        }
    }

    Ok(round_accrual(accrual))
}

pub fn round_accrual(value: Decimal) -> Decimal {
    let mut rounded =
        value.round_dp_with_strategy(ACCRUAL_SCALE, RoundingStrategy::MidpointAwayFromZero);
    // Keep "0.00" rather than "0" so stored and serialized values look alike.
    rounded.rescale(ACCRUAL_SCALE);
    rounded
}
