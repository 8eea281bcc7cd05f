//! Rounding real-valued shares into an exact integer partition.

use crate::models::AllocationInvariantError;

/// Shares this close to an integer are treated as that integer.
const SNAP_EPSILON: f64 = 1e-9;
/// Fractional remainders are compared at this resolution, so float noise
/// never overrides the priority tie-break.
const REMAINDER_RESOLUTION: f64 = 1e6;

/// Turn fractional shares into whole budgets summing to
/// `min(sum(demands), pool)`.
///
/// Players are indexed in priority order. Every player first gets the floor
/// of its share (capped at its demand); leftover units then go one at a
/// time to players with the largest fractional remainder, earlier players
/// winning ties, skipping players already at their demand.
pub fn repair_shares(
    shares: &[f64],
    demands: &[u32],
    pool: u32,
) -> Result<Vec<u32>, AllocationInvariantError> {
    debug_assert_eq!(shares.len(), demands.len());
    // u64 so that a handful of near-u32::MAX demands cannot wrap
    let total_demand: u64 = demands.iter().map(|&d| u64::from(d)).sum();
    let target = total_demand.min(u64::from(pool)) as u32;

    let mut budgets = Vec::with_capacity(shares.len());
    let mut remainders = Vec::with_capacity(shares.len());
    for (&share, &demand) in shares.iter().zip(demands) {
        let share = snap(share.max(0.0));
        let floor = (share.floor() as u32).min(demand);
        budgets.push(floor);
        remainders.push(((share - floor as f64) * REMAINDER_RESOLUTION).round() as i64);
    }

    let mut order: Vec<usize> = (0..budgets.len()).collect();
    order.sort_by(|&a, &b| remainders[b].cmp(&remainders[a]).then(a.cmp(&b)));

    let mut remaining = i64::from(target) - budgets.iter().map(|&b| i64::from(b)).sum::<i64>();
    while remaining > 0 {
        let mut progressed = false;
        for &i in &order {
            if remaining == 0 {
                break;
            }
            if budgets[i] < demands[i] {
                budgets[i] += 1;
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    let actual: u64 = budgets.iter().map(|&b| u64::from(b)).sum();
    if actual != u64::from(target) {
        return Err(AllocationInvariantError::BudgetMismatch {
            expected: target,
            actual: u32::try_from(actual).unwrap_or(u32::MAX),
        });
    }
    Ok(budgets)
}

fn snap(value: f64) -> f64 {
    let rounded = value.round();
    if (value - rounded).abs() < SNAP_EPSILON {
        rounded
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_remainders_follow_priority() {
        // voip, video, cbr with shapley 8/6, 32/6, 20/6
        let shares = [8.0 / 6.0, 32.0 / 6.0, 20.0 / 6.0];
        let budgets = repair_shares(&shares, &[2, 6, 4], 10).unwrap();
        assert_eq!(budgets, vec![2, 5, 3]);
    }

    #[test]
    fn test_largest_remainder_first() {
        let shares = [1.2, 2.7, 3.1];
        let budgets = repair_shares(&shares, &[5, 5, 5], 7).unwrap();
        assert_eq!(budgets, vec![1, 3, 3]);
    }

    #[test]
    fn test_satisfied_player_skipped() {
        // first player already at its demand, leftover goes elsewhere
        let shares = [2.0, 1.5, 1.5];
        let budgets = repair_shares(&shares, &[2, 2, 2], 5).unwrap();
        assert_eq!(budgets, vec![2, 2, 1]);
    }

    #[test]
    fn test_near_integers_snap() {
        let shares = [2.9999999999999996, 3.0000000000000004, 4.0];
        let budgets = repair_shares(&shares, &[3, 3, 4], 10).unwrap();
        assert_eq!(budgets, vec![3, 3, 4]);
    }

    #[test]
    fn test_demand_below_pool() {
        let shares = [1.0, 0.0, 2.0];
        let budgets = repair_shares(&shares, &[1, 0, 2], 10).unwrap();
        assert_eq!(budgets, vec![1, 0, 2]);
    }

    #[test]
    fn test_all_zero() {
        let budgets = repair_shares(&[0.0, 0.0, 0.0], &[0, 0, 0], 10).unwrap();
        assert_eq!(budgets, vec![0, 0, 0]);
    }

    #[test]
    fn test_demands_summing_past_u32_target_the_pool() {
        let budgets = repair_shares(&[9.0, 1.0, 0.0], &[u32::MAX, u32::MAX, 0], 10).unwrap();
        assert_eq!(budgets, vec![9, 1, 0]);
    }

    #[test]
    fn test_inconsistent_shares_are_an_invariant_error() {
        // shares overshoot the pool: floors alone exceed the target
        let err = repair_shares(&[6.0, 6.0, 0.0], &[6, 6, 0], 10).unwrap_err();
        assert_eq!(
            err,
            AllocationInvariantError::BudgetMismatch {
                expected: 10,
                actual: 12
            }
        );
    }
}
