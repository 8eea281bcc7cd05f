//! Inter-class split of the band pool.
//!
//! Traffic classes play a coalition game whose worth is their summed demand
//! capped at the pool size. The Shapley value gives each class a fair real
//! share, and the repair pass turns the shares into whole bands.

mod repair;
pub mod shapley;

pub use repair::repair_shares;
pub use shapley::{shapley_values, CappedDemandGame, CoalitionGame};

use crate::log_debug;
use crate::models::{AllocationInvariantError, TrafficClass};

/// Bands awarded to every class for one tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassBudgets {
    budgets: [u32; TrafficClass::COUNT],
    demands: [u32; TrafficClass::COUNT],
    shapley: [f64; TrafficClass::COUNT],
}

impl ClassBudgets {
    pub fn budget(&self, class: TrafficClass) -> u32 {
        self.budgets[class.index()]
    }

    pub fn demand(&self, class: TrafficClass) -> u32 {
        self.demands[class.index()]
    }

    /// Real-valued share before rounding.
    pub fn shapley_value(&self, class: TrafficClass) -> f64 {
        self.shapley[class.index()]
    }

    pub fn total(&self) -> u32 {
        self.budgets.iter().sum()
    }

    pub fn total_demand(&self) -> u64 {
        self.demands.iter().map(|&d| u64::from(d)).sum()
    }

    /// `(class, budget)` in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (TrafficClass, u32)> + '_ {
        TrafficClass::priority_order()
            .into_iter()
            .map(move |class| (class, self.budget(class)))
    }
}

/// Splits the pool between classes.
#[derive(Clone, Debug, Default)]
pub struct CoalitionAllocator {
    verbosity: u8,
}

impl CoalitionAllocator {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }

    /// Budgets summing to `min(total demand, pool)`, each within its demand.
    ///
    /// `demands` is indexed by [`TrafficClass::index`].
    pub fn split_pool(
        &self,
        demands: [u32; TrafficClass::COUNT],
        pool: u16,
    ) -> Result<ClassBudgets, AllocationInvariantError> {
        let pool = u32::from(pool);
        if demands.iter().all(|&d| d == 0) || pool == 0 {
            return Ok(ClassBudgets {
                demands,
                ..ClassBudgets::default()
            });
        }

        let real_demands = demands.map(f64::from);
        let values = shapley_values(&CappedDemandGame::new(&real_demands, f64::from(pool)));
        let mut shapley = [0.0; TrafficClass::COUNT];
        shapley.copy_from_slice(&values);
        for class in TrafficClass::priority_order() {
            log_debug!(
                self.verbosity,
                "coalition: {} demand={} shapley={:.4}",
                class,
                demands[class.index()],
                shapley[class.index()]
            );
        }

        let repaired = repair_shares(&shapley, &demands, pool)?;
        let mut budgets = [0; TrafficClass::COUNT];
        budgets.copy_from_slice(&repaired);

        for class in TrafficClass::priority_order() {
            let (budget, demand) = (budgets[class.index()], demands[class.index()]);
            if budget > demand {
                return Err(AllocationInvariantError::BudgetExceedsDemand {
                    class,
                    budget,
                    demand,
                });
            }
        }

        Ok(ClassBudgets {
            budgets,
            demands,
            shapley,
        })
    }
}
