//! Exponential/proportional-fair distribution of a class budget.
//!
//! score(flow, band) = exp((T - W) / T) * R(band) / (A + G) * P
//!
//! where T is the flow's delay target (the exponential term is 1 for flows
//! without one), W its head-of-line wait, R its expected bytes on the band,
//! A its long-term average throughput (floored), G the bytes granted so far
//! this tick and P the D2D penalty (1 for cellular flows).
//!
//! Bands go out one at a time and every grant raises G, so a flow that
//! just won a band is less attractive for the next one.

use crate::demand::{flow_demand, is_schedulable};
use crate::models::{
    AllocationInvariantError, AllocationMap, Band, BandGrant, ConnectionId, Flow, TrafficClass,
};
use crate::registry::FlowRegistry;
use crate::{log_checks, log_debug};

#[derive(Clone, Debug)]
pub struct FairBandAllocator {
    d2d_penalty: f64,
    min_average_throughput: f64,
    verbosity: u8,
}

impl FairBandAllocator {
    pub fn new(d2d_penalty: f64, min_average_throughput: f64, verbosity: u8) -> Self {
        Self {
            d2d_penalty,
            min_average_throughput,
            verbosity,
        }
    }

    fn penalty_for(&self, flow: &Flow) -> f64 {
        if flow.is_d2d {
            self.d2d_penalty
        } else {
            1.0
        }
    }

    /// EXP-PF score of giving `band` to `flow` right now.
    pub fn score(&self, flow: &Flow, band: Band) -> f64 {
        let urgency = match flow.target_delay_ms() {
            Some(target) if target > 0.0 => {
                ((target - flow.head_of_line_delay_ms) / target).exp()
            }
            _ => 1.0,
        };
        let denominator =
            flow.average_throughput.max(self.min_average_throughput) + flow.bytes_granted;
        let score = urgency * flow.throughput_on(band) / denominator * self.penalty_for(flow);
        if score.is_nan() {
            0.0
        } else {
            score
        }
    }

    /// Hand out up to `budget` free bands to members of `class`.
    ///
    /// Bands already in `taken` are never touched. Grants are recorded on
    /// the winning flows as they happen.
    pub fn assign(
        &self,
        registry: &mut FlowRegistry,
        class: TrafficClass,
        budget: u32,
        total_bands: u16,
        taken: &AllocationMap,
    ) -> Result<AllocationMap, AllocationInvariantError> {
        let mut partial = AllocationMap::new();
        if budget == 0 {
            return Ok(partial);
        }

        let candidates: Vec<(ConnectionId, u32)> = registry
            .members(class)
            .iter()
            .filter_map(|&id| registry.flow(id))
            .filter_map(|flow| {
                let demand = flow_demand(flow, total_bands);
                if demand == 0 {
                    return None;
                }
                if !is_schedulable(flow, self.d2d_penalty) {
                    log_checks!(self.verbosity, "exp-pf: {} excluded by d2d penalty", flow);
                    return None;
                }
                Some((flow.connection_id, demand))
            })
            .collect();

        for _ in 0..budget {
            let free: Vec<Band> = (0..total_bands)
                .filter(|b| !taken.contains(*b) && !partial.contains(*b))
                .collect();
            if free.is_empty() {
                break;
            }

            let unsatisfied: Vec<ConnectionId> = candidates
                .iter()
                .filter(|(id, demand)| {
                    registry
                        .flow(*id)
                        .is_some_and(|flow| flow.bands_granted < *demand)
                })
                .map(|(id, _)| *id)
                .collect();
            let pool: Vec<ConnectionId> = if unsatisfied.is_empty() {
                candidates.iter().map(|(id, _)| *id).collect()
            } else {
                unsatisfied
            };

            let Some((winner, band, score)) = self.best_pair(registry, &pool, &free) else {
                log_checks!(
                    self.verbosity,
                    "exp-pf: no eligible {} flow, leaving band budget unused",
                    class
                );
                break;
            };

            if let Some(flow) = registry.flow_mut(winner) {
                let bytes = flow.grant(band);
                log_debug!(
                    self.verbosity,
                    "exp-pf: band {} -> {} (score {:.4}, {} bytes)",
                    band,
                    flow,
                    score,
                    bytes
                );
            }
            partial.insert(
                band,
                BandGrant {
                    connection_id: winner,
                    class,
                    retained: false,
                },
            )?;
        }

        Ok(partial)
    }

    /// Highest-scoring (flow, band); ties go to the lower connection id,
    /// then the lower band.
    fn best_pair(
        &self,
        registry: &FlowRegistry,
        pool: &[ConnectionId],
        free: &[Band],
    ) -> Option<(ConnectionId, Band, f64)> {
        let mut best: Option<(ConnectionId, Band, f64)> = None;
        let mut ids = pool.to_vec();
        ids.sort_unstable();
        for id in ids {
            let Some(flow) = registry.flow(id) else {
                continue;
            };
            for &band in free {
                let score = self.score(flow, band);
                if best.map_or(true, |(_, _, top)| score > top) {
                    best = Some((id, band, score));
                }
            }
        }
        best
    }
}
