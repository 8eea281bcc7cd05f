//! Per-tick scheduler driver.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::coalition::{ClassBudgets, CoalitionAllocator};
use crate::config::{validate_d2d_penalty, SchedulerConfig};
use crate::demand::class_demands;
use crate::exp_pf::FairBandAllocator;
use crate::models::{AllocationInvariantError, AllocationMap, ConnectionId, TrafficClass};
use crate::oracle::ChannelOracle;
use crate::registry::{ClassificationError, Classifier, FlowRegistry};
use crate::{log_changes, log_checks};

use super::stats::SchedulerStats;

/// Errors that can occur during a tick.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Classification failed: {0}")]
    Classification(#[from] ClassificationError),
    #[error("Allocation invariant violated: {0}")]
    AllocationInvariant(#[from] AllocationInvariantError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Multi-class fair band scheduler.
///
/// Owns the flow registry and the oracle it reads channel state from. Each
/// [`Scheduler::tick`] runs to completion: classify, estimate demand, split
/// the pool between classes, then distribute each class budget band by band.
pub struct Scheduler<O: ChannelOracle> {
    oracle: O,
    config: SchedulerConfig,
    classifier: Classifier,
    registry: FlowRegistry,

    // Carried between ticks
    previous: AllocationMap,
    last_budgets: ClassBudgets,
    stats: SchedulerStats,
}

impl<O: ChannelOracle> Scheduler<O> {
    pub fn new(oracle: O, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::with_classifier(oracle, config, Classifier::default())
    }

    pub fn with_classifier(
        oracle: O,
        config: SchedulerConfig,
        classifier: Classifier,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            oracle,
            config,
            classifier,
            registry: FlowRegistry::new(),
            previous: AllocationMap::new(),
            last_budgets: ClassBudgets::default(),
            stats: SchedulerStats::default(),
        })
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// The oracle may only be changed between ticks.
    pub fn oracle_mut(&mut self) -> &mut O {
        &mut self.oracle
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn classifier_mut(&mut self) -> &mut Classifier {
        &mut self.classifier
    }

    pub fn d2d_penalty(&self) -> f64 {
        self.config.d2d_penalty
    }

    pub fn set_d2d_penalty(&mut self, value: f64) -> Result<(), SchedulerError> {
        validate_d2d_penalty(value)?;
        self.config.d2d_penalty = value;
        Ok(())
    }

    /// Budgets computed by the last successful tick.
    pub fn last_budgets(&self) -> &ClassBudgets {
        &self.last_budgets
    }

    /// Map returned by the last successful tick.
    pub fn last_allocation(&self) -> &AllocationMap {
        &self.previous
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Schedule one TTI over the oracle's whole band pool.
    pub fn tick_full_pool(
        &mut self,
        active: &BTreeSet<ConnectionId>,
    ) -> Result<AllocationMap, SchedulerError> {
        let total_bands = self.oracle.total_bands();
        self.tick(active, total_bands)
    }

    /// Schedule one TTI.
    ///
    /// On error no map is produced, the registry stays consistent and the
    /// next tick may proceed normally.
    pub fn tick(
        &mut self,
        active: &BTreeSet<ConnectionId>,
        total_bands: u16,
    ) -> Result<AllocationMap, SchedulerError> {
        let verbosity = self.config.verbosity;

        let changes = self
            .registry
            .update(active, &self.oracle, &self.classifier, &self.config)?;
        if !changes.is_empty() {
            log_changes!(
                verbosity,
                "tick: +{:?} -{:?} ({} flows tracked)",
                changes.added,
                changes.removed,
                self.registry.len()
            );
        }

        // Grants left behind by a failed tick must not leak into this one.
        self.registry.clear_grants();
        self.registry.refresh(&self.oracle, total_bands);

        let demands = class_demands(&self.registry, total_bands, self.config.d2d_penalty);
        for class in TrafficClass::priority_order() {
            log_checks!(
                verbosity,
                "tick: {} flows={} demand={}",
                class,
                self.registry.members(class).len(),
                demands[class.index()]
            );
        }

        let budgets = CoalitionAllocator::new(verbosity).split_pool(demands, total_bands)?;
        let mut map = AllocationMap::new();

        if budgets.total() == 0 {
            log_checks!(verbosity, "tick: nothing to schedule");
        } else {
            let allocator = FairBandAllocator::new(
                self.config.d2d_penalty,
                self.config.min_average_throughput,
                verbosity,
            );
            for (class, budget) in budgets.iter() {
                let partial =
                    allocator.assign(&mut self.registry, class, budget, total_bands, &map)?;
                log_changes!(
                    verbosity,
                    "tick: {} budget={}/{} shapley={:.3} granted={}",
                    class,
                    budget,
                    total_bands,
                    budgets.shapley_value(class),
                    partial.len()
                );
                map.merge(partial)?;
            }
        }

        if let Some((band, _)) = map.iter().find(|(band, _)| *band >= total_bands) {
            return Err(AllocationInvariantError::BandOutOfRange { band, total_bands }.into());
        }

        map.mark_retained(&self.previous);
        self.stats.record(&map);
        self.registry.on_tti(self.config.throughput_smoothing);
        self.previous = map.clone();
        self.last_budgets = budgets;
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use crate::oracle::{ConnectionInfo, OracleSnapshot};

    fn set(ids: &[ConnectionId]) -> BTreeSet<ConnectionId> {
        ids.iter().copied().collect()
    }

    /// cbr=4, voip=2, video=6 bands of demand on a 10 band pool.
    fn mixed_oracle() -> OracleSnapshot {
        let mut oracle = OracleSnapshot::new(10);
        oracle.set_connection(1, ConnectionInfo::new(1, "inet::UDPBasicApp").backlog(200));
        oracle.set_connection(2, ConnectionInfo::new(2, "inet::TCPSessionApp").backlog(200));
        oracle.set_connection(3, ConnectionInfo::new(3, "VoIPSender").backlog(200));
        oracle.set_connection(4, ConnectionInfo::new(4, "inet::UDPVideoStreamSvr").backlog(400));
        oracle.set_connection(5, ConnectionInfo::new(5, "inet::UDPVideoStreamCli").backlog(200));
        for node in 1..=5 {
            oracle.set_flat_throughput(node, Direction::Downlink, 100.0);
        }
        oracle
    }

    fn assert_no_double_booking(map: &AllocationMap, total_bands: u16) {
        let bands: Vec<_> = map.iter().map(|(b, _)| b).collect();
        let mut unique = bands.clone();
        unique.dedup();
        assert_eq!(bands, unique);
        assert!(bands.iter().all(|&b| b < total_bands));
    }

    #[test]
    fn test_mixed_tick_exhausts_pool() {
        let mut scheduler = Scheduler::new(mixed_oracle(), SchedulerConfig::default()).unwrap();
        let map = scheduler.tick(&set(&[1, 2, 3, 4, 5]), 10).unwrap();

        let budgets = scheduler.last_budgets();
        assert_eq!(budgets.budget(TrafficClass::Cbr), 3);
        assert_eq!(budgets.budget(TrafficClass::Voip), 2);
        assert_eq!(budgets.budget(TrafficClass::Video), 5);

        assert_eq!(map.len(), 10);
        assert_eq!(map.bands_for_class(TrafficClass::Cbr), 3);
        assert_eq!(map.bands_for_class(TrafficClass::Voip), 2);
        assert_eq!(map.bands_for_class(TrafficClass::Video), 5);
        assert_no_double_booking(&map, 10);
    }

    #[test]
    fn test_single_flow_gets_every_band() {
        let mut oracle = OracleSnapshot::new(3);
        oracle.set_connection(8, ConnectionInfo::new(8, "inet::UDPSink").backlog(300));
        oracle.set_flat_throughput(8, Direction::Downlink, 100.0);
        let mut scheduler = Scheduler::new(oracle, SchedulerConfig::default()).unwrap();

        let map = scheduler.tick_full_pool(&set(&[8])).unwrap();
        assert_eq!(scheduler.last_budgets().budget(TrafficClass::Cbr), 3);
        assert_eq!(map.bands_for(8), 3);
    }

    #[test]
    fn test_no_connections_gives_empty_map() {
        let mut scheduler =
            Scheduler::new(OracleSnapshot::new(10), SchedulerConfig::default()).unwrap();
        let map = scheduler.tick(&BTreeSet::new(), 10).unwrap();
        assert!(map.is_empty());
        assert_eq!(scheduler.stats().ticks, 1);
        assert_eq!(scheduler.stats().empty_ticks, 1);
    }

    #[test]
    fn test_zero_backlog_gives_empty_map() {
        let mut oracle = mixed_oracle();
        for id in 1..=5 {
            oracle.connection_mut(id).unwrap().byte_backlog = 0;
        }
        let mut scheduler = Scheduler::new(oracle, SchedulerConfig::default()).unwrap();
        let map = scheduler.tick(&set(&[1, 2, 3, 4, 5]), 10).unwrap();
        assert!(map.is_empty());
        // flows stay registered
        assert_eq!(scheduler.registry().len(), 5);
    }

    #[test]
    fn test_unknown_hint_fails_tick_then_recovers() {
        let mut oracle = mixed_oracle();
        oracle.set_connection(9, ConnectionInfo::new(9, "inet::PingApp").backlog(100));
        let mut scheduler = Scheduler::new(oracle, SchedulerConfig::default()).unwrap();

        let err = scheduler.tick(&set(&[1, 9]), 10).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Classification(ClassificationError::UnknownHint {
                connection_id: 9,
                ..
            })
        ));
        assert!(scheduler.registry().is_empty());
        assert_eq!(scheduler.stats().ticks, 0);

        // caller dropped the offending flow
        let map = scheduler.tick(&set(&[1]), 10).unwrap();
        assert_eq!(map.bands_for(1), 2);
    }

    #[test]
    fn test_demand_below_pool_leaves_bands_free() {
        let mut scheduler = Scheduler::new(mixed_oracle(), SchedulerConfig::default()).unwrap();
        let map = scheduler.tick(&set(&[1, 3]), 10).unwrap();
        assert_eq!(scheduler.last_budgets().total(), 4);
        assert_eq!(map.len(), 4);
        assert_eq!(map.bands_for(1), 2);
        assert_eq!(map.bands_for(3), 2);
    }

    #[test]
    fn test_zero_penalty_starves_d2d() {
        let mut oracle = OracleSnapshot::new(6);
        oracle.set_connection(1, ConnectionInfo::new(1, "VoIPSender").backlog(300).d2d());
        oracle.set_connection(2, ConnectionInfo::new(2, "VoIPSender").backlog(300));
        oracle.set_flat_throughput(1, Direction::D2D, 100.0);
        oracle.set_flat_throughput(2, Direction::Downlink, 100.0);
        let config = SchedulerConfig {
            d2d_penalty: 0.0,
            ..SchedulerConfig::default()
        };
        let mut scheduler = Scheduler::new(oracle, config).unwrap();

        for _ in 0..3 {
            let map = scheduler.tick(&set(&[1, 2]), 6).unwrap();
            assert_eq!(map.bands_for(1), 0);
            // only the cellular flow's own demand counts
            assert_eq!(scheduler.last_budgets().budget(TrafficClass::Voip), 3);
            assert_eq!(map.bands_for(2), 3);
            assert_eq!(map.len(), 3);
        }
        assert_eq!(scheduler.registry().members(TrafficClass::Voip), &[1, 2]);
    }

    #[test]
    fn test_zero_penalty_d2d_class_leaves_pool_to_others() {
        let mut oracle = OracleSnapshot::new(10);
        oracle.set_connection(1, ConnectionInfo::new(1, "VoIPSender").backlog(500).d2d());
        oracle.set_connection(2, ConnectionInfo::new(2, "inet::UDPSink").backlog(1000));
        oracle.set_flat_throughput(1, Direction::D2D, 100.0);
        oracle.set_flat_throughput(2, Direction::Downlink, 100.0);
        let config = SchedulerConfig {
            d2d_penalty: 0.0,
            ..SchedulerConfig::default()
        };
        let mut scheduler = Scheduler::new(oracle, config).unwrap();

        let map = scheduler.tick(&set(&[1, 2]), 10).unwrap();
        let budgets = scheduler.last_budgets();
        assert_eq!(budgets.budget(TrafficClass::Voip), 0);
        assert_eq!(budgets.budget(TrafficClass::Cbr), 10);
        assert_eq!(map.len(), 10);
        assert_eq!(map.bands_for(2), 10);

        // a positive penalty brings the D2D demand back into the split
        scheduler.set_d2d_penalty(0.5).unwrap();
        let map = scheduler.tick(&set(&[1, 2]), 10).unwrap();
        assert!(scheduler.last_budgets().budget(TrafficClass::Voip) > 0);
        assert!(map.bands_for(1) > 0);
        assert_eq!(map.len(), 10);
    }

    #[test]
    fn test_long_head_of_line_wait_loses_the_band() {
        let mut oracle = OracleSnapshot::new(1);
        oracle.set_connection(1, ConnectionInfo::new(1, "VoIPSender").backlog(100).delay(90.0));
        oracle.set_connection(2, ConnectionInfo::new(2, "VoIPSender").backlog(100));
        oracle.set_flat_throughput(1, Direction::Downlink, 100.0);
        oracle.set_flat_throughput(2, Direction::Downlink, 100.0);
        let mut scheduler = Scheduler::new(oracle, SchedulerConfig::default()).unwrap();

        // exp(0.1) for flow 1 against exp(1.0) for flow 2
        let map = scheduler.tick_full_pool(&set(&[1, 2])).unwrap();
        assert_eq!(map.get(0).map(|g| g.connection_id), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_registered_hint_and_resized_pool() {
        let mut oracle = OracleSnapshot::new(2);
        oracle.set_connection(9, ConnectionInfo::new(9, "inet::PingApp").backlog(1000));
        let mut scheduler = Scheduler::new(oracle, SchedulerConfig::default()).unwrap();
        assert!(scheduler.tick_full_pool(&set(&[9])).is_err());

        scheduler
            .classifier_mut()
            .register("inet::PingApp", TrafficClass::Cbr);
        scheduler.oracle_mut().set_total_bands(4);
        scheduler
            .oracle_mut()
            .set_flat_throughput(9, Direction::Downlink, 100.0);

        let map = scheduler.tick_full_pool(&set(&[9])).unwrap();
        assert_eq!(scheduler.registry().flow(9).unwrap().class, TrafficClass::Cbr);
        assert_eq!(scheduler.last_budgets().budget(TrafficClass::Cbr), 4);
        assert_eq!(map.bands_for(9), 4);
        assert_no_double_booking(&map, 4);
    }

    #[test]
    fn test_set_d2d_penalty_validates() {
        let mut scheduler =
            Scheduler::new(OracleSnapshot::new(1), SchedulerConfig::default()).unwrap();
        scheduler.set_d2d_penalty(0.25).unwrap();
        assert_eq!(scheduler.d2d_penalty(), 0.25);
        assert!(matches!(
            scheduler.set_d2d_penalty(2.0),
            Err(SchedulerError::InvalidConfig(_))
        ));
        assert_eq!(scheduler.d2d_penalty(), 0.25);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SchedulerConfig {
            d2d_penalty: -1.0,
            ..SchedulerConfig::default()
        };
        assert!(Scheduler::new(OracleSnapshot::new(1), config).is_err());
    }

    #[test]
    fn test_retained_flag_and_reset_hook() {
        let mut oracle = OracleSnapshot::new(2);
        oracle.set_connection(1, ConnectionInfo::new(1, "inet::UDPSink").backlog(200));
        oracle.set_flat_throughput(1, Direction::Downlink, 100.0);
        let mut scheduler = Scheduler::new(oracle, SchedulerConfig::default()).unwrap();

        let first = scheduler.tick(&set(&[1]), 2).unwrap();
        assert!(first.iter().all(|(_, g)| !g.retained));

        let flow = scheduler.registry().flow(1).unwrap();
        assert_eq!(flow.bands_granted, 0);
        assert!(flow.bytes_granted.abs() < 1e-9);
        // 0.9 * 0 + 0.1 * 200
        assert!((flow.average_throughput - 20.0).abs() < 1e-9);

        let second = scheduler.tick(&set(&[1]), 2).unwrap();
        assert!(second.iter().all(|(_, g)| g.retained));
        assert_eq!(scheduler.stats().bands(TrafficClass::Cbr), 4);
    }

    #[test]
    fn test_budget_properties_across_ticks() {
        let mut scheduler = Scheduler::new(mixed_oracle(), SchedulerConfig::default()).unwrap();
        let rosters: [&[ConnectionId]; 5] =
            [&[1, 2, 3, 4, 5], &[3, 4], &[1, 5], &[2, 3, 5], &[4]];
        for pool in [1u16, 4, 7, 10] {
            for roster in rosters {
                let map = scheduler.tick(&set(roster), pool).unwrap();
                let budgets = scheduler.last_budgets();
                assert_eq!(
                    u64::from(budgets.total()),
                    budgets.total_demand().min(u64::from(pool))
                );
                for (class, budget) in budgets.iter() {
                    assert!(budget <= budgets.demand(class));
                    assert!(map.bands_for_class(class) as u32 <= budget);
                }
                assert_no_double_booking(&map, pool);
            }
        }
    }
}
