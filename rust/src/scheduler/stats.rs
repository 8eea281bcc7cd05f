//! Cumulative allocation counters across ticks.

use crate::models::{AllocationMap, TrafficClass};

/// Running totals kept by the scheduler, updated after every successful tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Successful ticks
    pub ticks: u64,
    /// Ticks that produced an empty allocation map
    pub empty_ticks: u64,
    /// Bands granted per class, indexed by `TrafficClass::index`
    pub bands_per_class: [u64; TrafficClass::COUNT],
    /// Grants that repeated the previous tick's assignment
    pub retained_bands: u64,
}

impl SchedulerStats {
    pub fn record(&mut self, map: &AllocationMap) {
        self.ticks += 1;
        if map.is_empty() {
            self.empty_ticks += 1;
        }
        for (_, grant) in map.iter() {
            self.bands_per_class[grant.class.index()] += 1;
            if grant.retained {
                self.retained_bands += 1;
            }
        }
    }

    pub fn bands(&self, class: TrafficClass) -> u64 {
        self.bands_per_class[class.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BandGrant;

    #[test]
    fn test_record_counts_per_class() {
        let mut map = AllocationMap::new();
        map.insert(
            0,
            BandGrant {
                connection_id: 1,
                class: TrafficClass::Video,
                retained: true,
            },
        )
        .unwrap();
        map.insert(
            1,
            BandGrant {
                connection_id: 2,
                class: TrafficClass::Cbr,
                retained: false,
            },
        )
        .unwrap();

        let mut stats = SchedulerStats::default();
        stats.record(&map);
        stats.record(&AllocationMap::new());

        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.empty_ticks, 1);
        assert_eq!(stats.bands(TrafficClass::Video), 1);
        assert_eq!(stats.bands(TrafficClass::Cbr), 1);
        assert_eq!(stats.bands(TrafficClass::Voip), 0);
        assert_eq!(stats.retained_bands, 1);
    }
}
