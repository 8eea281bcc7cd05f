//! Core data types for the resource-block scheduler.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Identifier of one data connection (logical channel).
pub type ConnectionId = u32;
/// Identifier of the node that owns a connection.
pub type NodeId = u16;
/// Index of a resource block in `[0, total_bands)`.
pub type Band = u16;

/// Link direction of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Downlink,
    Uplink,
    /// Device-to-device (peer) link.
    D2D,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dl" | "downlink" => Some(Self::Downlink),
            "ul" | "uplink" => Some(Self::Uplink),
            "d2d" => Some(Self::D2D),
            _ => None,
        }
    }
}

/// Traffic classes that compete for the band pool.
///
/// Declaration order is the fixed class priority order: realtime classes
/// come before best-effort, and this order breaks every tie between classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrafficClass {
    Voip,
    Video,
    /// Constant-bitrate / background traffic.
    Cbr,
}

impl TrafficClass {
    pub const COUNT: usize = 3;

    /// All classes in priority order.
    #[must_use]
    pub const fn priority_order() -> [Self; Self::COUNT] {
        [Self::Voip, Self::Video, Self::Cbr]
    }

    /// Position in [`TrafficClass::priority_order`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Voip => 0,
            Self::Video => 1,
            Self::Cbr => 2,
        }
    }

    #[must_use]
    pub const fn is_realtime(self) -> bool {
        matches!(self, Self::Voip | Self::Video)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Voip => "voip",
            Self::Video => "video",
            Self::Cbr => "cbr",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Delay and bitrate target of a realtime flow, fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RealtimeTarget {
    pub max_delay_ms: f64,
    pub bytes_per_tti: u64,
}

/// One active data connection as tracked by the registry.
#[derive(Clone, Debug)]
pub struct Flow {
    pub connection_id: ConnectionId,
    pub node_id: NodeId,
    pub class: TrafficClass,
    pub direction: Direction,
    pub is_d2d: bool,
    pub realtime_target: Option<RealtimeTarget>,
    /// Bytes waiting to be served in this TTI.
    pub byte_backlog: u64,
    /// How long the oldest queued packet has been waiting, in ms.
    pub head_of_line_delay_ms: f64,
    /// Expected bytes per band, refreshed every tick.
    pub expected_throughput: Vec<f64>,
    /// Exponentially smoothed bytes granted per tick.
    pub average_throughput: f64,
    /// Bytes granted so far in the current tick.
    pub bytes_granted: f64,
    /// Bands granted so far in the current tick.
    pub bands_granted: u32,
}

impl Flow {
    pub fn new(
        connection_id: ConnectionId,
        node_id: NodeId,
        class: TrafficClass,
        direction: Direction,
        is_d2d: bool,
    ) -> Self {
        Self {
            connection_id,
            node_id,
            class,
            direction,
            is_d2d,
            realtime_target: None,
            byte_backlog: 0,
            head_of_line_delay_ms: 0.0,
            expected_throughput: Vec::new(),
            average_throughput: 0.0,
            bytes_granted: 0.0,
            bands_granted: 0,
        }
    }

    pub fn target_delay_ms(&self) -> Option<f64> {
        self.realtime_target.map(|t| t.max_delay_ms)
    }

    /// Mean of the expected-throughput vector (0 when unknown).
    pub fn average_bytes_per_band(&self) -> f64 {
        if self.expected_throughput.is_empty() {
            return 0.0;
        }
        self.expected_throughput.iter().sum::<f64>() / self.expected_throughput.len() as f64
    }

    pub fn throughput_on(&self, band: Band) -> f64 {
        self.expected_throughput
            .get(band as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Record a band grant; returns the bytes it is expected to carry.
    pub fn grant(&mut self, band: Band) -> f64 {
        let bytes = self.throughput_on(band);
        self.bytes_granted += bytes;
        self.bands_granted += 1;
        bytes
    }

    /// Drop this tick's grants without touching the running average.
    pub fn clear_grants(&mut self) {
        self.bytes_granted = 0.0;
        self.bands_granted = 0;
    }

    /// Per-tick reset hook: fold this tick's grant into the average.
    pub fn on_tti(&mut self, smoothing: f64) {
        self.average_throughput =
            (1.0 - smoothing) * self.average_throughput + smoothing * self.bytes_granted;
        self.clear_grants();
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{}{}",
            self.class,
            self.connection_id,
            self.node_id,
            if self.is_d2d { "[d2d]" } else { "" }
        )
    }
}

/// Assignment of one band for the current tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BandGrant {
    pub connection_id: ConnectionId,
    pub class: TrafficClass,
    /// Same band went to the same connection in the previous tick.
    pub retained: bool,
}

/// Broken allocation invariant. Always a bug upstream, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationInvariantError {
    #[error("class budgets sum to {actual}, expected {expected}")]
    BudgetMismatch { expected: u32, actual: u32 },
    #[error("budget {budget} for class {class} exceeds its demand {demand}")]
    BudgetExceedsDemand {
        class: TrafficClass,
        budget: u32,
        demand: u32,
    },
    #[error("band {band} already granted to connection {existing}, refusing {incoming}")]
    DoubleBooked {
        band: Band,
        existing: ConnectionId,
        incoming: ConnectionId,
    },
    #[error("band {band} outside pool of {total_bands}")]
    BandOutOfRange { band: Band, total_bands: u16 },
}

/// Band → grant mapping produced fresh every tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationMap {
    grants: BTreeMap<Band, BandGrant>,
}

impl AllocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a grant, refusing to overwrite an existing band.
    pub fn insert(&mut self, band: Band, grant: BandGrant) -> Result<(), AllocationInvariantError> {
        match self.grants.entry(band) {
            btree_map::Entry::Occupied(existing) => Err(AllocationInvariantError::DoubleBooked {
                band,
                existing: existing.get().connection_id,
                incoming: grant.connection_id,
            }),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(grant);
                Ok(())
            }
        }
    }

    /// Merge a partial map into this one. Nothing is merged on conflict.
    pub fn merge(&mut self, partial: AllocationMap) -> Result<(), AllocationInvariantError> {
        if let Some((&band, grant)) = partial
            .grants
            .iter()
            .find(|(band, _)| self.grants.contains_key(band))
        {
            return Err(AllocationInvariantError::DoubleBooked {
                band,
                existing: self.grants[&band].connection_id,
                incoming: grant.connection_id,
            });
        }
        self.grants.extend(partial.grants);
        Ok(())
    }

    pub fn get(&self, band: Band) -> Option<&BandGrant> {
        self.grants.get(&band)
    }

    pub fn contains(&self, band: Band) -> bool {
        self.grants.contains_key(&band)
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Grants in ascending band order.
    pub fn iter(&self) -> impl Iterator<Item = (Band, &BandGrant)> {
        self.grants.iter().map(|(&band, grant)| (band, grant))
    }

    /// Number of bands granted to a connection.
    pub fn bands_for(&self, connection_id: ConnectionId) -> usize {
        self.grants
            .values()
            .filter(|g| g.connection_id == connection_id)
            .count()
    }

    /// Number of bands granted to a class.
    pub fn bands_for_class(&self, class: TrafficClass) -> usize {
        self.grants.values().filter(|g| g.class == class).count()
    }

    /// Flag every grant that repeats the previous tick's assignment.
    pub(crate) fn mark_retained(&mut self, previous: &AllocationMap) {
        for (band, grant) in self.grants.iter_mut() {
            grant.retained = previous
                .get(*band)
                .is_some_and(|prev| prev.connection_id == grant.connection_id);
        }
    }
}
