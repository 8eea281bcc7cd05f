//! Flow roster and traffic-class membership.
//!
//! The registry is the only owner of [`Flow`] values. Class membership lists
//! hold connection ids and are rebuilt from the roster on every update.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::config::SchedulerConfig;
use crate::log_checks;
use crate::models::{Band, ConnectionId, Flow, RealtimeTarget, TrafficClass};
use crate::oracle::ChannelOracle;

/// Errors raised while classifying a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    /// The oracle's hint matches no known traffic class.
    UnknownHint {
        connection_id: ConnectionId,
        hint: String,
    },
    /// The oracle has no hint for the connection.
    MissingHint { connection_id: ConnectionId },
}

impl std::fmt::Display for ClassificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownHint {
                connection_id,
                hint,
            } => write!(
                f,
                "Connection {}: application hint {:?} matches no traffic class",
                connection_id, hint
            ),
            Self::MissingHint { connection_id } => {
                write!(f, "Connection {}: no application hint", connection_id)
            }
        }
    }
}

impl std::error::Error for ClassificationError {}

/// Maps application-name hints to traffic classes.
#[derive(Clone, Debug)]
pub struct Classifier {
    table: FxHashMap<String, TrafficClass>,
}

impl Classifier {
    pub fn empty() -> Self {
        Self {
            table: FxHashMap::default(),
        }
    }

    /// Add or override a hint mapping.
    pub fn register(&mut self, hint: &str, class: TrafficClass) {
        self.table.insert(hint.to_string(), class);
    }

    pub fn lookup(&self, hint: &str) -> Option<TrafficClass> {
        self.table.get(hint).copied()
    }

    pub fn classify(
        &self,
        connection_id: ConnectionId,
        hint: Option<&str>,
    ) -> Result<TrafficClass, ClassificationError> {
        let hint = hint.ok_or(ClassificationError::MissingHint { connection_id })?;
        self.lookup(hint)
            .ok_or_else(|| ClassificationError::UnknownHint {
                connection_id,
                hint: hint.to_string(),
            })
    }
}

impl Default for Classifier {
    fn default() -> Self {
        let mut classifier = Self::empty();
        for hint in ["VoIPSender", "inet::SimpleVoIPSender", "VoIPReceiver"] {
            classifier.register(hint, TrafficClass::Voip);
        }
        for hint in [
            "inet::UDPBasicApp",
            "inet::UDPSink",
            "inet::TCPSessionApp",
            "inet::TCPSinkApp",
        ] {
            classifier.register(hint, TrafficClass::Cbr);
        }
        for hint in ["inet::UDPVideoStreamCli", "inet::UDPVideoStreamSvr"] {
            classifier.register(hint, TrafficClass::Video);
        }
        classifier
    }
}

/// What an [`FlowRegistry::update`] call changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryChanges {
    pub added: Vec<ConnectionId>,
    pub removed: Vec<ConnectionId>,
}

impl RegistryChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Arena of tracked flows keyed by connection id.
#[derive(Clone, Debug, Default)]
pub struct FlowRegistry {
    flows: FxHashMap<ConnectionId, Flow>,
    members: [Vec<ConnectionId>; TrafficClass::COUNT],
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync the roster with the active connection set.
    ///
    /// All new connections are classified before anything is mutated, so a
    /// classification failure leaves the registry exactly as it was.
    pub fn update<O: ChannelOracle + ?Sized>(
        &mut self,
        active: &BTreeSet<ConnectionId>,
        oracle: &O,
        classifier: &Classifier,
        config: &SchedulerConfig,
    ) -> Result<RegistryChanges, ClassificationError> {
        let mut created = Vec::new();
        for &connection_id in active {
            if self.flows.contains_key(&connection_id) {
                continue;
            }
            let hint = oracle.classification_hint(connection_id);
            let class = classifier.classify(connection_id, hint.as_deref())?;
            let mut flow = Flow::new(
                connection_id,
                oracle.node_id(connection_id),
                class,
                oracle.direction(connection_id),
                oracle.is_d2d(connection_id),
            );
            if let Some(max_delay_ms) = config.delay_target_ms(class) {
                flow.realtime_target = Some(RealtimeTarget {
                    max_delay_ms,
                    bytes_per_tti: oracle.byte_backlog(connection_id),
                });
            }
            log_checks!(
                config.verbosity,
                "registry: new flow {} (hint {:?})",
                flow,
                hint.as_deref().unwrap_or("")
            );
            created.push(flow);
        }

        let mut changes = RegistryChanges::default();
        self.flows.retain(|id, _| {
            let keep = active.contains(id);
            if !keep {
                changes.removed.push(*id);
            }
            keep
        });
        changes.removed.sort_unstable();
        for flow in created {
            changes.added.push(flow.connection_id);
            self.flows.insert(flow.connection_id, flow);
        }

        self.rebuild_members();
        Ok(changes)
    }

    fn rebuild_members(&mut self) {
        for list in self.members.iter_mut() {
            list.clear();
        }
        for flow in self.flows.values() {
            self.members[flow.class.index()].push(flow.connection_id);
        }
        for list in self.members.iter_mut() {
            list.sort_unstable();
        }
    }

    /// Reload backlog, head-of-line delay and per-band throughput.
    pub fn refresh<O: ChannelOracle + ?Sized>(&mut self, oracle: &O, total_bands: u16) {
        for flow in self.flows.values_mut() {
            flow.byte_backlog = oracle.byte_backlog(flow.connection_id);
            flow.head_of_line_delay_ms = oracle.head_of_line_delay(flow.connection_id);
            flow.expected_throughput = (0..total_bands)
                .map(|band: Band| oracle.expected_throughput(flow.node_id, band, flow.direction))
                .collect();
        }
    }

    /// Member connection ids of a class, ascending.
    pub fn members(&self, class: TrafficClass) -> &[ConnectionId] {
        &self.members[class.index()]
    }

    pub fn flow(&self, connection_id: ConnectionId) -> Option<&Flow> {
        self.flows.get(&connection_id)
    }

    pub fn flow_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Flow> {
        self.flows.get_mut(&connection_id)
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.flows.contains_key(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn clear_grants(&mut self) {
        for flow in self.flows.values_mut() {
            flow.clear_grants();
        }
    }

    /// Run every flow's per-tick reset hook.
    pub fn on_tti(&mut self, smoothing: f64) {
        for flow in self.flows.values_mut() {
            flow.on_tti(smoothing);
        }
    }
}
