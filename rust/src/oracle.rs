//! Read-only view of the channel and buffer state the scheduler consumes.
//!
//! The scheduler owns its oracle and queries it during `tick()` only; the
//! oracle must return consistent values for the duration of one call.

use rustc_hash::FxHashMap;

use crate::models::{Band, ConnectionId, Direction, NodeId};

/// Channel, topology and buffer-status collaborator.
pub trait ChannelOracle {
    /// Application-level hint used to classify a connection.
    fn classification_hint(&self, connection_id: ConnectionId) -> Option<String>;

    /// Expected bytes a node can move on `band` in `direction` this TTI.
    fn expected_throughput(&self, node_id: NodeId, band: Band, direction: Direction) -> f64;

    fn is_d2d(&self, connection_id: ConnectionId) -> bool;

    fn total_bands(&self) -> u16;

    fn node_id(&self, connection_id: ConnectionId) -> NodeId;

    fn direction(&self, connection_id: ConnectionId) -> Direction;

    /// Queued bytes per TTI.
    fn byte_backlog(&self, connection_id: ConnectionId) -> u64;

    /// Head-of-line waiting time in ms.
    fn head_of_line_delay(&self, connection_id: ConnectionId) -> f64;
}

impl<T: ChannelOracle + ?Sized> ChannelOracle for Box<T> {
    fn classification_hint(&self, connection_id: ConnectionId) -> Option<String> {
        (**self).classification_hint(connection_id)
    }
    fn expected_throughput(&self, node_id: NodeId, band: Band, direction: Direction) -> f64 {
        (**self).expected_throughput(node_id, band, direction)
    }
    fn is_d2d(&self, connection_id: ConnectionId) -> bool {
        (**self).is_d2d(connection_id)
    }
    fn total_bands(&self) -> u16 {
        (**self).total_bands()
    }
    fn node_id(&self, connection_id: ConnectionId) -> NodeId {
        (**self).node_id(connection_id)
    }
    fn direction(&self, connection_id: ConnectionId) -> Direction {
        (**self).direction(connection_id)
    }
    fn byte_backlog(&self, connection_id: ConnectionId) -> u64 {
        (**self).byte_backlog(connection_id)
    }
    fn head_of_line_delay(&self, connection_id: ConnectionId) -> f64 {
        (**self).head_of_line_delay(connection_id)
    }
}

/// Per-connection facts held by [`OracleSnapshot`].
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub node_id: NodeId,
    pub hint: Option<String>,
    pub is_d2d: bool,
    pub direction: Direction,
    pub byte_backlog: u64,
    pub head_of_line_delay_ms: f64,
}

impl ConnectionInfo {
    pub fn new(node_id: NodeId, hint: &str) -> Self {
        Self {
            node_id,
            hint: Some(hint.to_string()),
            is_d2d: false,
            direction: Direction::Downlink,
            byte_backlog: 0,
            head_of_line_delay_ms: 0.0,
        }
    }

    pub fn d2d(mut self) -> Self {
        self.is_d2d = true;
        self.direction = Direction::D2D;
        self
    }

    pub fn backlog(mut self, bytes: u64) -> Self {
        self.byte_backlog = bytes;
        self
    }

    pub fn delay(mut self, ms: f64) -> Self {
        self.head_of_line_delay_ms = ms;
        self
    }
}

/// Table-driven oracle, filled by the caller before each tick.
///
/// Unknown connections have no hint, no backlog, and the node id encoded
/// in the upper 16 bits of the connection id.
#[derive(Clone, Debug, Default)]
pub struct OracleSnapshot {
    total_bands: u16,
    connections: FxHashMap<ConnectionId, ConnectionInfo>,
    throughput: FxHashMap<(NodeId, Direction), Vec<f64>>,
}

impl OracleSnapshot {
    pub fn new(total_bands: u16) -> Self {
        Self {
            total_bands,
            ..Self::default()
        }
    }

    pub fn set_total_bands(&mut self, total_bands: u16) {
        self.total_bands = total_bands;
    }

    pub fn set_connection(&mut self, connection_id: ConnectionId, info: ConnectionInfo) {
        self.connections.insert(connection_id, info);
    }

    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.remove(&connection_id)
    }

    pub fn connection_mut(&mut self, connection_id: ConnectionId) -> Option<&mut ConnectionInfo> {
        self.connections.get_mut(&connection_id)
    }

    /// Per-band throughput for a node/direction. Missing bands read as 0.
    pub fn set_throughput(&mut self, node_id: NodeId, direction: Direction, per_band: Vec<f64>) {
        self.throughput.insert((node_id, direction), per_band);
    }

    /// Same throughput on every band of the pool.
    pub fn set_flat_throughput(&mut self, node_id: NodeId, direction: Direction, bytes: f64) {
        let per_band = vec![bytes; self.total_bands as usize];
        self.set_throughput(node_id, direction, per_band);
    }
}

impl ChannelOracle for OracleSnapshot {
    fn classification_hint(&self, connection_id: ConnectionId) -> Option<String> {
        self.connections
            .get(&connection_id)
            .and_then(|c| c.hint.clone())
    }

    fn expected_throughput(&self, node_id: NodeId, band: Band, direction: Direction) -> f64 {
        self.throughput
            .get(&(node_id, direction))
            .and_then(|v| v.get(band as usize))
            .copied()
            .unwrap_or(0.0)
    }

    fn is_d2d(&self, connection_id: ConnectionId) -> bool {
        self.connections
            .get(&connection_id)
            .is_some_and(|c| c.is_d2d)
    }

    fn total_bands(&self) -> u16 {
        self.total_bands
    }

    fn node_id(&self, connection_id: ConnectionId) -> NodeId {
        match self.connections.get(&connection_id) {
            Some(c) => c.node_id,
            None => (connection_id >> 16) as NodeId,
        }
    }

    fn direction(&self, connection_id: ConnectionId) -> Direction {
        self.connections
            .get(&connection_id)
            .map_or(Direction::Downlink, |c| c.direction)
    }

    fn byte_backlog(&self, connection_id: ConnectionId) -> u64 {
        self.connections
            .get(&connection_id)
            .map_or(0, |c| c.byte_backlog)
    }

    fn head_of_line_delay(&self, connection_id: ConnectionId) -> f64 {
        self.connections
            .get(&connection_id)
            .map_or(0.0, |c| c.head_of_line_delay_ms)
    }
}
