//! Resource-block demand estimation.

use crate::models::{Flow, TrafficClass};
use crate::registry::FlowRegistry;

/// Bands a flow needs to clear its backlog this TTI.
///
/// `ceil(backlog / average_bytes_per_band)`, at least 1 whenever the backlog
/// is positive and never more than the whole pool. A flow whose channel
/// carries nothing on average needs the whole pool.
pub fn flow_demand(flow: &Flow, total_bands: u16) -> u32 {
    if flow.byte_backlog == 0 || total_bands == 0 {
        return 0;
    }
    let per_band = flow.average_bytes_per_band();
    let pool = u32::from(total_bands);
    if per_band <= 0.0 || !per_band.is_finite() {
        return pool;
    }
    let bands = (flow.byte_backlog as f64 / per_band).ceil();
    if bands >= pool as f64 {
        pool
    } else {
        (bands as u32).max(1)
    }
}

/// Whether a flow can ever win a band under the given D2D penalty.
pub fn is_schedulable(flow: &Flow, d2d_penalty: f64) -> bool {
    !(flow.is_d2d && d2d_penalty <= 0.0)
}

/// Summed demand of a class's schedulable members.
///
/// D2D flows drop out when the penalty is 0: they stay registered but can
/// never be served, so their demand must not claim part of the pool.
pub fn class_demand(
    registry: &FlowRegistry,
    class: TrafficClass,
    total_bands: u16,
    d2d_penalty: f64,
) -> u32 {
    registry
        .members(class)
        .iter()
        .filter_map(|id| registry.flow(*id))
        .filter(|flow| is_schedulable(flow, d2d_penalty))
        .map(|flow| flow_demand(flow, total_bands))
        .fold(0u32, u32::saturating_add)
}

/// Demand of every class, indexed by [`TrafficClass::index`].
pub fn class_demands(
    registry: &FlowRegistry,
    total_bands: u16,
    d2d_penalty: f64,
) -> [u32; TrafficClass::COUNT] {
    TrafficClass::priority_order()
        .map(|class| class_demand(registry, class, total_bands, d2d_penalty))
}
