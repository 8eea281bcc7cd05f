//! Multi-class fair resource-block scheduler.
//!
//! Every tick, active connections are classified into traffic classes, the
//! band pool is split between classes with the Shapley value of a capped
//! demand game, and each class budget is handed to member flows band by
//! band using the EXP-PF rule.

// Allow clippy warning triggered by PyO3 macro expansion
#![allow(clippy::useless_conversion)]

use pyo3::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub mod coalition;
mod config;
pub mod demand;
pub mod exp_pf;
pub mod logging;
mod models;
pub mod oracle;
pub mod registry;
pub mod scheduler;

pub use coalition::{ClassBudgets, CoalitionAllocator};
pub use config::SchedulerConfig;
pub use exp_pf::FairBandAllocator;
pub use models::{
    AllocationInvariantError, AllocationMap, Band, BandGrant, ConnectionId, Direction, Flow,
    NodeId, RealtimeTarget, TrafficClass,
};
pub use oracle::{ChannelOracle, ConnectionInfo, OracleSnapshot};
pub use registry::{ClassificationError, Classifier, FlowRegistry};
pub use scheduler::{Scheduler, SchedulerError, SchedulerStats};

fn to_py_err(err: SchedulerError) -> PyErr {
    match err {
        SchedulerError::AllocationInvariant(_) => {
            pyo3::exceptions::PyRuntimeError::new_err(err.to_string())
        }
        SchedulerError::Classification(_) | SchedulerError::InvalidConfig(_) => {
            pyo3::exceptions::PyValueError::new_err(err.to_string())
        }
    }
}

fn parse_direction(direction: &str) -> PyResult<Direction> {
    Direction::parse(direction).ok_or_else(|| {
        pyo3::exceptions::PyValueError::new_err(format!("Unknown direction: {}", direction))
    })
}

/// Split a band pool between the three traffic classes.
///
/// # Returns
/// * Dict mapping class name ("voip", "video", "cbr") to its band budget
///
/// # Raises
/// * RuntimeError if the rounded budgets break the exact-partition invariant
#[pyfunction]
fn split_pool(
    voip: u32,
    video: u32,
    cbr: u32,
    total_bands: u16,
) -> PyResult<HashMap<String, u32>> {
    let mut demands = [0; TrafficClass::COUNT];
    demands[TrafficClass::Voip.index()] = voip;
    demands[TrafficClass::Video.index()] = video;
    demands[TrafficClass::Cbr.index()] = cbr;

    let budgets = CoalitionAllocator::default()
        .split_pool(demands, total_bands)
        .map_err(|e| to_py_err(e.into()))?;
    Ok(budgets
        .iter()
        .map(|(class, budget)| (class.name().to_string(), budget))
        .collect())
}

/// Scheduler fed from a table-driven oracle (exposed to Python as `Scheduler`).
#[pyclass(name = "Scheduler")]
pub struct PyScheduler {
    inner: Scheduler<OracleSnapshot>,
}

#[pymethods]
impl PyScheduler {
    #[new]
    #[pyo3(signature = (total_bands, config=None))]
    fn new(total_bands: u16, config: Option<SchedulerConfig>) -> PyResult<Self> {
        let inner = Scheduler::new(OracleSnapshot::new(total_bands), config.unwrap_or_default())
            .map_err(to_py_err)?;
        Ok(Self { inner })
    }

    /// Register or update what the oracle knows about a connection.
    #[pyo3(signature = (
        connection_id,
        node_id,
        hint,
        byte_backlog=0,
        head_of_line_delay_ms=0.0,
        is_d2d=false,
        direction="dl"
    ))]
    #[allow(clippy::too_many_arguments)]
    fn set_flow(
        &mut self,
        connection_id: ConnectionId,
        node_id: NodeId,
        hint: Option<String>,
        byte_backlog: u64,
        head_of_line_delay_ms: f64,
        is_d2d: bool,
        direction: &str,
    ) -> PyResult<()> {
        let info = ConnectionInfo {
            node_id,
            hint,
            is_d2d,
            direction: parse_direction(direction)?,
            byte_backlog,
            head_of_line_delay_ms,
        };
        self.inner.oracle_mut().set_connection(connection_id, info);
        Ok(())
    }

    fn remove_flow(&mut self, connection_id: ConnectionId) -> bool {
        self.inner
            .oracle_mut()
            .remove_connection(connection_id)
            .is_some()
    }

    /// Expected bytes per band for a node in one direction.
    fn set_throughput(
        &mut self,
        node_id: NodeId,
        direction: &str,
        per_band: Vec<f64>,
    ) -> PyResult<()> {
        let direction = parse_direction(direction)?;
        self.inner
            .oracle_mut()
            .set_throughput(node_id, direction, per_band);
        Ok(())
    }

    /// Run one tick; returns band -> connection id.
    ///
    /// # Raises
    /// * ValueError if an active connection cannot be classified
    /// * RuntimeError on an allocation invariant violation
    #[pyo3(signature = (active, total_bands=None))]
    fn tick(
        &mut self,
        active: BTreeSet<ConnectionId>,
        total_bands: Option<u16>,
    ) -> PyResult<BTreeMap<Band, ConnectionId>> {
        let map = match total_bands {
            Some(bands) => self.inner.tick(&active, bands),
            None => self.inner.tick_full_pool(&active),
        }
        .map_err(to_py_err)?;
        Ok(map
            .iter()
            .map(|(band, grant)| (band, grant.connection_id))
            .collect())
    }

    /// Last tick's grants as (band, connection id, retained) for history recording.
    fn last_grants(&self) -> Vec<(Band, ConnectionId, bool)> {
        self.inner
            .last_allocation()
            .iter()
            .map(|(band, grant)| (band, grant.connection_id, grant.retained))
            .collect()
    }

    fn class_budgets(&self) -> HashMap<String, u32> {
        self.inner
            .last_budgets()
            .iter()
            .map(|(class, budget)| (class.name().to_string(), budget))
            .collect()
    }

    fn stats(&self) -> HashMap<String, u64> {
        let stats = self.inner.stats();
        let mut out: HashMap<String, u64> = TrafficClass::priority_order()
            .iter()
            .map(|class| (format!("bands_{}", class.name()), stats.bands(*class)))
            .collect();
        out.insert("ticks".to_string(), stats.ticks);
        out.insert("empty_ticks".to_string(), stats.empty_ticks);
        out.insert("retained_bands".to_string(), stats.retained_bands);
        out
    }

    #[getter]
    fn d2d_penalty(&self) -> f64 {
        self.inner.d2d_penalty()
    }

    #[setter]
    fn set_d2d_penalty(&mut self, value: f64) -> PyResult<()> {
        self.inner.set_d2d_penalty(value).map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        format!(
            "Scheduler(total_bands={}, flows={}, d2d_penalty={})",
            self.inner.oracle().total_bands(),
            self.inner.registry().len(),
            self.inner.d2d_penalty()
        )
    }
}

/// The tugame.rust Python module.
#[pymodule]
fn rust(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<SchedulerConfig>()?;
    m.add_class::<PyScheduler>()?;

    m.add_function(wrap_pyfunction!(split_pool, m)?)?;

    Ok(())
}
