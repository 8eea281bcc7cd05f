//! Configuration types for the band scheduler.

use pyo3::prelude::*;

use crate::models::TrafficClass;
use crate::scheduler::SchedulerError;

/// Tunables for the per-tick scheduler.
#[pyclass]
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Multiplier on D2D flows' EXP-PF scores: 1.0 = no penalty, 0.0 = never scheduled
    #[pyo3(get, set)]
    pub d2d_penalty: f64,
    /// Maximum delay target (ms) assigned to new VoIP flows
    #[pyo3(get, set)]
    pub voip_delay_target_ms: f64,
    /// Maximum delay target (ms) assigned to new video flows
    #[pyo3(get, set)]
    pub video_delay_target_ms: f64,
    /// Smoothing factor for the long-term average throughput, in (0, 1]
    #[pyo3(get, set)]
    pub throughput_smoothing: f64,
    /// Floor for the proportional-fair denominator (bytes)
    #[pyo3(get, set)]
    pub min_average_throughput: f64,
    /// Verbosity level: 0=silent, 1=changes, 2=checks, 3=debug
    #[pyo3(get, set)]
    pub verbosity: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            d2d_penalty: 1.0,
            voip_delay_target_ms: 100.0,
            video_delay_target_ms: 150.0,
            throughput_smoothing: 0.1,
            min_average_throughput: 1.0,
            verbosity: 0,
        }
    }
}

impl SchedulerConfig {
    /// Delay target for new flows of `class`, if it is realtime.
    pub fn delay_target_ms(&self, class: TrafficClass) -> Option<f64> {
        match class {
            TrafficClass::Voip => Some(self.voip_delay_target_ms),
            TrafficClass::Video => Some(self.video_delay_target_ms),
            TrafficClass::Cbr => None,
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        validate_d2d_penalty(self.d2d_penalty)?;
        for (name, value) in [
            ("voip_delay_target_ms", self.voip_delay_target_ms),
            ("video_delay_target_ms", self.video_delay_target_ms),
            ("min_average_throughput", self.min_average_throughput),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(self.throughput_smoothing > 0.0 && self.throughput_smoothing <= 1.0) {
            return Err(SchedulerError::InvalidConfig(format!(
                "throughput_smoothing must be in (0, 1], got {}",
                self.throughput_smoothing
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_d2d_penalty(value: f64) -> Result<(), SchedulerError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SchedulerError::InvalidConfig(format!(
            "d2d_penalty must be in [0, 1], got {}",
            value
        )))
    }
}

#[pymethods]
impl SchedulerConfig {
    #[new]
    #[pyo3(signature = (
        d2d_penalty=None,
        voip_delay_target_ms=None,
        video_delay_target_ms=None,
        throughput_smoothing=None,
        min_average_throughput=None,
        verbosity=None
    ))]
    fn new(
        d2d_penalty: Option<f64>,
        voip_delay_target_ms: Option<f64>,
        video_delay_target_ms: Option<f64>,
        throughput_smoothing: Option<f64>,
        min_average_throughput: Option<f64>,
        verbosity: Option<u8>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            d2d_penalty: d2d_penalty.unwrap_or(defaults.d2d_penalty),
            voip_delay_target_ms: voip_delay_target_ms.unwrap_or(defaults.voip_delay_target_ms),
            video_delay_target_ms: video_delay_target_ms
                .unwrap_or(defaults.video_delay_target_ms),
            throughput_smoothing: throughput_smoothing.unwrap_or(defaults.throughput_smoothing),
            min_average_throughput: min_average_throughput
                .unwrap_or(defaults.min_average_throughput),
            verbosity: verbosity.unwrap_or(defaults.verbosity),
        }
    }

    fn __repr__(&self) -> String {
        format!(
            "SchedulerConfig(d2d_penalty={}, voip_delay_target_ms={}, video_delay_target_ms={}, throughput_smoothing={})",
            self.d2d_penalty,
            self.voip_delay_target_ms,
            self.video_delay_target_ms,
            self.throughput_smoothing
        )
    }
}
