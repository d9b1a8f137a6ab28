//! Process table sampling (reads /proc on Linux)

use crate::measure::{ProcessMeasurement, SystemMeasurement};

mod linux;

pub use linux::LinuxSampler;

/// Source of raw measurements, called once per tick with the interval the
/// measurements cover. Implementations keep whatever state they need
/// between calls (previous CPU counters); tests substitute a scripted one.
pub trait Sampler: Send {
    fn collect(&mut self, time_start: f64, time_end: f64)
        -> (SystemMeasurement, Vec<ProcessMeasurement>);
}
