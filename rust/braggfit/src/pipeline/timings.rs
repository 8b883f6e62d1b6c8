//! Per-stage wall time of the per-peak fit, summed over every peak of a batch
//! (and over threads when fitting in parallel).

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct FitTimings {
    /// Q to (TOF, polar, azimuthal) for every voxel.
    pub mapping: Duration,
    pub background: Duration,
    pub tof: Duration,
    pub angular: Duration,
    /// Joint model, scaling fit and integration.
    pub scaling: Duration,
}

impl FitTimings {
    pub fn total(&self) -> Duration {
        self.mapping + self.background + self.tof + self.angular + self.scaling
    }
}

impl Serialize for FitTimings {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("FitTimings", 5)?;
        state.serialize_field("mapping_ms", &self.mapping.as_millis())?;
        state.serialize_field("background_ms", &self.background.as_millis())?;
        state.serialize_field("tof_ms", &self.tof.as_millis())?;
        state.serialize_field("angular_ms", &self.angular.as_millis())?;
        state.serialize_field("scaling_ms", &self.scaling.as_millis())?;
        state.end()
    }
}

impl std::ops::AddAssign for FitTimings {
    fn add_assign(&mut self, rhs: Self) {
        self.mapping += rhs.mapping;
        self.background += rhs.background;
        self.tof += rhs.tof;
        self.angular += rhs.angular;
        self.scaling += rhs.scaling;
    }
}
