use crate::errors::GeometryError;
use serde::{
    Deserialize,
    Serialize,
};

/// Per-peak instrument geometry, as supplied by the peak-prediction step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakGeometry {
    pub peak_id: u32,
    /// Primary flight path, moderator to sample (m).
    pub l1: f64,
    /// Secondary flight path, sample to detector pixel (m).
    pub l2: f64,
    /// Half of the scattering angle 2θ (rad).
    pub scattering_half_angle: f64,
    /// Predicted Q of the reflection (Å⁻¹).
    pub q_nominal: [f64; 3],
    pub detector_row: u32,
    pub detector_col: u32,
    #[serde(default)]
    pub bank: Option<String>,
}

impl PeakGeometry {
    pub fn q_norm(&self) -> f64 {
        let [x, y, z] = self.q_nominal;
        (x * x + y * y + z * z).sqrt()
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if !self.scattering_half_angle.is_finite() {
            return Err(GeometryError::NonFiniteValue {
                field: "scattering_half_angle",
            });
        }
        if self.scattering_half_angle <= 0.0 {
            return Err(GeometryError::NonPositiveScatteringAngle(
                self.scattering_half_angle,
            ));
        }
        if !(self.l1.is_finite() && self.l2.is_finite()) {
            return Err(GeometryError::NonFiniteValue { field: "l1/l2" });
        }
        if self.l1 <= 0.0 || self.l2 <= 0.0 {
            return Err(GeometryError::NonPositiveFlightPath {
                l1: self.l1,
                l2: self.l2,
            });
        }
        if self.q_nominal.iter().any(|q| !q.is_finite()) {
            return Err(GeometryError::NonFiniteValue { field: "q_nominal" });
        }
        if self.q_norm() <= f64::EPSILON {
            return Err(GeometryError::ZeroLengthQ);
        }
        Ok(())
    }

    /// Whether the peak's detector pixel lies within `cutoff` pixels of the sensor edge.
    pub fn is_near_edge(&self, rows: u32, cols: u32, cutoff: u32) -> bool {
        let row_margin = self.detector_row.min(rows.saturating_sub(1).saturating_sub(self.detector_row));
        let col_margin = self.detector_col.min(cols.saturating_sub(1).saturating_sub(self.detector_col));
        row_margin < cutoff || col_margin < cutoff
    }
}
