//! Reciprocal-space voxels to instrument coordinates.
//!
//! Every voxel's Q is expressed in spherical coordinates `(R, polar, azimuthal)`
//! and the radius is turned into a time of flight using the peak's flight paths
//! and scattering angle:
//!
//! `TOF = K · (L1 + L2) · sin(θ) / R`
//!
//! Azimuthal angles are unwrapped around the nominal peak direction so that a
//! peak sitting on the ±π branch cut still maps to a contiguous range.

use crate::config::InstrumentConstants;
use crate::errors::{
    BraggFitError,
    GeometryError,
    Result,
};
use crate::models::{
    PeakGeometry,
    VoxelGrid,
};
use std::f64::consts::PI;

/// Radii below this are treated as the origin of reciprocal space.
const MIN_Q_NORM: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelCoordinates {
    pub tof: f64,
    pub polar: f64,
    pub azimuthal: f64,
    /// False for voxels at (or numerically at) |Q| = 0, which are excluded downstream.
    pub valid: bool,
}

impl VoxelCoordinates {
    const INVALID: Self = Self {
        tof: 0.0,
        polar: 0.0,
        azimuthal: 0.0,
        valid: false,
    };
}

/// Instrument coordinates for every voxel of a grid.
#[derive(Debug, Clone)]
pub struct MappedGrid {
    pub coords: Vec<VoxelCoordinates>,
    pub nominal_tof: f64,
    pub nominal_polar: f64,
    pub nominal_azimuthal: f64,
}

impl MappedGrid {
    pub fn num_valid(&self) -> usize {
        self.coords.iter().filter(|c| c.valid).count()
    }

    pub fn iter_valid(&self) -> impl Iterator<Item = (usize, &VoxelCoordinates)> {
        self.coords.iter().enumerate().filter(|(_, c)| c.valid)
    }

    /// Min/max of the polar and azimuthal angles over valid voxels.
    pub fn angular_extent(&self) -> Option<((f64, f64), (f64, f64))> {
        let mut polar = (f64::INFINITY, f64::NEG_INFINITY);
        let mut azim = (f64::INFINITY, f64::NEG_INFINITY);
        for (_, c) in self.iter_valid() {
            polar.0 = polar.0.min(c.polar);
            polar.1 = polar.1.max(c.polar);
            azim.0 = azim.0.min(c.azimuthal);
            azim.1 = azim.1.max(c.azimuthal);
        }
        if polar.0 > polar.1 {
            None
        } else {
            Some((polar, azim))
        }
    }
}

pub(crate) fn wrap_to_pi(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    // rem_euclid maps +π to -π; keep the (-π, π] convention.
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

/// Cartesian to spherical: `(R, polar, azimuthal)` with polar measured from +z.
pub fn to_spherical(q: [f64; 3]) -> (f64, f64, f64) {
    let [x, y, z] = q;
    let r = (x * x + y * y + z * z).sqrt();
    if r < MIN_Q_NORM {
        return (0.0, 0.0, 0.0);
    }
    let polar = (z / r).clamp(-1.0, 1.0).acos();
    let azimuthal = y.atan2(x);
    (r, polar, azimuthal)
}

pub fn from_spherical(r: f64, polar: f64, azimuthal: f64) -> [f64; 3] {
    let (sp, cp) = polar.sin_cos();
    let (sa, ca) = azimuthal.sin_cos();
    [r * sp * ca, r * sp * sa, r * cp]
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinateMapper<'a> {
    constants: &'a InstrumentConstants,
}

impl<'a> CoordinateMapper<'a> {
    pub fn new(constants: &'a InstrumentConstants) -> Self {
        Self { constants }
    }

    fn tof_numerator(&self, geometry: &PeakGeometry) -> f64 {
        self.constants.tof_constant * (geometry.l1 + geometry.l2) * geometry.scattering_half_angle.sin()
    }

    /// TOF (µs) of a reflection at |Q| = `q_norm` for this peak's geometry.
    pub fn tof_for_q_norm(&self, geometry: &PeakGeometry, q_norm: f64) -> Option<f64> {
        if q_norm < MIN_Q_NORM {
            return None;
        }
        Some(self.tof_numerator(geometry) / q_norm)
    }

    /// Inverse of [`tof_for_q_norm`](Self::tof_for_q_norm).
    pub fn q_norm_for_tof(&self, geometry: &PeakGeometry, tof: f64) -> Option<f64> {
        if tof <= 0.0 {
            return None;
        }
        Some(self.tof_numerator(geometry) / tof)
    }

    /// Maps instrument coordinates back to a Q vector.
    pub fn to_q(
        &self,
        geometry: &PeakGeometry,
        tof: f64,
        polar: f64,
        azimuthal: f64,
    ) -> Option<[f64; 3]> {
        self.q_norm_for_tof(geometry, tof)
            .map(|r| from_spherical(r, polar, azimuthal))
    }

    pub fn map_voxel(&self, geometry: &PeakGeometry, q: [f64; 3], azimuthal_ref: f64) -> VoxelCoordinates {
        let (r, polar, azimuthal) = to_spherical(q);
        match self.tof_for_q_norm(geometry, r) {
            Some(tof) => VoxelCoordinates {
                tof,
                polar,
                azimuthal: azimuthal_ref + wrap_to_pi(azimuthal - azimuthal_ref),
                valid: true,
            },
            None => VoxelCoordinates::INVALID,
        }
    }

    #[cfg_attr(
        feature = "instrumentation",
        tracing::instrument(skip_all, level = "trace")
    )]
    pub fn map_grid(&self, grid: &VoxelGrid, geometry: &PeakGeometry) -> Result<MappedGrid> {
        geometry.validate().map_err(BraggFitError::from)?;
        let (q_norm, nominal_polar, nominal_azimuthal) = to_spherical(geometry.q_nominal);
        let nominal_tof = self
            .tof_for_q_norm(geometry, q_norm)
            .ok_or(BraggFitError::Geometry(GeometryError::ZeroLengthQ))?;

        let coords = (0..grid.len())
            .map(|idx| self.map_voxel(geometry, grid.q_at(idx), nominal_azimuthal))
            .collect();

        Ok(MappedGrid {
            coords,
            nominal_tof,
            nominal_polar,
            nominal_azimuthal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeratorCoefficients;

    fn constants() -> InstrumentConstants {
        InstrumentConstants {
            tof_constant: crate::config::DEFAULT_TOF_CONSTANT,
            detector_rows: 256,
            detector_cols: 256,
            moderator: ModeratorCoefficients {
                alpha0: 1.6,
                alpha1: 1.5,
                beta0: 31.9,
                kappa: 46.0,
            },
        }
    }

    fn geometry(q: [f64; 3]) -> PeakGeometry {
        PeakGeometry {
            peak_id: 0,
            l1: 30.0,
            l2: 0.45,
            scattering_half_angle: 0.7,
            q_nominal: q,
            detector_row: 100,
            detector_col: 100,
            bank: None,
        }
    }

    #[test]
    fn test_tof_formula() {
        let consts = constants();
        let mapper = CoordinateMapper::new(&consts);
        let geom = geometry([0.0, 3.0, 4.0]);
        let tof = mapper.tof_for_q_norm(&geom, 5.0).unwrap();
        let expected = 3176.507 * 30.45 * 0.7f64.sin() / 5.0;
        assert!((tof - expected).abs() < 1e-9);
    }

    #[test]
    fn test_direction_roundtrip() {
        let consts = constants();
        let mapper = CoordinateMapper::new(&consts);
        let geom = geometry([1.5, -2.0, 3.0]);
        let grid = VoxelGrid::centered_on(geom.q_nominal, [5, 5, 5], [0.05; 3], vec![0.0; 125])
            .unwrap();
        let mapped = mapper.map_grid(&grid, &geom).unwrap();
        for (idx, c) in mapped.iter_valid() {
            let q = grid.q_at(idx);
            let back = mapper.to_q(&geom, c.tof, c.polar, c.azimuthal).unwrap();
            let (_, p0, a0) = to_spherical(q);
            let (_, p1, a1) = to_spherical(back);
            assert!((p0 - p1).abs() < 1e-6);
            assert!(wrap_to_pi(a0 - a1).abs() < 1e-6);
            // |Q| round-trips through the TOF as well
            let r0 = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2]).sqrt();
            let r1 = (back[0] * back[0] + back[1] * back[1] + back[2] * back[2]).sqrt();
            assert!((r0 - r1).abs() < 1e-9);
        }
    }

    #[test]
    fn test_origin_voxel_is_masked() {
        let consts = constants();
        let mapper = CoordinateMapper::new(&consts);
        let geom = geometry([0.1, 0.0, 0.0]);
        let grid =
            VoxelGrid::centered_on([0.0, 0.0, 0.0], [3, 3, 3], [0.1; 3], vec![1.0; 27]).unwrap();
        let mapped = mapper.map_grid(&grid, &geom).unwrap();
        assert!(!mapped.coords[grid.flat_index([1, 1, 1])].valid);
        assert_eq!(mapped.num_valid(), 26);
        assert!(mapped.iter_valid().all(|(_, c)| c.tof.is_finite() && c.tof > 0.0));
    }

    #[test]
    fn test_zero_scattering_angle_is_an_error() {
        let consts = constants();
        let mapper = CoordinateMapper::new(&consts);
        let mut geom = geometry([1.0, 1.0, 1.0]);
        geom.scattering_half_angle = 0.0;
        let grid = VoxelGrid::centered_on(geom.q_nominal, [2, 2, 2], [0.1; 3], vec![0.0; 8])
            .unwrap();
        let err = mapper.map_grid(&grid, &geom).unwrap_err();
        assert_eq!(
            err,
            BraggFitError::Geometry(GeometryError::NonPositiveScatteringAngle(0.0))
        );
    }

    #[test]
    fn test_azimuth_is_unwrapped_across_branch_cut() {
        let consts = constants();
        let mapper = CoordinateMapper::new(&consts);
        // Peak direction right on the -x axis: azimuth ~ ±π
        let geom = geometry([-3.0, 0.0, 1.0]);
        let grid = VoxelGrid::centered_on(geom.q_nominal, [3, 3, 3], [0.05; 3], vec![0.0; 27])
            .unwrap();
        let mapped = mapper.map_grid(&grid, &geom).unwrap();
        let ((_, _), (amin, amax)) = mapped.angular_extent().unwrap();
        assert!(amax - amin < 0.1, "azimuth range {} .. {}", amin, amax);
    }
}
