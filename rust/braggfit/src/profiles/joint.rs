//! Joint TOF x angular model and its linear scaling to the observed counts.

use super::angular::AngularProfileModel;
use super::tof::TofProfileModel;
use crate::background::SignalMask;
use crate::config::{
    ScalingConfig,
    SolverOptions,
};
use crate::errors::{
    BraggFitError,
    FitStage,
    Result,
};
use crate::fitting::{
    poisson_weights,
    Bounds,
    CurveModel,
    LevenbergMarquardt,
};
use crate::mapping::MappedGrid;
use crate::models::{
    PeakGeometry,
    VoxelGrid,
};
use tracing::debug;

const MIN_FIT_POINTS: usize = 3;

/// `A1 · y + A0` with `A1 >= 0`; the coordinate is the normalized joint model value.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearScaling;

impl CurveModel for LinearScaling {
    type Coordinate = f64;

    fn name(&self) -> &'static str {
        "scaling"
    }

    fn parameter_names(&self) -> &[&'static str] {
        &["A1", "A0"]
    }

    fn parameter_bounds(&self) -> Vec<Bounds> {
        vec![Bounds::non_negative(), Bounds::unbounded()]
    }

    fn evaluate(&self, params: &[f64], coords: &[f64], out: &mut [f64]) {
        for (o, y) in out.iter_mut().zip(coords) {
            *o = params[0] * y + params[1];
        }
    }
}

/// Weighted least squares for `obs ≈ a1·y + a0`, with `a1` projected onto `a1 >= 0`.
pub fn nonnegative_linear_seed(y: &[f64], observed: &[f64], weights: &[f64]) -> (f64, f64) {
    let (mut sw, mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for ((x, o), w) in y.iter().zip(observed).zip(weights) {
        let w2 = w * w;
        sw += w2;
        sx += w2 * x;
        sy += w2 * o;
        sxx += w2 * x * x;
        sxy += w2 * x * o;
    }
    if sw <= 0.0 {
        return (0.0, 0.0);
    }
    let denom = sw * sxx - sx * sx;
    if denom.abs() > f64::EPSILON * sw * sxx.max(1.0) {
        let a1 = (sw * sxy - sx * sy) / denom;
        let a0 = (sy - a1 * sx) / sw;
        if a1 >= 0.0 {
            return (a1, a0);
        }
    }
    // Constrained solution: flat model at the weighted mean
    (0.0, sy / sw)
}

/// Composed model and integrated intensity of one peak.
#[derive(Debug, Clone)]
pub struct JointProfile {
    /// Normalized joint model, one value per voxel (zero for invalid voxels).
    pub y_joint: Vec<f64>,
    /// `A1 · y_joint + A0`, one value per voxel.
    pub scaled: Vec<f64>,
    pub a1: f64,
    pub a0: f64,
    pub a1_err: f64,
    pub reduced_chi_squared: f64,
    pub peak_voxel: usize,
    pub refined_q: [f64; 3],
    pub dq: f64,
    pub intensity: f64,
    pub sigma: f64,
    pub n_fit_voxels: usize,
    /// The angular covariance was not positive-definite, so the joint model is zero
    /// and nothing was integrated.
    pub degenerate_covariance: bool,
}

impl JointProfile {
    /// Zero-intensity profile for a peak whose angular model collapsed to zero.
    ///
    /// `A0` is the mean count over the valid voxels and the centre stays at the nominal Q.
    fn zero_surface(grid: &VoxelGrid, mapped: &MappedGrid, geometry: &PeakGeometry) -> Self {
        let counts = grid.counts();
        let (sum, n_valid) = counts
            .iter()
            .zip(mapped.coords.iter())
            .filter(|(_, c)| c.valid)
            .fold((0.0, 0usize), |(s, n), (v, _)| (s + v, n + 1));
        let a0 = if n_valid > 0 { sum / n_valid as f64 } else { 0.0 };
        let peak_voxel = counts
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, v)| if *v > acc.1 { (i, *v) } else { acc })
            .0;
        Self {
            y_joint: vec![0.0; counts.len()],
            scaled: vec![a0; counts.len()],
            a1: 0.0,
            a0,
            a1_err: 0.0,
            reduced_chi_squared: f64::NAN,
            peak_voxel,
            refined_q: geometry.q_nominal,
            dq: 0.0,
            intensity: 0.0,
            sigma: 0.0,
            n_fit_voxels: 0,
            degenerate_covariance: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileComposer<'a> {
    config: &'a ScalingConfig,
    solver: SolverOptions,
}

impl<'a> ProfileComposer<'a> {
    pub fn new(config: &'a ScalingConfig, solver: SolverOptions) -> Self {
        Self { config, solver }
    }

    fn joint_model(
        mapped: &MappedGrid,
        tof: &TofProfileModel,
        angular: &AngularProfileModel,
    ) -> Vec<f64> {
        mapped
            .coords
            .iter()
            .map(|c| {
                if !c.valid {
                    return 0.0;
                }
                let v = tof.evaluate(c.tof) * angular.evaluate_peak(c.polar, c.azimuthal);
                if v.is_finite() {
                    v.max(0.0)
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Voxels within `half_window` of `center` along every axis.
    fn fit_voxels(
        &self,
        grid: &VoxelGrid,
        mapped: &MappedGrid,
        mask: &SignalMask,
        center: usize,
    ) -> Vec<usize> {
        let in_box: Vec<usize> = grid
            .neighborhood(grid.unravel(center), self.config.half_window)
            .filter(|idx| mapped.coords[*idx].valid)
            .collect();
        if mask.is_empty() {
            return in_box;
        }
        let masked: Vec<usize> = in_box
            .iter()
            .copied()
            .filter(|idx| mask.is_signal(*idx))
            .collect();
        if masked.len() < MIN_FIT_POINTS {
            in_box
        } else {
            masked
        }
    }

    #[cfg_attr(
        feature = "instrumentation",
        tracing::instrument(skip_all, level = "trace")
    )]
    pub fn compose(
        &self,
        grid: &VoxelGrid,
        mapped: &MappedGrid,
        mask: &SignalMask,
        geometry: &PeakGeometry,
        tof: &TofProfileModel,
        angular: &AngularProfileModel,
    ) -> Result<JointProfile> {
        if angular.is_degenerate() {
            debug!(
                "Peak {}: angular covariance is not positive-definite, integrating a zero surface",
                geometry.peak_id
            );
            return Ok(JointProfile::zero_surface(grid, mapped, geometry));
        }
        let mut y_joint = Self::joint_model(mapped, tof, angular);
        let (peak_voxel, ymax) = y_joint
            .iter()
            .enumerate()
            .fold((0, 0.0), |acc, (i, v)| if *v > acc.1 { (i, *v) } else { acc });
        if !(ymax > 0.0) {
            return Err(BraggFitError::degenerate(
                FitStage::Scaling,
                "joint TOF x angular model is zero everywhere",
            ));
        }
        y_joint.iter_mut().for_each(|v| *v /= ymax);

        let voxels = self.fit_voxels(grid, mapped, mask, peak_voxel);
        if voxels.len() < MIN_FIT_POINTS {
            return Err(BraggFitError::degenerate(
                FitStage::Scaling,
                format!("{} voxels around the joint model maximum", voxels.len()),
            ));
        }
        let counts = grid.counts();
        let x: Vec<f64> = voxels.iter().map(|i| y_joint[*i]).collect();
        let observed: Vec<f64> = voxels.iter().map(|i| counts[*i]).collect();
        let weights = poisson_weights(&observed);

        let (a1_seed, a0_seed) = nonnegative_linear_seed(&x, &observed, &weights);
        let solver = LevenbergMarquardt::new(self.solver, FitStage::Scaling);
        let fit = solver.fit(&LinearScaling, &x, &observed, &weights, &[a1_seed, a0_seed])?;
        let (a1, a0) = (fit.params[0], fit.params[1]);
        let a1_err = fit.table[0].std_error;

        let scaled: Vec<f64> = y_joint.iter().map(|y| a1 * y + a0).collect();

        let threshold = self.config.integration_threshold;
        let (sum_y, var_counts) = y_joint
            .iter()
            .zip(mapped.coords.iter())
            .filter(|(y, c)| c.valid && **y >= threshold)
            .fold((0.0, 0.0), |(s, v), (y, _)| (s + y, v + (a1 * y + a0)));
        let intensity = a1 * sum_y;
        let a1_term = if a1_err.is_finite() {
            a1_err * sum_y
        } else {
            0.0
        };
        let sigma = (var_counts.max(0.0) + a1_term * a1_term).sqrt();

        let refined_q = grid.q_at(peak_voxel);
        let dq = refined_q
            .iter()
            .zip(geometry.q_nominal.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();

        debug!(
            "Scaling fit: A1={:.3} A0={:.3} chi2={:.3} voxels={} I={:.2} sigma={:.2}",
            a1,
            a0,
            fit.reduced_chi_squared,
            voxels.len(),
            intensity,
            sigma
        );

        Ok(JointProfile {
            y_joint,
            scaled,
            a1,
            a0,
            a1_err,
            reduced_chi_squared: fit.reduced_chi_squared,
            peak_voxel,
            refined_q,
            dq,
            intensity,
            sigma,
            n_fit_voxels: voxels.len(),
            degenerate_covariance: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::VoxelCoordinates;
    use crate::profiles::angular::AngularFitMode;

    const N: usize = 9;

    fn tof_model() -> TofProfileModel {
        let centers: Vec<f64> = (0..N).map(|i| i as f64).collect();
        let peak_curve = centers
            .iter()
            .map(|t| (-0.5 * (t - 4.0) * (t - 4.0)).exp())
            .collect();
        TofProfileModel {
            a: 0.3,
            b: 0.03,
            r: 0.5,
            t0: 3.0,
            scale: 1.0,
            hat_width: 0.5,
            kconv: 0.25,
            background: vec![0.0],
            domain: (-0.5, N as f64 - 0.5),
            reduced_chi_squared: 1.0,
            std_errors: vec![],
            centers,
            peak_curve,
            background_curve: vec![0.0; N],
        }
    }

    fn angular_model() -> AngularProfileModel {
        AngularProfileModel {
            amplitude: 1.0,
            mu_polar: 4.0,
            mu_azimuthal: 4.0,
            sigma_polar: 1.0,
            sigma_azimuthal: 1.0,
            correlation: 0.0,
            background: 0.0,
            mode: AngularFitMode::Free,
            reduced_chi_squared: 1.0,
            std_errors: vec![],
            histogram_total: 1000.0,
        }
    }

    /// Voxel (i, j, k) maps to tof = i, polar = j, azimuthal = k.
    fn setup(counts: impl Fn([usize; 3], f64) -> f64) -> (VoxelGrid, MappedGrid) {
        let mut grid_counts = vec![0.0; N * N * N];
        let mut coords = Vec::with_capacity(N * N * N);
        let tof = tof_model();
        let ang = angular_model();
        for i in 0..N {
            for j in 0..N {
                for k in 0..N {
                    let y = tof.evaluate(i as f64) * ang.evaluate_peak(j as f64, k as f64);
                    grid_counts[(i * N + j) * N + k] = counts([i, j, k], y);
                    coords.push(VoxelCoordinates {
                        tof: i as f64,
                        polar: j as f64,
                        azimuthal: k as f64,
                        valid: true,
                    });
                }
            }
        }
        let grid = VoxelGrid::new([N, N, N], [1.0, 1.0, 1.0], [0.01; 3], grid_counts).unwrap();
        let mapped = MappedGrid {
            coords,
            nominal_tof: 4.0,
            nominal_polar: 4.0,
            nominal_azimuthal: 4.0,
        };
        (grid, mapped)
    }

    fn geometry() -> PeakGeometry {
        PeakGeometry {
            peak_id: 1,
            l1: 30.0,
            l2: 0.45,
            scattering_half_angle: 0.7,
            q_nominal: [1.04, 1.04, 1.04],
            detector_row: 100,
            detector_col: 100,
            bank: None,
        }
    }

    fn empty_mask(len: usize) -> SignalMask {
        let conf = crate::config::BackgroundConfig::default();
        let grid = VoxelGrid::new([len, 1, 1], [0.0; 3], [1.0; 3], vec![0.0; len]).unwrap();
        let mapped = MappedGrid {
            coords: vec![
                VoxelCoordinates {
                    tof: 1.0,
                    polar: 1.0,
                    azimuthal: 1.0,
                    valid: true,
                };
                len
            ],
            nominal_tof: 1.0,
            nominal_polar: 1.0,
            nominal_azimuthal: 1.0,
        };
        crate::background::BackgroundSeparator::new(&conf).separate(&grid, &mapped)
    }

    #[test]
    fn test_recovers_linear_scaling() {
        let (grid, mapped) = setup(|_, y| 200.0 * y + 3.0);
        let conf = ScalingConfig::default();
        let composer = ProfileComposer::new(&conf, SolverOptions::default());
        let out = composer
            .compose(
                &grid,
                &mapped,
                &empty_mask(grid.len()),
                &geometry(),
                &tof_model(),
                &angular_model(),
            )
            .unwrap();
        assert!((out.a1 - 200.0).abs() < 1e-6, "{}", out.a1);
        assert!((out.a0 - 3.0).abs() < 1e-6, "{}", out.a0);
        assert_eq!(out.peak_voxel, grid.flat_index([4, 4, 4]));
        assert!((out.y_joint[out.peak_voxel] - 1.0).abs() < 1e-12);
        assert!(out.intensity > 0.0);
        assert!(out.sigma > 0.0);
        // Refined centre is the Q of the peak voxel
        assert!((out.refined_q[0] - 1.04).abs() < 1e-12);
        assert!(out.dq < 1e-9);
    }

    #[test]
    fn test_all_zero_counts_give_zero_scale() {
        let (grid, mapped) = setup(|_, _| 0.0);
        let conf = ScalingConfig::default();
        let composer = ProfileComposer::new(&conf, SolverOptions::default());
        let out = composer
            .compose(
                &grid,
                &mapped,
                &empty_mask(grid.len()),
                &geometry(),
                &tof_model(),
                &angular_model(),
            )
            .unwrap();
        assert_eq!(out.a1, 0.0);
        assert_eq!(out.intensity, 0.0);
    }

    #[test]
    fn test_anticorrelated_counts_clamp_scale_at_zero() {
        let (grid, mapped) = setup(|_, y| 100.0 - 50.0 * y);
        let conf = ScalingConfig::default();
        let composer = ProfileComposer::new(&conf, SolverOptions::default());
        let out = composer
            .compose(
                &grid,
                &mapped,
                &empty_mask(grid.len()),
                &geometry(),
                &tof_model(),
                &angular_model(),
            )
            .unwrap();
        assert!(out.a1 >= 0.0);
        assert!(out.a1 < 1e-6);
    }

    #[test]
    fn test_degenerate_covariance_integrates_to_zero() {
        let (grid, mapped) = setup(|_, y| 10.0 * y + 1.0);
        let mut ang = angular_model();
        ang.correlation = 1.0;
        assert!(ang.is_degenerate());
        let conf = ScalingConfig::default();
        let composer = ProfileComposer::new(&conf, SolverOptions::default());
        let out = composer
            .compose(
                &grid,
                &mapped,
                &empty_mask(grid.len()),
                &geometry(),
                &tof_model(),
                &ang,
            )
            .unwrap();
        assert!(out.degenerate_covariance);
        assert_eq!(out.a1, 0.0);
        assert_eq!(out.intensity, 0.0);
        assert_eq!(out.sigma, 0.0);
        assert!(out.y_joint.iter().all(|y| *y == 0.0));
        assert!(out.a0 > 1.0);
        assert_eq!(out.refined_q, geometry().q_nominal);
    }

    #[test]
    fn test_zero_tof_curve_is_a_scaling_error() {
        let (grid, mapped) = setup(|_, y| 10.0 * y);
        let mut tof = tof_model();
        tof.peak_curve = vec![0.0; N];
        let conf = ScalingConfig::default();
        let composer = ProfileComposer::new(&conf, SolverOptions::default());
        let err = composer
            .compose(
                &grid,
                &mapped,
                &empty_mask(grid.len()),
                &geometry(),
                &tof,
                &angular_model(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            BraggFitError::DegenerateFit {
                stage: FitStage::Scaling,
                ..
            }
        ));
    }

    #[test]
    fn test_nonnegative_seed() {
        let y = [0.0, 0.5, 1.0];
        assert_eq!(nonnegative_linear_seed(&y, &[1.0, 2.0, 3.0], &[1.0; 3]), (2.0, 1.0));
        let (a1, a0) = nonnegative_linear_seed(&y, &[3.0, 2.0, 1.0], &[1.0; 3]);
        assert_eq!(a1, 0.0);
        assert!((a0 - 2.0).abs() < 1e-12);
    }
}
