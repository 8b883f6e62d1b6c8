//! Angular profile: 2D histogram over (polar, azimuthal) and a bivariate
//! Gaussian fit, optionally constrained by the shape of a nearby strong peak.

use crate::background::SignalMask;
use crate::config::{
    AngularFitConfig,
    InstrumentConstants,
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
use crate::library::{
    StrongPeakEntry,
    StrongPeakLibrary,
};
use crate::mapping::{
    wrap_to_pi,
    MappedGrid,
};
use crate::models::{
    PeakGeometry,
    VoxelGrid,
};
use serde::Serialize;
use tracing::{
    debug,
    warn,
};

const PARAMETER_NAMES: [&str; 7] = [
    "amplitude",
    "mu_polar",
    "mu_azimuthal",
    "sigma_polar",
    "sigma_azimuthal",
    "correlation",
    "background",
];

const MIN_SIGMA_SEED: f64 = 1e-5;

/// Signal counts binned over the central part of the grid's angular extent.
///
/// Counts are stored polar-major: `counts[i * n_azimuthal + j]`.
#[derive(Debug, Clone)]
pub struct AngularHistogram {
    pub polar_centers: Vec<f64>,
    pub azimuthal_centers: Vec<f64>,
    pub counts: Vec<f64>,
    pub polar_step: f64,
    pub azimuthal_step: f64,
}

impl AngularHistogram {
    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Bin centres as `[polar, azimuthal]`, in the same order as `counts`.
    pub fn coordinates(&self) -> Vec<[f64; 2]> {
        self.polar_centers
            .iter()
            .flat_map(|p| self.azimuthal_centers.iter().map(move |a| [*p, *a]))
            .collect()
    }

    /// Flat index of the largest bin; the first one on ties.
    pub fn argmax(&self) -> usize {
        self.counts
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, c)| {
                if *c > acc.1 {
                    (i, *c)
                } else {
                    acc
                }
            })
            .0
    }

    /// Count-weighted mean `(polar, azimuthal)`.
    pub fn mean_angles(&self) -> Option<(f64, f64)> {
        let total = self.total();
        if total <= 0.0 {
            return None;
        }
        let na = self.azimuthal_centers.len();
        let (mut p, mut a) = (0.0, 0.0);
        for (idx, c) in self.counts.iter().enumerate() {
            p += c * self.polar_centers[idx / na];
            a += c * self.azimuthal_centers[idx % na];
        }
        Some((p / total, a / total))
    }
}

fn centered_range(lo: f64, hi: f64, frac: f64) -> (f64, f64) {
    let mid = 0.5 * (lo + hi);
    let half = 0.5 * (hi - lo) * frac;
    (mid - half, mid + half)
}

fn bin_of(value: f64, lo: f64, step: f64, n: usize) -> Option<usize> {
    if step <= 0.0 {
        return Some(0);
    }
    let pos = (value - lo) / step;
    if pos < 0.0 || pos > n as f64 {
        return None;
    }
    Some((pos as usize).min(n - 1))
}

pub fn build_angular_histogram(
    grid: &VoxelGrid,
    mapped: &MappedGrid,
    mask: &SignalMask,
    config: &AngularFitConfig,
) -> Option<AngularHistogram> {
    let ((pmin, pmax), (amin, amax)) = mapped.angular_extent()?;
    let (plo, phi) = centered_range(pmin, pmax, config.frac_box_to_histogram);
    let (alo, ahi) = centered_range(amin, amax, config.frac_box_to_histogram);
    let auto_bins = grid.shape().iter().copied().max().unwrap_or(1).max(1);
    let np = config.n_polar_bins.unwrap_or(auto_bins).max(1);
    let na = config.n_azimuthal_bins.unwrap_or(auto_bins).max(1);
    let pstep = (phi - plo) / np as f64;
    let astep = (ahi - alo) / na as f64;

    let mut counts = vec![0.0; np * na];
    let grid_counts = grid.counts();
    for (idx, c) in mapped.iter_valid() {
        if !mask.is_signal(idx) {
            continue;
        }
        let (Some(i), Some(j)) = (
            bin_of(c.polar, plo, pstep, np),
            bin_of(c.azimuthal, alo, astep, na),
        ) else {
            continue;
        };
        counts[i * na + j] += grid_counts[idx];
    }

    Some(AngularHistogram {
        polar_centers: (0..np).map(|i| plo + (i as f64 + 0.5) * pstep).collect(),
        azimuthal_centers: (0..na).map(|j| alo + (j as f64 + 0.5) * astep).collect(),
        counts,
        polar_step: pstep,
        azimuthal_step: astep,
    })
}

/// `amp · exp(-½ dᵀ Σ⁻¹ d) + bg` over `[polar, azimuthal]`.
#[derive(Debug, Clone)]
pub struct BivariateGaussian {
    bounds: Vec<Bounds>,
}

impl BivariateGaussian {
    pub fn new(bounds: Vec<Bounds>) -> Self {
        assert_eq!(bounds.len(), PARAMETER_NAMES.len());
        Self { bounds }
    }

    /// True when `[[σp², ρσpσa], [ρσpσa, σa²]]` is positive definite.
    pub fn covariance_is_valid(sigma_polar: f64, sigma_azimuthal: f64, correlation: f64) -> bool {
        sigma_polar > 0.0
            && sigma_azimuthal > 0.0
            && correlation.abs() < 1.0
            && sigma_polar.is_finite()
            && sigma_azimuthal.is_finite()
    }

    /// Peak component only; identically zero for an invalid covariance.
    pub fn peak_value(params: &[f64], polar: f64, azimuthal: f64) -> f64 {
        let (amp, mp, ma, sp, sa, rho) = (
            params[0], params[1], params[2], params[3], params[4], params[5],
        );
        if !Self::covariance_is_valid(sp, sa, rho) {
            return 0.0;
        }
        let dp = (polar - mp) / sp;
        let da = (azimuthal - ma) / sa;
        let q = (dp * dp - 2.0 * rho * dp * da + da * da) / (1.0 - rho * rho);
        amp * (-0.5 * q).exp()
    }
}

impl CurveModel for BivariateGaussian {
    type Coordinate = [f64; 2];

    fn name(&self) -> &'static str {
        "angular_profile"
    }

    fn parameter_names(&self) -> &[&'static str] {
        &PARAMETER_NAMES
    }

    fn parameter_bounds(&self) -> Vec<Bounds> {
        self.bounds.clone()
    }

    fn evaluate(&self, params: &[f64], coords: &[[f64; 2]], out: &mut [f64]) {
        if !Self::covariance_is_valid(params[3], params[4], params[5]) {
            out.iter_mut().for_each(|o| *o = 0.0);
            return;
        }
        for (o, [p, a]) in out.iter_mut().zip(coords) {
            *o = Self::peak_value(params, *p, *a) + params[6];
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AngularFitMode {
    Free,
    Forced {
        library_index: usize,
        #[serde(skip)]
        entry: StrongPeakEntry,
    },
    /// A borrowed shape was requested but the library had no entries.
    ForcedUnavailable,
}

impl AngularFitMode {
    pub fn is_forced(&self) -> bool {
        matches!(self, AngularFitMode::Forced { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AngularFitMode::Free => "free",
            AngularFitMode::Forced { .. } => "forced",
            AngularFitMode::ForcedUnavailable => "forced_unavailable",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AngularProfileModel {
    pub amplitude: f64,
    pub mu_polar: f64,
    pub mu_azimuthal: f64,
    pub sigma_polar: f64,
    pub sigma_azimuthal: f64,
    pub correlation: f64,
    pub background: f64,
    pub mode: AngularFitMode,
    pub reduced_chi_squared: f64,
    pub std_errors: Vec<f64>,
    /// Signal counts that went into the fit.
    pub histogram_total: f64,
}

impl AngularProfileModel {
    fn params(&self) -> [f64; 7] {
        [
            self.amplitude,
            self.mu_polar,
            self.mu_azimuthal,
            self.sigma_polar,
            self.sigma_azimuthal,
            self.correlation,
            self.background,
        ]
    }

    pub fn is_degenerate(&self) -> bool {
        !BivariateGaussian::covariance_is_valid(
            self.sigma_polar,
            self.sigma_azimuthal,
            self.correlation,
        )
    }

    /// Full model including the flat background.
    pub fn evaluate(&self, polar: f64, azimuthal: f64) -> f64 {
        if self.is_degenerate() {
            return 0.0;
        }
        BivariateGaussian::peak_value(&self.params(), polar, azimuthal) + self.background
    }

    pub fn evaluate_peak(&self, polar: f64, azimuthal: f64) -> f64 {
        BivariateGaussian::peak_value(&self.params(), polar, azimuthal)
    }

    pub fn as_strong_peak_entry(&self) -> StrongPeakEntry {
        StrongPeakEntry {
            azimuthal: wrap_to_pi(self.mu_azimuthal),
            polar: self.mu_polar,
            sigma_polar: self.sigma_polar,
            sigma_azimuthal: self.sigma_azimuthal,
            correlation: self.correlation,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AngularProfileFitter<'a> {
    config: &'a AngularFitConfig,
    constants: &'a InstrumentConstants,
    solver: SolverOptions,
}

impl<'a> AngularProfileFitter<'a> {
    pub fn new(
        config: &'a AngularFitConfig,
        constants: &'a InstrumentConstants,
        solver: SolverOptions,
    ) -> Self {
        Self {
            config,
            constants,
            solver,
        }
    }

    /// Whether this peak should borrow its shape instead of fitting it freely.
    pub fn wants_forced_fit(&self, hist: &AngularHistogram, geometry: &PeakGeometry) -> bool {
        hist.total() < self.config.force_cutoff
            || geometry.is_near_edge(
                self.constants.detector_rows,
                self.constants.detector_cols,
                self.config.edge_cutoff,
            )
    }

    fn free_seed(&self, hist: &AngularHistogram) -> (Vec<f64>, Vec<Bounds>) {
        let na = hist.azimuthal_centers.len();
        let imax = hist.argmax();
        let mp = hist.polar_centers[imax / na];
        let ma = hist.azimuthal_centers[imax % na];
        let (mean_p, mean_a) = hist.mean_angles().unwrap_or((mp, ma));
        let max_sigma = self.config.max_sigma;
        let sp = self
            .config
            .sigma_polar_seed
            .at(mean_p)
            .clamp(MIN_SIGMA_SEED, max_sigma);
        let sa = self
            .config
            .sigma_azimuthal_seed
            .at(mean_a)
            .clamp(MIN_SIGMA_SEED, max_sigma);

        let seed = vec![hist.counts[imax], mp, ma, sp, sa, 0.0, 0.0];
        let bounds = vec![
            Bounds::non_negative(),
            Bounds::new(
                mp - self.config.dth * hist.polar_step,
                mp + self.config.dth * hist.polar_step,
            ),
            Bounds::new(
                ma - self.config.dph * hist.azimuthal_step,
                ma + self.config.dph * hist.azimuthal_step,
            ),
            Bounds::new(0.0, max_sigma),
            Bounds::new(0.0, max_sigma),
            Bounds::new(-1.0, 1.0),
            Bounds::non_negative(),
        ];
        (seed, bounds)
    }

    /// Widths and correlation pinned to `±force_tolerance` around a strong peak's.
    fn forced_seed(&self, hist: &AngularHistogram, entry: &StrongPeakEntry) -> (Vec<f64>, Vec<Bounds>) {
        let (mut seed, mut bounds) = self.free_seed(hist);
        let tol = self.config.force_tolerance;
        seed[3] = entry.sigma_polar;
        seed[4] = entry.sigma_azimuthal;
        seed[5] = entry.correlation;
        bounds[3] = Bounds::relative(entry.sigma_polar, tol).intersect(&Bounds::non_negative());
        bounds[4] = Bounds::relative(entry.sigma_azimuthal, tol).intersect(&Bounds::non_negative());
        bounds[5] = Bounds::relative(entry.correlation, tol).intersect(&Bounds::new(-1.0, 1.0));
        (seed, bounds)
    }

    #[cfg_attr(
        feature = "instrumentation",
        tracing::instrument(skip_all, level = "trace")
    )]
    pub fn fit_histogram(
        &self,
        hist: &AngularHistogram,
        geometry: &PeakGeometry,
        nominal: (f64, f64),
        library: &StrongPeakLibrary,
    ) -> Result<AngularProfileModel> {
        let total = hist.total();
        if !(total > 0.0) {
            return Err(BraggFitError::degenerate(
                FitStage::AngularProfile,
                "angular histogram is empty",
            ));
        }

        let (nominal_polar, nominal_azimuthal) = nominal;
        let (mode, (seed, bounds)) = if self.wants_forced_fit(hist, geometry) {
            match library.nearest(nominal_azimuthal, nominal_polar) {
                Some((library_index, entry)) => (
                    AngularFitMode::Forced {
                        library_index,
                        entry: *entry,
                    },
                    self.forced_seed(hist, entry),
                ),
                None => {
                    warn!(
                        "Peak {} needs a borrowed angular shape but the strong peak library is empty, fitting freely",
                        geometry.peak_id
                    );
                    (AngularFitMode::ForcedUnavailable, self.free_seed(hist))
                }
            }
        } else {
            (AngularFitMode::Free, self.free_seed(hist))
        };

        let model = BivariateGaussian::new(bounds);
        let coords = hist.coordinates();
        let weights = poisson_weights(&hist.counts);
        let solver = LevenbergMarquardt::new(self.solver, FitStage::AngularProfile);
        let fit = solver.fit(&model, &coords, &hist.counts, &weights, &seed)?;
        let p = &fit.params;

        let out = AngularProfileModel {
            amplitude: p[0],
            mu_polar: p[1],
            mu_azimuthal: p[2],
            sigma_polar: p[3],
            sigma_azimuthal: p[4],
            correlation: p[5],
            background: p[6],
            mode,
            reduced_chi_squared: fit.reduced_chi_squared,
            std_errors: fit.std_errors(),
            histogram_total: total,
        };
        if out.is_degenerate() {
            warn!(
                "Peak {}: angular covariance is not positive definite (sigma_polar={:.3e}, sigma_azimuthal={:.3e}, rho={:.3}), profile set to zero",
                geometry.peak_id, out.sigma_polar, out.sigma_azimuthal, out.correlation
            );
        }
        debug!(
            "Angular fit ({}): mu=({:.5}, {:.5}) sigma=({:.3e}, {:.3e}) rho={:.3} chi2={:.3}",
            mode.as_str(),
            out.mu_polar,
            out.mu_azimuthal,
            out.sigma_polar,
            out.sigma_azimuthal,
            out.correlation,
            out.reduced_chi_squared
        );
        Ok(out)
    }

    /// Histogram of the masked voxels the angular fit runs on.
    pub fn histogram(
        &self,
        grid: &VoxelGrid,
        mapped: &MappedGrid,
        mask: &SignalMask,
    ) -> Result<AngularHistogram> {
        if mask.is_empty() {
            return Err(BraggFitError::degenerate(
                FitStage::AngularProfile,
                "signal mask is empty",
            ));
        }
        build_angular_histogram(grid, mapped, mask, self.config).ok_or_else(|| {
            BraggFitError::degenerate(FitStage::AngularProfile, "no valid voxels to histogram")
        })
    }

    pub fn fit(
        &self,
        grid: &VoxelGrid,
        mapped: &MappedGrid,
        mask: &SignalMask,
        geometry: &PeakGeometry,
        library: &StrongPeakLibrary,
    ) -> Result<AngularProfileModel> {
        let hist = self.histogram(grid, mapped, mask)?;
        self.fit_histogram(
            &hist,
            geometry,
            (mapped.nominal_polar, mapped.nominal_azimuthal),
            library,
        )
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

    fn geometry(row: u32) -> PeakGeometry {
        PeakGeometry {
            peak_id: 7,
            l1: 30.0,
            l2: 0.45,
            scattering_half_angle: 0.7,
            q_nominal: [3.0, 4.0, 0.5],
            detector_row: row,
            detector_col: 128,
            bank: None,
        }
    }

    /// 21x21 histogram of a Gaussian with the given widths, steps of 1e-3 rad.
    fn gaussian_histogram(amp: f64, sp: f64, sa: f64, rho: f64) -> AngularHistogram {
        let step = 1e-3;
        let polar_centers: Vec<f64> = (0..21).map(|i| 1.0 + (i as f64 - 10.0) * step).collect();
        let azimuthal_centers: Vec<f64> = (0..21).map(|j| 0.5 + (j as f64 - 10.0) * step).collect();
        let params = [amp, 1.0, 0.5, sp, sa, rho, 0.0];
        let counts = polar_centers
            .iter()
            .flat_map(|p| {
                azimuthal_centers
                    .iter()
                    .map(move |a| BivariateGaussian::peak_value(&params, *p, *a))
            })
            .collect();
        AngularHistogram {
            polar_centers,
            azimuthal_centers,
            counts,
            polar_step: step,
            azimuthal_step: step,
        }
    }

    #[test]
    fn test_invalid_covariance_evaluates_to_zero() {
        let model = BivariateGaussian::new(vec![Bounds::unbounded(); 7]);
        let coords = [[1.0, 0.5], [1.001, 0.5]];
        for params in [
            [10.0, 1.0, 0.5, 0.0, 0.001, 0.0, 2.0],
            [10.0, 1.0, 0.5, 0.001, 0.001, 1.0, 2.0],
            [10.0, 1.0, 0.5, -0.001, 0.001, 0.0, 2.0],
        ] {
            assert_eq!(model.evaluate_vec(&params, &coords), vec![0.0, 0.0]);
        }
        let ok = model.evaluate_vec(&[10.0, 1.0, 0.5, 0.001, 0.001, 0.5, 2.0], &coords);
        assert!((ok[0] - 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_free_fit_recovers_shape() {
        let consts = constants();
        let config = AngularFitConfig::default();
        let hist = gaussian_histogram(500.0, 0.002, 0.003, 0.3);
        let fitter = AngularProfileFitter::new(&config, &consts, SolverOptions::default());
        let model = fitter
            .fit_histogram(&hist, &geometry(128), (1.0, 0.5), &StrongPeakLibrary::empty())
            .unwrap();
        assert_eq!(model.mode, AngularFitMode::Free);
        assert!((model.mu_polar - 1.0).abs() < 1e-4);
        assert!((model.mu_azimuthal - 0.5).abs() < 1e-4);
        assert!((model.sigma_polar - 0.002).abs() < 1e-4);
        assert!((model.sigma_azimuthal - 0.003).abs() < 1e-4);
        assert!((model.correlation - 0.3).abs() < 0.02);
        assert!(!model.is_degenerate());
    }

    #[test]
    fn test_weak_peak_borrows_shape_within_tolerance() {
        let consts = constants();
        let config = AngularFitConfig::default();
        // Total well below the force cutoff
        let hist = gaussian_histogram(2.0, 0.002, 0.002, 0.0);
        assert!(hist.total() < config.force_cutoff);
        let entry = StrongPeakEntry {
            azimuthal: 0.5,
            polar: 1.0,
            sigma_polar: 0.004,
            sigma_azimuthal: 0.003,
            correlation: 0.2,
        };
        let library: StrongPeakLibrary = vec![entry].into_iter().collect();
        let fitter = AngularProfileFitter::new(&config, &consts, SolverOptions::default());
        let model = fitter
            .fit_histogram(&hist, &geometry(128), (1.0, 0.5), &library)
            .unwrap();
        assert!(model.mode.is_forced());
        let tol = config.force_tolerance;
        assert!((model.sigma_polar - 0.004).abs() <= 0.004 * tol + 1e-12);
        assert!((model.sigma_azimuthal - 0.003).abs() <= 0.003 * tol + 1e-12);
        assert!((model.correlation - 0.2).abs() <= 0.2 * tol + 1e-12);
    }

    #[test]
    fn test_edge_peak_without_library_falls_back() {
        let consts = constants();
        let config = AngularFitConfig::default();
        let hist = gaussian_histogram(500.0, 0.002, 0.002, 0.0);
        let fitter = AngularProfileFitter::new(&config, &consts, SolverOptions::default());
        let model = fitter
            .fit_histogram(&hist, &geometry(1), (1.0, 0.5), &StrongPeakLibrary::empty())
            .unwrap();
        assert_eq!(model.mode, AngularFitMode::ForcedUnavailable);
        assert!((model.sigma_polar - 0.002).abs() < 1e-4);
    }

    #[test]
    fn test_strong_peak_entry_azimuth_is_wrapped() {
        let model = AngularProfileModel {
            amplitude: 10.0,
            mu_polar: 1.2,
            mu_azimuthal: std::f64::consts::PI + 0.05,
            sigma_polar: 0.002,
            sigma_azimuthal: 0.003,
            correlation: 0.0,
            background: 0.0,
            mode: AngularFitMode::Free,
            reduced_chi_squared: 1.0,
            std_errors: vec![],
            histogram_total: 1000.0,
        };
        let entry = model.as_strong_peak_entry();
        assert!((entry.azimuthal - (-std::f64::consts::PI + 0.05)).abs() < 1e-12);
        assert_eq!(entry.polar, 1.2);
    }

    #[test]
    fn test_empty_histogram_is_degenerate() {
        let consts = constants();
        let config = AngularFitConfig::default();
        let hist = gaussian_histogram(0.0, 0.002, 0.002, 0.0);
        let fitter = AngularProfileFitter::new(&config, &consts, SolverOptions::default());
        let err = fitter
            .fit_histogram(&hist, &geometry(128), (1.0, 0.5), &StrongPeakLibrary::empty())
            .unwrap_err();
        assert!(err.is_degenerate());
    }
}
