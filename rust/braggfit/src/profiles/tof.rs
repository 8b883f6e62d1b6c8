//! TOF profile: histogram of signal voxels along TOF and a convolved
//! Ikeda-Carpenter fit on top of a polynomial background.

use super::ikeda_carpenter::{
    convolve_same,
    energy_from_wavelength,
    ikeda_carpenter,
    response_kernel,
    seed_from_energy,
    wavelength_from_tof,
};
use crate::background::SignalMask;
use crate::config::{
    InstrumentConstants,
    SolverOptions,
    TofFitConfig,
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
use serde::Serialize;
use tracing::debug;

pub const MAX_BACKGROUND_ORDER: usize = 3;

static PARAMETER_NAMES: [&str; 7 + MAX_BACKGROUND_ORDER + 1] = [
    "A", "B", "R", "T0", "Scale", "HatWidth", "KConv", "bg0", "bg1", "bg2", "bg3",
];

const IDX_A: usize = 0;
const IDX_B: usize = 1;
const IDX_R: usize = 2;
const IDX_T0: usize = 3;
const IDX_SCALE: usize = 4;
const IDX_HAT: usize = 5;
const IDX_KCONV: usize = 6;
const IDX_BG: usize = 7;

/// Counts of signal voxels binned along TOF.
#[derive(Debug, Clone)]
pub struct TofHistogram {
    pub centers: Vec<f64>,
    pub counts: Vec<f64>,
    pub bin_width: f64,
}

impl TofHistogram {
    pub fn num_nonzero(&self) -> usize {
        self.counts.iter().filter(|c| **c > 0.0).count()
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    pub fn domain(&self) -> (f64, f64) {
        let half = 0.5 * self.bin_width;
        match (self.centers.first(), self.centers.last()) {
            (Some(lo), Some(hi)) => (lo - half, hi + half),
            _ => (0.0, 0.0),
        }
    }
}

/// Bins signal-masked, valid voxels into a TOF window around `nominal_tof`.
pub fn build_tof_histogram(
    grid: &VoxelGrid,
    mapped: &MappedGrid,
    mask: &SignalMask,
    config: &TofFitConfig,
) -> TofHistogram {
    let t0 = mapped.nominal_tof;
    let lo = t0 * (1.0 - config.dt_spread);
    let hi = t0 * (1.0 + config.dt_spread);
    let width = hi - lo;
    let bin_width = config
        .bin_width_us
        .max(width / config.max_bins as f64)
        .max(config.min_bin_width_us);
    let nbins = ((width / bin_width).ceil() as usize).max(1);

    let mut counts = vec![0.0; nbins];
    let grid_counts = grid.counts();
    for (idx, c) in mapped.iter_valid() {
        if !mask.is_signal(idx) || c.tof < lo || c.tof >= hi {
            continue;
        }
        let bin = (((c.tof - lo) / bin_width) as usize).min(nbins - 1);
        counts[bin] += grid_counts[idx];
    }
    let centers = (0..nbins)
        .map(|i| lo + (i as f64 + 0.5) * bin_width)
        .collect();

    TofHistogram {
        centers,
        counts,
        bin_width,
    }
}

/// `Scale · (IC ⊛ response)(t) · dt + Σ bgₖ xᵏ`, with `x = (t - t_ref) / t_scale`.
///
/// Coordinates must be uniformly spaced bin centres; the convolution runs on that grid.
#[derive(Debug, Clone)]
pub struct TofPulseModel {
    t_ref: f64,
    t_scale: f64,
    background_order: usize,
    bounds: Vec<Bounds>,
}

impl TofPulseModel {
    fn peak_component(&self, params: &[f64], coords: &[f64], out: &mut [f64]) {
        let dt = if coords.len() > 1 {
            coords[1] - coords[0]
        } else {
            1.0
        };
        let ic: Vec<f64> = coords
            .iter()
            .map(|t| ikeda_carpenter(t - params[IDX_T0], params[IDX_A], params[IDX_B], params[IDX_R]))
            .collect();
        let kernel = response_kernel(dt, params[IDX_HAT], params[IDX_KCONV], coords.len());
        convolve_same(&ic, &kernel, out);
        let scale = params[IDX_SCALE] * dt;
        out.iter_mut().for_each(|o| *o *= scale);
    }

    fn background(&self, params: &[f64], t: f64) -> f64 {
        let x = (t - self.t_ref) / self.t_scale;
        params[IDX_BG..IDX_BG + self.background_order + 1]
            .iter()
            .rev()
            .fold(0.0, |acc, c| acc * x + c)
    }
}

impl CurveModel for TofPulseModel {
    type Coordinate = f64;

    fn name(&self) -> &'static str {
        "tof_profile"
    }

    fn parameter_names(&self) -> &[&'static str] {
        &PARAMETER_NAMES[..IDX_BG + self.background_order + 1]
    }

    fn parameter_bounds(&self) -> Vec<Bounds> {
        self.bounds.clone()
    }

    fn evaluate(&self, params: &[f64], coords: &[f64], out: &mut [f64]) {
        self.peak_component(params, coords, out);
        for (o, t) in out.iter_mut().zip(coords) {
            *o += self.background(params, *t);
        }
    }
}

/// Fitted TOF profile. Evaluates to zero outside the fitted domain.
#[derive(Debug, Clone, Serialize)]
pub struct TofProfileModel {
    pub a: f64,
    pub b: f64,
    pub r: f64,
    pub t0: f64,
    pub scale: f64,
    pub hat_width: f64,
    pub kconv: f64,
    pub background: Vec<f64>,
    pub domain: (f64, f64),
    pub reduced_chi_squared: f64,
    pub std_errors: Vec<f64>,
    #[serde(skip)]
    pub centers: Vec<f64>,
    #[serde(skip)]
    pub peak_curve: Vec<f64>,
    #[serde(skip)]
    pub background_curve: Vec<f64>,
}

impl TofProfileModel {
    /// Peak component at `t`, linearly interpolated between bin centres.
    pub fn evaluate(&self, t: f64) -> f64 {
        if !(t >= self.domain.0 && t <= self.domain.1) || self.centers.is_empty() {
            return 0.0;
        }
        let n = self.centers.len();
        if t <= self.centers[0] {
            return self.peak_curve[0];
        }
        if t >= self.centers[n - 1] {
            return self.peak_curve[n - 1];
        }
        let i = self.centers.partition_point(|c| *c <= t);
        let (t_lo, t_hi) = (self.centers[i - 1], self.centers[i]);
        let frac = (t - t_lo) / (t_hi - t_lo);
        self.peak_curve[i - 1] * (1.0 - frac) + self.peak_curve[i] * frac
    }

    pub fn peak_time(&self) -> f64 {
        self.peak_curve
            .iter()
            .zip(self.centers.iter())
            .fold((f64::NEG_INFINITY, self.t0), |acc, (v, t)| {
                if *v > acc.0 {
                    (*v, *t)
                } else {
                    acc
                }
            })
            .1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TofProfileFitter<'a> {
    config: &'a TofFitConfig,
    constants: &'a InstrumentConstants,
    solver: SolverOptions,
}

impl<'a> TofProfileFitter<'a> {
    pub fn new(
        config: &'a TofFitConfig,
        constants: &'a InstrumentConstants,
        solver: SolverOptions,
    ) -> Self {
        Self {
            config,
            constants,
            solver,
        }
    }

    fn build_model(&self, hist: &TofHistogram, nominal_tof: f64, seed: &[f64]) -> TofPulseModel {
        let order = self.config.background_order.min(MAX_BACKGROUND_ORDER);
        let (lo, hi) = hist.domain();
        let mut bounds = vec![
            Bounds::new(0.1 * seed[IDX_A], 10.0 * seed[IDX_A]),
            Bounds::new(0.1 * seed[IDX_B], 10.0 * seed[IDX_B]),
            Bounds::new(0.0, 1.0),
            Bounds::new(lo, hi),
            Bounds::non_negative(),
            if self.config.fix_hat_width {
                Bounds::fixed(self.config.hat_width_us)
            } else {
                Bounds::new(0.0, 10.0 * self.config.hat_width_us.max(hist.bin_width))
            },
            if self.config.fix_kconv {
                Bounds::fixed(self.config.kconv)
            } else {
                Bounds::new(0.1 * self.config.kconv, 10.0 * self.config.kconv)
            },
        ];
        bounds.extend(std::iter::repeat(Bounds::unbounded()).take(order + 1));
        TofPulseModel {
            t_ref: nominal_tof,
            t_scale: 0.5 * (hi - lo),
            background_order: order,
            bounds,
        }
    }

    /// Initial parameters from the incident energy implied by the nominal TOF.
    fn seed(&self, hist: &TofHistogram, geometry: &PeakGeometry, nominal_tof: f64) -> Vec<f64> {
        let order = self.config.background_order.min(MAX_BACKGROUND_ORDER);
        let wavelength = wavelength_from_tof(nominal_tof, geometry.l1 + geometry.l2);
        let energy = energy_from_wavelength(wavelength);
        let (a, b, r) = seed_from_energy(&self.constants.moderator, energy);

        let (imax, _) = hist
            .counts
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, c)| {
                if *c > acc.1 {
                    (i, *c)
                } else {
                    acc
                }
            });
        // The fast term of the pulse peaks 2/A after emission.
        let (lo, hi) = hist.domain();
        let t0 = (hist.centers[imax] - 2.0 / a).clamp(lo, hi);

        let mut seed = vec![
            a,
            b,
            r,
            t0,
            hist.total(),
            self.config.hat_width_us,
            self.config.kconv,
        ];
        seed.extend(std::iter::repeat(0.0).take(order + 1));
        seed
    }

    #[cfg_attr(
        feature = "instrumentation",
        tracing::instrument(skip_all, level = "trace")
    )]
    pub fn fit_histogram(
        &self,
        hist: &TofHistogram,
        geometry: &PeakGeometry,
        nominal_tof: f64,
    ) -> Result<TofProfileModel> {
        let order = self.config.background_order.min(MAX_BACKGROUND_ORDER);
        let n_free = 5
            + order
            + 1
            + usize::from(!self.config.fix_hat_width)
            + usize::from(!self.config.fix_kconv);
        let nonzero = hist.num_nonzero();
        if nonzero < n_free + 1 {
            return Err(BraggFitError::degenerate(
                FitStage::TofProfile,
                format!(
                    "{} non-empty TOF bins for {} free parameters",
                    nonzero, n_free
                ),
            ));
        }

        let seed = self.seed(hist, geometry, nominal_tof);
        let model = self.build_model(hist, nominal_tof, &seed);
        let weights = poisson_weights(&hist.counts);
        let solver = LevenbergMarquardt::new(self.solver, FitStage::TofProfile);
        let fit = solver.fit(&model, &hist.centers, &hist.counts, &weights, &seed)?;
        let p = &fit.params;

        let mut peak_curve = vec![0.0; hist.centers.len()];
        model.peak_component(p, &hist.centers, &mut peak_curve);
        let background_curve = hist
            .centers
            .iter()
            .map(|t| model.background(p, *t))
            .collect();

        debug!(
            "TOF fit: A={:.4} B={:.4} R={:.3} T0={:.2} Scale={:.1} chi2={:.3} iterations={}",
            p[IDX_A], p[IDX_B], p[IDX_R], p[IDX_T0], p[IDX_SCALE], fit.reduced_chi_squared, fit.iterations
        );

        Ok(TofProfileModel {
            a: p[IDX_A],
            b: p[IDX_B],
            r: p[IDX_R],
            t0: p[IDX_T0],
            scale: p[IDX_SCALE],
            hat_width: p[IDX_HAT],
            kconv: p[IDX_KCONV],
            background: p[IDX_BG..].to_vec(),
            domain: hist.domain(),
            reduced_chi_squared: fit.reduced_chi_squared,
            std_errors: fit.std_errors(),
            centers: hist.centers.clone(),
            peak_curve,
            background_curve,
        })
    }

    /// Histograms the signal voxels and fits the pulse shape.
    pub fn fit(
        &self,
        grid: &VoxelGrid,
        mapped: &MappedGrid,
        mask: &SignalMask,
        geometry: &PeakGeometry,
    ) -> Result<TofProfileModel> {
        if mask.is_empty() {
            return Err(BraggFitError::degenerate(
                FitStage::TofProfile,
                "signal mask is empty",
            ));
        }
        let hist = build_tof_histogram(grid, mapped, mask, self.config);
        self.fit_histogram(&hist, geometry, mapped.nominal_tof)
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

    fn geometry() -> PeakGeometry {
        PeakGeometry {
            peak_id: 3,
            l1: 30.0,
            l2: 0.45,
            scattering_half_angle: 0.7,
            q_nominal: [3.0, 4.0, 0.5],
            detector_row: 100,
            detector_col: 100,
            bank: None,
        }
    }

    /// Noise-free histogram drawn from the model itself.
    fn synthetic_histogram(truth: &[f64], config: &TofFitConfig, nominal: f64) -> TofHistogram {
        let lo = nominal * (1.0 - config.dt_spread);
        let hi = nominal * (1.0 + config.dt_spread);
        let bin_width = config.bin_width_us;
        let n = ((hi - lo) / bin_width).ceil() as usize;
        let centers: Vec<f64> = (0..n).map(|i| lo + (i as f64 + 0.5) * bin_width).collect();
        let model = TofPulseModel {
            t_ref: nominal,
            t_scale: 0.5 * (hi - lo),
            background_order: config.background_order,
            bounds: vec![Bounds::unbounded(); truth.len()],
        };
        let counts = model.evaluate_vec(truth, &centers);
        TofHistogram {
            centers,
            counts,
            bin_width,
        }
    }

    #[test]
    fn test_fit_recovers_pulse_position_and_area() {
        let consts = constants();
        let config = TofFitConfig {
            dt_spread: 0.01,
            ..TofFitConfig::default()
        };
        let nominal = 10_000.0;
        let truth = [0.2, 0.03, 0.4, 9_990.0, 5_000.0, 0.5, 0.25, 2.0, 0.0];
        let hist = synthetic_histogram(&truth, &config, nominal);
        let fitter = TofProfileFitter::new(&config, &consts, SolverOptions::default());
        let fitted = fitter.fit_histogram(&hist, &geometry(), nominal).unwrap();

        assert!((fitted.t0 - 9_990.0).abs() < 4.0, "T0 {}", fitted.t0);
        assert!((fitted.scale - 5_000.0).abs() / 5_000.0 < 0.05, "Scale {}", fitted.scale);
        assert!(fitted.reduced_chi_squared < 1.0);
        assert_eq!(fitted.background.len(), 2);
    }

    #[test]
    fn test_model_is_zero_outside_domain() {
        let consts = constants();
        let config = TofFitConfig {
            dt_spread: 0.01,
            ..TofFitConfig::default()
        };
        let nominal = 10_000.0;
        let truth = [0.2, 0.03, 0.4, 9_990.0, 5_000.0, 0.5, 0.25, 0.0, 0.0];
        let hist = synthetic_histogram(&truth, &config, nominal);
        let fitter = TofProfileFitter::new(&config, &consts, SolverOptions::default());
        let fitted = fitter.fit_histogram(&hist, &geometry(), nominal).unwrap();

        let (lo, hi) = fitted.domain;
        assert_eq!(fitted.evaluate(lo - 1.0), 0.0);
        assert_eq!(fitted.evaluate(hi + 1.0), 0.0);
        assert!(fitted.evaluate(fitted.peak_time()) > 0.0);
    }

    #[test]
    fn test_too_few_bins_is_degenerate() {
        let consts = constants();
        let config = TofFitConfig::default();
        let hist = TofHistogram {
            centers: vec![1.0, 2.0, 3.0, 4.0],
            counts: vec![0.0, 5.0, 3.0, 0.0],
            bin_width: 1.0,
        };
        let fitter = TofProfileFitter::new(&config, &consts, SolverOptions::default());
        let err = fitter.fit_histogram(&hist, &geometry(), 2.5).unwrap_err();
        assert!(err.is_degenerate());
    }
}
