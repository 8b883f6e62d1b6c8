//! Configuration for the integration engine.
//!
//! Everything here is plain data that deserializes from JSON with sensible
//! defaults for every field, except the instrument constants which have no
//! safe default and must be provided explicitly (see [`InstrumentConfig::validate`]).

use crate::errors::ConfigurationError;
use serde::{
    Deserialize,
    Serialize,
};
use statrs::distribution::{
    ContinuousCDF,
    Normal,
};

/// Conversion between neutron wavelength and TOF, in µs / (Å · m), times 4π.
///
/// `TOF = K · (L1 + L2) · sin(θ) / |Q|`.
pub const DEFAULT_TOF_CONSTANT: f64 = 3176.507;

/// Moderator coefficients used to seed the Ikeda-Carpenter pulse shape.
///
/// `A = 1 / (alpha0 + alpha1 * λ)`, `B = 1 / beta0`, `R = exp(-81.799 / (kappa * λ²))`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModeratorCoefficients {
    pub alpha0: f64,
    pub alpha1: f64,
    pub beta0: f64,
    pub kappa: f64,
}

/// Validated, immutable instrument constants.
///
/// Passed by reference into the coordinate mapper and the TOF fitter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InstrumentConstants {
    pub tof_constant: f64,
    pub detector_rows: u32,
    pub detector_cols: u32,
    pub moderator: ModeratorCoefficients,
}

/// Instrument constants as read from a config file; every field may be missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstrumentConfig {
    pub tof_constant: Option<f64>,
    pub detector_rows: Option<u32>,
    pub detector_cols: Option<u32>,
    pub alpha0: Option<f64>,
    pub alpha1: Option<f64>,
    pub beta0: Option<f64>,
    pub kappa: Option<f64>,
}

fn require<T>(value: Option<T>, name: &'static str) -> Result<T, ConfigurationError> {
    value.ok_or(ConfigurationError::MissingParameter { name })
}

fn require_positive(value: Option<f64>, name: &'static str) -> Result<f64, ConfigurationError> {
    let value = require(value, name)?;
    if !(value.is_finite() && value > 0.0) {
        return Err(ConfigurationError::InvalidParameter {
            name,
            reason: format!("expected a finite positive value, got {}", value),
        });
    }
    Ok(value)
}

impl InstrumentConfig {
    /// Checks that every constant needed by the engine is present.
    ///
    /// A missing constant is fatal for the whole run, not for a single peak.
    pub fn validate(&self) -> Result<InstrumentConstants, ConfigurationError> {
        let detector_rows = require(self.detector_rows, "detector_rows")?;
        let detector_cols = require(self.detector_cols, "detector_cols")?;
        if detector_rows == 0 || detector_cols == 0 {
            return Err(ConfigurationError::InvalidParameter {
                name: "detector_rows",
                reason: "detector dimensions must be non-zero".to_string(),
            });
        }
        Ok(InstrumentConstants {
            tof_constant: require_positive(self.tof_constant, "tof_constant")?,
            detector_rows,
            detector_cols,
            moderator: ModeratorCoefficients {
                alpha0: require_positive(self.alpha0, "alpha0")?,
                alpha1: require_positive(self.alpha1, "alpha1")?,
                beta0: require_positive(self.beta0, "beta0")?,
                kappa: require_positive(self.kappa, "kappa")?,
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Half-width of the smoothing neighbourhood; 1 means 3x3x3.
    pub neighborhood_radius: usize,
    /// Two-sided confidence used to derive the z-score of the signal threshold.
    pub confidence: f64,
    pub pplmin_frac: f64,
    pub pplmax_frac: f64,
    pub max_iterations: usize,
    /// Convergence tolerance on the background level, relative to the initial estimate.
    pub tolerance: f64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            neighborhood_radius: 1,
            confidence: 0.95,
            pplmin_frac: 0.1,
            pplmax_frac: 1.5,
            max_iterations: 25,
            tolerance: 1e-3,
        }
    }
}

impl BackgroundConfig {
    /// z-score matching the configured confidence (0.95 -> ~1.96).
    pub fn z_score(&self) -> f64 {
        // Normal::new(0, 1) cannot fail.
        let std_normal = Normal::new(0.0, 1.0).expect("Standard normal is always valid");
        std_normal.inverse_cdf(0.5 + 0.5 * self.confidence)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TofFitConfig {
    /// Half-width of the TOF window, as a fraction of the nominal TOF.
    pub dt_spread: f64,
    pub bin_width_us: f64,
    pub min_bin_width_us: f64,
    pub max_bins: usize,
    /// Order of the background polynomial (0 = constant).
    pub background_order: usize,
    pub hat_width_us: f64,
    /// Decay rate of the exponential response kernel, in 1/µs.
    pub kconv: f64,
    pub fix_hat_width: bool,
    pub fix_kconv: bool,
}

impl Default for TofFitConfig {
    fn default() -> Self {
        Self {
            dt_spread: 0.03,
            bin_width_us: 4.0,
            min_bin_width_us: 1.0,
            max_bins: 400,
            background_order: 1,
            hat_width_us: 0.5,
            kconv: 0.25,
            fix_hat_width: true,
            fix_kconv: true,
        }
    }
}

/// `sigma = intercept + slope * mean_angle`, used to seed the angular widths.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LinearSeed {
    pub intercept: f64,
    pub slope: f64,
}

impl LinearSeed {
    pub fn at(&self, angle: f64) -> f64 {
        self.intercept + self.slope * angle
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AngularFitConfig {
    pub frac_box_to_histogram: f64,
    /// Number of polar bins; `None` picks one bin per voxel along the longest grid axis.
    pub n_polar_bins: Option<usize>,
    pub n_azimuthal_bins: Option<usize>,
    /// Maximum centre displacement, in histogram cells.
    pub dth: f64,
    pub dph: f64,
    pub max_sigma: f64,
    pub sigma_polar_seed: LinearSeed,
    pub sigma_azimuthal_seed: LinearSeed,
    /// Histogram counts below which the peak borrows its shape from a strong peak.
    pub force_cutoff: f64,
    /// Distance (in pixels) from the detector boundary that forces a borrowed shape.
    pub edge_cutoff: u32,
    pub force_tolerance: f64,
}

impl Default for AngularFitConfig {
    fn default() -> Self {
        Self {
            frac_box_to_histogram: 1.0,
            n_polar_bins: None,
            n_azimuthal_bins: None,
            dth: 3.0,
            dph: 3.0,
            max_sigma: 0.02,
            sigma_polar_seed: LinearSeed {
                intercept: 0.0015,
                slope: 0.0025,
            },
            sigma_azimuthal_seed: LinearSeed {
                intercept: 0.0020,
                slope: 0.0,
            },
            force_cutoff: 250.0,
            edge_cutoff: 3,
            force_tolerance: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingConfig {
    /// Half-width (in voxels) of the box around the joint-model maximum used for the fit.
    pub half_window: usize,
    /// Fraction of the joint-model maximum above which voxels are integrated.
    pub integration_threshold: f64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            half_window: 8,
            integration_threshold: 0.025,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Relative reduction in cost below which the fit is considered converged.
    pub ftol: f64,
    /// Relative step size below which the fit is considered converged.
    pub xtol: f64,
    /// Largest cosine between residuals and the Jacobian of the unpinned parameters at convergence.
    pub gtol: f64,
    pub initial_damping: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-8,
            xtol: 1e-8,
            gtol: 1e-8,
            initial_damping: 1e-3,
        }
    }
}

/// Knobs of every stage of the per-peak fit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntegrationConfig {
    pub background: BackgroundConfig,
    pub tof: TofFitConfig,
    pub angular: AngularFitConfig,
    pub scaling: ScalingConfig,
    pub solver: SolverOptions,
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

impl IntegrationConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let bg = &self.background;
        if !(bg.confidence > 0.0 && bg.confidence < 1.0) {
            return Err(invalid("confidence", "must lie in (0, 1)"));
        }
        if bg.pplmin_frac < 0.0 || bg.pplmax_frac < bg.pplmin_frac {
            return Err(invalid(
                "pplmin_frac",
                format!(
                    "expected 0 <= pplmin_frac <= pplmax_frac, got {} and {}",
                    bg.pplmin_frac, bg.pplmax_frac
                ),
            ));
        }
        if !(self.tof.dt_spread > 0.0 && self.tof.dt_spread < 1.0) {
            return Err(invalid("dt_spread", "must lie in (0, 1)"));
        }
        if self.tof.min_bin_width_us <= 0.0 || self.tof.max_bins < 2 {
            return Err(invalid(
                "min_bin_width_us",
                "bin width must be positive and at least two bins allowed",
            ));
        }
        if self.tof.background_order > 3 {
            return Err(invalid("background_order", "at most a cubic background is supported"));
        }
        let ang = &self.angular;
        if !(ang.frac_box_to_histogram > 0.0 && ang.frac_box_to_histogram <= 1.0) {
            return Err(invalid("frac_box_to_histogram", "must lie in (0, 1]"));
        }
        if ang.max_sigma <= 0.0 {
            return Err(invalid("max_sigma", "must be positive"));
        }
        if ang.force_tolerance < 0.0 {
            return Err(invalid("force_tolerance", "must be non-negative"));
        }
        if self.solver.max_iterations == 0 {
            return Err(invalid("max_iterations", "must be at least 1"));
        }
        Ok(())
    }
}
