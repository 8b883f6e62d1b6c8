//! Curve models and the nonlinear least-squares solver they are fitted with.
//!
//! Every fitted model (TOF pulse shape, angular bivariate Gaussian, linear
//! scaling) implements [`CurveModel`] once and is handed by reference to the
//! same [`LevenbergMarquardt`] routine.

pub mod solver;

pub use solver::{
    CurveFit,
    FittedParameter,
    LevenbergMarquardt,
};

use crate::config::SolverOptions;
use crate::errors::{
    FitStage,
    Result,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Box constraint on a single parameter. `lower == upper` fixes the parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: f64,
    pub upper: f64,
}

impl Bounds {
    pub fn new(a: f64, b: f64) -> Self {
        Self {
            lower: a.min(b),
            upper: a.max(b),
        }
    }

    pub fn fixed(value: f64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    pub fn non_negative() -> Self {
        Self {
            lower: 0.0,
            upper: f64::INFINITY,
        }
    }

    /// `value ± frac·|value|`.
    pub fn relative(value: f64, frac: f64) -> Self {
        let delta = value.abs() * frac;
        Self::new(value - delta, value + delta)
    }

    pub fn intersect(&self, other: &Bounds) -> Self {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        if lower > upper {
            // Disjoint: collapse onto the nearest edge of `self`.
            let v = if other.lower > self.upper {
                self.upper
            } else {
                self.lower
            };
            return Self::fixed(v);
        }
        Self { lower, upper }
    }

    pub fn is_fixed(&self) -> bool {
        self.lower == self.upper
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.lower).min(self.upper)
    }

    pub fn span(&self) -> f64 {
        self.upper - self.lower
    }
}

/// A parametric model `f(params; x)` evaluated over a set of coordinates.
pub trait CurveModel {
    type Coordinate;

    fn name(&self) -> &'static str;

    fn parameter_names(&self) -> &[&'static str];

    /// One bound per parameter, in the order of [`parameter_names`](Self::parameter_names).
    fn parameter_bounds(&self) -> Vec<Bounds>;

    /// Writes `f(params; coords[i])` into `out[i]`.
    fn evaluate(&self, params: &[f64], coords: &[Self::Coordinate], out: &mut [f64]);

    fn num_parameters(&self) -> usize {
        self.parameter_names().len()
    }

    fn evaluate_vec(&self, params: &[f64], coords: &[Self::Coordinate]) -> Vec<f64> {
        let mut out = vec![0.0; coords.len()];
        self.evaluate(params, coords, &mut out);
        out
    }
}

/// Convenience wrapper around [`LevenbergMarquardt::fit`] for one-off fits.
pub fn fit_curve<M: CurveModel>(
    model: &M,
    coords: &[M::Coordinate],
    observed: &[f64],
    weights: &[f64],
    initial: &[f64],
    options: SolverOptions,
    stage: FitStage,
) -> Result<CurveFit> {
    LevenbergMarquardt::new(options, stage).fit(model, coords, observed, weights, initial)
}

/// `1/σ` weights for Poisson counts, with σ² floored at one count.
pub fn poisson_weights(counts: &[f64]) -> Vec<f64> {
    counts.iter().map(|c| 1.0 / c.max(1.0).sqrt()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_bounds_with_negative_value() {
        let b = Bounds::relative(-0.5, 0.1);
        assert!((b.lower + 0.55).abs() < 1e-12);
        assert!((b.upper + 0.45).abs() < 1e-12);
    }

    #[test]
    fn test_intersect() {
        let b = Bounds::new(-1.0, 1.0).intersect(&Bounds::new(0.5, 2.0));
        assert_eq!(b, Bounds::new(0.5, 1.0));
        let disjoint = Bounds::new(-1.0, 1.0).intersect(&Bounds::new(2.0, 3.0));
        assert!(disjoint.is_fixed());
        assert_eq!(disjoint.lower, 1.0);
    }

    #[test]
    fn test_poisson_weights_floor() {
        let w = poisson_weights(&[0.0, 4.0]);
        assert_eq!(w, vec![1.0, 0.5]);
    }
}
