//! Bounded Levenberg-Marquardt least squares with a finite-difference Jacobian.
//!
//! Bounds are enforced by projecting every trial step back into the feasible
//! box. Parameters whose bounds collapse to a single value are held fixed and
//! excluded from the normal equations.
//!
//! Each call owns its own scratch buffers, so concurrent fits never share state.

use super::{
    Bounds,
    CurveModel,
};
use crate::config::SolverOptions;
use crate::errors::{
    BraggFitError,
    FitStage,
    Result,
};
use nalgebra::{
    DMatrix,
    DVector,
};
use serde::Serialize;
use tracing::trace;

/// Damping above which no descent step exists inside the box; the current point is a minimum.
const MAX_DAMPING: f64 = 1e16;
const MIN_DAMPING: f64 = 1e-12;
const DAMPING_UP: f64 = 10.0;
const DAMPING_DOWN: f64 = 0.3;

/// Relative finite-difference step.
const FD_STEP: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FittedParameter {
    pub name: &'static str,
    pub value: f64,
    pub std_error: f64,
    pub lower: f64,
    pub upper: f64,
    pub fixed: bool,
}

/// Output of a converged fit.
#[derive(Debug, Clone, Serialize)]
pub struct CurveFit {
    pub params: Vec<f64>,
    pub table: Vec<FittedParameter>,
    pub reduced_chi_squared: f64,
    pub iterations: usize,
    pub n_points: usize,
}

impl CurveFit {
    pub fn std_errors(&self) -> Vec<f64> {
        self.table.iter().map(|p| p.std_error).collect()
    }
}

/// One solver per stage; the stage only labels errors.
#[derive(Debug, Clone, Copy)]
pub struct LevenbergMarquardt {
    pub options: SolverOptions,
    pub stage: FitStage,
}

struct Workspace {
    model_out: Vec<f64>,
    trial_out: Vec<f64>,
    residuals: Vec<f64>,
}

fn weighted_cost(model: &[f64], observed: &[f64], weights: &[f64], residuals: &mut [f64]) -> f64 {
    let mut cost = 0.0;
    for i in 0..observed.len() {
        let r = weights[i] * (observed[i] - model[i]);
        residuals[i] = r;
        cost += r * r;
    }
    if cost.is_finite() {
        cost
    } else {
        f64::INFINITY
    }
}

impl LevenbergMarquardt {
    pub fn new(options: SolverOptions, stage: FitStage) -> Self {
        Self { options, stage }
    }

    fn fd_step(value: f64, bounds: &Bounds) -> f64 {
        let span = bounds.span();
        let scale = if span.is_finite() && span > 0.0 {
            value.abs().max(span * 1e-3)
        } else {
            value.abs().max(1e-6)
        };
        let h = FD_STEP * scale;
        // Step inwards when sitting on the upper bound.
        if value + h > bounds.upper {
            -h
        } else {
            h
        }
    }

    /// A parameter on its lower (upper) bound whose cost gradient asks it to decrease (increase).
    fn is_pinned(value: f64, bounds: &Bounds, descent: f64) -> bool {
        (value <= bounds.lower && descent <= 0.0) || (value >= bounds.upper && descent >= 0.0)
    }

    /// Largest cosine between the residual vector and a Jacobian column, over the unpinned
    /// parameters. Zero when every free parameter is pinned.
    fn projected_gradient_converged(
        &self,
        jac: &DMatrix<f64>,
        gradient: &DVector<f64>,
        active: &[usize],
        cost: f64,
    ) -> bool {
        let residual_norm = cost.sqrt();
        let mut gnorm: f64 = 0.0;
        for &col in active {
            let col_norm = jac.column(col).norm();
            if col_norm > 0.0 && residual_norm > 0.0 {
                gnorm = gnorm.max(gradient[col].abs() / (col_norm * residual_norm));
            }
        }
        gnorm <= self.options.gtol
    }

    /// Weighted Jacobian of the model w.r.t. the free parameters.
    fn jacobian<M: CurveModel>(
        model: &M,
        coords: &[M::Coordinate],
        params: &[f64],
        base: &[f64],
        weights: &[f64],
        free: &[usize],
        bounds: &[Bounds],
        scratch: &mut [f64],
    ) -> DMatrix<f64> {
        let n = coords.len();
        let mut jac = DMatrix::<f64>::zeros(n, free.len());
        let mut shifted = params.to_vec();
        for (col, &p) in free.iter().enumerate() {
            let h = Self::fd_step(params[p], &bounds[p]);
            shifted[p] = params[p] + h;
            model.evaluate(&shifted, coords, scratch);
            for i in 0..n {
                let d = (scratch[i] - base[i]) / h;
                jac[(i, col)] = if d.is_finite() { weights[i] * d } else { 0.0 };
            }
            shifted[p] = params[p];
        }
        jac
    }

    /// Fits `model` to `observed` (weighted by `weights`, i.e. 1/σ) starting from `initial`.
    ///
    /// The initial guess is clamped into the model's bounds first.
    pub fn fit<M: CurveModel>(
        &self,
        model: &M,
        coords: &[M::Coordinate],
        observed: &[f64],
        weights: &[f64],
        initial: &[f64],
    ) -> Result<CurveFit> {
        let bounds = model.parameter_bounds();
        let names = model.parameter_names();
        let n = coords.len();
        assert_eq!(observed.len(), n, "observed and coordinates must match");
        assert_eq!(weights.len(), n, "weights and coordinates must match");
        assert_eq!(initial.len(), bounds.len(), "one initial value per parameter");

        let mut params: Vec<f64> = initial
            .iter()
            .zip(bounds.iter())
            .map(|(v, b)| b.clamp(*v))
            .collect();
        let free: Vec<usize> = (0..params.len()).filter(|i| !bounds[*i].is_fixed()).collect();

        if n <= free.len() {
            return Err(BraggFitError::degenerate(
                self.stage,
                format!(
                    "{} fit has {} points for {} free parameters",
                    model.name(),
                    n,
                    free.len()
                ),
            ));
        }

        let mut ws = Workspace {
            model_out: vec![0.0; n],
            trial_out: vec![0.0; n],
            residuals: vec![0.0; n],
        };
        let mut scratch = vec![0.0; n];

        model.evaluate(&params, coords, &mut ws.model_out);
        let mut cost = weighted_cost(&ws.model_out, observed, weights, &mut ws.residuals);
        if !cost.is_finite() {
            return Err(BraggFitError::FitConvergence {
                model: model.name(),
                iterations: 0,
                context: "model is not finite at the initial parameters".to_string(),
            });
        }

        let mut damping = self.options.initial_damping;
        let mut iterations = 0;
        let mut converged = free.is_empty() || cost == 0.0;

        while !converged && iterations < self.options.max_iterations {
            iterations += 1;
            let jac = Self::jacobian(
                model,
                coords,
                &params,
                &ws.model_out,
                weights,
                &free,
                &bounds,
                &mut scratch,
            );
            let gradient = jac.transpose() * DVector::from_column_slice(&ws.residuals);
            if gradient.amax() == 0.0 {
                converged = true;
                break;
            }

            // Parameters pinned on a bound with the descent direction pointing outwards
            // take no part in the step.
            let active: Vec<usize> = (0..free.len())
                .filter(|&col| !Self::is_pinned(params[free[col]], &bounds[free[col]], gradient[col]))
                .collect();
            if self.projected_gradient_converged(&jac, &gradient, &active, cost) {
                converged = true;
                break;
            }

            let full_jtj = jac.transpose() * &jac;
            let jtj = DMatrix::from_fn(active.len(), active.len(), |r, c| {
                full_jtj[(active[r], active[c])]
            });
            let active_gradient = DVector::from_fn(active.len(), |r, _| gradient[active[r]]);

            let diag_floor = jtj.diagonal().amax().max(1.0) * 1e-12;
            loop {
                let mut damped = jtj.clone();
                for j in 0..active.len() {
                    damped[(j, j)] += damping * jtj[(j, j)].max(diag_floor);
                }
                let step = match damped.cholesky() {
                    Some(chol) => chol.solve(&active_gradient),
                    None => {
                        damping *= DAMPING_UP;
                        if damping > MAX_DAMPING {
                            converged = true;
                            break;
                        }
                        continue;
                    }
                };

                let mut trial = params.clone();
                for (row, &col) in active.iter().enumerate() {
                    let p = free[col];
                    trial[p] = bounds[p].clamp(params[p] + step[row]);
                }
                model.evaluate(&trial, coords, &mut ws.trial_out);
                let mut trial_res = vec![0.0; n];
                let trial_cost = weighted_cost(&ws.trial_out, observed, weights, &mut trial_res);

                if trial_cost < cost {
                    let step_norm = free
                        .iter()
                        .map(|&p| (trial[p] - params[p]).powi(2))
                        .sum::<f64>()
                        .sqrt();
                    let param_norm = free.iter().map(|&p| params[p].powi(2)).sum::<f64>().sqrt();
                    let rel_improvement = (cost - trial_cost) / cost;

                    params = trial;
                    std::mem::swap(&mut ws.model_out, &mut ws.trial_out);
                    ws.residuals = trial_res;
                    cost = trial_cost;
                    damping = (damping * DAMPING_DOWN).max(MIN_DAMPING);

                    if rel_improvement <= self.options.ftol
                        || step_norm <= self.options.xtol * (param_norm + self.options.xtol)
                        || cost == 0.0
                    {
                        converged = true;
                    }
                    break;
                }

                damping *= DAMPING_UP;
                if damping > MAX_DAMPING {
                    converged = true;
                    break;
                }
            }
            trace!(
                "{} iteration {}: cost={:.6e} damping={:.3e}",
                model.name(),
                iterations,
                cost,
                damping
            );
        }

        if !converged {
            return Err(BraggFitError::FitConvergence {
                model: model.name(),
                iterations,
                context: format!("final cost {:.6e}", cost),
            });
        }

        let dof = n - free.len();
        let reduced_chi_squared = cost / dof as f64;
        let std_errors = self.std_errors(
            model,
            coords,
            &params,
            &ws.model_out,
            weights,
            &free,
            &bounds,
            reduced_chi_squared,
        );

        let table = names
            .iter()
            .enumerate()
            .map(|(i, name)| FittedParameter {
                name: *name,
                value: params[i],
                std_error: std_errors[i],
                lower: bounds[i].lower,
                upper: bounds[i].upper,
                fixed: bounds[i].is_fixed(),
            })
            .collect();

        Ok(CurveFit {
            params,
            table,
            reduced_chi_squared,
            iterations,
            n_points: n,
        })
    }

    /// Standard errors from `(JᵀJ)⁻¹ · χ²_red`; NaN when the system is singular, 0 for fixed parameters.
    fn std_errors<M: CurveModel>(
        &self,
        model: &M,
        coords: &[M::Coordinate],
        params: &[f64],
        base: &[f64],
        weights: &[f64],
        free: &[usize],
        bounds: &[Bounds],
        reduced_chi_squared: f64,
    ) -> Vec<f64> {
        let mut out = vec![0.0; params.len()];
        if free.is_empty() {
            return out;
        }
        let mut scratch = vec![0.0; coords.len()];
        let jac = Self::jacobian(model, coords, params, base, weights, free, bounds, &mut scratch);
        let jtj = jac.transpose() * &jac;
        match jtj.try_inverse() {
            Some(cov) => {
                for (col, &p) in free.iter().enumerate() {
                    let var = cov[(col, col)] * reduced_chi_squared;
                    out[p] = if var >= 0.0 { var.sqrt() } else { f64::NAN };
                }
            }
            None => {
                for &p in free {
                    out[p] = f64::NAN;
                }
            }
        }
        out
    }
}
