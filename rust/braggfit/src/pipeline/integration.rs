//! Per-peak fitting and the two-pass batch driver.
//!
//! Every peak goes through the same five stages:
//!
//! 1. **Mapping**: voxel Q to (TOF, polar, azimuthal)
//! 2. **Background**: Poisson background level and signal mask
//! 3. **TOF profile**: convolved Ikeda-Carpenter fit of the TOF histogram
//! 4. **Angular profile**: bivariate Gaussian fit, possibly borrowing a strong peak's shape
//! 5. **Scaling**: joint model scaled to the counts and integrated
//!
//! A failure in any stage turns that peak into a `Failed` result; the rest of
//! the batch carries on.
//!
//! Weak and edge peaks want the shape of a nearby strong peak, but the strong
//! peaks are only known after fitting. [`IntegrationPipeline::run`] therefore
//! fits everything once, builds the [`StrongPeakLibrary`] from the strong free
//! fits, and re-fits only the peaks that asked for a borrowed shape and found
//! none.

use super::accumulator::FitAccumulator;
use super::results::FitResult;
use super::timings::FitTimings;
use crate::background::BackgroundSeparator;
use crate::config::{
    InstrumentConstants,
    IntegrationConfig,
};
use crate::errors::{
    BraggFitError,
    Result,
};
use crate::library::StrongPeakLibrary;
use crate::mapping::CoordinateMapper;
use crate::models::{
    PeakGeometry,
    VoxelGrid,
};
use crate::profiles::{
    AngularFitMode,
    AngularProfileFitter,
    ProfileComposer,
    TofProfileFitter,
};
use rayon::prelude::*;
use serde::{
    Deserialize,
    Serialize,
};
use std::time::Instant;
use tracing::{
    info,
    warn,
};

/// One peak to integrate: its geometry and the counts around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakInput {
    pub geometry: PeakGeometry,
    pub grid: VoxelGrid,
}

/// Counts of outcomes over a batch, for logging and the run summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub n_peaks: usize,
    pub n_integrated: usize,
    pub n_failed: usize,
    pub n_forced: usize,
    pub n_forced_unavailable: usize,
    pub n_forced_refit_failed: usize,
    pub n_degenerate_covariance: usize,
    pub timings: FitTimings,
}

impl BatchSummary {
    pub fn from_results(results: &[FitResult], timings: FitTimings) -> Self {
        let mut out = BatchSummary {
            n_peaks: results.len(),
            timings,
            ..Default::default()
        };
        for r in results {
            if r.is_integrated() {
                out.n_integrated += 1;
            } else {
                out.n_failed += 1;
            }
            match r.angular_mode() {
                Some(AngularFitMode::Forced { .. }) => out.n_forced += 1,
                Some(AngularFitMode::ForcedUnavailable) => out.n_forced_unavailable += 1,
                _ => {}
            }
            if r.forced_refit_error.is_some() {
                out.n_forced_refit_failed += 1;
            }
            if r.degenerate_covariance {
                out.n_degenerate_covariance += 1;
            }
        }
        out
    }
}

/// Everything a two-pass run produces.
#[derive(Debug)]
pub struct PipelineOutput {
    pub results: Vec<FitResult>,
    pub library: StrongPeakLibrary,
    pub summary: BatchSummary,
}

/// Stage objects borrowed from the pipeline; one set per worker thread.
struct StageFitters<'a> {
    mapper: CoordinateMapper<'a>,
    separator: BackgroundSeparator<'a>,
    tof: TofProfileFitter<'a>,
    angular: AngularProfileFitter<'a>,
    composer: ProfileComposer<'a>,
}

/// What a single peak's stages report besides their result.
#[derive(Debug, Default)]
struct PeakTrace {
    timings: FitTimings,
    wants_borrowed_shape: bool,
}

#[derive(Debug, Clone)]
pub struct IntegrationPipeline {
    config: IntegrationConfig,
    constants: InstrumentConstants,
}

impl IntegrationPipeline {
    pub fn new(config: IntegrationConfig, constants: InstrumentConstants) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, constants })
    }

    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    pub fn constants(&self) -> &InstrumentConstants {
        &self.constants
    }

    fn stage_fitters(&self) -> StageFitters<'_> {
        let solver = self.config.solver;
        StageFitters {
            mapper: CoordinateMapper::new(&self.constants),
            separator: BackgroundSeparator::new(&self.config.background),
            tof: TofProfileFitter::new(&self.config.tof, &self.constants, solver),
            angular: AngularProfileFitter::new(&self.config.angular, &self.constants, solver),
            composer: ProfileComposer::new(&self.config.scaling, solver),
        }
    }

    fn try_process_peak(
        &self,
        fitters: &StageFitters<'_>,
        input: &PeakInput,
        library: &StrongPeakLibrary,
        trace: &mut PeakTrace,
    ) -> Result<FitResult> {
        let geometry = &input.geometry;
        let grid = &input.grid;

        let st = Instant::now();
        let mapped = fitters.mapper.map_grid(grid, geometry)?;
        trace.timings.mapping += st.elapsed();

        let st = Instant::now();
        let mask = fitters.separator.separate(grid, &mapped);
        trace.timings.background += st.elapsed();

        let st = Instant::now();
        let tof = fitters.tof.fit(grid, &mapped, &mask, geometry);
        trace.timings.tof += st.elapsed();
        let tof = tof?;

        let st = Instant::now();
        let angular = fitters.angular.histogram(grid, &mapped, &mask).and_then(|hist| {
            trace.wants_borrowed_shape =
                library.is_empty() && fitters.angular.wants_forced_fit(&hist, geometry);
            fitters.angular.fit_histogram(
                &hist,
                geometry,
                (mapped.nominal_polar, mapped.nominal_azimuthal),
                library,
            )
        });
        trace.timings.angular += st.elapsed();
        let angular = angular?;

        let st = Instant::now();
        let joint = fitters
            .composer
            .compose(grid, &mapped, &mask, geometry, &tof, &angular);
        trace.timings.scaling += st.elapsed();
        let joint = joint?;

        Ok(FitResult::integrated(
            geometry.peak_id,
            geometry.bank.clone(),
            mask,
            tof,
            angular,
            joint,
        ))
    }

    fn process_with(
        &self,
        fitters: &StageFitters<'_>,
        input: &PeakInput,
        library: &StrongPeakLibrary,
    ) -> (FitResult, FitTimings) {
        let mut trace = PeakTrace::default();
        let mut out = match self.try_process_peak(fitters, input, library, &mut trace) {
            Ok(res) => res,
            Err(e) => {
                let e = e.append_to_context(&format!("peak {}", input.geometry.peak_id));
                warn!("Peak {} failed: {}", input.geometry.peak_id, e);
                FitResult::failed(
                    input.geometry.peak_id,
                    input.geometry.bank.clone(),
                    e.to_string(),
                )
            }
        };
        out.timings = trace.timings;
        out.wants_borrowed_shape = trace.wants_borrowed_shape;
        (out, trace.timings)
    }

    /// Fits and integrates a single peak. Never fails; failures are recorded in the result.
    pub fn process_peak(&self, input: &PeakInput, library: &StrongPeakLibrary) -> FitResult {
        let fitters = self.stage_fitters();
        self.process_with(&fitters, input, library).0
    }

    fn fit_selected(&self, inputs: &[&PeakInput], library: &StrongPeakLibrary) -> FitAccumulator {
        #[cfg(not(feature = "serial_fitting"))]
        let results: FitAccumulator = {
            inputs
                .par_iter()
                .map_init(
                    || self.stage_fitters(),
                    |fitters, input| self.process_with(fitters, input, library),
                )
                .collect()
        };

        #[cfg(feature = "serial_fitting")]
        let results: FitAccumulator = {
            let fitters = self.stage_fitters();
            inputs
                .iter()
                .map(|input| self.process_with(&fitters, input, library))
                .collect()
        };

        results
    }

    /// Fits every peak against a fixed library. Results come back in input order.
    #[cfg_attr(
        feature = "instrumentation",
        tracing::instrument(skip(self, inputs, library), level = "trace")
    )]
    pub fn process_batch(
        &self,
        inputs: &[PeakInput],
        library: &StrongPeakLibrary,
    ) -> (Vec<FitResult>, FitTimings) {
        let num_input_items = inputs.len();
        if num_input_items == 0 {
            return (Vec::new(), FitTimings::default());
        }
        let start = Instant::now();
        let refs: Vec<&PeakInput> = inputs.iter().collect();
        let results = self.fit_selected(&refs, library);

        let elapsed = start.elapsed();
        let avg_speed =
            std::time::Duration::from_nanos(elapsed.as_nanos() as u64 / num_input_items as u64);
        let throughput = num_input_items as f64 / elapsed.as_secs_f64();
        info!(
            "Fitting {} peaks took: {:?} throughput: {:#.1}/s, avg: {:?}",
            num_input_items, elapsed, throughput, avg_speed
        );
        info!("{:?}", results.timings);

        (results.res, results.timings)
    }

    /// `seed` followed by the shapes of every strong, freely fitted peak in `results`.
    pub fn build_library(&self, seed: &StrongPeakLibrary, results: &[FitResult]) -> StrongPeakLibrary {
        let cutoff = self.config.angular.force_cutoff;
        let library = seed.extended(results.iter().filter_map(|r| r.strong_peak_entry(cutoff)));
        info!(
            "Strong peak library: {} entries ({} carried over)",
            library.len(),
            seed.len()
        );
        library
    }

    /// Re-fits the peaks whose angular fit wanted a borrowed shape but had no library,
    /// including those where a later stage failed.
    ///
    /// A re-fit only replaces the first-pass result when it integrates; otherwise the
    /// first-pass result is kept and the re-fit failure recorded on it.
    ///
    /// `results` must be aligned with `inputs`. Returns the time spent re-fitting.
    pub fn refit_forced(
        &self,
        inputs: &[PeakInput],
        results: &mut [FitResult],
        library: &StrongPeakLibrary,
    ) -> Result<FitTimings> {
        if inputs.len() != results.len() {
            return Err(BraggFitError::InvalidGrid {
                context: format!(
                    "{} inputs but {} results to re-fit",
                    inputs.len(),
                    results.len()
                ),
            });
        }
        if library.is_empty() {
            return Ok(FitTimings::default());
        }
        let indices: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.wants_borrowed_shape)
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            return Ok(FitTimings::default());
        }
        info!("Re-fitting {} peaks with borrowed angular shapes", indices.len());
        let selected: Vec<&PeakInput> = indices.iter().map(|i| &inputs[*i]).collect();
        let refit = self.fit_selected(&selected, library);
        for (i, res) in indices.into_iter().zip(refit.res) {
            if res.is_integrated() {
                results[i] = res;
            } else {
                let reason = res.failure_reason().unwrap_or_default().to_string();
                warn!(
                    "Peak {}: re-fit with a borrowed shape failed, keeping the first pass: {}",
                    results[i].peak_id, reason
                );
                results[i].forced_refit_error = Some(reason);
                results[i].timings += res.timings;
            }
        }
        Ok(refit.timings)
    }

    /// Both passes: fit everything against `seed_library`, grow the library, re-fit.
    pub fn run(&self, inputs: &[PeakInput], seed_library: &StrongPeakLibrary) -> Result<PipelineOutput> {
        let (mut results, mut timings) = self.process_batch(inputs, seed_library);
        let library = self.build_library(seed_library, &results);
        timings += self.refit_forced(inputs, &mut results, &library)?;
        let summary = BatchSummary::from_results(&results, timings);
        info!(
            "Integrated {}/{} peaks ({} failed, {} with borrowed shapes, {} without a library entry)",
            summary.n_integrated,
            summary.n_peaks,
            summary.n_failed,
            summary.n_forced,
            summary.n_forced_unavailable
        );
        Ok(PipelineOutput {
            results,
            library,
            summary,
        })
    }
}
