//! Collects per-peak results and timings from (parallel) iterators.
//!
//! Each thread folds into its own accumulator and the partial accumulators
//! are merged pairwise, so there is no shared state while fitting.

use super::results::FitResult;
use super::timings::FitTimings;
use rayon::iter::{
    FromParallelIterator,
    IntoParallelIterator,
    ParallelIterator,
};

#[derive(Debug, Default)]
pub(super) struct FitAccumulator {
    pub(super) res: Vec<FitResult>,
    pub(super) timings: FitTimings,
}

impl FitAccumulator {
    pub(super) fn reduce(mut self, other: Self) -> Self {
        self.res.extend(other.res);
        self.timings += other.timings;
        self
    }

    pub(super) fn fold(mut self, item: (FitResult, FitTimings)) -> Self {
        self.res.push(item.0);
        self.timings += item.1;
        self
    }
}

impl FromIterator<(FitResult, FitTimings)> for FitAccumulator {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = (FitResult, FitTimings)>,
    {
        iter.into_iter()
            .fold(FitAccumulator::default(), FitAccumulator::fold)
    }
}

impl FromParallelIterator<(FitResult, FitTimings)> for FitAccumulator {
    fn from_par_iter<I>(par_iter: I) -> Self
    where
        I: IntoParallelIterator<Item = (FitResult, FitTimings)>,
    {
        par_iter
            .into_par_iter()
            .fold(FitAccumulator::default, FitAccumulator::fold)
            .reduce(FitAccumulator::default, FitAccumulator::reduce)
    }
}
