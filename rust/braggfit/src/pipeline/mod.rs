mod accumulator;
pub mod integration;
pub mod results;
pub mod timings;

pub use integration::{
    BatchSummary,
    IntegrationPipeline,
    PeakInput,
    PipelineOutput,
};
pub use results::{
    FitResult,
    FitStatus,
};
pub use timings::FitTimings;
