use super::config::OutputConfig;
use super::errors::CliError;
use super::output::{
    write_json,
    CsvPeakTableWriter,
    PeakTableWriter,
};
use braggfit::{
    BatchSummary,
    FitResult,
    FitTimings,
    IntegrationConfig,
    IntegrationPipeline,
    PeakInput,
    StrongPeakLibrary,
};
use indicatif::{
    ProgressIterator,
    ProgressStyle,
};
use serde::Serialize;
use std::time::Instant;
use tracing::{
    debug,
    info,
};

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    summary: &'a BatchSummary,
    strong_peak_entries: usize,
    seed_library_entries: usize,
    elapsed_ms: u128,
    integration: &'a IntegrationConfig,
}

/// First pass over `inputs`, chunk by chunk, against the seed library.
fn first_pass(
    pipeline: &IntegrationPipeline,
    inputs: &[PeakInput],
    seed_library: &StrongPeakLibrary,
    chunk_size: usize,
) -> (Vec<FitResult>, FitTimings) {
    let mut results = Vec::with_capacity(inputs.len());
    let mut timings = FitTimings::default();
    let mut chunk_num = 0;
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})",
    )
    .unwrap();
    inputs
        .chunks(chunk_size.max(1))
        .progress_with_style(style)
        .for_each(|chunk| {
            // Parallelism happens here within process_batch
            let (out, chunk_timings) = pipeline.process_batch(chunk, seed_library);
            let nfailed = out.iter().filter(|r| !r.is_integrated()).count();
            debug!(
                "Chunk {}: {} peaks, {} failed",
                chunk_num,
                out.len(),
                nfailed
            );
            results.extend(out);
            timings += chunk_timings;
            chunk_num += 1;
        });
    (results, timings)
}

pub fn main_loop(
    pipeline: &IntegrationPipeline,
    inputs: Vec<PeakInput>,
    seed_library: StrongPeakLibrary,
    chunk_size: usize,
    output: &OutputConfig,
) -> std::result::Result<(), CliError> {
    let start = Instant::now();

    let (mut results, mut timings) = first_pass(pipeline, &inputs, &seed_library, chunk_size);
    let library = pipeline.build_library(&seed_library, &results);
    timings += pipeline.refit_forced(&inputs, &mut results, &library)?;
    let summary = BatchSummary::from_results(&results, timings);

    let csv_path = output.directory.join("peaks.csv");
    let mut writer = CsvPeakTableWriter::create(&csv_path)?;
    for r in results.iter() {
        writer.write_result(r)?;
    }
    writer.finish()?;

    let library_path = output.directory.join("strong_peaks.json");
    library.save(&library_path)?;

    let elapsed = start.elapsed();
    write_json(
        &RunSummary {
            summary: &summary,
            strong_peak_entries: library.len(),
            seed_library_entries: seed_library.len(),
            elapsed_ms: elapsed.as_millis(),
            integration: pipeline.config(),
        },
        &output.directory.join("summary.json"),
    )?;

    println!(
        "Integrated {} of {} peaks ({} failed), {} strong peak entries",
        summary.n_integrated,
        summary.n_peaks,
        summary.n_failed,
        library.len()
    );
    println!("Finished in {:?}", elapsed);
    info!("Stage timings: {:?}", summary.timings);
    Ok(())
}
