mod cli;
mod config;
mod errors;
mod output;
mod processing;

use braggfit::{
    IntegrationPipeline,
    JsonPeakSource,
    PeakSource,
    StrongPeakLibrary,
};
use clap::Parser;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use config::Config;

#[cfg(target_os = "windows")]
use mimalloc::MiMalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> std::result::Result<(), errors::CliError> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        ) // This uses RUST_LOG environment variable
        .init();

    let args = Cli::parse();

    let conf = match std::fs::File::open(&args.config) {
        Ok(x) => x,
        Err(e) => {
            return Err(errors::CliError::Io {
                source: e.to_string(),
                path: Some(args.config.to_string_lossy().to_string()),
            });
        }
    };
    let mut config: Config = match serde_json::from_reader(conf) {
        Ok(x) => x,
        Err(e) => {
            return Err(errors::CliError::ParseError { msg: e.to_string() });
        }
    };
    config.apply_cli_overrides(&args);

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| errors::CliError::Config {
                source: e.to_string(),
            })?;
    }

    // A missing instrument constant is fatal for the whole run
    let constants = config.instrument.validate().map_err(|e| errors::CliError::Config {
        source: e.to_string(),
    })?;

    let input = match config.input {
        Some(ref x) => x.clone(),
        None => {
            return Err(errors::CliError::Config {
                source: "No input provided, please provide one in either the config file or with the --peaks flag".to_string(),
            });
        }
    };
    let output_config = match config.output {
        Some(ref x) => x.clone(),
        None => {
            return Err(errors::CliError::Config {
                source: "No output directory provided, please provide one in either the config file or with the --output-dir flag".to_string(),
            });
        }
    };
    info!("Parsed configuration: {:#?}", config);

    if let Err(e) = std::fs::create_dir_all(&output_config.directory) {
        return Err(errors::CliError::Io {
            source: e.to_string(),
            path: Some(output_config.directory.to_string_lossy().to_string()),
        });
    }

    let seed_library = match input.library {
        Some(ref path) => StrongPeakLibrary::load(path)?,
        None => StrongPeakLibrary::empty(),
    };

    let source = JsonPeakSource::new(input.peaks.clone());
    let st = std::time::Instant::now();
    let inputs = source.read_peaks()?;
    info!(
        "Loading {} took: {:?}",
        source.describe(),
        st.elapsed()
    );

    let pipeline = IntegrationPipeline::new(config.integration.clone(), constants)?;
    processing::main_loop(
        &pipeline,
        inputs,
        seed_library,
        config.chunk_size,
        &output_config,
    )
}
