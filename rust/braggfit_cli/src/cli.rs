use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Path to the peaks file, .json or .ndjson (will over-write the config file)
    #[arg(short, long)]
    pub peaks: Option<PathBuf>,

    /// Path to the output directory
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Strong peak library from a previous run, used to seed the angular fits
    #[arg(short, long)]
    pub library: Option<PathBuf>,

    /// Number of worker threads (defaults to one per core)
    #[arg(short, long)]
    pub threads: Option<usize>,
}
