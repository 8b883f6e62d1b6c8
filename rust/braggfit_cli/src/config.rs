use braggfit::{
    InstrumentConfig,
    IntegrationConfig,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::path::PathBuf;

use crate::cli::Cli;

fn default_chunk_size() -> usize {
    256
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Every constant is required; there are no defaults for the instrument.
    #[serde(default)]
    pub instrument: InstrumentConfig,
    #[serde(default)]
    pub integration: IntegrationConfig,
    pub input: Option<InputConfig>,
    pub output: Option<OutputConfig>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InputConfig {
    pub peaks: PathBuf,
    #[serde(default)]
    pub library: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Config {
    /// Command line values take precedence over the config file.
    pub fn apply_cli_overrides(&mut self, args: &Cli) {
        if let Some(peaks) = &args.peaks {
            match self.input.as_mut() {
                Some(input) => input.peaks = peaks.clone(),
                None => {
                    self.input = Some(InputConfig {
                        peaks: peaks.clone(),
                        library: None,
                    })
                }
            }
        }
        if let (Some(library), Some(input)) = (&args.library, self.input.as_mut()) {
            input.library = Some(library.clone());
        }
        if let Some(output_dir) = &args.output_dir {
            self.output = Some(OutputConfig {
                directory: output_dir.clone(),
            });
        }
    }
}
