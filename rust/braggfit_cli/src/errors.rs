use braggfit::{
    BraggFitError,
    DataReadingError,
};

#[derive(Debug)]
pub enum CliError {
    Config {
        source: String,
    },
    ParseError {
        msg: String,
    },
    Io {
        source: String,
        path: Option<String>,
    },
    DataReading {
        source: String,
    },
    Integration {
        source: String,
    },
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config { source } => write!(f, "Error interpreting the config: {}", source),
            CliError::ParseError { msg } => write!(f, "Error parsing config: {}", msg),
            CliError::Io { source, path } => {
                if let Some(path) = path {
                    write!(f, "Error accessing file {}: {}", path, source)
                } else {
                    write!(f, "Error accessing file: {}", source)
                }
            }
            CliError::DataReading { source } => write!(f, "Error reading data: {}", source),
            CliError::Integration { source } => write!(f, "Error integrating peaks: {}", source),
        }
    }
}

impl From<DataReadingError> for CliError {
    fn from(e: DataReadingError) -> Self {
        CliError::DataReading {
            source: e.to_string(),
        }
    }
}

impl From<BraggFitError> for CliError {
    fn from(e: BraggFitError) -> Self {
        match e {
            BraggFitError::Configuration(c) => CliError::Config {
                source: c.to_string(),
            },
            other => CliError::Integration {
                source: other.to_string(),
            },
        }
    }
}

impl From<csv::Error> for CliError {
    fn from(e: csv::Error) -> Self {
        CliError::Io {
            source: e.to_string(),
            path: None,
        }
    }
}
