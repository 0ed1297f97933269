use std::{fmt::Display, io};

use dfu_host::{ConfigurationError, DfuError};

pub enum CliError {
    IO(io::Error),
    Dfu(DfuError),
    Timeout,
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<DfuError> for CliError {
    fn from(value: DfuError) -> Self {
        CliError::Dfu(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Dfu(DfuError::Configuration(
                ConfigurationError::NoDevice,
            )) => write!(f, "No DFU device"),
            CliError::Dfu(DfuError::Configuration(
                ConfigurationError::ManyDevices(n),
            )) => {
                write!(f, "More than one DFU devices ({n}), use -v/-p/-s")
            }
            CliError::Dfu(err) => write!(f, "DFU error: {err}"),
            CliError::Timeout => {
                write!(f, "Device did not come back in DFU mode")
            }
        }
    }
}
