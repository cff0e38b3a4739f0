use std::path::PathBuf;

use thiserror::Error;

use geometry::GeometryError;

/// Errors discovered while setting up a reconstruction run.
///
/// Per-event conditions (empty events, fits that do not converge) are never
/// reported through this type.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid geometry: {0}")]
    Geometry(#[from] GeometryError),

    #[error("No {ion} curve registered for gas {gas}")]
    MissingCurve { gas: String, ion: String },

    #[error("Unknown gas mixture `{0}`")]
    UnknownGas(String),

    #[error("Unsupported particle `{0}`")]
    UnsupportedParticle(String),

    #[error("Nominal pressure {0} mbar does not correspond to any reference dE/dx curve")]
    NominalPressure(f64),

    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: f64 },

    #[error("Malformed curve in `{path}` at line {line}: {reason}")]
    CurveFile { path: PathBuf, line: usize, reason: String },

    #[error("Malformed curve: {0}")]
    Curve(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
