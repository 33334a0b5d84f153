//! Error types for gothook

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("ELF parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Protection error at {address:#x}: {message}")]
    Protection { address: usize, message: String },

    #[error("Memory fault at {address:#x} during {context}")]
    FaultSignaled { address: usize, context: String },

    #[error("Rule registry full ({0} rules)")]
    RegistryFull(usize),

    #[error("Invalid pathname pattern {pattern:?}: {message}")]
    Pattern { pattern: String, message: String },

    #[error("Memory map error: {0}")]
    Maps(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a parse failure scoped to one image
    pub fn parse(path: &str, message: impl Into<String>) -> Self {
        Error::Parse {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Non-zero status code reported across the C ABI
    pub fn status_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 1,
            Error::Parse { .. } => 2,
            Error::Protection { .. } => 3,
            Error::FaultSignaled { .. } => 4,
            Error::RegistryFull(_) => 5,
            Error::Pattern { .. } => 6,
            Error::Maps(_) => 7,
            Error::Io(_) => 8,
            Error::Config(_) => 9,
            Error::Internal(_) => 10,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Error::FaultSignaled { .. })
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
