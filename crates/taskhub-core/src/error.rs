use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The config file or environment could not be read, or holds values
    /// the scheduler cannot run with.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Short error code string for logs and machine-readable output.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
