//! Error types for kmband

use thiserror::Error;

/// kmband error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid user input (ranges, probabilities, mode flags)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Numerical failure outside the solver
    #[error("Computation error: {0}")]
    Computation(String),

    /// Solver returned an unexpected status or exhausted its fallbacks
    #[error("Solver error: {0}")]
    Solver(String),

    /// No sign change where the profile shape guarantees one
    #[error("Root finding failed: {0}")]
    RootFinding(String),

    /// Broken internal invariant
    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes() {
        let e = Error::Validation("p must be in [0, 1]".into());
        assert_eq!(e.to_string(), "Validation error: p must be in [0, 1]");

        let e = Error::RootFinding("no upper sign change".into());
        assert!(e.to_string().starts_with("Root finding failed"));
    }

    #[test]
    fn test_io_conversion() {
        fn open() -> Result<String> {
            Ok(std::fs::read_to_string("/definitely/not/here.json")?)
        }
        assert!(matches!(open(), Err(Error::Io(_))));
    }
}
