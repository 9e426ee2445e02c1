use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the Bulwark risk engine
#[derive(Error, Debug)]
pub enum BwError {
    #[error("Risk error: {0}")]
    Risk(#[from] RiskError),

    #[error("Optimization error: {0}")]
    Optimization(#[from] OptimizationError),

    #[error("Portfolio error: {0}")]
    Portfolio(#[from] PortfolioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised while estimating statistics, risk metrics, stress results
/// or position sizes.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskError {
    #[error("Insufficient data for {symbol}: {observations} observations, {required} required")]
    InsufficientData {
        symbol: String,
        observations: usize,
        required: usize,
    },

    #[error("Singular covariance matrix: {message}")]
    SingularCovariance { message: String },

    #[error("Invalid edge: payoff ratio {payoff_ratio} must be positive")]
    InvalidEdge { payoff_ratio: f64 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Invalid stress scenario {scenario}: {message}")]
    InvalidScenario { scenario: String, message: String },

    #[error("Evaluation timed out after {timeout_ms} ms")]
    EvaluationTimeout { timeout_ms: u64 },

    #[error("Evaluation cancelled")]
    Cancelled,
}

/// Portfolio optimizer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("Infeasible constraints: {reason}")]
    InfeasibleConstraints { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Singular matrix while computing {context}")]
    SingularMatrix { context: String },

    #[error("Invalid optimizer input: {message}")]
    InvalidInput { message: String },

    #[error("Optimization cancelled after {iterations} iterations")]
    Cancelled { iterations: usize },
}

/// Portfolio snapshot errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortfolioError {
    #[error("Duplicate position for symbol: {symbol}")]
    DuplicatePosition { symbol: String },

    #[error("Portfolio value {total} is not positive; weights are undefined")]
    NonPositiveValue { total: rust_decimal::Decimal },

    #[error("Portfolio state inconsistency: {message}")]
    StateInconsistency { message: String },
}

/// Result type alias for Bulwark operations
pub type BwResult<T> = Result<T, BwError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::errors::BwError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::BwError::Config(format!($($arg)*))
    };
}
