//! Weight constraints shared by every optimizer model.

use serde::{Deserialize, Serialize};

use bw_types::errors::OptimizationError;

/// Linear constraints and solver settings for a long-only (or bounded)
/// allocation problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConstraints {
    /// Minimum weight per asset.
    pub lower_bound: f64,
    /// Maximum weight per asset.
    pub upper_bound: f64,
    /// Minimum expected portfolio return `wᵀμ`. `None` = unconstrained.
    pub target_return: Option<f64>,
    /// Per-period risk-free rate used for the Sharpe ratio.
    pub risk_free_rate: f64,
    /// Convergence tolerance on the largest weight change per iteration.
    pub tolerance: f64,
    /// Iteration cap after which the result is marked non-converged.
    pub max_iterations: usize,
}

impl Default for WeightConstraints {
    fn default() -> Self {
        Self {
            lower_bound: 0.0,
            upper_bound: 1.0,
            target_return: None,
            risk_free_rate: 0.0,
            tolerance: 1e-6,
            max_iterations: 1000,
        }
    }
}

impl WeightConstraints {
    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower_bound = lower;
        self.upper_bound = upper;
        self
    }

    pub fn with_target_return(mut self, target: f64) -> Self {
        self.target_return = Some(target);
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    /// Reject settings that can never describe a valid problem. Whether the
    /// bounds admit a solution for a given asset count is checked at solve
    /// time.
    pub fn validate(&self) -> Result<(), OptimizationError> {
        let finite = [self.lower_bound, self.upper_bound, self.risk_free_rate, self.tolerance]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.target_return.is_some_and(|t| !t.is_finite()) {
            return Err(OptimizationError::InvalidInput {
                message: "constraint values must be finite".into(),
            });
        }
        if self.lower_bound > self.upper_bound {
            return Err(OptimizationError::InvalidInput {
                message: format!(
                    "lower bound {} exceeds upper bound {}",
                    self.lower_bound, self.upper_bound
                ),
            });
        }
        if self.tolerance <= 0.0 {
            return Err(OptimizationError::InvalidInput {
                message: "tolerance must be positive".into(),
            });
        }
        if self.max_iterations == 0 {
            return Err(OptimizationError::InvalidInput {
                message: "max_iterations must be at least 1".into(),
            });
        }
        Ok(())
    }
}
