//! Optimizer entry point and result types.

use chrono::{DateTime, Utc};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bw_types::errors::OptimizationError;
use bw_types::market::Symbol;
use bw_types::matrix::CovarianceMatrix;

use crate::black_litterman::{posterior_returns, BlackLittermanInputs};
use crate::constraints::WeightConstraints;
use crate::markowitz::solve_min_variance;

/// Allocation model. The set is closed: every variant is handled below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerModel {
    /// Markowitz minimum variance on the supplied expected returns.
    MeanVariance,
    /// Markowitz on Black-Litterman posterior returns. The expected returns
    /// passed to [`PortfolioOptimizer::optimize`] are replaced by the
    /// posterior.
    BlackLitterman(BlackLittermanInputs),
}

impl OptimizerModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            OptimizerModel::MeanVariance => ModelKind::MeanVariance,
            OptimizerModel::BlackLitterman(_) => ModelKind::BlackLitterman,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    MeanVariance,
    BlackLitterman,
}

/// Target weight of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetWeight {
    pub symbol: Symbol,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub weights: Vec<AssetWeight>,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    /// Always true for a returned result; infeasible problems surface as
    /// [`OptimizationError::InfeasibleConstraints`] instead.
    pub feasible: bool,
    /// False when the iteration cap was hit before the tolerance was met.
    pub converged: bool,
    pub iterations: usize,
    pub model: ModelKind,
    /// Expected returns the solver actually used (posterior for
    /// Black-Litterman).
    pub expected_returns: Vec<f64>,
    pub computed_at: DateTime<Utc>,
}

impl OptimizationResult {
    pub fn weight(&self, symbol: &Symbol) -> Option<f64> {
        self.weights
            .iter()
            .find(|w| &w.symbol == symbol)
            .map(|w| w.weight)
    }

    pub fn weight_sum(&self) -> f64 {
        self.weights.iter().map(|w| w.weight).sum()
    }
}

/// Solves allocation problems under a fixed set of weight constraints.
#[derive(Debug, Clone)]
pub struct PortfolioOptimizer {
    constraints: WeightConstraints,
}

impl PortfolioOptimizer {
    pub fn new(constraints: WeightConstraints) -> Result<Self, OptimizationError> {
        constraints.validate()?;
        Ok(Self { constraints })
    }

    pub fn constraints(&self) -> &WeightConstraints {
        &self.constraints
    }

    pub fn optimize(
        &self,
        model: &OptimizerModel,
        expected_returns: &[f64],
        covariance: &CovarianceMatrix,
    ) -> Result<OptimizationResult, OptimizationError> {
        self.run(model, expected_returns, covariance, None)
    }

    /// Same as [`PortfolioOptimizer::optimize`], polling `cancel` while
    /// iterating.
    pub fn optimize_with_cancel(
        &self,
        model: &OptimizerModel,
        expected_returns: &[f64],
        covariance: &CovarianceMatrix,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult, OptimizationError> {
        self.run(model, expected_returns, covariance, Some(cancel))
    }

    fn run(
        &self,
        model: &OptimizerModel,
        expected_returns: &[f64],
        covariance: &CovarianceMatrix,
        cancel: Option<&CancellationToken>,
    ) -> Result<OptimizationResult, OptimizationError> {
        let n = covariance.dim();
        if expected_returns.len() != n {
            return Err(OptimizationError::DimensionMismatch {
                expected: n,
                actual: expected_returns.len(),
            });
        }

        let mu = match model {
            OptimizerModel::MeanVariance => DVector::from_column_slice(expected_returns),
            OptimizerModel::BlackLitterman(inputs) => posterior_returns(covariance, inputs)?.posterior,
        };

        let output = solve_min_variance(&covariance.matrix, &mu, &self.constraints, cancel)
            .inspect_err(|e| warn!(model = ?model.kind(), error = %e, "optimization failed"))?;

        let expected_return = mu.dot(&output.weights);
        let volatility = covariance.quadratic_form(&output.weights).max(0.0).sqrt();
        let sharpe_ratio = if volatility > 0.0 {
            (expected_return - self.constraints.risk_free_rate) / volatility
        } else {
            0.0
        };

        info!(
            model = ?model.kind(),
            assets = n,
            converged = output.converged,
            iterations = output.iterations,
            expected_return,
            volatility,
            "portfolio optimized"
        );

        Ok(OptimizationResult {
            weights: covariance
                .symbols
                .iter()
                .zip(output.weights.iter())
                .map(|(symbol, &weight)| AssetWeight {
                    symbol: symbol.clone(),
                    weight,
                })
                .collect(),
            expected_return,
            volatility,
            sharpe_ratio,
            feasible: true,
            converged: output.converged,
            iterations: output.iterations,
            model: model.kind(),
            expected_returns: mu.iter().copied().collect(),
            computed_at: Utc::now(),
        })
    }
}
