//! Value-at-Risk and Conditional VaR.
//!
//! Losses are reported as positive fractions of portfolio value. Historical
//! and Monte Carlo estimates read the tail of an empirical distribution of
//! one-period portfolio returns; the parametric estimate assumes normality.
//! Every method scales to the requested horizon by `sqrt(horizon)`.

use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use bw_types::config_error;
use bw_types::errors::{BwResult, PortfolioError, RiskError};
use bw_types::portfolio::Portfolio;

use crate::normal::{inverse_norm_cdf, norm_pdf};
use crate::stats::MarketStatistics;

/// Estimation method for VaR and CVaR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarMethod {
    Historical,
    Parametric,
    MonteCarlo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub simulations: usize,
    /// Draws per parallel batch. Cancellation is checked between batches.
    pub batch_size: usize,
    /// Fixed seed for reproducible runs. `None` draws a fresh seed per run.
    pub seed: Option<u64>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            simulations: 10_000,
            batch_size: 1_000,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskMetricsConfig {
    pub method: VarMethod,
    pub confidence_levels: Vec<f64>,
    pub horizon_days: u32,
    pub monte_carlo: MonteCarloConfig,
}

impl Default for RiskMetricsConfig {
    fn default() -> Self {
        Self {
            method: VarMethod::Historical,
            confidence_levels: vec![0.95, 0.99],
            horizon_days: 1,
            monte_carlo: MonteCarloConfig::default(),
        }
    }
}

impl RiskMetricsConfig {
    pub fn validate(&self) -> BwResult<()> {
        if self.confidence_levels.is_empty() {
            return Err(config_error!("risk_metrics.confidence_levels must not be empty"));
        }
        for &c in &self.confidence_levels {
            check_confidence(c).map_err(|e| config_error!("risk_metrics.confidence_levels: {e}"))?;
        }
        if self.horizon_days == 0 {
            return Err(config_error!("risk_metrics.horizon_days must be at least 1"));
        }
        if self.monte_carlo.simulations < 2 {
            return Err(config_error!("risk_metrics.monte_carlo.simulations must be at least 2"));
        }
        if self.monte_carlo.batch_size == 0 {
            return Err(config_error!("risk_metrics.monte_carlo.batch_size must be positive"));
        }
        Ok(())
    }

    /// Whether `confidence` is one of the configured levels.
    pub fn computes(&self, confidence: f64) -> bool {
        self.confidence_levels
            .iter()
            .any(|&c| same_confidence(c, confidence))
    }
}

/// Confidence levels are compared with a small tolerance so `0.99` from a
/// config file matches `0.99` computed elsewhere.
pub fn same_confidence(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// One-period tail loss at a single confidence level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TailEstimate {
    pub var: f64,
    pub cvar: f64,
}

impl TailEstimate {
    fn scaled(self, horizon_days: u32) -> Self {
        let k = f64::from(horizon_days).sqrt();
        Self {
            var: self.var * k,
            cvar: self.cvar * k,
        }
    }
}

/// A VaR/CVaR pair for one confidence level and horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetricResult {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub method: VarMethod,
    pub confidence: f64,
    pub horizon_days: u32,
    pub var: f64,
    pub cvar: f64,
    /// Historical observations or Monte Carlo draws behind the estimate.
    pub sample_size: usize,
    /// True when the covariance feeding the estimate had to be regularised.
    pub regularized: bool,
}

fn check_confidence(confidence: f64) -> Result<(), RiskError> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(RiskError::InvalidInput {
            message: format!("confidence {confidence} must be in (0, 1)"),
        });
    }
    Ok(())
}

/// Tail of an empirical return distribution. The quantile is linearly
/// interpolated at position `(n-1)(1-c)` of the sorted sample; CVaR averages
/// every return at or below it.
pub fn historical_tail(returns: &[f64], confidence: f64) -> Result<TailEstimate, RiskError> {
    check_confidence(confidence)?;
    if returns.is_empty() {
        return Err(RiskError::InvalidInput {
            message: "empty return sample".into(),
        });
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(sorted_tail(&sorted, confidence))
}

fn sorted_tail(sorted: &[f64], confidence: f64) -> TailEstimate {
    let h = (sorted.len() - 1) as f64 * (1.0 - confidence);
    let lo = h.floor() as usize;
    let hi = (h.ceil() as usize).min(sorted.len() - 1);
    let quantile = sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]);

    let tail: Vec<f64> = sorted.iter().copied().take_while(|r| *r <= quantile).collect();
    let cvar = if tail.is_empty() {
        -quantile
    } else {
        -(tail.iter().sum::<f64>() / tail.len() as f64)
    };
    TailEstimate { var: -quantile, cvar }
}

/// Normal-distribution tail: `VaR = zσ - μ`, `CVaR = σφ(z)/(1-c) - μ`.
pub fn parametric_tail(mean: f64, sigma: f64, confidence: f64) -> Result<TailEstimate, RiskError> {
    check_confidence(confidence)?;
    if !(sigma >= 0.0 && sigma.is_finite()) || !mean.is_finite() {
        return Err(RiskError::InvalidInput {
            message: format!("invalid distribution mean {mean}, sigma {sigma}"),
        });
    }
    let z = inverse_norm_cdf(confidence);
    Ok(TailEstimate {
        var: z * sigma - mean,
        cvar: sigma * norm_pdf(z) / (1.0 - confidence) - mean,
    })
}

/// Weights of `portfolio` in the asset order of `stats`. Assets the
/// portfolio does not hold get zero weight.
pub fn portfolio_weights(portfolio: &Portfolio, stats: &MarketStatistics) -> Result<DVector<f64>, PortfolioError> {
    let weights = portfolio.weights()?;
    Ok(DVector::from_iterator(
        stats.symbols.len(),
        stats.symbols.iter().map(|s| weights.get(s).copied().unwrap_or(0.0)),
    ))
}

/// Historical portfolio returns `Σ wᵢ·rᵢ[t]` over the aligned window.
pub fn portfolio_returns(stats: &MarketStatistics, weights: &DVector<f64>) -> Vec<f64> {
    (0..stats.observations)
        .map(|t| {
            stats
                .returns
                .iter()
                .zip(weights.iter())
                .map(|(series, w)| w * series.returns[t])
                .sum()
        })
        .collect()
}

fn cholesky_factor(cov: &DMatrix<f64>) -> Result<DMatrix<f64>, RiskError> {
    if let Some(chol) = cov.clone().cholesky() {
        return Ok(chol.l());
    }
    let n = cov.nrows();
    let scale = (cov.trace() / n as f64).abs().max(1e-12);
    for k in 0..6 {
        let jitter = scale * 1e-10 * 10f64.powi(k);
        let mut bumped = cov.clone();
        for i in 0..n {
            bumped[(i, i)] += jitter;
        }
        if let Some(chol) = bumped.cholesky() {
            warn!(jitter, "covariance not positive definite; factorised with diagonal jitter");
            return Ok(chol.l());
        }
    }
    Err(RiskError::SingularCovariance {
        message: "Cholesky factorisation failed".into(),
    })
}

/// Draw one-period portfolio returns from `N(μ, Σ)` using the estimated
/// means and covariance. Batches run in parallel, each with its own
/// generator derived from the seed, so a seeded run is reproducible
/// regardless of thread scheduling.
pub fn simulate_portfolio_returns(
    stats: &MarketStatistics,
    weights: &DVector<f64>,
    config: &MonteCarloConfig,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<f64>, RiskError> {
    if weights.len() != stats.symbols.len() {
        return Err(RiskError::InvalidInput {
            message: format!("{} weights for {} assets", weights.len(), stats.symbols.len()),
        });
    }
    if config.simulations == 0 || config.batch_size == 0 {
        return Err(RiskError::InvalidInput {
            message: "simulation count and batch size must be positive".into(),
        });
    }

    let l = cholesky_factor(&stats.covariance.matrix)?;
    // w·(μ + Lz) = w·μ + (Lᵀw)·z
    let drift = weights.dot(&stats.means);
    let loadings = l.transpose() * weights;
    let n = loadings.len();
    let seed = config.seed.unwrap_or_else(|| rand::rng().random());
    let batches = config.simulations.div_ceil(config.batch_size);

    let draws = (0..batches)
        .into_par_iter()
        .map(|batch| {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(RiskError::Cancelled);
            }
            let start = batch * config.batch_size;
            let len = config.batch_size.min(config.simulations - start);
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(batch as u64));
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                let mut r = drift;
                for j in 0..n {
                    let z: f64 = rng.sample(StandardNormal);
                    r += loadings[j] * z;
                }
                out.push(r);
            }
            Ok(out)
        })
        .collect::<Result<Vec<Vec<f64>>, RiskError>>()?;

    debug!(simulations = config.simulations, batches, "monte carlo paths simulated");
    Ok(draws.into_iter().flatten().collect())
}

/// Computes VaR and CVaR for a weighted portfolio over estimated market
/// statistics.
#[derive(Debug, Clone)]
pub struct RiskMetricsCalculator {
    config: RiskMetricsConfig,
}

impl RiskMetricsCalculator {
    pub fn new(config: RiskMetricsConfig) -> BwResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RiskMetricsConfig {
        &self.config
    }

    /// One confidence level with the configured method and horizon.
    pub fn evaluate(
        &self,
        stats: &MarketStatistics,
        weights: &DVector<f64>,
        confidence: f64,
        cancel: Option<&CancellationToken>,
    ) -> Result<RiskMetricResult, RiskError> {
        let mut results = self.evaluate_levels(
            self.config.method,
            stats,
            weights,
            &[confidence],
            self.config.horizon_days,
            cancel,
        )?;
        results.pop().ok_or_else(|| RiskError::InvalidInput {
            message: "no confidence level evaluated".into(),
        })
    }

    /// Every configured confidence level.
    pub fn evaluate_all(
        &self,
        stats: &MarketStatistics,
        weights: &DVector<f64>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<RiskMetricResult>, RiskError> {
        self.evaluate_levels(
            self.config.method,
            stats,
            weights,
            &self.config.confidence_levels,
            self.config.horizon_days,
            cancel,
        )
    }

    /// Any method, confidence set and horizon. All levels are read from the
    /// same sample, so VaR is non-decreasing in confidence.
    pub fn evaluate_levels(
        &self,
        method: VarMethod,
        stats: &MarketStatistics,
        weights: &DVector<f64>,
        confidence_levels: &[f64],
        horizon_days: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<RiskMetricResult>, RiskError> {
        if horizon_days == 0 {
            return Err(RiskError::InvalidInput {
                message: "horizon must be at least one period".into(),
            });
        }
        for &c in confidence_levels {
            check_confidence(c)?;
        }
        if weights.len() != stats.symbols.len() {
            return Err(RiskError::InvalidInput {
                message: format!("{} weights for {} assets", weights.len(), stats.symbols.len()),
            });
        }

        let (tails, sample_size): (Vec<TailEstimate>, usize) = match method {
            VarMethod::Historical => {
                let mut sample = portfolio_returns(stats, weights);
                if sample.is_empty() {
                    return Err(RiskError::InsufficientData {
                        symbol: "portfolio".into(),
                        observations: 0,
                        required: 1,
                    });
                }
                sample.sort_by(f64::total_cmp);
                let tails = confidence_levels.iter().map(|&c| sorted_tail(&sample, c)).collect();
                (tails, sample.len())
            }
            VarMethod::Parametric => {
                let mean = weights.dot(&stats.means);
                let sigma = stats.covariance.quadratic_form(weights).max(0.0).sqrt();
                let tails = confidence_levels
                    .iter()
                    .map(|&c| parametric_tail(mean, sigma, c))
                    .collect::<Result<Vec<_>, _>>()?;
                (tails, stats.observations)
            }
            VarMethod::MonteCarlo => {
                let mut sample = simulate_portfolio_returns(stats, weights, &self.config.monte_carlo, cancel)?;
                sample.sort_by(f64::total_cmp);
                let tails = confidence_levels.iter().map(|&c| sorted_tail(&sample, c)).collect();
                (tails, sample.len())
            }
        };

        let timestamp = Utc::now();
        Ok(confidence_levels
            .iter()
            .zip(tails)
            .map(|(&confidence, tail)| {
                let tail = tail.scaled(horizon_days);
                RiskMetricResult {
                    id: Uuid::new_v4(),
                    timestamp,
                    method,
                    confidence,
                    horizon_days,
                    var: tail.var,
                    cvar: tail.cvar,
                    sample_size,
                    regularized: stats.regularized(),
                }
            })
            .collect())
    }
}
