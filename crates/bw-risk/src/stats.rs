//! Return, mean, covariance and correlation estimation over rolling price
//! windows.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use bw_types::config_error;
use bw_types::errors::{BwResult, RiskError};
use bw_types::market::{PriceHistory, ReturnSeries, Symbol};
use bw_types::matrix::CovarianceMatrix;

/// Estimation settings. `lookback` counts prices, so a full window yields
/// `lookback - 1` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub lookback: usize,
    pub min_observations: usize,
    /// Correlation matrices with a determinant below this are treated as
    /// singular.
    pub determinant_epsilon: f64,
    /// When set, singularity is judged by the correlation matrix's condition
    /// number (largest over smallest eigenvalue) instead of its determinant,
    /// which shrinks geometrically with the number of assets.
    pub max_condition_number: Option<f64>,
    /// Weight λ of the diagonal target in `(1-λ)Σ + λ·diag(Σ)`.
    pub shrinkage: f64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            lookback: 252,
            min_observations: 30,
            determinant_epsilon: 1e-10,
            max_condition_number: None,
            shrinkage: 0.1,
        }
    }
}

impl StatisticsConfig {
    pub fn validate(&self) -> BwResult<()> {
        if self.lookback < 2 {
            return Err(config_error!("statistics.lookback must be at least 2, got {}", self.lookback));
        }
        if self.min_observations < 2 {
            return Err(config_error!(
                "statistics.min_observations must be at least 2, got {}",
                self.min_observations
            ));
        }
        if self.min_observations > self.lookback - 1 {
            return Err(config_error!(
                "statistics.min_observations ({}) exceeds the returns available in a {}-price lookback",
                self.min_observations,
                self.lookback
            ));
        }
        if !(self.determinant_epsilon > 0.0 && self.determinant_epsilon.is_finite()) {
            return Err(config_error!("statistics.determinant_epsilon must be positive"));
        }
        if let Some(k) = self.max_condition_number {
            if !(k > 1.0 && k.is_finite()) {
                return Err(config_error!("statistics.max_condition_number must be above 1, got {k}"));
            }
        }
        if !(self.shrinkage > 0.0 && self.shrinkage <= 1.0) {
            return Err(config_error!(
                "statistics.shrinkage must be in (0, 1], got {}",
                self.shrinkage
            ));
        }
        Ok(())
    }
}

/// Simple period returns `p[t] / p[t-1] - 1`.
pub fn period_returns(prices: &[f64]) -> Result<Vec<f64>, RiskError> {
    if let Some(bad) = prices.iter().find(|p| !(p.is_finite() && **p > 0.0)) {
        return Err(RiskError::InvalidInput {
            message: format!("price {bad} is not a positive finite number"),
        });
    }
    Ok(prices.windows(2).map(|w| w[1] / w[0] - 1.0).collect())
}

/// Largest peak-to-trough decline of a price or equity curve, as a positive
/// fraction of the peak.
pub fn max_drawdown(curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &value in curve {
        peak = peak.max(value);
        if peak > 0.0 {
            worst = worst.max((peak - value) / peak);
        }
    }
    worst
}

/// Sample standard deviation scaled by `sqrt(periods_per_year)`.
pub fn annualized_volatility(returns: &[f64], periods_per_year: f64) -> f64 {
    let n = returns.len();
    if n < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / n as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (var * periods_per_year).sqrt()
}

/// Annualised Sortino ratio: excess return over a per-period risk-free rate,
/// divided by the downside deviation, where the downside deviation is the root mean square of the negative
/// returns over all periods. `None` with fewer than two returns or no losing
/// period, since the ratio is then unbounded.
pub fn sortino_ratio(returns: &[f64], risk_free_rate: f64, periods_per_year: f64) -> Option<f64> {
    let n = returns.len();
    if n < 2 {
        return None;
    }
    let downside = returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / n as f64;
    if downside <= 0.0 {
        return None;
    }
    let excess = returns.iter().sum::<f64>() / n as f64 - risk_free_rate;
    Some(excess / downside.sqrt() * periods_per_year.sqrt())
}

/// Sensitivity of `returns` to `benchmark`: `cov(r, m) / var(m)` over the
/// common trailing window. `None` with fewer than two common observations or
/// a flat benchmark.
pub fn beta(returns: &[f64], benchmark: &[f64]) -> Option<f64> {
    let n = returns.len().min(benchmark.len());
    if n < 2 {
        return None;
    }
    let r = &returns[returns.len() - n..];
    let m = &benchmark[benchmark.len() - n..];
    let mean_r = r.iter().sum::<f64>() / n as f64;
    let mean_m = m.iter().sum::<f64>() / n as f64;
    let cov = r.iter().zip(m).map(|(a, b)| (a - mean_r) * (b - mean_m)).sum::<f64>();
    let var = m.iter().map(|b| (b - mean_m).powi(2)).sum::<f64>();
    if var <= 0.0 {
        return None;
    }
    Some(cov / var)
}

/// An asset left out of an isolated estimate, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedAsset {
    pub symbol: Symbol,
    pub reason: RiskError,
}

/// Joint statistics of the assets that had enough history. All series are
/// aligned to the same trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStatistics {
    pub symbols: Vec<Symbol>,
    pub returns: Vec<ReturnSeries>,
    pub means: DVector<f64>,
    pub covariance: CovarianceMatrix,
    /// Sample correlation, computed before any regularisation.
    pub correlation: DMatrix<f64>,
    pub observations: usize,
    pub skipped: Vec<SkippedAsset>,
    pub computed_at: DateTime<Utc>,
}

impl MarketStatistics {
    pub fn index_of(&self, symbol: &Symbol) -> Option<usize> {
        self.symbols.iter().position(|s| s == symbol)
    }

    pub fn mean(&self, symbol: &Symbol) -> Option<f64> {
        self.index_of(symbol).map(|i| self.means[i])
    }

    pub fn correlation_between(&self, a: &Symbol, b: &Symbol) -> Option<f64> {
        Some(self.correlation[(self.index_of(a)?, self.index_of(b)?)])
    }

    pub fn series(&self, symbol: &Symbol) -> Option<&ReturnSeries> {
        self.returns.iter().find(|s| &s.symbol == symbol)
    }

    pub fn regularized(&self) -> bool {
        self.covariance.regularized
    }
}

/// Turns price histories into the inputs every other component consumes.
#[derive(Debug, Clone)]
pub struct StatisticsEngine {
    config: StatisticsConfig,
}

impl StatisticsEngine {
    pub fn new(config: StatisticsConfig) -> BwResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &StatisticsConfig {
        &self.config
    }

    /// Returns over the configured lookback, rejecting short histories.
    pub fn returns_for(&self, history: &PriceHistory) -> Result<ReturnSeries, RiskError> {
        let returns = period_returns(history.tail(self.config.lookback)).map_err(|e| match e {
            RiskError::InvalidInput { message } => RiskError::InvalidInput {
                message: format!("{}: {message}", history.symbol),
            },
            other => other,
        })?;
        let series = ReturnSeries::new(history.symbol.clone(), returns);
        if !series.is_sufficient(self.config.min_observations) {
            return Err(RiskError::InsufficientData {
                symbol: history.symbol.to_string(),
                observations: series.len(),
                required: self.config.min_observations,
            });
        }
        Ok(series)
    }

    /// Estimate over every history, failing on the first asset that cannot be
    /// used.
    pub fn estimate(&self, histories: &[PriceHistory]) -> Result<MarketStatistics, RiskError> {
        check_unique(histories)?;
        let series = histories
            .iter()
            .map(|h| self.returns_for(h))
            .collect::<Result<Vec<_>, _>>()?;
        self.build(series, Vec::new())
    }

    /// Estimate over the usable histories only. Assets that fail are reported
    /// in [`MarketStatistics::skipped`]; an error is returned only when no
    /// asset survives.
    pub fn estimate_isolated(&self, histories: &[PriceHistory]) -> Result<MarketStatistics, RiskError> {
        check_unique(histories)?;
        let mut series = Vec::with_capacity(histories.len());
        let mut skipped = Vec::new();
        for history in histories {
            match self.returns_for(history) {
                Ok(s) => series.push(s),
                Err(reason) => {
                    warn!(symbol = %history.symbol, error = %reason, "asset excluded from estimate");
                    skipped.push(SkippedAsset {
                        symbol: history.symbol.clone(),
                        reason,
                    });
                }
            }
        }
        if series.is_empty() {
            return Err(skipped
                .into_iter()
                .next()
                .map(|s| s.reason)
                .unwrap_or_else(|| RiskError::InvalidInput {
                    message: "no price histories supplied".into(),
                }));
        }
        self.build(series, skipped)
    }

    fn build(&self, series: Vec<ReturnSeries>, skipped: Vec<SkippedAsset>) -> Result<MarketStatistics, RiskError> {
        if series.is_empty() {
            return Err(RiskError::InvalidInput {
                message: "no price histories supplied".into(),
            });
        }

        let t = series.iter().map(ReturnSeries::len).min().unwrap_or(0);
        let aligned: Vec<ReturnSeries> = series
            .iter()
            .map(|s| ReturnSeries::new(s.symbol.clone(), s.tail(t).to_vec()))
            .collect();
        let n = aligned.len();
        let symbols: Vec<Symbol> = aligned.iter().map(|s| s.symbol.clone()).collect();

        let means = DVector::from_iterator(n, aligned.iter().map(ReturnSeries::mean));
        let mut cov = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in i..n {
                let c = aligned[i]
                    .returns
                    .iter()
                    .zip(aligned[j].returns.iter())
                    .map(|(a, b)| (a - means[i]) * (b - means[j]))
                    .sum::<f64>()
                    / (t - 1) as f64;
                cov[(i, j)] = c;
                cov[(j, i)] = c;
            }
        }

        let sd: Vec<f64> = (0..n).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();
        let correlation = DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                1.0
            } else if sd[i] > 0.0 && sd[j] > 0.0 {
                (cov[(i, j)] / (sd[i] * sd[j])).clamp(-1.0, 1.0)
            } else {
                0.0
            }
        });

        let zero_variance: Vec<&Symbol> = sd
            .iter()
            .zip(symbols.iter())
            .filter(|(s, _)| **s <= 0.0)
            .map(|(_, sym)| sym)
            .collect();
        let determinant = correlation.determinant();
        let ill_conditioned = match self.config.max_condition_number {
            Some(max) => condition_number(&correlation) > max,
            None => determinant < self.config.determinant_epsilon,
        };
        let singular = !zero_variance.is_empty() || ill_conditioned;

        let mut covariance = CovarianceMatrix::new(symbols.clone(), cov.clone())?;
        if singular {
            warn!(
                determinant,
                zero_variance = zero_variance.len(),
                shrinkage = self.config.shrinkage,
                "covariance singular or ill-conditioned; applying diagonal shrinkage"
            );
            covariance.matrix = self.regularize(&cov);
            covariance.regularized = true;
        }

        debug!(assets = n, observations = t, determinant, "market statistics estimated");
        Ok(MarketStatistics {
            symbols,
            returns: aligned,
            means,
            covariance,
            correlation,
            observations: t,
            skipped,
            computed_at: Utc::now(),
        })
    }

    /// `(1-λ)Σ + λ·diag(Σ)` plus a small ridge so zero-variance assets still
    /// produce a positive-definite matrix.
    fn regularize(&self, cov: &DMatrix<f64>) -> DMatrix<f64> {
        let n = cov.nrows();
        let lambda = self.config.shrinkage;
        let diag = cov.diagonal();
        let mean_var = diag.iter().map(|v| v.max(0.0)).sum::<f64>() / n as f64;
        let ridge = (mean_var * 1e-6).max(1e-12);
        let mut shrunk = cov * (1.0 - lambda);
        for i in 0..n {
            shrunk[(i, i)] += lambda * diag[i] + ridge;
        }
        shrunk
    }
}

/// `λmax / λmin` of a symmetric matrix; infinite when it is not positive
/// definite.
fn condition_number(m: &DMatrix<f64>) -> f64 {
    let eigenvalues = m.clone().symmetric_eigen().eigenvalues;
    let max = eigenvalues.max();
    let min = eigenvalues.min();
    if min <= 0.0 {
        f64::INFINITY
    } else {
        max / min
    }
}

fn check_unique(histories: &[PriceHistory]) -> Result<(), RiskError> {
    let mut seen = HashSet::new();
    for h in histories {
        if !seen.insert(&h.symbol) {
            return Err(RiskError::InvalidInput {
                message: format!("duplicate price history for {}", h.symbol),
            });
        }
    }
    Ok(())
}
