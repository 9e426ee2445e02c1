//! Exposure and concentration metrics.
//!
//! [`ExposureCalculator`] takes a portfolio snapshot and, when available, the
//! estimated market statistics to produce an [`ExposureSnapshot`].

use chrono::{DateTime, Utc};
use nalgebra::DVector;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bw_types::errors::PortfolioError;
use bw_types::market::Symbol;
use bw_types::portfolio::Portfolio;

use crate::stats::{beta, max_drawdown, sortino_ratio, MarketStatistics};
use crate::var::{portfolio_returns, portfolio_weights};

/// Per-position exposure breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRisk {
    pub symbol: Symbol,
    /// Position weight as a fraction of portfolio value (negative = short).
    pub weight: f64,
    pub weight_abs: f64,
    pub unrealized_pnl: Decimal,
    /// Annualised volatility of the asset, when it had enough history.
    pub volatility: Option<f64>,
}

/// A point-in-time view of how the book is exposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureSnapshot {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,

    /// Sum of absolute position weights.
    pub gross_exposure: f64,
    /// Sum of signed position weights (long - short).
    pub net_exposure: f64,
    pub num_positions: usize,

    /// Largest absolute single-position weight, and which position it is.
    pub max_concentration: f64,
    pub concentration_symbol: Option<Symbol>,

    /// Annualised volatility of the current weights over the estimation
    /// window. `None` without market statistics.
    pub portfolio_volatility: Option<f64>,
    /// Maximum drawdown the current weights would have suffered over the
    /// estimation window.
    pub max_drawdown: Option<f64>,
    /// Annualised Sortino ratio of the current weights over the window.
    pub sortino_ratio: Option<f64>,
    /// Beta of the current weights against the benchmark, when one is
    /// configured and has history.
    pub beta: Option<f64>,

    pub position_risks: Vec<PositionRisk>,
}

/// Settings for the performance side of an exposure snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ExposureOptions<'a> {
    pub periods_per_year: f64,
    /// Per-period rate used by the Sortino ratio.
    pub risk_free_rate: f64,
    /// Benchmark period returns, oldest first.
    pub benchmark_returns: Option<&'a [f64]>,
}

impl Default for ExposureOptions<'_> {
    fn default() -> Self {
        Self {
            periods_per_year: 252.0,
            risk_free_rate: 0.0,
            benchmark_returns: None,
        }
    }
}

/// Stateless calculator for exposure metrics.
pub struct ExposureCalculator;

impl ExposureCalculator {
    pub fn compute(
        portfolio: &Portfolio,
        stats: Option<&MarketStatistics>,
        options: &ExposureOptions<'_>,
    ) -> Result<ExposureSnapshot, PortfolioError> {
        let periods_per_year = options.periods_per_year;
        let weights = portfolio.weights()?;

        let mut position_risks = Vec::with_capacity(weights.len());
        let mut gross_exposure = 0.0;
        let mut net_exposure = 0.0;
        let mut concentration: Option<(Symbol, f64)> = None;

        for (symbol, pos) in &portfolio.positions {
            let weight = weights.get(symbol).copied().unwrap_or(0.0);
            let weight_abs = weight.abs();
            gross_exposure += weight_abs;
            net_exposure += weight;
            if concentration.as_ref().map_or(true, |(_, w)| weight_abs > *w) {
                concentration = Some((symbol.clone(), weight_abs));
            }

            let volatility = stats.and_then(|s| {
                let i = s.index_of(symbol)?;
                Some((s.covariance.matrix[(i, i)].max(0.0) * periods_per_year).sqrt())
            });
            position_risks.push(PositionRisk {
                symbol: symbol.clone(),
                weight,
                weight_abs,
                unrealized_pnl: pos.unrealized_pnl(),
                volatility,
            });
        }

        let (portfolio_volatility, max_drawdown, sortino, beta) = match stats {
            Some(s) => {
                let w = portfolio_weights(portfolio, s)?;
                let returns = portfolio_returns(s, &w);
                (
                    Some(Self::annualized_volatility(s, &w, periods_per_year)),
                    Some(Self::max_drawdown(&returns)),
                    sortino_ratio(&returns, options.risk_free_rate, periods_per_year),
                    options.benchmark_returns.and_then(|m| beta(&returns, m)),
                )
            }
            None => (None, None, None, None),
        };

        let (concentration_symbol, max_concentration) = match concentration {
            Some((s, w)) => (Some(s), w),
            None => (None, 0.0),
        };

        Ok(ExposureSnapshot {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            gross_exposure,
            net_exposure,
            num_positions: portfolio.positions.len(),
            max_concentration,
            concentration_symbol,
            portfolio_volatility,
            max_drawdown,
            sortino_ratio: sortino,
            beta,
            position_risks,
        })
    }

    /// `sqrt(wᵀΣw · periods_per_year)`.
    fn annualized_volatility(stats: &MarketStatistics, w: &DVector<f64>, periods_per_year: f64) -> f64 {
        (stats.covariance.quadratic_form(w).max(0.0) * periods_per_year).sqrt()
    }

    /// Drawdown of the equity curve built by compounding the weighted
    /// historical returns from 1.0.
    fn max_drawdown(returns: &[f64]) -> f64 {
        let mut equity = 1.0;
        let mut curve = Vec::with_capacity(returns.len() + 1);
        curve.push(equity);
        for r in returns {
            equity *= 1.0 + r;
            curve.push(equity);
        }
        max_drawdown(&curve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{StatisticsConfig, StatisticsEngine};
    use bw_types::market::PriceHistory;
    use bw_types::portfolio::Position;
    use rust_decimal_macros::dec;

    fn portfolio() -> Portfolio {
        Portfolio::new("acct".into(), dec!(2000))
            .with_position(Position::new(Symbol::equity("A"), dec!(60), dec!(100)))
            .unwrap()
            .with_position(Position::new(Symbol::equity("B"), dec!(-20), dec!(100)))
            .unwrap()
    }

    #[test]
    fn exposure_without_statistics() {
        // 2000 + 6000 - 2000 = 6000
        let snap = ExposureCalculator::compute(&portfolio(), None, &ExposureOptions::default()).unwrap();
        assert!((snap.gross_exposure - (1.0 + 1.0 / 3.0)).abs() < 1e-9);
        assert!((snap.net_exposure - (2.0 / 3.0)).abs() < 1e-9);
        assert!((snap.max_concentration - 1.0).abs() < 1e-9);
        assert_eq!(snap.concentration_symbol, Some(Symbol::equity("A")));
        assert_eq!(snap.num_positions, 2);
        assert!(snap.portfolio_volatility.is_none());
        assert!(snap.max_drawdown.is_none());
    }

    #[test]
    fn drawdown_and_volatility_from_statistics() {
        let a = vec![100.0, 110.0, 99.0, 99.0, 108.9, 108.9];
        let b = vec![50.0, 50.0, 50.0, 55.0, 55.0, 49.5];
        let stats = StatisticsEngine::new(StatisticsConfig {
            lookback: 10,
            min_observations: 5,
            ..StatisticsConfig::default()
        })
        .unwrap()
        .estimate(&[
            PriceHistory::new(Symbol::equity("A"), a),
            PriceHistory::new(Symbol::equity("B"), b),
        ])
        .unwrap();
        let book = Portfolio::new("acct".into(), dec!(0))
            .with_position(Position::new(Symbol::equity("A"), dec!(10), dec!(100)))
            .unwrap();

        let snap = ExposureCalculator::compute(&book, Some(&stats), &ExposureOptions::default()).unwrap();
        // A alone: +10%, -10% from the peak at 110.
        assert!((snap.max_drawdown.unwrap() - 0.10).abs() < 1e-9);
        assert!(snap.portfolio_volatility.unwrap() > 0.0);
        assert!(snap.position_risks[0].volatility.is_some());
        assert!(snap.sortino_ratio.is_some());
        assert!(snap.beta.is_none());

        // Holding only A against A as benchmark: beta of one.
        let a_returns = stats.series(&Symbol::equity("A")).unwrap().returns.clone();
        let options = ExposureOptions {
            benchmark_returns: Some(&a_returns),
            ..ExposureOptions::default()
        };
        let snap = ExposureCalculator::compute(&book, Some(&stats), &options).unwrap();
        // 100% in A with zero cash.
        assert!((snap.beta.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_value_is_an_error() {
        let book = Portfolio::new("acct".into(), dec!(-100));
        assert!(ExposureCalculator::compute(&book, None, &ExposureOptions::default()).is_err());
    }
}
