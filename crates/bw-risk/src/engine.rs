//! Synchronous facade over the statistics, risk, stress, sizing and
//! optimizer components.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bw_optimizer::{OptimizationResult, OptimizerModel, PortfolioOptimizer};
use bw_types::config_error;
use bw_types::errors::{BwResult, OptimizationError, RiskError};
use bw_types::market::{PriceHistory, Symbol};
use bw_types::matrix::CovarianceMatrix;
use bw_types::portfolio::Portfolio;

use crate::alerts::LimitMetric;
use crate::config::RiskEngineConfig;
use crate::metrics::{ExposureCalculator, ExposureOptions, ExposureSnapshot};
use crate::score::RiskScore;
use crate::sizing::{PositionSize, PositionSizer, SizingFailure, SizingRequest};
use crate::stats::{period_returns, MarketStatistics, SkippedAsset, StatisticsEngine};
use crate::stress::{StressReport, StressScenario, StressTestEngine};
use crate::var::{portfolio_weights, same_confidence, RiskMetricResult, RiskMetricsCalculator};

pub(crate) const HISTORICAL_WORST_SCENARIO: &str = "historical_worst";

/// Inputs of one evaluation cycle, owned so the cycle can run on a blocking
/// thread.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub portfolio: Portfolio,
    pub histories: Vec<PriceHistory>,
    /// Assets whose history could not be fetched.
    pub missing: Vec<SkippedAsset>,
    /// History of the configured benchmark, used for beta.
    pub benchmark: Option<PriceHistory>,
    pub cancel: CancellationToken,
}

impl EvaluationContext {
    pub fn new(portfolio: Portfolio, histories: Vec<PriceHistory>, cancel: CancellationToken) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            portfolio,
            histories,
            missing: Vec::new(),
            benchmark: None,
            cancel,
        }
    }
}

/// Everything one cycle computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Empty when no asset had usable statistics.
    pub risk_metrics: Vec<RiskMetricResult>,
    pub stress: StressReport,
    pub exposure: ExposureSnapshot,
    /// Assets excluded from the statistical estimate, with reasons.
    pub skipped_assets: Vec<SkippedAsset>,
    pub regularized: bool,
    pub risk_score: RiskScore,
}

impl CycleReport {
    /// Current value of a limit metric, or `None` when this cycle could not
    /// compute it.
    pub fn metric_value(&self, metric: &LimitMetric) -> Option<f64> {
        match metric {
            LimitMetric::Var { confidence } => self
                .risk_metrics
                .iter()
                .find(|r| same_confidence(r.confidence, *confidence))
                .map(|r| r.var),
            LimitMetric::Cvar { confidence } => self
                .risk_metrics
                .iter()
                .find(|r| same_confidence(r.confidence, *confidence))
                .map(|r| r.cvar),
            LimitMetric::StressLoss { scenario: Some(name) } => self.stress.result(name).map(|r| r.loss_pct),
            LimitMetric::StressLoss { scenario: None } => self.stress.worst().map(|r| r.loss_pct),
            LimitMetric::PortfolioVolatility => self.exposure.portfolio_volatility,
            LimitMetric::GrossExposure => Some(self.exposure.gross_exposure),
            LimitMetric::Concentration => Some(self.exposure.max_concentration),
            LimitMetric::MaxDrawdown => self.exposure.max_drawdown,
            LimitMetric::RiskScore => Some(self.risk_score.score),
            LimitMetric::SortinoRatio => self.exposure.sortino_ratio,
            LimitMetric::Beta => self.exposure.beta,
        }
    }
}

/// Owns validated components built from a [`RiskEngineConfig`].
pub struct RiskEngine {
    config: RiskEngineConfig,
    statistics: StatisticsEngine,
    metrics: RiskMetricsCalculator,
    sizer: PositionSizer,
    optimizer: PortfolioOptimizer,
}

impl RiskEngine {
    pub fn new(config: RiskEngineConfig) -> BwResult<Self> {
        config.validate()?;
        let optimizer =
            PortfolioOptimizer::new(config.optimizer.clone()).map_err(|e| config_error!("optimizer: {e}"))?;
        Ok(Self {
            statistics: StatisticsEngine::new(config.statistics.clone())?,
            metrics: RiskMetricsCalculator::new(config.risk_metrics.clone())?,
            sizer: PositionSizer::new(config.sizing.clone())?,
            optimizer,
            config,
        })
    }

    pub fn config(&self) -> &RiskEngineConfig {
        &self.config
    }

    pub fn statistics(&self) -> &StatisticsEngine {
        &self.statistics
    }

    /// Strict estimate over every supplied history.
    pub fn estimate(&self, histories: &[PriceHistory]) -> Result<MarketStatistics, RiskError> {
        self.statistics.estimate(histories)
    }

    /// VaR and CVaR of `portfolio` at every configured confidence level.
    pub fn evaluate_risk(
        &self,
        portfolio: &Portfolio,
        histories: &[PriceHistory],
    ) -> BwResult<Vec<RiskMetricResult>> {
        let stats = self.statistics.estimate(histories)?;
        let weights = portfolio_weights(portfolio, &stats)?;
        Ok(self.metrics.evaluate_all(&stats, &weights, None)?)
    }

    /// Configured scenarios plus any extra ones supplied by the caller.
    pub fn run_stress_tests(&self, portfolio: &Portfolio, extra: &[StressScenario]) -> StressReport {
        let scenarios: Vec<StressScenario> = self
            .config
            .stress
            .scenarios
            .iter()
            .chain(extra.iter())
            .cloned()
            .collect();
        StressTestEngine::run(portfolio, &scenarios)
    }

    pub fn optimize(
        &self,
        model: &OptimizerModel,
        expected_returns: &[f64],
        covariance: &CovarianceMatrix,
    ) -> Result<OptimizationResult, OptimizationError> {
        self.optimizer.optimize(model, expected_returns, covariance)
    }

    pub fn optimize_with_cancel(
        &self,
        model: &OptimizerModel,
        expected_returns: &[f64],
        covariance: &CovarianceMatrix,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult, OptimizationError> {
        self.optimizer
            .optimize_with_cancel(model, expected_returns, covariance, cancel)
    }

    /// Optimize directly from estimated statistics, using the sample means as
    /// expected returns.
    pub fn optimize_from_statistics(
        &self,
        model: &OptimizerModel,
        stats: &MarketStatistics,
    ) -> Result<OptimizationResult, OptimizationError> {
        let mu: Vec<f64> = stats.means.iter().copied().collect();
        self.optimizer.optimize(model, &mu, &stats.covariance)
    }

    pub fn size_position(&self, request: &SizingRequest) -> Result<PositionSize, RiskError> {
        self.sizer.size(request)
    }

    pub fn size_positions(&self, requests: &[SizingRequest]) -> (Vec<PositionSize>, Vec<SizingFailure>) {
        self.sizer.size_all(requests)
    }

    /// Run one full evaluation. Per-asset problems are isolated and reported;
    /// only cancellation or an unusable portfolio fail the cycle.
    pub fn evaluate_cycle(&self, ctx: &EvaluationContext) -> Result<CycleReport, RiskError> {
        if ctx.cancel.is_cancelled() {
            return Err(RiskError::Cancelled);
        }
        let total = ctx.portfolio.total_value();
        if total <= Decimal::ZERO {
            return Err(RiskError::InvalidInput {
                message: format!("portfolio value {total} is not positive"),
            });
        }

        let mut skipped_assets = ctx.missing.clone();
        let stats = if ctx.histories.is_empty() {
            None
        } else {
            match self.statistics.estimate_isolated(&ctx.histories) {
                Ok(stats) => {
                    skipped_assets.extend(stats.skipped.iter().cloned());
                    Some(stats)
                }
                Err(e) => {
                    warn!(cycle_id = %ctx.cycle_id, error = %e, "no usable market statistics this cycle");
                    skipped_assets.extend(ctx.histories.iter().map(|h| SkippedAsset {
                        symbol: h.symbol.clone(),
                        reason: e.clone(),
                    }));
                    None
                }
            }
        };

        let risk_metrics = match &stats {
            Some(stats) => {
                let weights = portfolio_weights(&ctx.portfolio, stats).map_err(|e| RiskError::InvalidInput {
                    message: e.to_string(),
                })?;
                self.metrics.evaluate_all(stats, &weights, Some(&ctx.cancel))?
            }
            None => Vec::new(),
        };

        if ctx.cancel.is_cancelled() {
            return Err(RiskError::Cancelled);
        }

        let mut scenarios = self.config.stress.scenarios.clone();
        if self.config.stress.include_historical_worst {
            if let Some(stats) = &stats {
                scenarios.push(StressScenario::historical_worst(HISTORICAL_WORST_SCENARIO, stats));
            }
        }
        let stress = StressTestEngine::run(&ctx.portfolio, &scenarios);

        let benchmark_returns = ctx.benchmark.as_ref().and_then(|h| match period_returns(&h.prices) {
            Ok(returns) => Some(returns),
            Err(e) => {
                warn!(cycle_id = %ctx.cycle_id, benchmark = %h.symbol, error = %e, "benchmark history unusable");
                None
            }
        });
        let options = ExposureOptions {
            periods_per_year: self.config.monitor.periods_per_year,
            risk_free_rate: self.config.optimizer.risk_free_rate,
            benchmark_returns: benchmark_returns.as_deref(),
        };
        let exposure = ExposureCalculator::compute(&ctx.portfolio, stats.as_ref(), &options)
            .map_err(|e| RiskError::InvalidInput { message: e.to_string() })?;

        let tail_var = risk_metrics
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|r| r.var);
        let risk_score = self
            .config
            .scoring
            .score(exposure.portfolio_volatility, exposure.max_drawdown, tail_var);

        let regularized = stats.as_ref().is_some_and(MarketStatistics::regularized);
        let report = CycleReport {
            cycle_id: ctx.cycle_id,
            started_at: ctx.started_at,
            completed_at: Utc::now(),
            risk_metrics,
            stress,
            exposure,
            skipped_assets,
            regularized,
            risk_score,
        };
        info!(
            cycle_id = %report.cycle_id,
            metrics = report.risk_metrics.len(),
            scenarios = report.stress.results.len(),
            skipped = report.skipped_assets.len(),
            regularized,
            score = report.risk_score.score,
            level = ?report.risk_score.level,
            "evaluation cycle complete"
        );
        debug!(cycle_id = %report.cycle_id, gross = report.exposure.gross_exposure, "exposure");
        Ok(report)
    }

    /// Symbols whose price history a cycle needs.
    pub fn required_symbols(portfolio: &Portfolio) -> Vec<Symbol> {
        portfolio
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .map(|p| p.symbol.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatisticsConfig;
    use crate::var::{RiskMetricsConfig, VarMethod};
    use bw_optimizer::WeightConstraints;
    use bw_types::errors::BwError;
    use bw_types::market::AssetClass;
    use bw_types::portfolio::Position;
    use rust_decimal_macros::dec;

    fn history(symbol: Symbol, len: usize, phase: u64) -> PriceHistory {
        let mut p = 100.0;
        let prices = (0..len)
            .map(|i| {
                p *= 1.0 + (((i as u64 * 5 + phase * 3) % 9) as f64 - 4.0) / 200.0;
                p
            })
            .collect();
        PriceHistory::new(symbol, prices)
    }

    fn config() -> RiskEngineConfig {
        RiskEngineConfig {
            statistics: StatisticsConfig {
                lookback: 100,
                min_observations: 20,
                ..StatisticsConfig::default()
            },
            risk_metrics: RiskMetricsConfig {
                method: VarMethod::Historical,
                ..RiskMetricsConfig::default()
            },
            stress: crate::config::StressConfig {
                scenarios: vec![
                    StressScenario::new("equity_crash").with_class_shock(AssetClass::Equity, -0.3),
                    StressScenario::new("broken").with_symbol_shock("AAA", -2.0),
                ],
                include_historical_worst: true,
            },
            ..RiskEngineConfig::default()
        }
    }

    fn book() -> Portfolio {
        Portfolio::new("acct".into(), dec!(1000))
            .with_position(Position::new(Symbol::equity("AAA"), dec!(50), dec!(100)))
            .unwrap()
            .with_position(Position::new(Symbol::equity("BBB"), dec!(40), dec!(100)))
            .unwrap()
    }

    #[test]
    fn invalid_config_rejected() {
        let mut cfg = RiskEngineConfig::default();
        cfg.sizing.cap = 0.0;
        assert!(matches!(RiskEngine::new(cfg), Err(BwError::Config(_))));
    }

    #[test]
    fn rejects_invalid_scenario_in_config() {
        // Scenario catalogues are validated up front.
        assert!(RiskEngine::new(config()).is_err());
    }

    #[test]
    fn evaluate_risk_per_confidence() {
        let engine = RiskEngine::new(RiskEngineConfig {
            statistics: config().statistics,
            ..RiskEngineConfig::default()
        })
        .unwrap();
        let histories = vec![
            history(Symbol::equity("AAA"), 80, 1),
            history(Symbol::equity("BBB"), 80, 2),
        ];
        let results = engine.evaluate_risk(&book(), &histories).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].var <= results[1].var);
        assert!(results.iter().all(|r| r.cvar >= r.var));
    }

    #[test]
    fn evaluate_risk_fails_on_short_history() {
        let engine = RiskEngine::new(RiskEngineConfig {
            statistics: config().statistics,
            ..RiskEngineConfig::default()
        })
        .unwrap();
        let histories = vec![
            history(Symbol::equity("AAA"), 80, 1),
            history(Symbol::equity("BBB"), 5, 2),
        ];
        assert!(matches!(
            engine.evaluate_risk(&book(), &histories),
            Err(BwError::Risk(RiskError::InsufficientData { .. }))
        ));
    }

    fn cycle_engine() -> RiskEngine {
        let mut cfg = config();
        cfg.stress.scenarios.pop();
        RiskEngine::new(cfg).unwrap()
    }

    #[test]
    fn cycle_isolates_short_history() {
        let engine = cycle_engine();
        let ctx = EvaluationContext::new(
            book(),
            vec![
                history(Symbol::equity("AAA"), 80, 1),
                history(Symbol::equity("BBB"), 5, 2),
            ],
            CancellationToken::new(),
        );
        let report = engine.evaluate_cycle(&ctx).unwrap();
        assert_eq!(report.cycle_id, ctx.cycle_id);
        assert_eq!(report.risk_metrics.len(), 2);
        assert_eq!(report.skipped_assets.len(), 1);
        assert_eq!(report.skipped_assets[0].symbol, Symbol::equity("BBB"));
        assert!(report.stress.result("equity_crash").is_some());
        assert!(report.stress.result(HISTORICAL_WORST_SCENARIO).is_some());
        // 1000 + 5000 + 4000 = 10000, equities fall 30%
        let crash = report.stress.result("equity_crash").unwrap();
        assert!((crash.loss_pct - 0.27).abs() < 1e-12);
    }

    #[test]
    fn metric_values_resolve_from_report() {
        let engine = cycle_engine();
        let ctx = EvaluationContext::new(
            book(),
            vec![
                history(Symbol::equity("AAA"), 80, 1),
                history(Symbol::equity("BBB"), 80, 2),
            ],
            CancellationToken::new(),
        );
        let report = engine.evaluate_cycle(&ctx).unwrap();
        let var99 = report.metric_value(&LimitMetric::Var { confidence: 0.99 }).unwrap();
        assert_eq!(var99, report.risk_metrics[1].var);
        assert!(report.metric_value(&LimitMetric::Var { confidence: 0.975 }).is_none());
        assert!((report.metric_value(&LimitMetric::Concentration).unwrap() - 0.5).abs() < 1e-12);
        assert!((report.metric_value(&LimitMetric::GrossExposure).unwrap() - 0.9).abs() < 1e-12);
        assert!(report.metric_value(&LimitMetric::PortfolioVolatility).is_some());
        assert!(report.metric_value(&LimitMetric::SortinoRatio).is_some());
        assert!(report.metric_value(&LimitMetric::Beta).is_none());
        assert_eq!(report.metric_value(&LimitMetric::RiskScore), Some(report.risk_score.score));
        assert!(report
            .metric_value(&LimitMetric::StressLoss { scenario: None })
            .is_some());
    }

    #[test]
    fn cash_only_cycle_has_no_risk_metrics() {
        let engine = cycle_engine();
        let ctx = EvaluationContext::new(
            Portfolio::new("acct".into(), dec!(500)),
            Vec::new(),
            CancellationToken::new(),
        );
        let report = engine.evaluate_cycle(&ctx).unwrap();
        assert!(report.risk_metrics.is_empty());
        assert_eq!(report.exposure.gross_exposure, 0.0);
        assert_eq!(report.stress.worst().unwrap().loss_pct, 0.0);
    }

    #[test]
    fn cancelled_cycle_fails() {
        let engine = cycle_engine();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = EvaluationContext::new(book(), Vec::new(), token);
        assert_eq!(engine.evaluate_cycle(&ctx).unwrap_err(), RiskError::Cancelled);
    }

    #[test]
    fn optimize_from_estimated_statistics() {
        let engine = RiskEngine::new(RiskEngineConfig {
            statistics: config().statistics,
            optimizer: WeightConstraints::default().with_bounds(0.0, 0.7),
            ..RiskEngineConfig::default()
        })
        .unwrap();
        let stats = engine
            .estimate(&[
                history(Symbol::equity("AAA"), 80, 1),
                history(Symbol::equity("BBB"), 80, 2),
                history(Symbol::equity("CCC"), 80, 0),
            ])
            .unwrap();
        let result = engine
            .optimize_from_statistics(&OptimizerModel::MeanVariance, &stats)
            .unwrap();
        assert!((result.weight_sum() - 1.0).abs() < 1e-6);
        assert!(result.weights.iter().all(|w| w.weight <= 0.7 + 1e-6));
    }

    #[test]
    fn sizing_through_facade() {
        let engine = RiskEngine::new(RiskEngineConfig::default()).unwrap();
        let size = engine
            .size_position(&SizingRequest {
                symbol: Symbol::equity("AAA"),
                edge: crate::sizing::EdgeEstimate {
                    win_probability: 0.6,
                    payoff_ratio: 1.5,
                },
                capital: dec!(9000),
                entry_price: dec!(30),
            })
            .unwrap();
        assert!((size.fraction - 1.0 / 3.0).abs() < 1e-12);
        assert!(size.quantity > dec!(99) && size.quantity < dec!(101));
    }

    #[test]
    fn stress_tests_combine_config_and_extra_scenarios() {
        let engine = cycle_engine();
        let extra = vec![
            StressScenario::new("aaa_halves").with_symbol_shock("AAA", -0.5),
            StressScenario::new("broken").with_symbol_shock("AAA", -2.0),
        ];
        let report = engine.run_stress_tests(&book(), &extra);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].scenario, "broken");

        let crash = report.result("equity_crash").unwrap();
        let worst = crash.worst_position().unwrap();
        assert_eq!(worst.symbol, Symbol::equity("AAA"));
        assert!((worst.pnl - dec!(-1500)).abs() < dec!(0.000001));
        assert_eq!(report.worst().unwrap().scenario, "equity_crash");
    }

    #[test]
    fn batch_sizing_isolates_bad_edges() {
        let engine = RiskEngine::new(RiskEngineConfig::default()).unwrap();
        let request = |ticker: &str, payoff_ratio: f64| SizingRequest {
            symbol: Symbol::equity(ticker),
            edge: crate::sizing::EdgeEstimate {
                win_probability: 0.6,
                payoff_ratio,
            },
            capital: dec!(10000),
            entry_price: dec!(50),
        };
        let (sized, failed) = engine.size_positions(&[request("AAA", 1.5), request("BBB", 0.0)]);
        assert_eq!(sized.len(), 1);
        assert_eq!(sized[0].symbol, Symbol::equity("AAA"));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].symbol, Symbol::equity("BBB"));
        assert!(matches!(failed[0].error, RiskError::InvalidEdge { .. }));
    }
}
