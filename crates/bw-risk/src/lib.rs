//! Risk measurement and monitoring for Bulwark.
//!
//! Provides:
//! - Return, covariance and correlation estimation with singularity repair
//! - Historical, parametric and Monte Carlo VaR / CVaR
//! - Scenario stress testing
//! - Kelly position sizing
//! - Sortino ratio, beta and a composite risk score with a coarse level
//! - Configurable risk limits, alert fan-out and a periodic monitor loop

pub mod alerts;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod metrics;
pub mod monitor;
pub mod normal;
pub mod score;
pub mod sizing;
pub mod stats;
pub mod stress;
pub mod var;

pub use alerts::{Alert, AlertKind, LimitDirection, LimitMetric, LimitStatus, RiskLimit, RiskSeverity, RiskState};
pub use config::{RiskEngineConfig, StressConfig};
pub use dispatcher::{AlertChannel, AlertDispatcher, CallbackChannel, CrossbeamChannel, DeliveryError, LogChannel};
pub use engine::{CycleReport, EvaluationContext, RiskEngine};
pub use metrics::{ExposureCalculator, ExposureOptions, ExposureSnapshot, PositionRisk};
pub use monitor::{
    MarketDataProvider, MonitorConfig, MonitorState, PortfolioProvider, ProviderError, RiskMonitor, TickOutcome,
};
pub use score::{RiskLevel, RiskScore, ScoringConfig};
pub use sizing::{kelly_fraction, EdgeEstimate, KellyConfig, PositionSize, PositionSizer, SizingFailure, SizingRequest};
pub use stats::{beta, period_returns, sortino_ratio, MarketStatistics, SkippedAsset, StatisticsConfig, StatisticsEngine};
pub use stress::{Shock, ShockTarget, StressReport, StressScenario, StressScenarioResult, StressTestEngine};
pub use var::{MonteCarloConfig, RiskMetricResult, RiskMetricsCalculator, RiskMetricsConfig, TailEstimate, VarMethod};
