//! Engine configuration, loaded from TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use bw_optimizer::WeightConstraints;
use bw_types::config_error;
use bw_types::errors::BwResult;
use bw_types::market::Symbol;

use crate::alerts::{LimitMetric, RiskLimit};
use crate::engine::HISTORICAL_WORST_SCENARIO;
use crate::monitor::MonitorConfig;
use crate::score::ScoringConfig;
use crate::sizing::KellyConfig;
use crate::stats::StatisticsConfig;
use crate::stress::StressScenario;
use crate::var::RiskMetricsConfig;

/// Scenario catalogue. Scenarios live in configuration so they can change
/// without a rebuild.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub scenarios: Vec<StressScenario>,
    /// Also run a scenario replaying each asset's worst observed return.
    pub include_historical_worst: bool,
}

/// Everything the risk engine and monitor need. Every section has defaults,
/// so a config file only lists what it overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskEngineConfig {
    pub statistics: StatisticsConfig,
    pub risk_metrics: RiskMetricsConfig,
    pub stress: StressConfig,
    pub sizing: KellyConfig,
    pub optimizer: WeightConstraints,
    pub monitor: MonitorConfig,
    pub scoring: ScoringConfig,
    /// Market proxy that beta is measured against.
    pub benchmark: Option<Symbol>,
    pub limits: Vec<RiskLimit>,
}

impl RiskEngineConfig {
    pub fn from_toml_str(s: &str) -> BwResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> BwResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        info!(
            path = %path.display(),
            limits = config.limits.len(),
            scenarios = config.stress.scenarios.len(),
            "risk engine config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> BwResult<()> {
        self.statistics.validate()?;
        self.risk_metrics.validate()?;
        self.sizing.validate()?;
        self.monitor.validate()?;
        self.scoring.validate()?;
        self.optimizer
            .validate()
            .map_err(|e| config_error!("optimizer: {e}"))?;
        for scenario in &self.stress.scenarios {
            scenario
                .validate()
                .map_err(|e| config_error!("stress: {e}"))?;
        }
        let mut names: Vec<&str> = self.stress.scenarios.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(config_error!("stress scenario {} is defined twice", dup[0]));
        }
        for limit in &self.limits {
            limit.validate()?;
            self.check_limit_is_computed(limit)?;
        }
        Ok(())
    }

    /// A limit on a metric the engine never produces would never fire.
    fn check_limit_is_computed(&self, limit: &RiskLimit) -> BwResult<()> {
        match &limit.metric {
            LimitMetric::Var { confidence } | LimitMetric::Cvar { confidence }
                if !self.risk_metrics.computes(*confidence) =>
            {
                Err(config_error!(
                    "limit on {} uses a confidence level missing from risk_metrics.confidence_levels {:?}",
                    limit.metric,
                    self.risk_metrics.confidence_levels
                ))
            }
            LimitMetric::StressLoss { scenario: Some(name) } => {
                let known = self.stress.scenarios.iter().any(|s| &s.name == name)
                    || (self.stress.include_historical_worst && name == HISTORICAL_WORST_SCENARIO);
                if known {
                    Ok(())
                } else {
                    Err(config_error!("limit on {} names an unknown stress scenario", limit.metric))
                }
            }
            LimitMetric::Beta if self.benchmark.is_none() => {
                Err(config_error!("limit on {} needs a benchmark", limit.metric))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{LimitDirection, RiskSeverity};
    use crate::var::VarMethod;
    use bw_types::errors::BwError;
    use bw_types::market::AssetClass;

    const SAMPLE: &str = r#"
benchmark = { symbol = "SPY", exchange = "NYSE", asset_class = "Equity" }

[statistics]
lookback = 120
min_observations = 60

[risk_metrics]
method = "monte_carlo"
confidence_levels = [0.95, 0.99]
horizon_days = 10

[risk_metrics.monte_carlo]
simulations = 5000
seed = 42

[sizing]
cap = 0.25

[optimizer]
upper_bound = 0.4

[monitor]
interval_ms = 5000
warning_ratio = 0.8

[[stress.scenarios]]
name = "2008_crisis"
shocks = [{ target = { asset_class = "Equity" }, shock = -0.40 }]

[[stress.scenarios]]
name = "crypto_winter"
shocks = [{ target = { asset_class = "Crypto" }, shock = -0.70 }]

[[limits]]
metric = { kind = "var", confidence = 0.99 }
threshold = 0.05

[scoring]
var_ceiling = 0.08

[[limits]]
metric = { kind = "concentration" }
threshold = 0.30
severity = "Warning"

[[limits]]
metric = { kind = "beta" }
threshold = 1.5
"#;

    #[test]
    fn defaults_are_valid() {
        assert!(RiskEngineConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_full_config() {
        let config = RiskEngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.statistics.lookback, 120);
        assert_eq!(config.statistics.shrinkage, 0.1);
        assert_eq!(config.risk_metrics.method, VarMethod::MonteCarlo);
        assert_eq!(config.risk_metrics.horizon_days, 10);
        assert_eq!(config.risk_metrics.monte_carlo.seed, Some(42));
        assert_eq!(config.risk_metrics.monte_carlo.batch_size, 1_000);
        assert_eq!(config.sizing.cap, 0.25);
        assert_eq!(config.optimizer.upper_bound, 0.4);
        assert_eq!(config.optimizer.lower_bound, 0.0);
        assert_eq!(config.monitor.interval_ms, 5000);
        assert_eq!(config.monitor.warning_ratio, Some(0.8));
        assert_eq!(config.stress.scenarios.len(), 2);
        assert_eq!(
            config.stress.scenarios[0].shock_for(&Symbol::equity("SPY")),
            Some(-0.40)
        );
        assert_eq!(config.benchmark, Some(Symbol::new("SPY", "NYSE", AssetClass::Equity)));
        assert_eq!(config.scoring.var_ceiling, 0.08);
        assert_eq!(config.scoring.volatility_ceiling, 0.5);
        assert_eq!(config.limits.len(), 3);
        assert_eq!(config.limits[2].metric, LimitMetric::Beta);
        assert_eq!(config.limits[1].metric, LimitMetric::Concentration);
        assert_eq!(config.limits[1].severity, RiskSeverity::Warning);
        assert_eq!(config.limits[1].direction, LimitDirection::Above);
    }

    #[test]
    fn invalid_section_rejected() {
        let err = RiskEngineConfig::from_toml_str("[sizing]\ncap = 2.0\n").unwrap_err();
        assert!(matches!(err, BwError::Config(_)));
    }

    #[test]
    fn duplicate_scenarios_rejected() {
        let toml = r#"
[[stress.scenarios]]
name = "x"
shocks = []

[[stress.scenarios]]
name = "x"
shocks = []
"#;
        assert!(RiskEngineConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = RiskEngineConfig::from_toml_str("[statistics\n").unwrap_err();
        assert!(matches!(err, BwError::ConfigParse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = RiskEngineConfig::from_path("/nonexistent/bulwark.toml").unwrap_err();
        assert!(matches!(err, BwError::Io(_)));
    }

    #[test]
    fn limit_at_uncomputed_confidence_rejected() {
        let toml = r#"
[risk_metrics]
confidence_levels = [0.95, 0.99]

[[limits]]
metric = { kind = "var", confidence = 0.975 }
threshold = 0.0
"#;
        let err = RiskEngineConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, BwError::Config(_)));

        let mut config = RiskEngineConfig::default();
        config.limits.push(RiskLimit::above(
            LimitMetric::Cvar { confidence: 0.99 },
            0.05,
            RiskSeverity::Critical,
        ));
        assert!(config.validate().is_ok());
        config.risk_metrics.confidence_levels = vec![0.95];
        assert!(config.validate().is_err());
    }

    #[test]
    fn stress_limit_must_name_a_known_scenario() {
        let mut config = RiskEngineConfig::default();
        config.limits.push(RiskLimit::above(
            LimitMetric::StressLoss {
                scenario: Some("historical_worst".into()),
            },
            0.2,
            RiskSeverity::Critical,
        ));
        assert!(config.validate().is_err());
        config.stress.include_historical_worst = true;
        assert!(config.validate().is_ok());

        config.limits[0].metric = LimitMetric::StressLoss {
            scenario: Some("2008_crisis".into()),
        };
        assert!(config.validate().is_err());
        config.stress.scenarios.push(StressScenario::new("2008_crisis"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn beta_limit_requires_benchmark() {
        let mut config = RiskEngineConfig::default();
        config
            .limits
            .push(RiskLimit::above(LimitMetric::Beta, 1.5, RiskSeverity::Warning));
        assert!(config.validate().is_err());
        config.benchmark = Some(Symbol::equity("SPY"));
        assert!(config.validate().is_ok());
    }
}
