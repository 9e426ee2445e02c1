//! Composite risk score and the coarse risk level derived from it.
//!
//! The score blends annualised volatility, maximum drawdown and VaR, each
//! normalised against a ceiling at which it saturates, into `[0, 1]`.

use serde::{Deserialize, Serialize};

use bw_types::config_error;
use bw_types::errors::BwResult;

/// Coarse classification of the composite score, published by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Annualised volatility at which the volatility component saturates.
    pub volatility_ceiling: f64,
    pub drawdown_ceiling: f64,
    pub var_ceiling: f64,
    pub volatility_weight: f64,
    pub drawdown_weight: f64,
    pub var_weight: f64,
    /// Lower score bounds of the `Medium`, `High` and `Critical` levels.
    pub medium_from: f64,
    pub high_from: f64,
    pub critical_from: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            volatility_ceiling: 0.5,
            drawdown_ceiling: 0.2,
            var_ceiling: 0.05,
            volatility_weight: 0.4,
            drawdown_weight: 0.4,
            var_weight: 0.2,
            medium_from: 0.3,
            high_from: 0.6,
            critical_from: 0.8,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> BwResult<()> {
        for (name, ceiling) in [
            ("volatility_ceiling", self.volatility_ceiling),
            ("drawdown_ceiling", self.drawdown_ceiling),
            ("var_ceiling", self.var_ceiling),
        ] {
            if !(ceiling > 0.0 && ceiling.is_finite()) {
                return Err(config_error!("scoring.{name} must be positive, got {ceiling}"));
            }
        }
        let weights = [self.volatility_weight, self.drawdown_weight, self.var_weight];
        if weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(config_error!("scoring weights must be non-negative with a positive sum"));
        }
        if !(0.0 < self.medium_from
            && self.medium_from < self.high_from
            && self.high_from < self.critical_from
            && self.critical_from <= 1.0)
        {
            return Err(config_error!(
                "scoring level bounds must satisfy 0 < medium_from < high_from < critical_from <= 1"
            ));
        }
        Ok(())
    }

    /// Score the given metrics. A metric that could not be computed
    /// contributes nothing.
    pub fn score(&self, volatility: Option<f64>, max_drawdown: Option<f64>, var: Option<f64>) -> RiskScore {
        let component = |value: Option<f64>, ceiling: f64| value.map_or(0.0, |v| (v.abs() / ceiling).min(1.0));
        let volatility_component = component(volatility, self.volatility_ceiling);
        let drawdown_component = component(max_drawdown, self.drawdown_ceiling);
        let var_component = component(var, self.var_ceiling);

        let total_weight = self.volatility_weight + self.drawdown_weight + self.var_weight;
        let score = ((volatility_component * self.volatility_weight
            + drawdown_component * self.drawdown_weight
            + var_component * self.var_weight)
            / total_weight)
            .clamp(0.0, 1.0);

        RiskScore {
            score,
            level: self.level(score),
            volatility_component,
            drawdown_component,
            var_component,
        }
    }

    pub fn level(&self, score: f64) -> RiskLevel {
        if score >= self.critical_from {
            RiskLevel::Critical
        } else if score >= self.high_from {
            RiskLevel::High
        } else if score >= self.medium_from {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Composite score with its normalised components, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    pub score: f64,
    pub level: RiskLevel,
    pub volatility_component: f64,
    pub drawdown_component: f64,
    pub var_component: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blends_normalised_components() {
        let config = ScoringConfig::default();
        // 0.25/0.5 = 0.5, 0.05/0.2 = 0.25, 0.05/0.05 = 1
        let s = config.score(Some(0.25), Some(0.05), Some(0.05));
        assert!((s.score - (0.5 * 0.4 + 0.25 * 0.4 + 1.0 * 0.2)).abs() < 1e-12);
        assert_eq!(s.level, RiskLevel::Medium);
        assert_eq!(s.var_component, 1.0);
    }

    #[test]
    fn components_saturate() {
        let s = ScoringConfig::default().score(Some(3.0), Some(0.9), Some(0.4));
        assert_eq!(s.score, 1.0);
        assert_eq!(s.level, RiskLevel::Critical);
    }

    #[test]
    fn missing_metrics_contribute_nothing() {
        let s = ScoringConfig::default().score(None, None, None);
        assert_eq!(s.score, 0.0);
        assert_eq!(s.level, RiskLevel::Low);
    }

    #[test]
    fn level_boundaries() {
        let config = ScoringConfig::default();
        assert_eq!(config.level(0.29), RiskLevel::Low);
        assert_eq!(config.level(0.3), RiskLevel::Medium);
        assert_eq!(config.level(0.6), RiskLevel::High);
        assert_eq!(config.level(0.8), RiskLevel::Critical);
        assert!(RiskLevel::Critical > RiskLevel::High);
    }

    #[test]
    fn validation() {
        assert!(ScoringConfig::default().validate().is_ok());
        let bad = ScoringConfig {
            high_from: 0.2,
            ..ScoringConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = ScoringConfig {
            volatility_weight: 0.0,
            drawdown_weight: 0.0,
            var_weight: 0.0,
            ..ScoringConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = ScoringConfig {
            var_ceiling: 0.0,
            ..ScoringConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
