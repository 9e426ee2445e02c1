//! Risk limits, alerts and severity levels.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bw_types::config_error;
use bw_types::errors::BwResult;

/// Severity of a risk alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskSeverity {
    /// Informational, within normal operating range.
    Info,
    /// Approaching a limit.
    Warning,
    /// Limit breached; action required.
    Critical,
}

/// Quantity a limit is checked against. Losses and exposures are fractions
/// of portfolio value; volatility and the Sortino ratio are annualised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimitMetric {
    Var { confidence: f64 },
    Cvar { confidence: f64 },
    /// Loss of a named scenario, or of the worst one when `scenario` is unset.
    StressLoss {
        #[serde(default)]
        scenario: Option<String>,
    },
    PortfolioVolatility,
    GrossExposure,
    /// Largest absolute single-position weight.
    Concentration,
    MaxDrawdown,
    /// Composite score in `[0, 1]`.
    RiskScore,
    /// Usually paired with a `below` direction.
    SortinoRatio,
    /// Beta against the configured benchmark.
    Beta,
}

impl fmt::Display for LimitMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitMetric::Var { confidence } => write!(f, "VaR({:.1}%)", confidence * 100.0),
            LimitMetric::Cvar { confidence } => write!(f, "CVaR({:.1}%)", confidence * 100.0),
            LimitMetric::StressLoss { scenario: Some(name) } => write!(f, "stress loss [{name}]"),
            LimitMetric::StressLoss { scenario: None } => write!(f, "worst stress loss"),
            LimitMetric::PortfolioVolatility => write!(f, "portfolio volatility"),
            LimitMetric::GrossExposure => write!(f, "gross exposure"),
            LimitMetric::Concentration => write!(f, "concentration"),
            LimitMetric::MaxDrawdown => write!(f, "max drawdown"),
            LimitMetric::RiskScore => write!(f, "risk score"),
            LimitMetric::SortinoRatio => write!(f, "sortino ratio"),
            LimitMetric::Beta => write!(f, "beta"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitDirection {
    /// Breached when the value reaches or exceeds the threshold.
    Above,
    /// Breached when the value falls to or below the threshold.
    Below,
}

/// How a metric value stands against a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStatus {
    Within,
    Approaching,
    Breached,
}

/// A configured threshold on one risk metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimit {
    pub metric: LimitMetric,
    pub threshold: f64,
    #[serde(default = "default_direction")]
    pub direction: LimitDirection,
    #[serde(default = "default_severity")]
    pub severity: RiskSeverity,
}

fn default_direction() -> LimitDirection {
    LimitDirection::Above
}

fn default_severity() -> RiskSeverity {
    RiskSeverity::Critical
}

impl RiskLimit {
    pub fn above(metric: LimitMetric, threshold: f64, severity: RiskSeverity) -> Self {
        Self {
            metric,
            threshold,
            direction: LimitDirection::Above,
            severity,
        }
    }

    pub fn below(metric: LimitMetric, threshold: f64, severity: RiskSeverity) -> Self {
        Self {
            metric,
            threshold,
            direction: LimitDirection::Below,
            severity,
        }
    }

    /// Identity used for cooldown bookkeeping.
    pub fn key(&self) -> String {
        format!("{}:{:?}:{}", self.metric, self.direction, self.threshold)
    }

    pub fn validate(&self) -> BwResult<()> {
        if !self.threshold.is_finite() {
            return Err(config_error!("limit on {} has a non-finite threshold", self.metric));
        }
        match self.metric {
            LimitMetric::Var { confidence } | LimitMetric::Cvar { confidence }
                if !(confidence > 0.0 && confidence < 1.0) =>
            {
                Err(config_error!("limit on {} has confidence outside (0, 1)", self.metric))
            }
            _ => Ok(()),
        }
    }

    /// Compare `value` against the threshold. With a warning ratio `r`, an
    /// `Above` limit is approaching from `r·threshold` and a `Below` limit
    /// from `threshold / r`.
    pub fn status(&self, value: f64, warning_ratio: Option<f64>) -> LimitStatus {
        let breached = match self.direction {
            LimitDirection::Above => value >= self.threshold,
            LimitDirection::Below => value <= self.threshold,
        };
        if breached {
            return LimitStatus::Breached;
        }
        let approaching = warning_ratio.is_some_and(|r| match self.direction {
            LimitDirection::Above => value >= self.threshold * r,
            LimitDirection::Below => value <= self.threshold / r,
        });
        if approaching {
            LimitStatus::Approaching
        } else {
            LimitStatus::Within
        }
    }
}

/// Discriminant for the kind of risk alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlertKind {
    LimitBreached { limit: RiskLimit },
    LimitApproaching { limit: RiskLimit },
    /// Evaluation cycles kept exceeding their timeout.
    RepeatedTimeouts { consecutive: u32 },
}

/// A single alert emitted by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: RiskSeverity,
    pub kind: AlertKind,
    pub current_value: f64,
    pub threshold: f64,
    pub message: String,
    /// Evaluation cycle that produced the alert.
    pub cycle_id: Uuid,
}

impl Alert {
    pub fn new(
        severity: RiskSeverity,
        kind: AlertKind,
        current_value: f64,
        threshold: f64,
        message: String,
        cycle_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity,
            kind,
            current_value,
            threshold,
            message,
            cycle_id,
        }
    }

    pub fn breach(limit: &RiskLimit, value: f64, cycle_id: Uuid) -> Self {
        let verb = match limit.direction {
            LimitDirection::Above => "exceeds",
            LimitDirection::Below => "is below",
        };
        Self::new(
            limit.severity,
            AlertKind::LimitBreached { limit: limit.clone() },
            value,
            limit.threshold,
            format!("{} {:.4} {verb} {:.4} limit", limit.metric, value, limit.threshold),
            cycle_id,
        )
    }

    /// Early warning for a limit. Never more severe than `Warning`.
    pub fn approaching(limit: &RiskLimit, value: f64, cycle_id: Uuid) -> Self {
        Self::new(
            limit.severity.min(RiskSeverity::Warning),
            AlertKind::LimitApproaching { limit: limit.clone() },
            value,
            limit.threshold,
            format!("{} {:.4} approaching {:.4} limit", limit.metric, value, limit.threshold),
            cycle_id,
        )
    }

    pub fn repeated_timeouts(consecutive: u32, max: u32, cycle_id: Uuid) -> Self {
        Self::new(
            RiskSeverity::Critical,
            AlertKind::RepeatedTimeouts { consecutive },
            f64::from(consecutive),
            f64::from(max),
            format!("{consecutive} consecutive evaluation cycles timed out; risk figures are stale"),
            cycle_id,
        )
    }

    pub fn is_breach(&self) -> bool {
        matches!(self.kind, AlertKind::LimitBreached { .. })
    }

    /// Cooldown key: the limit identity, or a fixed key for system alerts.
    pub fn key(&self) -> String {
        match &self.kind {
            AlertKind::LimitBreached { limit } => format!("breach:{}", limit.key()),
            AlertKind::LimitApproaching { limit } => format!("approach:{}", limit.key()),
            AlertKind::RepeatedTimeouts { .. } => "system:timeouts".to_string(),
        }
    }
}

/// Exposure posture published to downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskState {
    Normal,
    /// A critical limit is breached; exposure should be cut.
    ReduceExposure,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var_limit(threshold: f64) -> RiskLimit {
        RiskLimit::above(LimitMetric::Var { confidence: 0.95 }, threshold, RiskSeverity::Critical)
    }

    #[test]
    fn severity_ordering() {
        assert!(RiskSeverity::Info < RiskSeverity::Warning);
        assert!(RiskSeverity::Warning < RiskSeverity::Critical);
    }

    #[test]
    fn above_limit_status() {
        let limit = var_limit(0.05);
        assert_eq!(limit.status(0.06, None), LimitStatus::Breached);
        assert_eq!(limit.status(0.05, None), LimitStatus::Breached);
        assert_eq!(limit.status(0.045, None), LimitStatus::Within);
        assert_eq!(limit.status(0.045, Some(0.8)), LimitStatus::Approaching);
        assert_eq!(limit.status(0.03, Some(0.8)), LimitStatus::Within);
    }

    #[test]
    fn below_limit_status() {
        let limit = RiskLimit::below(LimitMetric::GrossExposure, 0.5, RiskSeverity::Warning);
        assert_eq!(limit.status(0.4, None), LimitStatus::Breached);
        assert_eq!(limit.status(0.6, Some(0.8)), LimitStatus::Approaching);
        assert_eq!(limit.status(0.9, Some(0.8)), LimitStatus::Within);
    }

    #[test]
    fn breach_alert_carries_value_and_threshold() {
        let cycle = Uuid::new_v4();
        let alert = Alert::breach(&var_limit(0.05), 0.0712, cycle);
        assert_eq!(alert.severity, RiskSeverity::Critical);
        assert_eq!(alert.current_value, 0.0712);
        assert_eq!(alert.threshold, 0.05);
        assert_eq!(alert.cycle_id, cycle);
        assert!(alert.is_breach());
        assert!(alert.message.contains("VaR(95.0%)"));
        assert!(alert.message.contains("exceeds"));
    }

    #[test]
    fn approaching_alert_capped_at_warning() {
        let alert = Alert::approaching(&var_limit(0.05), 0.045, Uuid::new_v4());
        assert_eq!(alert.severity, RiskSeverity::Warning);
        assert!(!alert.is_breach());
    }

    #[test]
    fn limit_validation() {
        assert!(var_limit(0.05).validate().is_ok());
        let bad = RiskLimit::above(LimitMetric::Cvar { confidence: 1.0 }, 0.05, RiskSeverity::Critical);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn limit_deserializes_from_toml() {
        let limit: RiskLimit = toml::from_str(
            r#"
            metric = { kind = "var", confidence = 0.99 }
            threshold = 0.08
            "#,
        )
        .unwrap();
        assert_eq!(limit.metric, LimitMetric::Var { confidence: 0.99 });
        assert_eq!(limit.direction, LimitDirection::Above);
        assert_eq!(limit.severity, RiskSeverity::Critical);
    }

    #[test]
    fn alert_serialization_roundtrip() {
        let alert = Alert::repeated_timeouts(3, 3, Uuid::new_v4());
        let json = serde_json::to_string(&alert).unwrap();
        let back: Alert = serde_json::from_str(&json).unwrap();
        assert_eq!(alert, back);
    }
}
