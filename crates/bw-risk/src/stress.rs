//! Scenario stress testing.
//!
//! A scenario is a set of instantaneous percentage price shocks keyed by
//! ticker or asset class. Shocks never touch cash. Assets with no matching
//! shock keep their current value, and shocks for assets the portfolio does
//! not hold are ignored.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use bw_types::errors::RiskError;
use bw_types::market::{AssetClass, Symbol};
use bw_types::portfolio::Portfolio;

use crate::stats::MarketStatistics;

/// What a shock applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShockTarget {
    /// Every holding whose ticker matches, on any exchange.
    Symbol(String),
    AssetClass(AssetClass),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shock {
    pub target: ShockTarget,
    /// Fractional price change, e.g. `-0.40` for a 40% fall.
    pub shock: f64,
}

/// A named, reusable set of shocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub shocks: Vec<Shock>,
}

impl StressScenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            shocks: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_symbol_shock(mut self, ticker: &str, shock: f64) -> Self {
        self.shocks.push(Shock {
            target: ShockTarget::Symbol(ticker.to_string()),
            shock,
        });
        self
    }

    pub fn with_class_shock(mut self, asset_class: AssetClass, shock: f64) -> Self {
        self.shocks.push(Shock {
            target: ShockTarget::AssetClass(asset_class),
            shock,
        });
        self
    }

    /// A scenario that replays each asset's worst observed period return.
    pub fn historical_worst(name: impl Into<String>, stats: &MarketStatistics) -> Self {
        let mut scenario = Self::new(name).with_description("worst observed return per asset");
        for series in &stats.returns {
            if let Some(worst) = series.returns.iter().copied().min_by(f64::total_cmp) {
                scenario = scenario.with_symbol_shock(series.symbol.ticker(), worst);
            }
        }
        scenario
    }

    pub fn validate(&self) -> Result<(), RiskError> {
        let invalid = |message: String| RiskError::InvalidScenario {
            scenario: self.name.clone(),
            message,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("scenario name is empty".into()));
        }
        for shock in &self.shocks {
            if !shock.shock.is_finite() {
                return Err(invalid(format!("shock for {:?} is not finite", shock.target)));
            }
            if shock.shock < -1.0 {
                return Err(invalid(format!(
                    "shock {} for {:?} would make prices negative",
                    shock.shock, shock.target
                )));
            }
        }
        Ok(())
    }

    /// Shock applied to `symbol`. A ticker shock takes precedence over an
    /// asset-class shock; among shocks of the same kind the last one wins.
    pub fn shock_for(&self, symbol: &Symbol) -> Option<f64> {
        let by_ticker = self.shocks.iter().rev().find(|s| match &s.target {
            ShockTarget::Symbol(ticker) => ticker == symbol.ticker(),
            ShockTarget::AssetClass(_) => false,
        });
        let by_class = || {
            self.shocks.iter().rev().find(|s| match &s.target {
                ShockTarget::AssetClass(class) => *class == symbol.asset_class,
                ShockTarget::Symbol(_) => false,
            })
        };
        by_ticker.or_else(by_class).map(|s| s.shock)
    }
}

/// Effect of a scenario on one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionImpact {
    pub symbol: Symbol,
    /// `None` when no shock matched the position.
    pub shock: Option<f64>,
    pub base_value: Decimal,
    pub stressed_value: Decimal,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenarioResult {
    pub scenario: String,
    pub base_value: Decimal,
    pub stressed_value: Decimal,
    /// `base_value - stressed_value`; negative when the scenario is a gain.
    pub absolute_loss: Decimal,
    /// Loss as a fraction of base value.
    pub loss_pct: f64,
    pub impacts: Vec<PositionImpact>,
    /// Shock targets that matched nothing in the portfolio.
    pub unmatched_shocks: Vec<ShockTarget>,
}

impl StressScenarioResult {
    pub fn worst_position(&self) -> Option<&PositionImpact> {
        self.impacts.iter().min_by(|a, b| a.pnl.cmp(&b.pnl))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioFailure {
    pub scenario: String,
    pub error: RiskError,
}

/// Results ranked by loss, largest first, plus the scenarios that could not
/// be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressReport {
    pub results: Vec<StressScenarioResult>,
    pub failures: Vec<ScenarioFailure>,
    pub computed_at: DateTime<Utc>,
}

impl StressReport {
    pub fn worst(&self) -> Option<&StressScenarioResult> {
        self.results.first()
    }

    pub fn result(&self, scenario: &str) -> Option<&StressScenarioResult> {
        self.results.iter().find(|r| r.scenario == scenario)
    }
}

/// Stateless scenario evaluator.
pub struct StressTestEngine;

impl StressTestEngine {
    /// Apply one scenario to a snapshot.
    pub fn apply(portfolio: &Portfolio, scenario: &StressScenario) -> Result<StressScenarioResult, RiskError> {
        scenario.validate()?;
        let base_value = portfolio.total_value();
        if base_value <= Decimal::ZERO {
            return Err(RiskError::InvalidScenario {
                scenario: scenario.name.clone(),
                message: format!("portfolio value {base_value} is not positive"),
            });
        }

        let mut impacts = Vec::with_capacity(portfolio.positions.len());
        let mut stressed_value = portfolio.cash;
        for (symbol, position) in &portfolio.positions {
            let shock = scenario.shock_for(symbol);
            let base = position.market_value();
            let stressed = match shock {
                Some(s) => {
                    let factor = Decimal::from_f64(1.0 + s).ok_or_else(|| RiskError::InvalidScenario {
                        scenario: scenario.name.clone(),
                        message: format!("shock {s} for {symbol} is not representable"),
                    })?;
                    position.quantity * position.market_price * factor
                }
                None => base,
            };
            stressed_value += stressed;
            impacts.push(PositionImpact {
                symbol: symbol.clone(),
                shock,
                base_value: base,
                stressed_value: stressed,
                pnl: stressed - base,
            });
        }

        let unmatched_shocks = scenario
            .shocks
            .iter()
            .filter(|s| {
                !portfolio.positions.keys().any(|sym| match &s.target {
                    ShockTarget::Symbol(ticker) => ticker == sym.ticker(),
                    ShockTarget::AssetClass(class) => *class == sym.asset_class,
                })
            })
            .map(|s| s.target.clone())
            .collect::<Vec<_>>();
        if !unmatched_shocks.is_empty() {
            debug!(scenario = %scenario.name, unmatched = unmatched_shocks.len(), "shocks matched no holding");
        }

        let absolute_loss = base_value - stressed_value;
        let loss_pct = (absolute_loss / base_value).to_f64().unwrap_or(0.0);
        Ok(StressScenarioResult {
            scenario: scenario.name.clone(),
            base_value,
            stressed_value,
            absolute_loss,
            loss_pct,
            impacts,
            unmatched_shocks,
        })
    }

    /// Apply every scenario. A failing scenario is recorded and the rest
    /// still run.
    pub fn run(portfolio: &Portfolio, scenarios: &[StressScenario]) -> StressReport {
        let mut results = Vec::with_capacity(scenarios.len());
        let mut failures = Vec::new();
        for scenario in scenarios {
            match Self::apply(portfolio, scenario) {
                Ok(result) => results.push(result),
                Err(error) => {
                    warn!(scenario = %scenario.name, error = %error, "stress scenario failed");
                    failures.push(ScenarioFailure {
                        scenario: scenario.name.clone(),
                        error,
                    });
                }
            }
        }

        results.sort_by(|a, b| match b.loss_pct.total_cmp(&a.loss_pct) {
            Ordering::Equal => a.scenario.cmp(&b.scenario),
            other => other,
        });

        if let Some(worst) = results.first() {
            info!(
                scenarios = results.len(),
                failed = failures.len(),
                worst = %worst.scenario,
                worst_loss_pct = worst.loss_pct,
                "stress tests complete"
            );
        }
        StressReport {
            results,
            failures,
            computed_at: Utc::now(),
        }
    }
}
