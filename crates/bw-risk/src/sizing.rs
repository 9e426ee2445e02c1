//! Kelly-criterion position sizing.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use bw_types::config_error;
use bw_types::errors::{BwResult, RiskError};
use bw_types::market::{ReturnSeries, Symbol};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KellyConfig {
    /// Upper bound on the fraction of capital committed to one position.
    pub cap: f64,
}

impl Default for KellyConfig {
    fn default() -> Self {
        Self { cap: 0.5 }
    }
}

impl KellyConfig {
    pub fn validate(&self) -> BwResult<()> {
        if !(self.cap > 0.0 && self.cap <= 1.0) {
            return Err(config_error!("sizing.cap must be in (0, 1], got {}", self.cap));
        }
        Ok(())
    }
}

/// Unclamped Kelly fraction `f* = (p(b+1) - 1) / b`.
fn raw_kelly(win_probability: f64, payoff_ratio: f64) -> Result<f64, RiskError> {
    if !(payoff_ratio > 0.0) || !payoff_ratio.is_finite() {
        return Err(RiskError::InvalidEdge { payoff_ratio });
    }
    if !(0.0..=1.0).contains(&win_probability) {
        return Err(RiskError::InvalidInput {
            message: format!("win probability {win_probability} must be in [0, 1]"),
        });
    }
    Ok((win_probability * (payoff_ratio + 1.0) - 1.0) / payoff_ratio)
}

/// Kelly fraction clamped to `[0, cap]`. A negative edge sizes to zero.
pub fn kelly_fraction(win_probability: f64, payoff_ratio: f64, cap: f64) -> Result<f64, RiskError> {
    if !(cap > 0.0 && cap <= 1.0) {
        return Err(RiskError::InvalidInput {
            message: format!("kelly cap {cap} must be in (0, 1]"),
        });
    }
    Ok(raw_kelly(win_probability, payoff_ratio)?.clamp(0.0, cap))
}

/// Win probability and payoff ratio of a strategy or asset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeEstimate {
    pub win_probability: f64,
    /// Average win divided by average loss magnitude.
    pub payoff_ratio: f64,
}

impl EdgeEstimate {
    /// Estimate from historical period returns. Flat periods are ignored.
    pub fn from_returns(series: &ReturnSeries) -> Result<Self, RiskError> {
        let wins: Vec<f64> = series.returns.iter().copied().filter(|r| *r > 0.0).collect();
        let losses: Vec<f64> = series.returns.iter().copied().filter(|r| *r < 0.0).collect();
        if losses.is_empty() {
            return Err(RiskError::InvalidInput {
                message: format!("{} has no losing periods; payoff ratio is undefined", series.symbol),
            });
        }
        let avg_loss = losses.iter().sum::<f64>().abs() / losses.len() as f64;
        let avg_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        Ok(Self {
            win_probability: wins.len() as f64 / (wins.len() + losses.len()) as f64,
            payoff_ratio: avg_win / avg_loss,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingRequest {
    pub symbol: Symbol,
    pub edge: EdgeEstimate,
    pub capital: Decimal,
    pub entry_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSize {
    pub symbol: Symbol,
    /// Kelly fraction before clamping; negative when the edge is negative.
    pub raw_fraction: f64,
    /// Fraction actually applied, in `[0, cap]`.
    pub fraction: f64,
    pub capital_allocated: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingFailure {
    pub symbol: Symbol,
    pub error: RiskError,
}

pub struct PositionSizer {
    config: KellyConfig,
}

impl PositionSizer {
    pub fn new(config: KellyConfig) -> BwResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn cap(&self) -> f64 {
        self.config.cap
    }

    pub fn size(&self, request: &SizingRequest) -> Result<PositionSize, RiskError> {
        if request.entry_price <= Decimal::ZERO {
            return Err(RiskError::InvalidInput {
                message: format!("entry price for {} must be positive", request.symbol),
            });
        }
        if request.capital < Decimal::ZERO {
            return Err(RiskError::InvalidInput {
                message: format!("capital {} is negative", request.capital),
            });
        }

        let raw_fraction = raw_kelly(request.edge.win_probability, request.edge.payoff_ratio)?;
        let fraction = raw_fraction.clamp(0.0, self.config.cap);
        let fraction_dec = Decimal::from_f64(fraction).ok_or_else(|| RiskError::InvalidInput {
            message: format!("fraction {fraction} is not representable"),
        })?;
        let capital_allocated = (request.capital * fraction_dec).round_dp(8);
        let quantity = (capital_allocated / request.entry_price).round_dp(8);

        debug!(
            symbol = %request.symbol,
            raw_fraction,
            fraction,
            capital = request.capital.to_f64().unwrap_or(0.0),
            "position sized"
        );
        Ok(PositionSize {
            symbol: request.symbol.clone(),
            raw_fraction,
            fraction,
            capital_allocated,
            quantity,
        })
    }

    /// Size every request; an invalid request fails alone.
    pub fn size_all(&self, requests: &[SizingRequest]) -> (Vec<PositionSize>, Vec<SizingFailure>) {
        let mut sized = Vec::with_capacity(requests.len());
        let mut failed = Vec::new();
        for request in requests {
            match self.size(request) {
                Ok(size) => sized.push(size),
                Err(error) => {
                    warn!(symbol = %request.symbol, error = %error, "position sizing failed");
                    failed.push(SizingFailure {
                        symbol: request.symbol.clone(),
                        error,
                    });
                }
            }
        }
        (sized, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(p: f64, b: f64) -> SizingRequest {
        SizingRequest {
            symbol: Symbol::equity("AAPL"),
            edge: EdgeEstimate {
                win_probability: p,
                payoff_ratio: b,
            },
            capital: dec!(10000),
            entry_price: dec!(100),
        }
    }

    #[test]
    fn classic_kelly() {
        let f = kelly_fraction(0.6, 1.5, 1.0).unwrap();
        assert!((f - 1.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn cap_clamps_fraction() {
        assert_eq!(kelly_fraction(0.6, 1.5, 0.2).unwrap(), 0.2);
    }

    #[test]
    fn negative_edge_sizes_to_zero() {
        assert_eq!(kelly_fraction(0.3, 1.0, 0.5).unwrap(), 0.0);
    }

    #[test]
    fn non_positive_payoff_is_invalid_edge() {
        assert!(matches!(kelly_fraction(0.6, 0.0, 0.5), Err(RiskError::InvalidEdge { .. })));
        assert!(matches!(kelly_fraction(0.6, -1.0, 0.5), Err(RiskError::InvalidEdge { .. })));
    }

    #[test]
    fn out_of_range_cap_is_invalid_input() {
        for cap in [-0.1, 0.0, 1.5, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(kelly_fraction(0.6, 1.5, cap), Err(RiskError::InvalidInput { .. })),
                "cap {cap} accepted"
            );
        }
    }

    #[test]
    fn probability_out_of_range() {
        assert!(matches!(kelly_fraction(1.2, 1.0, 0.5), Err(RiskError::InvalidInput { .. })));
    }

    #[test]
    fn sizing_converts_fraction_to_quantity() {
        let sizer = PositionSizer::new(KellyConfig { cap: 0.25 }).unwrap();
        let size = sizer.size(&request(0.6, 1.5)).unwrap();
        assert!((size.raw_fraction - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(size.fraction, 0.25);
        assert_eq!(size.capital_allocated, dec!(2500));
        assert_eq!(size.quantity, dec!(25));
    }

    #[test]
    fn batch_isolates_failures() {
        let sizer = PositionSizer::new(KellyConfig::default()).unwrap();
        let mut bad = request(0.6, -2.0);
        bad.symbol = Symbol::equity("BAD");
        let (sized, failed) = sizer.size_all(&[request(0.55, 1.0), bad]);
        assert_eq!(sized.len(), 1);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].symbol, Symbol::equity("BAD"));
    }

    #[test]
    fn edge_from_returns() {
        let series = ReturnSeries::new(Symbol::equity("X"), vec![0.02, -0.01, 0.04, 0.0, -0.03]);
        let edge = EdgeEstimate::from_returns(&series).unwrap();
        assert!((edge.win_probability - 0.5).abs() < 1e-12);
        assert!((edge.payoff_ratio - 1.5).abs() < 1e-12);
    }

    #[test]
    fn config_rejects_bad_cap() {
        assert!(PositionSizer::new(KellyConfig { cap: 0.0 }).is_err());
        assert!(KellyConfig { cap: 1.5 }.validate().is_err());
    }
}
