//! Black-Litterman posterior returns.
//!
//! The prior is the market-implied return vector `Π = δΣw_mkt`. Views are
//! blended in with the master formula
//! `E[R] = [(τΣ)⁻¹ + PᵀΩ⁻¹P]⁻¹ [(τΣ)⁻¹Π + PᵀΩ⁻¹Q]`.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use bw_types::errors::OptimizationError;
use bw_types::market::Symbol;
use bw_types::matrix::CovarianceMatrix;

/// Confidence is clamped below this so the view covariance stays invertible.
const MAX_VIEW_CONFIDENCE: f64 = 1.0 - 1e-6;

/// Market capitalisation of one asset, used to derive equilibrium weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketCap {
    pub symbol: Symbol,
    pub capitalization: f64,
}

/// Which assets a view is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ViewKind {
    /// `symbol` returns `expected_return`.
    Absolute { symbol: Symbol },
    /// `long` outperforms `short` by `expected_return`.
    Relative { long: Symbol, short: Symbol },
}

/// A subjective return view with a confidence in `[0, 1]`. A confidence of
/// zero means the view carries no information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub kind: ViewKind,
    pub expected_return: f64,
    pub confidence: f64,
}

impl View {
    pub fn absolute(symbol: Symbol, expected_return: f64, confidence: f64) -> Self {
        Self {
            kind: ViewKind::Absolute { symbol },
            expected_return,
            confidence,
        }
    }

    pub fn relative(long: Symbol, short: Symbol, expected_return: f64, confidence: f64) -> Self {
        Self {
            kind: ViewKind::Relative { long, short },
            expected_return,
            confidence,
        }
    }
}

/// Everything the Black-Litterman model needs beyond the covariance matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackLittermanInputs {
    pub market_caps: Vec<MarketCap>,
    /// Risk aversion coefficient δ.
    pub risk_aversion: f64,
    /// Scalar τ on the prior covariance.
    pub tau: f64,
    pub views: Vec<View>,
}

impl BlackLittermanInputs {
    pub fn new(market_caps: Vec<MarketCap>) -> Self {
        Self {
            market_caps,
            risk_aversion: 2.5,
            tau: 0.05,
            views: Vec::new(),
        }
    }

    pub fn with_view(mut self, view: View) -> Self {
        self.views.push(view);
        self
    }
}

/// Prior and posterior return vectors in covariance order.
#[derive(Debug, Clone, PartialEq)]
pub struct Posterior {
    pub prior: DVector<f64>,
    pub posterior: DVector<f64>,
    pub views_used: usize,
}

/// Normalised market-cap weights in covariance order.
pub fn market_weights(
    covariance: &CovarianceMatrix,
    caps: &[MarketCap],
) -> Result<DVector<f64>, OptimizationError> {
    let mut w = DVector::zeros(covariance.dim());
    for (i, symbol) in covariance.symbols.iter().enumerate() {
        let cap = caps
            .iter()
            .find(|c| &c.symbol == symbol)
            .ok_or_else(|| OptimizationError::InvalidInput {
                message: format!("no market capitalisation for {symbol}"),
            })?;
        if !(cap.capitalization.is_finite() && cap.capitalization > 0.0) {
            return Err(OptimizationError::InvalidInput {
                message: format!("market capitalisation for {symbol} must be positive"),
            });
        }
        w[i] = cap.capitalization;
    }
    let total = w.sum();
    Ok(w / total)
}

/// Reverse-optimised equilibrium returns `Π = δΣw`.
pub fn implied_returns(
    covariance: &CovarianceMatrix,
    market_weights: &DVector<f64>,
    risk_aversion: f64,
) -> DVector<f64> {
    &covariance.matrix * market_weights * risk_aversion
}

/// Blend the market prior with the supplied views.
pub fn posterior_returns(
    covariance: &CovarianceMatrix,
    inputs: &BlackLittermanInputs,
) -> Result<Posterior, OptimizationError> {
    if !(inputs.tau > 0.0 && inputs.tau.is_finite()) {
        return Err(OptimizationError::InvalidInput {
            message: format!("tau must be positive, got {}", inputs.tau),
        });
    }
    if !(inputs.risk_aversion > 0.0 && inputs.risk_aversion.is_finite()) {
        return Err(OptimizationError::InvalidInput {
            message: format!("risk aversion must be positive, got {}", inputs.risk_aversion),
        });
    }

    let w_mkt = market_weights(covariance, &inputs.market_caps)?;
    let prior = implied_returns(covariance, &w_mkt, inputs.risk_aversion);

    for view in &inputs.views {
        if !(0.0..=1.0).contains(&view.confidence) || !view.expected_return.is_finite() {
            return Err(OptimizationError::InvalidInput {
                message: format!("view {:?} has confidence outside [0, 1]", view.kind),
            });
        }
    }
    let active: Vec<&View> = inputs.views.iter().filter(|v| v.confidence > 0.0).collect();
    if active.is_empty() {
        return Ok(Posterior {
            posterior: prior.clone(),
            prior,
            views_used: 0,
        });
    }

    let n = covariance.dim();
    let k = active.len();
    let index = |symbol: &Symbol| {
        covariance
            .index_of(symbol)
            .ok_or_else(|| OptimizationError::InvalidInput {
                message: format!("view references unknown asset {symbol}"),
            })
    };

    let mut p = DMatrix::zeros(k, n);
    let mut q = DVector::zeros(k);
    for (row, view) in active.iter().enumerate() {
        match &view.kind {
            ViewKind::Absolute { symbol } => p[(row, index(symbol)?)] = 1.0,
            ViewKind::Relative { long, short } => {
                p[(row, index(long)?)] = 1.0;
                p[(row, index(short)?)] = -1.0;
            }
        }
        q[row] = view.expected_return;
    }

    let tau_sigma = &covariance.matrix * inputs.tau;
    let mut omega_inv = DMatrix::zeros(k, k);
    for (row, view) in active.iter().enumerate() {
        let p_k = p.row(row).transpose();
        let view_variance = (p_k.transpose() * &tau_sigma * &p_k)[(0, 0)];
        let confidence = view.confidence.min(MAX_VIEW_CONFIDENCE);
        let omega = (1.0 / confidence - 1.0) * view_variance;
        if omega <= 0.0 {
            return Err(OptimizationError::SingularMatrix {
                context: format!("view uncertainty for row {row}"),
            });
        }
        omega_inv[(row, row)] = 1.0 / omega;
    }

    let tau_sigma_inv = tau_sigma
        .try_inverse()
        .ok_or_else(|| OptimizationError::SingularMatrix {
            context: "(τΣ)⁻¹".into(),
        })?;
    let pt_omega_inv = p.transpose() * &omega_inv;
    let precision = &tau_sigma_inv + &pt_omega_inv * &p;
    let rhs = &tau_sigma_inv * &prior + &pt_omega_inv * &q;
    let posterior = precision
        .try_inverse()
        .ok_or_else(|| OptimizationError::SingularMatrix {
            context: "posterior precision".into(),
        })?
        * rhs;

    debug!(views = k, "black-litterman posterior computed");
    Ok(Posterior {
        prior,
        posterior,
        views_used: k,
    })
}
