//! Symbol-indexed covariance matrix shared by the risk and optimizer crates.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::errors::RiskError;
use crate::market::Symbol;

/// Square, symmetric, positive-semidefinite covariance matrix whose rows and
/// columns follow `symbols`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceMatrix {
    pub symbols: Vec<Symbol>,
    pub matrix: DMatrix<f64>,
    /// True when diagonal shrinkage was applied because the sample estimate
    /// was singular or ill-conditioned.
    pub regularized: bool,
}

impl CovarianceMatrix {
    pub fn new(symbols: Vec<Symbol>, matrix: DMatrix<f64>) -> Result<Self, RiskError> {
        if matrix.nrows() != matrix.ncols() || matrix.nrows() != symbols.len() {
            return Err(RiskError::InvalidInput {
                message: format!(
                    "covariance is {}x{} for {} symbols",
                    matrix.nrows(),
                    matrix.ncols(),
                    symbols.len()
                ),
            });
        }
        Ok(Self {
            symbols,
            matrix,
            regularized: false,
        })
    }

    pub fn dim(&self) -> usize {
        self.symbols.len()
    }

    pub fn index_of(&self, symbol: &Symbol) -> Option<usize> {
        self.symbols.iter().position(|s| s == symbol)
    }

    pub fn get(&self, row: &Symbol, col: &Symbol) -> Option<f64> {
        Some(self.matrix[(self.index_of(row)?, self.index_of(col)?)])
    }

    pub fn variances(&self) -> DVector<f64> {
        self.matrix.diagonal()
    }

    /// Portfolio variance `wᵀΣw`.
    pub fn quadratic_form(&self, weights: &DVector<f64>) -> f64 {
        (weights.transpose() * &self.matrix * weights)[(0, 0)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_dimensions() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let err = CovarianceMatrix::new(vec![Symbol::equity("A")], m).unwrap_err();
        assert!(matches!(err, RiskError::InvalidInput { .. }));
    }

    #[test]
    fn lookup_and_quadratic_form() {
        let a = Symbol::equity("A");
        let b = Symbol::equity("B");
        let m = DMatrix::from_row_slice(2, 2, &[0.04, 0.01, 0.01, 0.09]);
        let cov = CovarianceMatrix::new(vec![a.clone(), b.clone()], m).unwrap();
        assert_eq!(cov.get(&a, &b), Some(0.01));
        assert_eq!(cov.variances().as_slice(), &[0.04, 0.09]);
        let w = DVector::from_vec(vec![0.5, 0.5]);
        // 0.25*0.04 + 0.25*0.09 + 2*0.25*0.01
        assert!((cov.quadratic_form(&w) - 0.0375).abs() < 1e-12);
    }
}
