//! # bw-optimizer
//!
//! Portfolio allocation for Bulwark.
//!
//! Provides weight constraints, a Markowitz minimum-variance solver with an
//! optional target-return floor, Black-Litterman posterior returns, and
//! allocation drift checks.

mod black_litterman;
mod constraints;
mod markowitz;
mod model;
mod rebalance;

pub use black_litterman::{
    implied_returns, market_weights, posterior_returns, BlackLittermanInputs, MarketCap,
    Posterior, View, ViewKind,
};
pub use constraints::WeightConstraints;
pub use model::{AssetWeight, ModelKind, OptimizationResult, OptimizerModel, PortfolioOptimizer};
pub use rebalance::{rebalance_drift, RebalanceCheck};
