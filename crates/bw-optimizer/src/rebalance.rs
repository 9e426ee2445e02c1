//! Drift between current and target allocations.

use serde::{Deserialize, Serialize};

use bw_types::market::Symbol;

use crate::model::AssetWeight;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceCheck {
    /// Largest absolute difference between a current and a target weight.
    pub max_deviation: f64,
    /// Asset with the largest deviation, if any asset is held or targeted.
    pub symbol: Option<Symbol>,
    pub threshold: f64,
    pub needs_rebalance: bool,
}

/// Compare current weights against targets. Assets missing on either side
/// count as weight zero on that side.
pub fn rebalance_drift(current: &[AssetWeight], target: &[AssetWeight], threshold: f64) -> RebalanceCheck {
    let lookup = |set: &[AssetWeight], symbol: &Symbol| {
        set.iter()
            .find(|w| &w.symbol == symbol)
            .map(|w| w.weight)
            .unwrap_or(0.0)
    };

    let mut worst: Option<(Symbol, f64)> = None;
    for symbol in current.iter().chain(target.iter()).map(|w| &w.symbol) {
        let deviation = (lookup(current, symbol) - lookup(target, symbol)).abs();
        if worst.as_ref().map_or(true, |(_, d)| deviation > *d) {
            worst = Some((symbol.clone(), deviation));
        }
    }

    let (symbol, max_deviation) = match worst {
        Some((s, d)) => (Some(s), d),
        None => (None, 0.0),
    };
    RebalanceCheck {
        max_deviation,
        symbol,
        threshold,
        needs_rebalance: max_deviation > threshold,
    }
}
