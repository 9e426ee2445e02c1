use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a financial symbol with exchange information
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub symbol: String,
    pub exchange: String,
    pub asset_class: AssetClass,
}

impl Symbol {
    pub fn new(symbol: &str, exchange: &str, asset_class: AssetClass) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            asset_class,
        }
    }

    pub fn equity(symbol: &str) -> Self {
        Self::new(symbol, AssetClass::Equity.default_exchange(), AssetClass::Equity)
    }

    pub fn crypto(symbol: &str) -> Self {
        Self::new(symbol, AssetClass::Crypto.default_exchange(), AssetClass::Crypto)
    }

    pub fn ticker(&self) -> &str {
        &self.symbol
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// Asset classes a position can belong to. Stress scenarios may shock a whole
/// class at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AssetClass {
    Equity,
    Crypto,
    Forex,
    Commodity,
    Bond,
}

impl AssetClass {
    /// Default exchange identifier for this asset class.
    pub fn default_exchange(&self) -> &'static str {
        match self {
            AssetClass::Equity => "NASDAQ",
            AssetClass::Crypto => "BINANCE",
            AssetClass::Forex => "FOREX",
            AssetClass::Commodity => "CME",
            AssetClass::Bond => "NYSE",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetClass::Equity => "Equity",
            AssetClass::Crypto => "Crypto",
            AssetClass::Forex => "Forex",
            AssetClass::Commodity => "Commodity",
            AssetClass::Bond => "Bond",
        };
        write!(f, "{}", s)
    }
}

/// Chronological close prices for one symbol at a fixed periodicity, as
/// delivered by the market-data collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistory {
    pub symbol: Symbol,
    /// Oldest first.
    pub prices: Vec<f64>,
    pub as_of: DateTime<Utc>,
}

impl PriceHistory {
    pub fn new(symbol: Symbol, prices: Vec<f64>) -> Self {
        Self {
            symbol,
            prices,
            as_of: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.prices.last().copied()
    }

    /// The most recent `window` prices (or all of them when fewer exist).
    pub fn tail(&self, window: usize) -> &[f64] {
        let start = self.prices.len().saturating_sub(window);
        &self.prices[start..]
    }
}

/// Ordered period returns of a single symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnSeries {
    pub symbol: Symbol,
    /// Oldest first.
    pub returns: Vec<f64>,
}

impl ReturnSeries {
    pub fn new(symbol: Symbol, returns: Vec<f64>) -> Self {
        Self { symbol, returns }
    }

    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }

    /// A series is usable only once it spans the configured minimum window.
    pub fn is_sufficient(&self, min_observations: usize) -> bool {
        self.returns.len() >= min_observations
    }

    pub fn mean(&self) -> f64 {
        if self.returns.is_empty() {
            return 0.0;
        }
        self.returns.iter().sum::<f64>() / self.returns.len() as f64
    }

    /// Most recent `len` observations.
    pub fn tail(&self, len: usize) -> &[f64] {
        let start = self.returns.len().saturating_sub(len);
        &self.returns[start..]
    }
}
