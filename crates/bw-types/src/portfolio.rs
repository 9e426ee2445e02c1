use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::PortfolioError;
use crate::market::Symbol;

/// Tolerance used when checking that weights add up to one.
pub const WEIGHT_TOLERANCE: f64 = 1e-9;

/// A holding in a single symbol. Quantity is signed: negative means short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub market_price: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    pub fn new(symbol: Symbol, quantity: Decimal, entry_price: Decimal) -> Self {
        Self {
            symbol,
            quantity,
            entry_price,
            market_price: entry_price,
            last_updated: Utc::now(),
        }
    }

    pub fn with_market_price(mut self, market_price: Decimal) -> Self {
        self.market_price = market_price;
        self
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == Decimal::ZERO
    }

    /// Signed market value (negative for shorts).
    pub fn market_value(&self) -> Decimal {
        self.quantity * self.market_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        (self.market_price - self.entry_price) * self.quantity
    }
}

/// Read-only snapshot of the book handed to the engine each evaluation cycle.
///
/// Positions are keyed by symbol, so a symbol appears at most once. The
/// ordered map gives every component the same asset ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub account_id: String,
    pub cash: Decimal,
    /// Serialized as a list, since symbols are not string keys.
    #[serde(with = "position_list")]
    pub positions: BTreeMap<Symbol, Position>,
    pub as_of: DateTime<Utc>,
}

impl Portfolio {
    pub fn new(account_id: String, cash: Decimal) -> Self {
        Self {
            account_id,
            cash,
            positions: BTreeMap::new(),
            as_of: Utc::now(),
        }
    }

    /// Add a position, rejecting a second entry for the same symbol.
    pub fn add_position(&mut self, position: Position) -> Result<(), PortfolioError> {
        if self.positions.contains_key(&position.symbol) {
            return Err(PortfolioError::DuplicatePosition {
                symbol: position.symbol.to_string(),
            });
        }
        self.positions.insert(position.symbol.clone(), position);
        Ok(())
    }

    /// Builder-style variant of [`Portfolio::add_position`].
    pub fn with_position(mut self, position: Position) -> Result<Self, PortfolioError> {
        self.add_position(position)?;
        Ok(self)
    }

    pub fn get_position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.positions.keys().cloned().collect()
    }

    pub fn market_value(&self) -> Decimal {
        self.positions.values().map(Position::market_value).sum()
    }

    /// Cash plus the signed market value of every position.
    pub fn total_value(&self) -> Decimal {
        self.cash + self.market_value()
    }

    fn checked_total(&self) -> Result<Decimal, PortfolioError> {
        let total = self.total_value();
        if total <= Decimal::ZERO {
            return Err(PortfolioError::NonPositiveValue { total });
        }
        Ok(total)
    }

    /// Weight of one position as market value / portfolio value.
    pub fn weight(&self, symbol: &Symbol) -> Result<f64, PortfolioError> {
        let total = self.checked_total()?;
        let value = self
            .positions
            .get(symbol)
            .map(Position::market_value)
            .unwrap_or(Decimal::ZERO);
        Ok((value / total).to_f64().unwrap_or(0.0))
    }

    /// Weights of every position, in symbol order.
    pub fn weights(&self) -> Result<BTreeMap<Symbol, f64>, PortfolioError> {
        let total = self.checked_total()?;
        Ok(self
            .positions
            .iter()
            .map(|(symbol, pos)| {
                let w = (pos.market_value() / total).to_f64().unwrap_or(0.0);
                (symbol.clone(), w)
            })
            .collect())
    }

    pub fn cash_weight(&self) -> Result<f64, PortfolioError> {
        let total = self.checked_total()?;
        Ok((self.cash / total).to_f64().unwrap_or(0.0))
    }

    /// Sum of absolute position weights.
    pub fn gross_exposure(&self) -> Result<f64, PortfolioError> {
        Ok(self.weights()?.values().map(|w| w.abs()).sum())
    }

    /// Verify that position weights and the cash weight add up to one.
    pub fn check_weight_invariant(&self) -> Result<(), PortfolioError> {
        let sum: f64 = self.weights()?.values().sum::<f64>() + self.cash_weight()?;
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(PortfolioError::StateInconsistency {
                message: format!("weights sum to {sum}, expected 1"),
            });
        }
        Ok(())
    }
}

mod position_list {
    use std::collections::BTreeMap;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Position;
    use crate::market::Symbol;

    pub fn serialize<S: Serializer>(positions: &BTreeMap<Symbol, Position>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(positions.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<Symbol, Position>, D::Error> {
        let mut positions = BTreeMap::new();
        for position in Vec::<Position>::deserialize(deserializer)? {
            let symbol = position.symbol.clone();
            if positions.insert(symbol.clone(), position).is_some() {
                return Err(D::Error::custom(format!("duplicate position for {symbol}")));
            }
        }
        Ok(positions)
    }
}
