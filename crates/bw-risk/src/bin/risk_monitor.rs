//! Standalone risk monitor.
//!
//! Reads the engine configuration from a TOML file and the book plus price
//! histories from a JSON snapshot file that is re-read on every cycle, so an
//! external process can keep it current. Alerts go to the log.
//!
//! ```text
//! bw-risk-monitor [config.toml] [snapshot.json]
//! ```
//!
//! Paths fall back to `BULWARK_CONFIG` / `BULWARK_SNAPSHOT`. The snapshot
//! holds `{"portfolio": {..., "positions": [...]}, "histories": {"SPY": [...]}}`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bw_risk::{
    AlertDispatcher, LogChannel, MarketDataProvider, PortfolioProvider, ProviderError, RiskEngine, RiskEngineConfig,
    RiskMonitor,
};
use bw_types::market::{PriceHistory, Symbol};
use bw_types::portfolio::Portfolio;

#[derive(Debug, Deserialize)]
struct Snapshot {
    portfolio: Portfolio,
    /// Prices keyed by ticker, oldest first.
    histories: HashMap<String, Vec<f64>>,
}

struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    async fn load(&self) -> Result<Snapshot, ProviderError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ProviderError::Unavailable {
                message: format!("{}: {e}", self.path.display()),
            })?;
        serde_json::from_str(&raw).map_err(|e| ProviderError::Unavailable {
            message: format!("{}: {e}", self.path.display()),
        })
    }
}

#[async_trait]
impl MarketDataProvider for SnapshotFile {
    async fn price_history(&self, symbol: &Symbol, lookback: usize) -> Result<PriceHistory, ProviderError> {
        let mut snapshot = self.load().await?;
        let prices = snapshot
            .histories
            .remove(symbol.ticker())
            .ok_or_else(|| ProviderError::UnknownSymbol {
                symbol: symbol.ticker().to_string(),
            })?;
        let start = prices.len().saturating_sub(lookback);
        Ok(PriceHistory::new(symbol.clone(), prices[start..].to_vec()))
    }
}

#[async_trait]
impl PortfolioProvider for SnapshotFile {
    async fn snapshot(&self) -> Result<Portfolio, ProviderError> {
        Ok(self.load().await?.portfolio)
    }
}

fn path_arg(position: usize, env_key: &str) -> anyhow::Result<PathBuf> {
    std::env::args()
        .nth(position)
        .or_else(|| std::env::var(env_key).ok())
        .map(PathBuf::from)
        .with_context(|| format!("missing path: pass it as argument {position} or set {env_key}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = path_arg(1, "BULWARK_CONFIG")?;
    let snapshot_path = path_arg(2, "BULWARK_SNAPSHOT")?;

    let config = RiskEngineConfig::from_path(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let engine = Arc::new(RiskEngine::new(config)?);

    let source = Arc::new(SnapshotFile { path: snapshot_path });
    let dispatcher = AlertDispatcher::new();
    dispatcher.register(Arc::new(LogChannel));

    let monitor = RiskMonitor::new(engine, source.clone(), source, dispatcher);
    let mut risk_state = monitor.subscribe_risk_state();

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        ctrl_c.cancel();
    });

    let watcher = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = watcher.cancelled() => break,
                changed = risk_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    warn!(state = ?*risk_state.borrow(), "risk state changed");
                }
            }
        }
    });

    info!("risk monitor started");
    monitor.run(shutdown).await;
    info!("risk monitor stopped");
    Ok(())
}
