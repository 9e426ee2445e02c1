//! Risk monitor: periodic evaluation loop with limit checks and alert
//! emission.
//!
//! Each tick pulls a portfolio snapshot and price histories from the
//! collaborators, runs the CPU-bound evaluation on a blocking thread under a
//! timeout, compares the result against the configured limits and hands any
//! alerts to the [`AlertDispatcher`]. At most one evaluation runs at a time;
//! a tick that arrives while one is in flight is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bw_types::config_error;
use bw_types::errors::{BwResult, RiskError};
use bw_types::market::{PriceHistory, Symbol};
use bw_types::portfolio::Portfolio;

use crate::alerts::{Alert, LimitStatus, RiskSeverity, RiskState};
use crate::dispatcher::AlertDispatcher;
use crate::engine::{CycleReport, EvaluationContext, RiskEngine};
use crate::score::RiskLevel;
use crate::stats::SkippedAsset;

/// Errors surfaced by data collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("data source unavailable: {message}")]
    Unavailable { message: String },
    #[error("no data for {symbol}")]
    UnknownSymbol { symbol: String },
}

/// Source of price histories.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Up to `lookback` most recent prices for `symbol`, oldest first.
    async fn price_history(&self, symbol: &Symbol, lookback: usize) -> Result<PriceHistory, ProviderError>;
}

/// Source of the current book.
#[async_trait]
pub trait PortfolioProvider: Send + Sync {
    async fn snapshot(&self) -> Result<Portfolio, ProviderError>;
}

/// Configuration for the risk monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    /// A cycle running longer than this is abandoned and reported stale.
    pub cycle_timeout_ms: u64,
    /// Consecutive timeouts after which a critical system alert is raised.
    pub max_consecutive_timeouts: u32,
    /// Minimum gap between two alerts for the same limit. Zero disables
    /// suppression.
    pub alert_cooldown_secs: u64,
    /// Fraction of a limit at which a warning fires (e.g. 0.8). `None`
    /// disables early warnings.
    pub warning_ratio: Option<f64>,
    /// Used to annualise volatility.
    pub periods_per_year: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            cycle_timeout_ms: 10_000,
            max_consecutive_timeouts: 3,
            alert_cooldown_secs: 0,
            warning_ratio: None,
            periods_per_year: 252.0,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> BwResult<()> {
        if self.interval_ms == 0 {
            return Err(config_error!("monitor.interval_ms must be positive"));
        }
        if self.cycle_timeout_ms == 0 {
            return Err(config_error!("monitor.cycle_timeout_ms must be positive"));
        }
        if self.max_consecutive_timeouts == 0 {
            return Err(config_error!("monitor.max_consecutive_timeouts must be at least 1"));
        }
        if let Some(r) = self.warning_ratio {
            if !(r > 0.0 && r < 1.0) {
                return Err(config_error!("monitor.warning_ratio must be in (0, 1), got {r}"));
            }
        }
        if !(self.periods_per_year > 0.0 && self.periods_per_year.is_finite()) {
            return Err(config_error!("monitor.periods_per_year must be positive"));
        }
        Ok(())
    }
}

/// Lifecycle of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    Idle,
    Evaluating,
    Alerting,
    Stopped,
}

/// What happened on one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The previous evaluation was still running.
    Skipped,
    Completed {
        report: Box<CycleReport>,
        alerts: Vec<Alert>,
    },
    /// The cycle exceeded its timeout and was abandoned.
    Stale {
        cycle_id: Uuid,
        consecutive_timeouts: u32,
    },
    Failed {
        cycle_id: Uuid,
        error: String,
    },
}

/// Clears the in-flight flag when the cycle's work ends, wherever that is.
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic risk monitor.
pub struct RiskMonitor<M, P> {
    engine: Arc<RiskEngine>,
    market: Arc<M>,
    portfolio: Arc<P>,
    dispatcher: AlertDispatcher,
    state_tx: watch::Sender<MonitorState>,
    risk_state_tx: watch::Sender<RiskState>,
    risk_level_tx: watch::Sender<RiskLevel>,
    in_flight: Arc<AtomicBool>,
    consecutive_timeouts: u32,
    last_alerted: HashMap<String, DateTime<Utc>>,
    last_report: Option<CycleReport>,
}

impl<M, P> RiskMonitor<M, P>
where
    M: MarketDataProvider + 'static,
    P: PortfolioProvider + 'static,
{
    pub fn new(engine: Arc<RiskEngine>, market: Arc<M>, portfolio: Arc<P>, dispatcher: AlertDispatcher) -> Self {
        let (state_tx, _) = watch::channel(MonitorState::Idle);
        let (risk_state_tx, _) = watch::channel(RiskState::Normal);
        let (risk_level_tx, _) = watch::channel(RiskLevel::Low);
        Self {
            engine,
            market,
            portfolio,
            dispatcher,
            state_tx,
            risk_state_tx,
            risk_level_tx,
            in_flight: Arc::new(AtomicBool::new(false)),
            consecutive_timeouts: 0,
            last_alerted: HashMap::new(),
            last_report: None,
        }
    }

    pub fn dispatcher(&self) -> &AlertDispatcher {
        &self.dispatcher
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MonitorState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_risk_state(&self) -> watch::Receiver<RiskState> {
        self.risk_state_tx.subscribe()
    }

    pub fn risk_state(&self) -> RiskState {
        *self.risk_state_tx.borrow()
    }

    /// Level of the composite risk score from the last completed cycle.
    pub fn subscribe_risk_level(&self) -> watch::Receiver<RiskLevel> {
        self.risk_level_tx.subscribe()
    }

    pub fn risk_level(&self) -> RiskLevel {
        *self.risk_level_tx.borrow()
    }

    /// Most recent completed cycle.
    pub fn last_report(&self) -> Option<&CycleReport> {
        self.last_report.as_ref()
    }

    fn config(&self) -> &MonitorConfig {
        &self.engine.config().monitor
    }

    /// Evaluate on every interval tick until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config().interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.config().interval_ms, "risk monitor started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    // Shutdown abandons an in-flight cycle; dropping it cancels
                    // the cycle's token.
                    let outcome = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        outcome = self.tick() => outcome,
                    };
                    match outcome {
                        TickOutcome::Completed { alerts, .. } => {
                            debug!(alerts = alerts.len(), "tick complete");
                        }
                        TickOutcome::Stale { cycle_id, consecutive_timeouts } => {
                            warn!(%cycle_id, consecutive_timeouts, "tick produced stale result");
                        }
                        TickOutcome::Failed { cycle_id, error } => {
                            error!(%cycle_id, %error, "tick failed");
                        }
                        TickOutcome::Skipped => {}
                    }
                }
            }
        }

        self.state_tx.send_replace(MonitorState::Stopped);
        info!("risk monitor stopped");
    }

    /// Run a single evaluation cycle.
    pub async fn tick(&mut self) -> TickOutcome {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight) else {
            info!("previous evaluation still in flight; skipping tick");
            return TickOutcome::Skipped;
        };
        self.state_tx.send_replace(MonitorState::Evaluating);

        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let timeout = Duration::from_millis(self.config().cycle_timeout_ms);
        let cycle = Self::run_cycle(
            self.engine.clone(),
            self.market.clone(),
            self.portfolio.clone(),
            cancel.clone(),
            guard,
        );

        let outcome = match tokio::time::timeout(timeout, cycle).await {
            Ok(Ok(report)) => {
                self.consecutive_timeouts = 0;
                let alerts = self.handle_report(&report);
                self.last_report = Some(report.clone());
                TickOutcome::Completed {
                    report: Box::new(report),
                    alerts,
                }
            }
            Ok(Err((cycle_id, error))) => {
                self.consecutive_timeouts = 0;
                TickOutcome::Failed {
                    cycle_id,
                    error: error.to_string(),
                }
            }
            Err(_) => {
                cancel.cancel();
                self.handle_timeout(timeout)
            }
        };

        self.state_tx.send_replace(MonitorState::Idle);
        outcome
    }

    async fn run_cycle(
        engine: Arc<RiskEngine>,
        market: Arc<M>,
        portfolio: Arc<P>,
        cancel: CancellationToken,
        guard: InFlightGuard,
    ) -> Result<CycleReport, (Uuid, RiskError)> {
        let snapshot = portfolio.snapshot().await.map_err(|e| {
            (
                Uuid::nil(),
                RiskError::InvalidInput {
                    message: format!("portfolio snapshot: {e}"),
                },
            )
        })?;

        let lookback = engine.config().statistics.lookback;
        let mut histories = Vec::new();
        let mut missing = Vec::new();
        for symbol in RiskEngine::required_symbols(&snapshot) {
            match market.price_history(&symbol, lookback).await {
                Ok(history) => histories.push(history),
                Err(e) => {
                    warn!(%symbol, error = %e, "price history unavailable");
                    missing.push(SkippedAsset {
                        symbol,
                        reason: RiskError::InvalidInput { message: e.to_string() },
                    });
                }
            }
        }

        let benchmark = match &engine.config().benchmark {
            Some(symbol) => match market.price_history(symbol, lookback).await {
                Ok(history) => Some(history),
                Err(e) => {
                    warn!(%symbol, error = %e, "benchmark history unavailable");
                    None
                }
            },
            None => None,
        };

        let mut ctx = EvaluationContext::new(snapshot, histories, cancel);
        ctx.missing = missing;
        ctx.benchmark = benchmark;
        let cycle_id = ctx.cycle_id;
        debug!(%cycle_id, assets = ctx.histories.len(), "evaluation cycle started");

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            engine.evaluate_cycle(&ctx)
        })
        .await
        .map_err(|e| {
            (
                cycle_id,
                RiskError::InvalidInput {
                    message: format!("evaluation task failed: {e}"),
                },
            )
        })?
        .map_err(|e| (cycle_id, e))
    }

    fn handle_timeout(&mut self, timeout: Duration) -> TickOutcome {
        self.consecutive_timeouts += 1;
        let cycle_id = Uuid::new_v4();
        let max = self.config().max_consecutive_timeouts;
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            consecutive = self.consecutive_timeouts,
            "evaluation cycle timed out; result is stale"
        );
        if self.consecutive_timeouts >= max {
            let alert = Alert::repeated_timeouts(self.consecutive_timeouts, max, cycle_id);
            self.emit(vec![alert]);
        }
        TickOutcome::Stale {
            cycle_id,
            consecutive_timeouts: self.consecutive_timeouts,
        }
    }

    /// Compare the report against every limit, update the published risk
    /// state and dispatch the resulting alerts.
    fn handle_report(&mut self, report: &CycleReport) -> Vec<Alert> {
        let warning_ratio = self.config().warning_ratio;
        let mut alerts = Vec::new();
        for limit in &self.engine.config().limits {
            let Some(value) = report.metric_value(&limit.metric) else {
                debug!(metric = %limit.metric, "metric unavailable this cycle");
                continue;
            };
            match limit.status(value, warning_ratio) {
                LimitStatus::Breached => alerts.push(Alert::breach(limit, value, report.cycle_id)),
                LimitStatus::Approaching => alerts.push(Alert::approaching(limit, value, report.cycle_id)),
                LimitStatus::Within => {}
            }
        }

        let critical = alerts
            .iter()
            .any(|a| a.is_breach() && a.severity == RiskSeverity::Critical);
        let next = if critical {
            RiskState::ReduceExposure
        } else {
            RiskState::Normal
        };
        let changed = self.risk_state_tx.send_if_modified(|state| {
            if *state != next {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(state = ?next, "risk state changed");
        }
        let level = report.risk_score.level;
        if self.risk_level_tx.send_if_modified(|current| std::mem::replace(current, level) != level) {
            info!(?level, score = report.risk_score.score, "risk level changed");
        }

        self.emit(alerts)
    }

    /// Apply the cooldown and hand surviving alerts to the dispatcher.
    fn emit(&mut self, alerts: Vec<Alert>) -> Vec<Alert> {
        let cooldown = chrono::Duration::seconds(self.config().alert_cooldown_secs as i64);
        let now = Utc::now();
        let mut sent = Vec::with_capacity(alerts.len());
        for alert in alerts {
            let key = alert.key();
            if let Some(last) = self.last_alerted.get(&key) {
                if now - *last < cooldown {
                    debug!(%key, "alert suppressed by cooldown");
                    continue;
                }
            }
            self.last_alerted.insert(key, now);
            sent.push(alert);
        }
        if !sent.is_empty() {
            self.state_tx.send_replace(MonitorState::Alerting);
            for alert in &sent {
                self.dispatcher.dispatch(alert);
            }
        }
        sent
    }
}
