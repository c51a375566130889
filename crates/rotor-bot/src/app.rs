//! Main application orchestration.
//!
//! Owns the broker facade and drives it from the external signal feed:
//! poll for new signals, act on the most recent one through the
//! rotation helper, persist the resulting trades and an equity sample,
//! repeat until shutdown.

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::signals::SignalFeed;
use rotor_broker::{build_broker, Broker, Rotator};
use rotor_core::StrategySignal;
use rotor_persistence::{EquityCurveLog, TradeHistoryLog};
use std::path::Path;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Main application.
pub struct Application {
    config: AppConfig,
    broker: Box<dyn Broker>,
    rotator: Rotator,
    feed: SignalFeed,
    trade_log: TradeHistoryLog,
    equity_log: EquityCurveLog,
}

impl Application {
    /// Assemble the application from configuration. Nothing connects
    /// until [`run`](Self::run).
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let broker = build_broker(
            config.broker.clone(),
            config.connection.clone(),
            config.risk.clone(),
            config.executor.clone(),
        );
        let rotator = Rotator::new(config.rotation.clone());
        let feed = SignalFeed::new(&config.signal_file);

        let data_dir = Path::new(&config.data_dir);
        let trade_log = TradeHistoryLog::open(data_dir);
        let equity_log = EquityCurveLog::open(data_dir);

        Ok(Self {
            config,
            broker,
            rotator,
            feed,
            trade_log,
            equity_log,
        })
    }

    /// Connect and run the signal loop until Ctrl-C.
    pub async fn run(mut self) -> AppResult<()> {
        info!(kind = ?self.config.broker.kind, "Connecting broker");
        self.broker.connect().await?;

        let mut poll = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            signal_file = %self.config.signal_file,
            poll_interval_ms = self.config.poll_interval_ms,
            "Entering signal loop"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Cycle failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// One poll cycle: drain the feed, act on the latest signal, then
    /// sample equity.
    async fn run_cycle(&mut self) -> AppResult<()> {
        let signals = self.feed.poll()?;
        let stale = signals.len().saturating_sub(1);
        if stale > 0 {
            debug!(stale, "Acting on the latest signal only");
        }
        if let Some(latest) = signals.last() {
            self.act_on(latest).await?;
        }
        self.sample_equity()
    }

    async fn act_on(&mut self, signal: &StrategySignal) -> AppResult<()> {
        let current = self.rotator.current_holding(self.broker.as_ref());
        let target = self.rotator.config().target_for(signal.signal, &current);
        info!(
            signal = %signal.signal,
            holding = %current,
            target = %target,
            rationale = %signal.rationale,
            "Processing signal"
        );

        let outcome = self
            .rotator
            .rotate_to(self.broker.as_ref(), &target, &signal.rationale)
            .await?;

        for leg in outcome.legs {
            self.trade_log.append(leg)?;
        }
        if outcome.changed {
            info!(holding = %outcome.holding, "Rotation complete");
        }
        if outcome.holding != target {
            warn!(
                holding = %outcome.holding,
                target = %target,
                "Holding does not match target after rotation"
            );
        }
        Ok(())
    }

    fn sample_equity(&mut self) -> AppResult<()> {
        let point = self.broker.record_equity();
        self.equity_log.append(point)?;
        self.equity_log.flush()?;
        Ok(())
    }

    async fn shutdown(mut self) -> AppResult<()> {
        let report = self.broker.performance_metrics();
        info!(
            total_return_pct = report.total_return_pct,
            sharpe_ratio = report.sharpe_ratio,
            max_drawdown_pct = report.max_drawdown_pct,
            win_rate_pct = report.win_rate_pct,
            profit_factor = report.profit_factor,
            trade_count = report.trade_count,
            "Session performance"
        );

        self.broker.disconnect().await?;
        self.trade_log.close()?;
        self.equity_log.close()?;
        info!("Shutdown complete");
        Ok(())
    }
}

// ============================================================================
//                                    Tests
// ============================================================================
