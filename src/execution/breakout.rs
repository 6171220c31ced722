//! Range-breakout trigger.
//!
//! Watches the configured instrument for each monitored strategy and fires
//! the execution engine when the price leaves the configured band. The
//! trigger is one-shot: a fired strategy leaves the monitored set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::ActiveSet;
use crate::services::OrderService;
use crate::store::MultilegRepository;

use super::{EngineError, MultilegEngine};

const TICK: Duration = Duration::from_secs(1);

pub struct RangeBreakoutMonitor {
    strategies: Arc<dyn MultilegRepository>,
    engine: Arc<MultilegEngine>,
    orders: Arc<OrderService>,
    monitored: ActiveSet,
    /// Consecutive breaching ticks seen per strategy.
    streaks: DashMap<String, u32>,
}

impl RangeBreakoutMonitor {
    pub fn new(
        strategies: Arc<dyn MultilegRepository>,
        engine: Arc<MultilegEngine>,
        orders: Arc<OrderService>,
    ) -> Self {
        Self {
            strategies,
            engine,
            orders,
            monitored: ActiveSet::new(),
            streaks: DashMap::new(),
        }
    }

    pub fn monitored(&self) -> &ActiveSet {
        &self.monitored
    }

    /// Starts watching a strategy. Only strategies with range-breakout
    /// configuration enabled are eligible; watching an already-watched
    /// strategy is a no-op.
    pub async fn monitor_strategy(&self, strategy_id: &str) -> Result<(), EngineError> {
        let strategy = self
            .strategies
            .get(strategy_id)
            .await
            .context("loading multileg strategy")?;
        if !strategy.execution_params.range_breakout.enabled {
            return Err(EngineError::NotEnabled("range breakout"));
        }
        if self.monitored.try_acquire(strategy_id) {
            info!(strategy_id = %strategy_id, "range-breakout monitoring started");
        }
        Ok(())
    }

    pub fn stop_monitoring_strategy(&self, strategy_id: &str) {
        if self.monitored.release(strategy_id) {
            self.streaks.remove(strategy_id);
            info!(strategy_id = %strategy_id, "range-breakout monitoring stopped");
        }
    }

    /// One evaluation pass over a snapshot of the monitored set.
    pub async fn tick(&self) {
        for strategy_id in self.monitored.snapshot() {
            if let Err(e) = self.evaluate(&strategy_id).await {
                debug!(strategy_id = %strategy_id, error = %e, "breakout evaluation skipped");
            }
        }
    }

    async fn evaluate(&self, strategy_id: &str) -> Result<(), EngineError> {
        let strategy = self
            .strategies
            .get(strategy_id)
            .await
            .context("loading multileg strategy")?;
        let breakout = &strategy.execution_params.range_breakout;
        let quote = self
            .orders
            .get_quote(&strategy.broker, &breakout.symbol, &breakout.exchange)
            .await
            .context("quoting breakout instrument")?;

        let breached =
            quote.last_price > breakout.upper_bound || quote.last_price < breakout.lower_bound;
        if !breached {
            self.streaks.insert(strategy_id.to_string(), 0);
            return Ok(());
        }

        let streak = {
            let mut entry = self.streaks.entry(strategy_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        debug!(
            strategy_id = %strategy_id,
            last_price = quote.last_price,
            streak,
            "breakout condition breached"
        );
        if streak < breakout.confirmation.max(1) {
            return Ok(());
        }

        // Confirmed: fire once and stop watching.
        self.stop_monitoring_strategy(strategy_id);
        info!(
            strategy_id = %strategy_id,
            last_price = quote.last_price,
            "range breakout confirmed, triggering execution"
        );
        match self.engine.execute_strategy(strategy_id).await {
            Ok(()) => Ok(()),
            Err(EngineError::AlreadyExecuting(_)) => {
                debug!(strategy_id = %strategy_id, "strategy already executing at breakout");
                Ok(())
            }
            Err(e) => {
                warn!(strategy_id = %strategy_id, error = %e, "breakout trigger failed");
                Err(e)
            }
        }
    }

    /// 1-second sweep until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(TICK);
        info!("range-breakout monitor running");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.recv() => {
                    info!("range-breakout monitor shutting down");
                    return;
                }
            }
        }
    }
}
