//! Single-instrument strategy execution.
//!
//! Mirrors the multileg engine's registry pattern: the active set holds every
//! strategy currently under evaluation, at most one run per id. A run stays
//! alive while the strategy is active, re-evaluating entry and exit
//! conditions each pass; removal from the set (stop, or an external status
//! change spotted by the monitor tick) ends it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::{
    ActiveSet, EventType, OrderRequest, OrderSide, Position, Quote, Strategy, StrategyStatus,
};
use crate::execution::EngineError;
use crate::services::OrderService;
use crate::store::StrategyRepository;
use crate::transport::SharedEventBus;

/// Cadence of the registry-consistency monitor.
const MONITOR_TICK: Duration = Duration::from_secs(5);

pub struct StrategyEngine {
    strategies: Arc<dyn StrategyRepository>,
    orders: Arc<OrderService>,
    bus: SharedEventBus,
    active: ActiveSet,
    /// Delay between evaluation passes of a running strategy.
    eval_interval: Duration,
}

impl StrategyEngine {
    pub fn new(
        strategies: Arc<dyn StrategyRepository>,
        orders: Arc<OrderService>,
        bus: SharedEventBus,
    ) -> Self {
        Self::with_eval_interval(strategies, orders, bus, Duration::from_secs(5))
    }

    pub fn with_eval_interval(
        strategies: Arc<dyn StrategyRepository>,
        orders: Arc<OrderService>,
        bus: SharedEventBus,
        eval_interval: Duration,
    ) -> Self {
        Self {
            strategies,
            orders,
            bus,
            active: ActiveSet::new(),
            eval_interval,
        }
    }

    pub fn active_strategies(&self) -> &ActiveSet {
        &self.active
    }

    /// Starts a strategy run. Draft and paused strategies transition to
    /// active; a stopped strategy cannot be executed again. At most one run
    /// per id: a second call while the first is alive gets
    /// `AlreadyExecuting`.
    pub async fn execute_strategy(self: &Arc<Self>, strategy_id: &str) -> Result<(), EngineError> {
        let mut strategy = self
            .strategies
            .get(strategy_id)
            .await
            .context("loading strategy")?;
        match strategy.status {
            StrategyStatus::Active => {}
            StrategyStatus::Draft | StrategyStatus::Paused => {
                strategy.status = StrategyStatus::Active;
            }
            StrategyStatus::Stopped => {
                return Err(EngineError::NotActive(strategy_id.to_string()));
            }
        }

        if !self.active.try_acquire(strategy_id) {
            return Err(EngineError::AlreadyExecuting(strategy_id.to_string()));
        }

        strategy.last_executed_at = Some(Utc::now());
        strategy.updated_at = Utc::now();
        if let Err(e) = self.strategies.update(&strategy).await {
            self.active.release(strategy_id);
            return Err(EngineError::Other(e));
        }

        info!(strategy_id = %strategy_id, name = %strategy.name, "strategy execution started");
        self.bus
            .publish_strategy_event(
                EventType::StrategyExecution,
                serde_json::json!({"strategy_id": strategy_id, "phase": "started"}),
            )
            .await;

        let engine = Arc::clone(self);
        let id = strategy_id.to_string();
        tokio::spawn(async move {
            engine.evaluation_loop(&id).await;
            engine.active.release(&id);
            engine
                .bus
                .publish_strategy_event(
                    EventType::StrategyExecution,
                    serde_json::json!({"strategy_id": id, "phase": "finished"}),
                )
                .await;
        });
        Ok(())
    }

    /// Stops an active or paused strategy and ends its run. Stopping a
    /// strategy in any other state is an error, distinguishable from a
    /// genuine failure.
    pub async fn stop_strategy(&self, strategy_id: &str) -> Result<(), EngineError> {
        let mut strategy = self
            .strategies
            .get(strategy_id)
            .await
            .context("loading strategy")?;
        if !matches!(
            strategy.status,
            StrategyStatus::Active | StrategyStatus::Paused
        ) {
            return Err(EngineError::NotActive(strategy_id.to_string()));
        }
        strategy.status = StrategyStatus::Stopped;
        strategy.updated_at = Utc::now();
        self.strategies
            .update(&strategy)
            .await
            .context("persisting stopped strategy")?;
        self.active.release(strategy_id);
        info!(strategy_id = %strategy_id, "strategy stopped");
        Ok(())
    }

    /// Repeated evaluation until the registry entry disappears or the
    /// persisted status moves away from active.
    async fn evaluation_loop(&self, strategy_id: &str) {
        loop {
            if !self.active.contains(strategy_id) {
                return;
            }
            let strategy = match self.strategies.get(strategy_id).await {
                Ok(strategy) => strategy,
                Err(e) => {
                    warn!(strategy_id = %strategy_id, error = %e, "strategy vanished mid-run");
                    return;
                }
            };
            if strategy.status != StrategyStatus::Active {
                debug!(strategy_id = %strategy_id, status = ?strategy.status, "run ending, no longer active");
                return;
            }
            if let Err(e) = self.evaluate_once(&strategy).await {
                debug!(strategy_id = %strategy_id, error = %e, "evaluation pass failed");
            }
            tokio::time::sleep(self.eval_interval).await;
        }
    }

    /// One evaluation pass: entries for flat instruments, exits for open
    /// positions.
    pub async fn evaluate_once(&self, strategy: &Strategy) -> Result<(), EngineError> {
        let positions = self.strategy_positions(strategy).await?;
        for symbol in &strategy.instruments {
            let quote = self
                .orders
                .get_quote(&strategy.broker, symbol, &strategy.exchange)
                .await
                .context("quoting instrument")?;
            let open = positions
                .iter()
                .find(|p| &p.symbol == symbol && p.quantity != 0);
            match open {
                None => self.evaluate_entry(strategy, symbol, &quote).await,
                Some(position) => self.evaluate_exit(strategy, position, &quote).await,
            }
        }
        Ok(())
    }

    async fn evaluate_entry(&self, strategy: &Strategy, symbol: &str, quote: &Quote) {
        if strategy.entry_conditions.is_empty()
            || !strategy.entry_conditions.iter().all(|c| c.evaluate(quote))
        {
            return;
        }
        info!(
            strategy_id = %strategy.id,
            symbol = %symbol,
            last_price = quote.last_price,
            "entry conditions met"
        );
        self.bus
            .publish_strategy_event(
                EventType::StrategySignal,
                serde_json::json!({
                    "strategy_id": strategy.id,
                    "symbol": symbol,
                    "signal": "entry",
                    "last_price": quote.last_price,
                }),
            )
            .await;
        let request = OrderRequest::market(symbol, &strategy.exchange, OrderSide::Buy, strategy.quantity);
        self.submit(strategy, request).await;
    }

    async fn evaluate_exit(&self, strategy: &Strategy, position: &Position, quote: &Quote) {
        if strategy.exit_conditions.is_empty()
            || !strategy.exit_conditions.iter().all(|c| c.evaluate(quote))
        {
            return;
        }
        info!(
            strategy_id = %strategy.id,
            symbol = %position.symbol,
            quantity = position.quantity,
            "exit conditions met"
        );
        self.bus
            .publish_strategy_event(
                EventType::StrategySignal,
                serde_json::json!({
                    "strategy_id": strategy.id,
                    "symbol": position.symbol,
                    "signal": "exit",
                    "last_price": quote.last_price,
                }),
            )
            .await;
        let side = if position.quantity > 0 {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let request = OrderRequest::market(
            &position.symbol,
            &strategy.exchange,
            side,
            position.quantity.abs(),
        );
        self.submit(strategy, request).await;
    }

    async fn submit(&self, strategy: &Strategy, request: OrderRequest) {
        match self
            .orders
            .place_order(&strategy.broker, &strategy.user_id, &request, Some(&strategy.id), None)
            .await
        {
            Ok(response) if response.success => {}
            Ok(response) => {
                warn!(
                    strategy_id = %strategy.id,
                    symbol = %request.symbol,
                    message = %response.message,
                    "strategy order rejected"
                );
            }
            Err(e) => {
                warn!(strategy_id = %strategy.id, symbol = %request.symbol, error = %e, "strategy order failed");
            }
        }
    }

    /// Venue positions restricted to this strategy's instruments.
    pub(crate) async fn strategy_positions(
        &self,
        strategy: &Strategy,
    ) -> Result<Vec<Position>, EngineError> {
        let positions = self
            .orders
            .get_positions(&strategy.broker)
            .await
            .context("querying venue positions")?;
        Ok(positions
            .into_iter()
            .filter(|p| strategy.instruments.iter().any(|s| s == &p.symbol))
            .collect())
    }

    /// One consistency pass: a registry entry whose persisted status moved
    /// away from active is force-stopped.
    pub async fn monitor_tick(&self) {
        for strategy_id in self.active.snapshot() {
            match self.strategies.get(&strategy_id).await {
                Ok(strategy) if strategy.status == StrategyStatus::Active => {}
                Ok(strategy) => {
                    warn!(
                        strategy_id = %strategy_id,
                        status = ?strategy.status,
                        "status changed externally, force-stopping run"
                    );
                    self.active.release(&strategy_id);
                }
                Err(e) => {
                    warn!(strategy_id = %strategy_id, error = %e, "force-stopping unloadable strategy");
                    self.active.release(&strategy_id);
                }
            }
        }
    }

    /// 5-second consistency sweep until shutdown.
    pub async fn run_monitor(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(MONITOR_TICK);
        info!("strategy registry monitor running");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.monitor_tick().await,
                _ = shutdown.recv() => {
                    info!("strategy registry monitor shutting down");
                    return;
                }
            }
        }
    }
}
