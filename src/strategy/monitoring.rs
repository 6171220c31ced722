//! Risk monitoring over the set of strategies flagged for it.
//!
//! Three independent sweeps: stop-loss and take-profit watch per-position
//! P&L and flatten breaching positions; the risk-parameter sweep watches
//! aggregate strategy P&L and is the one path with authority to halt
//! execution. Every sweep iterates a snapshot, never the live set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::core::{ActiveSet, EventType, OrderRequest, OrderSide, Strategy, StrategyStatus};
use crate::execution::EngineError;
use crate::services::OrderService;
use crate::store::StrategyRepository;
use crate::transport::SharedEventBus;

use super::StrategyEngine;

const STOP_LOSS_TICK: Duration = Duration::from_secs(5);
const TAKE_PROFIT_TICK: Duration = Duration::from_secs(5);
const RISK_TICK: Duration = Duration::from_secs(30);

pub struct MonitoringService {
    strategies: Arc<dyn StrategyRepository>,
    orders: Arc<OrderService>,
    engine: Arc<StrategyEngine>,
    bus: SharedEventBus,
    monitored: ActiveSet,
}

impl MonitoringService {
    pub fn new(
        strategies: Arc<dyn StrategyRepository>,
        orders: Arc<OrderService>,
        engine: Arc<StrategyEngine>,
        bus: SharedEventBus,
    ) -> Self {
        Self {
            strategies,
            orders,
            engine,
            bus,
            monitored: ActiveSet::new(),
        }
    }

    pub fn monitored(&self) -> &ActiveSet {
        &self.monitored
    }

    /// Flags a strategy for monitoring. Monitoring an already-monitored
    /// strategy is a no-op.
    pub async fn monitor_strategy(&self, strategy_id: &str) -> Result<(), EngineError> {
        self.strategies
            .get(strategy_id)
            .await
            .context("loading strategy")?;
        if self.monitored.try_acquire(strategy_id) {
            info!(strategy_id = %strategy_id, "risk monitoring started");
        }
        Ok(())
    }

    pub fn stop_monitoring_strategy(&self, strategy_id: &str) {
        if self.monitored.release(strategy_id) {
            info!(strategy_id = %strategy_id, "risk monitoring stopped");
        }
    }

    /// Loads a monitored strategy if it is still active. Inactive strategies
    /// are skipped without side effects.
    async fn active_strategy(&self, strategy_id: &str) -> Option<Strategy> {
        match self.strategies.get(strategy_id).await {
            Ok(strategy) if strategy.status == StrategyStatus::Active => Some(strategy),
            Ok(_) => None,
            Err(e) => {
                debug!(strategy_id = %strategy_id, error = %e, "monitored strategy not loadable");
                None
            }
        }
    }

    /// Stop-loss sweep: flatten any position that has given back more than
    /// the configured percentage.
    pub async fn sweep_stop_loss(&self) {
        for strategy_id in self.monitored.snapshot() {
            let Some(strategy) = self.active_strategy(&strategy_id).await else {
                continue;
            };
            let limit = strategy.risk_parameters.trailing_stop_percent;
            if limit <= 0.0 {
                continue;
            }
            for position in self.positions(&strategy).await {
                if position.pnl_percent() <= -limit {
                    info!(
                        strategy_id = %strategy_id,
                        symbol = %position.symbol,
                        pnl_percent = position.pnl_percent(),
                        "stop-loss breached, flattening position"
                    );
                    self.flatten(&strategy, &position.symbol, position.quantity)
                        .await;
                }
            }
        }
    }

    /// Take-profit sweep: flatten any position that is up past the target.
    pub async fn sweep_take_profit(&self) {
        for strategy_id in self.monitored.snapshot() {
            let Some(strategy) = self.active_strategy(&strategy_id).await else {
                continue;
            };
            let target = strategy.risk_parameters.take_profit_percent;
            if target <= 0.0 {
                continue;
            }
            for position in self.positions(&strategy).await {
                if position.pnl_percent() >= target {
                    info!(
                        strategy_id = %strategy_id,
                        symbol = %position.symbol,
                        pnl_percent = position.pnl_percent(),
                        "take-profit reached, flattening position"
                    );
                    self.flatten(&strategy, &position.symbol, position.quantity)
                        .await;
                }
            }
        }
    }

    /// Risk-parameter sweep: aggregate strategy P&L against the loss limits.
    /// A breach halts the strategy through the execution engine; an
    /// already-stopped strategy is skipped, so a second check is a no-op.
    pub async fn sweep_risk(&self) {
        for strategy_id in self.monitored.snapshot() {
            let Some(strategy) = self.active_strategy(&strategy_id).await else {
                continue;
            };
            let pnl: f64 = self.positions(&strategy).await.iter().map(|p| p.pnl()).sum();
            let risk = &strategy.risk_parameters;
            let breached = (risk.max_loss > 0.0 && pnl <= -risk.max_loss)
                || (risk.max_daily_loss > 0.0 && pnl <= -risk.max_daily_loss);
            if !breached {
                continue;
            }
            warn!(
                strategy_id = %strategy_id,
                pnl,
                max_loss = risk.max_loss,
                "risk parameters breached, halting strategy"
            );
            match self.engine.stop_strategy(&strategy_id).await {
                Ok(()) => {
                    self.bus
                        .publish_system_event(
                            EventType::SystemAlert,
                            serde_json::json!({
                                "alert": "risk_breach",
                                "strategy_id": strategy_id,
                                "pnl": pnl,
                            }),
                        )
                        .await;
                }
                Err(EngineError::NotActive(_)) => {
                    debug!(strategy_id = %strategy_id, "strategy already halted");
                }
                Err(e) => {
                    warn!(strategy_id = %strategy_id, error = %e, "risk halt failed");
                }
            }
        }
    }

    async fn positions(&self, strategy: &Strategy) -> Vec<crate::core::Position> {
        match self.orders.get_positions(&strategy.broker).await {
            Ok(positions) => positions
                .into_iter()
                .filter(|p| p.quantity != 0 && strategy.instruments.iter().any(|s| s == &p.symbol))
                .collect(),
            Err(e) => {
                debug!(strategy_id = %strategy.id, error = %e, "position query failed");
                Vec::new()
            }
        }
    }

    async fn flatten(&self, strategy: &Strategy, symbol: &str, quantity: i64) {
        let side = if quantity > 0 {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let request = OrderRequest::market(symbol, &strategy.exchange, side, quantity.abs());
        match self
            .orders
            .place_order(&strategy.broker, &strategy.user_id, &request, Some(&strategy.id), None)
            .await
        {
            Ok(response) if response.success => {}
            Ok(response) => {
                warn!(strategy_id = %strategy.id, symbol = %symbol, message = %response.message, "exit order rejected");
            }
            Err(e) => {
                warn!(strategy_id = %strategy.id, symbol = %symbol, error = %e, "exit order failed");
            }
        }
    }

    /// The three sweeps on their own cadences until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut stop_loss = tokio::time::interval(STOP_LOSS_TICK);
        let mut take_profit = tokio::time::interval(TAKE_PROFIT_TICK);
        let mut risk = tokio::time::interval(RISK_TICK);
        info!("monitoring service running");
        loop {
            tokio::select! {
                _ = stop_loss.tick() => self.sweep_stop_loss().await,
                _ = take_profit.tick() => self.sweep_take_profit().await,
                _ = risk.tick() => self.sweep_risk().await,
                _ = shutdown.recv() => {
                    info!("monitoring service shutting down");
                    return;
                }
            }
        }
    }
}
