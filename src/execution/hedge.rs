//! Dynamic hedging over executed multileg exposure.
//!
//! An actively hedged strategy carries an offsetting position in its hedge
//! instrument sized at `ratio` times the net executed exposure. The periodic
//! rebalance submits the delta whenever it moves past the configured
//! threshold.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::{ActiveSet, MultilegStatus, MultilegStrategy, OrderRequest, OrderSide};
use crate::services::OrderService;
use crate::store::MultilegRepository;

use super::EngineError;

const REBALANCE_TICK: Duration = Duration::from_secs(300);

pub struct DynamicHedgeService {
    strategies: Arc<dyn MultilegRepository>,
    orders: Arc<OrderService>,
    active: ActiveSet,
    /// Signed hedge quantity currently carried per strategy.
    hedged: DashMap<String, i64>,
}

impl DynamicHedgeService {
    pub fn new(strategies: Arc<dyn MultilegRepository>, orders: Arc<OrderService>) -> Self {
        Self {
            strategies,
            orders,
            active: ActiveSet::new(),
            hedged: DashMap::new(),
        }
    }

    pub fn active_hedges(&self) -> &ActiveSet {
        &self.active
    }

    /// Places the initial hedge and starts rebalancing the strategy. Hedging
    /// a strategy whose hedge parameters are disabled is an error; hedging
    /// one already under management is a no-op.
    pub async fn hedge_strategy(&self, strategy_id: &str) -> Result<(), EngineError> {
        let strategy = self
            .strategies
            .get(strategy_id)
            .await
            .context("loading multileg strategy")?;
        if !strategy.hedge_params.enabled {
            return Err(EngineError::NotEnabled("hedging"));
        }
        if !self.active.try_acquire(strategy_id) {
            return Ok(());
        }
        info!(
            strategy_id = %strategy_id,
            hedge_type = ?strategy.hedge_params.hedge_type,
            "hedging started"
        );
        self.adjust(&strategy).await;
        Ok(())
    }

    /// Stops managing the hedge. The carried hedge position is left in place
    /// for the caller to unwind.
    pub fn stop_hedging_strategy(&self, strategy_id: &str) {
        if self.active.release(strategy_id) {
            self.hedged.remove(strategy_id);
            info!(strategy_id = %strategy_id, "hedging stopped");
        }
    }

    /// One rebalance pass over a snapshot of the active-hedge set.
    pub async fn rebalance_tick(&self) {
        for strategy_id in self.active.snapshot() {
            match self.strategies.get(&strategy_id).await {
                Ok(strategy) => {
                    if strategy.hedge_params.enabled && strategy.status == MultilegStatus::Active {
                        self.adjust(&strategy).await;
                    }
                }
                Err(e) => {
                    debug!(strategy_id = %strategy_id, error = %e, "hedge rebalance skipped");
                }
            }
        }
    }

    /// Submits the difference between the desired hedge and what is already
    /// carried, when it exceeds the threshold.
    async fn adjust(&self, strategy: &MultilegStrategy) {
        let params = &strategy.hedge_params;
        let desired = -((strategy.net_executed_exposure() as f64 * params.ratio).round() as i64);
        let carried = self.hedged.get(&strategy.id).map(|e| *e).unwrap_or(0);
        let delta = desired - carried;
        if delta == 0 || (delta.abs() as f64) < params.threshold {
            return;
        }

        let side = if delta > 0 {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let request = OrderRequest::market(&params.instrument, &params.exchange, side, delta.abs());
        match self
            .orders
            .place_order(&strategy.broker, &strategy.user_id, &request, Some(&strategy.id), None)
            .await
        {
            Ok(response) if response.success => {
                self.hedged.insert(strategy.id.clone(), desired);
                info!(
                    strategy_id = %strategy.id,
                    instrument = %params.instrument,
                    delta,
                    desired,
                    "hedge adjusted"
                );
            }
            Ok(response) => {
                warn!(
                    strategy_id = %strategy.id,
                    message = %response.message,
                    "hedge order rejected"
                );
            }
            Err(e) => {
                warn!(strategy_id = %strategy.id, error = %e, "hedge order failed");
            }
        }
    }

    /// 5-minute rebalance sweep until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(REBALANCE_TICK);
        info!("dynamic hedge service running");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.rebalance_tick().await,
                _ = shutdown.recv() => {
                    info!("dynamic hedge service shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerRegistry, PaperBroker};
    use crate::core::{
        ExecutionParams, HedgeParams, HedgeType, Leg, LegStatus, LegType, RiskParams,
    };
    use crate::store::{InMemoryMultilegRepository, InMemoryOrderRepository};
    use crate::transport::EventBus;
    use chrono::Utc;

    struct Fixture {
        hedge: DynamicHedgeService,
        strategies: Arc<InMemoryMultilegRepository>,
        paper: Arc<PaperBroker>,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(BrokerRegistry::new());
        let paper = Arc::new(PaperBroker::new("paper"));
        paper.initialize().await.unwrap();
        paper.set_last_price("NIFTYFUT", 25_000.0);
        registry.register("paper", paper.clone());

        let orders = Arc::new(OrderService::new(
            registry,
            Arc::new(InMemoryOrderRepository::new()),
            Arc::new(EventBus::new(64)),
        ));
        let strategies = Arc::new(InMemoryMultilegRepository::new());
        Fixture {
            hedge: DynamicHedgeService::new(strategies.clone(), orders),
            strategies,
            paper,
        }
    }

    fn hedged_strategy(executed_buy_quantity: i64) -> MultilegStrategy {
        let mut leg = Leg::new("NIFTY25000CE", "NSEFO", LegType::Buy, executed_buy_quantity, 1);
        leg.status = LegStatus::Executed;
        MultilegStrategy {
            id: uuid::Uuid::new_v4().to_string(),
            name: "hedged spread".into(),
            user_id: "u1".into(),
            portfolio_id: "p1".into(),
            broker: "paper".into(),
            legs: vec![leg],
            execution_params: ExecutionParams::default(),
            risk_params: RiskParams::default(),
            hedge_params: HedgeParams {
                enabled: true,
                hedge_type: HedgeType::Delta,
                instrument: "NIFTYFUT".into(),
                exchange: "NSEFO".into(),
                ratio: 1.0,
                rebalance_minutes: 5,
                threshold: 0.0,
            },
            status: MultilegStatus::Active,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_executed_at: None,
        }
    }

    #[tokio::test]
    async fn hedging_a_disabled_strategy_is_an_error() {
        let f = fixture().await;
        let mut strategy = hedged_strategy(50);
        strategy.hedge_params.enabled = false;
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();

        let err = f.hedge.hedge_strategy(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotEnabled(_)));
        assert_eq!(f.paper.order_count(), 0);
    }

    #[tokio::test]
    async fn initial_hedge_offsets_net_exposure() {
        let f = fixture().await;
        let strategy = hedged_strategy(50);
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();

        f.hedge.hedge_strategy(&id).await.unwrap();

        // 50 long in the legs means a 50-lot sell in the hedge instrument.
        let orders = f.paper.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].symbol, "NIFTYFUT");
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].quantity, 50);
        assert!(f.hedge.active_hedges().contains(&id));

        // Re-hedging while already managed places nothing new.
        f.hedge.hedge_strategy(&id).await.unwrap();
        assert_eq!(f.paper.order_count(), 1);
    }

    #[tokio::test]
    async fn rebalance_submits_only_the_delta() {
        let f = fixture().await;
        let strategy = hedged_strategy(50);
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();
        f.hedge.hedge_strategy(&id).await.unwrap();
        assert_eq!(f.paper.order_count(), 1);

        // Exposure grows by 30: another executed buy leg lands.
        let mut stored = f.strategies.get(&id).await.unwrap();
        let mut extra = Leg::new("NIFTY25100CE", "NSEFO", LegType::Buy, 30, 2);
        extra.status = LegStatus::Executed;
        stored.legs.push(extra);
        f.strategies.update(&stored).await.unwrap();

        f.hedge.rebalance_tick().await;
        let orders = f.paper.orders();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert_eq!(orders[1].quantity, 30);

        // Nothing changed: the next sweep places no order.
        f.hedge.rebalance_tick().await;
        assert_eq!(f.paper.order_count(), 2);
    }

    #[tokio::test]
    async fn deltas_below_the_threshold_are_left_alone() {
        let f = fixture().await;
        let mut strategy = hedged_strategy(50);
        strategy.hedge_params.threshold = 10.0;
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();
        f.hedge.hedge_strategy(&id).await.unwrap();
        assert_eq!(f.paper.order_count(), 1);

        // A 5-lot move is inside the 10-lot threshold.
        let mut stored = f.strategies.get(&id).await.unwrap();
        let mut extra = Leg::new("NIFTY25100CE", "NSEFO", LegType::Buy, 5, 2);
        extra.status = LegStatus::Executed;
        stored.legs.push(extra);
        f.strategies.update(&stored).await.unwrap();

        f.hedge.rebalance_tick().await;
        assert_eq!(f.paper.order_count(), 1);
    }

    #[tokio::test]
    async fn stopping_forgets_the_carried_hedge() {
        let f = fixture().await;
        let strategy = hedged_strategy(50);
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();
        f.hedge.hedge_strategy(&id).await.unwrap();

        f.hedge.stop_hedging_strategy(&id);
        assert!(f.hedge.active_hedges().is_empty());

        f.hedge.rebalance_tick().await;
        assert_eq!(f.paper.order_count(), 1);
    }
}
