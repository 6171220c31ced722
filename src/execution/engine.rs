//! Multi-leg execution engine.
//!
//! Owns the active-execution registry: at most one concurrent run per
//! strategy id. A run executes legs either sequentially (ascending sequence,
//! each leg settled before the next) or simultaneously (one task per leg).
//! Removal from the registry is the only cancellation signal; the run polls
//! it before each leg and stops without submitting the rest.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::{
    ActiveSet, EventType, Leg, LegStatus, MultilegStatus, MultilegStrategy, Order, OrderRequest,
    OrderSide, OrderStatus, Position, ProductType,
};
use crate::services::OrderService;
use crate::store::{MultilegRepository, PortfolioRepository};
use crate::transport::SharedEventBus;

use super::EngineError;

/// Poll cadence while waiting for a leg order to settle.
const SETTLE_POLL: Duration = Duration::from_millis(250);

pub struct MultilegEngine {
    strategies: Arc<dyn MultilegRepository>,
    portfolios: Arc<dyn PortfolioRepository>,
    orders: Arc<OrderService>,
    bus: SharedEventBus,
    active: ActiveSet,
}

/// What happened to one leg submission.
struct LegOutcome {
    leg_id: String,
    status: LegStatus,
    order_id: Option<String>,
    executed_price: Option<f64>,
    message: String,
}

impl MultilegEngine {
    pub fn new(
        strategies: Arc<dyn MultilegRepository>,
        portfolios: Arc<dyn PortfolioRepository>,
        orders: Arc<OrderService>,
        bus: SharedEventBus,
    ) -> Self {
        Self {
            strategies,
            portfolios,
            orders,
            bus,
            active: ActiveSet::new(),
        }
    }

    pub fn active_executions(&self) -> &ActiveSet {
        &self.active
    }

    /// Starts executing a strategy. Fails with `AlreadyExecuting` when a run
    /// for the same id is in flight; the run itself happens asynchronously
    /// and releases the registry entry when it finishes, success or not.
    pub async fn execute_strategy(self: &Arc<Self>, strategy_id: &str) -> Result<(), EngineError> {
        let mut strategy = self
            .strategies
            .get(strategy_id)
            .await
            .context("loading multileg strategy")?;

        match strategy.status {
            MultilegStatus::Active => {}
            MultilegStatus::Draft => {
                strategy.status = MultilegStatus::Active;
            }
            _ => return Err(EngineError::NotActive(strategy_id.to_string())),
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

        info!(
            strategy_id = %strategy_id,
            sequential = strategy.execution_params.sequential,
            legs = strategy.legs.len(),
            "starting multileg execution"
        );
        self.bus
            .publish_strategy_event(
                EventType::StrategyExecution,
                serde_json::json!({"strategy_id": strategy_id, "phase": "started"}),
            )
            .await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let id = strategy.id.clone();
            if strategy.execution_params.sequential {
                engine.run_sequential(strategy).await;
            } else {
                engine.run_simultaneous(strategy).await;
            }
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

    /// Pauses an active strategy. A paused strategy keeps its registry entry
    /// out; resuming re-enables execution but does not restart a run.
    pub async fn pause_strategy(&self, strategy_id: &str) -> Result<(), EngineError> {
        self.transition(strategy_id, MultilegStatus::Paused).await
    }

    pub async fn resume_strategy(&self, strategy_id: &str) -> Result<(), EngineError> {
        self.transition(strategy_id, MultilegStatus::Active).await
    }

    /// Cancels a strategy. The registry entry is released, which is what an
    /// in-flight run observes: it stops before submitting the next leg.
    pub async fn cancel_strategy(&self, strategy_id: &str) -> Result<(), EngineError> {
        self.transition(strategy_id, MultilegStatus::Canceled).await?;
        self.active.release(strategy_id);
        info!(strategy_id = %strategy_id, "multileg strategy canceled");
        Ok(())
    }

    async fn transition(&self, strategy_id: &str, to: MultilegStatus) -> Result<(), EngineError> {
        let mut strategy = self
            .strategies
            .get(strategy_id)
            .await
            .context("loading multileg strategy")?;
        if !strategy.status.can_transition(to) {
            return Err(EngineError::InvalidTransition {
                from: format!("{:?}", strategy.status),
                to: format!("{to:?}"),
            });
        }
        strategy.status = to;
        strategy.updated_at = Utc::now();
        self.strategies
            .update(&strategy)
            .await
            .context("persisting status transition")?;
        Ok(())
    }

    /// Executes every strategy attached to a portfolio. Strategies already
    /// running are skipped, not treated as failures.
    pub async fn execute_portfolio(
        self: &Arc<Self>,
        portfolio_id: &str,
    ) -> Result<Vec<String>, EngineError> {
        let ids = self
            .portfolios
            .strategy_ids(portfolio_id)
            .await
            .context("loading portfolio members")?;
        let mut started = Vec::new();
        for id in ids {
            match self.execute_strategy(&id).await {
                Ok(()) => started.push(id),
                Err(EngineError::AlreadyExecuting(_)) => {
                    debug!(strategy_id = %id, "portfolio member already executing, skipping");
                }
                Err(e) => {
                    warn!(strategy_id = %id, error = %e, "portfolio member failed to start");
                }
            }
        }
        self.bus
            .publish_portfolio_event(
                EventType::PortfolioUpdate,
                serde_json::json!({"portfolio_id": portfolio_id, "started": started.len()}),
            )
            .await;
        Ok(started)
    }

    /// Flattens every executed leg in the portfolio with an opposite market
    /// order. Returns the number of square-off orders submitted.
    pub async fn square_off_portfolio(&self, portfolio_id: &str) -> Result<usize, EngineError> {
        let ids = self
            .portfolios
            .strategy_ids(portfolio_id)
            .await
            .context("loading portfolio members")?;
        let mut submitted = 0;
        for id in ids {
            let strategy = self.strategies.get(&id).await.context("loading strategy")?;
            for leg in strategy.legs.iter().filter(|l| l.status == LegStatus::Executed) {
                let request = OrderRequest {
                    symbol: leg.symbol.clone(),
                    exchange: leg.exchange.clone(),
                    order_type: crate::core::OrderType::Market,
                    side: leg.leg_type.order_side().opposite(),
                    product_type: ProductType::Nrml,
                    quantity: leg.quantity,
                    price: None,
                    trigger_price: None,
                };
                match self
                    .orders
                    .place_order(&strategy.broker, &strategy.user_id, &request, Some(&id), Some(&leg.id))
                    .await
                {
                    Ok(response) if response.success => submitted += 1,
                    Ok(response) => {
                        warn!(strategy_id = %id, leg_id = %leg.id, message = %response.message, "square-off rejected");
                    }
                    Err(e) => {
                        warn!(strategy_id = %id, leg_id = %leg.id, error = %e, "square-off failed");
                    }
                }
            }
        }
        self.bus
            .publish_portfolio_event(
                EventType::PortfolioUpdate,
                serde_json::json!({"portfolio_id": portfolio_id, "squared_off": submitted}),
            )
            .await;
        Ok(submitted)
    }

    /// Venue positions for the symbols the portfolio trades.
    pub async fn get_portfolio_positions(
        &self,
        portfolio_id: &str,
    ) -> Result<Vec<Position>, EngineError> {
        let ids = self
            .portfolios
            .strategy_ids(portfolio_id)
            .await
            .context("loading portfolio members")?;
        let mut positions = Vec::new();
        for id in ids {
            let strategy = self.strategies.get(&id).await.context("loading strategy")?;
            let symbols: std::collections::HashSet<&str> =
                strategy.legs.iter().map(|l| l.symbol.as_str()).collect();
            let venue_positions = self
                .orders
                .get_positions(&strategy.broker)
                .await
                .context("querying venue positions")?;
            positions.extend(
                venue_positions
                    .into_iter()
                    .filter(|p| symbols.contains(p.symbol.as_str())),
            );
        }
        Ok(positions)
    }

    /// Sequential dispatch: ascending sequence, settle between legs, stop as
    /// soon as the registry no longer holds the strategy id.
    pub(crate) async fn run_sequential(&self, mut strategy: MultilegStrategy) {
        let order_of_legs: Vec<String> = strategy
            .sorted_legs()
            .into_iter()
            .map(|leg| leg.id)
            .collect();
        let window = Duration::from_secs(strategy.execution_params.time_window_secs);

        for leg_id in order_of_legs {
            if !self.active.contains(&strategy.id) {
                info!(strategy_id = %strategy.id, "execution canceled, remaining legs skipped");
                return;
            }
            let outcome = self.submit_leg(&strategy, &leg_id).await;
            let venue_order = match (&outcome.status, &outcome.order_id) {
                (LegStatus::Executed, Some(order_id)) => {
                    self.await_settlement(&strategy.broker, order_id, window).await
                }
                _ => None,
            };
            self.apply_outcome(&mut strategy, outcome, venue_order).await;
        }
    }

    /// Simultaneous dispatch: one task per leg, no ordering guarantee. Each
    /// task re-checks cancellation before submitting.
    pub(crate) async fn run_simultaneous(self: &Arc<Self>, strategy: MultilegStrategy) {
        let window = Duration::from_secs(strategy.execution_params.time_window_secs);
        let shared = Arc::new(Mutex::new(strategy.clone()));
        let mut tasks = Vec::new();

        for leg in &strategy.legs {
            let engine = Arc::clone(self);
            let shared = Arc::clone(&shared);
            let snapshot = strategy.clone();
            let leg_id = leg.id.clone();
            tasks.push(tokio::spawn(async move {
                if !engine.active.contains(&snapshot.id) {
                    return;
                }
                let outcome = engine.submit_leg(&snapshot, &leg_id).await;
                let venue_order = match (&outcome.status, &outcome.order_id) {
                    (LegStatus::Executed, Some(order_id)) => {
                        engine
                            .await_settlement(&snapshot.broker, order_id, window)
                            .await
                    }
                    _ => None,
                };
                let mut strategy = shared.lock().await;
                engine.apply_outcome(&mut strategy, outcome, venue_order).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Builds the canonical order for a leg and submits it. Leg direction
    /// collapses onto buy/sell; unrecognized execution types work as market.
    async fn submit_leg(&self, strategy: &MultilegStrategy, leg_id: &str) -> LegOutcome {
        let leg = match strategy.legs.iter().find(|l| l.id == leg_id) {
            Some(leg) => leg,
            None => {
                return LegOutcome {
                    leg_id: leg_id.to_string(),
                    status: LegStatus::Failed,
                    order_id: None,
                    executed_price: None,
                    message: "leg not found on strategy".to_string(),
                }
            }
        };
        let request = leg_order_request(leg);
        match self
            .orders
            .place_order(
                &strategy.broker,
                &strategy.user_id,
                &request,
                Some(&strategy.id),
                Some(leg_id),
            )
            .await
        {
            Ok(response) if response.success => LegOutcome {
                leg_id: leg_id.to_string(),
                status: LegStatus::Executed,
                order_id: response.order_id,
                executed_price: None,
                message: String::new(),
            },
            Ok(response) => LegOutcome {
                leg_id: leg_id.to_string(),
                status: LegStatus::Failed,
                order_id: None,
                executed_price: None,
                message: response.message,
            },
            Err(e) => {
                warn!(strategy_id = %strategy.id, leg_id = %leg_id, error = %e, "leg submission failed");
                LegOutcome {
                    leg_id: leg_id.to_string(),
                    status: LegStatus::Failed,
                    order_id: None,
                    executed_price: None,
                    message: e.to_string(),
                }
            }
        }
    }

    /// Polls the venue until the order settles or the window elapses. The
    /// window bounds the wait; a still-live order past it is left to the
    /// monitoring layer.
    async fn await_settlement(
        &self,
        broker: &str,
        order_id: &str,
        window: Duration,
    ) -> Option<Order> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match self.orders.get_order(broker, order_id).await {
                Ok(order) if !order.status.is_live() => return Some(order),
                Ok(_) => {}
                Err(e) => {
                    debug!(order_id = %order_id, error = %e, "settlement poll failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(SETTLE_POLL.min(window)).await;
        }
    }

    /// Records a leg transition on the parent strategy and persists it.
    /// Works on the freshest persisted copy so a concurrent status change
    /// (pause, cancel) is not clobbered by the leg update.
    async fn apply_outcome(
        &self,
        strategy: &mut MultilegStrategy,
        outcome: LegOutcome,
        venue_order: Option<Order>,
    ) {
        if let Ok(current) = self.strategies.get(&strategy.id).await {
            *strategy = current;
        }
        if outcome.status == LegStatus::Failed {
            warn!(
                strategy_id = %strategy.id,
                leg_id = %outcome.leg_id,
                message = %outcome.message,
                "leg failed"
            );
        }
        if let Some(leg) = strategy.leg_mut(&outcome.leg_id) {
            leg.status = outcome.status;
            leg.order_id = outcome.order_id.clone();
            if leg.status == LegStatus::Executed {
                leg.execution_time = Some(Utc::now());
                leg.executed_price = venue_order
                    .as_ref()
                    .filter(|o| o.status == OrderStatus::Completed)
                    .map(|o| o.average_price)
                    .or(outcome.executed_price)
                    .or(leg.price);
            }
        }
        strategy.updated_at = Utc::now();
        if let Err(e) = self.strategies.update(strategy).await {
            warn!(strategy_id = %strategy.id, error = %e, "failed to persist leg transition");
        }
    }
}

/// Leg direction maps onto the canonical side, execution type onto the
/// canonical order type.
fn leg_order_request(leg: &Leg) -> OrderRequest {
    OrderRequest {
        symbol: leg.symbol.clone(),
        exchange: leg.exchange.clone(),
        order_type: leg.execution_type.order_type(),
        side: leg.leg_type.order_side(),
        product_type: ProductType::Nrml,
        quantity: leg.quantity,
        price: leg.price,
        trigger_price: leg.stop_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerRegistry, PaperBroker};
    use crate::core::{ExecutionParams, ExecutionType, HedgeParams, LegType, RiskParams};
    use crate::store::{
        InMemoryMultilegRepository, InMemoryOrderRepository, InMemoryPortfolioRepository,
        MultilegRepository,
    };
    use crate::transport::EventBus;

    struct Fixture {
        engine: Arc<MultilegEngine>,
        strategies: Arc<InMemoryMultilegRepository>,
        portfolios: Arc<InMemoryPortfolioRepository>,
        orders: Arc<OrderService>,
        paper: Arc<PaperBroker>,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(BrokerRegistry::new());
        let paper = Arc::new(PaperBroker::new("paper"));
        paper.initialize().await.unwrap();
        paper.set_last_price("AAPL", 155.0);
        registry.register("paper", paper.clone());

        let bus = Arc::new(EventBus::new(64));
        let orders = Arc::new(OrderService::new(
            registry,
            Arc::new(InMemoryOrderRepository::new()),
            bus.clone(),
        ));
        let strategies = Arc::new(InMemoryMultilegRepository::new());
        let portfolios = Arc::new(InMemoryPortfolioRepository::new());
        let engine = Arc::new(MultilegEngine::new(
            strategies.clone(),
            portfolios.clone(),
            orders.clone(),
            bus,
        ));
        Fixture {
            engine,
            strategies,
            portfolios,
            orders,
            paper,
        }
    }

    fn strategy_with_legs(legs: Vec<Leg>, sequential: bool) -> MultilegStrategy {
        MultilegStrategy {
            id: uuid::Uuid::new_v4().to_string(),
            name: "spread".into(),
            user_id: "u1".into(),
            portfolio_id: "p1".into(),
            broker: "paper".into(),
            legs,
            execution_params: ExecutionParams {
                sequential,
                time_window_secs: 1,
                max_slippage: 0.5,
                range_breakout: Default::default(),
            },
            risk_params: RiskParams::default(),
            hedge_params: HedgeParams::default(),
            status: MultilegStatus::Active,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_executed_at: None,
        }
    }

    async fn wait_until_idle(engine: &MultilegEngine) {
        for _ in 0..100 {
            if engine.active_executions().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("engine never went idle");
    }

    #[tokio::test]
    async fn concurrent_executions_admit_exactly_one() {
        let f = fixture().await;
        let strategy = strategy_with_legs(
            vec![Leg::new("AAPL", "NSECM", LegType::Buy, 1, 1)],
            true,
        );
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();

        let (first, second) = tokio::join!(
            f.engine.execute_strategy(&id),
            f.engine.execute_strategy(&id)
        );
        let outcomes = [first, second];
        let successes = outcomes.iter().filter(|r| r.is_ok()).count();
        let conflicts = outcomes
            .iter()
            .filter(|r| matches!(r, Err(EngineError::AlreadyExecuting(_))))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);

        // The registry empties once the async run completes.
        wait_until_idle(&f.engine).await;
    }

    #[tokio::test]
    async fn sequential_legs_submit_in_sequence_order() {
        let f = fixture().await;
        f.paper.set_last_price("MSFT", 410.0);
        f.paper.set_last_price("GOOG", 175.0);
        // Sequence numbers shuffled relative to insertion order.
        let legs = vec![
            Leg::new("GOOG", "NSECM", LegType::Buy, 1, 3),
            Leg::new("AAPL", "NSECM", LegType::Buy, 1, 1),
            Leg::new("MSFT", "NSECM", LegType::Buy, 1, 2),
        ];
        let strategy = strategy_with_legs(legs, true);
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();

        f.engine.execute_strategy(&id).await.unwrap();
        wait_until_idle(&f.engine).await;

        let submitted: Vec<String> = f.paper.orders().into_iter().map(|o| o.symbol).collect();
        assert_eq!(submitted, vec!["AAPL", "MSFT", "GOOG"]);
    }

    #[tokio::test]
    async fn cancellation_stops_remaining_legs() {
        let f = fixture().await;
        // First leg rests at the venue (stop order), so settlement occupies
        // the full window and the test can cancel mid-run.
        let mut resting = Leg::new("AAPL", "NSECM", LegType::Sell, 1, 1);
        resting.execution_type = ExecutionType::Stop;
        resting.stop_price = Some(150.0);
        let legs = vec![resting, Leg::new("AAPL", "NSECM", LegType::Buy, 1, 2)];
        let strategy = strategy_with_legs(legs, true);
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();

        f.engine.execute_strategy(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        f.engine.cancel_strategy(&id).await.unwrap();
        wait_until_idle(&f.engine).await;

        // Only the first leg reached the venue.
        assert_eq!(f.paper.order_count(), 1);
        let stored = f.strategies.get(&id).await.unwrap();
        assert_eq!(stored.status, MultilegStatus::Canceled);
        assert_eq!(stored.legs[1].status, LegStatus::Pending);
    }

    #[tokio::test]
    async fn simultaneous_mode_submits_every_leg() {
        let f = fixture().await;
        f.paper.set_last_price("MSFT", 410.0);
        let legs = vec![
            Leg::new("AAPL", "NSECM", LegType::Buy, 1, 1),
            Leg::new("MSFT", "NSECM", LegType::Sell, 1, 2),
        ];
        let strategy = strategy_with_legs(legs, false);
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();

        f.engine.execute_strategy(&id).await.unwrap();
        wait_until_idle(&f.engine).await;

        assert_eq!(f.paper.order_count(), 2);
        let stored = f.strategies.get(&id).await.unwrap();
        assert!(stored.legs.iter().all(|l| l.status == LegStatus::Executed));
    }

    #[tokio::test]
    async fn failed_leg_is_marked_and_following_legs_continue() {
        let f = fixture().await;
        // Zero quantity trips the venue-side rejection path.
        let mut bad = Leg::new("AAPL", "NSECM", LegType::Buy, 1, 1);
        bad.quantity = 0;
        let legs = vec![bad, Leg::new("AAPL", "NSECM", LegType::Buy, 2, 2)];
        let strategy = strategy_with_legs(legs, true);
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();

        f.engine.execute_strategy(&id).await.unwrap();
        wait_until_idle(&f.engine).await;

        let stored = f.strategies.get(&id).await.unwrap();
        assert_eq!(stored.legs[0].status, LegStatus::Failed);
        assert_eq!(stored.legs[1].status, LegStatus::Executed);
    }

    #[tokio::test]
    async fn two_leg_spread_end_to_end() {
        let f = fixture().await;
        let mut sell = Leg::new("AAPL", "NSECM", LegType::Sell, 10, 2);
        sell.execution_type = ExecutionType::Limit;
        sell.price = Some(160.0);
        let legs = vec![Leg::new("AAPL", "NSECM", LegType::Buy, 10, 1), sell];
        let strategy = strategy_with_legs(legs, true);
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();

        f.engine.execute_strategy(&id).await.unwrap();
        wait_until_idle(&f.engine).await;

        // Leg A executed before leg B was submitted.
        let submitted = f.paper.orders();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].side, OrderSide::Buy);
        assert_eq!(submitted[1].side, OrderSide::Sell);

        // Execution does not auto-complete the strategy.
        let stored = f.strategies.get(&id).await.unwrap();
        assert_eq!(stored.status, MultilegStatus::Active);
        assert!(stored.legs.iter().all(|l| l.status == LegStatus::Executed));
        assert_eq!(stored.legs[0].executed_price, Some(155.0));
        assert_eq!(stored.legs[1].executed_price, Some(160.0));

        // Two orders recorded against the strategy.
        let recorded = f.orders.orders_for_strategy(&id).await.unwrap();
        assert_eq!(recorded.len(), 2);
    }

    #[tokio::test]
    async fn portfolio_execution_skips_running_members(){
        let f = fixture().await;
        let strategy = strategy_with_legs(
            vec![Leg::new("AAPL", "NSECM", LegType::Buy, 1, 1)],
            true,
        );
        let id = strategy.id.clone();
        f.strategies.create(&strategy).await.unwrap();
        f.portfolios.attach_strategy("p1", &id).await.unwrap();

        let started = f.engine.execute_portfolio("p1").await.unwrap();
        assert_eq!(started, vec![id.clone()]);
        wait_until_idle(&f.engine).await;

        let positions = f.engine.get_portfolio_positions("p1").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 1);

        let squared = f.engine.square_off_portfolio("p1").await.unwrap();
        assert_eq!(squared, 1);
    }
}
