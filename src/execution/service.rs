//! Multileg strategy lifecycle: creation and leg management.
//!
//! Validation happens before any state is written. Leg mutation is only
//! allowed while a leg is still pending; once the engine has moved a leg,
//! its history is immutable.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::core::{Leg, LegStatus, MultilegStatus, MultilegStrategy};
use crate::store::{MultilegRepository, PortfolioRepository};

use super::EngineError;

pub struct MultilegService {
    strategies: Arc<dyn MultilegRepository>,
    portfolios: Arc<dyn PortfolioRepository>,
}

impl MultilegService {
    pub fn new(
        strategies: Arc<dyn MultilegRepository>,
        portfolios: Arc<dyn PortfolioRepository>,
    ) -> Self {
        Self {
            strategies,
            portfolios,
        }
    }

    /// Creates a strategy owned by `user_id`. The strategy starts in draft
    /// regardless of what the caller set; legs get fresh ids and pending
    /// status.
    pub async fn create_strategy(
        &self,
        user_id: &str,
        mut strategy: MultilegStrategy,
    ) -> Result<MultilegStrategy, EngineError> {
        strategy.id = Uuid::new_v4().to_string();
        strategy.user_id = user_id.to_string();
        strategy.status = MultilegStatus::Draft;
        let now = Utc::now();
        strategy.created_at = now;
        strategy.updated_at = now;
        strategy.last_executed_at = None;
        for leg in &mut strategy.legs {
            leg.id = Uuid::new_v4().to_string();
            leg.status = LegStatus::Pending;
            leg.order_id = None;
            leg.executed_price = None;
            leg.execution_time = None;
        }
        strategy.validate().map_err(EngineError::Validation)?;

        self.strategies
            .create(&strategy)
            .await
            .context("persisting new multileg strategy")?;
        if !strategy.portfolio_id.is_empty() {
            self.portfolios
                .attach_strategy(&strategy.portfolio_id, &strategy.id)
                .await
                .context("attaching strategy to portfolio")?;
        }
        info!(
            strategy_id = %strategy.id,
            user_id = %user_id,
            legs = strategy.legs.len(),
            "multileg strategy created"
        );
        Ok(strategy)
    }

    pub async fn get_strategy(&self, strategy_id: &str) -> Result<MultilegStrategy, EngineError> {
        Ok(self
            .strategies
            .get(strategy_id)
            .await
            .context("loading multileg strategy")?)
    }

    pub async fn list_strategies(&self, user_id: &str) -> Result<Vec<MultilegStrategy>, EngineError> {
        Ok(self
            .strategies
            .list_by_user(user_id)
            .await
            .context("listing multileg strategies")?)
    }

    /// Adds a leg to a strategy that has not been canceled.
    pub async fn add_leg(&self, strategy_id: &str, mut leg: Leg) -> Result<Leg, EngineError> {
        let mut strategy = self.editable(strategy_id).await?;
        leg.id = Uuid::new_v4().to_string();
        leg.status = LegStatus::Pending;
        leg.validate().map_err(EngineError::Validation)?;
        strategy.legs.push(leg.clone());
        strategy.updated_at = Utc::now();
        self.strategies
            .update(&strategy)
            .await
            .context("persisting added leg")?;
        Ok(leg)
    }

    /// Replaces the mutable fields of a pending leg. Executed and failed legs
    /// are history and stay as they are.
    pub async fn update_leg(&self, strategy_id: &str, leg: Leg) -> Result<(), EngineError> {
        leg.validate().map_err(EngineError::Validation)?;
        let mut strategy = self.editable(strategy_id).await?;
        let existing = strategy
            .leg_mut(&leg.id)
            .ok_or_else(|| EngineError::Validation(format!("leg not found: {}", leg.id)))?;
        if existing.status != LegStatus::Pending {
            return Err(EngineError::Validation(format!(
                "leg {} has already been executed",
                leg.id
            )));
        }
        existing.symbol = leg.symbol;
        existing.exchange = leg.exchange;
        existing.leg_type = leg.leg_type;
        existing.quantity = leg.quantity;
        existing.execution_type = leg.execution_type;
        existing.price = leg.price;
        existing.stop_price = leg.stop_price;
        existing.sequence = leg.sequence;
        existing.target = leg.target;
        existing.target_type = leg.target_type;
        existing.stop_loss = leg.stop_loss;
        existing.stop_loss_type = leg.stop_loss_type;
        existing.trailing_amount = leg.trailing_amount;
        existing.trailing_percent = leg.trailing_percent;
        strategy.updated_at = Utc::now();
        self.strategies
            .update(&strategy)
            .await
            .context("persisting leg update")?;
        Ok(())
    }

    /// Removes a pending leg.
    pub async fn remove_leg(&self, strategy_id: &str, leg_id: &str) -> Result<(), EngineError> {
        let mut strategy = self.editable(strategy_id).await?;
        let leg = strategy
            .legs
            .iter()
            .find(|l| l.id == leg_id)
            .ok_or_else(|| EngineError::Validation(format!("leg not found: {leg_id}")))?;
        if leg.status != LegStatus::Pending {
            return Err(EngineError::Validation(format!(
                "leg {leg_id} has already been executed"
            )));
        }
        strategy.legs.retain(|l| l.id != leg_id);
        strategy.updated_at = Utc::now();
        self.strategies
            .update(&strategy)
            .await
            .context("persisting leg removal")?;
        Ok(())
    }

    async fn editable(&self, strategy_id: &str) -> Result<MultilegStrategy, EngineError> {
        let strategy = self
            .strategies
            .get(strategy_id)
            .await
            .context("loading multileg strategy")?;
        if strategy.status == MultilegStatus::Canceled {
            return Err(EngineError::Validation(format!(
                "strategy {strategy_id} is canceled"
            )));
        }
        Ok(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionParams, HedgeParams, LegType, RiskParams};
    use crate::store::{InMemoryMultilegRepository, InMemoryPortfolioRepository};

    fn service() -> (
        MultilegService,
        Arc<InMemoryMultilegRepository>,
        Arc<InMemoryPortfolioRepository>,
    ) {
        let strategies = Arc::new(InMemoryMultilegRepository::new());
        let portfolios = Arc::new(InMemoryPortfolioRepository::new());
        (
            MultilegService::new(strategies.clone(), portfolios.clone()),
            strategies,
            portfolios,
        )
    }

    fn draft() -> MultilegStrategy {
        MultilegStrategy {
            id: String::new(),
            name: "iron condor".into(),
            user_id: String::new(),
            portfolio_id: "p1".into(),
            broker: "paper".into(),
            legs: vec![Leg::new("NIFTY25000CE", "NSEFO", LegType::SellToOpen, 50, 1)],
            execution_params: ExecutionParams::default(),
            risk_params: RiskParams::default(),
            hedge_params: HedgeParams::default(),
            status: MultilegStatus::Active,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_executed_at: None,
        }
    }

    #[tokio::test]
    async fn creation_stamps_owner_and_resets_status() {
        let (service, _strategies, portfolios) = service();
        let created = service.create_strategy("u1", draft()).await.unwrap();

        assert_eq!(created.user_id, "u1");
        assert_eq!(created.status, MultilegStatus::Draft);
        assert!(!created.id.is_empty());
        assert_eq!(created.legs[0].status, LegStatus::Pending);

        let members = portfolios.strategy_ids("p1").await.unwrap();
        assert_eq!(members, vec![created.id]);
    }

    #[tokio::test]
    async fn invalid_strategies_are_rejected_before_persisting() {
        let (service, strategies, _portfolios) = service();
        let mut input = draft();
        input.legs.clear();
        let err = service.create_strategy("u1", input).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(strategies.list_by_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legs_can_be_added_updated_and_removed_while_pending() {
        let (service, _strategies, _portfolios) = service();
        let created = service.create_strategy("u1", draft()).await.unwrap();

        let added = service
            .add_leg(&created.id, Leg::new("NIFTY24800PE", "NSEFO", LegType::SellToOpen, 50, 2))
            .await
            .unwrap();
        let mut updated = added.clone();
        updated.quantity = 100;
        service.update_leg(&created.id, updated).await.unwrap();

        let stored = service.get_strategy(&created.id).await.unwrap();
        assert_eq!(stored.legs.len(), 2);
        assert_eq!(stored.legs[1].quantity, 100);

        service.remove_leg(&created.id, &added.id).await.unwrap();
        let stored = service.get_strategy(&created.id).await.unwrap();
        assert_eq!(stored.legs.len(), 1);
    }

    #[tokio::test]
    async fn executed_legs_are_immutable() {
        let (service, strategies, _portfolios) = service();
        let created = service.create_strategy("u1", draft()).await.unwrap();

        let mut stored = strategies.get(&created.id).await.unwrap();
        stored.legs[0].status = LegStatus::Executed;
        strategies.update(&stored).await.unwrap();

        let err = service
            .remove_leg(&created.id, &stored.legs[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
