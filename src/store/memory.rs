//! In-memory repository implementations.
//!
//! Back the engines during development and in tests. Keys are owned ids;
//! everything is cloned on the way in and out.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;

use crate::core::{MultilegStrategy, Order, Position, Strategy, StrategySchedule};

use super::{
    MultilegRepository, OrderRepository, PortfolioRepository, PositionRepository,
    StrategyRepository,
};

#[derive(Default)]
pub struct InMemoryStrategyRepository {
    strategies: DashMap<String, Strategy>,
    schedules: DashMap<String, StrategySchedule>,
}

impl InMemoryStrategyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StrategyRepository for InMemoryStrategyRepository {
    async fn create(&self, strategy: &Strategy) -> Result<()> {
        self.strategies
            .insert(strategy.id.clone(), strategy.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Strategy> {
        self.strategies
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!("strategy not found: {id}"))
    }

    async fn update(&self, strategy: &Strategy) -> Result<()> {
        if !self.strategies.contains_key(&strategy.id) {
            return Err(anyhow!("strategy not found: {}", strategy.id));
        }
        self.strategies
            .insert(strategy.id.clone(), strategy.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.strategies.remove(id);
        self.schedules.remove(id);
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Strategy>> {
        Ok(self
            .strategies
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Vec<Strategy>> {
        Ok(self
            .strategies
            .iter()
            .filter(|entry| entry.value().tags.iter().any(|t| t == tag))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn save_schedule(&self, schedule: &StrategySchedule) -> Result<()> {
        self.schedules
            .insert(schedule.strategy_id.clone(), schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, strategy_id: &str) -> Result<Option<StrategySchedule>> {
        Ok(self
            .schedules
            .get(strategy_id)
            .map(|entry| entry.value().clone()))
    }

    async fn delete_schedule(&self, strategy_id: &str) -> Result<()> {
        self.schedules.remove(strategy_id);
        Ok(())
    }

    async fn list_schedules(&self) -> Result<Vec<StrategySchedule>> {
        Ok(self
            .schedules
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryMultilegRepository {
    strategies: DashMap<String, MultilegStrategy>,
}

impl InMemoryMultilegRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MultilegRepository for InMemoryMultilegRepository {
    async fn create(&self, strategy: &MultilegStrategy) -> Result<()> {
        self.strategies
            .insert(strategy.id.clone(), strategy.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<MultilegStrategy> {
        self.strategies
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!("multileg strategy not found: {id}"))
    }

    async fn update(&self, strategy: &MultilegStrategy) -> Result<()> {
        if !self.strategies.contains_key(&strategy.id) {
            return Err(anyhow!("multileg strategy not found: {}", strategy.id));
        }
        self.strategies
            .insert(strategy.id.clone(), strategy.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.strategies.remove(id);
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<MultilegStrategy>> {
        Ok(self
            .strategies
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_by_portfolio(&self, portfolio_id: &str) -> Result<Vec<MultilegStrategy>> {
        Ok(self
            .strategies
            .iter()
            .filter(|entry| entry.value().portfolio_id == portfolio_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Vec<MultilegStrategy>> {
        Ok(self
            .strategies
            .iter()
            .filter(|entry| entry.value().tags.iter().any(|t| t == tag))
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: DashMap<String, Order>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn create(&self, order: &Order) -> Result<()> {
        self.orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Order> {
        self.orders
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!("order not found: {id}"))
    }

    async fn update(&self, order: &Order) -> Result<()> {
        if !self.orders.contains_key(&order.id) {
            return Err(anyhow!("order not found: {}", order.id));
        }
        self.orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn get_by_strategy(&self, strategy_id: &str) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| entry.value().strategy_id.as_deref() == Some(strategy_id))
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }
}

#[derive(Default)]
pub struct InMemoryPositionRepository {
    positions: DashMap<String, Position>,
}

impl InMemoryPositionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(position: &Position) -> String {
        format!(
            "{}:{}:{}",
            position.strategy_id.as_deref().unwrap_or(""),
            position.symbol,
            position.exchange
        )
    }
}

#[async_trait]
impl PositionRepository for InMemoryPositionRepository {
    async fn upsert(&self, position: &Position) -> Result<()> {
        self.positions.insert(Self::key(position), position.clone());
        Ok(())
    }

    async fn get_by_strategy(&self, strategy_id: &str) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .iter()
            .filter(|entry| entry.value().strategy_id.as_deref() == Some(strategy_id))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list(&self) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryPortfolioRepository {
    members: DashMap<String, Vec<String>>,
}

impl InMemoryPortfolioRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PortfolioRepository for InMemoryPortfolioRepository {
    async fn strategy_ids(&self, portfolio_id: &str) -> Result<Vec<String>> {
        Ok(self
            .members
            .get(portfolio_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn attach_strategy(&self, portfolio_id: &str, strategy_id: &str) -> Result<()> {
        let mut entry = self.members.entry(portfolio_id.to_string()).or_default();
        if !entry.iter().any(|id| id == strategy_id) {
            entry.push(strategy_id.to_string());
        }
        Ok(())
    }

    async fn detach_strategy(&self, portfolio_id: &str, strategy_id: &str) -> Result<()> {
        if let Some(mut entry) = self.members.get_mut(portfolio_id) {
            entry.retain(|id| id != strategy_id);
        }
        Ok(())
    }
}
