//! Collaborator persistence interfaces.
//!
//! The engines only ever talk to these traits; what backs them (a relational
//! store, a document store, the in-memory maps used in tests) is somebody
//! else's concern.

use anyhow::Result;
use async_trait::async_trait;

use crate::core::{MultilegStrategy, Order, Position, Strategy, StrategySchedule};

pub mod memory;

pub use memory::{
    InMemoryMultilegRepository, InMemoryOrderRepository, InMemoryPortfolioRepository,
    InMemoryPositionRepository, InMemoryStrategyRepository,
};

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    async fn create(&self, strategy: &Strategy) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Strategy>;
    async fn update(&self, strategy: &Strategy) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Strategy>>;
    async fn get_by_tag(&self, tag: &str) -> Result<Vec<Strategy>>;

    async fn save_schedule(&self, schedule: &StrategySchedule) -> Result<()>;
    async fn get_schedule(&self, strategy_id: &str) -> Result<Option<StrategySchedule>>;
    async fn delete_schedule(&self, strategy_id: &str) -> Result<()>;
    async fn list_schedules(&self) -> Result<Vec<StrategySchedule>>;
}

#[async_trait]
pub trait MultilegRepository: Send + Sync {
    async fn create(&self, strategy: &MultilegStrategy) -> Result<()>;
    async fn get(&self, id: &str) -> Result<MultilegStrategy>;
    async fn update(&self, strategy: &MultilegStrategy) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<MultilegStrategy>>;
    async fn list_by_portfolio(&self, portfolio_id: &str) -> Result<Vec<MultilegStrategy>>;
    async fn get_by_tag(&self, tag: &str) -> Result<Vec<MultilegStrategy>>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create(&self, order: &Order) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Order>;
    async fn update(&self, order: &Order) -> Result<()>;
    async fn get_by_strategy(&self, strategy_id: &str) -> Result<Vec<Order>>;
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Order>>;
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn upsert(&self, position: &Position) -> Result<()>;
    async fn get_by_strategy(&self, strategy_id: &str) -> Result<Vec<Position>>;
    async fn list(&self) -> Result<Vec<Position>>;
}

/// Links portfolios to the multi-leg strategies they contain.
#[async_trait]
pub trait PortfolioRepository: Send + Sync {
    async fn strategy_ids(&self, portfolio_id: &str) -> Result<Vec<String>>;
    async fn attach_strategy(&self, portfolio_id: &str, strategy_id: &str) -> Result<()>;
    async fn detach_strategy(&self, portfolio_id: &str, strategy_id: &str) -> Result<()>;
}
