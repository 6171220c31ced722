//! Multi-leg strategy model: legs, execution parameters, hedging, risk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::order::{OrderSide, OrderType};

/// Direction of a leg, including option opening/closing variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegType {
    Buy,
    Sell,
    BuyToOpen,
    SellToOpen,
    BuyToClose,
    SellToClose,
}

impl LegType {
    /// Collapses the opening/closing vocabulary onto the canonical order side.
    pub fn order_side(self) -> OrderSide {
        match self {
            LegType::Buy | LegType::BuyToOpen | LegType::BuyToClose => OrderSide::Buy,
            LegType::Sell | LegType::SellToOpen | LegType::SellToClose => OrderSide::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegStatus {
    Pending,
    Executed,
    Failed,
}

/// How a leg should be worked at the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    Market,
    Limit,
    Stop,
    StopLimit,
    Trailing,
}

impl ExecutionType {
    /// Maps onto the canonical order type. Trailing is worked as a market
    /// order; the trailing adjustment itself is the hedge service's concern.
    pub fn order_type(self) -> OrderType {
        match self {
            ExecutionType::Market | ExecutionType::Trailing => OrderType::Market,
            ExecutionType::Limit => OrderType::Limit,
            ExecutionType::Stop => OrderType::StopLoss,
            ExecutionType::StopLimit => OrderType::StopLimit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HedgeType {
    None,
    Delta,
    Gamma,
    Vega,
    Theta,
    Dynamic,
}

/// Whether a leg target/stop threshold is an absolute value or a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdType {
    Value,
    Percent,
}

/// One component of a multi-leg strategy. Owned exclusively by its parent
/// strategy; only the multileg engine moves it through its states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub id: String,
    pub symbol: String,
    pub exchange: String,
    pub leg_type: LegType,
    pub quantity: i64,
    pub execution_type: ExecutionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    /// Position in a sequential run. Lower sequences execute first.
    pub sequence: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<ThresholdType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss_type: Option<ThresholdType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_percent: Option<f64>,
    pub status: LegStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<DateTime<Utc>>,
}

impl Leg {
    pub fn new(symbol: &str, exchange: &str, leg_type: LegType, quantity: i64, sequence: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            leg_type,
            quantity,
            execution_type: ExecutionType::Market,
            price: None,
            stop_price: None,
            sequence,
            target: None,
            target_type: None,
            stop_loss: None,
            stop_loss_type: None,
            trailing_amount: None,
            trailing_percent: None,
            status: LegStatus::Pending,
            order_id: None,
            executed_price: None,
            execution_time: None,
        }
    }

    /// Rejects malformed legs before any state is mutated.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.is_empty() {
            return Err("leg symbol is required".into());
        }
        if self.exchange.is_empty() {
            return Err("leg exchange is required".into());
        }
        if self.quantity <= 0 {
            return Err("leg quantity must be greater than zero".into());
        }
        match self.execution_type {
            ExecutionType::Limit | ExecutionType::StopLimit
                if self.price.unwrap_or(0.0) <= 0.0 =>
            {
                return Err("limit price must be greater than zero for limit legs".into());
            }
            _ => {}
        }
        match self.execution_type {
            ExecutionType::Stop | ExecutionType::StopLimit
                if self.stop_price.unwrap_or(0.0) <= 0.0 =>
            {
                return Err("stop price must be greater than zero for stop legs".into());
            }
            _ => {}
        }
        if self.execution_type == ExecutionType::Trailing
            && self.trailing_amount.unwrap_or(0.0) <= 0.0
            && self.trailing_percent.unwrap_or(0.0) <= 0.0
        {
            return Err("trailing amount or percent is required for trailing legs".into());
        }
        Ok(())
    }

    /// Signed quantity: positive for buys, negative for sells.
    pub fn signed_quantity(&self) -> i64 {
        match self.leg_type.order_side() {
            OrderSide::Buy => self.quantity,
            OrderSide::Sell => -self.quantity,
        }
    }
}

/// Range-breakout trigger configuration for a strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeBreakout {
    pub enabled: bool,
    pub symbol: String,
    pub exchange: String,
    pub upper_bound: f64,
    pub lower_bound: f64,
    /// Consecutive breaching ticks required before the trigger fires.
    pub confirmation: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// Sequential runs legs in sequence order with settlement between legs;
    /// otherwise every leg is dispatched in its own task.
    pub sequential: bool,
    /// Settlement window per leg in a sequential run, in seconds.
    pub time_window_secs: u64,
    /// Maximum tolerated slippage, percent.
    pub max_slippage: f64,
    #[serde(default)]
    pub range_breakout: RangeBreakout,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            sequential: true,
            time_window_secs: 1,
            max_slippage: 0.5,
            range_breakout: RangeBreakout::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskParams {
    pub max_loss: f64,
    pub max_daily_loss: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeParams {
    pub enabled: bool,
    pub hedge_type: HedgeType,
    /// Instrument used to express the hedge.
    #[serde(default)]
    pub instrument: String,
    #[serde(default)]
    pub exchange: String,
    /// Hedge quantity per unit of net exposure.
    pub ratio: f64,
    /// Rebalance cadence, minutes.
    pub rebalance_minutes: u32,
    /// Minimum exposure delta before an adjustment order is placed.
    pub threshold: f64,
}

impl Default for HedgeParams {
    fn default() -> Self {
        Self {
            enabled: false,
            hedge_type: HedgeType::None,
            instrument: String::new(),
            exchange: String::new(),
            ratio: 1.0,
            rebalance_minutes: 5,
            threshold: 0.0,
        }
    }
}

/// Lifecycle status. Transitions form a strict lattice:
/// draft -> active <-> paused -> canceled. A canceled strategy never comes
/// back; re-running one means creating a new strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MultilegStatus {
    Draft,
    Active,
    Paused,
    Canceled,
}

impl MultilegStatus {
    pub fn can_transition(self, to: MultilegStatus) -> bool {
        use MultilegStatus::*;
        matches!(
            (self, to),
            (Draft, Active) | (Active, Paused) | (Paused, Active) | (Active, Canceled) | (Paused, Canceled)
        )
    }
}

/// A multi-leg strategy: an ordered list of legs plus execution, risk and
/// hedge parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultilegStrategy {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub portfolio_id: String,
    /// Venue that executes this strategy's orders.
    pub broker: String,
    pub legs: Vec<Leg>,
    pub execution_params: ExecutionParams,
    pub risk_params: RiskParams,
    pub hedge_params: HedgeParams,
    pub status: MultilegStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl MultilegStrategy {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("strategy name is required".into());
        }
        if self.user_id.is_empty() {
            return Err("user id is required".into());
        }
        if self.legs.is_empty() {
            return Err("at least one leg is required".into());
        }
        for leg in &self.legs {
            leg.validate()?;
        }
        if self.execution_params.max_slippage < 0.0 {
            return Err("max slippage cannot be negative".into());
        }
        Ok(())
    }

    /// Legs in ascending sequence order, the order a sequential run uses.
    pub fn sorted_legs(&self) -> Vec<Leg> {
        let mut legs = self.legs.clone();
        legs.sort_by_key(|leg| leg.sequence);
        legs
    }

    pub fn leg_mut(&mut self, leg_id: &str) -> Option<&mut Leg> {
        self.legs.iter_mut().find(|leg| leg.id == leg_id)
    }

    /// Net signed exposure of executed legs, used by the hedge service.
    pub fn net_executed_exposure(&self) -> i64 {
        self.legs
            .iter()
            .filter(|leg| leg.status == LegStatus::Executed)
            .map(Leg::signed_quantity)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leg_type_collapses_to_order_side() {
        assert_eq!(LegType::Buy.order_side(), OrderSide::Buy);
        assert_eq!(LegType::BuyToOpen.order_side(), OrderSide::Buy);
        assert_eq!(LegType::BuyToClose.order_side(), OrderSide::Buy);
        assert_eq!(LegType::Sell.order_side(), OrderSide::Sell);
        assert_eq!(LegType::SellToOpen.order_side(), OrderSide::Sell);
        assert_eq!(LegType::SellToClose.order_side(), OrderSide::Sell);
    }

    #[test]
    fn execution_type_maps_to_order_type() {
        assert_eq!(ExecutionType::Market.order_type(), OrderType::Market);
        assert_eq!(ExecutionType::Limit.order_type(), OrderType::Limit);
        assert_eq!(ExecutionType::Stop.order_type(), OrderType::StopLoss);
        assert_eq!(ExecutionType::StopLimit.order_type(), OrderType::StopLimit);
        assert_eq!(ExecutionType::Trailing.order_type(), OrderType::Market);
    }

    #[test]
    fn status_lattice_is_strict() {
        use MultilegStatus::*;
        assert!(Draft.can_transition(Active));
        assert!(Active.can_transition(Paused));
        assert!(Paused.can_transition(Active));
        assert!(Active.can_transition(Canceled));
        assert!(Paused.can_transition(Canceled));

        assert!(!Draft.can_transition(Paused));
        assert!(!Draft.can_transition(Canceled));
        assert!(!Canceled.can_transition(Active));
        assert!(!Canceled.can_transition(Draft));
        assert!(!Active.can_transition(Draft));
    }

    #[test]
    fn sorted_legs_orders_by_sequence() {
        let mut strategy = sample_strategy();
        strategy.legs = vec![
            Leg::new("C", "NSECM", LegType::Buy, 1, 3),
            Leg::new("A", "NSECM", LegType::Buy, 1, 1),
            Leg::new("B", "NSECM", LegType::Buy, 1, 2),
        ];
        let order: Vec<String> = strategy
            .sorted_legs()
            .into_iter()
            .map(|leg| leg.symbol)
            .collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn limit_leg_requires_price() {
        let mut leg = Leg::new("AAPL", "NSECM", LegType::Buy, 10, 1);
        leg.execution_type = ExecutionType::Limit;
        assert!(leg.validate().is_err());
        leg.price = Some(160.0);
        assert!(leg.validate().is_ok());
    }

    #[test]
    fn net_exposure_counts_executed_legs_only() {
        let mut strategy = sample_strategy();
        strategy.legs = vec![
            Leg::new("A", "NSECM", LegType::Buy, 10, 1),
            Leg::new("A", "NSECM", LegType::Sell, 4, 2),
        ];
        assert_eq!(strategy.net_executed_exposure(), 0);
        strategy.legs[0].status = LegStatus::Executed;
        assert_eq!(strategy.net_executed_exposure(), 10);
        strategy.legs[1].status = LegStatus::Executed;
        assert_eq!(strategy.net_executed_exposure(), 6);
    }

    fn sample_strategy() -> MultilegStrategy {
        MultilegStrategy {
            id: "ml-1".into(),
            name: "test".into(),
            user_id: "u1".into(),
            portfolio_id: "p1".into(),
            broker: "paper".into(),
            legs: vec![Leg::new("AAPL", "NSECM", LegType::Buy, 1, 1)],
            execution_params: ExecutionParams::default(),
            risk_params: RiskParams::default(),
            hedge_params: HedgeParams::default(),
            status: MultilegStatus::Draft,
            tags: Vec::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            last_executed_at: None,
        }
    }
}
