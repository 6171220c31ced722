//! Canonical trading model shared across the whole system.

pub mod events;
pub mod multileg;
pub mod order;
pub mod registry;
pub mod strategy;

pub use events::{EventType, Message};
pub use multileg::{
    ExecutionParams, ExecutionType, HedgeParams, HedgeType, Leg, LegStatus, LegType,
    MultilegStatus, MultilegStrategy, RangeBreakout, RiskParams, ThresholdType,
};
pub use order::{
    Instrument, ModifyOrderRequest, Order, OrderRequest, OrderResponse, OrderSide, OrderStatus,
    OrderType, Position, ProductType, Quote,
};
pub use registry::ActiveSet;
pub use strategy::{
    Condition, RiskParameters, ScheduleFrequency, Strategy, StrategySchedule, StrategyStatus,
};
