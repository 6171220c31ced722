//! Single-instrument strategy model: conditions, risk thresholds, schedules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::order::Quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    Draft,
    Active,
    Paused,
    Stopped,
}

impl StrategyStatus {
    /// draft -> active <-> paused -> stopped. Stopped is terminal.
    pub fn can_transition(self, to: StrategyStatus) -> bool {
        use StrategyStatus::*;
        matches!(
            (self, to),
            (Draft, Active) | (Active, Paused) | (Paused, Active) | (Active, Stopped) | (Paused, Stopped)
        )
    }
}

/// A comparison against a quote field, e.g. `last_price > 105.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub parameter: String,
    pub operator: String,
    pub value: f64,
}

impl Condition {
    pub fn new(parameter: &str, operator: &str, value: f64) -> Self {
        Self {
            parameter: parameter.to_string(),
            operator: operator.to_string(),
            value,
        }
    }

    /// Evaluates the condition against a quote. Unknown parameters and
    /// operators evaluate to false rather than erroring, so a malformed
    /// condition can never fire an order.
    pub fn evaluate(&self, quote: &Quote) -> bool {
        let actual = match self.parameter.as_str() {
            "last_price" => quote.last_price,
            "bid_price" => quote.bid_price,
            "ask_price" => quote.ask_price,
            "volume" => quote.volume as f64,
            "open_interest" => quote.open_interest as f64,
            _ => return false,
        };
        match self.operator.as_str() {
            ">" => actual > self.value,
            ">=" => actual >= self.value,
            "<" => actual < self.value,
            "<=" => actual <= self.value,
            "==" => (actual - self.value).abs() < f64::EPSILON,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskParameters {
    pub max_position_size: f64,
    pub max_loss: f64,
    pub max_daily_loss: f64,
    /// Exit when a position gives back this much from its peak, percent.
    pub trailing_stop_percent: f64,
    /// Exit when a position is up this much, percent.
    pub take_profit_percent: f64,
}

/// A single-instrument trading strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub user_id: String,
    /// Venue that executes this strategy's orders.
    pub broker: String,
    pub instruments: Vec<String>,
    pub exchange: String,
    pub entry_conditions: Vec<Condition>,
    pub exit_conditions: Vec<Condition>,
    pub risk_parameters: RiskParameters,
    pub status: StrategyStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl Strategy {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("strategy name is required".into());
        }
        if self.user_id.is_empty() {
            return Err("user id is required".into());
        }
        if self.instruments.is_empty() {
            return Err("at least one instrument is required".into());
        }
        if self.quantity <= 0 {
            return Err("quantity must be greater than zero".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleFrequency {
    Once,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

/// When a strategy should be fired by the scheduler. One schedule per
/// strategy; installing a new one supersedes the previous registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySchedule {
    pub strategy_id: String,
    pub frequency: ScheduleFrequency,
    pub start_time: DateTime<Utc>,
    /// 0 = Sunday .. 6 = Saturday. Weekly only.
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StrategySchedule {
    pub fn validate(&self) -> Result<(), String> {
        if self.strategy_id.is_empty() {
            return Err("strategy id is required".into());
        }
        if self.frequency == ScheduleFrequency::Weekly && self.days_of_week.is_empty() {
            return Err("days of week are required for weekly frequency".into());
        }
        for day in &self.days_of_week {
            if *day > 6 {
                return Err("days of week must be between 0 and 6".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(last: f64) -> Quote {
        Quote {
            symbol: "AAPL".into(),
            exchange: "NSECM".into(),
            last_price: last,
            bid_price: last - 0.05,
            ask_price: last + 0.05,
            volume: 1_000,
            open_interest: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn condition_operators() {
        let q = quote(100.0);
        assert!(Condition::new("last_price", ">", 99.0).evaluate(&q));
        assert!(Condition::new("last_price", ">=", 100.0).evaluate(&q));
        assert!(Condition::new("last_price", "<", 101.0).evaluate(&q));
        assert!(Condition::new("last_price", "<=", 100.0).evaluate(&q));
        assert!(Condition::new("last_price", "==", 100.0).evaluate(&q));
        assert!(!Condition::new("last_price", ">", 100.0).evaluate(&q));
    }

    #[test]
    fn unknown_parameter_or_operator_never_fires() {
        let q = quote(100.0);
        assert!(!Condition::new("vwap", ">", 0.0).evaluate(&q));
        assert!(!Condition::new("last_price", "~", 0.0).evaluate(&q));
    }

    #[test]
    fn strategy_status_lattice() {
        use StrategyStatus::*;
        assert!(Draft.can_transition(Active));
        assert!(Active.can_transition(Paused));
        assert!(Paused.can_transition(Active));
        assert!(Active.can_transition(Stopped));
        assert!(Paused.can_transition(Stopped));

        assert!(!Stopped.can_transition(Active));
        assert!(!Stopped.can_transition(Paused));
        assert!(!Draft.can_transition(Stopped));
        assert!(!Active.can_transition(Draft));
    }

    #[test]
    fn weekly_schedule_requires_days() {
        let mut schedule = StrategySchedule {
            strategy_id: "s1".into(),
            frequency: ScheduleFrequency::Weekly,
            start_time: Utc::now(),
            days_of_week: vec![],
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(schedule.validate().is_err());
        schedule.days_of_week = vec![1, 3, 5];
        assert!(schedule.validate().is_ok());
        schedule.days_of_week = vec![7];
        assert!(schedule.validate().is_err());
    }
}
