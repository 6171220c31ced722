//! Strategy scheduling: persisted schedules become recurring-job rules.
//!
//! Re-scheduling is remove-then-add, and the schedule is only persisted once
//! the job registration holds, so a failed registration never leaves a stale
//! schedule behind. The due check runs once a minute against wall clock.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Datelike, Timelike, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::{ScheduleFrequency, StrategySchedule};
use crate::execution::EngineError;
use crate::store::StrategyRepository;

use super::StrategyEngine;

const SCHEDULER_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The frequency exists in the model but has no job mapping.
    #[error("{0} schedule frequency is not implemented")]
    NotImplemented(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A recurring-job rule derived from a [`StrategySchedule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronRule {
    minute: u32,
    hour: u32,
    day_of_month: Option<u32>,
    month: Option<u32>,
    /// 0 = Sunday .. 6 = Saturday.
    days_of_week: Option<Vec<u8>>,
    /// A one-shot rule is deregistered after it fires.
    once: bool,
}

impl CronRule {
    pub fn from_schedule(schedule: &StrategySchedule) -> Result<Self, ScheduleError> {
        schedule.validate().map_err(ScheduleError::Validation)?;
        let start = schedule.start_time;
        let rule = match schedule.frequency {
            ScheduleFrequency::Once => Self {
                minute: start.minute(),
                hour: start.hour(),
                day_of_month: Some(start.day()),
                month: Some(start.month()),
                days_of_week: None,
                once: true,
            },
            ScheduleFrequency::Daily => Self {
                minute: start.minute(),
                hour: start.hour(),
                day_of_month: None,
                month: None,
                days_of_week: None,
                once: false,
            },
            ScheduleFrequency::Weekly => {
                let mut days = schedule.days_of_week.clone();
                days.sort_unstable();
                days.dedup();
                Self {
                    minute: start.minute(),
                    hour: start.hour(),
                    day_of_month: None,
                    month: None,
                    days_of_week: Some(days),
                    once: false,
                }
            }
            ScheduleFrequency::Monthly => Self {
                minute: start.minute(),
                hour: start.hour(),
                day_of_month: Some(start.day()),
                month: None,
                days_of_week: None,
                once: false,
            },
            ScheduleFrequency::Custom => {
                return Err(ScheduleError::NotImplemented("custom"));
            }
        };
        Ok(rule)
    }

    /// The standard five-field cron rendering of this rule.
    pub fn expression(&self) -> String {
        let dom = self
            .day_of_month
            .map(|d| d.to_string())
            .unwrap_or_else(|| "*".to_string());
        let month = self
            .month
            .map(|m| m.to_string())
            .unwrap_or_else(|| "*".to_string());
        let dow = match &self.days_of_week {
            Some(days) => days
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(","),
            None => "*".to_string(),
        };
        format!("{} {} {} {} {}", self.minute, self.hour, dom, month, dow)
    }

    pub fn is_once(&self) -> bool {
        self.once
    }

    /// Whether the rule fires in the minute containing `now`.
    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        if now.minute() != self.minute || now.hour() != self.hour {
            return false;
        }
        if let Some(day) = self.day_of_month {
            if now.day() != day {
                return false;
            }
        }
        if let Some(month) = self.month {
            if now.month() != month {
                return false;
            }
        }
        if let Some(days) = &self.days_of_week {
            let weekday = now.weekday().num_days_from_sunday() as u8;
            if !days.contains(&weekday) {
                return false;
            }
        }
        true
    }
}

pub struct StrategyScheduler {
    strategies: Arc<dyn StrategyRepository>,
    engine: Arc<StrategyEngine>,
    jobs: DashMap<String, CronRule>,
}

impl StrategyScheduler {
    pub fn new(strategies: Arc<dyn StrategyRepository>, engine: Arc<StrategyEngine>) -> Self {
        Self {
            strategies,
            engine,
            jobs: DashMap::new(),
        }
    }

    /// Installs a schedule for a strategy, superseding any previous
    /// registration. Conversion failures produce no side effects; a
    /// persistence failure rolls the registration back.
    pub async fn schedule_strategy(&self, schedule: &StrategySchedule) -> Result<(), ScheduleError> {
        let rule = CronRule::from_schedule(schedule)?;

        let previous = self.jobs.remove(&schedule.strategy_id);
        if schedule.enabled {
            self.jobs.insert(schedule.strategy_id.clone(), rule.clone());
        }
        if let Err(e) = self
            .strategies
            .save_schedule(schedule)
            .await
            .context("persisting strategy schedule")
        {
            self.jobs.remove(&schedule.strategy_id);
            if let Some((id, rule)) = previous {
                self.jobs.insert(id, rule);
            }
            return Err(ScheduleError::Other(e));
        }
        info!(
            strategy_id = %schedule.strategy_id,
            expression = %rule.expression(),
            enabled = schedule.enabled,
            "strategy schedule installed"
        );
        Ok(())
    }

    /// Replacing a schedule is the same remove-then-add path.
    pub async fn update_strategy_schedule(
        &self,
        schedule: &StrategySchedule,
    ) -> Result<(), ScheduleError> {
        self.schedule_strategy(schedule).await
    }

    pub async fn delete_strategy_schedule(&self, strategy_id: &str) -> Result<(), ScheduleError> {
        self.jobs.remove(strategy_id);
        self.strategies
            .delete_schedule(strategy_id)
            .await
            .context("deleting strategy schedule")?;
        info!(strategy_id = %strategy_id, "strategy schedule removed");
        Ok(())
    }

    /// Re-registers every enabled persisted schedule. Called once at startup.
    pub async fn restore(&self) -> Result<usize, ScheduleError> {
        let schedules = self
            .strategies
            .list_schedules()
            .await
            .context("listing persisted schedules")?;
        let mut restored = 0;
        for schedule in schedules.iter().filter(|s| s.enabled) {
            match CronRule::from_schedule(schedule) {
                Ok(rule) => {
                    self.jobs.insert(schedule.strategy_id.clone(), rule);
                    restored += 1;
                }
                Err(e) => {
                    warn!(strategy_id = %schedule.strategy_id, error = %e, "skipping unrestorable schedule");
                }
            }
        }
        info!(restored, "schedules restored");
        Ok(restored)
    }

    pub fn registered_rule(&self, strategy_id: &str) -> Option<CronRule> {
        self.jobs.get(strategy_id).map(|entry| entry.value().clone())
    }

    /// Fires every registered job due at `now`. One-shot jobs are
    /// deregistered after firing.
    pub async fn run_due(&self, now: DateTime<Utc>) {
        let due: Vec<(String, CronRule)> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().matches(now))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (strategy_id, rule) in due {
            debug!(strategy_id = %strategy_id, "schedule due, firing execution");
            match self.engine.execute_strategy(&strategy_id).await {
                Ok(()) => {}
                Err(EngineError::AlreadyExecuting(_)) => {
                    debug!(strategy_id = %strategy_id, "scheduled strategy already running");
                }
                Err(e) => {
                    warn!(strategy_id = %strategy_id, error = %e, "scheduled execution failed");
                }
            }
            if rule.is_once() {
                self.jobs.remove(&strategy_id);
                info!(strategy_id = %strategy_id, "one-shot schedule fired and deregistered");
            }
        }
    }

    /// 1-minute due sweep until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(SCHEDULER_TICK);
        info!("strategy scheduler running");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_due(Utc::now()).await,
                _ = shutdown.recv() => {
                    info!("strategy scheduler shutting down");
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
    use crate::core::{RiskParameters, Strategy, StrategyStatus};
    use crate::services::OrderService;
    use crate::store::{InMemoryOrderRepository, InMemoryStrategyRepository};
    use crate::transport::EventBus;
    use chrono::TimeZone;

    fn schedule(frequency: ScheduleFrequency, days: Vec<u8>) -> StrategySchedule {
        StrategySchedule {
            strategy_id: "s1".into(),
            frequency,
            // 2026-03-02 is a Monday.
            start_time: Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap(),
            days_of_week: days,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn scheduler() -> (
        StrategyScheduler,
        Arc<InMemoryStrategyRepository>,
        Arc<PaperBroker>,
    ) {
        let registry = Arc::new(BrokerRegistry::new());
        let paper = Arc::new(PaperBroker::new("paper"));
        paper.initialize().await.unwrap();
        paper.set_last_price("AAPL", 105.0);
        registry.register("paper", paper.clone());

        let bus = Arc::new(EventBus::new(64));
        let orders = Arc::new(OrderService::new(
            registry,
            Arc::new(InMemoryOrderRepository::new()),
            bus.clone(),
        ));
        let strategies = Arc::new(InMemoryStrategyRepository::new());
        let engine = Arc::new(StrategyEngine::new(strategies.clone(), orders, bus));
        (
            StrategyScheduler::new(strategies.clone(), engine),
            strategies,
            paper,
        )
    }

    #[test]
    fn daily_conversion_is_deterministic() {
        let s = schedule(ScheduleFrequency::Daily, vec![]);
        let first = CronRule::from_schedule(&s).unwrap();
        let second = CronRule::from_schedule(&s).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.expression(), "15 9 * * *");
    }

    #[test]
    fn conversions_cover_every_frequency() {
        let once = CronRule::from_schedule(&schedule(ScheduleFrequency::Once, vec![])).unwrap();
        assert_eq!(once.expression(), "15 9 2 3 *");
        assert!(once.is_once());

        let weekly =
            CronRule::from_schedule(&schedule(ScheduleFrequency::Weekly, vec![5, 1, 3, 1])).unwrap();
        assert_eq!(weekly.expression(), "15 9 * * 1,3,5");

        let monthly = CronRule::from_schedule(&schedule(ScheduleFrequency::Monthly, vec![])).unwrap();
        assert_eq!(monthly.expression(), "15 9 2 * *");

        assert!(matches!(
            CronRule::from_schedule(&schedule(ScheduleFrequency::Custom, vec![])),
            Err(ScheduleError::NotImplemented("custom"))
        ));
    }

    #[test]
    fn rule_matching_honors_every_field() {
        let daily = CronRule::from_schedule(&schedule(ScheduleFrequency::Daily, vec![])).unwrap();
        assert!(daily.matches(Utc.with_ymd_and_hms(2026, 7, 1, 9, 15, 30).unwrap()));
        assert!(!daily.matches(Utc.with_ymd_and_hms(2026, 7, 1, 9, 16, 0).unwrap()));

        // Weekly on Monday (1): fires on 2026-03-02, not on 2026-03-03.
        let weekly = CronRule::from_schedule(&schedule(ScheduleFrequency::Weekly, vec![1])).unwrap();
        assert!(weekly.matches(Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap()));
        assert!(!weekly.matches(Utc.with_ymd_and_hms(2026, 3, 3, 9, 15, 0).unwrap()));

        let once = CronRule::from_schedule(&schedule(ScheduleFrequency::Once, vec![])).unwrap();
        assert!(once.matches(Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap()));
        assert!(!once.matches(Utc.with_ymd_and_hms(2026, 4, 2, 9, 15, 0).unwrap()));
    }

    #[tokio::test]
    async fn weekly_without_days_registers_nothing_and_persists_nothing() {
        let (scheduler, strategies, _paper) = scheduler().await;
        let err = scheduler
            .schedule_strategy(&schedule(ScheduleFrequency::Weekly, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Validation(_)));
        assert!(scheduler.registered_rule("s1").is_none());
        assert!(strategies.get_schedule("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rescheduling_supersedes_the_previous_registration() {
        let (scheduler, strategies, _paper) = scheduler().await;
        scheduler
            .schedule_strategy(&schedule(ScheduleFrequency::Daily, vec![]))
            .await
            .unwrap();
        scheduler
            .update_strategy_schedule(&schedule(ScheduleFrequency::Monthly, vec![]))
            .await
            .unwrap();

        let rule = scheduler.registered_rule("s1").unwrap();
        assert_eq!(rule.expression(), "15 9 2 * *");
        let persisted = strategies.get_schedule("s1").await.unwrap().unwrap();
        assert_eq!(persisted.frequency, ScheduleFrequency::Monthly);

        scheduler.delete_strategy_schedule("s1").await.unwrap();
        assert!(scheduler.registered_rule("s1").is_none());
        assert!(strategies.get_schedule("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_jobs_fire_and_one_shots_deregister() {
        let (scheduler, strategies, _paper) = scheduler().await;
        let strategy = Strategy {
            id: "s1".into(),
            name: "scheduled".into(),
            user_id: "u1".into(),
            broker: "paper".into(),
            instruments: vec!["AAPL".into()],
            exchange: "NSECM".into(),
            entry_conditions: vec![],
            exit_conditions: vec![],
            risk_parameters: RiskParameters::default(),
            status: StrategyStatus::Draft,
            tags: Vec::new(),
            quantity: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_executed_at: None,
        };
        strategies.create(&strategy).await.unwrap();
        scheduler
            .schedule_strategy(&schedule(ScheduleFrequency::Once, vec![]))
            .await
            .unwrap();

        // Not due: nothing fires.
        scheduler
            .run_due(Utc.with_ymd_and_hms(2026, 3, 2, 9, 14, 0).unwrap())
            .await;
        assert!(strategies.get("s1").await.unwrap().last_executed_at.is_none());

        scheduler
            .run_due(Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap())
            .await;
        assert!(strategies.get("s1").await.unwrap().last_executed_at.is_some());
        // The one-shot registration is gone.
        assert!(scheduler.registered_rule("s1").is_none());
    }

    #[tokio::test]
    async fn restore_reinstalls_enabled_schedules() {
        let (scheduler, strategies, _paper) = scheduler().await;
        strategies
            .save_schedule(&schedule(ScheduleFrequency::Daily, vec![]))
            .await
            .unwrap();
        let mut disabled = schedule(ScheduleFrequency::Daily, vec![]);
        disabled.strategy_id = "s2".into();
        disabled.enabled = false;
        strategies.save_schedule(&disabled).await.unwrap();

        let restored = scheduler.restore().await.unwrap();
        assert_eq!(restored, 1);
        assert!(scheduler.registered_rule("s1").is_some());
        assert!(scheduler.registered_rule("s2").is_none());
    }
}
