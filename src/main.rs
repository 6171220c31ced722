use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kestrel::broker::{Broker, BrokerRegistry, PaperBroker, XtsBroker, ZerodhaBroker};
use kestrel::broker::xts::XtsConfig;
use kestrel::broker::zerodha::ZerodhaConfig;
use kestrel::client::{MarketDataClient, OrderStreamClient};
use kestrel::config::Config;
use kestrel::execution::{DynamicHedgeService, MultilegEngine, RangeBreakoutMonitor};
use kestrel::services::OrderService;
use kestrel::store::{
    InMemoryMultilegRepository, InMemoryOrderRepository, InMemoryPortfolioRepository,
    InMemoryStrategyRepository,
};
use kestrel::strategy::{MonitoringService, StrategyEngine, StrategyScheduler};
use kestrel::transport::EventBus;

struct ServiceOrchestrator {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ServiceOrchestrator {
    fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    fn spawn(&mut self, name: &'static str, task: JoinHandle<()>) {
        info!("✅ {} started", name);
        self.tasks.push((name, task));
    }

    async fn shutdown_all(&mut self) {
        info!("🛑 Shutting down all services");
        let _ = self.shutdown_tx.send(());
        for (name, task) in self.tasks.drain(..) {
            match task.await {
                Ok(()) => info!("✅ {} shut down cleanly", name),
                Err(e) => error!("❌ {} task failed: {}", name, e),
            }
        }
    }
}

fn init_tracing() -> Result<()> {
    std::fs::create_dir_all("logs")?;
    let file_appender = tracing_appender::rolling::daily("logs", "kestrel.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .compact();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .json()
        .with_current_span(false)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // The appender guard must outlive main.
    std::mem::forget(guard);
    Ok(())
}

async fn build_registry(config: &Config) -> Arc<BrokerRegistry> {
    let registry = Arc::new(BrokerRegistry::new());
    for entry in &config.brokers {
        let broker: Arc<dyn Broker> = match entry.kind.as_str() {
            "paper" => Arc::new(PaperBroker::new(&entry.name)),
            "xts" => {
                let mut venue = XtsConfig {
                    api_key: entry.api_key.clone(),
                    api_secret: entry.api_secret.clone(),
                    ..Default::default()
                };
                if !entry.endpoint.is_empty() {
                    venue.endpoint = entry.endpoint.clone();
                }
                Arc::new(XtsBroker::new(&entry.name, venue))
            }
            "zerodha" => Arc::new(ZerodhaBroker::new(
                &entry.name,
                ZerodhaConfig {
                    api_key: entry.api_key.clone(),
                    api_secret: entry.api_secret.clone(),
                    ..Default::default()
                },
            )),
            other => {
                warn!(broker = %entry.name, kind = %other, "unknown broker kind, skipping");
                continue;
            }
        };
        match broker.initialize().await {
            Ok(()) => info!(broker = %entry.name, "broker session opened"),
            Err(e) => warn!(broker = %entry.name, error = %e, "broker initialization failed"),
        }
        registry.register(&entry.name, broker);
    }
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("🦅 Kestrel Trading Execution Core");
    info!("=================================");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/kestrel.json".to_string());
    let config = Config::load_or_default(&config_path);

    let registry = build_registry(&config).await;
    let bus = Arc::new(EventBus::new(config.bus.market_capacity));

    let order_repo = Arc::new(InMemoryOrderRepository::new());
    let strategy_repo = Arc::new(InMemoryStrategyRepository::new());
    let multileg_repo = Arc::new(InMemoryMultilegRepository::new());
    let portfolio_repo = Arc::new(InMemoryPortfolioRepository::new());

    let orders = Arc::new(OrderService::new(registry, order_repo, bus.clone()));
    let multileg_engine = Arc::new(MultilegEngine::new(
        multileg_repo.clone(),
        portfolio_repo.clone(),
        orders.clone(),
        bus.clone(),
    ));
    let breakout = Arc::new(RangeBreakoutMonitor::new(
        multileg_repo.clone(),
        multileg_engine.clone(),
        orders.clone(),
    ));
    let hedge = Arc::new(DynamicHedgeService::new(multileg_repo, orders.clone()));

    let strategy_engine = Arc::new(StrategyEngine::new(
        strategy_repo.clone(),
        orders.clone(),
        bus.clone(),
    ));
    let scheduler = Arc::new(StrategyScheduler::new(
        strategy_repo.clone(),
        strategy_engine.clone(),
    ));
    if let Err(e) = scheduler.restore().await {
        warn!(error = %e, "schedule restore failed");
    }
    let monitoring = Arc::new(MonitoringService::new(
        strategy_repo,
        orders,
        strategy_engine.clone(),
        bus.clone(),
    ));

    let mut orchestrator = ServiceOrchestrator::new();
    orchestrator.spawn(
        "range-breakout monitor",
        tokio::spawn(breakout.run(orchestrator.shutdown_tx.subscribe())),
    );
    orchestrator.spawn(
        "dynamic hedge service",
        tokio::spawn(hedge.run(orchestrator.shutdown_tx.subscribe())),
    );
    orchestrator.spawn(
        "strategy scheduler",
        tokio::spawn(scheduler.run(orchestrator.shutdown_tx.subscribe())),
    );
    orchestrator.spawn(
        "strategy registry monitor",
        tokio::spawn(strategy_engine.run_monitor(orchestrator.shutdown_tx.subscribe())),
    );
    orchestrator.spawn(
        "monitoring service",
        tokio::spawn(monitoring.run(orchestrator.shutdown_tx.subscribe())),
    );

    let market_client = if config.market_data.enabled {
        let (client, _raw) = MarketDataClient::new(
            &config.market_data.url,
            &config.market_data.token,
            &config.market_data.user_id,
            bus.clone(),
        );
        if let Err(e) = client.connect().await {
            warn!(error = %e, "market data stream unavailable at startup");
        }
        Some(client)
    } else {
        None
    };
    let order_client = if config.order_stream.enabled {
        let (client, _raw) = OrderStreamClient::new(
            &config.order_stream.url,
            &config.order_stream.token,
            &config.order_stream.user_id,
            bus,
        );
        if let Err(e) = client.connect().await {
            warn!(error = %e, "order stream unavailable at startup");
        }
        Some(client)
    } else {
        None
    };

    info!("🎯 Kestrel is running; press Ctrl+C to shut down");
    match signal::ctrl_c().await {
        Ok(()) => info!("🛑 Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    if let Some(client) = market_client {
        client.disconnect().await;
    }
    if let Some(client) = order_client {
        client.disconnect().await;
    }
    orchestrator.shutdown_all().await;

    info!("👋 Kestrel shutdown complete");
    Ok(())
}
