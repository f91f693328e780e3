use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use perpetron::config::AppConfig;
use perpetron::domain::ports::{ExchangeProvider, MarketProvider, PromptRenderer};
use perpetron::infrastructure::exchange::MockExchangeProvider;
use perpetron::infrastructure::llm::HttpLLMClient;
use perpetron::infrastructure::market::MockMarketProvider;
use perpetron::infrastructure::persistence::{Database, SqliteStore};
use perpetron::manager::{Manager, ProviderRegistry};
use perpetron::metrics::CycleMetrics;
use perpetron::prompt::FilePromptRenderer;
use rust_decimal_macros::dec;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "perpetron", about = "Multi-trader perpetual-futures orchestrator")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    info!("starting perpetron orchestrator");

    let config = AppConfig::load(&cli.config).context("loading configuration")?;

    let metrics = Arc::new(CycleMetrics::new().context("initializing metrics registry")?);

    let database = Database::new(&config.database_url).await.context("connecting to database")?;
    let store = Arc::new(SqliteStore::new(database));

    let llm = Arc::new(HttpLLMClient::new(config.llm_api_base.clone(), config.llm_api_key.clone()));
    let prompt_renderer_factory: Arc<dyn Fn(&str) -> Arc<dyn PromptRenderer> + Send + Sync> =
        Arc::new(|template_path: &str| {
            Arc::new(FilePromptRenderer::new(template_path)) as Arc<dyn PromptRenderer>
        });

    let mut registry = ProviderRegistry::new();
    let symbols: Vec<&str> = config
        .traders
        .iter()
        .flat_map(|t| t.exec_guards.symbol_whitelist.iter().map(|s| s.as_str()))
        .collect();

    for provider in &config.exchange_providers {
        let exchange: Arc<dyn ExchangeProvider> = match provider.kind.as_str() {
            "mock" => Arc::new(MockExchangeProvider::new(dec!(100000), &symbols)),
            other => anyhow::bail!("unknown exchange provider kind: {other}"),
        };
        registry.register_exchange(provider.name.clone(), exchange);
    }
    for provider in &config.market_providers {
        let market: Arc<dyn MarketProvider> = match provider.kind.as_str() {
            "mock" => Arc::new(MockMarketProvider::new(&symbols)),
            other => anyhow::bail!("unknown market provider kind: {other}"),
        };
        registry.register_market(provider.name.clone(), market);
    }

    let manager_settings = config.manager.clone();
    let manager = Manager::new(
        manager_settings,
        llm,
        prompt_renderer_factory,
        store.clone(),
        store,
        metrics,
    );

    for trader in config.traders {
        manager
            .register_trader(trader, &registry)
            .await
            .context("registering trader")?;
    }
    manager.adapt_equity().await;
    manager.hydrate_state().await.context("restoring trader cycle state")?;

    let handle = manager.commands();
    let manager_task = tokio::spawn(manager.run());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    handle.shutdown().await;

    if let Err(e) = manager_task.await {
        error!(error = %e, "manager task panicked");
    }

    Ok(())
}
