use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::errors::ManagerError;
use crate::domain::ports::{ConversationRecorder, ExchangeProvider, LLMClient, MarketProvider, PersistenceService, PromptRenderer};
use crate::domain::types::{AnalyticsSnapshot, TraderConfig, TraderRuntimeState, TraderStatus};
use crate::executor::{cycle::ExecutorDeps, Executor};
use crate::metrics::CycleMetrics;

/// Builds the per-trader [`PromptRenderer`] for a given `prompt_template_path`. Each trader gets
/// its own renderer instance since the template path is configured per trader, not shared.
pub type PromptRendererFactory = Arc<dyn Fn(&str) -> Arc<dyn PromptRenderer> + Send + Sync>;

/// Resolves a trader's named provider references to live instances. Populated once at startup;
/// no provider is ever added or removed after the Manager starts ticking.
#[derive(Default)]
pub struct ProviderRegistry {
    exchanges: HashMap<String, Arc<dyn ExchangeProvider>>,
    markets: HashMap<String, Arc<dyn MarketProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_exchange(&mut self, name: impl Into<String>, provider: Arc<dyn ExchangeProvider>) {
        self.exchanges.insert(name.into(), provider);
    }

    pub fn register_market(&mut self, name: impl Into<String>, provider: Arc<dyn MarketProvider>) {
        self.markets.insert(name.into(), provider);
    }

    fn resolve_exchange(&self, name: &str) -> Result<Arc<dyn ExchangeProvider>, ManagerError> {
        self.exchanges
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::ProviderUnresolved(name.to_string()))
    }

    fn resolve_market(&self, name: &str) -> Result<Arc<dyn MarketProvider>, ManagerError> {
        self.markets
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::ProviderUnresolved(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub tick_interval: Duration,
    pub decision_interval: Duration,
    pub decision_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_concurrent_decisions: usize,
    pub total_equity_usd: Decimal,
    pub reserve_equity_pct: Decimal,
}

struct TraderEntry {
    config: TraderConfig,
    state: TraderRuntimeState,
    exchange: Arc<dyn ExchangeProvider>,
    market: Arc<dyn MarketProvider>,
    prompt_renderer: Arc<dyn PromptRenderer>,
}

enum Command {
    Start(String),
    Pause(String, DateTime<Utc>),
    Resume(String),
    Stop(String),
    Shutdown,
}

struct CycleResult {
    trader_id: String,
    state: TraderRuntimeState,
}

/// Scheduler over N traders. The sole writer of every [`TraderRuntimeState`]; workers only ever
/// see an owned snapshot and report completion back over a channel the scheduler drains.
pub struct Manager {
    traders: Arc<RwLock<HashMap<String, TraderEntry>>>,
    command_tx: mpsc::Sender<Command>,
    command_rx: Option<mpsc::Receiver<Command>>,
    settings: ManagerSettings,
    executor: Arc<Executor>,
    llm: Arc<dyn LLMClient>,
    prompt_renderer_factory: PromptRendererFactory,
    persistence: Arc<dyn PersistenceService>,
    conversation_recorder: Arc<dyn ConversationRecorder>,
    metrics: Arc<CycleMetrics>,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ManagerSettings,
        llm: Arc<dyn LLMClient>,
        prompt_renderer_factory: PromptRendererFactory,
        persistence: Arc<dyn PersistenceService>,
        conversation_recorder: Arc<dyn ConversationRecorder>,
        metrics: Arc<CycleMetrics>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let context_builder = crate::context::ContextBuilder::new(
            settings.decision_timeout / 4,
            settings.decision_timeout / 4,
        );
        let executor = Arc::new(Executor::new(
            context_builder,
            crate::executor::cycle::RetryConfig::default(),
            settings.decision_timeout,
            metrics.clone(),
        ));

        Self {
            traders: Arc::new(RwLock::new(HashMap::new())),
            command_tx,
            command_rx: Some(command_rx),
            settings,
            executor,
            llm,
            prompt_renderer_factory,
            persistence,
            conversation_recorder,
            metrics,
        }
    }

    #[instrument(skip_all, fields(trader_id = %config.id))]
    pub async fn register_trader(
        &self,
        config: TraderConfig,
        registry: &ProviderRegistry,
    ) -> Result<(), ManagerError> {
        let mut traders = self.traders.write().await;
        if traders.contains_key(&config.id) {
            return Err(ManagerError::DuplicateTrader(config.id.clone()));
        }

        let exchange = registry.resolve_exchange(&config.exchange_provider)?;
        let market = registry.resolve_market(&config.market_provider)?;

        if !std::path::Path::new(&config.prompt_template_path).exists() {
            return Err(ManagerError::InvalidPrompt(format!(
                "template not found: {}",
                config.prompt_template_path
            )));
        }
        let prompt_renderer = (self.prompt_renderer_factory)(&config.prompt_template_path);

        let now = Utc::now();
        let mut state = TraderRuntimeState::new(now);
        if config.auto_start {
            state.status = TraderStatus::Running;
        }

        let id = config.id.clone();
        traders.insert(
            id,
            TraderEntry {
                config,
                state,
                exchange,
                market,
                prompt_renderer,
            },
        );
        Ok(())
    }

    /// Restores each registered trader's last cycle number from persistence, so restart doesn't
    /// reset cycle numbering to zero. Call once after all traders are registered, before `run`.
    pub async fn hydrate_state(&self) -> Result<(), ManagerError> {
        let trader_ids: Vec<String> = {
            let traders = self.traders.read().await;
            traders.keys().cloned().collect()
        };
        let restored = self.persistence.hydrate_caches(&trader_ids).await?;

        let mut traders = self.traders.write().await;
        for (id, cycle_number) in restored {
            if let Some(entry) = traders.get_mut(&id) {
                entry.state.cycle_number = cycle_number;
            }
        }
        Ok(())
    }

    /// Applies the equity-adaptation pass: splits total equity evenly across registered traders
    /// and clamps each trader's size/position/candidate caps to what that share and whitelist
    /// actually support. Run once, after all traders are registered and before the scheduler
    /// starts ticking.
    pub async fn adapt_equity(&self) {
        let mut traders = self.traders.write().await;
        let count = traders.len().max(1) as u64;
        let per_trader = self.settings.total_equity_usd / Decimal::from(count);

        for entry in traders.values_mut() {
            entry.state.effective_equity_usd = per_trader;
            if entry.config.risk_params.max_position_size_usd > per_trader {
                entry.config.risk_params.max_position_size_usd = per_trader;
            }
            let whitelist_len = entry.config.exec_guards.symbol_whitelist.len();
            if entry.config.exec_guards.candidate_limit > whitelist_len {
                entry.config.exec_guards.candidate_limit = whitelist_len;
            }
            if entry.config.risk_params.max_positions > whitelist_len {
                entry.config.risk_params.max_positions = whitelist_len;
            }
        }
    }

    pub fn commands(&self) -> ManagerHandle {
        ManagerHandle {
            command_tx: self.command_tx.clone(),
        }
    }

    /// Runs the scheduling loop until a `Shutdown` command is received. Consumes `self`'s command
    /// receiver; only callable once.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .expect("Manager::run called more than once");

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_decisions));
        let (result_tx, mut result_rx) = mpsc::channel::<CycleResult>(self.settings.max_concurrent_decisions * 2);
        let mut tick = tokio::time::interval(self.settings.tick_interval);
        let mut shutting_down = false;
        let mut in_flight_count = 0usize;
        let shutdown_deadline = tokio::time::sleep(self.settings.shutdown_grace);
        tokio::pin!(shutdown_deadline);
        let mut grace_started = false;
        let shutdown_token = CancellationToken::new();
        let mut handles: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !shutting_down {
                        self.drain_commands(&mut command_rx, &mut shutting_down).await;
                        if shutting_down && !grace_started {
                            grace_started = true;
                            shutdown_deadline.as_mut().reset(tokio::time::Instant::now() + self.settings.shutdown_grace);
                        }
                        if !shutting_down {
                            in_flight_count += self
                                .dispatch_ready(&semaphore, &result_tx, &shutdown_token, &mut handles)
                                .await;
                        }
                    }
                }
                Some(result) = result_rx.recv() => {
                    in_flight_count = in_flight_count.saturating_sub(1);
                    handles.remove(&result.trader_id);
                    self.apply_result(result).await;
                }
                _ = &mut shutdown_deadline, if grace_started => {
                    warn!(in_flight_count, "shutdown grace period elapsed, forcing cancellation of in-flight cycles");
                    shutdown_token.cancel();
                    for (trader_id, handle) in handles.drain() {
                        handle.abort();
                        if let Err(e) = handle.await {
                            if !e.is_cancelled() {
                                warn!(%trader_id, error = %e, "trader task panicked during forced shutdown");
                            }
                        }
                    }
                    break;
                }
            }

            if shutting_down && in_flight_count == 0 {
                break;
            }
        }

        info!("manager scheduler loop exited cleanly");
        Ok(())
    }

    async fn drain_commands(&self, rx: &mut mpsc::Receiver<Command>, shutting_down: &mut bool) {
        while let Ok(cmd) = rx.try_recv() {
            if matches!(cmd, Command::Shutdown) {
                *shutting_down = true;
                return;
            }
            self.apply_command(cmd).await;
        }
    }

    async fn apply_command(&self, cmd: Command) {
        let mut traders = self.traders.write().await;
        match cmd {
            Command::Start(id) => {
                if let Some(entry) = traders.get_mut(&id) {
                    entry.state.status = TraderStatus::Running;
                }
            }
            Command::Pause(id, until) => {
                if let Some(entry) = traders.get_mut(&id) {
                    entry.state.status = TraderStatus::Paused;
                    entry.state.pause_until = Some(until);
                }
            }
            Command::Resume(id) => {
                if let Some(entry) = traders.get_mut(&id) {
                    entry.state.status = TraderStatus::Running;
                    entry.state.pause_until = None;
                }
            }
            Command::Stop(id) => {
                if let Some(entry) = traders.get_mut(&id) {
                    entry.state.status = TraderStatus::Stopped;
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn dispatch_ready(
        &self,
        semaphore: &Arc<Semaphore>,
        result_tx: &mpsc::Sender<CycleResult>,
        shutdown_token: &CancellationToken,
        handles: &mut HashMap<String, JoinHandle<()>>,
    ) -> usize {
        let now = Utc::now();
        let mut dispatched = 0usize;
        let mut traders = self.traders.write().await;

        for entry in traders.values_mut() {
            if entry.state.status != TraderStatus::Running {
                continue;
            }
            if entry.state.in_flight || entry.state.next_due_at > now {
                continue;
            }
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };

            entry.state.in_flight = true;
            entry.state.next_due_at = now + self.settings.decision_interval;
            self.metrics
                .trader_status
                .with_label_values(&[&entry.config.id, status_label(entry.state.status)])
                .set(1);

            let config = entry.config.clone();
            let mut state = entry.state.clone();
            let deps = ExecutorDeps {
                exchange: entry.exchange.clone(),
                market: entry.market.clone(),
                llm: self.llm.clone(),
                prompt_renderer: entry.prompt_renderer.clone(),
                persistence: self.persistence.clone(),
                conversation_recorder: self.conversation_recorder.clone(),
            };
            let executor = self.executor.clone();
            let persistence = self.persistence.clone();
            let result_tx = result_tx.clone();
            let cycle_token = shutdown_token.child_token();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let outcome = executor.run_cycle(&config, &mut state, &deps, &cycle_token).await;
                if let crate::executor::CycleOutcome::Completed(record)
                | crate::executor::CycleOutcome::Failed(record) = outcome
                {
                    let success = record.success;
                    let (accepted, rejected) = count_outcomes(&record.decisions);
                    if let Err(e) = persistence.record_decision_cycle(record).await {
                        warn!(trader_id = %config.id, error = %e, "failed to journal decision cycle");
                    }
                    if success {
                        let _ = persistence
                            .record_analytics(AnalyticsSnapshot {
                                trader_id: config.id.clone(),
                                realized_pnl_usd: Decimal::ZERO,
                                cycles_run: state.cycle_number,
                                decisions_accepted: accepted,
                                decisions_rejected: rejected,
                                taken_at: Utc::now(),
                            })
                            .await;
                    }
                }
                state.in_flight = false;
                let _ = result_tx
                    .send(CycleResult {
                        trader_id: config.id,
                        state,
                    })
                    .await;
            });
            handles.insert(entry.config.id.clone(), handle);

            dispatched += 1;
        }

        dispatched
    }

    async fn apply_result(&self, result: CycleResult) {
        let mut traders = self.traders.write().await;
        if let Some(entry) = traders.get_mut(&result.trader_id) {
            entry.state = result.state;
            self.metrics
                .trader_status
                .with_label_values(&[&result.trader_id, status_label(entry.state.status)])
                .set(1);
        }
    }
}

/// Tallies how many decisions in a completed cycle were executed/held (accepted by risk) versus
/// rejected, for the cycle's analytics snapshot.
fn count_outcomes(decisions: &[crate::domain::types::DecisionOutcomeRecord]) -> (u64, u64) {
    let rejected = decisions.iter().filter(|d| d.outcome == "rejected").count() as u64;
    let accepted = decisions.len() as u64 - rejected;
    (accepted, rejected)
}

fn status_label(status: TraderStatus) -> &'static str {
    match status {
        TraderStatus::Registered => "registered",
        TraderStatus::Running => "running",
        TraderStatus::Paused => "paused",
        TraderStatus::Stopped => "stopped",
        TraderStatus::Error => "error",
    }
}

/// A cheap, cloneable sender used by host code (CLI, signal handlers) to issue lifecycle
/// commands to a running Manager without holding a reference to it.
#[derive(Clone)]
pub struct ManagerHandle {
    command_tx: mpsc::Sender<Command>,
}

impl ManagerHandle {
    pub async fn start(&self, trader_id: impl Into<String>) {
        let _ = self.command_tx.send(Command::Start(trader_id.into())).await;
    }

    pub async fn pause_until(&self, trader_id: impl Into<String>, until: DateTime<Utc>) {
        let _ = self.command_tx.send(Command::Pause(trader_id.into(), until)).await;
    }

    pub async fn resume(&self, trader_id: impl Into<String>) {
        let _ = self.command_tx.send(Command::Resume(trader_id.into())).await;
    }

    pub async fn stop(&self, trader_id: impl Into<String>) {
        let _ = self.command_tx.send(Command::Stop(trader_id.into())).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
    }
}
