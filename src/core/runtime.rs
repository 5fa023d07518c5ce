//! Main runtime orchestration.
//!
//! The runtime owns the scheduler and one background worker task that:
//! - drains the transaction queue whenever a transaction is submitted
//! - re-runs due retries every `retry_tick_ms`
//! - refreshes against the dataplane every `refresh_period_ms` (if non-zero)
//!
//! Engine work is blocking, so the worker hands it to `spawn_blocking`.

use crate::core::config::{Config, SchedulerConfig};
use crate::descriptor::DescriptorRegistry;
use crate::scheduler::{RefreshReport, Scheduler, Transaction, TxnReport};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is degraded but functional.
    Degraded,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Transaction engine health.
    pub scheduler: ComponentHealth,
    /// Background worker health.
    pub worker: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            scheduler: ComponentHealth::Starting,
            worker: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime accepts transactions.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.scheduler, self.worker),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy | ComponentHealth::Degraded
            )
        )
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        !matches!(
            (self.scheduler, self.worker),
            (ComponentHealth::Failed, _) | (_, ComponentHealth::Failed)
        )
    }
}

/// Trellis runtime holding the scheduler and its worker.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// The engine.
    scheduler: Arc<Scheduler>,

    /// Runtime health status.
    health: Arc<RwLock<RuntimeHealth>>,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// Worker task handle.
    worker: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Create a new runtime over the given descriptors.
    pub fn new(config: Config, registry: DescriptorRegistry) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let scheduler = Scheduler::new(registry, SchedulerConfig::from(&config));
        Ok(Self::with_scheduler(config, Arc::new(scheduler)))
    }

    /// Create a runtime around an existing scheduler.
    pub fn with_scheduler(config: Config, scheduler: Arc<Scheduler>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config: Arc::new(config),
            scheduler,
            health: Arc::new(RwLock::new(RuntimeHealth::default())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            worker: None,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Get the current health status.
    pub fn health(&self) -> RuntimeHealth {
        self.health.read().clone()
    }

    /// Check if the runtime is ready to accept transactions.
    pub fn is_ready(&self) -> bool {
        self.health.read().is_ready()
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.read().is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Start the background worker.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            anyhow::bail!("runtime already running");
        }
        let s = &self.config.scheduler;
        tracing::info!(
            descriptors = self.scheduler.registry().len(),
            retry_tick_ms = s.retry_tick_ms,
            refresh_period_ms = s.refresh_period_ms,
            "starting Trellis runtime"
        );
        self.health.write().scheduler = ComponentHealth::Healthy;

        let worker = Worker {
            scheduler: Arc::clone(&self.scheduler),
            health: Arc::clone(&self.health),
            retry_tick: Duration::from_millis(s.retry_tick_ms),
            refresh_period: (s.refresh_period_ms > 0)
                .then(|| Duration::from_millis(s.refresh_period_ms)),
        };
        let shutdown_rx = self.shutdown_rx.clone();
        self.worker = Some(tokio::spawn(worker.run(shutdown_rx)));
        self.health.write().worker = ComponentHealth::Healthy;

        self.running.store(true, Ordering::Release);
        tracing::info!("Trellis runtime started");
        Ok(())
    }

    /// Submit a transaction and wait for its report.
    pub async fn commit(&self, txn: Transaction) -> Result<TxnReport> {
        if !self.is_running() {
            anyhow::bail!("runtime not running");
        }
        let ticket = self
            .scheduler
            .submit(txn)
            .context("failed to submit transaction")?;
        ticket.wait().await.context("transaction dropped")
    }

    /// Run a refresh now.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let scheduler = Arc::clone(&self.scheduler);
        tokio::task::spawn_blocking(move || scheduler.refresh())
            .await
            .context("refresh task panicked")
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until Ctrl-C or a shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait_for_signal().await;
        self.stop().await
    }

    /// Wait for Ctrl-C or a shutdown request.
    pub async fn wait_for_signal(&mut self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }
    }

    /// Stop the worker, close the queue and settle whatever is still queued.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping Trellis runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        self.scheduler.close();

        self.health.write().worker = ComponentHealth::Stopping;
        if let Some(handle) = self.worker.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => tracing::debug!("worker stopped"),
                Ok(Err(e)) => tracing::warn!(error = %e, "worker task panicked"),
                Err(_) => tracing::warn!("worker stop timed out"),
            }
        }
        self.health.write().worker = ComponentHealth::Stopped;

        self.health.write().scheduler = ComponentHealth::Stopping;
        let scheduler = Arc::clone(&self.scheduler);
        let drained = tokio::task::spawn_blocking(move || scheduler.drain_queue())
            .await
            .context("final drain panicked")?;
        if drained > 0 {
            tracing::info!(drained, "applied transactions queued before shutdown");
        }
        self.health.write().scheduler = ComponentHealth::Stopped;

        tracing::info!("Trellis runtime stopped");
        Ok(())
    }
}

/// Background task driving the scheduler.
struct Worker {
    scheduler: Arc<Scheduler>,
    health: Arc<RwLock<RuntimeHealth>>,
    retry_tick: Duration,
    refresh_period: Option<Duration>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut retry_timer = tokio::time::interval(self.retry_tick);
        retry_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh_timer = self.refresh_period.map(|period| {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        // Transactions submitted before start.
        self.blocking("drain", |s| {
            s.drain_queue();
        })
        .await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.scheduler.queue().notified() => {
                    self.blocking("drain", |s| {
                        s.drain_queue();
                    })
                    .await;
                }
                _ = retry_timer.tick() => {
                    let due = self
                        .scheduler
                        .next_retry_deadline()
                        .map_or(false, |deadline| self.scheduler.now().is_at_or_after(deadline));
                    if due {
                        self.blocking("retry", |s| {
                            s.process_retries();
                        })
                        .await;
                    }
                }
                _ = tick(&mut refresh_timer) => {
                    self.blocking("refresh", |s| {
                        s.refresh();
                    })
                    .await;
                }
            }
        }
        tracing::debug!("worker loop exited");
    }

    async fn blocking(&self, what: &'static str, f: impl FnOnce(&Scheduler) + Send + 'static) {
        let scheduler = Arc::clone(&self.scheduler);
        if let Err(e) = tokio::task::spawn_blocking(move || f(&scheduler)).await {
            tracing::error!(task = what, error = %e, "scheduler task panicked");
            self.health.write().worker = ComponentHealth::Degraded;
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
