//! Poll driver for twin handlers
//!
//! Each slot runs one handler in its own task, calling `run()` with a short
//! sleep in between. A slot whose task panics is rebuilt from the factory
//! after the restart cooldown (one-for-one restart). Errors returned by
//! `run()` are logged and followed by a fixed pause; fatal ones stop the slot.

use crate::restart::RetryPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use twinsync_core::{ConfigError, HandlerState, TwinError, TwinHandler};

/// Something the host can drive
#[async_trait]
pub trait Supervised: Send + 'static {
    fn name(&self) -> &str;

    fn state(&self) -> HandlerState;

    async fn run(&mut self) -> Result<(), TwinError>;

    async fn dispose(&mut self);
}

#[async_trait]
impl Supervised for TwinHandler {
    fn name(&self) -> &str {
        TwinHandler::name(self)
    }

    fn state(&self) -> HandlerState {
        TwinHandler::state(self)
    }

    async fn run(&mut self) -> Result<(), TwinError> {
        TwinHandler::run(self).await
    }

    async fn dispose(&mut self) {
        TwinHandler::dispose(self).await
    }
}

/// Builds the handler for a slot; called again when a slot restarts
pub type HandlerFactory<H> = Arc<dyn Fn(usize) -> Result<H, ConfigError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Sleep between two `run()` calls
    pub poll_interval: Duration,

    /// Pause after `run()` returned an error
    pub error_cooldown: Duration,

    /// Pause before rebuilding a slot whose task panicked
    pub restart: RetryPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            error_cooldown: Duration::from_secs(5),
            restart: RetryPolicy::default(),
        }
    }
}

/// Runs `threads` handler instances until shut down
pub struct HandlerHost {
    config: HostConfig,
    shutdown: CancellationToken,
    states: Arc<DashMap<usize, (String, HandlerState)>>,
    slots: Vec<JoinHandle<()>>,
}

impl HandlerHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            states: Arc::new(DashMap::new()),
            slots: Vec::new(),
        }
    }

    /// Token cancelled by [`HandlerHost::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Build every handler up front so configuration errors surface here,
    /// then start polling them.
    pub fn start<H, F>(&mut self, threads: usize, factory: F) -> Result<(), ConfigError>
    where
        H: Supervised,
        F: Fn(usize) -> Result<H, ConfigError> + Send + Sync + 'static,
    {
        let factory: HandlerFactory<H> = Arc::new(factory);
        let handlers = (0..threads)
            .map(|slot| factory(slot))
            .collect::<Result<Vec<_>, _>>()?;

        for (slot, handler) in handlers.into_iter().enumerate() {
            info!(slot, handler = handler.name(), "Starting handler");
            self.slots.push(tokio::spawn(supervise(
                slot,
                handler,
                Arc::clone(&factory),
                self.config.clone(),
                self.shutdown.clone(),
                Arc::clone(&self.states),
            )));
        }
        Ok(())
    }

    /// Handler name and state per slot, ordered by slot
    pub fn states(&self) -> Vec<(String, HandlerState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_by_key(|(slot, _)| *slot);
        states.into_iter().map(|(_, state)| state).collect()
    }

    pub fn running_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_finished()).count()
    }

    /// Stop polling, dispose every handler and wait for the slots
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in futures::future::join_all(self.slots).await {
            if let Err(e) = result {
                warn!(error = %e, "Handler slot ended abnormally during shutdown");
            }
        }
        info!("Handler host stopped");
    }
}

async fn supervise<H: Supervised>(
    slot: usize,
    first: H,
    factory: HandlerFactory<H>,
    config: HostConfig,
    shutdown: CancellationToken,
    states: Arc<DashMap<usize, (String, HandlerState)>>,
) {
    let mut restart = config.restart.cooldown();
    let mut next = Some(first);

    loop {
        let handler = match next.take() {
            Some(handler) => handler,
            None => match factory(slot) {
                Ok(handler) => handler,
                Err(e) => {
                    error!(slot, error = %e, "Cannot rebuild handler, slot stopped");
                    return;
                }
            },
        };

        let task = tokio::spawn(poll(
            slot,
            handler,
            config.clone(),
            shutdown.clone(),
            Arc::clone(&states),
        ));
        match task.await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                let pause = restart.next_cooldown();
                error!(slot, cooldown_ms = pause.as_millis() as u64, "Handler panicked, restarting");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
            Err(_) => return,
        }
    }
}

async fn poll<H: Supervised>(
    slot: usize,
    mut handler: H,
    config: HostConfig,
    shutdown: CancellationToken,
    states: Arc<DashMap<usize, (String, HandlerState)>>,
) {
    while !shutdown.is_cancelled() {
        let pause = match handler.run().await {
            Ok(()) => config.poll_interval,
            Err(e) if e.is_fatal() => {
                error!(slot, handler = handler.name(), error = %e, "Fatal handler error, slot stopped");
                break;
            }
            Err(e) => {
                error!(slot, handler = handler.name(), error = %e, "Handler error");
                config.error_cooldown
            }
        };
        states.insert(slot, (handler.name().to_string(), handler.state()));

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    debug!(slot, handler = handler.name(), "Disposing handler");
    handler.dispose().await;
    states.insert(slot, (handler.name().to_string(), HandlerState::Disconnected));
}
