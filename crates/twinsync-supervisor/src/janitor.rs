//! Periodic cleanup of broker topology nobody uses anymore
//!
//! A run has three independent phases:
//!
//! 1. **Orphans**: exchanges whose owning device, user or subscription no
//!    longer exists, together with their paired queue and the owner's broker
//!    user.
//! 2. **Idle users**: broker users none of whose exchanges has a binding.
//! 3. **Unused exchanges**: exchanges without bindings whose paired queue has
//!    no consumers.
//!
//! Cleanup is best effort. A phase that fails reports its error and the next
//! phase still runs. Root, bridge and broker-internal (`amq.*`) exchanges,
//! privileged users and configured protected users are never touched.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinsync_core::broker::{BindingInfo, ExchangeInfo, ManagementApi, UserInfo};
use twinsync_core::naming::{self, TopologyOwner};
use twinsync_core::storage::{KnownEntities, SubscriptionKey};
use twinsync_core::DeviceId;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Runs closer together than this are skipped
    pub min_interval: Duration,

    /// Broker users never deleted regardless of tags
    pub protected_users: HashSet<String>,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(300),
            protected_users: HashSet::from(["guest".to_string()]),
        }
    }
}

/// Result of one phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseOutcome {
    pub deleted: usize,
    pub error: Option<String>,
}

impl PhaseOutcome {
    fn failed(deleted: usize, error: &anyhow::Error) -> Self {
        Self {
            deleted,
            error: Some(format!("{error:#}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JanitorReport {
    pub orphans: PhaseOutcome,
    pub idle_users: PhaseOutcome,
    pub unused_exchanges: PhaseOutcome,
}

impl JanitorReport {
    pub fn total_deleted(&self) -> usize {
        self.orphans.deleted + self.idle_users.deleted + self.unused_exchanges.deleted
    }
}

/// Live entities from the repository
struct Known {
    devices: HashSet<DeviceId>,
    users: HashSet<String>,
    subscriptions: HashSet<SubscriptionKey>,
}

impl Known {
    fn is_live_user(&self, name: &str) -> bool {
        self.users.contains(name) || self.devices.contains(&DeviceId::new(name))
    }

    fn is_orphaned(&self, owner: &TopologyOwner) -> bool {
        match owner {
            TopologyOwner::Device(mid) => !self.devices.contains(mid),
            TopologyOwner::User(user_id) | TopologyOwner::Temporary { user_id } => {
                !self.is_live_user(user_id)
            }
            TopologyOwner::Whitelist { user_id, key } | TopologyOwner::Persistent { user_id, key } => {
                !self.subscriptions.contains(&SubscriptionKey::new(user_id.as_str(), key.as_str()))
            }
            // Templates are not tracked by the repository interface
            TopologyOwner::Template(_) | TopologyOwner::Root | TopologyOwner::Bridge => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ObjectKind {
    Exchange,
    Queue,
    User,
}

impl ObjectKind {
    fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Exchange => "exchange",
            ObjectKind::Queue => "queue",
            ObjectKind::User => "user",
        }
    }
}

/// Exchange this janitor may delete, with its owner
fn managed(exchange: &ExchangeInfo) -> Option<TopologyOwner> {
    if exchange.name.is_empty() || exchange.name.starts_with("amq.") {
        return None;
    }
    naming::classify_exchange(&exchange.name).filter(|owner| !owner.is_infrastructure())
}

pub struct Janitor {
    api: Arc<dyn ManagementApi>,
    known: Arc<dyn KnownEntities>,
    config: JanitorConfig,
    last_run: Option<Instant>,
}

impl Janitor {
    pub fn new(api: Arc<dyn ManagementApi>, known: Arc<dyn KnownEntities>, config: JanitorConfig) -> Self {
        Self {
            api,
            known,
            config,
            last_run: None,
        }
    }

    /// Run unless the previous run was less than `min_interval` ago
    pub async fn run_if_due(&mut self) -> Option<JanitorReport> {
        if let Some(last) = self.last_run {
            if last.elapsed() < self.config.min_interval {
                debug!("Janitor run skipped, interval not elapsed");
                return None;
            }
        }
        self.last_run = Some(Instant::now());
        Some(self.run_once().await)
    }

    pub async fn run_once(&self) -> JanitorReport {
        let report = JanitorReport {
            orphans: phase("orphans", self.delete_orphans()).await,
            idle_users: phase("idle_users", self.delete_idle_users()).await,
            unused_exchanges: phase("unused_exchanges", self.delete_unused_exchanges()).await,
        };
        info!(
            orphans = report.orphans.deleted,
            idle_users = report.idle_users.deleted,
            unused_exchanges = report.unused_exchanges.deleted,
            "Janitor run complete"
        );
        report
    }

    async fn live_entities(&self) -> Result<Known> {
        Ok(Known {
            devices: self.known.active_devices().await?,
            users: self.known.active_users().await?,
            subscriptions: self.known.active_subscriptions().await?,
        })
    }

    fn deletable_user(&self, user: &UserInfo) -> bool {
        !user.is_privileged() && !self.config.protected_users.contains(&user.name)
    }

    /// Delete, remembering the first failure but carrying on
    async fn attempt(
        &self,
        kind: ObjectKind,
        name: &str,
        first_error: &mut Option<anyhow::Error>,
    ) -> bool {
        let result = match kind {
            ObjectKind::Exchange => self.api.delete_exchange(name).await,
            ObjectKind::Queue => self.api.delete_queue(name).await,
            ObjectKind::User => self.api.delete_user(name).await,
        };
        match result {
            Ok(()) => {
                info!(kind = kind.as_str(), name, "Deleted unused broker object");
                true
            }
            Err(e) => {
                warn!(kind = kind.as_str(), name, error = %e, "Delete failed");
                first_error.get_or_insert(e);
                false
            }
        }
    }

    async fn delete_orphans(&self) -> (usize, Result<()>) {
        let listed = async {
            let known = self.live_entities().await?;
            let exchanges = self.api.list_exchanges().await?;
            let queues = self.api.list_queues().await?;
            let users = self.api.list_users().await?;
            anyhow::Ok((known, exchanges, queues, users))
        }
        .await;
        let (known, exchanges, queues, users) = match listed {
            Ok(listed) => listed,
            Err(e) => return (0, Err(e)),
        };

        let queue_names: HashSet<&str> = queues.iter().map(|q| q.name.as_str()).collect();
        let mut deleted = 0;
        let mut first_error = None;
        let mut owners = HashSet::new();

        for exchange in &exchanges {
            let Some(owner) = managed(exchange) else { continue };
            if !known.is_orphaned(&owner) {
                continue;
            }
            if self.attempt(ObjectKind::Exchange, &exchange.name, &mut first_error).await {
                deleted += 1;
            }
            let queue = naming::paired_queue(&exchange.name);
            if queue_names.contains(queue.as_str())
                && self.attempt(ObjectKind::Queue, &queue, &mut first_error).await
            {
                deleted += 1;
            }
            if let Some(user) = owner.user() {
                owners.insert(user.to_string());
            }
        }

        for user in users.iter().filter(|u| owners.contains(&u.name)) {
            if known.is_live_user(&user.name) || !self.deletable_user(user) {
                continue;
            }
            if self.attempt(ObjectKind::User, &user.name, &mut first_error).await {
                deleted += 1;
            }
        }

        (deleted, first_error.map_or(Ok(()), Err))
    }

    async fn delete_idle_users(&self) -> (usize, Result<()>) {
        let listed = async {
            let users = self.api.list_users().await?;
            let exchanges = self.api.list_exchanges().await?;
            let bindings = self.api.list_bindings().await?;
            anyhow::Ok((users, exchanges, bindings))
        }
        .await;
        let (users, exchanges, bindings) = match listed {
            Ok(listed) => listed,
            Err(e) => return (0, Err(e)),
        };

        // Users owning at least one bound exchange
        let bound: HashSet<String> = exchanges
            .iter()
            .filter_map(|e| managed(e).map(|owner| (e, owner)))
            .filter(|(e, _)| is_bound(&bindings, &e.name))
            .filter_map(|(_, owner)| owner.user().map(String::from))
            .collect();

        let mut deleted = 0;
        let mut first_error = None;
        for user in users.iter().filter(|u| self.deletable_user(u)) {
            if bound.contains(&user.name) {
                continue;
            }
            if self.attempt(ObjectKind::User, &user.name, &mut first_error).await {
                deleted += 1;
            }
        }
        (deleted, first_error.map_or(Ok(()), Err))
    }

    async fn delete_unused_exchanges(&self) -> (usize, Result<()>) {
        let listed = async {
            let exchanges = self.api.list_exchanges().await?;
            let bindings = self.api.list_bindings().await?;
            let queues = self.api.list_queues().await?;
            anyhow::Ok((exchanges, bindings, queues))
        }
        .await;
        let (exchanges, bindings, queues) = match listed {
            Ok(listed) => listed,
            Err(e) => return (0, Err(e)),
        };

        let mut deleted = 0;
        let mut first_error = None;
        for exchange in exchanges.iter().filter(|e| managed(e).is_some()) {
            if is_bound(&bindings, &exchange.name) {
                continue;
            }
            let queue = naming::paired_queue(&exchange.name);
            let paired = queues.iter().find(|q| q.name == queue);
            if paired.is_some_and(|q| q.consumers > 0) {
                continue;
            }
            if self.attempt(ObjectKind::Exchange, &exchange.name, &mut first_error).await {
                deleted += 1;
            }
            if paired.is_some() && self.attempt(ObjectKind::Queue, &queue, &mut first_error).await {
                deleted += 1;
            }
        }
        (deleted, first_error.map_or(Ok(()), Err))
    }
}

async fn phase(name: &'static str, work: impl Future<Output = (usize, Result<()>)>) -> PhaseOutcome {
    let (deleted, result) = work.await;
    match result {
        Ok(()) => PhaseOutcome {
            deleted,
            error: None,
        },
        Err(e) => {
            warn!(phase = name, deleted, error = %e, "Janitor phase failed");
            PhaseOutcome::failed(deleted, &e)
        }
    }
}

fn is_bound(bindings: &[BindingInfo], exchange: &str) -> bool {
    bindings.iter().any(|b| b.touches(exchange))
}

/// Drives a [`Janitor`] on a fixed tick until cancelled
pub struct JanitorService {
    janitor: Janitor,
    tick: Duration,
}

impl JanitorService {
    pub fn new(janitor: Janitor, tick: Duration) -> Self {
        Self { janitor, tick }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(report) = self.janitor.run_if_due().await {
                        debug!(total = report.total_deleted(), "Janitor tick");
                    }
                }
            }
        }
        info!("Janitor stopped");
    }
}
