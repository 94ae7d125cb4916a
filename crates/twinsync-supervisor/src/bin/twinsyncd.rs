//! twinsyncd: observation ingestion daemon
//!
//! Configuration comes from `TWINSYNC_*` variables (see `settings`), logging
//! from `RUST_LOG`.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use twinsync_core::broker::mqtt::MqttConnector;
use twinsync_core::broker::Connector;
use twinsync_core::storage::SledStore;
use twinsync_core::{MetadataCache, TwinHandler};
use twinsync_supervisor::{
    HandlerHost, HostConfig, HttpManagementApi, Janitor, JanitorConfig, JanitorService, Settings,
};

fn init_tracing(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("twinsync=info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env().context("loading settings")?;
    init_tracing(settings.log_json);

    info!(
        broker = %settings.broker,
        queue = %settings.consumer.queue,
        threads = settings.consumer.threads,
        batch_size = settings.consumer.batch_size,
        "Starting twinsyncd"
    );

    let store_path = settings.store_path.to_string_lossy().into_owned();
    let store = Arc::new(SledStore::new(&store_path).with_context(|| format!("opening {store_path}"))?);
    let cache = Arc::new(MetadataCache::new(store.clone(), store.clone()));
    match cache.preload().await {
        Ok((devices, templates)) => info!(devices, templates, "Metadata cache warmed"),
        Err(e) => warn!(error = %e, "Cache preload failed, resolving lazily"),
    }

    let mut host = HandlerHost::new(HostConfig {
        poll_interval: settings.poll_interval,
        error_cooldown: settings.consumer.reconnect_cooldown(),
        restart: settings.restart.clone(),
    });

    let factory_settings = settings.clone();
    let (handler_cache, handler_store) = (Arc::clone(&cache), store.clone());
    host.start(settings.consumer.threads, move |slot| {
        let connector: Arc<dyn Connector> = Arc::new(
            MqttConnector::new(format!("{}-{slot}", factory_settings.broker.user))
                .with_port(factory_settings.mqtt_port),
        );
        Ok(TwinHandler::new(
            format!("observation-{slot}"),
            factory_settings.broker.clone(),
            factory_settings.consumer.clone(),
            connector,
            Arc::clone(&handler_cache),
            handler_store.clone(),
        )?
        .with_cooldown(factory_settings.restart.cooldown()))
    })
    .context("starting handlers")?;

    let janitor = match &settings.management {
        Some(management) => {
            let api = Arc::new(HttpManagementApi::new(management)?);
            let janitor = Janitor::new(
                api,
                store.clone(),
                JanitorConfig {
                    min_interval: settings.janitor_interval,
                    protected_users: settings.protected_users.clone(),
                },
            );
            let service = JanitorService::new(janitor, settings.janitor_interval);
            Some(tokio::spawn(service.run(host.shutdown_token())))
        }
        None => {
            info!("No management endpoint configured, janitor disabled");
            None
        }
    };

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    host.shutdown().await;
    if let Some(janitor) = janitor {
        let _ = janitor.await;
    }
    Ok(())
}
