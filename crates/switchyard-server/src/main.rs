// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Switchyard - trigger routing and durable execution server

use std::sync::Arc;

use switchyard_core::{
    AlertDispatcher, CronSource, DeliveryQueue, EventDispatcher, EventForwarder,
    NotificationChannel, RetryPolicy, RetrySweeper, RetrySweeperConfig, StepRuntime,
    StepRuntimeConfig, TriggerRegistry, persistence,
};
use switchyard_server::notify::{LogChannel, WebhookChannel};
use switchyard_server::workflows::{WorkflowDeps, reference_catalog, register_triggers};
use switchyard_server::{AppState, Config, build_internal_router, build_public_router};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "switchyard=info,switchyard_core=info,switchyard_server=info,tower_http=info"
                    .into()
            }),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        public_addr = %config.public_addr,
        internal_addr = %config.internal_addr,
        mode = ?config.mode,
        "Starting switchyard"
    );

    let persistence = persistence::connect(&config.database_url, config.max_connections).await?;

    let channel: Arc<dyn NotificationChannel> = match &config.notify_url {
        Some(url) => {
            info!(url = %url, "Notifications go to webhook");
            Arc::new(WebhookChannel::new(url.clone(), config.forward_timeout)?)
        }
        None => {
            info!("No notification URL configured, notifications are logged");
            Arc::new(LogChannel)
        }
    };

    let deps = WorkflowDeps {
        alerts: Arc::new(AlertDispatcher::new(persistence.clone(), channel.clone())),
        channel,
    };
    let catalog = Arc::new(reference_catalog(&deps)?);

    let mut registry = TriggerRegistry::new();
    register_triggers(&mut registry, config.mode)?;
    let registry = Arc::new(registry);

    let runtime = Arc::new(StepRuntime::new(
        persistence.clone(),
        catalog,
        StepRuntimeConfig {
            default_retry: RetryPolicy::for_mode(config.mode),
            step_timeout: config.step_timeout,
            ..StepRuntimeConfig::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Delivery: public ingress -> forwarder -> internal listener; cron and
    // injected events go through the queue first
    let (queue, queue_rx) = DeliveryQueue::default_bounded();
    let forwarder = EventForwarder::new(config.internal_base_url(), config.forward_timeout)?;
    let dispatcher = Arc::new(EventDispatcher::new(
        registry.clone(),
        forwarder,
        queue.clone(),
    ));
    let dispatcher_task = tokio::spawn(dispatcher.clone().run(queue_rx, shutdown_rx.clone()));

    let cron = Arc::new(CronSource::new(
        registry.clone(),
        runtime.clone(),
        queue.clone(),
    ));
    let cron_task = tokio::spawn(cron.clone().run(shutdown_rx.clone()));

    let sweeper = RetrySweeper::new(
        runtime.clone(),
        RetrySweeperConfig {
            poll_interval: config.retry_poll_interval,
            ..RetrySweeperConfig::default()
        },
    );
    let sweeper_task = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    let state = AppState {
        runtime,
        registry,
        dispatcher,
        queue,
        cron,
    };

    let internal_listener = tokio::net::TcpListener::bind(config.internal_addr).await?;
    let public_listener = tokio::net::TcpListener::bind(config.public_addr).await?;

    let internal_server = tokio::spawn({
        let router = build_internal_router(state.clone());
        let shutdown = wait_for_shutdown(shutdown_rx.clone());
        async move {
            axum::serve(internal_listener, router)
                .with_graceful_shutdown(shutdown)
                .await
        }
    });
    let public_server = tokio::spawn({
        let router = build_public_router(state);
        let shutdown = wait_for_shutdown(shutdown_rx.clone());
        async move {
            axum::serve(public_listener, router)
                .with_graceful_shutdown(shutdown)
                .await
        }
    });

    info!(
        public_addr = %config.public_addr,
        internal_addr = %config.internal_addr,
        "Switchyard ready"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if shutdown_tx.send(true).is_err() {
        warn!("All background tasks already stopped");
    }

    for (name, task) in [("public", public_server), ("internal", internal_server)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(listener = name, error = %e, "Listener failed"),
            Err(e) => error!(listener = name, error = %e, "Listener task panicked"),
        }
    }
    for (name, task) in [
        ("dispatcher", dispatcher_task),
        ("cron", cron_task),
        ("sweeper", sweeper_task),
    ] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task panicked");
        }
    }

    persistence.close().await;
    info!("Switchyard shut down");

    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
