//! Mailbox demo - sends one email and prints whatever arrives.
//!
//! On startup this binary registers a listener on the mailbox destination,
//! publishes a single email to it, then keeps running so the listener can
//! receive it. Stops on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailbox::{broker, Broker, Config, Email, ListenerContainer, ListenerRegistry, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("mailbox_starting");

    let config = Config::from_env();
    info!(
        transport = ?config.transport,
        destination = %config.destination,
        prefetch = config.listener_prefetch,
        "config_loaded"
    );

    let broker = broker::from_config(&config);

    let mut registry = ListenerRegistry::new();
    registry
        .register(&config.destination, |email: Email| {
            println!("Received<{}>", email);
        })
        .context("Failed to register listener")?;

    let listeners = ListenerContainer::start(broker.clone(), registry)
        .await
        .context("Failed to start listeners")?;

    let publisher = Publisher::new(broker.clone());
    let email = Email::new(config.startup_email_to.clone(), config.startup_email_body.clone());

    info!(destination = %config.destination, to = %email.to(), "mailbox_sending");
    println!("Sending an email message.");

    // A failed startup send aborts the process after releasing the broker.
    if let Err(e) = publisher.send(&config.destination, &email).await {
        error!(error = %e, "mailbox_startup_send_failed");
        listeners.shutdown().await;
        broker.close().await;
        return Err(e).context("Failed to send startup email");
    }

    info!("mailbox_ready");

    shutdown_signal().await;

    listeners.shutdown().await;
    broker.close().await;

    info!("mailbox_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("mailbox_shutting_down");
}
