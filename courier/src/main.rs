//! Process bootstrap for the courier mail dispatch worker.
//!
//! Wiring order: configuration, log-event sink, bus consumer, template
//! store, DKIM signer, SMTP sender. Every fallible step happens before the
//! consume loop starts, so a misconfigured worker dies at startup; after
//! that, only the dispatch loop runs until SIGINT/SIGTERM.

mod bus;
mod dispatcher;
mod error;
mod store;

use std::sync::Arc;

use clap::Parser;

use courier_common::config::Config;
use courier_common::events::EventSink;
use courier_delivery::{DeliveryConfig, Sender};
use courier_mail::{MessageSigner, SenderProfile};
use courier_smtp::SmtpProfile;

use crate::bus::BusConnection;
use crate::dispatcher::Dispatcher;
use crate::error::SetupError;
use crate::store::MongoTemplateStore;

/// Queue-driven mail dispatch worker.
#[derive(Debug, Parser)]
#[command(name = "courier", version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long = "config-path", default_value = "./config/config.yaml")]
    config_path: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), SetupError> {
    let args = Args::parse();
    courier_common::logging::init();

    let config = Config::from_path(&args.config_path)?;

    let logs = BusConnection::connect(&config.bus.logs.url).await?;
    let publisher = logs.log_publisher(&config.bus.logs.queue).await?;
    let events = Arc::new(EventSink::new(Arc::new(publisher), &config.server.name));

    let intake = BusConnection::connect(&config.bus.email.url).await?;
    let consumer = intake.mail_consumer(&config.bus.email.queue).await?;

    let store = Arc::new(MongoTemplateStore::connect(&config.templates).await?);

    let signer = match &config.smtp.dkim {
        Some(dkim) => {
            let pem = std::fs::read_to_string(&dkim.private_key_path)?;
            Some(Arc::new(MessageSigner::new(
                &pem,
                &dkim.domain,
                &dkim.selector,
            )?))
        }
        None => {
            tracing::info!("dkim signing is disabled");
            None
        }
    };

    let profile = Arc::new(SmtpProfile::from_config(&config.smtp));
    let sender = Arc::new(Sender::new(profile, DeliveryConfig::default()));
    sender.preflight().await?;

    let sender_profile = Arc::new(SenderProfile::new(
        &config.smtp.name,
        &config.smtp.username,
        &config.smtp.errors_to,
        &config.smtp.return_path,
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        Arc::clone(&sender),
        Arc::clone(&events),
        sender_profile,
        signer,
    ));

    if let Err(err) = events.info("service started successfully").await {
        tracing::warn!("failed to publish startup event: {err}");
    }

    dispatcher.run(consumer, shutdown_signal()).await;

    sender.shutdown().await;
    tracing::info!("shut down cleanly");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::error!("failed to install SIGTERM handler: {err}");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
