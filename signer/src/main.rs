// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::sync::Arc;

use anyhow::Context;
use ca_signer::application::Application;
use ca_signer::configuration::{Config, LogFormat, SignerOptions};
use ca_signer::constants::LOOPBACK_ADDRESS;
use ca_signer::provisioner::{Provisioner, ProvisionerSettings, StepProvisioner};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()))
}

fn init_tracing(format: LogFormat) {
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter())
            // the span list already carries the current span's fields
            .with_current_span(false)
            .with_ansi(false)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_ansi(false)
            .with_target(false)
            .init(),
    }
}

/// Cancels `shutdown` on Ctrl-C or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "[signer] unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "[signer] unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("[signer] received ctrl-c"),
        () = terminate => tracing::info!("[signer] received SIGTERM"),
    }

    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = SignerOptions::parse();
    let config = Config::load(&options.config)?;

    init_tracing(config.log_format());

    tracing::info!("[signer] {:?}", &config);

    let root_pem = config.read_root_ca()?;
    let password = config.read_password()?;

    tracing::info!(
        name = %options.provisioner_name,
        kid = %options.provisioner_kid,
        "[signer] loading provisioner"
    );

    let provisioner = StepProvisioner::connect(ProvisionerSettings {
        name: options.provisioner_name,
        kid: options.provisioner_kid,
        ca_url: config.ca_url.clone(),
        root_pem: root_pem.clone(),
        password,
    })
    .await
    .context("error loading provisioner")?;

    let service = config.service();
    let token = provisioner
        .token(service, &[service.to_string(), LOOPBACK_ADDRESS.to_string()])
        .await
        .context("error generating bootstrap token")?;

    tracing::info!(service = %service, "[signer] generated bootstrap token");

    let provisioner: Arc<dyn Provisioner> = Arc::new(provisioner);
    let application =
        Application::bootstrap(config.bind_address()?, provisioner, token, &root_pem).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    application.run_until_stopped(shutdown).await?;

    Ok(())
}
