// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::constants::{MAX_REQUEST_BODY_SIZE, REQUEST_TIMEOUT, SHUTDOWN_GRACE_PERIOD};
use crate::errors::{AppError, ProvisionerError, StartupError};
use crate::identity::IdentityResolver;
use crate::models::OneTimeToken;
use crate::provisioner::Provisioner;
use crate::renewal::Renewer;
use crate::routes;

pub struct AppState {
    pub provisioner: Arc<dyn Provisioner>,
}

/// A bootstrapped server: enrolled identity, bound listener and TLS
/// configuration, ready to serve.
pub struct Application {
    port: u16,
    listener: TcpListener,
    tls_config: RustlsConfig,
    router: Router,
    provisioner: Arc<dyn Provisioner>,
    resolver: Arc<IdentityResolver>,
}

impl Application {
    /// Exchanges the enrollment `token` for the server identity and binds
    /// `address`. Every failure here is fatal.
    #[tracing::instrument(skip(provisioner, token, root_pem))]
    pub async fn bootstrap(
        address: SocketAddr,
        provisioner: Arc<dyn Provisioner>,
        token: OneTimeToken,
        root_pem: &str,
    ) -> Result<Self, StartupError> {
        let identity = provisioner
            .bootstrap(token)
            .await
            .map_err(StartupError::Enrollment)?;

        tracing::info!(
            not_after = %humantime::format_rfc3339_seconds(identity.not_after()),
            "[signer] enrolled server identity"
        );

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let resolver = IdentityResolver::new(provider.clone(), identity)
            .map_err(|e| StartupError::Enrollment(ProvisionerError::from(e)))?;
        let resolver = Arc::new(resolver);
        let server_config = tls_server_config(provider, resolver.clone(), root_pem)?;

        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        tracing::info!("[signer] listening at https://{}:{}", address.ip(), port);

        Ok(Self {
            port,
            listener,
            tls_config: RustlsConfig::from_config(server_config),
            router: create_router(provisioner.clone()),
            provisioner,
            resolver,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    /// Serves until `shutdown` is cancelled, renewing the server identity in
    /// the background. In-flight requests get [`SHUTDOWN_GRACE_PERIOD`] to
    /// finish.
    pub async fn run_until_stopped(self, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        let renewer = Renewer::new(self.provisioner.clone(), self.resolver.clone());
        let renewal = tokio::spawn(renewer.run(shutdown.child_token()));

        let handle = Handle::new();
        let watcher = {
            let handle = handle.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                tracing::info!("[signer] shutting down");
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
            })
        };

        let result = axum_server::from_tcp_rustls(self.listener, self.tls_config)
            .handle(handle)
            .serve(self.router.into_make_service())
            .await;

        // the server may also exit on its own; stop the renewer either way
        shutdown.cancel();
        if let Err(e) = renewal.await {
            tracing::error!(error = %e, "[signer] renewal task failed");
        }
        watcher.abort();

        tracing::info!("[signer] stopped");
        result
    }
}

/// Router with every route and middleware used in production.
pub fn create_router(provisioner: Arc<dyn Provisioner>) -> Router {
    let state = Arc::new(AppState { provisioner });

    Router::new()
        .route("/healthz", get(routes::health))
        .route("/sign", post(routes::sign))
        .fallback(routes::not_found)
        .method_not_allowed_fallback(routes::method_not_allowed)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_SIZE))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_: tower::BoxError| async {
                    AppError::RequestTimeout
                }))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// TLS configuration serving the resolver's current identity. Client
/// certificates are optional, and verified against the root CA when sent.
pub fn tls_server_config(
    provider: Arc<CryptoProvider>,
    resolver: Arc<IdentityResolver>,
    root_pem: &str,
) -> Result<Arc<ServerConfig>, StartupError> {
    let mut roots = RootCertStore::empty();
    for block in pem::parse_many(root_pem).map_err(|e| StartupError::Tls(e.to_string()))? {
        if block.tag() == "CERTIFICATE" {
            roots.add(CertificateDer::from(block.into_contents()))?;
        }
    }
    if roots.is_empty() {
        return Err(StartupError::Tls("no root certificate".to_string()));
    }

    let client_verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()
        .map_err(|e| StartupError::Tls(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(client_verifier)
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
