// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! HTTP route handlers for the signer API.
//!
//! | Method | Path | Handler | Description |
//! |--------|------|---------|-------------|
//! | GET | `/healthz` | [`health`] | Liveness check |
//! | POST | `/sign` | [`sign`] | Sign a certificate signing request |
//!
//! Unknown paths are answered by [`not_found`], known paths with the wrong
//! method by [`method_not_allowed`].

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;

use crate::application::AppState;
use crate::errors::AppError;
use crate::models::{SignRequest, SignResponse};
use crate::subject::DerivedIdentity;

/// Health check endpoint. Never consults the certificate authority.
///
/// # Response
///
/// `200 OK` with the body `ok`.
pub async fn health() -> &'static str {
    "ok"
}

/// Signs a certificate signing request through the provisioner.
///
/// # Request Flow
///
/// 1. Read the body and parse it as a [`SignRequest`]
/// 2. Check that a CSR is present and that its signature verifies
/// 3. Derive the token subject and SANs from the CSR
/// 4. Mint a one-time token for exactly that subject and SAN set
/// 5. Forward the CSR, token and requested validity to the CA
/// 6. Return the CA's [`SignResponse`] with `201 Created`
///
/// # Errors
///
/// - [`AppError::BadRequest`] - Unreadable body, bad JSON, missing or invalid CSR
/// - [`AppError::PayloadTooLarge`] - Body over the configured limit
/// - [`AppError::Upstream`] - Token minting or signing failed
#[tracing::instrument(skip(state, body))]
pub async fn sign(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<SignResponse>), AppError> {
    // 1. Parse
    let body = body.map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge
        } else {
            AppError::BadRequest(format!("error reading request body: {}", e.body_text()))
        }
    })?;
    let request: SignRequest = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!("[signer] rejecting request body: {}", e);
        AppError::BadRequest(format!("error reading request body: {e}"))
    })?;

    // 2. Validate
    let csr = request.validate().inspect_err(|e| {
        tracing::debug!("[signer] rejecting csr: {}", e);
    })?;

    // 3. Derive the identity the token is scoped to
    let identity = DerivedIdentity::from_csr(csr);
    tracing::debug!(
        subject = %identity.subject,
        sans = ?identity.sans,
        "[signer] derived identity"
    );

    // 4. Mint the token
    let token = state
        .provisioner
        .token(&identity.subject, &identity.sans)
        .await?;

    // 5. Sign, consuming the token
    let response = state
        .provisioner
        .sign(csr, token, request.not_after.as_ref())
        .await?;

    tracing::info!(subject = %identity.subject, "[signer] signed certificate");

    // 6. Render
    Ok((StatusCode::CREATED, Json(response)))
}

/// Fallback for unknown paths.
pub async fn not_found() -> AppError {
    AppError::NotFound
}

/// Fallback for known paths requested with an unsupported method.
pub async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}
