// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::csr::CsrError;
use crate::identity::IdentityError;
use crate::token::TokenError;

/// Errors surfaced at the HTTP boundary.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Upstream(#[from] ProvisionerError),
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("request timed out")]
    RequestTimeout,
    #[error("internal server error")]
    InternalServerError,
}

/// Failures reported by a [`Provisioner`](crate::provisioner::Provisioner).
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProvisionerError {
    /// The CA answered with an error status.
    #[error("certificate authority returned {status}: {message}")]
    Upstream { status: u16, message: String },
    /// The CA could not be reached.
    #[error("certificate authority unavailable: {0}")]
    Unavailable(String),
    #[error("invalid response from certificate authority: {0}")]
    InvalidResponse(String),
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("csr error: {0}")]
    Csr(#[from] CsrError),
}

impl ProvisionerError {
    /// HTTP status this failure is surfaced with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Unavailable(_) | Self::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            Self::Token(_) | Self::Identity(_) | Self::Csr(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to a client.
    fn public_message(&self) -> String {
        match self {
            Self::Upstream { message, .. } => message.clone(),
            Self::Unavailable(_) => "certificate authority unavailable".to_string(),
            Self::InvalidResponse(_) => "invalid response from certificate authority".to_string(),
            Self::Token(_) | Self::Identity(_) | Self::Csr(_) => "Internal Server Error".to_string(),
        }
    }
}

/// Machine readable error kind for a status code.
pub fn kind_for_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "bad_request",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "not_found",
        StatusCode::METHOD_NOT_ALLOWED => "method_not_allowed",
        StatusCode::REQUEST_TIMEOUT => "request_timeout",
        StatusCode::CONFLICT => "conflict",
        StatusCode::PAYLOAD_TOO_LARGE => "payload_too_large",
        StatusCode::TOO_MANY_REQUESTS => "too_many_requests",
        StatusCode::BAD_GATEWAY => "bad_gateway",
        StatusCode::SERVICE_UNAVAILABLE => "service_unavailable",
        StatusCode::GATEWAY_TIMEOUT => "gateway_timeout",
        s if s.is_client_error() => "client_error",
        _ => "internal_error",
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Upstream(err) => {
                tracing::error!(error = %err, "[signer] upstream failure");
                (err.status(), err.public_message())
            }
            Self::NotFound => (StatusCode::NOT_FOUND, "Not Found".to_string()),
            Self::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                "Method Not Allowed".to_string(),
            ),
            Self::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Payload Too Large".to_string(),
            ),
            Self::RequestTimeout => (StatusCode::REQUEST_TIMEOUT, "Request Timeout".to_string()),
            Self::InternalServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error".to_string(),
            ),
        };

        let body = Json(json!({
            "code": status.as_u16(),
            "kind": kind_for_status(status),
            "message": message,
        }));

        (status, body).into_response()
    }
}

/// Fatal errors raised while the process starts.
#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("provisioner error: {0}")]
    Provisioner(#[from] ProvisionerError),
    #[error("enrollment failed: {0}")]
    Enrollment(ProvisionerError),
    #[error("tls error: {0}")]
    Tls(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for StartupError {
    fn from(source: rustls::Error) -> Self {
        StartupError::Tls(source.to_string())
    }
}
