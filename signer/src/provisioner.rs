// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Access to the upstream certificate authority.
//!
//! The [`Provisioner`] trait is everything the signing pipeline and the
//! self-bootstrapping server need from the CA. [`StepProvisioner`] implements
//! it against a step-ca style HTTP API:
//!
//! | Capability | Request |
//! |------------|---------|
//! | provisioner key | `GET /1.0/provisioners/{kid}/encrypted-key` |
//! | [`sign`](Provisioner::sign) | `POST /1.0/sign` |
//! | [`renew`](Provisioner::renew) | `POST /1.0/renew` (client certificate auth) |
//!
//! Tokens are minted locally with the decrypted provisioner key, see
//! [`crate::token`].

use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_lc_rs::digest;
use data_encoding::HEXLOWER;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use reqwest::{Certificate, Client, Identity, Response};
use serde::de::DeserializeOwned;
use zeroize::Zeroizing;

use crate::constants::{CA_REQUEST_TIMEOUT, PROVISIONERS_PATH, RENEW_PATH, SIGN_PATH, TOKEN_VALIDITY};
use crate::csr::CertificateRequest;
use crate::errors::ProvisionerError;
use crate::identity::{IdentityError, ServerIdentity};
use crate::models::{
    CaErrorResponse, CaSignRequest, EncryptedKeyResponse, OneTimeToken, SignResponse, TimeDuration,
};
use crate::token::{self, ProvisionerKey, TokenClaims};

/// Capabilities of a provisioner registered with the CA.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Mints a one-time token scoped to `subject` and `sans`.
    async fn token(&self, subject: &str, sans: &[String]) -> Result<OneTimeToken, ProvisionerError>;

    /// Asks the CA to sign `csr`, consuming `token`.
    async fn sign(
        &self,
        csr: &CertificateRequest,
        token: OneTimeToken,
        not_after: Option<&TimeDuration>,
    ) -> Result<SignResponse, ProvisionerError>;

    /// Exchanges an enrollment token for a fresh serving identity.
    async fn bootstrap(&self, token: OneTimeToken) -> Result<ServerIdentity, ProvisionerError>;

    /// Obtains a new certificate for the key of `current`.
    async fn renew(&self, current: &ServerIdentity) -> Result<ServerIdentity, ProvisionerError>;
}

/// Inputs needed to talk to the CA as a given provisioner.
pub struct ProvisionerSettings {
    pub name: String,
    pub kid: String,
    pub ca_url: String,
    pub root_pem: String,
    pub password: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for ProvisionerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionerSettings")
            .field("name", &self.name)
            .field("kid", &self.kid)
            .field("ca_url", &self.ca_url)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Provisioner backed by a step-ca compatible CA.
pub struct StepProvisioner {
    name: String,
    ca_url: String,
    root: Certificate,
    root_fingerprint: String,
    key: ProvisionerKey,
    client: Client,
}

impl StepProvisioner {
    /// Fetches and decrypts the provisioner key.
    #[tracing::instrument(skip(settings), fields(name = %settings.name, kid = %settings.kid))]
    pub async fn connect(settings: ProvisionerSettings) -> Result<Self, ProvisionerError> {
        let ca_url = settings.ca_url.trim_end_matches('/').to_string();

        let root_der = pem::parse(&settings.root_pem)
            .map_err(|e| IdentityError::Certificate(format!("root certificate: {e}")))?
            .into_contents();
        let root_fingerprint = HEXLOWER.encode(digest::digest(&digest::SHA256, &root_der).as_ref());
        let root = Certificate::from_der(&root_der).map_err(|e| {
            IdentityError::Certificate(format!("root certificate: {e}"))
        })?;

        let client = client_builder(&root).build().map_err(unavailable)?;

        let url = format!("{ca_url}{PROVISIONERS_PATH}/{}/encrypted-key", settings.kid);
        let response = client.get(&url).send().await.map_err(unavailable)?;
        let encrypted: EncryptedKeyResponse = read_json(response).await?;
        let key = ProvisionerKey::decrypt(&settings.kid, &encrypted.key, &settings.password)?;

        tracing::info!("[signer] decrypted provisioner key");

        Ok(Self {
            name: settings.name,
            ca_url,
            root,
            root_fingerprint,
            key,
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kid(&self) -> &str {
        self.key.kid()
    }

    fn claims(&self, subject: &str, sans: &[String]) -> Result<TokenClaims, ProvisionerError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let now = i64::try_from(now).unwrap_or(i64::MAX);
        let validity = i64::try_from(TOKEN_VALIDITY.as_secs()).unwrap_or(i64::MAX);

        Ok(TokenClaims {
            iss: self.name.clone(),
            sub: subject.to_string(),
            aud: format!("{}{SIGN_PATH}", self.ca_url),
            sans: sans.to_vec(),
            sha: self.root_fingerprint.clone(),
            nbf: now,
            iat: now,
            exp: now.saturating_add(validity),
            jti: token::new_token_id()?,
        })
    }
}

#[async_trait]
impl Provisioner for StepProvisioner {
    async fn token(&self, subject: &str, sans: &[String]) -> Result<OneTimeToken, ProvisionerError> {
        let claims = self.claims(subject, sans)?;
        Ok(self.key.mint(&claims)?)
    }

    #[tracing::instrument(skip(self, csr, token, not_after))]
    async fn sign(
        &self,
        csr: &CertificateRequest,
        token: OneTimeToken,
        not_after: Option<&TimeDuration>,
    ) -> Result<SignResponse, ProvisionerError> {
        let body = CaSignRequest {
            csr,
            ott: token.as_str(),
            not_after,
        };

        let response = self
            .client
            .post(format!("{}{SIGN_PATH}", self.ca_url))
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        read_json(response).await
    }

    #[tracing::instrument(skip(self, token))]
    async fn bootstrap(&self, token: OneTimeToken) -> Result<ServerIdentity, ProvisionerError> {
        let claims = token::decode_claims(&token)?;
        let (csr, key_pair) = server_csr(&claims.sub, &claims.sans)?;

        tracing::debug!(subject = %claims.sub, sans = ?claims.sans, "[signer] enrolling");

        let response = self.sign(&csr, token, None).await?;
        Ok(ServerIdentity::from_pem(
            &response.chain_pem(),
            key_pair.serialize_der(),
        )?)
    }

    #[tracing::instrument(skip(self, current))]
    async fn renew(&self, current: &ServerIdentity) -> Result<ServerIdentity, ProvisionerError> {
        let identity = Identity::from_pem(current.to_pem().as_bytes())
            .map_err(|e| IdentityError::PrivateKey(e.to_string()))?;
        let client = client_builder(&self.root)
            .identity(identity)
            .build()
            .map_err(unavailable)?;

        let response = client
            .post(format!("{}{RENEW_PATH}", self.ca_url))
            .send()
            .await
            .map_err(unavailable)?;
        let response: SignResponse = read_json(response).await?;

        Ok(ServerIdentity::from_pem(
            &response.chain_pem(),
            current.private_key_der().to_vec(),
        )?)
    }
}

fn client_builder(root: &Certificate) -> reqwest::ClientBuilder {
    Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(root.clone())
        .timeout(CA_REQUEST_TIMEOUT)
}

fn unavailable(err: reqwest::Error) -> ProvisionerError {
    ProvisionerError::Unavailable(err.to_string())
}

/// Decodes a successful CA response, or maps the CA's error document.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ProvisionerError> {
    let status = response.status();
    let body = response.bytes().await.map_err(unavailable)?;

    if !status.is_success() {
        let message = serde_json::from_slice::<CaErrorResponse>(&body)
            .map(|e| e.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("upstream error")
                    .to_string()
            });
        return Err(ProvisionerError::Upstream {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_slice(&body).map_err(|e| ProvisionerError::InvalidResponse(e.to_string()))
}

/// Generates a key and a CSR for `subject`, splitting `sans` into IP
/// addresses, email addresses, URIs and DNS names.
pub fn server_csr(
    subject: &str,
    sans: &[String],
) -> Result<(CertificateRequest, KeyPair), ProvisionerError> {
    let csr_error = |e: rcgen::Error| ProvisionerError::InvalidResponse(format!("csr: {e}"));

    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(csr_error)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject);
    params.distinguished_name = dn;

    for san in sans {
        let san = if let Ok(ip) = san.parse::<IpAddr>() {
            SanType::IpAddress(ip)
        } else if san.contains("://") {
            SanType::URI(san.as_str().try_into().map_err(csr_error)?)
        } else if san.contains('@') {
            SanType::Rfc822Name(san.as_str().try_into().map_err(csr_error)?)
        } else {
            SanType::DnsName(san.as_str().try_into().map_err(csr_error)?)
        };
        params.subject_alt_names.push(san);
    }

    let key_pair = KeyPair::generate().map_err(csr_error)?;
    let csr = params.serialize_request(&key_pair).map_err(csr_error)?;
    let csr = CertificateRequest::from_der(csr.der().to_vec())?;

    Ok((csr, key_pair))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::identity::tests::self_signed_identity;
    use crate::token::tests::encrypted_provisioner_key;

    fn ca_response(status: u16, body: &'static str) -> Response {
        Response::from(
            axum::http::Response::builder()
                .status(status)
                .body(body)
                .unwrap(),
        )
    }

    /// Provisioner pointed at a port nothing listens on.
    fn unreachable_provisioner() -> StepProvisioner {
        let identity = self_signed_identity(
            "ca.local",
            time::OffsetDateTime::now_utc(),
            time::Duration::hours(1),
        );
        let root = Certificate::from_der(identity.cert_chain()[0].as_ref()).unwrap();
        let (jwe, _) = encrypted_provisioner_key(b"hunter2");
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        StepProvisioner {
            name: "signer".into(),
            ca_url: format!("https://127.0.0.1:{port}"),
            client: client_builder(&root).build().unwrap(),
            root,
            root_fingerprint: "abcd".into(),
            key: ProvisionerKey::decrypt("kid-1", &jwe, b"hunter2").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_ca_error_document_becomes_upstream_error() {
        let response = ca_response(403, r#"{"status":403,"message":"provisioner not authorized"}"#);
        assert_eq!(
            read_json::<SignResponse>(response).await.unwrap_err(),
            ProvisionerError::Upstream {
                status: 403,
                message: "provisioner not authorized".into()
            }
        );
    }

    #[tokio::test]
    async fn test_ca_error_without_message_uses_reason_phrase() {
        let empty = read_json::<SignResponse>(ca_response(401, "")).await;
        assert_eq!(
            empty.unwrap_err(),
            ProvisionerError::Upstream {
                status: 401,
                message: "Unauthorized".into()
            }
        );

        let blank = read_json::<SignResponse>(ca_response(500, r#"{"message":""}"#)).await;
        assert_eq!(
            blank.unwrap_err(),
            ProvisionerError::Upstream {
                status: 500,
                message: "Internal Server Error".into()
            }
        );
    }

    #[tokio::test]
    async fn test_ca_success_is_decoded() {
        let key: EncryptedKeyResponse = read_json(ca_response(200, r#"{"key":"a.b.c.d.e"}"#))
            .await
            .unwrap();
        assert_eq!(key.key, "a.b.c.d.e");

        assert!(matches!(
            read_json::<SignResponse>(ca_response(201, "not json")).await,
            Err(ProvisionerError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_sign_request_body() {
        let (csr, _) = server_csr("app.example.com", &["app.example.com".to_string()]).unwrap();

        let body = CaSignRequest {
            csr: &csr,
            ott: "ott-1",
            not_after: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"csr": csr.to_pem(), "ott": "ott-1"})
        );

        let not_after: TimeDuration = "1.5h".parse().unwrap();
        let body = CaSignRequest {
            csr: &csr,
            ott: "ott-1",
            not_after: Some(&not_after),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"csr": csr.to_pem(), "ott": "ott-1", "notAfter": "1.5h"})
        );
    }

    #[tokio::test]
    async fn test_unreachable_ca_is_bad_gateway() {
        let provisioner = unreachable_provisioner();
        let (csr, _) = server_csr("app.example.com", &[]).unwrap();

        let err = provisioner
            .sign(&csr, OneTimeToken::new("ott-1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionerError::Unavailable(_)));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_tokens_are_scoped_to_the_request() {
        let provisioner = unreachable_provisioner();
        let sans = vec!["app.example.com".to_string(), "127.0.0.1".to_string()];

        let token = provisioner.token("app.example.com", &sans).await.unwrap();
        let claims = token::decode_claims(&token).unwrap();

        assert_eq!(claims.iss, "signer");
        assert_eq!(claims.sub, "app.example.com");
        assert_eq!(claims.sans, sans);
        assert_eq!(claims.aud, format!("{}{SIGN_PATH}", provisioner.ca_url));
        assert_eq!(claims.sha, "abcd");
        assert_eq!(claims.exp - claims.nbf, 300);
    }

    #[test]
    fn test_server_csr_splits_sans() {
        let sans = vec![
            "signer.svc".to_string(),
            "127.0.0.1".to_string(),
            "ops@example.com".to_string(),
            "spiffe://example.org/signer".to_string(),
        ];
        let (csr, _) = server_csr("signer.svc", &sans).unwrap();

        assert_eq!(csr.common_name(), "signer.svc");
        assert_eq!(csr.dns_names(), ["signer.svc".to_string()]);
        assert_eq!(csr.ip_addresses(), ["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(csr.email_addresses(), ["ops@example.com".to_string()]);
        assert_eq!(csr.uris(), ["spiffe://example.org/signer".to_string()]);
        assert!(csr.check_signature().is_ok());
    }

    #[test]
    fn test_settings_debug_is_redacted() {
        let settings = ProvisionerSettings {
            name: "signer".into(),
            kid: "kid".into(),
            ca_url: "https://ca".into(),
            root_pem: String::new(),
            password: Zeroizing::new(b"hunter2".to_vec()),
        };
        assert!(!format!("{settings:?}").contains("hunter2"));
    }
}
