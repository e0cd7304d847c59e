// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! The service's own TLS identity.
//!
//! [`ServerIdentity`] is the certificate chain and private key obtained from
//! the CA. [`IdentityResolver`] holds the currently installed identity behind
//! an [`ArcSwap`] and hands it to rustls on every handshake. The renewal task
//! is its only writer; handshakes always load either the old or the new
//! identity in full, and an identity is only replaced once its successor has
//! been turned into a usable signing key.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use x509_parser::parse_x509_certificate;
use zeroize::Zeroizing;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    #[error("invalid certificate: {0}")]
    Certificate(String),
    #[error("invalid private key: {0}")]
    PrivateKey(String),
}

/// Certificate chain and PKCS#8 private key issued to this service.
pub struct ServerIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivatePkcs8KeyDer<'static>,
    not_before: SystemTime,
    not_after: SystemTime,
}

impl ServerIdentity {
    /// Builds an identity from a PEM chain (leaf first) and a PKCS#8 key.
    pub fn from_pem(chain_pem: &str, private_key_der: Vec<u8>) -> Result<Self, IdentityError> {
        let cert_chain: Vec<CertificateDer<'static>> = pem::parse_many(chain_pem)
            .map_err(|e| IdentityError::Certificate(e.to_string()))?
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| CertificateDer::from(block.into_contents()))
            .collect();

        Self::new(cert_chain, private_key_der)
    }

    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key_der: Vec<u8>,
    ) -> Result<Self, IdentityError> {
        let leaf = cert_chain
            .first()
            .ok_or_else(|| IdentityError::Certificate("empty certificate chain".to_string()))?;
        let (_, cert) =
            parse_x509_certificate(leaf).map_err(|e| IdentityError::Certificate(e.to_string()))?;

        let validity = cert.validity();
        let not_before = system_time(validity.not_before.timestamp())?;
        let not_after = system_time(validity.not_after.timestamp())?;

        if private_key_der.is_empty() {
            return Err(IdentityError::PrivateKey("empty private key".to_string()));
        }

        Ok(Self {
            cert_chain,
            private_key: PrivatePkcs8KeyDer::from(private_key_der),
            not_before,
            not_after,
        })
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    pub fn private_key_der(&self) -> &[u8] {
        self.private_key.secret_pkcs8_der()
    }

    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    pub fn lifetime(&self) -> Duration {
        self.not_after
            .duration_since(self.not_before)
            .unwrap_or_default()
    }

    /// Chain and key as a single PEM document, as used for client
    /// authentication when renewing.
    pub fn to_pem(&self) -> Zeroizing<String> {
        let mut blocks: Vec<pem::Pem> = self
            .cert_chain
            .iter()
            .map(|cert| pem::Pem::new("CERTIFICATE", cert.as_ref().to_vec()))
            .collect();
        blocks.push(pem::Pem::new(
            "PRIVATE KEY",
            self.private_key.secret_pkcs8_der().to_vec(),
        ));
        Zeroizing::new(pem::encode_many(&blocks))
    }

    fn certified_key(&self, provider: &CryptoProvider) -> Result<CertifiedKey, IdentityError> {
        let signing_key = provider
            .key_provider
            .load_private_key(PrivateKeyDer::Pkcs8(self.private_key.clone_key()))
            .map_err(|e| IdentityError::PrivateKey(e.to_string()))?;

        Ok(CertifiedKey::new(self.cert_chain.clone(), signing_key))
    }
}

fn system_time(timestamp: i64) -> Result<SystemTime, IdentityError> {
    u64::try_from(timestamp)
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
        .map_err(|_| IdentityError::Certificate(format!("timestamp {timestamp} before epoch")))
}

impl Clone for ServerIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
            not_before: self.not_before,
            not_after: self.not_after,
        }
    }
}

// Custom Debug implementation to prevent accidental logging of sensitive data
impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("chain_len", &self.cert_chain.len())
            .field("private_key", &"[REDACTED]")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// An identity together with the signing key rustls serves it with.
#[derive(Debug)]
pub struct InstalledIdentity {
    identity: ServerIdentity,
    certified_key: Arc<CertifiedKey>,
}

impl InstalledIdentity {
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }
}

/// Certificate resolver serving whatever identity is currently installed.
pub struct IdentityResolver {
    provider: Arc<CryptoProvider>,
    current: ArcSwap<InstalledIdentity>,
}

impl IdentityResolver {
    pub fn new(
        provider: Arc<CryptoProvider>,
        identity: ServerIdentity,
    ) -> Result<Self, IdentityError> {
        let installed = Self::prepare(&provider, identity)?;
        Ok(Self {
            provider,
            current: ArcSwap::from_pointee(installed),
        })
    }

    pub fn current(&self) -> Arc<InstalledIdentity> {
        self.current.load_full()
    }

    /// Replaces the installed identity. On error the previous identity
    /// stays in place.
    pub fn install(&self, identity: ServerIdentity) -> Result<(), IdentityError> {
        let installed = Self::prepare(&self.provider, identity)?;
        self.current.store(Arc::new(installed));
        Ok(())
    }

    fn prepare(
        provider: &CryptoProvider,
        identity: ServerIdentity,
    ) -> Result<InstalledIdentity, IdentityError> {
        let certified_key = Arc::new(identity.certified_key(provider)?);
        Ok(InstalledIdentity {
            identity,
            certified_key,
        })
    }
}

impl ResolvesServerCert for IdentityResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.load().certified_key.clone())
    }
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("current", &self.current.load().identity)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    /// Self-signed identity for `name` valid from `not_before` for
    /// `lifetime`.
    pub(crate) fn self_signed_identity(
        name: &str,
        not_before: time::OffsetDateTime,
        lifetime: time::Duration,
    ) -> ServerIdentity {
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.not_before = not_before;
        params.not_after = not_before + lifetime;
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        ServerIdentity::from_pem(&cert.pem(), key_pair.serialize_der()).unwrap()
    }

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::aws_lc_rs::default_provider())
    }

    #[test]
    fn test_reads_validity_from_leaf() {
        let start = time::OffsetDateTime::from_unix_timestamp(1_800_000_000).unwrap();
        let identity = self_signed_identity("signer.local", start, time::Duration::hours(24));

        assert_eq!(
            identity.not_before(),
            UNIX_EPOCH + Duration::from_secs(1_800_000_000)
        );
        assert_eq!(identity.lifetime(), Duration::from_secs(24 * 3600));
        assert_eq!(identity.cert_chain().len(), 1);
    }

    #[test]
    fn test_empty_chain_is_rejected() {
        assert!(matches!(
            ServerIdentity::from_pem("", vec![1, 2, 3]),
            Err(IdentityError::Certificate(_))
        ));
    }

    #[test]
    fn test_install_replaces_identity() {
        let now = time::OffsetDateTime::now_utc();
        let first = self_signed_identity("first.local", now, time::Duration::hours(1));
        let second = self_signed_identity("second.local", now, time::Duration::hours(2));
        let second_leaf = second.cert_chain()[0].clone();

        let resolver = IdentityResolver::new(provider(), first).unwrap();
        resolver.install(second).unwrap();

        let current = resolver.current();
        assert_eq!(current.identity().cert_chain()[0], second_leaf);
        assert_eq!(current.certified_key().cert[0], second_leaf);
    }

    #[test]
    fn test_bad_key_keeps_previous_identity() {
        let now = time::OffsetDateTime::now_utc();
        let first = self_signed_identity("first.local", now, time::Duration::hours(1));
        let first_leaf = first.cert_chain()[0].clone();
        let resolver = IdentityResolver::new(provider(), first).unwrap();

        let broken = ServerIdentity::new(vec![first_leaf.clone()], vec![0x30, 0x00]).unwrap();
        assert!(matches!(
            resolver.install(broken),
            Err(IdentityError::PrivateKey(_))
        ));
        assert_eq!(resolver.current().identity().cert_chain()[0], first_leaf);
    }

    #[test]
    fn test_pem_bundle_contains_key() {
        let now = time::OffsetDateTime::now_utc();
        let identity = self_signed_identity("signer.local", now, time::Duration::hours(1));
        let blocks = pem::parse_many(identity.to_pem().as_bytes()).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].tag(), "PRIVATE KEY");
    }
}
