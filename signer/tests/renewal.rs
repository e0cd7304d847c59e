// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Tests for the background renewal of the server identity.
//!
//! A scripted provisioner hands out renewed identities (or failures) in order
//! and reports the leaf certificate it was asked to renew on a channel.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ca_signer::csr::CertificateRequest;
use ca_signer::errors::ProvisionerError;
use ca_signer::identity::{IdentityResolver, ServerIdentity};
use ca_signer::models::{OneTimeToken, SignResponse, TimeDuration};
use ca_signer::provisioner::Provisioner;
use ca_signer::renewal::Renewer;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::CertificateDer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct ScriptedProvisioner {
    renewals: Mutex<VecDeque<Result<ServerIdentity, ProvisionerError>>>,
    renewed: mpsc::UnboundedSender<CertificateDer<'static>>,
}

impl ScriptedProvisioner {
    fn new(
        renewals: Vec<Result<ServerIdentity, ProvisionerError>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CertificateDer<'static>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let provisioner = Self {
            renewals: Mutex::new(renewals.into()),
            renewed: tx,
        };
        (Arc::new(provisioner), rx)
    }
}

#[async_trait]
impl Provisioner for ScriptedProvisioner {
    async fn token(&self, _subject: &str, _sans: &[String]) -> Result<OneTimeToken, ProvisionerError> {
        Err(ProvisionerError::Unavailable("not used".to_string()))
    }

    async fn sign(
        &self,
        _csr: &CertificateRequest,
        _token: OneTimeToken,
        _not_after: Option<&TimeDuration>,
    ) -> Result<SignResponse, ProvisionerError> {
        Err(ProvisionerError::Unavailable("not used".to_string()))
    }

    async fn bootstrap(&self, _token: OneTimeToken) -> Result<ServerIdentity, ProvisionerError> {
        Err(ProvisionerError::Unavailable("not used".to_string()))
    }

    async fn renew(&self, current: &ServerIdentity) -> Result<ServerIdentity, ProvisionerError> {
        let _ = self.renewed.send(current.cert_chain()[0].clone());
        self.renewals
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProvisionerError::Unavailable("no more renewals".to_string())))
    }
}

/// Self-signed identity for `name`, valid from `offset` relative to now for
/// `lifetime`.
fn identity(name: &str, offset: time::Duration, lifetime: time::Duration) -> ServerIdentity {
    let not_before = time::OffsetDateTime::now_utc() + offset;
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

/// Identity that is already due for renewal.
fn expiring(name: &str) -> ServerIdentity {
    identity(name, time::Duration::seconds(-10), time::Duration::seconds(12))
}

fn fresh(name: &str) -> ServerIdentity {
    identity(name, time::Duration::ZERO, time::Duration::hours(1))
}

fn resolver(identity: ServerIdentity) -> Arc<IdentityResolver> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    Arc::new(IdentityResolver::new(provider, identity).unwrap())
}

fn leaf(resolver: &IdentityResolver) -> CertificateDer<'static> {
    resolver.current().identity().cert_chain()[0].clone()
}

#[tokio::test]
async fn test_renew_once_installs_identity() {
    let first = fresh("first.local");
    let second = fresh("second.local");
    let second_leaf = second.cert_chain()[0].clone();
    let (provisioner, _rx) = ScriptedProvisioner::new(vec![Ok(second)]);
    let resolver = resolver(first);

    let renewer = Renewer::new(provisioner, resolver.clone());
    renewer.renew_once().await.unwrap();

    assert_eq!(leaf(&resolver), second_leaf);
    assert_eq!(resolver.current().certified_key().cert[0], second_leaf);
}

#[tokio::test]
async fn test_failed_renewal_keeps_identity() {
    let first = fresh("first.local");
    let first_leaf = first.cert_chain()[0].clone();
    let (provisioner, _rx) = ScriptedProvisioner::new(vec![Err(ProvisionerError::Upstream {
        status: 401,
        message: "certificate expired".to_string(),
    })]);
    let resolver = resolver(first);

    let renewer = Renewer::new(provisioner, resolver.clone());
    assert!(matches!(
        renewer.renew_once().await,
        Err(ProvisionerError::Upstream { status: 401, .. })
    ));
    assert_eq!(leaf(&resolver), first_leaf);
}

#[tokio::test(start_paused = true)]
async fn test_renewer_replaces_identity() {
    let first = expiring("first.local");
    let first_leaf = first.cert_chain()[0].clone();
    let second = fresh("second.local");
    let second_leaf = second.cert_chain()[0].clone();
    let (provisioner, mut rx) = ScriptedProvisioner::new(vec![Ok(second)]);
    let resolver = resolver(first);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(Renewer::new(provisioner, resolver.clone()).run(cancel.clone()));

    // the first renewal presents the bootstrapped identity, the next one
    // presents its replacement
    assert_eq!(rx.recv().await.unwrap(), first_leaf);
    assert_eq!(rx.recv().await.unwrap(), second_leaf);
    assert_eq!(leaf(&resolver), second_leaf);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_renewer_retries_after_failure() {
    let first = expiring("first.local");
    let first_leaf = first.cert_chain()[0].clone();
    let second = fresh("second.local");
    let second_leaf = second.cert_chain()[0].clone();
    let (provisioner, mut rx) = ScriptedProvisioner::new(vec![
        Err(ProvisionerError::Unavailable("connection refused".to_string())),
        Ok(second),
    ]);
    let resolver = resolver(first);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(Renewer::new(provisioner, resolver.clone()).run(cancel.clone()));

    assert_eq!(rx.recv().await.unwrap(), first_leaf);
    // still serving the old identity when retrying
    assert_eq!(rx.recv().await.unwrap(), first_leaf);
    assert_eq!(rx.recv().await.unwrap(), second_leaf);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_renewer_promptly() {
    let (provisioner, mut rx) = ScriptedProvisioner::new(Vec::new());
    let resolver = resolver(fresh("first.local"));

    let cancel = CancellationToken::new();
    let task = tokio::spawn(Renewer::new(provisioner, resolver).run(cancel.clone()));

    tokio::task::yield_now().await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_readers_never_observe_a_gap() {
    let first = expiring("first.local");
    let first_leaf = first.cert_chain()[0].clone();
    let second = fresh("second.local");
    let second_leaf = second.cert_chain()[0].clone();
    let (provisioner, mut rx) = ScriptedProvisioner::new(vec![Ok(second)]);
    let resolver = resolver(first);

    let done = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let resolver = resolver.clone();
            let done = done.clone();
            let reads = reads.clone();
            let (first_leaf, second_leaf) = (first_leaf.clone(), second_leaf.clone());
            std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let current = resolver.current();
                    let served = &current.certified_key().cert[0];
                    assert!(*served == first_leaf || *served == second_leaf);
                    assert_eq!(current.identity().cert_chain()[0], *served);
                    reads.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(Renewer::new(provisioner, resolver.clone()).run(cancel.clone()));

    rx.recv().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while leaf(&resolver) != second_leaf {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    task.await.unwrap();
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(reads.load(Ordering::Relaxed) > 0);
}
