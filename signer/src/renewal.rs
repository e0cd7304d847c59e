// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Background renewal of the server identity.
//!
//! The [`Renewer`] sleeps until a third of the installed certificate's
//! lifetime is left, asks the provisioner for a fresh certificate and installs
//! it into the [`IdentityResolver`]. Failures are logged and retried; the
//! installed identity is never removed.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::constants::{MIN_RENEWAL_DELAY, RENEW_BEFORE_DIVISOR, RENEWAL_RETRY_DELAY};
use crate::errors::ProvisionerError;
use crate::identity::IdentityResolver;
use crate::provisioner::Provisioner;

/// Time to wait before renewing a certificate valid from `not_before` to
/// `not_after`.
pub fn renewal_delay(not_before: SystemTime, not_after: SystemTime, now: SystemTime) -> Duration {
    let lifetime = not_after.duration_since(not_before).unwrap_or_default();
    let renew_at = not_after
        .checked_sub(lifetime / RENEW_BEFORE_DIVISOR)
        .unwrap_or(not_before);

    renew_at
        .duration_since(now)
        .unwrap_or_default()
        .max(MIN_RENEWAL_DELAY)
}

/// Time to wait after a failed renewal. Retries speed up while the
/// certificate is about to expire, and fall back to the regular retry delay
/// once it has.
pub fn retry_delay(not_after: SystemTime, now: SystemTime) -> Duration {
    match not_after.duration_since(now) {
        Ok(remaining) if !remaining.is_zero() => {
            RENEWAL_RETRY_DELAY.min(remaining).max(MIN_RENEWAL_DELAY)
        }
        _ => RENEWAL_RETRY_DELAY,
    }
}

/// Single writer of the installed server identity.
pub struct Renewer {
    provisioner: Arc<dyn Provisioner>,
    resolver: Arc<IdentityResolver>,
}

impl Renewer {
    pub fn new(provisioner: Arc<dyn Provisioner>, resolver: Arc<IdentityResolver>) -> Self {
        Self {
            provisioner,
            resolver,
        }
    }

    /// Runs until `cancel` fires. An in-flight renewal is abandoned on
    /// cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        info!("[signer] starting certificate renewer");

        let mut delay = self.next_delay();

        loop {
            debug!(delay_secs = delay.as_secs(), "[signer] next renewal scheduled");

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.renew_once() => result,
            };

            delay = match result {
                Ok(()) => self.next_delay(),
                Err(e) => {
                    let current = self.resolver.current();
                    let retry = retry_delay(current.identity().not_after(), SystemTime::now());
                    error!(
                        error = %e,
                        retry_secs = retry.as_secs(),
                        "[signer] certificate renewal failed"
                    );
                    retry
                }
            };
        }

        info!("[signer] certificate renewer stopped");
    }

    /// Renews and installs the certificate once.
    pub async fn renew_once(&self) -> Result<(), ProvisionerError> {
        let current = self.resolver.current();
        let renewed = self.provisioner.renew(current.identity()).await?;
        let not_after = renewed.not_after();

        self.resolver.install(renewed)?;

        info!(
            not_after = %humantime::format_rfc3339_seconds(not_after),
            "[signer] certificate renewed"
        );
        Ok(())
    }

    fn next_delay(&self) -> Duration {
        let current = self.resolver.current();
        let identity = current.identity();
        renewal_delay(identity.not_before(), identity.not_after(), SystemTime::now())
    }
}
