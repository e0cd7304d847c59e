// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::time::Duration;

pub const DEFAULT_ADDRESS: &str = ":4443";
pub const DEFAULT_SERVICE_NAME: &str = "ca-signer.step.svc.cluster.local";
pub const DEFAULT_ROOT_CA_PATH: &str = "/home/step/certs/root_ca.crt";
pub const DEFAULT_PASSWORD_PATH: &str = "/home/step/password/password";

/// Subject used when a CSR carries neither a common name nor any SAN.
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";
pub const LOCALHOST: &str = "localhost";

pub const SIGN_PATH: &str = "/1.0/sign";
pub const RENEW_PATH: &str = "/1.0/renew";
pub const PROVISIONERS_PATH: &str = "/1.0/provisioners";

pub const TOKEN_VALIDITY: Duration = Duration::from_secs(5 * 60);
pub const CA_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Fraction of the certificate lifetime left when renewal kicks in.
pub const RENEW_BEFORE_DIVISOR: u32 = 3;
pub const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);
pub const RENEWAL_RETRY_DELAY: Duration = Duration::from_secs(30);

pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_REQUEST_BODY_SIZE: usize = 1024 * 1024; // 1 MB
