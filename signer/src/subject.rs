// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Derivation of the subject and SAN set a signing token is scoped to.

use crate::constants::{LOCALHOST, LOOPBACK_ADDRESS};
use crate::csr::CertificateRequest;

/// Subject and subject alternative names a one-time token is minted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedIdentity {
    pub subject: String,
    pub sans: Vec<String>,
}

impl DerivedIdentity {
    pub fn from_csr(csr: &CertificateRequest) -> Self {
        Self::new(csr.common_name(), csr.subject_alternative_names())
    }

    /// The common name wins when present, otherwise the subject is picked
    /// from `sans` with [`subject_from_sans`].
    pub fn new(common_name: &str, sans: Vec<String>) -> Self {
        let subject = if common_name.is_empty() {
            subject_from_sans(&sans)
        } else {
            common_name.to_string()
        };

        Self { subject, sans }
    }
}

/// First SAN that is neither the loopback address nor `localhost`, falling
/// back to the first SAN, or the loopback address when there are none.
pub fn subject_from_sans(sans: &[String]) -> String {
    let Some(first) = sans.first() else {
        return LOOPBACK_ADDRESS.to_string();
    };

    sans.iter()
        .find(|san| san.as_str() != LOOPBACK_ADDRESS && san.as_str() != LOCALHOST)
        .unwrap_or(first)
        .clone()
}
