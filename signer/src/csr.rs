// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! PKCS#10 certificate signing requests.
//!
//! A [`CertificateRequest`] keeps the DER encoding it was parsed from together
//! with the identity claims the pipeline needs (common name and the subject
//! alternative names). On the wire it is a PEM string, both in requests to
//! this service and in requests forwarded to the CA.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

const PEM_TAG: &str = "CERTIFICATE REQUEST";
const LEGACY_PEM_TAG: &str = "NEW CERTIFICATE REQUEST";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CsrError {
    #[error("invalid PEM: {0}")]
    Pem(String),
    #[error("invalid certificate request: {0}")]
    Der(String),
    #[error("signature verification failed: {0}")]
    Signature(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    der: Vec<u8>,
    common_name: String,
    dns_names: Vec<String>,
    email_addresses: Vec<String>,
    ip_addresses: Vec<IpAddr>,
    uris: Vec<String>,
}

impl CertificateRequest {
    pub fn from_pem(pem: &str) -> Result<Self, CsrError> {
        let block = pem::parse(pem).map_err(|e| CsrError::Pem(e.to_string()))?;
        if block.tag() != PEM_TAG && block.tag() != LEGACY_PEM_TAG {
            return Err(CsrError::Pem(format!("unexpected PEM block {}", block.tag())));
        }
        Self::from_der(block.into_contents())
    }

    pub fn from_der(der: Vec<u8>) -> Result<Self, CsrError> {
        let (_, csr) =
            X509CertificationRequest::from_der(&der).map_err(|e| CsrError::Der(e.to_string()))?;

        let info = &csr.certification_request_info;
        let common_name = match info.subject.iter_common_name().next() {
            Some(cn) => cn
                .as_str()
                .map_err(|e| CsrError::Der(format!("common name: {e}")))?
                .to_string(),
            None => String::new(),
        };

        let mut dns_names = Vec::new();
        let mut email_addresses = Vec::new();
        let mut ip_addresses = Vec::new();
        let mut uris = Vec::new();

        if let Some(extensions) = csr.requested_extensions() {
            for extension in extensions {
                let ParsedExtension::SubjectAlternativeName(san) = extension else {
                    continue;
                };
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                        GeneralName::RFC822Name(email) => email_addresses.push(email.to_string()),
                        GeneralName::IPAddress(bytes) => ip_addresses.push(ip_from_bytes(bytes)?),
                        GeneralName::URI(uri) => uris.push(uri.to_string()),
                        _ => {}
                    }
                }
            }
        }

        Ok(Self {
            der,
            common_name,
            dns_names,
            email_addresses,
            ip_addresses,
            uris,
        })
    }

    /// Checks that the request is signed by the key it carries.
    pub fn check_signature(&self) -> Result<(), CsrError> {
        let (_, csr) = X509CertificationRequest::from_der(&self.der)
            .map_err(|e| CsrError::Der(e.to_string()))?;
        csr.verify_signature()
            .map_err(|e| CsrError::Signature(e.to_string()))
    }

    /// DNS names, email addresses, IP addresses and URIs, in that order.
    pub fn subject_alternative_names(&self) -> Vec<String> {
        let mut sans = Vec::with_capacity(
            self.dns_names.len()
                + self.email_addresses.len()
                + self.ip_addresses.len()
                + self.uris.len(),
        );
        sans.extend(self.dns_names.iter().cloned());
        sans.extend(self.email_addresses.iter().cloned());
        sans.extend(self.ip_addresses.iter().map(IpAddr::to_string));
        sans.extend(self.uris.iter().cloned());
        sans
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PEM_TAG, self.der.clone()))
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn email_addresses(&self) -> &[String] {
        &self.email_addresses
    }

    pub fn ip_addresses(&self) -> &[IpAddr] {
        &self.ip_addresses
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr, CsrError> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    Err(CsrError::Der(format!(
        "IP address SAN of {} bytes",
        bytes.len()
    )))
}

impl fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("common_name", &self.common_name)
            .field("dns_names", &self.dns_names)
            .field("email_addresses", &self.email_addresses)
            .field("ip_addresses", &self.ip_addresses)
            .field("uris", &self.uris)
            .finish()
    }
}

impl Serialize for CertificateRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_pem())
    }
}

impl<'de> Deserialize<'de> for CertificateRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pem = String::deserialize(deserializer)?;
        CertificateRequest::from_pem(&pem).map_err(serde::de::Error::custom)
    }
}
