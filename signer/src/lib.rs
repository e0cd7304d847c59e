// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! # CA Signer
//!
//! A certificate signing broker in front of a step-ca style certificate
//! authority.
//!
//! Clients post a CSR to `/sign`. The broker checks the CSR, derives the
//! subject and SANs it covers, mints a one-time token for exactly that
//! identity with its provisioner key and forwards the CSR and token to the CA.
//!
//! ## Architecture
//!
//! ```text
//! Client -> HTTPS /sign -> Signer (this crate) -> HTTPS /1.0/sign -> CA
//!                               |
//!                               +-> /1.0/renew (own serving certificate)
//! ```
//!
//! The broker serves TLS with a certificate it obtains from the same CA at
//! startup using an enrollment token, and renews it in the background.
//!
//! ## Modules
//!
//! - [`application`]: Router, TLS listener and server lifecycle
//! - [`configuration`]: CLI arguments and the YAML configuration file
//! - [`constants`]: Defaults and timing constants
//! - [`csr`]: Certificate signing request parsing and verification
//! - [`errors`]: Error types with HTTP response mapping
//! - [`identity`]: Server identity and the hot-swappable certificate resolver
//! - [`models`]: Request/response types
//! - [`provisioner`]: The [`provisioner::Provisioner`] trait and the step-ca client
//! - [`renewal`]: Background renewal of the server identity
//! - [`routes`]: HTTP route handlers (healthz, sign)
//! - [`subject`]: Subject and SAN derivation
//! - [`token`]: Provisioner key decryption and one-time token minting
//!
//! ## Usage
//!
//! ```bash
//! PROVISIONER_NAME=signer PROVISIONER_KID=... ca-signer /etc/ca-signer/config.yaml
//! ```
//!
//! ## Security Considerations
//!
//! - Tokens, passwords and private keys are zeroized on drop and redacted in `Debug`
//! - Tokens are scoped to the subject and SANs of the CSR they are minted for
//! - Request bodies are limited to 1 MiB, requests time out after 30 seconds

pub mod application;
pub mod configuration;
pub mod constants;
pub mod csr;
pub mod errors;
pub mod identity;
pub mod models;
pub mod provisioner;
pub mod renewal;
pub mod routes;
pub mod subject;
pub mod token;
