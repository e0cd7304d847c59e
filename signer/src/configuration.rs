// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::constants::{
    DEFAULT_ADDRESS, DEFAULT_PASSWORD_PATH, DEFAULT_ROOT_CA_PATH, DEFAULT_SERVICE_NAME,
};
use crate::errors::StartupError;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct SignerOptions {
    /// Path to the YAML configuration file
    pub config: PathBuf,
    #[arg(long, env("PROVISIONER_NAME"))]
    pub provisioner_name: String,
    #[arg(long, env("PROVISIONER_KID"))]
    pub provisioner_kid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Contents of the YAML configuration file. Empty values fall back to the
/// defaults in [`crate::constants`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(rename = "caURL", default)]
    pub ca_url: String,
    #[serde(rename = "rootCAPath", default)]
    pub root_ca_path: String,
    #[serde(rename = "provisionerPasswordFile", default)]
    pub provisioner_password_file: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub service: String,
    #[serde(rename = "logFormat", default)]
    pub log_format: String,
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() { default } else { value }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, StartupError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StartupError::Config(format!("error reading {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(yaml: &str) -> Result<Self, StartupError> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| StartupError::Config(format!("error parsing config: {e}")))?;

        if config.ca_url.is_empty() {
            return Err(StartupError::Config("caURL is required".to_string()));
        }

        Ok(config)
    }

    pub fn root_ca_path(&self) -> &Path {
        Path::new(or_default(&self.root_ca_path, DEFAULT_ROOT_CA_PATH))
    }

    pub fn password_path(&self) -> &Path {
        Path::new(or_default(
            &self.provisioner_password_file,
            DEFAULT_PASSWORD_PATH,
        ))
    }

    pub fn address(&self) -> &str {
        or_default(&self.address, DEFAULT_ADDRESS)
    }

    pub fn service(&self) -> &str {
        or_default(&self.service, DEFAULT_SERVICE_NAME)
    }

    pub fn log_format(&self) -> LogFormat {
        if self.log_format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }

    /// Resolves [`Config::address`]; a bare `:port` binds all interfaces.
    pub fn bind_address(&self) -> Result<SocketAddr, StartupError> {
        let address = self.address();
        let address = if address.starts_with(':') {
            format!("0.0.0.0{address}")
        } else {
            address.to_string()
        };

        address
            .to_socket_addrs()
            .map_err(|e| StartupError::Config(format!("invalid address {address:?}: {e}")))?
            .next()
            .ok_or_else(|| StartupError::Config(format!("invalid address {address:?}")))
    }

    pub fn read_root_ca(&self) -> Result<String, StartupError> {
        let path = self.root_ca_path();
        std::fs::read_to_string(path).map_err(|e| {
            StartupError::Config(format!("error reading {}: {e}", path.display()))
        })
    }

    /// Reads the provisioner password, without trailing whitespace.
    pub fn read_password(&self) -> Result<Zeroizing<Vec<u8>>, StartupError> {
        let path = self.password_path();
        let mut password = Zeroizing::new(std::fs::read(path).map_err(|e| {
            StartupError::Config(format!("error reading {}: {e}", path.display()))
        })?);

        while password.last().is_some_and(|b| b.is_ascii_whitespace()) {
            password.pop();
        }

        Ok(password)
    }
}
