// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, TimeDelta};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use zeroize::ZeroizeOnDrop;

use crate::csr::CertificateRequest;
use crate::errors::AppError;

/// Body of `POST /sign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csr: Option<CertificateRequest>,

    #[serde(
        default,
        rename = "notAfter",
        deserialize_with = "deserialize_optional_time_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub not_after: Option<TimeDuration>,
}

impl SignRequest {
    /// Returns the CSR once it is known to be present and self-signed.
    pub fn validate(&self) -> Result<&CertificateRequest, AppError> {
        let csr = self
            .csr
            .as_ref()
            .ok_or_else(|| AppError::BadRequest("missing csr".to_string()))?;

        csr.check_signature()
            .map_err(|e| AppError::BadRequest(format!("invalid csr: {e}")))?;

        Ok(csr)
    }
}

/// Requested validity: either a duration relative to issuance (`"1h"`) or an
/// absolute RFC 3339 timestamp. Serialized back in the form it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeDuration {
    Time(DateTime<FixedOffset>),
    Duration { raw: String, duration: TimeDelta },
}

impl FromStr for TimeDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(time) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self::Time(time));
        }

        parse_duration(s)
            .map(|duration| Self::Duration {
                raw: s.to_string(),
                duration,
            })
            .map_err(|e| format!("failed to parse {s:?} as a time or duration: {e}"))
    }
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "\u{b5}s" | "\u{3bc}s" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        _ => None,
    }
}

/// Parses the duration grammar the CA understands: an optional sign followed
/// by one or more decimal numbers, each with an optional fraction and a unit
/// (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`), such as `"-1.5h"` or `"2h45m"`.
pub fn parse_duration(s: &str) -> Result<TimeDelta, String> {
    let invalid = || format!("invalid duration {s:?}");

    let (negative, mut rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if rest == "0" {
        return Ok(TimeDelta::zero());
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let (int, tail) = rest.split_at(rest.bytes().take_while(u8::is_ascii_digit).count());
        let (frac, tail) = match tail.strip_prefix('.') {
            Some(tail) => tail.split_at(tail.bytes().take_while(u8::is_ascii_digit).count()),
            None => ("", tail),
        };
        if int.is_empty() && frac.is_empty() {
            return Err(invalid());
        }

        let unit_end = tail
            .find(|c: char| c == '.' || c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let nanos = match unit_nanos(unit) {
            Some(nanos) => nanos,
            None if unit.is_empty() => return Err(format!("missing unit in duration {s:?}")),
            None => return Err(format!("unknown unit {unit:?} in duration {s:?}")),
        };

        let int: u128 = if int.is_empty() {
            0
        } else {
            int.parse().map_err(|_| invalid())?
        };
        let mut value = int.checked_mul(nanos).ok_or_else(invalid)?;

        // digits past nanosecond precision of an hour do not matter
        let frac = frac.get(..18).unwrap_or(frac);
        if !frac.is_empty() {
            let digits: u128 = frac.parse().map_err(|_| invalid())?;
            value += digits * nanos / 10u128.pow(frac.len() as u32);
        }

        total = total.checked_add(value).ok_or_else(invalid)?;
        rest = tail;
    }

    let total = i128::try_from(total).map_err(|_| invalid())?;
    let signed = if negative { -total } else { total };
    i64::try_from(signed)
        .map(TimeDelta::nanoseconds)
        .map_err(|_| invalid())
}

impl fmt::Display for TimeDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time(time) => f.write_str(&time.to_rfc3339()),
            Self::Duration { raw, .. } => f.write_str(raw),
        }
    }
}

impl Serialize for TimeDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An empty string is the same as no value.
fn deserialize_optional_time_duration<'de, D>(
    deserializer: D,
) -> Result<Option<TimeDuration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Single-use authorization token. Not `Clone`: it is moved into the sign
/// call that consumes it.
#[derive(ZeroizeOnDrop)]
pub struct OneTimeToken(String);

impl OneTimeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Custom Debug implementation to prevent accidental logging of sensitive data
impl fmt::Debug for OneTimeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OneTimeToken").field(&"[REDACTED]").finish()
    }
}

/// Body forwarded to the CA's sign endpoint.
#[derive(Debug, Serialize)]
pub struct CaSignRequest<'a> {
    pub csr: &'a CertificateRequest,
    pub ott: &'a str,
    #[serde(rename = "notAfter", skip_serializing_if = "Option::is_none")]
    pub not_after: Option<&'a TimeDuration>,
}

/// Signed certificate material returned by the CA and rendered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignResponse {
    #[serde(rename = "crt")]
    pub server_pem: String,

    #[serde(rename = "ca")]
    pub ca_pem: String,

    #[serde(rename = "certChain", default)]
    pub cert_chain_pem: Vec<String>,

    #[serde(rename = "tlsOptions", skip_serializing_if = "Option::is_none")]
    pub tls_options: Option<Value>,
}

impl SignResponse {
    /// Leaf first, followed by its issuers.
    pub fn chain_pem(&self) -> String {
        if self.cert_chain_pem.is_empty() {
            format!("{}{}", self.server_pem, self.ca_pem)
        } else {
            self.cert_chain_pem.concat()
        }
    }
}

/// Error document returned by the CA.
#[derive(Debug, Clone, Deserialize)]
pub struct CaErrorResponse {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptedKeyResponse {
    pub key: String,
}
