// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Provisioner key handling and one-time token minting.
//!
//! The CA hands out the provisioner's signing key as a password-protected
//! compact JWE (`PBES2-HS256+A128KW` key management, AES-GCM content
//! encryption). Once decrypted, the EC P-256 JWK inside is used to sign
//! short-lived ES256 JWTs scoped to a subject and a list of SANs.
//!
//! # Security
//!
//! - The password and every intermediate key are zeroized after use
//! - The decrypted key never leaves [`ProvisionerKey`]

use std::fmt;
use std::num::NonZeroU32;

use aws_lc_rs::aead::{AES_128_GCM, AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use aws_lc_rs::key_wrap::{AES_128, AesKek, KeyWrap};
use aws_lc_rs::pbkdf2;
use aws_lc_rs::rand;
use aws_lc_rs::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair};
use data_encoding::{BASE64URL_NOPAD, HEXLOWER};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::models::OneTimeToken;

const KEY_MANAGEMENT_ALG: &str = "PBES2-HS256+A128KW";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TokenError {
    #[error("malformed JWE: {0}")]
    MalformedJwe(String),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("unable to decrypt provisioner key")]
    Decrypt,
    #[error("invalid provisioner key: {0}")]
    InvalidKey(String),
    #[error("malformed token: {0}")]
    MalformedToken(String),
    #[error("unable to sign token")]
    Signing,
}

#[derive(Debug, Deserialize)]
struct JweHeader {
    alg: String,
    enc: String,
    p2s: String,
    p2c: u32,
}

#[derive(Deserialize, Zeroize, ZeroizeOnDrop)]
struct Jwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
    d: String,
}

/// Claims carried by a provisioner token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    #[serde(default)]
    pub sans: Vec<String>,
    #[serde(default)]
    pub sha: String,
    pub nbf: i64,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Decrypted provisioner signing key.
pub struct ProvisionerKey {
    kid: String,
    key: EncodingKey,
}

impl ProvisionerKey {
    /// Decrypts the compact JWE returned by the CA's encrypted-key endpoint.
    pub fn decrypt(kid: &str, jwe: &str, password: &[u8]) -> Result<Self, TokenError> {
        let plaintext = decrypt_jwe(jwe, password)?;
        let jwk: Jwk = serde_json::from_slice(&plaintext)
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        Self::from_jwk(kid, &jwk)
    }

    fn from_jwk(kid: &str, jwk: &Jwk) -> Result<Self, TokenError> {
        if jwk.kty != "EC" || jwk.crv != "P-256" {
            return Err(TokenError::UnsupportedAlgorithm(format!(
                "{} {}",
                jwk.kty, jwk.crv
            )));
        }

        let x = decode_segment(&jwk.x)?;
        let y = decode_segment(&jwk.y)?;
        let d = Zeroizing::new(decode_segment(&jwk.d)?);

        // uncompressed SEC1 point
        let mut public_key = Vec::with_capacity(1 + x.len() + y.len());
        public_key.push(0x04);
        public_key.extend_from_slice(&x);
        public_key.extend_from_slice(&y);

        let key_pair = EcdsaKeyPair::from_private_key_and_public_key(
            &ECDSA_P256_SHA256_FIXED_SIGNING,
            &d,
            &public_key,
        )
        .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let pkcs8 = key_pair
            .to_pkcs8v1()
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let pkcs8 = Zeroizing::new(pkcs8.as_ref().to_vec());

        Ok(Self {
            kid: kid.to_string(),
            key: EncodingKey::from_ec_der(&pkcs8),
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Signs `claims` into a compact ES256 JWT.
    pub fn mint(&self, claims: &TokenClaims) -> Result<OneTimeToken, TokenError> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.clone());

        encode(&header, claims, &self.key)
            .map(OneTimeToken::new)
            .map_err(|_| TokenError::Signing)
    }
}

impl fmt::Debug for ProvisionerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionerKey")
            .field("kid", &self.kid)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Reads the claims of a token without checking its signature.
///
/// Only used on tokens this process minted itself.
pub fn decode_claims(token: &OneTimeToken) -> Result<TokenClaims, TokenError> {
    let mut validation = Validation::new(Algorithm::ES256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<TokenClaims>(token.as_str(), &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| TokenError::MalformedToken(e.to_string()))
}

/// Random 128-bit token identifier.
pub fn new_token_id() -> Result<String, TokenError> {
    let mut id = [0u8; 16];
    rand::fill(&mut id).map_err(|_| TokenError::Signing)?;
    Ok(HEXLOWER.encode(&id))
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, TokenError> {
    BASE64URL_NOPAD
        .decode(segment.as_bytes())
        .map_err(|e| TokenError::MalformedJwe(e.to_string()))
}

fn decrypt_jwe(jwe: &str, password: &[u8]) -> Result<Zeroizing<Vec<u8>>, TokenError> {
    let segments: Vec<&str> = jwe.trim().split('.').collect();
    let [protected, encrypted_key, iv, ciphertext, tag] = segments.as_slice() else {
        return Err(TokenError::MalformedJwe(format!(
            "expected 5 segments, found {}",
            segments.len()
        )));
    };

    let header: JweHeader = serde_json::from_slice(&decode_segment(protected)?)
        .map_err(|e| TokenError::MalformedJwe(e.to_string()))?;
    if header.alg != KEY_MANAGEMENT_ALG {
        return Err(TokenError::UnsupportedAlgorithm(header.alg));
    }
    let content_alg = match header.enc.as_str() {
        "A128GCM" => &AES_128_GCM,
        "A256GCM" => &AES_256_GCM,
        other => return Err(TokenError::UnsupportedAlgorithm(other.to_string())),
    };
    let iterations = NonZeroU32::new(header.p2c)
        .ok_or_else(|| TokenError::MalformedJwe("p2c must be positive".to_string()))?;

    // RFC 7518 4.8.1.1: salt = alg || 0x00 || p2s
    let mut salt = header.alg.as_bytes().to_vec();
    salt.push(0x00);
    salt.extend_from_slice(&decode_segment(&header.p2s)?);

    let mut kek = Zeroizing::new([0u8; 16]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password,
        &mut *kek,
    );

    let wrapped = decode_segment(encrypted_key)?;
    let mut cek_buf = Zeroizing::new(vec![0u8; wrapped.len()]);
    let cek = AesKek::new(&AES_128, &*kek)
        .map_err(|_| TokenError::Decrypt)?
        .unwrap(&wrapped, &mut cek_buf)
        .map_err(|_| TokenError::Decrypt)?;

    let key = UnboundKey::new(content_alg, cek).map_err(|_| TokenError::Decrypt)?;
    let key = LessSafeKey::new(key);
    let nonce =
        Nonce::try_assume_unique_for_key(&decode_segment(iv)?).map_err(|_| TokenError::Decrypt)?;

    let mut in_out = Zeroizing::new(decode_segment(ciphertext)?);
    in_out.extend_from_slice(&decode_segment(tag)?);
    let plaintext_len = key
        .open_in_place(nonce, Aad::from(protected.as_bytes()), &mut in_out)
        .map_err(|_| TokenError::Decrypt)?
        .len();
    in_out.truncate(plaintext_len);

    Ok(in_out)
}
