//! Credentials: signed tokens resolving to register/invoke rights.
//!
//! The protocol engine only sees the `CredentialVerifier` trait. Two
//! implementations live here: `JwtVerifier` for real deployments and
//! `StaticVerifier` for fixed token tables.

use std::collections::HashMap;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::RviError;
use crate::pattern::PatternSet;

/// Rights resolved from one verified credential.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grant {
    /// Names the holder may register (announce).
    pub register: PatternSet,
    /// Names the holder may invoke.
    pub invoke: PatternSet,
}

impl Grant {
    pub fn new(register: PatternSet, invoke: PatternSet) -> Self {
        Self { register, invoke }
    }

    /// Build a grant from pattern source strings.
    pub fn from_patterns<R, I>(register: R, invoke: I) -> Result<Self, RviError>
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Ok(Self {
            register: PatternSet::parse(register)?,
            invoke: PatternSet::parse(invoke)?,
        })
    }

    /// Union another grant into this one.
    pub fn merge(&mut self, other: &Grant) {
        self.register.merge(&other.register);
        self.invoke.merge(&other.invoke);
    }
}

/// Verifies one opaque credential token.
pub trait CredentialVerifier: Send + Sync {
    /// Returns the granted rights, or `ProtocolViolation` if the token is
    /// malformed or its signature does not verify.
    fn verify(&self, token: &str) -> Result<Grant, RviError>;
}

// ── JWT ───────────────────────────────────────────────────────────────────────

/// Claims carried by an RVI credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default)]
    pub right_to_register: Vec<String>,
    #[serde(default)]
    pub right_to_invoke: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
}

/// Verifies JWT credentials against one signing key.
///
/// `exp` and `nbf` are checked when present but not required.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// HMAC-SHA256 shared secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        Self::with_key(DecodingKey::from_secret(secret), Algorithm::HS256)
    }

    /// RS256 public key in PEM form.
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, RviError> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| RviError::InvalidArgument(format!("bad RSA verification key: {e}")))?;
        Ok(Self::with_key(key, Algorithm::RS256))
    }

    /// ES256 public key in PEM form.
    pub fn from_ec_pem(pem: &[u8]) -> Result<Self, RviError> {
        let key = DecodingKey::from_ec_pem(pem)
            .map_err(|e| RviError::InvalidArgument(format!("bad EC verification key: {e}")))?;
        Ok(Self::with_key(key, Algorithm::ES256))
    }

    /// Pick RS256 or ES256 from the PEM contents.
    pub fn from_pem(pem: &[u8]) -> Result<Self, RviError> {
        Self::from_rsa_pem(pem).or_else(|_| Self::from_ec_pem(pem))
    }

    fn with_key(key: DecodingKey, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims.clear();
        validation.validate_aud = false;
        validation.validate_nbf = true;
        Self { key, validation }
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Grant, RviError> {
        let data = decode::<CredentialClaims>(token, &self.key, &self.validation)
            .map_err(|e| RviError::ProtocolViolation(format!("credential rejected: {e}")))?;
        let claims = data.claims;
        tracing::debug!(
            id = claims.id.as_deref().unwrap_or("-"),
            iss = claims.iss.as_deref().unwrap_or("-"),
            register = claims.right_to_register.len(),
            invoke = claims.right_to_invoke.len(),
            "credential verified"
        );
        Grant::from_patterns(&claims.right_to_register, &claims.right_to_invoke)
    }
}

// ── Static table ──────────────────────────────────────────────────────────────

/// Fixed token → grant table. Unknown tokens are rejected.
#[derive(Debug, Clone, Default)]
pub struct StaticVerifier {
    grants: HashMap<String, Grant>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, grant: Grant) -> Self {
        self.grants.insert(token.into(), grant);
        self
    }
}

impl CredentialVerifier for StaticVerifier {
    fn verify(&self, token: &str) -> Result<Grant, RviError> {
        self.grants
            .get(token)
            .cloned()
            .ok_or_else(|| RviError::ProtocolViolation("unknown credential".into()))
    }
}
