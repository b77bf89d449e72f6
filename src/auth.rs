//! JWT validation (spec §6 "Authentication"). The core never mints tokens
//! (spec.md Non-goals: "identity issuance (external token issuer)") — this
//! is the plug that decodes whatever an external issuer handed the client,
//! implementing [`TokenValidator`] for [`Runtime`]-free use from `main.rs`.

use std::collections::HashMap;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::UserId;
use crate::transport::{TokenClaims, TokenValidator};

/// Where the signing key comes from. RS256 is preferred for external
/// providers (Firebase, Auth0, Supabase); HS256 is the simple single-node
/// fallback.
#[derive(Clone, Debug)]
pub enum SigningKey {
    Rsa256PublicKeyPem(String),
    Hs256Secret(String),
}

#[derive(Clone, Debug)]
pub struct JwtConfig {
    pub key: SigningKey,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

impl JwtConfig {
    /// Reads `AUTH_PUBLIC_KEY_PEM` (preferred) or `AUTH_SECRET`, plus
    /// optional `AUTH_ISSUER`/`AUTH_AUDIENCE`.
    pub fn from_env() -> anyhow::Result<Self> {
        let key = if let Ok(pem) = std::env::var("AUTH_PUBLIC_KEY_PEM") {
            SigningKey::Rsa256PublicKeyPem(pem)
        } else if let Ok(secret) = std::env::var("AUTH_SECRET") {
            SigningKey::Hs256Secret(secret)
        } else {
            anyhow::bail!("set AUTH_PUBLIC_KEY_PEM or AUTH_SECRET to validate session tokens");
        };
        Ok(Self {
            key,
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
        })
    }
}

/// The JWT shape this core expects from an external issuer: a subject that
/// parses as a [`UserId`], a username, an expiry, and an open-ended set of
/// string vars carried through to [`crate::session::Session::vars`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionTokenClaims {
    sub: UserId,
    username: String,
    exp: i64,
    #[serde(default)]
    vars: HashMap<String, String>,
}

pub struct JwtTokenValidator {
    config: JwtConfig,
}

impl JwtTokenValidator {
    pub fn new(config: JwtConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl TokenValidator for JwtTokenValidator {
    async fn validate(&self, token: &str) -> Result<TokenClaims, CoreError> {
        let (algorithm, decoding_key) = match &self.config.key {
            SigningKey::Rsa256PublicKeyPem(pem) => (
                Algorithm::RS256,
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| CoreError::Internal(anyhow::anyhow!("invalid RS256 public key: {e}")))?,
            ),
            SigningKey::Hs256Secret(secret) => (Algorithm::HS256, DecodingKey::from_secret(secret.as_bytes())),
        };

        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims = std::collections::HashSet::from(["exp".to_string(), "sub".to_string()]);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.config.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        let data = decode::<SessionTokenClaims>(token, &decoding_key, &validation)
            .map_err(|e| CoreError::Unauthenticated(e.to_string()))?;

        Ok(TokenClaims {
            user_id: data.claims.sub,
            username: data.claims.username,
            vars: data.claims.vars,
            expiry: data.claims.exp,
        })
    }
}
