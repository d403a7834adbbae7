use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use super::jwks::JwksCache;
use crate::config::BACKEND_ISSUER;
use crate::error::ApiError;
use crate::Clock;

/// Claims the resolver reads; signature/exp/iss/aud enforcement happens in
/// `jsonwebtoken`'s validation pass.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    iss: Option<String>,
    token_type: Option<String>,
}

/// Outcome of bearer validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedToken {
    pub sub: String,
    /// `true` for backend-issued HS256 tokens.
    pub backend: bool,
}

/// Validates the two accepted token families: external-IdP RS256 tokens
/// against the JWKS cache, and backend-issued HS256 tokens against the
/// shared secret.
pub struct TokenValidator {
    issuer: Option<String>,
    audience: Option<String>,
    additional_audiences: Vec<String>,
    hs256_secret: Option<String>,
    jwks: Option<JwksCache>,
}

impl TokenValidator {
    pub fn new(
        issuer: Option<String>,
        jwks_url: Option<String>,
        audience: Option<String>,
        additional_audiences: Vec<String>,
        hs256_secret: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let jwks = jwks_url.map(|url| JwksCache::new(url, clock));
        if issuer.is_some() && audience.is_none() && additional_audiences.is_empty() {
            // Dynamic-client-registration deployments leave both audience
            // lists empty; issuer + signature then pin the token alone.
            tracing::warn!("audience validation disabled: no audiences configured (DCR carve-out)");
        }
        Self { issuer, audience, additional_audiences, hs256_secret, jwks }
    }

    /// `true` when the DCR carve-out is active and `aud` is not checked.
    pub fn audience_check_disabled(&self) -> bool {
        self.audience.is_none() && self.additional_audiences.is_empty()
    }

    pub async fn validate(&self, token: &str) -> Result<ValidatedToken, ApiError> {
        let header = decode_header(token)
            .map_err(|e| ApiError::Auth(format!("malformed token: {e}")))?;

        match header.alg {
            Algorithm::HS256 => self.validate_backend(token),
            Algorithm::RS256 => self.validate_idp(token, header.kid.as_deref()).await,
            other => Err(ApiError::Auth(format!("unsupported signing algorithm: {other:?}"))),
        }
    }

    /// Backend tokens: HS256 with the shared secret, marked by
    /// `token_type = "backend"` or the legacy backend issuer. Issuer and
    /// audience checks are bypassed for these.
    fn validate_backend(&self, token: &str) -> Result<ValidatedToken, ApiError> {
        let secret = self
            .hs256_secret
            .as_deref()
            .ok_or_else(|| ApiError::Auth("backend tokens not accepted".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
            .map_err(|e| ApiError::Auth(format!("invalid token: {e}")))?;

        let is_backend = data.claims.token_type.as_deref() == Some("backend")
            || data.claims.iss.as_deref() == Some(BACKEND_ISSUER);
        if !is_backend {
            return Err(ApiError::Auth("HS256 token is not a backend token".to_string()));
        }
        Ok(ValidatedToken { sub: data.claims.sub, backend: true })
    }

    /// External-IdP tokens: RS256 against the JWKS cache, issuer pinned,
    /// audience checked unless the DCR carve-out applies.
    async fn validate_idp(&self, token: &str, kid: Option<&str>) -> Result<ValidatedToken, ApiError> {
        let jwks = self
            .jwks
            .as_ref()
            .ok_or_else(|| ApiError::Auth("external tokens not accepted: no JWKS URL".to_string()))?;
        let issuer = self
            .issuer
            .as_deref()
            .ok_or_else(|| ApiError::Auth("external tokens not accepted: no issuer".to_string()))?;
        let kid = kid.ok_or_else(|| ApiError::Auth("token missing kid".to_string()))?;

        let key = jwks.key_for(kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        if self.audience_check_disabled() {
            validation.validate_aud = false;
        } else {
            let mut audiences: Vec<&str> = Vec::new();
            if let Some(primary) = self.audience.as_deref() {
                audiences.push(primary);
            }
            audiences.extend(self.additional_audiences.iter().map(String::as_str));
            validation.set_audience(&audiences);
        }

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| ApiError::Auth(format!("invalid token: {e}")))?;
        Ok(ValidatedToken { sub: data.claims.sub, backend: false })
    }
}
