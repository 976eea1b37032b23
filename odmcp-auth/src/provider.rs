//! Identity provider client
//!
//! [`OidcProviderClient`] talks OAuth2 / OpenID Connect over HTTP: the
//! authorization-code and refresh grants against the token endpoint, and
//! token validation either locally (JWT signature, audience, expiry) or via
//! RFC 7662 introspection. [`StaticIdentityProvider`] maps fixed tokens to
//! identities for development and tests.
//!
//! Every HTTP call is bounded by `request_timeout`. Only validation is
//! retried, once; code exchange and refresh are never repeated.

use crate::config::{ProviderConfig, ProviderKind, StaticTokenConfig};
use crate::error::{OdmcpError, Result};
use crate::session::{BearerCredential, SubjectInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Subject and credential returned by a successful provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderGrant {
    /// Subject claims
    pub subject: SubjectInfo,
    /// Bearer credential
    pub credential: BearerCredential,
}

/// External identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Browser URL that starts a login carrying `state`
    fn authorization_url(&self, state: &str) -> Result<String>;

    /// Redeem an authorization code
    async fn exchange_code(&self, code: &str) -> Result<ProviderGrant>;

    /// Obtain a fresh access token
    async fn refresh(&self, refresh_token: &str) -> Result<ProviderGrant>;

    /// Validate a bearer token and read its claims
    async fn validate_token(&self, token: &str) -> Result<ProviderGrant>;
}

/// Build the provider selected by `config.kind`
pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn IdentityProvider>> {
    match config.kind {
        ProviderKind::Oidc => Ok(Arc::new(OidcProviderClient::new(config)?)),
        ProviderKind::Static => Ok(Arc::new(StaticIdentityProvider::new(&config.static_tokens))),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ScopeClaim {
    List(Vec<String>),
    Spaced(String),
}

/// Claims read from a JWT or an introspection response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityClaims {
    /// Subject
    pub sub: Option<String>,
    /// Full name
    pub name: Option<String>,
    /// Given name
    pub given_name: Option<String>,
    /// Family name
    pub family_name: Option<String>,
    /// Email
    pub email: Option<String>,
    /// Zone id
    pub zid: Option<String>,
    /// Tenant id (Azure style)
    pub tid: Option<String>,
    /// Tenant
    pub tenant: Option<String>,
    /// Space-separated scopes
    pub scope: Option<String>,
    /// Expiry (seconds since epoch)
    pub exp: Option<i64>,
    /// Introspection `active` flag
    pub active: Option<bool>,
    #[serde(default)]
    scp: Option<ScopeClaim>,
}

impl IdentityClaims {
    /// Subject info from these claims
    pub fn subject(&self) -> Result<SubjectInfo> {
        let subject_id = self
            .sub
            .clone()
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| OdmcpError::InvalidToken("Token has no subject".to_string()))?;

        let display_name = self
            .name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| match (&self.given_name, &self.family_name) {
                (Some(given), Some(family)) => Some(format!("{} {}", given, family)),
                (Some(given), None) => Some(given.clone()),
                (None, Some(family)) => Some(family.clone()),
                (None, None) => None,
            });

        Ok(SubjectInfo {
            subject_id,
            display_name,
            email: self.email.clone(),
            tenant: self
                .zid
                .clone()
                .or_else(|| self.tid.clone())
                .or_else(|| self.tenant.clone()),
        }
        .sanitized())
    }

    /// Scopes from `scope` or `scp`
    pub fn scopes(&self) -> Vec<String> {
        if let Some(scope) = &self.scope {
            return split_scopes(scope);
        }
        match &self.scp {
            Some(ScopeClaim::List(scopes)) => scopes.clone(),
            Some(ScopeClaim::Spaced(scope)) => split_scopes(scope),
            None => Vec::new(),
        }
    }

    /// Expiry as a timestamp
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| DateTime::from_timestamp(exp, 0))
    }
}

fn split_scopes(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(String::from).collect()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: Option<String>,
}

enum LocalKey {
    Hs256(DecodingKey),
    Rs256(DecodingKey),
}

/// OAuth2 / OIDC provider reached over HTTP
pub struct OidcProviderClient {
    client: reqwest::Client,
    authorization_endpoint: Option<String>,
    token_endpoint: String,
    introspection_endpoint: Option<String>,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
    scopes: Vec<String>,
    audience: Option<String>,
    issuer: Option<String>,
    local_key: Option<LocalKey>,
}

impl OidcProviderClient {
    /// Create a client from provider settings
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let token_endpoint = config.token_endpoint.clone().ok_or_else(|| {
            OdmcpError::Configuration("provider.token_endpoint is not set".to_string())
        })?;
        let client_id = config
            .client_id
            .clone()
            .ok_or_else(|| OdmcpError::Configuration("provider.client_id is not set".to_string()))?;

        let local_key = match (&config.jwt_public_key_pem, &config.jwt_secret) {
            (Some(pem), _) => Some(LocalKey::Rs256(
                DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
                    OdmcpError::Configuration(format!("Invalid RSA public key: {}", e))
                })?,
            )),
            (None, Some(secret)) => Some(LocalKey::Hs256(DecodingKey::from_secret(
                secret.as_bytes(),
            ))),
            (None, None) => None,
        };

        if local_key.is_none() && config.introspection_endpoint.is_none() {
            return Err(OdmcpError::Configuration(
                "No way to validate tokens: set a JWT key or an introspection endpoint".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            authorization_endpoint: config.authorization_endpoint.clone(),
            token_endpoint,
            introspection_endpoint: config.introspection_endpoint.clone(),
            client_id,
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scopes: config.scopes.clone(),
            audience: config.audience.clone(),
            issuer: config.issuer.clone(),
            local_key,
        })
    }

    /// Claims of `token`, checked locally or by introspection
    pub async fn claims(&self, token: &str) -> Result<IdentityClaims> {
        if let Some(key) = &self.local_key {
            return self.decode_local(token, key);
        }
        with_single_retry("token introspection", || self.introspect(token)).await
    }

    fn decode_local(&self, token: &str, key: &LocalKey) -> Result<IdentityClaims> {
        let (algorithm, key) = match key {
            LocalKey::Hs256(key) => (Algorithm::HS256, key),
            LocalKey::Rs256(key) => (Algorithm::RS256, key),
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<IdentityClaims>(token, key, &validation)
            .map_err(|e| OdmcpError::InvalidToken(format!("JWT validation failed: {}", e)))?;
        Ok(data.claims)
    }

    async fn introspect(&self, token: &str) -> Result<IdentityClaims> {
        let endpoint = self.introspection_endpoint.as_deref().ok_or_else(|| {
            OdmcpError::Configuration("provider.introspection_endpoint is not set".to_string())
        })?;

        let response = self
            .client
            .post(endpoint)
            .basic_auth(&self.client_id, self.client_secret.as_deref())
            .form(&[("token", token), ("token_type_hint", "access_token")])
            .send()
            .await?;
        let response = check_status(response, "introspection").await?;

        let claims: IdentityClaims = response.json().await?;
        if claims.active != Some(true) {
            return Err(OdmcpError::InvalidToken("Token is not active".to_string()));
        }
        Ok(claims)
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let mut form: Vec<(&str, &str)> = form.to_vec();
        form.push(("client_id", self.client_id.as_str()));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .await?;
        let response = check_status(response, "token endpoint").await?;
        Ok(response.json().await?)
    }

    async fn grant_from(&self, tokens: TokenResponse) -> Result<ProviderGrant> {
        let claims = self.claims(&tokens.access_token).await?;
        let subject = claims.subject()?;

        let mut scopes = claims.scopes();
        if scopes.is_empty() {
            scopes = tokens.scope.as_deref().map(split_scopes).unwrap_or_default();
        }

        let expires_at = tokens
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
            .or_else(|| claims.expires_at());

        Ok(ProviderGrant {
            subject,
            credential: BearerCredential {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
                expires_at,
                scopes,
            },
        })
    }
}

#[async_trait]
impl IdentityProvider for OidcProviderClient {
    fn authorization_url(&self, state: &str) -> Result<String> {
        let endpoint = self.authorization_endpoint.as_deref().ok_or_else(|| {
            OdmcpError::Configuration("provider.authorization_endpoint is not set".to_string())
        })?;
        let mut url = url::Url::parse(endpoint).map_err(|e| {
            OdmcpError::Configuration(format!("Invalid authorization endpoint: {}", e))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("state", state);
            if let Some(redirect_uri) = &self.redirect_uri {
                query.append_pair("redirect_uri", redirect_uri);
            }
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
        }

        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderGrant> {
        let mut form = vec![("grant_type", "authorization_code"), ("code", code)];
        if let Some(redirect_uri) = &self.redirect_uri {
            form.push(("redirect_uri", redirect_uri.as_str()));
        }

        let tokens = self.token_request(&form).await?;
        debug!("Authorization code exchanged");
        self.grant_from(tokens).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ProviderGrant> {
        let tokens = self
            .token_request(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await?;
        debug!("Access token refreshed");

        let mut grant = self.grant_from(tokens).await?;
        // providers may omit the refresh token when it is not rotated
        if grant.credential.refresh_token.is_none() {
            grant.credential.refresh_token = Some(refresh_token.to_string());
        }
        Ok(grant)
    }

    async fn validate_token(&self, token: &str) -> Result<ProviderGrant> {
        let claims = self.claims(token).await?;
        Ok(ProviderGrant {
            subject: claims.subject()?,
            credential: BearerCredential {
                access_token: token.to_string(),
                refresh_token: None,
                expires_at: claims.expires_at(),
                scopes: claims.scopes(),
            },
        })
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status.is_server_error() {
        return Err(OdmcpError::ProviderUnavailable(format!(
            "{} returned {}",
            what, status
        )));
    }

    // only the OAuth error code is kept; bodies may echo credentials
    let body: OAuthErrorBody = response.json().await.unwrap_or_default();
    Err(OdmcpError::ProviderRejected(format!(
        "{} returned {} ({})",
        what,
        status,
        body.error.as_deref().unwrap_or("no error code")
    )))
}

/// Run a read-only provider call, repeating it once on a retryable failure
async fn with_single_retry<T, F, Fut>(what: &str, call: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match call().await {
        Err(err) if err.is_retryable() => {
            warn!(call = what, error = %err, "Identity provider call failed, retrying once");
            call().await.map_err(|err| match err {
                OdmcpError::Http(msg) => OdmcpError::ProviderUnavailable(msg),
                other => other,
            })
        }
        other => other,
    }
}

/// Fixed token table
pub struct StaticIdentityProvider {
    tokens: HashMap<String, StaticTokenConfig>,
}

impl StaticIdentityProvider {
    /// Create from configured token mappings
    pub fn new(tokens: &[StaticTokenConfig]) -> Self {
        Self {
            tokens: tokens
                .iter()
                .map(|mapping| (mapping.token.clone(), mapping.clone()))
                .collect(),
        }
    }

    fn lookup(&self, token: &str) -> Result<ProviderGrant> {
        if token.is_empty() {
            return Err(OdmcpError::InvalidToken("Empty token".to_string()));
        }
        let mapping = self
            .tokens
            .get(token)
            .ok_or_else(|| OdmcpError::InvalidToken("Unknown token".to_string()))?;

        Ok(ProviderGrant {
            subject: SubjectInfo {
                subject_id: mapping.subject_id.clone(),
                display_name: mapping.display_name.clone(),
                email: mapping.email.clone(),
                tenant: mapping.tenant.clone(),
            }
            .sanitized(),
            credential: BearerCredential::new(token)
                .with_refresh_token(token)
                .with_scopes(mapping.permissions.iter().cloned()),
        })
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    fn authorization_url(&self, _state: &str) -> Result<String> {
        Err(OdmcpError::Configuration(
            "The static identity provider has no browser login; use token login".to_string(),
        ))
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderGrant> {
        self.lookup(code)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ProviderGrant> {
        self.lookup(refresh_token)
    }

    async fn validate_token(&self, token: &str) -> Result<ProviderGrant> {
        self.lookup(token)
    }
}
