/// OpenID provider metadata discovery
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::AuthError;

const WELL_KNOWN_PATH: &str = "/.well-known/openid-configuration";

#[derive(Deserialize)]
struct DiscoveryDocument {
    issuer: Option<String>,
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    end_session_endpoint: Option<String>,
    jwks_uri: Option<String>,
    #[serde(default)]
    token_endpoint_auth_methods_supported: Vec<String>,
}

/// Signing keys published at the provider's `jwks_uri`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonWebKeySet {
    #[serde(default)]
    pub keys: Vec<serde_json::Value>,
}

/// Endpoints fetched once per flow instance; read-only afterwards.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub issuer: String,
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub end_session_endpoint: Option<String>,
    pub signing_key_set: Option<JsonWebKeySet>,
    pub token_endpoint_auth_methods: Vec<String>,
}

impl ProviderEndpoints {
    /// Fetch `<authority>/.well-known/openid-configuration` and the key set it points to.
    ///
    /// With `validate_issuer_name` off, providers whose advertised issuer differs
    /// from the authority are accepted.
    pub async fn discover(
        client: &reqwest::Client,
        authority: &str,
        validate_issuer_name: bool,
    ) -> Result<Self, AuthError> {
        let authority = authority.trim_end_matches('/');
        let endpoint = format!("{}{}", authority, WELL_KNOWN_PATH);
        debug!("Fetching discovery document from {}", endpoint);

        let res = client
            .get(&endpoint)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AuthError::discovery(&endpoint, e))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::discovery(&endpoint, format!("HTTP {}: {}", status, body)));
        }

        let doc: DiscoveryDocument = res
            .json()
            .await
            .map_err(|e| AuthError::discovery(&endpoint, format!("malformed document: {}", e)))?;

        let jwks_uri = doc.jwks_uri.clone();
        let mut endpoints = Self::from_document(doc, &endpoint)?;

        if validate_issuer_name && endpoints.issuer.trim_end_matches('/') != authority {
            return Err(AuthError::discovery(
                &endpoint,
                format!("issuer '{}' does not match authority '{}'", endpoints.issuer, authority),
            ));
        }

        if let Some(jwks_uri) = jwks_uri {
            endpoints.signing_key_set = Some(fetch_key_set(client, &jwks_uri).await?);
        }

        Ok(endpoints)
    }

    fn from_document(doc: DiscoveryDocument, endpoint: &str) -> Result<Self, AuthError> {
        let authorize_endpoint = require_url(doc.authorization_endpoint, "authorization_endpoint", endpoint)?;
        let token_endpoint = require_url(doc.token_endpoint, "token_endpoint", endpoint)?;

        Ok(Self {
            issuer: doc.issuer.unwrap_or_default(),
            authorize_endpoint,
            token_endpoint,
            end_session_endpoint: doc.end_session_endpoint,
            signing_key_set: None,
            token_endpoint_auth_methods: doc.token_endpoint_auth_methods_supported,
        })
    }

    /// End-session URL for signing the user out of the provider, if advertised.
    pub fn end_session_url(
        &self,
        id_token_hint: Option<&str>,
        post_logout_redirect_uri: Option<&str>,
    ) -> Option<String> {
        let mut url = Url::parse(self.end_session_endpoint.as_deref()?).ok()?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(hint) = id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
            if let Some(redirect) = post_logout_redirect_uri {
                query.append_pair("post_logout_redirect_uri", redirect);
            }
        }
        Some(url.to_string())
    }
}

fn require_url(value: Option<String>, field: &str, endpoint: &str) -> Result<String, AuthError> {
    let value = value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AuthError::discovery(endpoint, format!("document is missing {}", field)))?;
    Url::parse(&value)
        .map_err(|e| AuthError::discovery(endpoint, format!("{} '{}' is not a valid URL: {}", field, value, e)))?;
    Ok(value)
}

async fn fetch_key_set(client: &reqwest::Client, jwks_uri: &str) -> Result<JsonWebKeySet, AuthError> {
    let res = client
        .get(jwks_uri)
        .send()
        .await
        .map_err(|e| AuthError::discovery(jwks_uri, e))?;

    if !res.status().is_success() {
        return Err(AuthError::discovery(jwks_uri, format!("HTTP {}", res.status())));
    }

    res.json()
        .await
        .map_err(|e| AuthError::discovery(jwks_uri, format!("malformed key set: {}", e)))
}
