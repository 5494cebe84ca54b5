//! Agent registration types and the client-assertion token exchange.

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;

/// RSA public key as big-endian base64 modulus and exponent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskAgentPublicKey {
    pub exponent: String,
    pub modulus: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskAgentAuthorization {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub authorization_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    pub public_key: TaskAgentPublicKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentLabel {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Agent descriptor as registered in a pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskAgent {
    pub authorization: TaskAgentAuthorization,
    pub labels: Vec<AgentLabel>,
    pub max_parallelism: i32,
    pub id: i64,
    pub name: String,
    pub version: String,
    pub os_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    pub provisioning_state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub access_point: String,
    pub created_on: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,
}

/// `runner-agent <os>/<arch>`.
pub fn os_description() -> String {
    format!(
        "runner-agent {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Result of the registration handshake: where the tenant lives and the
/// token used until the agent authorizes with its own key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GitHubAuthResult {
    pub tenant_url: String,
    pub token: String,
    pub token_schema: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VssOAuthTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    sub: &'a str,
    iss: &'a str,
    aud: &'a str,
    jti: String,
    nbf: i64,
    iat: i64,
    exp: i64,
}

/// Sign the RS256 client assertion for `agent`.
pub fn client_assertion(agent: &TaskAgent, key: &RsaPrivateKey) -> Result<String, ConnectionError> {
    let not_before = chrono::Utc::now().timestamp() - 30;
    let claims = AssertionClaims {
        sub: &agent.authorization.client_id,
        iss: &agent.authorization.client_id,
        aud: &agent.authorization.authorization_url,
        jti: uuid::Uuid::new_v4().to_string(),
        nbf: not_before,
        iat: not_before,
        exp: not_before + 5 * 60,
    };

    let der = key
        .to_pkcs1_der()
        .map_err(|e| ConnectionError::Authorization {
            reason: format!("cannot encode private key: {}", e),
        })?;
    let encoding_key = EncodingKey::from_rsa_der(der.as_bytes());

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key).map_err(|e| {
        ConnectionError::Authorization {
            reason: format!("cannot sign client assertion: {}", e),
        }
    })
}

/// Exchange a signed client assertion for a bearer token.
pub async fn authorize(
    client: &Client,
    agent: &TaskAgent,
    key: &RsaPrivateKey,
) -> Result<VssOAuthTokenResponse, ConnectionError> {
    let assertion = client_assertion(agent, key)?;
    let form = [
        (
            "client_assertion_type",
            "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
        ),
        ("client_assertion", assertion.as_str()),
        ("grant_type", "client_credentials"),
    ];

    let response = client
        .post(&agent.authorization.authorization_url)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .map_err(|e| ConnectionError::Authorization {
            reason: e.to_string(),
        })?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() != 200 {
        return Err(ConnectionError::Authorization {
            reason: format!("service responded with code {}: {}", status.as_u16(), body),
        });
    }

    serde_json::from_str(&body).map_err(|e| ConnectionError::Decode {
        url: agent.authorization.authorization_url.clone(),
        reason: e.to_string(),
    })
}
