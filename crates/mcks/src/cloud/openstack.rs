//! OpenStack compute lookup.
//!
//! Authenticates against Keystone v3 with the ambient `OS_*` environment
//! and resolves a node's server name through the Nova API in region
//! `RegionOne`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::CloudError;

/// Region the compute endpoint is resolved in.
const REGION: &str = "RegionOne";

/// Default timeout for OpenStack API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    #[serde(default)]
    interface: String,
    #[serde(default)]
    region: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ServersResponse {
    #[serde(default)]
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct Server {
    name: String,
}

fn env_var(name: &str) -> Result<String, CloudError> {
    std::env::var(name)
        .map_err(|_| CloudError::Auth(format!("environment variable {name} is not set")))
}

/// Nova client scoped to one authenticated token.
#[derive(Debug)]
pub struct OpenStackClient {
    client: reqwest::Client,
    compute_url: String,
    token: String,
}

impl OpenStackClient {
    /// Authenticate with Keystone using the ambient `OS_*` environment
    /// and resolve the public compute endpoint for the region.
    pub async fn from_env() -> Result<Self, CloudError> {
        let auth_url = env_var("OS_AUTH_URL")?;
        let username = env_var("OS_USERNAME")?;
        let password = env_var("OS_PASSWORD")?;
        let project = env_var("OS_PROJECT_NAME")?;
        let domain =
            std::env::var("OS_USER_DOMAIN_NAME").unwrap_or_else(|_| "Default".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": username,
                            "domain": {"name": domain},
                            "password": password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": project,
                        "domain": {"name": domain},
                    }
                }
            }
        });

        let url = format!("{}/auth/tokens", auth_url.trim_end_matches('/'));
        debug!(url = %url, "authenticating with keystone");
        let response = client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::Auth(format!(
                "keystone rejected authentication ({status}): {text}"
            )));
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| CloudError::Auth("keystone returned no subject token".to_string()))?;
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| CloudError::Api(e.to_string()))?;

        let compute_url = parsed
            .token
            .catalog
            .iter()
            .find(|entry| entry.service_type == "compute")
            .and_then(|entry| {
                entry
                    .endpoints
                    .iter()
                    .find(|ep| ep.interface == "public" && ep.region == REGION)
            })
            .map(|ep| ep.url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                CloudError::Api(format!("no public compute endpoint in region {REGION}"))
            })?;

        Ok(Self {
            client,
            compute_url,
            token,
        })
    }

    /// Name of the first compute server matching `name` exactly.
    pub async fn server_name(&self, name: &str) -> Result<String, CloudError> {
        let url = format!("{}/servers/detail?name={name}", self.compute_url);
        debug!(url = %url, "listing servers");
        let response = self
            .client
            .get(&url)
            .header("X-Auth-Token", &self.token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CloudError::Lookup {
                node: name.to_string(),
                cause: format!("compute API error ({status}): {text}"),
            });
        }

        let parsed: ServersResponse = response
            .json()
            .await
            .map_err(|e| CloudError::Lookup {
                node: name.to_string(),
                cause: e.to_string(),
            })?;

        // The name filter is a pattern match on the Nova side; narrow it
        // to exact equality before taking the first hit.
        parsed
            .servers
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.name)
            .ok_or_else(|| CloudError::Lookup {
                node: name.to_string(),
                cause: "no server in the cloud".to_string(),
            })
    }
}
