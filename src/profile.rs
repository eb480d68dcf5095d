//! Profile lookup for leaderboard decoration
//!
//! Maps addresses to optional display names and social handles. Lookups are
//! best-effort: the leaderboard service treats any `ProfileError` as "no
//! profile" and still returns ranked entries.
//!
//! ## API Reference
//!
//! Endpoint: `{base}/api/users/batch?addresses=0xa,0xb`
//! Returns: `{ "success": true, "data": [{ "address", "username", "twitterUsername", "discordUsername" }] }`

use crate::error::ProfileError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Display data for one address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub display_name: Option<String>,
    pub social_handle: Option<String>,
    pub discord_handle: Option<String>,
}

#[async_trait]
pub trait ProfileLookup: Send + Sync {
    /// Profiles keyed by lower-cased address; unknown addresses are absent
    async fn batch_lookup(&self, addresses: &[String]) -> Result<HashMap<String, Profile>, ProfileError>;
}

/// Lookup that never knows anyone
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProfileLookup;

#[async_trait]
impl ProfileLookup for NoopProfileLookup {
    async fn batch_lookup(&self, _addresses: &[String]) -> Result<HashMap<String, Profile>, ProfileError> {
        Ok(HashMap::new())
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    success: bool,
    #[serde(default)]
    data: Vec<UserRecord>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    address: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    twitter_username: Option<String>,
    #[serde(default)]
    discord_username: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// HTTP client for the users batch endpoint
#[derive(Clone)]
pub struct HttpProfileLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProfileLookup {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProfileError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn batch_url(&self) -> String {
        format!("{}/api/users/batch", self.base_url)
    }
}

#[async_trait]
impl ProfileLookup for HttpProfileLookup {
    async fn batch_lookup(&self, addresses: &[String]) -> Result<HashMap<String, Profile>, ProfileError> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }

        let response = self
            .client
            .get(self.batch_url())
            .query(&[("addresses", addresses.join(","))])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProfileError::Service(format!("status {}", response.status())));
        }

        let body: BatchResponse = response.json().await?;
        profiles_from_response(body)
    }
}

fn profiles_from_response(body: BatchResponse) -> Result<HashMap<String, Profile>, ProfileError> {
    if !body.success {
        return Err(ProfileError::Service(
            body.message.unwrap_or_else(|| "unsuccessful response".to_string()),
        ));
    }

    Ok(body
        .data
        .into_iter()
        .map(|user| {
            let profile = Profile {
                display_name: non_empty(user.username),
                social_handle: non_empty(user.twitter_username),
                discord_handle: non_empty(user.discord_username),
            };
            (user.address.to_lowercase(), profile)
        })
        .collect())
}
