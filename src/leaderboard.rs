//! Leaderboard service
//!
//! Wraps the aggregator for consumers: parses the requested timeframe,
//! applies the default limit, assigns 1-based ranks and decorates entries
//! with profile data. A failing profile lookup only removes the decoration.

use crate::aggregator::{Aggregator, Timeframe};
use crate::error::LeaderboardError;
use crate::profile::{NoopProfileLookup, Profile, ProfileLookup};
use crate::types::LeaderboardEntry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedEntry {
    pub rank: usize,
    #[serde(flatten)]
    pub entry: LeaderboardEntry,
    pub display_name: Option<String>,
    pub social_handle: Option<String>,
    pub discord_handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardResponse {
    pub success: bool,
    pub timeframe: Timeframe,
    /// Unix seconds
    pub generated_at: i64,
    pub entries: Vec<RankedEntry>,
}

pub struct LeaderboardService {
    aggregator: Aggregator,
    profiles: Arc<dyn ProfileLookup>,
    default_limit: usize,
}

impl LeaderboardService {
    pub fn new(aggregator: Aggregator, profiles: Arc<dyn ProfileLookup>, default_limit: usize) -> Self {
        Self {
            aggregator,
            profiles,
            default_limit,
        }
    }

    pub fn without_profiles(aggregator: Aggregator, default_limit: usize) -> Self {
        Self::new(aggregator, Arc::new(NoopProfileLookup), default_limit)
    }

    /// Ranked leaderboard for a timeframe name such as `"daily"`
    pub async fn leaderboard(
        &self,
        timeframe: &str,
        limit: Option<usize>,
    ) -> Result<LeaderboardResponse, LeaderboardError> {
        let timeframe: Timeframe = timeframe.parse()?;
        let limit = limit.unwrap_or(self.default_limit);
        let generated_at = chrono::Utc::now().timestamp();

        let entries = self
            .aggregator
            .build_leaderboard_at(timeframe, limit, generated_at)
            .await?;
        let entries = self.decorate(entries).await;

        Ok(LeaderboardResponse {
            success: true,
            timeframe,
            generated_at,
            entries,
        })
    }

    async fn decorate(&self, entries: Vec<LeaderboardEntry>) -> Vec<RankedEntry> {
        let addresses: Vec<String> = entries.iter().map(|e| e.actor.clone()).collect();

        let profiles = match self.profiles.batch_lookup(&addresses).await {
            Ok(profiles) => profiles,
            Err(e) => {
                log::warn!("⚠️  Profile lookup failed, serving leaderboard without names: {}", e);
                Default::default()
            }
        };

        entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let profile = profiles.get(&entry.actor).cloned().unwrap_or_else(Profile::default);
                RankedEntry {
                    rank: i + 1,
                    entry,
                    display_name: profile.display_name,
                    social_handle: profile.social_handle,
                    discord_handle: profile.discord_handle,
                }
            })
            .collect()
    }
}
