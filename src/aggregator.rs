//! Leaderboard aggregation over indexed greeting events
//!
//! Pure read over committed data: select events in the timeframe, group by
//! sender, compute counts and the trailing day streak, score, rank.
//!
//! Day boundaries are UTC: `day_index = floor(occurred_at / 86400)`.

use crate::config::ScoringWeights;
use crate::error::LeaderboardError;
use crate::store::EventStore;
use crate::types::{day_index, normalize_address, GreetingEvent, LeaderboardEntry};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Timeframe {
    Daily,
    Weekly,
    AllTime,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Daily => "daily",
            Timeframe::Weekly => "weekly",
            Timeframe::AllTime => "allTime",
        }
    }

    /// Lookback in seconds, `None` for all time
    pub fn duration_secs(&self) -> Option<i64> {
        match self {
            Timeframe::Daily => Some(86_400),
            Timeframe::Weekly => Some(7 * 86_400),
            Timeframe::AllTime => None,
        }
    }

    /// Earliest `occurred_at` included at `now`
    pub fn cutoff(&self, now: i64) -> Option<i64> {
        self.duration_secs().map(|secs| now - secs)
    }

    pub fn all() -> [Timeframe; 3] {
        [Timeframe::Daily, Timeframe::Weekly, Timeframe::AllTime]
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = LeaderboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Timeframe::Daily),
            "weekly" => Ok(Timeframe::Weekly),
            "alltime" | "all-time" | "all_time" => Ok(Timeframe::AllTime),
            other => Err(LeaderboardError::InvalidArgument(format!("unknown timeframe '{}'", other))),
        }
    }
}

/// Trailing run of consecutive days ending at the last day in `days`
///
/// `days` must be sorted ascending and de-duplicated. Empty input has no
/// streak.
pub fn compute_streak(days: &[i64]) -> u64 {
    if days.is_empty() {
        return 0;
    }

    let mut streak = 1;
    for pair in days.windows(2) {
        match pair[1] - pair[0] {
            1 => streak += 1,
            0 => {}
            _ => streak = 1,
        }
    }
    streak
}

/// Weighted score, saturating at `u64::MAX`
pub fn compute_score(sent: u64, streak: u64, received: u64, weights: &ScoringWeights) -> u64 {
    sent.saturating_mul(weights.sent)
        .saturating_add(streak.saturating_mul(weights.streak))
        .saturating_add(received.saturating_mul(weights.received))
}

/// Score desc, then sent count desc, then address asc
fn rank_order(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.sent_count.cmp(&a.sent_count))
        .then_with(|| a.actor.cmp(&b.actor))
}

#[derive(Default)]
struct ActorTally {
    sent: u64,
    days: BTreeSet<i64>,
    last_event_at: i64,
}

/// Ranked entries for every sender in `events` that falls inside `timeframe`
///
/// Pure function of its inputs; `now` anchors the timeframe cutoff.
pub fn compute_leaderboard(
    events: &[GreetingEvent],
    timeframe: Timeframe,
    now: i64,
    weights: &ScoringWeights,
) -> Vec<LeaderboardEntry> {
    let cutoff = timeframe.cutoff(now);
    let in_range = |event: &&GreetingEvent| cutoff.map_or(true, |c| event.occurred_at >= c);

    let mut tallies: HashMap<String, ActorTally> = HashMap::new();
    let mut received: HashMap<String, u64> = HashMap::new();

    for event in events.iter().filter(in_range) {
        let actor = event.actor.to_lowercase();
        let tally = tallies.entry(actor).or_default();
        tally.sent += 1;
        tally.days.insert(day_index(event.occurred_at));
        tally.last_event_at = tally.last_event_at.max(event.occurred_at);

        if !event.is_broadcast() {
            *received.entry(event.recipient.to_lowercase()).or_insert(0) += 1;
        }
    }

    let mut entries: Vec<LeaderboardEntry> = tallies
        .into_iter()
        .map(|(actor, tally)| {
            let days: Vec<i64> = tally.days.into_iter().collect();
            let streak_days = compute_streak(&days);
            let received_count = received.get(&actor).copied().unwrap_or(0);
            LeaderboardEntry {
                score: compute_score(tally.sent, streak_days, received_count, weights),
                actor,
                sent_count: tally.sent,
                received_count,
                streak_days,
                last_event_at: tally.last_event_at,
            }
        })
        .collect();

    entries.sort_by(rank_order);
    entries
}

/// Reads the event store and ranks actors
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn EventStore>,
    weights: ScoringWeights,
}

impl Aggregator {
    pub fn new(store: Arc<dyn EventStore>, weights: ScoringWeights) -> Self {
        Self { store, weights }
    }

    /// Top `limit` actors for `timeframe` as of now
    pub async fn build_leaderboard(
        &self,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>, LeaderboardError> {
        self.build_leaderboard_at(timeframe, limit, chrono::Utc::now().timestamp())
            .await
    }

    /// Top `limit` actors for `timeframe` as of `now`
    pub async fn build_leaderboard_at(
        &self,
        timeframe: Timeframe,
        limit: usize,
        now: i64,
    ) -> Result<Vec<LeaderboardEntry>, LeaderboardError> {
        if limit == 0 {
            return Err(LeaderboardError::InvalidArgument("limit must be at least 1".to_string()));
        }

        let events = self.store.query_by_time_range(timeframe.cutoff(now)).await?;
        let mut entries = compute_leaderboard(&events, timeframe, now, &self.weights);
        entries.truncate(limit);

        log::debug!(
            "📊 {} leaderboard: {} events scanned, {} entries returned",
            timeframe,
            events.len(),
            entries.len()
        );
        Ok(entries)
    }

    /// Stats for one address, `None` if it sent nothing in the timeframe
    pub async fn actor_stats(
        &self,
        address: &str,
        timeframe: Timeframe,
    ) -> Result<Option<LeaderboardEntry>, LeaderboardError> {
        let actor = normalize_address(address)
            .ok_or_else(|| LeaderboardError::InvalidArgument(format!("malformed address '{}'", address)))?;

        let now = chrono::Utc::now().timestamp();
        let events = self.store.query_by_time_range(timeframe.cutoff(now)).await?;
        Ok(compute_leaderboard(&events, timeframe, now, &self.weights)
            .into_iter()
            .find(|entry| entry.actor == actor))
    }
}
