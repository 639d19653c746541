use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::account::Account;

/// Fields extracted from one page load, before they become a Snapshot.
///
/// Every field is optional: anonymous browsing may not expose all of them,
/// and a missing value is passed through rather than defaulted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProfile {
    pub full_name: Option<String>,
    pub biography: Option<String>,
    pub followers: Option<u64>,
    pub profile_pic_url: Option<String>,
}

impl RawProfile {
    /// True when the page yielded nothing usable.
    pub fn is_empty(&self) -> bool {
        self.followers.is_none() && self.profile_pic_url.is_none() && self.full_name.is_none()
    }
}

/// One fetched, immutable data point for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub account: Account,
    pub full_name: Option<String>,
    pub biography: Option<String>,
    pub follower_count: Option<u64>,
    pub profile_image_remote_url: Option<String>,
    pub profile_image_local_path: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn from_raw(account: Account, raw: RawProfile, fetched_at: DateTime<Utc>) -> Self {
        Self {
            account,
            full_name: raw.full_name,
            biography: raw.biography,
            follower_count: raw.followers,
            profile_image_remote_url: raw.profile_pic_url,
            profile_image_local_path: None,
            fetched_at,
        }
    }

    /// A copy that supersedes this snapshot with a resolved image path.
    pub fn with_local_path(&self, path: Option<String>) -> Self {
        Self {
            profile_image_local_path: path,
            ..self.clone()
        }
    }
}

/// The unit persisted per account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub snapshot: Snapshot,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        is_fresh(self.stored_at, now, ttl)
    }
}

/// `now - stored_at < ttl`.
pub fn is_fresh(stored_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(stored_at) < ttl
}

/// What the API layer serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(rename = "username")]
    pub account: Account,
    pub full_name: Option<String>,
    pub biography: Option<String>,
    #[serde(rename = "followers")]
    pub follower_count: Option<u64>,
    #[serde(rename = "profilePictureUrl")]
    pub profile_image_remote_url: Option<String>,
    #[serde(rename = "profileImagePath")]
    pub profile_image_local_path: Option<String>,
    pub is_cached: bool,
    /// Served from an expired entry because every fetch attempt failed.
    pub is_stale: bool,
    pub scraped_at: DateTime<Utc>,
}

impl Profile {
    fn from_snapshot(snapshot: Snapshot, is_cached: bool, is_stale: bool) -> Self {
        Self {
            account: snapshot.account,
            full_name: snapshot.full_name,
            biography: snapshot.biography,
            follower_count: snapshot.follower_count,
            profile_image_remote_url: snapshot.profile_image_remote_url,
            profile_image_local_path: snapshot.profile_image_local_path,
            is_cached,
            is_stale,
            scraped_at: snapshot.fetched_at,
        }
    }

    pub fn fresh(snapshot: Snapshot) -> Self {
        Self::from_snapshot(snapshot, false, false)
    }

    pub fn cached(snapshot: Snapshot) -> Self {
        Self::from_snapshot(snapshot, true, false)
    }

    pub fn stale(snapshot: Snapshot) -> Self {
        Self::from_snapshot(snapshot, true, true)
    }
}
