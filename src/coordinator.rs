//! Electing one instance to run the activity scan.
//!
//! Every instance attached to the same tmux server shares the lease and the
//! published snapshot through global options. tmux has no compare-and-swap,
//! so a claim is a write followed by a confirming read; whichever write
//! landed last wins, and everyone checks epoch and age on every read.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, info, warn};

use crate::config::LeaseConfig;
use crate::error::TmuxError;
use crate::tmux::{options, TagQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRole {
    /// Runs the real scan and publishes the result
    Owner,
    /// Reads the owner's published snapshot
    Follower,
}

impl fmt::Display for ScanRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanRole::Owner => write!(f, "owner"),
            ScanRole::Follower => write!(f, "follower"),
        }
    }
}

/// Time-bounded claim on the owner role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lease {
    /// Empty when nobody holds the lease
    pub owner_id: String,
    pub epoch: u64,
    pub heartbeat_ms: i64,
}

impl Lease {
    pub fn is_alive(&self, now_ms: i64, ttl_ms: i64) -> bool {
        !self.owner_id.is_empty() && now_ms - self.heartbeat_ms <= ttl_ms
    }
}

/// Active workspace ids as published by the owner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivitySnapshot {
    pub epoch: u64,
    pub timestamp_ms: i64,
    pub workspaces: BTreeSet<String>,
}

impl ActivitySnapshot {
    /// `epoch;timestamp_ms;id,id,...`
    ///
    /// Ids containing `,` or `;` cannot be represented and are left out.
    pub fn encode(&self) -> String {
        let ids: Vec<&str> = self
            .workspaces
            .iter()
            .map(String::as_str)
            .filter(|id| !id.is_empty() && !id.contains([',', ';']))
            .collect();
        format!("{};{};{}", self.epoch, self.timestamp_ms, ids.join(","))
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().splitn(3, ';');
        let epoch = parts.next()?.parse::<u64>().ok()?;
        let timestamp_ms = parts.next()?.parse::<i64>().ok().filter(|ts| *ts >= 0)?;
        let workspaces = parts
            .next()?
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        Some(Self {
            epoch,
            timestamp_ms,
            workspaces,
        })
    }

    /// Written for `epoch` and not older than `max_age_ms`
    pub fn is_usable(&self, epoch: u64, now_ms: i64, max_age_ms: i64) -> bool {
        self.epoch == epoch && (0..=max_age_ms).contains(&(now_ms - self.timestamp_ms))
    }
}

/// Outcome of [`ScanCoordinator::resolve_role`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleResolution {
    pub role: ScanRole,
    pub epoch: u64,
    /// The owner's snapshot, present only when it is usable
    pub snapshot: Option<ActivitySnapshot>,
    /// Whether a follower should replace its active set with `snapshot`
    pub apply_shared: bool,
}

impl RoleResolution {
    fn owner(epoch: u64) -> Self {
        Self {
            role: ScanRole::Owner,
            epoch,
            snapshot: None,
            apply_shared: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanCoordinator {
    instance_id: String,
    ttl_ms: i64,
    snapshot_max_age_ms: i64,
}

impl ScanCoordinator {
    pub fn new(instance_id: impl Into<String>, config: &LeaseConfig) -> Self {
        Self {
            instance_id: instance_id.into(),
            ttl_ms: config.ttl_ms,
            snapshot_max_age_ms: config.snapshot_max_age_ms,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn resolve_role(&self, query: &dyn TagQuery, now_ms: i64) -> RoleResolution {
        let lease = self.read_lease(query).await;

        if lease.is_alive(now_ms, self.ttl_ms) {
            if lease.owner_id == self.instance_id {
                return RoleResolution::owner(lease.epoch);
            }
            return self.follow(query, lease.epoch, now_ms).await;
        }

        let candidate = lease.epoch.saturating_add(1).max(1);
        let claim = Lease {
            owner_id: self.instance_id.clone(),
            epoch: candidate,
            heartbeat_ms: now_ms,
        };
        if let Err(e) = write_lease(query, &claim).await {
            warn!(error = %e, epoch = candidate, "Failed to claim scan lease; assuming owner");
            return RoleResolution::owner(candidate);
        }

        let confirmed = self.read_lease(query).await;
        if confirmed.owner_id == self.instance_id && confirmed.epoch == candidate {
            info!(
                instance = %self.instance_id,
                epoch = candidate,
                previous_owner = %lease.owner_id,
                "Claimed scan lease"
            );
            return RoleResolution::owner(candidate);
        }

        debug!(
            winner = %confirmed.owner_id,
            epoch = confirmed.epoch,
            "Lost scan lease race"
        );
        self.follow(query, confirmed.epoch, now_ms).await
    }

    /// Write the snapshot, then refresh the heartbeat for the same epoch.
    ///
    /// Returns `false` without writing when another instance has taken the
    /// lease since this scan started.
    pub async fn publish_snapshot(
        &self,
        query: &dyn TagQuery,
        active: &BTreeSet<String>,
        epoch: u64,
        now_ms: i64,
    ) -> Result<bool, TmuxError> {
        let current = self.read_lease(query).await;
        let taken_over = !current.owner_id.is_empty()
            && current.owner_id != self.instance_id
            && current.epoch >= epoch;
        if taken_over {
            debug!(
                owner = %current.owner_id,
                epoch = current.epoch,
                "Lease moved on; discarding snapshot"
            );
            return Ok(false);
        }

        let snapshot = ActivitySnapshot {
            epoch,
            timestamp_ms: now_ms,
            workspaces: active.clone(),
        };
        query
            .set_global_option(options::ACTIVE_SNAPSHOT, &snapshot.encode())
            .await?;

        write_lease(
            query,
            &Lease {
                owner_id: self.instance_id.clone(),
                epoch,
                heartbeat_ms: now_ms,
            },
        )
        .await?;
        Ok(true)
    }

    /// Give the lease up so a follower can take over without waiting for the TTL
    pub async fn release(&self, query: &dyn TagQuery) -> Result<(), TmuxError> {
        let lease = self.read_lease(query).await;
        if lease.owner_id != self.instance_id {
            return Ok(());
        }
        query.unset_global_option(options::SCAN_OWNER).await?;
        query.unset_global_option(options::SCAN_HEARTBEAT_MS).await?;
        info!(instance = %self.instance_id, epoch = lease.epoch, "Released scan lease");
        Ok(())
    }

    async fn follow(&self, query: &dyn TagQuery, epoch: u64, now_ms: i64) -> RoleResolution {
        let raw = match query.get_global_option(options::ACTIVE_SNAPSHOT).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to read activity snapshot");
                None
            }
        };

        let snapshot = raw
            .as_deref()
            .and_then(ActivitySnapshot::decode)
            .filter(|snapshot| snapshot.is_usable(epoch, now_ms, self.snapshot_max_age_ms));

        RoleResolution {
            role: ScanRole::Follower,
            epoch,
            apply_shared: snapshot.is_some(),
            snapshot,
        }
    }

    /// Malformed or unreadable options read as "no lease"
    async fn read_lease(&self, query: &dyn TagQuery) -> Lease {
        let owner = read_option(query, options::SCAN_OWNER).await;
        let epoch = read_option(query, options::SCAN_EPOCH).await;
        let heartbeat = read_option(query, options::SCAN_HEARTBEAT_MS).await;

        Lease {
            owner_id: owner.unwrap_or_default(),
            epoch: epoch.and_then(|v| v.parse().ok()).unwrap_or(0),
            heartbeat_ms: heartbeat.and_then(|v| v.parse().ok()).unwrap_or(0),
        }
    }
}

async fn read_option(query: &dyn TagQuery, key: &str) -> Option<String> {
    match query.get_global_option(key).await {
        Ok(value) => value.map(|v| v.trim().to_string()),
        Err(e) => {
            warn!(option = key, error = %e, "Failed to read scan lease option");
            None
        }
    }
}

async fn write_lease(query: &dyn TagQuery, lease: &Lease) -> Result<(), TmuxError> {
    query
        .set_global_option(options::SCAN_EPOCH, &lease.epoch.to_string())
        .await?;
    query
        .set_global_option(options::SCAN_OWNER, &lease.owner_id)
        .await?;
    query
        .set_global_option(options::SCAN_HEARTBEAT_MS, &lease.heartbeat_ms.to_string())
        .await
}
