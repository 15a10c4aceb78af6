//! Per-codehost concurrency ceilings.
//!
//! Every dispatch must first take a slot from the bucket of the repository's
//! code host. A full bucket makes `try_acquire` return false so the dispatcher
//! can move on to the next eligible entry instead of stalling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::domain::HostId;

/// Configuration for per-host limits.
#[derive(Debug, Clone)]
pub struct FairnessConfig {
    /// Limit for hosts without an explicit entry.
    pub default_limit: usize,
    /// Per-host overrides.
    pub limits: HashMap<HostId, usize>,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            default_limit: 4,
            limits: HashMap::new(),
        }
    }
}

impl FairnessConfig {
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit,
            limits: HashMap::new(),
        }
    }

    /// Set a per-host limit.
    pub fn with_host_limit(mut self, host: impl Into<String>, limit: usize) -> Self {
        self.limits.insert(HostId::new(host), limit);
        self
    }

    /// Effective limit for a host. Never zero.
    pub fn limit_for(&self, host: &HostId) -> usize {
        self.limits.get(host).copied().unwrap_or(self.default_limit).max(1)
    }
}

/// In-flight counter for one code host.
///
/// `0 <= in_flight <= limit` holds at every instant.
#[derive(Debug)]
pub struct CodehostBucket {
    host: HostId,
    limit: usize,
    in_flight: AtomicUsize,
}

impl CodehostBucket {
    pub fn new(host: HostId, limit: usize) -> Self {
        Self {
            host,
            limit: limit.max(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn try_acquire(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.limit).then_some(n + 1))
            .is_ok()
    }

    pub fn release(&self) {
        if self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            tracing::error!(host = %self.host, "Released a codehost slot that was never acquired");
        }
    }
}

/// Slot held for the duration of one attempt. Dropping it releases the slot,
/// so success, failure, timeout and task cancellation all give it back.
#[derive(Debug)]
pub struct FairnessPermit {
    bucket: Arc<CodehostBucket>,
}

impl FairnessPermit {
    pub fn host(&self) -> &HostId {
        self.bucket.host()
    }
}

impl Drop for FairnessPermit {
    fn drop(&mut self) {
        self.bucket.release();
    }
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    pub host: HostId,
    pub limit: usize,
    pub in_flight: usize,
}

/// Owns all codehost buckets. Buckets are created lazily on first use.
#[derive(Debug)]
pub struct FairnessController {
    config: FairnessConfig,
    buckets: RwLock<HashMap<HostId, Arc<CodehostBucket>>>,
}

impl FairnessController {
    pub fn new(config: FairnessConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn bucket(&self, host: &HostId) -> Arc<CodehostBucket> {
        {
            let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(bucket) = buckets.get(host) {
                return Arc::clone(bucket);
            }
        }

        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(host.clone())
            .or_insert_with(|| Arc::new(CodehostBucket::new(host.clone(), self.config.limit_for(host))));
        Arc::clone(bucket)
    }

    /// Take a slot for `host` if one is free.
    pub fn try_acquire(&self, host: &HostId) -> bool {
        self.bucket(host).try_acquire()
    }

    /// Give back a slot taken with [`try_acquire`](Self::try_acquire).
    pub fn release(&self, host: &HostId) {
        self.bucket(host).release();
    }

    /// Take a slot wrapped in a guard that releases on drop.
    pub fn try_acquire_permit(&self, host: &HostId) -> Option<FairnessPermit> {
        let bucket = self.bucket(host);
        bucket.try_acquire().then_some(FairnessPermit { bucket })
    }

    /// Whether `host` has a free slot right now. Advisory only.
    pub fn has_capacity(&self, host: &HostId) -> bool {
        let bucket = self.bucket(host);
        bucket.in_flight() < bucket.limit()
    }

    pub fn in_flight(&self, host: &HostId) -> usize {
        self.bucket(host).in_flight()
    }

    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<BucketSnapshot> = buckets
            .values()
            .map(|b| BucketSnapshot {
                host: b.host().clone(),
                limit: b.limit(),
                in_flight: b.in_flight(),
            })
            .collect();
        out.sort_by(|a, b| a.host.cmp(&b.host));
        out
    }
}
