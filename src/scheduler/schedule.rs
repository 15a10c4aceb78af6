//! The schedule: one entry per repository, ordered for dispatch.
//!
//! Queued entries are indexed per priority class by `(due_at, repo_id)`, so
//! dispatch order is class descending, then due time ascending, then repo id.
//! Entries waiting for a reclone live in a separate FIFO lane that is served
//! before any class and ignores due times.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{EntryState, HostId, OperationKind, PriorityClass, RepoId};
use crate::error::{Result, UpdaterError};
use crate::scheduler::backoff::BackoffTracker;

/// Evictions remembered for observability.
const EVICTION_LOG_LEN: usize = 64;

/// Request that arrived while the entry was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub priority: PriorityClass,
    pub due_at: Instant,
}

impl PendingRequest {
    fn merge(self, priority: PriorityClass, due_at: Instant) -> Self {
        Self {
            priority: self.priority.max(priority),
            due_at: self.due_at.min(due_at),
        }
    }
}

/// Schedule presence of a single repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub repo_id: RepoId,
    pub host: HostId,
    pub priority: PriorityClass,
    /// Class the entry falls back to after an attempt; manual escalation is one-shot.
    pub routine_class: PriorityClass,
    pub due_at: Instant,
    pub last_attempt_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub state: EntryState,
    pub reclone_pending: bool,
    pub pending: Option<PendingRequest>,
    pub last_error: Option<String>,
    /// Removed while in flight; dropped when the attempt completes.
    pub untracked: bool,
}

impl ScheduleEntry {
    pub fn new(repo_id: RepoId, host: HostId, priority: PriorityClass, due_at: Instant) -> Self {
        Self {
            repo_id,
            host,
            priority,
            routine_class: routine_class_of(priority),
            due_at,
            last_attempt_at: None,
            consecutive_failures: 0,
            state: EntryState::Queued,
            reclone_pending: false,
            pending: None,
            last_error: None,
            untracked: false,
        }
    }

    /// Apply a request using the improve-only rule. Returns true if anything moved.
    fn improve(&mut self, priority: PriorityClass, due_at: Instant) -> bool {
        let mut changed = false;
        if priority > self.priority {
            self.priority = priority;
            changed = true;
        }
        if due_at < self.due_at {
            self.due_at = due_at;
            changed = true;
        }
        if priority != PriorityClass::Manual && priority > self.routine_class {
            self.routine_class = priority;
        }
        changed
    }

    fn index_key(&self) -> (Instant, RepoId) {
        (self.due_at, self.repo_id)
    }

    /// Whether the entry sits in one of the per-class indexes.
    fn is_indexed(&self) -> bool {
        self.state == EntryState::Queued && !self.reclone_pending
    }
}

fn routine_class_of(priority: PriorityClass) -> PriorityClass {
    match priority {
        PriorityClass::Manual => PriorityClass::Normal,
        other => other,
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry created.
    Inserted,
    /// Existing entry moved up (higher class or earlier due time).
    Improved,
    /// Existing entry already ranked at least as well.
    Unchanged,
    /// Entry is in flight; the request was recorded as its successor.
    Deferred,
}

impl UpsertOutcome {
    /// Whether a waiting dispatcher could now find earlier work.
    pub fn needs_wake(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Improved)
    }
}

/// Record of an entry dropped because the schedule was full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eviction {
    pub repo_id: RepoId,
    pub priority: PriorityClass,
    pub evicted_at: DateTime<Utc>,
}

/// An entry handed to a worker.
#[derive(Debug)]
pub struct Claimed<P> {
    pub repo_id: RepoId,
    pub host: HostId,
    pub kind: OperationKind,
    pub permit: P,
}

/// Owns every [`ScheduleEntry`]. Not synchronized; the scheduler wraps it in a lock.
#[derive(Debug)]
pub struct Schedule {
    entries: HashMap<RepoId, ScheduleEntry>,
    queues: [BTreeSet<(Instant, RepoId)>; 3],
    reclones: VecDeque<RepoId>,
    in_flight: usize,
    capacity: usize,
    evictions: VecDeque<Eviction>,
    evicted_total: u64,
    backoff: BackoffTracker,
}

impl Schedule {
    pub fn new(capacity: usize, backoff: BackoffTracker) -> Self {
        Self {
            entries: HashMap::new(),
            queues: Default::default(),
            reclones: VecDeque::new(),
            in_flight: 0,
            capacity: capacity.max(1),
            evictions: VecDeque::new(),
            evicted_total: 0,
            backoff,
        }
    }

    /// Tracked entries. Entries removed while in flight are not counted.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, repo_id: RepoId) -> bool {
        self.get(repo_id).is_some()
    }

    pub fn get(&self, repo_id: RepoId) -> Option<&ScheduleEntry> {
        self.entries.get(&repo_id).filter(|entry| !entry.untracked)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.values().filter(|entry| !entry.untracked)
    }

    pub fn backoff(&self) -> &BackoffTracker {
        &self.backoff
    }

    /// Entries waiting for dispatch, including the reclone lane.
    pub fn queued_len(&self) -> usize {
        self.reclones.len() + self.queues.iter().map(BTreeSet::len).sum::<usize>()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight
    }

    pub fn evictions(&self) -> Vec<Eviction> {
        self.evictions.iter().cloned().collect()
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }

    fn index(&mut self, repo_id: RepoId) {
        if let Some(entry) = self.entries.get(&repo_id)
            && entry.is_indexed()
        {
            self.queues[entry.priority.index()].insert(entry.index_key());
        }
    }

    fn unindex(&mut self, repo_id: RepoId) {
        if let Some(entry) = self.entries.get(&repo_id)
            && entry.is_indexed()
        {
            self.queues[entry.priority.index()].remove(&entry.index_key());
        }
    }

    /// Insert or improve the entry for `repo_id`.
    ///
    /// An existing entry only moves up: the class rises if the requested class is
    /// higher and the due time moves earlier if the requested time precedes it.
    /// In-flight entries are left alone and the request is kept as their successor.
    pub fn upsert(&mut self, repo_id: RepoId, host: HostId, priority: PriorityClass, due_at: Instant) -> UpsertOutcome {
        let Some(state) = self.entries.get(&repo_id).map(|e| e.state) else {
            self.make_room();
            self.entries
                .insert(repo_id, ScheduleEntry::new(repo_id, host, priority, due_at));
            self.index(repo_id);
            return UpsertOutcome::Inserted;
        };

        if state == EntryState::InFlight {
            if let Some(entry) = self.entries.get_mut(&repo_id) {
                if entry.untracked {
                    entry.untracked = false;
                    entry.host = host;
                }
                entry.pending = Some(match entry.pending {
                    Some(pending) => pending.merge(priority, due_at),
                    None => PendingRequest { priority, due_at },
                });
            }
            return UpsertOutcome::Deferred;
        }

        self.unindex(repo_id);
        let changed = match self.entries.get_mut(&repo_id) {
            Some(entry) => {
                entry.host = host;
                entry.improve(priority, due_at)
            }
            None => false,
        };
        self.index(repo_id);

        if changed {
            UpsertOutcome::Improved
        } else {
            UpsertOutcome::Unchanged
        }
    }

    /// Evict the lowest-class, latest-due queued entry if the schedule is full.
    fn make_room(&mut self) {
        if self.entries.len() < self.capacity {
            return;
        }

        let victim = self
            .queues
            .iter()
            .find_map(|queue| queue.last().copied())
            .map(|(_, repo_id)| repo_id);

        let Some(repo_id) = victim else {
            tracing::warn!(
                capacity = self.capacity,
                size = self.entries.len(),
                "Schedule full with nothing evictable, admitting over capacity"
            );
            return;
        };

        if let Some(entry) = self.remove(repo_id) {
            tracing::warn!(
                repo_id = %repo_id,
                priority = %entry.priority,
                capacity = self.capacity,
                "Schedule full, evicted entry"
            );
            if self.evictions.len() == EVICTION_LOG_LEN {
                self.evictions.pop_front();
            }
            self.evictions.push_back(Eviction {
                repo_id,
                priority: entry.priority,
                evicted_at: Utc::now(),
            });
            self.evicted_total += 1;
        }
    }

    /// Queued entries whose due time has passed, in dispatch order.
    pub fn peek_due(&self, now: Instant) -> Vec<RepoId> {
        PriorityClass::DESCENDING
            .iter()
            .flat_map(|class| {
                self.queues[class.index()]
                    .iter()
                    .take_while(move |(due_at, _)| *due_at <= now)
                    .map(|(_, repo_id)| *repo_id)
            })
            .collect()
    }

    /// Earliest instant at which something becomes dispatchable.
    ///
    /// A pending reclone is dispatchable immediately, so it yields `now`.
    pub fn next_due_at(&self, now: Instant) -> Option<Instant> {
        if !self.reclones.is_empty() {
            return Some(now);
        }
        self.queues
            .iter()
            .filter_map(|queue| queue.first().map(|(due_at, _)| *due_at))
            .min()
    }

    /// Pick the next dispatchable entry and mark it in flight.
    ///
    /// The reclone lane is tried first, then due entries in dispatch order,
    /// restricted to classes at or above `floor`. `admit` is asked for each
    /// candidate's host and returns a permit when the host has capacity; a
    /// refusal skips to the next candidate.
    pub fn claim_next<P>(
        &mut self,
        now: Instant,
        floor: Option<PriorityClass>,
        mut admit: impl FnMut(&HostId) -> Option<P>,
    ) -> Option<Claimed<P>> {
        let mut chosen = None;

        for (position, repo_id) in self.reclones.iter().enumerate() {
            if let Some(entry) = self.entries.get(repo_id)
                && let Some(permit) = admit(&entry.host)
            {
                chosen = Some((*repo_id, entry.host.clone(), OperationKind::Reclone, permit, Some(position)));
                break;
            }
        }

        if chosen.is_none() {
            'classes: for class in PriorityClass::DESCENDING {
                if floor.is_some_and(|floor| class < floor) {
                    break;
                }
                for (due_at, repo_id) in &self.queues[class.index()] {
                    if *due_at > now {
                        break;
                    }
                    if let Some(entry) = self.entries.get(repo_id)
                        && let Some(permit) = admit(&entry.host)
                    {
                        chosen = Some((*repo_id, entry.host.clone(), OperationKind::Update, permit, None));
                        break 'classes;
                    }
                }
            }
        }

        let (repo_id, host, kind, permit, lane_position) = chosen?;
        if let Some(position) = lane_position {
            self.reclones.remove(position);
        } else {
            self.unindex(repo_id);
        }
        if let Some(entry) = self.entries.get_mut(&repo_id) {
            entry.state = EntryState::InFlight;
        }
        self.in_flight += 1;

        Some(Claimed {
            repo_id,
            host,
            kind,
            permit,
        })
    }

    /// Move a queued entry to in flight.
    pub fn mark_in_flight(&mut self, repo_id: RepoId) -> Result<()> {
        let entry = self
            .entries
            .get(&repo_id)
            .ok_or_else(|| UpdaterError::NotFound(format!("repo {} is not scheduled", repo_id)))?;
        if entry.state != EntryState::Queued {
            return Err(UpdaterError::Conflict(format!(
                "repo {} is {:?}, not queued",
                repo_id, entry.state
            )));
        }

        if entry.reclone_pending {
            self.reclones.retain(|id| *id != repo_id);
        } else {
            self.unindex(repo_id);
        }
        if let Some(entry) = self.entries.get_mut(&repo_id) {
            entry.state = EntryState::InFlight;
        }
        self.in_flight += 1;
        Ok(())
    }

    /// Record the outcome of a routine update and requeue the entry.
    ///
    /// Returns the entry's new due time, or `None` if the entry is gone or was
    /// not in flight.
    pub fn mark_result(&mut self, repo_id: RepoId, success: bool, now: Instant) -> Option<Instant> {
        self.complete(repo_id, OperationKind::Update, success, None, now)
    }

    /// Record the outcome of an attempt of the given kind and requeue the entry.
    ///
    /// Updates go through the backoff tracker. Reclones bypass it: success clears
    /// the failure count, failure leaves it as it was.
    pub fn complete(
        &mut self,
        repo_id: RepoId,
        kind: OperationKind,
        success: bool,
        error_detail: Option<String>,
        now: Instant,
    ) -> Option<Instant> {
        let backoff = self.backoff.clone();
        let entry = self.entries.get_mut(&repo_id)?;
        if entry.state != EntryState::InFlight {
            tracing::warn!(repo_id = %repo_id, state = ?entry.state, "Attempt result for entry not in flight");
            return None;
        }

        if entry.untracked {
            self.entries.remove(&repo_id);
            self.in_flight = self.in_flight.saturating_sub(1);
            tracing::debug!(repo_id = %repo_id, success, "Dropped entry untracked during its attempt");
            return None;
        }

        let next_due = match (kind, success) {
            (OperationKind::Reclone, true) => {
                entry.consecutive_failures = 0;
                entry.last_attempt_at = Some(now);
                now + backoff.base_interval()
            }
            (OperationKind::Reclone, false) => {
                entry.last_attempt_at = Some(now);
                now + backoff.base_interval()
            }
            (_, true) => backoff.on_success(entry, now),
            (_, false) => backoff.on_failure(entry, now),
        };

        entry.last_error = if success { None } else { error_detail };
        entry.reclone_pending = false;
        entry.state = EntryState::Queued;
        entry.priority = entry.routine_class;
        entry.due_at = next_due;
        if let Some(pending) = entry.pending.take() {
            entry.improve(pending.priority, pending.due_at);
        }
        let due_at = entry.due_at;

        self.in_flight = self.in_flight.saturating_sub(1);
        self.index(repo_id);
        Some(due_at)
    }

    /// Put a queued entry into the reclone lane.
    pub fn request_reclone(&mut self, repo_id: RepoId) -> Result<()> {
        let entry = self
            .entries
            .get(&repo_id)
            .ok_or_else(|| UpdaterError::NotFound(format!("repo {} is not scheduled", repo_id)))?;
        match entry.state {
            EntryState::InFlight => {
                return Err(UpdaterError::Conflict(format!("repo {} is currently being fetched", repo_id)));
            }
            EntryState::Disabled => {
                return Err(UpdaterError::Conflict(format!("repo {} is disabled", repo_id)));
            }
            EntryState::Queued if entry.reclone_pending => {
                return Err(UpdaterError::Conflict(format!("repo {} already has a reclone pending", repo_id)));
            }
            EntryState::Queued => {}
        }

        self.unindex(repo_id);
        if let Some(entry) = self.entries.get_mut(&repo_id) {
            entry.reclone_pending = true;
        }
        self.reclones.push_back(repo_id);
        Ok(())
    }

    /// Take an entry out of rotation, or put it back.
    pub fn set_disabled(&mut self, repo_id: RepoId, disabled: bool, now: Instant) -> Result<()> {
        let state = self
            .entries
            .get(&repo_id)
            .map(|e| e.state)
            .ok_or_else(|| UpdaterError::NotFound(format!("repo {} is not scheduled", repo_id)))?;

        match (state, disabled) {
            (EntryState::InFlight, _) => Err(UpdaterError::Conflict(format!(
                "repo {} is currently being fetched",
                repo_id
            ))),
            (EntryState::Queued, true) => {
                self.unindex(repo_id);
                self.reclones.retain(|id| *id != repo_id);
                if let Some(entry) = self.entries.get_mut(&repo_id) {
                    entry.reclone_pending = false;
                    entry.state = EntryState::Disabled;
                }
                Ok(())
            }
            (EntryState::Disabled, false) => {
                if let Some(entry) = self.entries.get_mut(&repo_id) {
                    entry.state = EntryState::Queued;
                    entry.due_at = entry.due_at.min(now);
                }
                self.index(repo_id);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Drop the entry for a repository that is no longer tracked.
    ///
    /// An entry in flight stays held by its worker until the attempt completes;
    /// until then it is invisible, and a new request for the repository becomes
    /// its pending successor rather than a second entry.
    pub fn remove(&mut self, repo_id: RepoId) -> Option<ScheduleEntry> {
        let entry = self.entries.get_mut(&repo_id).filter(|entry| !entry.untracked)?;
        if entry.state == EntryState::InFlight {
            entry.untracked = true;
            entry.pending = None;
            return Some(entry.clone());
        }

        self.unindex(repo_id);
        let entry = self.entries.remove(&repo_id)?;
        if entry.reclone_pending {
            self.reclones.retain(|id| *id != repo_id);
        }
        Some(entry)
    }

    /// Zero-based dispatch position of a waiting entry, and the number of waiting entries.
    pub fn position(&self, repo_id: RepoId) -> Option<(usize, usize)> {
        let total = self.queued_len();
        let entry = self.entries.get(&repo_id)?;

        if entry.reclone_pending {
            let index = self.reclones.iter().position(|id| *id == repo_id)?;
            return Some((index, total));
        }
        if !entry.is_indexed() {
            return None;
        }

        let ahead_in_higher: usize = PriorityClass::DESCENDING
            .iter()
            .take_while(|class| **class > entry.priority)
            .map(|class| self.queues[class.index()].len())
            .sum();
        let ahead_in_class = self.queues[entry.priority.index()].range(..entry.index_key()).count();

        Some((self.reclones.len() + ahead_in_higher + ahead_in_class, total))
    }
}
