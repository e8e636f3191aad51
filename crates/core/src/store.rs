//! Waitlist entry storage.
//!
//! [`WaitlistStore`] is the single owner of entry state. It hands out clones and snapshots,
//! never references, so ranking always runs over a consistent point-in-time copy.
//!
//! ## Mutations
//!
//! `create`, `update` and `deactivate` all follow the same sequence under the write lock:
//!
//! 1. compute the next entry state from the current one (validation happens here)
//! 2. stage the new state file next to the real one, if the store is file-backed
//! 3. append the audit record
//! 4. rename the staged file into place
//!
//! A failure at any step restores the previous in-memory state. If the rename fails after the
//! audit record was written, the record is retracted again, so the trail never describes a
//! change the store does not hold. Ids are never handed out twice: a create that fails after
//! validation still consumes its id.
//!
//! Holding the write lock for the whole sequence serialises mutations, so two concurrent
//! deactivations of one entry cannot both succeed: the second sees `active == false`.
//!
//! ## Persistence
//!
//! A file-backed store keeps its state in one YAML file, rewritten through a temporary file
//! and a rename on every mutation.

use crate::audit::{AuditAction, AuditRecord, AuditTrail};
use crate::entry::{
    AuditContext, EntryChanges, EntryDraft, EntryId, ExitReason, WaitlistEntry,
};
use crate::error::{WaitlistError, WaitlistResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Source of creation timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Default)]
struct StoreState {
    next_id: u64,
    entries: BTreeMap<EntryId, WaitlistEntry>,
}

/// On-disk layout of the store file.
#[derive(Serialize, Deserialize)]
struct PersistedStore {
    next_id: u64,
    entries: Vec<WaitlistEntry>,
}

/// A point-in-time copy of every entry, taken under one read lock.
#[derive(Clone, Debug)]
pub struct StoreSnapshot {
    entries: Vec<WaitlistEntry>,
    taken_at: DateTime<Utc>,
}

impl StoreSnapshot {
    /// Every entry, active or not, in id order.
    pub fn entries(&self) -> &[WaitlistEntry] {
        &self.entries
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn active(&self) -> Vec<WaitlistEntry> {
        self.entries.iter().filter(|e| e.active).cloned().collect()
    }

    pub fn get(&self, id: EntryId) -> Option<&WaitlistEntry> {
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|index| &self.entries[index])
    }

    pub fn for_patient(&self, patient_ref: &str) -> Vec<WaitlistEntry> {
        self.entries
            .iter()
            .filter(|e| e.patient_ref.as_str() == patient_ref.trim())
            .cloned()
            .collect()
    }
}

pub struct WaitlistStore {
    state: RwLock<StoreState>,
    audit: Arc<dyn AuditTrail>,
    persist_path: Option<PathBuf>,
    clock: Clock,
}

impl std::fmt::Debug for WaitlistStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitlistStore")
            .field("persist_path", &self.persist_path)
            .finish_non_exhaustive()
    }
}

impl WaitlistStore {
    /// Creates an empty store that lives only in memory.
    pub fn in_memory(audit: Arc<dyn AuditTrail>) -> Self {
        Self {
            state: RwLock::new(StoreState {
                next_id: 1,
                entries: BTreeMap::new(),
            }),
            audit,
            persist_path: None,
            clock: Arc::new(Utc::now),
        }
    }

    /// Opens the store file at `path`, creating an empty store if it does not exist yet.
    ///
    /// Every later mutation rewrites the file before it becomes visible.
    pub fn open(path: impl Into<PathBuf>, audit: Arc<dyn AuditTrail>) -> WaitlistResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            load_state(&path)?
        } else {
            StoreState {
                next_id: 1,
                entries: BTreeMap::new(),
            }
        };
        tracing::info!(
            path = %path.display(),
            entries = state.entries.len(),
            "opened waitlist store"
        );

        Ok(Self {
            state: RwLock::new(state),
            audit,
            persist_path: Some(path),
            clock: Arc::new(Utc::now),
        })
    }

    /// Replaces the timestamp source used by `create`.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn audit_trail(&self) -> &Arc<dyn AuditTrail> {
        &self.audit
    }

    fn read(&self) -> WaitlistResult<RwLockReadGuard<'_, StoreState>> {
        self.state.read().map_err(|_| WaitlistError::LockPoisoned)
    }

    fn write(&self) -> WaitlistResult<RwLockWriteGuard<'_, StoreState>> {
        self.state.write().map_err(|_| WaitlistError::LockPoisoned)
    }

    /// Registers a new entry: assigns the id, stamps `entered_at` and marks it active.
    ///
    /// # Errors
    ///
    /// - [`WaitlistError::Validation`] if a required reference is blank or a field rule fails
    /// - [`WaitlistError::Audit`] if the audit record cannot be written
    /// - [`WaitlistError::FileWrite`] if the store file cannot be rewritten
    pub fn create(&self, draft: EntryDraft, ctx: &AuditContext) -> WaitlistResult<WaitlistEntry> {
        self.create_with(draft, ctx, |entry, _| Ok(entry))
    }

    /// Like [`create`](Self::create), but also hands `finish` the store contents as of the
    /// commit, before any other mutation can run.
    pub fn create_with<T>(
        &self,
        draft: EntryDraft,
        ctx: &AuditContext,
        finish: impl FnOnce(WaitlistEntry, StoreSnapshot) -> WaitlistResult<T>,
    ) -> WaitlistResult<T> {
        let mut state = self.write()?;
        let id = EntryId(state.next_id);
        let entry = draft.into_entry(id, (self.clock)()).inspect_err(|e| {
            tracing::warn!(error = %e, "rejected waitlist entry");
        })?;
        state.next_id += 1;

        let record = AuditRecord::describe(
            AuditAction::Created,
            &ctx.actor,
            ctx.reason.as_str(),
            None,
            &entry,
        );
        self.commit(&mut state, entry.clone(), record)?;
        tracing::info!(entry_id = %id, actor = %ctx.actor.name, "waitlist entry created");
        let snapshot = snapshot_of(&state, entry.entered_at);
        finish(entry, snapshot)
    }

    pub fn get(&self, id: EntryId) -> WaitlistResult<WaitlistEntry> {
        self.read()?
            .entries
            .get(&id)
            .cloned()
            .ok_or(WaitlistError::NotFound(id))
    }

    /// Applies whitelisted field changes.
    ///
    /// # Errors
    ///
    /// - [`WaitlistError::NotFound`] for an unknown id
    /// - [`WaitlistError::ConcurrencyConflict`] if `expected_version` is stale
    /// - [`WaitlistError::Validation`] for identity-field changes, rule violations or a no-op
    /// - [`WaitlistError::Audit`] if the audit record cannot be written
    /// - [`WaitlistError::FileWrite`] if the store file cannot be rewritten
    pub fn update(
        &self,
        id: EntryId,
        changes: &EntryChanges,
        ctx: &AuditContext,
    ) -> WaitlistResult<WaitlistEntry> {
        self.update_with(id, changes, ctx, |entry, _| Ok(entry))
    }

    /// Like [`update`](Self::update), but also hands `finish` the store contents as of the
    /// commit.
    pub fn update_with<T>(
        &self,
        id: EntryId,
        changes: &EntryChanges,
        ctx: &AuditContext,
        finish: impl FnOnce(WaitlistEntry, StoreSnapshot) -> WaitlistResult<T>,
    ) -> WaitlistResult<T> {
        self.mutate(
            id,
            AuditAction::Updated,
            ctx,
            |current| {
                if let Some(expected) = changes.expected_version {
                    if expected != current.version {
                        return Err(WaitlistError::ConcurrencyConflict {
                            id,
                            expected,
                            actual: current.version,
                        });
                    }
                }
                changes.apply_to(current)
            },
            finish,
        )
    }

    /// Removes an entry from the queue. Terminal: there is no reactivation.
    ///
    /// The audit reason doubles as the entry's exit note.
    ///
    /// # Errors
    ///
    /// - [`WaitlistError::NotFound`] for an unknown id
    /// - [`WaitlistError::AlreadyInactive`] if the entry already left the queue; the stored
    ///   exit reason is left untouched
    /// - [`WaitlistError::Audit`] if the audit record cannot be written
    pub fn deactivate(
        &self,
        id: EntryId,
        exit_reason: ExitReason,
        ctx: &AuditContext,
    ) -> WaitlistResult<WaitlistEntry> {
        self.mutate(
            id,
            AuditAction::Deactivated,
            ctx,
            |current| {
                if !current.active {
                    return Err(WaitlistError::AlreadyInactive(id));
                }
                let mut next = current.clone();
                next.active = false;
                next.exit_reason = Some(exit_reason);
                next.exit_note = Some(ctx.reason.as_str().to_owned());
                Ok(next)
            },
            |entry, _| Ok(entry),
        )
    }

    fn mutate<T>(
        &self,
        id: EntryId,
        action: AuditAction,
        ctx: &AuditContext,
        next_state: impl FnOnce(&WaitlistEntry) -> WaitlistResult<WaitlistEntry>,
        finish: impl FnOnce(WaitlistEntry, StoreSnapshot) -> WaitlistResult<T>,
    ) -> WaitlistResult<T> {
        let mut state = self.write()?;
        let current = state.entries.get(&id).ok_or(WaitlistError::NotFound(id))?;

        let mut next = next_state(current).inspect_err(|e| {
            tracing::warn!(entry_id = %id, ?action, error = %e, "rejected waitlist mutation");
        })?;
        if next == *current {
            return Err(WaitlistError::Validation(format!(
                "no changes to apply to entry {id}"
            )));
        }
        next.version = current.version + 1;

        let record =
            AuditRecord::describe(action, &ctx.actor, ctx.reason.as_str(), Some(current), &next);
        self.commit(&mut state, next.clone(), record)?;
        tracing::info!(
            entry_id = %id,
            ?action,
            version = next.version,
            actor = %ctx.actor.name,
            "waitlist entry changed"
        );
        finish(next, snapshot_of(&state, (self.clock)()))
    }

    /// Makes `entry` and its audit record durable together, or neither of them.
    fn commit(
        &self,
        state: &mut StoreState,
        entry: WaitlistEntry,
        record: AuditRecord,
    ) -> WaitlistResult<()> {
        let id = entry.id;
        let previous = state.entries.insert(id, entry);

        let staged = match self.stage(state) {
            Ok(staged) => staged,
            Err(e) => {
                restore(state, id, previous);
                return Err(e);
            }
        };
        let sealed = match self.audit.append(record) {
            Ok(sealed) => sealed,
            Err(e) => {
                if let Some(staged) = staged {
                    staged.discard();
                }
                restore(state, id, previous);
                return Err(e);
            }
        };
        if let Some(staged) = staged {
            if let Err(e) = staged.publish() {
                tracing::error!(entry_id = %id, error = %e, "could not replace store file");
                if let Err(retract) = self.audit.retract(&sealed) {
                    tracing::error!(
                        entry_id = %id,
                        record_id = %sealed.record_id,
                        error = %retract,
                        "audit record left behind for an uncommitted change"
                    );
                }
                restore(state, id, previous);
                return Err(e);
            }
        }
        Ok(())
    }

    /// All active entries, in no particular order.
    pub fn get_active_snapshot(&self) -> WaitlistResult<Vec<WaitlistEntry>> {
        Ok(self
            .read()?
            .entries
            .values()
            .filter(|e| e.active)
            .cloned()
            .collect())
    }

    /// Every entry for `patient_ref`, active and inactive.
    pub fn get_all_for_patient(&self, patient_ref: &str) -> WaitlistResult<Vec<WaitlistEntry>> {
        Ok(self
            .read()?
            .entries
            .values()
            .filter(|e| e.patient_ref.as_str() == patient_ref.trim())
            .cloned()
            .collect())
    }

    /// Copies every entry under a single read lock.
    pub fn snapshot(&self) -> WaitlistResult<StoreSnapshot> {
        let state = self.read()?;
        Ok(snapshot_of(&state, (self.clock)()))
    }

    /// Audit history of one entry, newest first.
    pub fn history(&self, id: EntryId) -> WaitlistResult<Vec<AuditRecord>> {
        if !self.read()?.entries.contains_key(&id) {
            return Err(WaitlistError::NotFound(id));
        }
        self.audit.history(id)
    }

    /// Writes the whole state to a temporary file. `None` for an in-memory store.
    fn stage(&self, state: &StoreState) -> WaitlistResult<Option<StagedWrite>> {
        let Some(path) = &self.persist_path else {
            return Ok(None);
        };
        let persisted = PersistedStore {
            next_id: state.next_id,
            entries: state.entries.values().cloned().collect(),
        };
        let yaml = serde_yaml::to_string(&persisted).map_err(WaitlistError::YamlSerialization)?;
        StagedWrite::write(path, &yaml).map(Some)
    }
}

fn snapshot_of(state: &StoreState, taken_at: DateTime<Utc>) -> StoreSnapshot {
    StoreSnapshot {
        entries: state.entries.values().cloned().collect(),
        taken_at,
    }
}

fn restore(state: &mut StoreState, id: EntryId, previous: Option<WaitlistEntry>) {
    match previous {
        Some(previous) => {
            state.entries.insert(id, previous);
        }
        None => {
            state.entries.remove(&id);
        }
    }
}

/// A complete copy of the store file, written but not yet renamed into place.
struct StagedWrite {
    tmp: PathBuf,
    target: PathBuf,
}

impl StagedWrite {
    fn write(target: &Path, contents: &str) -> WaitlistResult<Self> {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(WaitlistError::DataDirCreation)?;
        }
        let tmp = target.with_extension("yaml.tmp");
        fs::write(&tmp, contents).map_err(WaitlistError::FileWrite)?;
        Ok(Self {
            tmp,
            target: target.to_path_buf(),
        })
    }

    fn publish(self) -> WaitlistResult<()> {
        if let Err(e) = fs::rename(&self.tmp, &self.target) {
            self.discard();
            return Err(WaitlistError::FileWrite(e));
        }
        Ok(())
    }

    fn discard(self) {
        if let Err(e) = fs::remove_file(&self.tmp) {
            tracing::warn!(path = %self.tmp.display(), error = %e, "could not remove staged store file");
        }
    }
}

fn load_state(path: &Path) -> WaitlistResult<StoreState> {
    let raw = fs::read_to_string(path).map_err(WaitlistError::FileRead)?;
    let persisted: PersistedStore =
        serde_yaml::from_str(&raw).map_err(WaitlistError::YamlDeserialization)?;

    let mut seen = HashSet::new();
    let mut entries = BTreeMap::new();
    for entry in persisted.entries {
        if !seen.insert(entry.id) {
            return Err(WaitlistError::CorruptStore(format!("duplicate entry id {}", entry.id)));
        }
        if entry.id.0 >= persisted.next_id {
            return Err(WaitlistError::CorruptStore(format!(
                "entry id {} is not below next_id {}",
                entry.id, persisted.next_id
            )));
        }
        entry
            .check_invariants()
            .map_err(|e| WaitlistError::CorruptStore(format!("entry {}: {e}", entry.id)))?;
        entries.insert(entry.id, entry);
    }

    Ok(StoreState {
        next_id: persisted.next_id.max(1),
        entries,
    })
}
