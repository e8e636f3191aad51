//! Waitlist service facade.
//!
//! [`WaitlistService`] is what the CLI and the REST layer talk to. It adds identity
//! resolution in front of [`WaitlistStore::create`] and answers every position query from a
//! single [`StoreSnapshot`], so one response never mixes two states of the queue.
//!
//! A service opened with [`WaitlistService::from_config`] owns its data directory through a
//! [`DataDirLock`] until the last clone is dropped.

use crate::audit::{AuditRecord, FileAuditTrail};
use crate::config::CoreConfig;
use crate::entry::{
    AuditContext, EntryChanges, EntryDraft, EntryId, ExitReason, PriorityTier, WaitlistEntry,
    WaitlistStatus,
};
use crate::error::{WaitlistError, WaitlistResult};
use crate::filter::{list_queue, EntryFilter, QueueRow};
use crate::indicators::QueueIndicators;
use crate::lock::DataDirLock;
use crate::ordering::{Position, QueueOrderer, RankedQueue};
use crate::resolve::{Catalog, CatalogResolver, PassthroughResolver, RefKind, RefResolver};
use crate::store::{StoreSnapshot, WaitlistStore};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A new waitlist request expressed in the external system's keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExternalEntryRequest {
    pub patient_key: String,
    pub procedure_key: String,
    pub specialty_key: String,
    #[serde(default)]
    pub physician_key: Option<String>,
    #[serde(default)]
    pub secondary_procedure_key: Option<String>,
    #[serde(default)]
    pub secondary_specialty_key: Option<String>,
    #[serde(default)]
    pub priority_tier: PriorityTier,
    #[serde(default)]
    pub priority_justification: Option<String>,
    #[serde(default)]
    pub has_judicial_order: bool,
    #[serde(default)]
    pub judicial_case_number: Option<String>,
    #[serde(default)]
    pub judicial_description: Option<String>,
    #[serde(default)]
    pub status: WaitlistStatus,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub next_contact_date: Option<NaiveDate>,
}

/// Where a patient stands: active entries by position, then past entries newest first.
#[derive(Clone, Debug, Serialize)]
pub struct PatientQueueReport {
    pub patient_ref: String,
    pub active: Vec<QueueRow>,
    pub inactive: Vec<QueueRow>,
}

#[derive(Clone)]
pub struct WaitlistService {
    store: Arc<WaitlistStore>,
    resolver: Arc<dyn RefResolver>,
    dir_lock: Option<Arc<DataDirLock>>,
}

impl std::fmt::Debug for WaitlistService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitlistService")
            .field("store", &self.store)
            .field("dir_lock", &self.dir_lock)
            .finish_non_exhaustive()
    }
}

impl WaitlistService {
    pub fn new(store: Arc<WaitlistStore>, resolver: Arc<dyn RefResolver>) -> Self {
        Self {
            store,
            resolver,
            dir_lock: None,
        }
    }

    /// Opens the on-disk store and audit log under the configured data directory.
    ///
    /// Uses the catalog file for reference resolution when one is configured, otherwise keys
    /// are taken as internal references.
    ///
    /// # Errors
    ///
    /// [`WaitlistError::DataDirLocked`] if another process (or another service in this one)
    /// already has the data directory open.
    pub fn from_config(cfg: &CoreConfig) -> WaitlistResult<Self> {
        cfg.ensure_data_dir()?;
        let dir_lock = DataDirLock::acquire(cfg.lock_path())?;
        let audit = Arc::new(FileAuditTrail::open(cfg.audit_log_path())?);
        let store = WaitlistStore::open(cfg.store_path(), audit)?;
        let resolver: Arc<dyn RefResolver> = match cfg.catalog_file() {
            Some(path) => {
                let catalog = Catalog::from_yaml_file(path)?;
                tracing::info!(path = %path.display(), "loaded reference catalog");
                Arc::new(CatalogResolver::new(catalog))
            }
            None => Arc::new(PassthroughResolver),
        };
        Ok(Self {
            dir_lock: Some(Arc::new(dir_lock)),
            ..Self::new(Arc::new(store), resolver)
        })
    }

    pub fn store(&self) -> &WaitlistStore {
        &self.store
    }

    /// Resolves every external key, then creates the entry.
    ///
    /// Nothing is written if any lookup fails or the procedure does not belong to the
    /// specialty.
    pub fn register(
        &self,
        request: ExternalEntryRequest,
        ctx: &AuditContext,
    ) -> WaitlistResult<WaitlistEntry> {
        let draft = self.resolve_request(request)?;
        self.store.create(draft, ctx)
    }

    /// Like [`register`](Self::register), and also returns the new entry's position as of
    /// the moment it was created.
    pub fn register_with_position(
        &self,
        request: ExternalEntryRequest,
        ctx: &AuditContext,
    ) -> WaitlistResult<(WaitlistEntry, Option<Position>)> {
        let draft = self.resolve_request(request)?;
        self.store.create_with(draft, ctx, with_position)
    }

    fn resolve_request(&self, request: ExternalEntryRequest) -> WaitlistResult<EntryDraft> {
        let resolve = |kind, key: &str| self.resolver.resolve(kind, key).map(|r| r.as_str().to_owned());
        let resolve_optional = |kind, key: Option<&String>| -> WaitlistResult<Option<String>> {
            match key.map(|k| k.trim()).filter(|k| !k.is_empty()) {
                Some(k) => resolve(kind, k).map(Some),
                None => Ok(None),
            }
        };

        if !self
            .resolver
            .procedure_in_specialty(&request.procedure_key, &request.specialty_key)?
        {
            return Err(WaitlistError::Validation(format!(
                "procedure {} is not offered by specialty {}",
                request.procedure_key.trim(),
                request.specialty_key.trim()
            )));
        }
        if let (Some(procedure), Some(specialty)) = (
            request.secondary_procedure_key.as_deref(),
            request.secondary_specialty_key.as_deref(),
        ) {
            if !self.resolver.procedure_in_specialty(procedure, specialty)? {
                return Err(WaitlistError::Validation(format!(
                    "secondary procedure {} is not offered by specialty {}",
                    procedure.trim(),
                    specialty.trim()
                )));
            }
        }

        let draft = EntryDraft {
            patient_ref: resolve(RefKind::Patient, &request.patient_key)?,
            procedure_ref: resolve(RefKind::Procedure, &request.procedure_key)?,
            specialty_ref: resolve(RefKind::Specialty, &request.specialty_key)?,
            physician_ref: resolve_optional(RefKind::Physician, request.physician_key.as_ref())?,
            secondary_procedure_ref: resolve_optional(
                RefKind::Procedure,
                request.secondary_procedure_key.as_ref(),
            )?,
            secondary_specialty_ref: resolve_optional(
                RefKind::Specialty,
                request.secondary_specialty_key.as_ref(),
            )?,
            priority_tier: request.priority_tier,
            priority_justification: request.priority_justification,
            has_judicial_order: request.has_judicial_order,
            judicial_case_number: request.judicial_case_number,
            judicial_description: request.judicial_description,
            status: request.status,
            notes: request.notes,
            next_contact_date: request.next_contact_date,
        };
        Ok(draft)
    }

    pub fn create(&self, draft: EntryDraft, ctx: &AuditContext) -> WaitlistResult<WaitlistEntry> {
        self.store.create(draft, ctx)
    }

    pub fn update(
        &self,
        id: EntryId,
        changes: &EntryChanges,
        ctx: &AuditContext,
    ) -> WaitlistResult<WaitlistEntry> {
        self.store.update(id, changes, ctx)
    }

    /// Applies `changes` and returns the updated entry with its position as of the commit.
    pub fn update_with_position(
        &self,
        id: EntryId,
        changes: &EntryChanges,
        ctx: &AuditContext,
    ) -> WaitlistResult<(WaitlistEntry, Option<Position>)> {
        self.store.update_with(id, changes, ctx, with_position)
    }

    pub fn deactivate(
        &self,
        id: EntryId,
        exit_reason: ExitReason,
        ctx: &AuditContext,
    ) -> WaitlistResult<WaitlistEntry> {
        self.store.deactivate(id, exit_reason, ctx)
    }

    /// Current queue order, best first.
    pub fn rank(&self) -> WaitlistResult<Vec<EntryId>> {
        Ok(QueueOrderer::rank(&self.store.get_active_snapshot()?))
    }

    /// Position of one entry. `Ok(None)` means the entry left the queue.
    pub fn position_of(&self, id: EntryId) -> WaitlistResult<Option<Position>> {
        self.entry_with_position(id).map(|(_, position)| position)
    }

    /// The entry and its position, both read from the same snapshot.
    pub fn entry_with_position(&self, id: EntryId) -> WaitlistResult<(WaitlistEntry, Option<Position>)> {
        let snapshot = self.store.snapshot()?;
        let entry = snapshot.get(id).cloned().ok_or(WaitlistError::NotFound(id))?;
        let position = QueueOrderer::position_of(id, &snapshot.active());
        Ok((entry, position))
    }

    pub fn bulk_positions(&self) -> WaitlistResult<HashMap<EntryId, Position>> {
        Ok(QueueOrderer::bulk_positions(&self.store.get_active_snapshot()?))
    }

    /// Every entry for a patient with its position, from one snapshot.
    pub fn patient_report(&self, patient_ref: &str) -> WaitlistResult<PatientQueueReport> {
        let snapshot = self.store.snapshot()?;
        let entries = snapshot.for_patient(patient_ref);
        if entries.is_empty() {
            return Err(WaitlistError::PatientNotFound(patient_ref.trim().to_owned()));
        }

        let ranked = RankedQueue::from_snapshot(snapshot.entries());
        let (active, inactive): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .map(|entry| QueueRow {
                position: ranked.position_of(entry.id),
                entry,
            })
            .partition(|row| row.entry.active);

        let mut active = active;
        active.sort_by_key(|row| row.position);
        let mut inactive = inactive;
        inactive.sort_by(|a, b| b.entry.entered_at.cmp(&a.entry.entered_at));

        Ok(PatientQueueReport {
            patient_ref: patient_ref.trim().to_owned(),
            active,
            inactive,
        })
    }

    pub fn list(&self, filter: &EntryFilter) -> WaitlistResult<Vec<QueueRow>> {
        let snapshot = self.store.snapshot()?;
        Ok(list_queue(snapshot.entries(), filter))
    }

    pub fn indicators(&self) -> WaitlistResult<QueueIndicators> {
        let snapshot = self.store.snapshot()?;
        Ok(QueueIndicators::compute(snapshot.entries(), snapshot.taken_at()))
    }

    pub fn history(&self, id: EntryId) -> WaitlistResult<Vec<AuditRecord>> {
        self.store.history(id)
    }
}

fn with_position(
    entry: WaitlistEntry,
    snapshot: StoreSnapshot,
) -> WaitlistResult<(WaitlistEntry, Option<Position>)> {
    let position = QueueOrderer::position_of(entry.id, &snapshot.active());
    Ok((entry, position))
}
