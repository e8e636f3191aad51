//! Append-only audit trail for waitlist mutations.
//!
//! Every create, update and deactivation writes exactly one [`AuditRecord`] before the new
//! entry state becomes visible. The record captures the actor, the mandatory reason and the
//! before/after value of each changed field, rendered for display.
//!
//! Records are chained: each one stores the SHA-256 of its predecessor and its own hash over
//! `previous_hash || json(record with empty hash)`. [`AuditTrail::verify_chain`] recomputes the
//! chain so an edited or deleted line in the log is detected.
//!
//! Two implementations are provided:
//! - [`InMemoryAuditTrail`] for tests and ephemeral stores
//! - [`FileAuditTrail`], a JSON-lines file that is synced on each append

use crate::constants::GENESIS_HASH;
use crate::entry::{Actor, EntryId, WaitlistEntry};
use crate::error::{WaitlistError, WaitlistResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Updated,
    Deactivated,
}

/// One changed field, rendered for humans. Empty string means "no value".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: String,
    pub after: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: Uuid,
    pub entry_id: EntryId,
    pub action: AuditAction,
    pub actor: Actor,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
    pub changes: Vec<FieldChange>,
    #[serde(default)]
    pub previous_hash: String,
    #[serde(default)]
    pub hash: String,
}

impl AuditRecord {
    /// Builds an unsealed record describing the transition `before -> after`.
    pub(crate) fn describe(
        action: AuditAction,
        actor: &Actor,
        reason: &str,
        before: Option<&WaitlistEntry>,
        after: &WaitlistEntry,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            entry_id: after.id,
            action,
            actor: actor.clone(),
            reason: reason.to_owned(),
            recorded_at: Utc::now(),
            changes: diff_entries(before, after),
            previous_hash: String::new(),
            hash: String::new(),
        }
    }

    fn compute_hash(&self) -> WaitlistResult<String> {
        let mut unsealed = self.clone();
        unsealed.hash = String::new();
        let body = serde_json::to_vec(&unsealed).map_err(WaitlistError::Serialization)?;

        let mut hasher = Sha256::new();
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(&body);
        Ok(hex::encode(hasher.finalize()))
    }

    fn seal(mut self, previous_hash: &str) -> WaitlistResult<Self> {
        self.previous_hash = previous_hash.to_owned();
        self.hash = self.compute_hash()?;
        Ok(self)
    }
}

/// Storage for audit records. Appends must be durable before they return `Ok`.
pub trait AuditTrail: Send + Sync {
    /// Chains and stores `record`, returning the sealed copy.
    fn append(&self, record: AuditRecord) -> WaitlistResult<AuditRecord>;

    /// Removes `record` again if it is still the newest one in the trail.
    ///
    /// Used by the store when the state change an appended record describes could not be
    /// committed. Fails if anything was appended after `record`.
    fn retract(&self, record: &AuditRecord) -> WaitlistResult<()>;

    /// All records for `entry_id`, newest first.
    fn history(&self, entry_id: EntryId) -> WaitlistResult<Vec<AuditRecord>>;

    /// Recomputes every hash in the trail.
    fn verify_chain(&self) -> WaitlistResult<()>;
}

fn verify_records(records: &[AuditRecord]) -> WaitlistResult<()> {
    let mut previous = GENESIS_HASH.to_owned();
    for record in records {
        if record.previous_hash != previous || record.compute_hash()? != record.hash {
            return Err(WaitlistError::AuditChainBroken {
                record_id: record.record_id,
            });
        }
        previous = record.hash.clone();
    }
    Ok(())
}

fn last_hash(records: &[AuditRecord]) -> &str {
    records.last().map_or(GENESIS_HASH, |r| r.hash.as_str())
}

fn ensure_newest(records: &[AuditRecord], record: &AuditRecord) -> WaitlistResult<()> {
    match records.last() {
        Some(last) if last.record_id == record.record_id => Ok(()),
        _ => Err(WaitlistError::Audit(format!(
            "record {} is not the newest audit record",
            record.record_id
        ))),
    }
}

fn newest_first(records: &[AuditRecord], entry_id: EntryId) -> Vec<AuditRecord> {
    records
        .iter()
        .rev()
        .filter(|r| r.entry_id == entry_id)
        .cloned()
        .collect()
}

#[derive(Debug, Default)]
pub struct InMemoryAuditTrail {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditTrail for InMemoryAuditTrail {
    fn append(&self, record: AuditRecord) -> WaitlistResult<AuditRecord> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| WaitlistError::Audit("audit trail lock poisoned".into()))?;
        let sealed = record.seal(last_hash(&records))?;
        records.push(sealed.clone());
        Ok(sealed)
    }

    fn retract(&self, record: &AuditRecord) -> WaitlistResult<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| WaitlistError::Audit("audit trail lock poisoned".into()))?;
        ensure_newest(&records, record)?;
        records.pop();
        Ok(())
    }

    fn history(&self, entry_id: EntryId) -> WaitlistResult<Vec<AuditRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| WaitlistError::Audit("audit trail lock poisoned".into()))?;
        Ok(newest_first(&records, entry_id))
    }

    fn verify_chain(&self) -> WaitlistResult<()> {
        let records = self
            .records
            .lock()
            .map_err(|_| WaitlistError::Audit("audit trail lock poisoned".into()))?;
        verify_records(&records)
    }
}

/// Audit trail persisted as one JSON object per line.
#[derive(Debug)]
pub struct FileAuditTrail {
    path: PathBuf,
    log: Mutex<FileLog>,
}

/// In-memory mirror of the log file. `offsets[i]` is the byte where `records[i]` starts.
#[derive(Debug, Default)]
struct FileLog {
    records: Vec<AuditRecord>,
    offsets: Vec<u64>,
    len: u64,
}

impl FileAuditTrail {
    /// Opens (or creates) the log at `path` and verifies the existing chain.
    pub fn open(path: impl Into<PathBuf>) -> WaitlistResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(WaitlistError::DataDirCreation)?;
        }

        let log = if path.exists() {
            read_log(&path)?
        } else {
            FileLog::default()
        };
        verify_records(&log.records)?;
        tracing::debug!(path = %path.display(), records = log.records.len(), "opened audit log");

        Ok(Self {
            path,
            log: Mutex::new(log),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> WaitlistResult<MutexGuard<'_, FileLog>> {
        self.log
            .lock()
            .map_err(|_| WaitlistError::Audit("audit trail lock poisoned".into()))
    }

    fn io_error(&self, e: io::Error) -> WaitlistError {
        WaitlistError::Audit(format!("{}: {e}", self.path.display()))
    }
}

fn read_log(path: &Path) -> WaitlistResult<FileLog> {
    let raw = fs::read_to_string(path).map_err(WaitlistError::FileRead)?;
    let mut log = FileLog::default();
    for line in raw.split_inclusive('\n') {
        let start = log.len;
        log.len += line.len() as u64;
        if line.trim().is_empty() {
            continue;
        }
        log.records
            .push(serde_json::from_str(line).map_err(WaitlistError::Deserialization)?);
        log.offsets.push(start);
    }
    Ok(log)
}

/// Writes one line at the end of `file` and makes it durable with `sync`.
///
/// On failure the file is cut back to `len_before`, so a partial line never stays behind.
fn append_line(
    mut file: &File,
    len_before: u64,
    line: &[u8],
    sync: impl FnOnce(&File) -> io::Result<()>,
) -> io::Result<()> {
    let written = file.write_all(line).and_then(|()| sync(file));
    if let Err(e) = written {
        if let Err(truncate) = file.set_len(len_before) {
            tracing::error!(error = %truncate, "could not truncate audit log after failed append");
        }
        return Err(e);
    }
    Ok(())
}

impl AuditTrail for FileAuditTrail {
    fn append(&self, record: AuditRecord) -> WaitlistResult<AuditRecord> {
        let mut log = self.lock()?;
        let sealed = record.seal(last_hash(&log.records))?;

        let mut line = serde_json::to_string(&sealed).map_err(WaitlistError::Serialization)?;
        line.push('\n');

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        append_line(&file, log.len, line.as_bytes(), File::sync_data)
            .map_err(|e| self.io_error(e))?;

        let start = log.len;
        log.offsets.push(start);
        log.len += line.len() as u64;
        log.records.push(sealed.clone());
        Ok(sealed)
    }

    fn retract(&self, record: &AuditRecord) -> WaitlistResult<()> {
        let mut log = self.lock()?;
        ensure_newest(&log.records, record)?;
        let start = log.offsets.last().copied().unwrap_or_default();

        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.set_len(start)
            .and_then(|()| file.sync_data())
            .map_err(|e| self.io_error(e))?;

        log.records.pop();
        log.offsets.pop();
        log.len = start;
        tracing::warn!(record_id = %record.record_id, "retracted uncommitted audit record");
        Ok(())
    }

    fn history(&self, entry_id: EntryId) -> WaitlistResult<Vec<AuditRecord>> {
        Ok(newest_first(&self.lock()?.records, entry_id))
    }

    fn verify_chain(&self) -> WaitlistResult<()> {
        verify_records(&read_log(&self.path)?.records)
    }
}

/// Field-by-field diff of two entry states. `before == None` lists every populated field.
pub(crate) fn diff_entries(before: Option<&WaitlistEntry>, after: &WaitlistEntry) -> Vec<FieldChange> {
    let after_fields = render_fields(after);
    let before_fields = before.map(render_fields);

    after_fields
        .into_iter()
        .enumerate()
        .filter_map(|(i, (field, after_value))| {
            let before_value = before_fields
                .as_ref()
                .map(|fields| fields[i].1.clone())
                .unwrap_or_default();
            (before_value != after_value).then(|| FieldChange {
                field: field.to_owned(),
                before: before_value,
                after: after_value,
            })
        })
        .collect()
}

fn render_fields(entry: &WaitlistEntry) -> Vec<(&'static str, String)> {
    fn opt<T: ToString>(value: Option<&T>) -> String {
        value.map(ToString::to_string).unwrap_or_default()
    }
    fn yes_no(value: bool) -> String {
        let rendered = if value { "yes" } else { "no" };
        rendered.to_owned()
    }

    vec![
        ("patient_ref", entry.patient_ref.to_string()),
        ("procedure_ref", entry.procedure_ref.to_string()),
        ("specialty_ref", entry.specialty_ref.to_string()),
        ("physician_ref", opt(entry.physician_ref.as_ref())),
        ("secondary_procedure_ref", opt(entry.secondary_procedure_ref.as_ref())),
        ("secondary_specialty_ref", opt(entry.secondary_specialty_ref.as_ref())),
        ("entered_at", entry.entered_at.to_rfc3339()),
        ("priority_tier", entry.priority_tier.label().to_owned()),
        ("priority_justification", opt(entry.priority_justification.as_ref())),
        ("has_judicial_order", yes_no(entry.has_judicial_order)),
        ("judicial_case_number", opt(entry.judicial_case_number.as_ref())),
        ("judicial_description", opt(entry.judicial_description.as_ref())),
        ("status", entry.status.label().to_owned()),
        ("notes", opt(entry.notes.as_ref())),
        (
            "next_contact_date",
            entry
                .next_contact_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
        ),
        ("active", yes_no(entry.active)),
        ("exit_reason", entry.exit_reason.map(|r| r.label().to_owned()).unwrap_or_default()),
        ("exit_note", opt(entry.exit_note.as_ref())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{ExitReason, PriorityTier};
    use crate::ordering::tests::{day, entry};
    use tempfile::TempDir;

    fn actor() -> Actor {
        Actor::new("Ana Souza", "Caseworker").unwrap()
    }

    fn created(id: u64) -> AuditRecord {
        let e = entry(id, day(1), PriorityTier::None, false);
        AuditRecord::describe(AuditAction::Created, &actor(), "new referral", None, &e)
    }

    #[test]
    fn test_diff_lists_only_changed_fields() {
        let before = entry(1, day(1), PriorityTier::None, false);
        let mut after = before.clone();
        after.active = false;
        after.exit_reason = Some(ExitReason::Deceased);

        let changes = diff_entries(Some(&before), &after);
        let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["active", "exit_reason"]);
        assert_eq!(changes[0].before, "yes");
        assert_eq!(changes[0].after, "no");
        assert_eq!(changes[1].after, "Patient deceased");
    }

    #[test]
    fn test_diff_on_create_skips_empty_fields() {
        let e = entry(1, day(1), PriorityTier::None, false);
        let changes = diff_entries(None, &e);
        assert!(changes.iter().any(|c| c.field == "patient_ref"));
        assert!(!changes.iter().any(|c| c.field == "notes"));
    }

    #[test]
    fn test_in_memory_chain_links_records() {
        let trail = InMemoryAuditTrail::new();
        let first = trail.append(created(1)).unwrap();
        let second = trail.append(created(2)).unwrap();

        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.previous_hash, first.hash);
        assert_eq!(first.hash.len(), 64);
        trail.verify_chain().unwrap();
        assert_eq!(trail.len(), 2);
    }

    #[test]
    fn test_history_is_newest_first_per_entry() {
        let trail = InMemoryAuditTrail::new();
        trail.append(created(1)).unwrap();
        trail.append(created(2)).unwrap();
        let before = entry(1, day(1), PriorityTier::None, false);
        let mut after = before.clone();
        after.notes = Some("called".into());
        trail
            .append(AuditRecord::describe(
                AuditAction::Updated,
                &actor(),
                "phone call",
                Some(&before),
                &after,
            ))
            .unwrap();

        let history = trail.history(EntryId(1)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, AuditAction::Updated);
        assert_eq!(history[1].action, AuditAction::Created);
    }

    #[test]
    fn test_file_trail_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let trail = FileAuditTrail::open(&path).unwrap();
            trail.append(created(1)).unwrap();
            trail.append(created(2)).unwrap();
        }

        let reopened = FileAuditTrail::open(&path).unwrap();
        assert_eq!(reopened.history(EntryId(2)).unwrap().len(), 1);
        reopened.verify_chain().unwrap();

        let third = reopened.append(created(3)).unwrap();
        assert_ne!(third.previous_hash, GENESIS_HASH);
    }

    #[test]
    fn test_file_trail_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let trail = FileAuditTrail::open(&path).unwrap();
        trail.append(created(1)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("new referral", "edited later")).unwrap();

        assert!(matches!(
            trail.verify_chain(),
            Err(WaitlistError::AuditChainBroken { .. })
        ));
        assert!(FileAuditTrail::open(&path).is_err());
    }

    #[test]
    fn test_failed_sync_leaves_no_partial_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let trail = FileAuditTrail::open(&path).unwrap();
        trail.append(created(1)).unwrap();
        let len_before = fs::metadata(&path).unwrap().len();

        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let result = append_line(&file, len_before, b"{\"half\": \n", |_| {
            Err(io::Error::other("sync failed"))
        });
        assert!(result.is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), len_before);

        trail.append(created(2)).unwrap();
        trail.verify_chain().unwrap();
        assert_eq!(FileAuditTrail::open(&path).unwrap().history(EntryId(2)).unwrap().len(), 1);
    }

    #[test]
    fn test_retract_removes_only_the_newest_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let trail = FileAuditTrail::open(&path).unwrap();
        let first = trail.append(created(1)).unwrap();
        let second = trail.append(created(2)).unwrap();

        assert!(matches!(trail.retract(&first), Err(WaitlistError::Audit(_))));
        trail.retract(&second).unwrap();
        assert!(trail.history(EntryId(2)).unwrap().is_empty());

        let third = trail.append(created(3)).unwrap();
        assert_eq!(third.previous_hash, first.hash);
        let reopened = FileAuditTrail::open(&path).unwrap();
        reopened.verify_chain().unwrap();
        assert!(reopened.history(EntryId(2)).unwrap().is_empty());
        assert_eq!(reopened.history(EntryId(3)).unwrap().len(), 1);
    }

    #[test]
    fn test_in_memory_retract_restores_chain_head() {
        let trail = InMemoryAuditTrail::new();
        let first = trail.append(created(1)).unwrap();
        let second = trail.append(created(2)).unwrap();
        trail.retract(&second).unwrap();

        assert_eq!(trail.len(), 1);
        assert_eq!(trail.append(created(3)).unwrap().previous_hash, first.hash);
        trail.verify_chain().unwrap();
    }
}
