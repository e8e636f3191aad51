//! Waitlist entry data model.
//!
//! A [`WaitlistEntry`] is one patient waiting for one procedure in one specialty. Entries are
//! plain values: the [`WaitlistStore`](crate::store::WaitlistStore) owns the canonical copy and
//! is the only place that enforces the lifecycle rules (immutable identity and arrival time,
//! one-way deactivation, audited mutations). Everything handed out by the store is a clone.
//!
//! The ordering logic reads exactly four fields: `id`, `entered_at`, `priority_tier` and
//! `has_judicial_order` (plus `active` to exclude removed entries). Everything else is carried
//! through for the people working the queue.

use crate::constants::{MAX_JUDICIAL_CASE_NUMBER_LEN, MAX_NOTES_LEN};
use crate::error::{WaitlistError, WaitlistResult};
use crate::NonEmptyText;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned identifier of a waitlist entry.
///
/// Allocated sequentially from 1 and never reused, so comparing ids also compares creation
/// order within one store. The ordering uses this as the final tie-break.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = WaitlistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(EntryId)
            .map_err(|_| WaitlistError::Validation(format!("invalid entry id: '{s}'")))
    }
}

/// Opaque internal reference to a patient, procedure, specialty or physician.
///
/// Produced by a [`RefResolver`](crate::resolve::RefResolver) or supplied directly by the
/// caller. Never interpreted by the queue logic.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ref(NonEmptyText);

impl Ref {
    pub fn new(value: impl AsRef<str>) -> WaitlistResult<Self> {
        Ok(Self(NonEmptyText::new(value)?))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caseworker-assigned priority bucket.
///
/// A judicial order is tracked separately and outranks every tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityTier {
    Oncological,
    Flagged,
    #[default]
    None,
}

impl PriorityTier {
    pub fn label(&self) -> &'static str {
        match self {
            PriorityTier::Oncological => "Oncological patient",
            PriorityTier::Flagged => "Flagged priority",
            PriorityTier::None => "No priority",
        }
    }
}

impl FromStr for PriorityTier {
    type Err = WaitlistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ONCOLOGICAL" | "ONC" => Ok(PriorityTier::Oncological),
            "FLAGGED" => Ok(PriorityTier::Flagged),
            "NONE" => Ok(PriorityTier::None),
            other => Err(WaitlistError::Validation(format!(
                "unknown priority tier '{other}'"
            ))),
        }
    }
}

/// Workflow tag for the caseworkers. Informational only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitlistStatus {
    ReturnScheduled,
    ExamsPending,
    #[default]
    DocumentsPending,
    ReadyForSurgery,
    SurgeryScheduled,
    SurgeryCancelled,
    FirstContactFailed,
    SecondContactFailed,
    ThirdContactFailed,
    ContactSuccessful,
}

impl WaitlistStatus {
    pub const ALL: [WaitlistStatus; 10] = [
        WaitlistStatus::ReturnScheduled,
        WaitlistStatus::ExamsPending,
        WaitlistStatus::DocumentsPending,
        WaitlistStatus::ReadyForSurgery,
        WaitlistStatus::SurgeryScheduled,
        WaitlistStatus::SurgeryCancelled,
        WaitlistStatus::FirstContactFailed,
        WaitlistStatus::SecondContactFailed,
        WaitlistStatus::ThirdContactFailed,
        WaitlistStatus::ContactSuccessful,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            WaitlistStatus::ReturnScheduled => "return_scheduled",
            WaitlistStatus::ExamsPending => "exams_pending",
            WaitlistStatus::DocumentsPending => "documents_pending",
            WaitlistStatus::ReadyForSurgery => "ready_for_surgery",
            WaitlistStatus::SurgeryScheduled => "surgery_scheduled",
            WaitlistStatus::SurgeryCancelled => "surgery_cancelled",
            WaitlistStatus::FirstContactFailed => "first_contact_failed",
            WaitlistStatus::SecondContactFailed => "second_contact_failed",
            WaitlistStatus::ThirdContactFailed => "third_contact_failed",
            WaitlistStatus::ContactSuccessful => "contact_successful",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WaitlistStatus::ReturnScheduled => "Return appointment scheduled",
            WaitlistStatus::ExamsPending => "Exams pending",
            WaitlistStatus::DocumentsPending => "Documents pending",
            WaitlistStatus::ReadyForSurgery => "Ready for surgery",
            WaitlistStatus::SurgeryScheduled => "Surgery scheduled",
            WaitlistStatus::SurgeryCancelled => "Surgery cancelled",
            WaitlistStatus::FirstContactFailed => "Contact attempt 1 failed",
            WaitlistStatus::SecondContactFailed => "Contact attempt 2 failed",
            WaitlistStatus::ThirdContactFailed => "Contact attempt 3 failed, no further contact",
            WaitlistStatus::ContactSuccessful => "Contact successful",
        }
    }
}

impl FromStr for WaitlistStatus {
    type Err = WaitlistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        WaitlistStatus::ALL
            .into_iter()
            .find(|status| status.code() == wanted)
            .ok_or_else(|| WaitlistError::Validation(format!("unknown status '{s}'")))
    }
}

/// Why an entry left the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Surgery performed at this hospital.
    SurgeryPerformed,
    Deceased,
    SurgeryElsewhere,
    /// Patient asked to be removed.
    SelfExcluded,
}

impl ExitReason {
    pub fn label(&self) -> &'static str {
        match self {
            ExitReason::SurgeryPerformed => "Surgery performed",
            ExitReason::Deceased => "Patient deceased",
            ExitReason::SurgeryElsewhere => "Surgery performed elsewhere",
            ExitReason::SelfExcluded => "Patient requested removal",
        }
    }
}

impl FromStr for ExitReason {
    type Err = WaitlistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "surgery_performed" => Ok(ExitReason::SurgeryPerformed),
            "deceased" => Ok(ExitReason::Deceased),
            "surgery_elsewhere" => Ok(ExitReason::SurgeryElsewhere),
            "self_excluded" => Ok(ExitReason::SelfExcluded),
            _ => Err(WaitlistError::Validation(format!("unknown exit reason '{s}'"))),
        }
    }
}

/// The person performing a mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: NonEmptyText,
    /// Professional role, e.g. "Caseworker" or "Surgeon".
    pub role: NonEmptyText,
}

impl Actor {
    pub fn new(name: &str, role: &str) -> WaitlistResult<Self> {
        Ok(Self {
            name: NonEmptyText::new(name)
                .map_err(|_| WaitlistError::Validation("actor name cannot be empty".into()))?,
            role: NonEmptyText::new(role)
                .map_err(|_| WaitlistError::Validation("actor role cannot be empty".into()))?,
        })
    }
}

/// Who is changing the queue and why. Required by every mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditContext {
    pub actor: Actor,
    pub reason: NonEmptyText,
}

impl AuditContext {
    pub fn new(actor: Actor, reason: &str) -> WaitlistResult<Self> {
        let reason = NonEmptyText::new(reason)
            .map_err(|_| WaitlistError::Validation("audit reason cannot be empty".into()))?;
        Ok(Self { actor, reason })
    }
}

/// One patient waiting for one procedure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: EntryId,
    pub patient_ref: Ref,
    pub procedure_ref: Ref,
    pub specialty_ref: Ref,
    #[serde(default)]
    pub physician_ref: Option<Ref>,
    #[serde(default)]
    pub secondary_procedure_ref: Option<Ref>,
    #[serde(default)]
    pub secondary_specialty_ref: Option<Ref>,
    pub entered_at: DateTime<Utc>,
    pub priority_tier: PriorityTier,
    #[serde(default)]
    pub priority_justification: Option<String>,
    pub has_judicial_order: bool,
    #[serde(default)]
    pub judicial_case_number: Option<String>,
    #[serde(default)]
    pub judicial_description: Option<String>,
    pub status: WaitlistStatus,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub next_contact_date: Option<NaiveDate>,
    pub active: bool,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub exit_note: Option<String>,
    pub version: u64,
}

impl WaitlistEntry {
    /// Checks the field-level rules that must hold after every mutation.
    pub(crate) fn check_invariants(&self) -> WaitlistResult<()> {
        if self.priority_tier != PriorityTier::None
            && self
                .priority_justification
                .as_deref()
                .is_none_or(|j| j.trim().is_empty())
        {
            return Err(WaitlistError::Validation(format!(
                "priority tier {:?} requires a justification",
                self.priority_tier
            )));
        }
        if self.active != self.exit_reason.is_none() {
            return Err(WaitlistError::Validation(
                "exit reason must be set exactly when the entry is inactive".into(),
            ));
        }
        check_len("notes", self.notes.as_deref(), MAX_NOTES_LEN)?;
        check_len(
            "judicial_case_number",
            self.judicial_case_number.as_deref(),
            MAX_JUDICIAL_CASE_NUMBER_LEN,
        )?;
        Ok(())
    }
}

fn check_len(field: &str, value: Option<&str>, max: usize) -> WaitlistResult<()> {
    match value {
        Some(v) if v.chars().count() > max => Err(WaitlistError::Validation(format!(
            "{field} exceeds {max} characters"
        ))),
        _ => Ok(()),
    }
}

/// Caller input for [`WaitlistStore::create`](crate::store::WaitlistStore::create).
///
/// References arrive as raw strings; blank required references are rejected.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EntryDraft {
    pub patient_ref: String,
    pub procedure_ref: String,
    pub specialty_ref: String,
    #[serde(default)]
    pub physician_ref: Option<String>,
    #[serde(default)]
    pub secondary_procedure_ref: Option<String>,
    #[serde(default)]
    pub secondary_specialty_ref: Option<String>,
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

impl EntryDraft {
    /// Validates the draft and builds the initial entry.
    pub(crate) fn into_entry(self, id: EntryId, entered_at: DateTime<Utc>) -> WaitlistResult<WaitlistEntry> {
        let entry = WaitlistEntry {
            id,
            patient_ref: required_ref("patient_ref", &self.patient_ref)?,
            procedure_ref: required_ref("procedure_ref", &self.procedure_ref)?,
            specialty_ref: required_ref("specialty_ref", &self.specialty_ref)?,
            physician_ref: optional_ref(self.physician_ref.as_deref()),
            secondary_procedure_ref: optional_ref(self.secondary_procedure_ref.as_deref()),
            secondary_specialty_ref: optional_ref(self.secondary_specialty_ref.as_deref()),
            entered_at,
            priority_tier: self.priority_tier,
            priority_justification: clean_text(self.priority_justification),
            has_judicial_order: self.has_judicial_order,
            judicial_case_number: clean_text(self.judicial_case_number),
            judicial_description: clean_text(self.judicial_description),
            status: self.status,
            notes: clean_text(self.notes),
            next_contact_date: self.next_contact_date,
            active: true,
            exit_reason: None,
            exit_note: None,
            version: 1,
        };
        entry.check_invariants()?;
        Ok(entry)
    }
}

fn required_ref(field: &str, value: &str) -> WaitlistResult<Ref> {
    Ref::new(value).map_err(|_| WaitlistError::Validation(format!("{field} is required")))
}

fn optional_ref(value: Option<&str>) -> Option<Ref> {
    value.and_then(|v| Ref::new(v).ok())
}

/// Trims free text; blank becomes `None`.
pub(crate) fn clean_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Requested changes for [`WaitlistStore::update`](crate::store::WaitlistStore::update).
///
/// `None` leaves a field alone. For optional text fields an empty string clears the value.
/// Identity fields may be present only if they repeat the stored value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryChanges {
    pub priority_tier: Option<PriorityTier>,
    pub priority_justification: Option<String>,
    pub has_judicial_order: Option<bool>,
    pub judicial_case_number: Option<String>,
    pub judicial_description: Option<String>,
    pub status: Option<WaitlistStatus>,
    pub notes: Option<String>,
    pub next_contact_date: Option<NaiveDate>,

    pub patient_ref: Option<String>,
    pub procedure_ref: Option<String>,
    pub specialty_ref: Option<String>,
    pub physician_ref: Option<String>,
    pub secondary_procedure_ref: Option<String>,
    pub secondary_specialty_ref: Option<String>,
    pub entered_at: Option<DateTime<Utc>>,

    /// Optimistic-lock precondition: the version the caller last read.
    pub expected_version: Option<u64>,
}

impl EntryChanges {
    /// Applies the changes to a copy of `current` and returns the result.
    ///
    /// Does not bump the version; the store does that once the audit record is written.
    pub(crate) fn apply_to(&self, current: &WaitlistEntry) -> WaitlistResult<WaitlistEntry> {
        self.reject_identity_changes(current)?;

        let changes_tier = self
            .priority_tier
            .is_some_and(|tier| tier != current.priority_tier);
        let changes_judicial = self
            .has_judicial_order
            .is_some_and(|judicial| judicial != current.has_judicial_order);
        if !current.active && (changes_tier || changes_judicial) {
            return Err(WaitlistError::Validation(format!(
                "entry {} is inactive; priority and judicial order can no longer change",
                current.id
            )));
        }

        let mut next = current.clone();
        if let Some(tier) = self.priority_tier {
            next.priority_tier = tier;
        }
        if let Some(justification) = &self.priority_justification {
            next.priority_justification = clean_text(Some(justification.clone()));
        }
        if let Some(judicial) = self.has_judicial_order {
            next.has_judicial_order = judicial;
        }
        if let Some(number) = &self.judicial_case_number {
            next.judicial_case_number = clean_text(Some(number.clone()));
        }
        if let Some(description) = &self.judicial_description {
            next.judicial_description = clean_text(Some(description.clone()));
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(notes) = &self.notes {
            next.notes = clean_text(Some(notes.clone()));
        }
        if let Some(date) = self.next_contact_date {
            next.next_contact_date = Some(date);
        }

        next.check_invariants()?;
        Ok(next)
    }

    fn reject_identity_changes(&self, current: &WaitlistEntry) -> WaitlistResult<()> {
        fn locked(field: &str, requested: Option<&str>, stored: Option<&Ref>) -> WaitlistResult<()> {
            match requested {
                Some(value) if Some(value.trim()) != stored.map(Ref::as_str) => Err(
                    WaitlistError::Validation(format!("{field} cannot be changed after creation")),
                ),
                _ => Ok(()),
            }
        }

        locked("patient_ref", self.patient_ref.as_deref(), Some(&current.patient_ref))?;
        locked("procedure_ref", self.procedure_ref.as_deref(), Some(&current.procedure_ref))?;
        locked("specialty_ref", self.specialty_ref.as_deref(), Some(&current.specialty_ref))?;
        locked("physician_ref", self.physician_ref.as_deref(), current.physician_ref.as_ref())?;
        locked(
            "secondary_procedure_ref",
            self.secondary_procedure_ref.as_deref(),
            current.secondary_procedure_ref.as_ref(),
        )?;
        locked(
            "secondary_specialty_ref",
            self.secondary_specialty_ref.as_deref(),
            current.secondary_specialty_ref.as_ref(),
        )?;
        if self.entered_at.is_some_and(|at| at != current.entered_at) {
            return Err(WaitlistError::Validation(
                "entered_at cannot be changed after creation".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn draft() -> EntryDraft {
        EntryDraft {
            patient_ref: "patient:1001".into(),
            procedure_ref: "procedure:0408".into(),
            specialty_ref: "specialty:ORT".into(),
            ..Default::default()
        }
    }

    fn entered() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_draft_requires_references() {
        let mut missing = draft();
        missing.procedure_ref = "  ".into();
        let err = missing.into_entry(EntryId(1), entered()).unwrap_err();
        assert!(matches!(err, WaitlistError::Validation(msg) if msg.contains("procedure_ref")));
    }

    #[test]
    fn test_draft_builds_active_entry() {
        let entry = draft().into_entry(EntryId(7), entered()).unwrap();
        assert!(entry.active);
        assert_eq!(entry.exit_reason, None);
        assert_eq!(entry.version, 1);
        assert_eq!(entry.priority_tier, PriorityTier::None);
        assert_eq!(entry.physician_ref, None);
    }

    #[test]
    fn test_priority_requires_justification() {
        let mut d = draft();
        d.priority_tier = PriorityTier::Oncological;
        assert!(d.clone().into_entry(EntryId(1), entered()).is_err());

        d.priority_justification = Some("biopsy confirmed".into());
        assert!(d.into_entry(EntryId(1), entered()).is_ok());
    }

    #[test]
    fn test_changes_reject_identity_fields() {
        let entry = draft().into_entry(EntryId(1), entered()).unwrap();
        let changes = EntryChanges {
            specialty_ref: Some("specialty:URO".into()),
            ..Default::default()
        };
        let err = changes.apply_to(&entry).unwrap_err();
        assert!(matches!(err, WaitlistError::Validation(msg) if msg.contains("specialty_ref")));
    }

    #[test]
    fn test_changes_accept_repeated_identity_fields() {
        let entry = draft().into_entry(EntryId(1), entered()).unwrap();
        let changes = EntryChanges {
            patient_ref: Some("patient:1001".into()),
            entered_at: Some(entered()),
            status: Some(WaitlistStatus::ReadyForSurgery),
            ..Default::default()
        };
        let next = changes.apply_to(&entry).unwrap();
        assert_eq!(next.status, WaitlistStatus::ReadyForSurgery);
    }

    #[test]
    fn test_changes_reject_different_entered_at() {
        let entry = draft().into_entry(EntryId(1), entered()).unwrap();
        let changes = EntryChanges {
            entered_at: Some(entered() - chrono::Duration::days(30)),
            ..Default::default()
        };
        let err = changes.apply_to(&entry).unwrap_err();
        assert!(matches!(err, WaitlistError::Validation(msg) if msg.contains("entered_at")));
    }

    #[test]
    fn test_inactive_entry_keeps_priority_and_judicial_order() {
        let mut entry = draft().into_entry(EntryId(1), entered()).unwrap();
        entry.active = false;
        entry.exit_reason = Some(ExitReason::SurgeryPerformed);

        let raise = EntryChanges {
            priority_tier: Some(PriorityTier::Oncological),
            priority_justification: Some("biopsy confirmed".into()),
            ..Default::default()
        };
        assert!(matches!(raise.apply_to(&entry), Err(WaitlistError::Validation(_))));

        let judicial = EntryChanges {
            has_judicial_order: Some(true),
            ..Default::default()
        };
        assert!(matches!(judicial.apply_to(&entry), Err(WaitlistError::Validation(_))));

        let notes = EntryChanges {
            notes: Some("operated at the regional hospital".into()),
            has_judicial_order: Some(false),
            ..Default::default()
        };
        let next = notes.apply_to(&entry).unwrap();
        assert!(!next.active);
        assert_eq!(next.notes.as_deref(), Some("operated at the regional hospital"));
    }

    #[test]
    fn test_changes_reject_setting_physician_later() {
        let entry = draft().into_entry(EntryId(1), entered()).unwrap();
        let changes = EntryChanges {
            physician_ref: Some("physician:55".into()),
            ..Default::default()
        };
        assert!(changes.apply_to(&entry).is_err());
    }

    #[test]
    fn test_empty_string_clears_notes() {
        let mut d = draft();
        d.notes = Some("call after 2pm".into());
        let entry = d.into_entry(EntryId(1), entered()).unwrap();
        let changes = EntryChanges {
            notes: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(changes.apply_to(&entry).unwrap().notes, None);
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("onc".parse::<PriorityTier>().unwrap(), PriorityTier::Oncological);
        assert_eq!(
            "ready-for-surgery".parse::<WaitlistStatus>().unwrap(),
            WaitlistStatus::ReadyForSurgery
        );
        assert_eq!("deceased".parse::<ExitReason>().unwrap(), ExitReason::Deceased);
        assert!("unknown".parse::<ExitReason>().is_err());
    }
}
