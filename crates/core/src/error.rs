use crate::entry::EntryId;
use crate::resolve::RefKind;

#[derive(Debug, thiserror::Error)]
pub enum WaitlistError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("waitlist entry {0} not found")]
    NotFound(EntryId),
    #[error("no waitlist entries for patient {0}")]
    PatientNotFound(String),
    #[error("waitlist entry {0} is already inactive")]
    AlreadyInactive(EntryId),
    #[error("failed to resolve {kind} '{key}': {reason}")]
    Lookup {
        kind: RefKind,
        key: String,
        reason: String,
    },
    #[error("waitlist entry {id} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrencyConflict {
        id: EntryId,
        expected: u64,
        actual: u64,
    },
    #[error("failed to write audit record: {0}")]
    Audit(String),
    #[error("audit chain broken at record {record_id}")]
    AuditChainBroken { record_id: uuid::Uuid },
    #[error("waitlist store lock poisoned")]
    LockPoisoned,
    #[error("corrupt store file: {0}")]
    CorruptStore(String),
    #[error("data directory {} is in use by another process", .0.display())]
    DataDirLocked(std::path::PathBuf),

    #[error("failed to create data directory: {0}")]
    DataDirCreation(std::io::Error),
    #[error("failed to write file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to read file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to serialize JSON: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize JSON: {0}")]
    Deserialization(serde_json::Error),
    #[error("failed to serialize YAML: {0}")]
    YamlSerialization(serde_yaml::Error),
    #[error("failed to deserialize YAML: {0}")]
    YamlDeserialization(serde_yaml::Error),
}

impl WaitlistError {
    /// True for errors the caller caused and can fix by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WaitlistError::Validation(_)
                | WaitlistError::NotFound(_)
                | WaitlistError::PatientNotFound(_)
                | WaitlistError::AlreadyInactive(_)
                | WaitlistError::ConcurrencyConflict { .. }
        )
    }
}

impl From<waitlist_types::TextError> for WaitlistError {
    fn from(err: waitlist_types::TextError) -> Self {
        WaitlistError::Validation(err.to_string())
    }
}

pub type WaitlistResult<T> = std::result::Result<T, WaitlistError>;
