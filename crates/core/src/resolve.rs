//! Identity resolution against the hospital's system of record.
//!
//! Patients, procedures, specialties and physicians live in an external system. The waitlist
//! only stores the internal [`Ref`] returned by a [`RefResolver`]; it never keeps the external
//! payload. A failed lookup is always an error: defaulting to "no reference" would attach an
//! entry to the wrong identity.

use crate::entry::Ref;
use crate::error::{WaitlistError, WaitlistResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Patient,
    Procedure,
    Specialty,
    Physician,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Patient => "patient",
            RefKind::Procedure => "procedure",
            RefKind::Specialty => "specialty",
            RefKind::Physician => "physician",
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait RefResolver: Send + Sync {
    /// Maps an external key to the internal reference, creating the local record if needed.
    fn resolve(&self, kind: RefKind, external_key: &str) -> WaitlistResult<Ref>;

    /// Whether `procedure_key` may be requested under `specialty_key`.
    ///
    /// Resolvers without that knowledge accept every combination.
    fn procedure_in_specialty(&self, _procedure_key: &str, _specialty_key: &str) -> WaitlistResult<bool> {
        Ok(true)
    }
}

/// One record of the external directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub key: String,
    pub name: String,
    /// For procedures: specialty keys allowed to request it. Empty means unrestricted.
    #[serde(default)]
    pub specialties: Vec<String>,
}

/// The external directory as loaded from a YAML file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub patients: Vec<CatalogRecord>,
    pub procedures: Vec<CatalogRecord>,
    pub specialties: Vec<CatalogRecord>,
    pub physicians: Vec<CatalogRecord>,
}

impl Catalog {
    pub fn from_yaml_file(path: &Path) -> WaitlistResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(WaitlistError::FileRead)?;
        serde_yaml::from_str(&raw).map_err(WaitlistError::YamlDeserialization)
    }

    fn records(&self, kind: RefKind) -> &[CatalogRecord] {
        match kind {
            RefKind::Patient => &self.patients,
            RefKind::Procedure => &self.procedures,
            RefKind::Specialty => &self.specialties,
            RefKind::Physician => &self.physicians,
        }
    }

    fn find(&self, kind: RefKind, key: &str) -> Option<&CatalogRecord> {
        self.records(kind).iter().find(|r| r.key == key)
    }
}

/// Resolver backed by an in-process [`Catalog`], with get-or-create semantics.
///
/// The first resolution of `(kind, key)` registers `"{kind}:{key}"` locally along with the
/// record's display name. Later resolutions refresh the name if the directory changed it.
#[derive(Debug, Default)]
pub struct CatalogResolver {
    catalog: Catalog,
    registered: RwLock<HashMap<Ref, String>>,
}

impl CatalogResolver {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            registered: RwLock::new(HashMap::new()),
        }
    }

    /// Display name recorded for a previously resolved reference.
    pub fn display_name(&self, reference: &Ref) -> Option<String> {
        self.registered.read().ok()?.get(reference).cloned()
    }

    fn lookup_error(kind: RefKind, key: &str, reason: &str) -> WaitlistError {
        WaitlistError::Lookup {
            kind,
            key: key.to_owned(),
            reason: reason.to_owned(),
        }
    }
}

impl RefResolver for CatalogResolver {
    fn resolve(&self, kind: RefKind, external_key: &str) -> WaitlistResult<Ref> {
        let key = external_key.trim();
        if key.is_empty() {
            return Err(Self::lookup_error(kind, key, "empty key"));
        }
        let record = self
            .catalog
            .find(kind, key)
            .ok_or_else(|| Self::lookup_error(kind, key, "not found in directory"))?;

        let reference = Ref::new(format!("{kind}:{key}"))?;
        let mut registered = self
            .registered
            .write()
            .map_err(|_| Self::lookup_error(kind, key, "registry lock poisoned"))?;
        match registered.insert(reference.clone(), record.name.clone()) {
            None => tracing::debug!(%reference, "registered reference"),
            Some(previous) if previous != record.name => {
                tracing::debug!(%reference, "refreshed reference name")
            }
            Some(_) => {}
        }
        Ok(reference)
    }

    fn procedure_in_specialty(&self, procedure_key: &str, specialty_key: &str) -> WaitlistResult<bool> {
        let procedure = self
            .catalog
            .find(RefKind::Procedure, procedure_key.trim())
            .ok_or_else(|| Self::lookup_error(RefKind::Procedure, procedure_key, "not found in directory"))?;
        Ok(procedure.specialties.is_empty()
            || procedure.specialties.iter().any(|s| s == specialty_key.trim()))
    }
}

/// Resolver for callers that already hold internal keys.
///
/// Any non-blank key becomes `"{kind}:{key}"`. Used when no directory is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughResolver;

impl RefResolver for PassthroughResolver {
    fn resolve(&self, kind: RefKind, external_key: &str) -> WaitlistResult<Ref> {
        let key = external_key.trim();
        if key.is_empty() {
            return Err(CatalogResolver::lookup_error(kind, key, "empty key"));
        }
        Ref::new(format!("{kind}:{key}"))
    }
}
