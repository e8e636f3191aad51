//! # Waitlist Core
//!
//! Core business logic for the surgical waitlist.
//!
//! This crate holds the entry model and everything that touches it:
//! - [`WaitlistStore`]: the authoritative set of entries, persisted as YAML
//! - [`QueueOrderer`]: derives queue positions from a snapshot; positions are never stored
//! - [`AuditTrail`]: hash-chained record of every accepted mutation
//! - [`WaitlistService`]: identity resolution, patient reports and indicators on top
//!
//! **No API concerns**: HTTP servers and command-line parsing belong in `api-rest` and
//! `waitlist-cli`.
//!
//! ## Architecture
//!
//! Every mutation runs under the store's write lock: validate, compute the next entry, stage
//! the new store file, append the audit record, then rename the staged file into place. A
//! failed step undoes the earlier ones. Readers take a [`StoreSnapshot`] and rank it, so every
//! position in one response comes from the same state.
//!
//! One process owns a data directory at a time: [`WaitlistService::from_config`] holds a
//! [`DataDirLock`] for as long as the service lives.

pub mod audit;
pub mod config;
pub mod constants;
pub mod entry;
pub mod error;
pub mod filter;
pub mod indicators;
pub mod lock;
pub mod ordering;
pub mod resolve;
pub mod service;
pub mod store;

pub use audit::{AuditAction, AuditRecord, AuditTrail, FieldChange, FileAuditTrail, InMemoryAuditTrail};
pub use config::CoreConfig;
pub use entry::{
    Actor, AuditContext, EntryChanges, EntryDraft, EntryId, ExitReason, PriorityTier, Ref,
    WaitlistEntry, WaitlistStatus,
};
pub use error::{WaitlistError, WaitlistResult};
pub use filter::{list_queue, EntryFilter, QueueRow};
pub use indicators::QueueIndicators;
pub use lock::DataDirLock;
pub use ordering::{Position, QueueOrderer, QueueTier, RankedQueue};
pub use resolve::{Catalog, CatalogRecord, CatalogResolver, PassthroughResolver, RefKind, RefResolver};
pub use service::{ExternalEntryRequest, PatientQueueReport, WaitlistService};
pub use store::{Clock, StoreSnapshot, WaitlistStore};
pub use waitlist_types::NonEmptyText;
