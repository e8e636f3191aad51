//! Aggregate queue indicators for dashboards.
//!
//! Indicators contain counts and references only, never patient-level rows, so they can be
//! published on public screens.
//!
//! The headline counts describe the current queue and read active entries only. The
//! specialty distribution, monthly intake and procedure rankings describe referral history
//! and read every entry, including those that already left the queue.

use crate::constants::{INDICATOR_INTAKE_LOOKBACK_DAYS, INDICATOR_TOP_N};
use crate::entry::{PriorityTier, WaitlistEntry};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpecialtyShare {
    pub specialty_ref: String,
    pub total: usize,
    /// Share of all entries, rounded to two decimals.
    pub percentage: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyIntake {
    /// `YYYY-MM`
    pub month: String,
    pub total: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureCount {
    pub procedure_ref: String,
    pub total: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureWait {
    pub procedure_ref: String,
    /// Days since the oldest entry for this procedure joined the queue.
    pub longest_wait_days: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueIndicators {
    pub computed_at: DateTime<Utc>,
    pub patients_in_queue: usize,
    pub specialties_in_queue: usize,
    pub procedures_in_queue: usize,
    /// Active, no priority tier and no judicial order.
    pub elective_count: usize,
    pub oncological_count: usize,
    pub judicial_count: usize,
    pub by_specialty: Vec<SpecialtyShare>,
    pub monthly_intake: Vec<MonthlyIntake>,
    pub top_procedures_by_count: Vec<ProcedureCount>,
    pub top_procedures_by_wait: Vec<ProcedureWait>,
}

impl QueueIndicators {
    /// Computes every indicator from one snapshot of all entries, active and inactive.
    pub fn compute(entries: &[WaitlistEntry], now: DateTime<Utc>) -> Self {
        let active: Vec<&WaitlistEntry> = entries.iter().filter(|e| e.active).collect();

        let distinct = |key: fn(&WaitlistEntry) -> &str| {
            active.iter().map(|e| key(e)).collect::<HashSet<_>>().len()
        };

        let mut specialty_totals: BTreeMap<&str, usize> = BTreeMap::new();
        let mut procedure_totals: BTreeMap<&str, usize> = BTreeMap::new();
        let mut procedure_oldest: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for entry in entries {
            *specialty_totals.entry(entry.specialty_ref.as_str()).or_default() += 1;
            *procedure_totals.entry(entry.procedure_ref.as_str()).or_default() += 1;
            procedure_oldest
                .entry(entry.procedure_ref.as_str())
                .and_modify(|oldest| *oldest = (*oldest).min(entry.entered_at))
                .or_insert(entry.entered_at);
        }

        let grand_total = entries.len().max(1) as f64;
        let by_specialty = specialty_totals
            .iter()
            .map(|(specialty, total)| SpecialtyShare {
                specialty_ref: (*specialty).to_owned(),
                total: *total,
                percentage: (*total as f64 / grand_total * 10_000.0).round() / 100.0,
            })
            .collect();

        let mut top_procedures_by_count: Vec<ProcedureCount> = procedure_totals
            .iter()
            .map(|(procedure, total)| ProcedureCount {
                procedure_ref: (*procedure).to_owned(),
                total: *total,
            })
            .collect();
        // Stable sort keeps the BTreeMap's ref order among equal totals.
        top_procedures_by_count.sort_by(|a, b| b.total.cmp(&a.total));
        top_procedures_by_count.truncate(INDICATOR_TOP_N);

        let mut top_procedures_by_wait: Vec<ProcedureWait> = procedure_oldest
            .iter()
            .map(|(procedure, oldest)| ProcedureWait {
                procedure_ref: (*procedure).to_owned(),
                longest_wait_days: (now - *oldest).num_days(),
            })
            .collect();
        top_procedures_by_wait.sort_by(|a, b| b.longest_wait_days.cmp(&a.longest_wait_days));
        top_procedures_by_wait.truncate(INDICATOR_TOP_N);

        Self {
            computed_at: now,
            patients_in_queue: distinct(|e| e.patient_ref.as_str()),
            specialties_in_queue: distinct(|e| e.specialty_ref.as_str()),
            procedures_in_queue: distinct(|e| e.procedure_ref.as_str()),
            elective_count: active
                .iter()
                .filter(|e| e.priority_tier == PriorityTier::None && !e.has_judicial_order)
                .count(),
            oncological_count: active
                .iter()
                .filter(|e| e.priority_tier == PriorityTier::Oncological)
                .count(),
            judicial_count: active.iter().filter(|e| e.has_judicial_order).count(),
            by_specialty,
            monthly_intake: monthly_intake(entries, now),
            top_procedures_by_count,
            top_procedures_by_wait,
        }
    }
}

/// First day of the current month minus the lookback window.
fn intake_period_start(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    let first_of_month = today.with_day(1).unwrap_or(today);
    first_of_month - Duration::days(INDICATOR_INTAKE_LOOKBACK_DAYS)
}

fn monthly_intake(entries: &[WaitlistEntry], now: DateTime<Utc>) -> Vec<MonthlyIntake> {
    let start = intake_period_start(now);
    let mut per_month: BTreeMap<(i32, u32), usize> = BTreeMap::new();
    for entry in entries {
        let day = entry.entered_at.date_naive();
        if day >= start {
            *per_month.entry((day.year(), day.month())).or_default() += 1;
        }
    }
    per_month
        .into_iter()
        .map(|((year, month), total)| MonthlyIntake {
            month: format!("{year:04}-{month:02}"),
            total,
        })
        .collect()
}
