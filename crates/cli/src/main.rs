use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use waitlist_core::{
    config::{catalog_file_from_env_value, data_dir_from_env_value, rest_addr_from_env_value},
    Actor, AuditContext, CoreConfig, EntryChanges, EntryFilter, EntryId, ExitReason,
    ExternalEntryRequest, PriorityTier, QueueRow, WaitlistService, WaitlistStatus,
};

#[derive(Parser)]
#[command(name = "waitlist")]
#[command(about = "Surgical waitlist CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Who is making the change and why. Recorded in the audit trail.
#[derive(Args)]
struct AuditArgs {
    /// Name of the person making the change
    #[arg(long)]
    actor: String,
    /// Professional role of the actor
    #[arg(long, default_value = "Caseworker")]
    role: String,
    /// Reason for the change
    #[arg(long)]
    reason: String,
}

impl AuditArgs {
    fn context(&self) -> Result<AuditContext, Box<dyn std::error::Error>> {
        Ok(AuditContext::new(Actor::new(&self.actor, &self.role)?, &self.reason)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Put a patient on the waitlist
    Create {
        /// Patient key
        patient: String,
        /// Procedure key
        procedure: String,
        /// Specialty key
        specialty: String,
        /// Requesting physician key
        #[arg(long)]
        physician: Option<String>,
        /// Secondary procedure key
        #[arg(long, requires = "secondary_specialty")]
        secondary_procedure: Option<String>,
        /// Specialty key of the secondary procedure
        #[arg(long)]
        secondary_specialty: Option<String>,
        /// Priority tier (ONCOLOGICAL, FLAGGED or NONE)
        #[arg(long)]
        priority: Option<PriorityTier>,
        /// Clinical justification, required with a priority tier
        #[arg(long)]
        justification: Option<String>,
        /// The entry is backed by a court order
        #[arg(long)]
        judicial: bool,
        /// Court case number
        #[arg(long)]
        case_number: Option<String>,
        /// What the court ordered
        #[arg(long)]
        judicial_description: Option<String>,
        /// Workflow status, e.g. exams_pending
        #[arg(long)]
        status: Option<WaitlistStatus>,
        /// Free-text notes
        #[arg(long)]
        notes: Option<String>,
        /// Next contact date (YYYY-MM-DD)
        #[arg(long)]
        next_contact: Option<NaiveDate>,
        #[command(flatten)]
        audit: AuditArgs,
    },
    /// Change priority, judicial or workflow fields of an entry
    Update {
        /// Entry id
        id: EntryId,
        #[arg(long)]
        priority: Option<PriorityTier>,
        #[arg(long)]
        justification: Option<String>,
        /// Set or clear the court order flag
        #[arg(long)]
        judicial: Option<bool>,
        #[arg(long)]
        case_number: Option<String>,
        /// Workflow status, e.g. ready_for_surgery
        #[arg(long)]
        status: Option<WaitlistStatus>,
        /// Free-text notes (empty string clears them)
        #[arg(long)]
        notes: Option<String>,
        /// Next contact date (YYYY-MM-DD)
        #[arg(long)]
        next_contact: Option<NaiveDate>,
        /// Fail if the entry changed since this version was read
        #[arg(long)]
        expected_version: Option<u64>,
        #[command(flatten)]
        audit: AuditArgs,
    },
    /// Take an entry off the queue
    Remove {
        /// Entry id
        id: EntryId,
        /// surgery_performed, deceased, surgery_elsewhere or self_excluded
        exit_reason: ExitReason,
        #[command(flatten)]
        audit: AuditArgs,
    },
    /// Print the active queue in order
    Rank {
        /// Only show entries of this specialty ref (positions stay global)
        #[arg(long)]
        specialty: Option<String>,
    },
    /// Print the position of one entry
    Position {
        /// Entry id
        id: EntryId,
    },
    /// Print every entry of a patient with its position
    Patient {
        /// Patient ref, e.g. patient:1001
        patient_ref: String,
    },
    /// Print the audit history of an entry
    History {
        /// Entry id
        id: EntryId,
    },
    /// Print aggregate queue indicators as JSON
    Indicators,
}

fn open_service() -> Result<WaitlistService, Box<dyn std::error::Error>> {
    let cfg = CoreConfig::new(
        data_dir_from_env_value(std::env::var("WAITLIST_DATA_DIR").ok()),
        catalog_file_from_env_value(std::env::var("WAITLIST_CATALOG_FILE").ok()),
        rest_addr_from_env_value(std::env::var("WAITLIST_REST_ADDR").ok())?,
    )?;
    Ok(WaitlistService::from_config(&cfg)?)
}

fn print_row(row: &QueueRow) {
    let position = row
        .position
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".into());
    let entry = &row.entry;
    let judicial = if entry.has_judicial_order { " [judicial]" } else { "" };
    println!(
        "{:>4}  #{:<5} {}  {}  {}  {}{}  entered {}",
        position,
        entry.id,
        entry.patient_ref,
        entry.procedure_ref,
        entry.specialty_ref,
        entry.priority_tier.label(),
        judicial,
        entry.entered_at.format("%Y-%m-%d %H:%M"),
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Create {
            patient,
            procedure,
            specialty,
            physician,
            secondary_procedure,
            secondary_specialty,
            priority,
            justification,
            judicial,
            case_number,
            judicial_description,
            status,
            notes,
            next_contact,
            audit,
        }) => {
            let service = open_service()?;
            let request = ExternalEntryRequest {
                patient_key: patient,
                procedure_key: procedure,
                specialty_key: specialty,
                physician_key: physician,
                secondary_procedure_key: secondary_procedure,
                secondary_specialty_key: secondary_specialty,
                priority_tier: priority.unwrap_or_default(),
                priority_justification: justification,
                has_judicial_order: judicial,
                judicial_case_number: case_number,
                judicial_description,
                status: status.unwrap_or_default(),
                notes,
                next_contact_date: next_contact,
            };
            let (entry, position) = service.register_with_position(request, &audit.context()?)?;
            match position {
                Some(position) => println!("Created entry {} at position {}", entry.id, position),
                None => println!("Created entry {}", entry.id),
            }
        }
        Some(Commands::Update {
            id,
            priority,
            justification,
            judicial,
            case_number,
            status,
            notes,
            next_contact,
            expected_version,
            audit,
        }) => {
            let service = open_service()?;
            let changes = EntryChanges {
                priority_tier: priority,
                priority_justification: justification,
                has_judicial_order: judicial,
                judicial_case_number: case_number,
                status,
                notes,
                next_contact_date: next_contact,
                expected_version,
                ..Default::default()
            };
            let entry = service.update(id, &changes, &audit.context()?)?;
            println!("Updated entry {} (version {})", entry.id, entry.version);
        }
        Some(Commands::Remove {
            id,
            exit_reason,
            audit,
        }) => {
            let service = open_service()?;
            service.deactivate(id, exit_reason, &audit.context()?)?;
            println!("Removed entry {}: {}", id, exit_reason.label());
        }
        Some(Commands::Rank { specialty }) => {
            let service = open_service()?;
            let filter = EntryFilter {
                specialties: specialty.into_iter().collect(),
                active: Some(true),
                ..Default::default()
            };
            let rows = service.list(&filter)?;
            if rows.is_empty() {
                println!("The queue is empty.");
            }
            for row in &rows {
                print_row(row);
            }
        }
        Some(Commands::Position { id }) => {
            let service = open_service()?;
            match service.position_of(id)? {
                Some(position) => println!("Entry {} is at position {}", id, position),
                None => println!("Entry {} is no longer in the queue", id),
            }
        }
        Some(Commands::Patient { patient_ref }) => {
            let service = open_service()?;
            let report = service.patient_report(&patient_ref)?;
            println!("Patient {}", report.patient_ref);
            for row in report.active.iter().chain(report.inactive.iter()) {
                print_row(row);
            }
        }
        Some(Commands::History { id }) => {
            let service = open_service()?;
            for record in service.history(id)? {
                println!(
                    "{}  {:?} by {} ({}): {}",
                    record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    record.action,
                    record.actor.name,
                    record.actor.role,
                    record.reason
                );
                for change in &record.changes {
                    println!("    {}: '{}' -> '{}'", change.field, change.before, change.after);
                }
            }
        }
        Some(Commands::Indicators) => {
            let service = open_service()?;
            println!("{}", serde_json::to_string_pretty(&service.indicators()?)?);
        }
        None => {
            println!("Use 'waitlist --help' for commands");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_create_accepts_every_request_field() {
        let cli = Cli::try_parse_from([
            "waitlist",
            "create",
            "1001",
            "0408050500",
            "ORT",
            "--secondary-procedure",
            "0409040240",
            "--secondary-specialty",
            "CIR",
            "--judicial",
            "--case-number",
            "0001234-56.2025",
            "--judicial-description",
            "surgery within 30 days",
            "--status",
            "exams_pending",
            "--next-contact",
            "2025-07-01",
            "--actor",
            "Ana Souza",
            "--reason",
            "referral received",
        ])
        .unwrap();

        let Some(Commands::Create {
            secondary_procedure,
            secondary_specialty,
            judicial_description,
            status,
            next_contact,
            ..
        }) = cli.command
        else {
            panic!("expected the create command");
        };
        assert_eq!(secondary_procedure.as_deref(), Some("0409040240"));
        assert_eq!(secondary_specialty.as_deref(), Some("CIR"));
        assert_eq!(judicial_description.as_deref(), Some("surgery within 30 days"));
        assert_eq!(status, Some(WaitlistStatus::ExamsPending));
        assert_eq!(next_contact, NaiveDate::from_ymd_opt(2025, 7, 1));
    }

    #[test]
    fn test_secondary_procedure_needs_its_specialty() {
        let parsed = Cli::try_parse_from([
            "waitlist",
            "create",
            "1001",
            "0408050500",
            "ORT",
            "--secondary-procedure",
            "0409040240",
            "--actor",
            "Ana Souza",
            "--reason",
            "referral received",
        ]);
        assert!(parsed.is_err());
    }
}
