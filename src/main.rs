use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mediq_queue::admin;
use mediq_queue::classifier::{next_assistant_turn, ClassifierError, HttpClassifier};
use mediq_queue::config::{Config, ModelSettings};
use mediq_queue::db;
use mediq_queue::models::{ChatTurn, QueueListing, Role, SubmissionRequest};
use mediq_queue::queue::{CallNextOutcome, QueueService, StatusChange};
use mediq_queue::report;
use mediq_queue::store::{PgQueueStore, QueueStore};

#[derive(Parser)]
#[command(name = "mediq-queue")]
#[command(about = "Patient intake and triage queue for MediQ hospitals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo hospital with staff and a patient
    Seed,
    /// Import hospitals from a CSV file with `name,address` columns
    ImportHospitals {
        #[arg(long)]
        csv: PathBuf,
    },
    /// List hospitals
    Hospitals,
    /// Create a hospital (admin only)
    CreateHospital {
        #[arg(long)]
        admin: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        address: String,
    },
    /// Delete a hospital with its staff and queue (admin only)
    DeleteHospital {
        #[arg(long)]
        admin: i64,
        #[arg(long)]
        id: i64,
    },
    /// Create a patient or admin account (admin only)
    CreateUser {
        #[arg(long)]
        admin: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "patient")]
        role: String,
        #[arg(long)]
        hospital: Option<i64>,
    },
    /// Create a doctor account attached to a hospital (admin only)
    CreateDoctor {
        #[arg(long)]
        admin: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        hospital: i64,
        #[arg(long)]
        specialty: Option<String>,
    },
    /// Delete a user account (admin only)
    DeleteUser {
        #[arg(long)]
        admin: i64,
        #[arg(long)]
        id: i64,
    },
    /// Add a patient message to a transcript file and append the assistant's reply
    Chat {
        /// JSON transcript file; created when missing
        #[arg(long)]
        transcript: PathBuf,
        #[arg(long)]
        message: String,
    },
    /// Submit a consultation transcript and join the hospital queue
    #[command(group(
        ArgGroup::new("identity")
            .args(["patient", "guest_name"])
            .multiple(false)
    ))]
    Submit {
        /// JSON array of `{"speaker": "patient"|"assistant", "text": ...}` turns
        #[arg(long)]
        transcript: PathBuf,
        #[arg(long)]
        hospital: Option<i64>,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long)]
        patient: Option<i64>,
        #[arg(long)]
        guest_name: Option<String>,
        #[arg(long)]
        guest_contact: Option<String>,
    },
    /// Show a queue entry's position and estimated wait
    Status { queue_id: Uuid },
    /// Call the next patient in line
    CallNext {
        #[arg(long)]
        hospital: i64,
        #[arg(long)]
        doctor: i64,
    },
    /// Move a queue entry to waiting, in-progress or completed
    SetStatus {
        queue_id: Uuid,
        #[arg(long)]
        status: String,
        #[arg(long)]
        doctor: i64,
    },
    /// Show waiting patients and your own in-progress patients
    Queue {
        #[arg(long)]
        hospital: i64,
        #[arg(long)]
        doctor: i64,
    },
    /// Show recently completed consultations
    History {
        #[arg(long)]
        hospital: i64,
        #[arg(long)]
        doctor: i64,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show a summary with its conversation
    Summary {
        summary_id: Uuid,
        #[arg(long)]
        doctor: i64,
    },
    /// Mark a summary as new, reviewed or follow-up
    ReviewSummary {
        summary_id: Uuid,
        #[arg(long)]
        status: String,
        #[arg(long)]
        doctor: i64,
    },
    /// Write a markdown snapshot of the dashboard
    Report {
        #[arg(long)]
        hospital: i64,
        #[arg(long)]
        doctor: i64,
        #[arg(long, default_value = "queue-report.md")]
        out: PathBuf,
    },
}

fn print_listing(rows: &[QueueListing]) {
    for row in rows {
        println!(
            "- {} {} [{}] {} (since {})",
            row.entry.id,
            row.patient_name,
            row.triage_code,
            row.entry.status,
            row.entry.created_at.format("%Y-%m-%d %H:%M")
        );
    }
}

fn read_transcript(path: &Path) -> anyhow::Result<Vec<ChatTurn>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a chat transcript", path.display()))
}

async fn chat(transcript: &Path, message: &str) -> anyhow::Result<()> {
    let message = message.trim();
    if message.is_empty() {
        anyhow::bail!("message must not be empty");
    }
    let mut turns = if transcript.exists() {
        read_transcript(transcript)?
    } else {
        Vec::new()
    };
    turns.push(ChatTurn::patient(message));

    let settings = ModelSettings::from_env()?;
    if settings.classifier.api_key.is_none() {
        warn!("TRIAGE_API_KEY is not set; the assistant cannot answer");
    }
    let assistant = HttpClassifier::new(settings.classifier)?;
    let reply = match next_assistant_turn(&assistant, &turns, &settings.retry).await {
        Ok(reply) => reply,
        Err(ClassifierError::Status(_)) => {
            anyhow::bail!("the assistant is currently busy, please try again in a moment")
        }
        Err(err) => return Err(err.into()),
    };

    turns.push(ChatTurn::assistant(reply.clone()));
    std::fs::write(transcript, serde_json::to_string_pretty(&turns)?)
        .with_context(|| format!("failed to write {}", transcript.display()))?;
    println!("{reply}");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Chat {
        transcript,
        message,
    } = &cli.command
    {
        return chat(transcript, message).await;
    }

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    if config.classifier.api_key.is_none() {
        warn!("TRIAGE_API_KEY is not set; submissions will use fallback triage");
    }
    let store = Arc::new(PgQueueStore::new(pool.clone()));
    let classifier = Arc::new(HttpClassifier::new(config.classifier.clone())?);
    let service = QueueService::new(store.clone(), classifier, config.queue.clone());

    match cli.command {
        Commands::Chat {
            transcript,
            message,
        } => chat(&transcript, &message).await?,
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportHospitals { csv } => {
            let inserted = db::import_hospitals_csv(&pool, &csv).await?;
            println!("Inserted {inserted} hospitals from {}.", csv.display());
        }
        Commands::Hospitals => {
            let hospitals = db::fetch_hospitals(&pool).await?;
            if hospitals.is_empty() {
                println!("No hospitals registered.");
            }
            for hospital in hospitals {
                println!(
                    "- {} {} ({})",
                    hospital.id,
                    hospital.name,
                    hospital.address.as_deref().unwrap_or("no address")
                );
            }
        }
        Commands::CreateHospital {
            admin,
            name,
            address,
        } => {
            let actor = admin::authorize_admin(&pool, admin).await?;
            let hospital = admin::create_hospital(&pool, &actor, &name, &address).await?;
            println!("Hospital {} created.", hospital.id);
        }
        Commands::DeleteHospital { admin, id } => {
            let actor = admin::authorize_admin(&pool, admin).await?;
            admin::delete_hospital(&pool, &actor, id).await?;
            println!("Hospital {id} deleted with its staff and queue.");
        }
        Commands::CreateUser {
            admin,
            name,
            email,
            role,
            hospital,
        } => {
            let actor = admin::authorize_admin(&pool, admin).await?;
            let role: Role = role.parse()?;
            let user = admin::create_user(&pool, &actor, &name, &email, role, hospital).await?;
            println!("User {} created as {}.", user.id, user.role);
        }
        Commands::CreateDoctor {
            admin,
            name,
            email,
            hospital,
            specialty,
        } => {
            let actor = admin::authorize_admin(&pool, admin).await?;
            let (user, doctor) = admin::create_doctor(
                &pool,
                &actor,
                &name,
                &email,
                hospital,
                specialty.as_deref(),
            )
            .await?;
            println!("Doctor {} created (user {}).", doctor.id, user.id);
        }
        Commands::DeleteUser { admin, id } => {
            let actor = admin::authorize_admin(&pool, admin).await?;
            admin::delete_user(&pool, &actor, id).await?;
            println!("User {id} deleted.");
        }
        Commands::Submit {
            transcript,
            hospital,
            conversation,
            patient,
            guest_name,
            guest_contact,
        } => {
            let messages = read_transcript(&transcript)?;
            let request = SubmissionRequest {
                patient_id: patient,
                guest_name,
                guest_contact,
                hospital_id: hospital,
                conversation_id: conversation.unwrap_or_else(|| Uuid::new_v4().to_string()),
                messages,
            };
            let receipt = service
                .submit(request)
                .await
                .context("failed to process consultation")?;
            print_json(&receipt)?;
        }
        Commands::Status { queue_id } => {
            let view = service.queue_status(queue_id).await?;
            print_json(&view)?;
        }
        Commands::CallNext { hospital, doctor } => {
            match service.call_next(hospital, doctor).await? {
                CallNextOutcome::Assigned(entry) => {
                    println!("Now seeing queue entry {} (priority {}).", entry.id, entry.priority);
                }
                CallNextOutcome::NoPatientsWaiting => println!("No patients waiting."),
            }
        }
        Commands::SetStatus {
            queue_id,
            status,
            doctor,
        } => match service.set_status(queue_id, &status, doctor).await? {
            StatusChange::Applied(entry) => {
                println!("Queue entry {} is now {}.", entry.id, entry.status);
            }
            StatusChange::Unchanged(entry) => {
                println!("Queue entry {} was already {}.", entry.id, entry.status);
            }
        },
        Commands::Queue { hospital, doctor } => {
            let rows = service.list_queue(hospital, doctor).await?;
            if rows.is_empty() {
                println!("No patients waiting.");
                return Ok(());
            }
            println!("Queue by priority:");
            print_listing(&rows);
        }
        Commands::History {
            hospital,
            doctor,
            limit,
        } => {
            let rows = service.list_history(hospital, doctor, Some(limit)).await?;
            if rows.is_empty() {
                println!("No completed consultations.");
                return Ok(());
            }
            println!("Completed consultations:");
            print_listing(&rows);
        }
        Commands::Summary { summary_id, doctor } => {
            let details = service.summary_details(summary_id, doctor).await?;
            print_json(&details)?;
        }
        Commands::ReviewSummary {
            summary_id,
            status,
            doctor,
        } => {
            let summary = service.review_summary(summary_id, &status, doctor).await?;
            println!("Summary {} marked {}.", summary.id, summary.status);
        }
        Commands::Report {
            hospital,
            doctor,
            out,
        } => {
            let active = service.list_queue(hospital, doctor).await?;
            let history = service.list_history(hospital, doctor, None).await?;
            let hospital = store
                .hospital(hospital)
                .await?
                .context("hospital not found")?;
            let report = report::build_report(
                &hospital,
                chrono::Utc::now(),
                &active,
                &history,
                service.settings().minutes_per_patient,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
