use std::str::FromStr;

use anyhow::Context;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{ParseEnumError, QueueError};
use crate::models::{
    ChatTurn, Doctor, DoctorId, Hospital, HospitalId, NewIntake, QueueEntry, QueueListing,
    QueueStatus, Role, StoredTurn, Summary, SummaryStatus, Transition, User, UserId,
};
use crate::triage::priority_for;

const QUEUE_COLUMNS: &str = "q.id, q.arrival_seq, q.patient_id, q.guest_name, q.guest_contact, \
     q.hospital_id, q.summary_id, q.status, q.priority, q.doctor_id, q.created_at, q.updated_at";

const SUMMARY_COLUMNS: &str = "s.id, s.patient_id, s.guest_name, s.guest_contact, \
     s.conversation_id, s.summary_text, s.triage_code, s.suggested_next_steps, s.status, \
     s.created_at";

const USER_COLUMNS: &str = "u.id, u.full_name, u.email, u.role, u.hospital_id, u.created_at";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let hospital_id = ensure_hospital(
        pool,
        "MediQ General Hospital",
        Some("12 Harbor Road, Lagos"),
    )
    .await?;

    let users = vec![
        ("MediQ Admin", "admin@mediq.health", Role::Admin),
        ("Dr. Amara Okafor", "amara.okafor@mediq.health", Role::Doctor),
        ("Dr. Tunde Bello", "tunde.bello@mediq.health", Role::Doctor),
        ("Ngozi Eze", "ngozi.eze@example.com", Role::Patient),
    ];

    for (name, email, role) in users {
        let user_id: UserId = sqlx::query(
            r#"
            INSERT INTO mediq.users (full_name, email, role, hospital_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name, role = EXCLUDED.role,
                hospital_id = EXCLUDED.hospital_id
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(email)
        .bind(role.as_str())
        .bind(hospital_id)
        .fetch_one(pool)
        .await?
        .get("id");

        if role == Role::Doctor {
            sqlx::query(
                r#"
                INSERT INTO mediq.doctors (user_id, hospital_id, specialty)
                VALUES ($1, $2, 'General')
                ON CONFLICT (user_id) DO UPDATE SET hospital_id = EXCLUDED.hospital_id
                "#,
            )
            .bind(user_id)
            .bind(hospital_id)
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}

/// Insert a hospital unless one with the same name exists; returns its id.
async fn ensure_hospital(
    pool: &PgPool,
    name: &str,
    address: Option<&str>,
) -> anyhow::Result<HospitalId> {
    sqlx::query(
        r#"
        INSERT INTO mediq.hospitals (name, address)
        SELECT $1, $2
        WHERE NOT EXISTS (SELECT 1 FROM mediq.hospitals WHERE name = $1)
        "#,
    )
    .bind(name)
    .bind(address)
    .execute(pool)
    .await?;

    let id: HospitalId =
        sqlx::query("SELECT id FROM mediq.hospitals WHERE name = $1 ORDER BY id LIMIT 1")
            .bind(name)
            .fetch_one(pool)
            .await?
            .get("id");
    Ok(id)
}

pub async fn import_hospitals_csv(
    pool: &PgPool,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        name: String,
        address: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let name = row.name.trim();
        if name.is_empty() {
            continue;
        }
        let address = row
            .address
            .as_deref()
            .map(str::trim)
            .filter(|address| !address.is_empty());

        let result = sqlx::query(
            r#"
            INSERT INTO mediq.hospitals (name, address)
            SELECT $1, $2
            WHERE NOT EXISTS (SELECT 1 FROM mediq.hospitals WHERE name = $1)
            "#,
        )
        .bind(name)
        .bind(address)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

fn decode_text<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|err: ParseEnumError| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

fn hospital_from_row(row: &PgRow) -> Result<Hospital, sqlx::Error> {
    Ok(Hospital {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        created_at: row.try_get("created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        role: decode_text(row, "role")?,
        hospital_id: row.try_get("hospital_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn doctor_from_row(row: &PgRow) -> Result<Doctor, sqlx::Error> {
    Ok(Doctor {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        hospital_id: row.try_get("hospital_id")?,
        specialty: row.try_get("specialty")?,
    })
}

fn summary_from_row(row: &PgRow) -> Result<Summary, sqlx::Error> {
    Ok(Summary {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        guest_name: row.try_get("guest_name")?,
        guest_contact: row.try_get("guest_contact")?,
        conversation_id: row.try_get("conversation_id")?,
        summary_text: row.try_get("summary_text")?,
        triage_code: decode_text(row, "triage_code")?,
        suggested_next_steps: row.try_get("suggested_next_steps")?,
        status: decode_text(row, "status")?,
        created_at: row.try_get("created_at")?,
    })
}

fn queue_entry_from_row(row: &PgRow) -> Result<QueueEntry, sqlx::Error> {
    Ok(QueueEntry {
        id: row.try_get("id")?,
        arrival_seq: row.try_get("arrival_seq")?,
        patient_id: row.try_get("patient_id")?,
        guest_name: row.try_get("guest_name")?,
        guest_contact: row.try_get("guest_contact")?,
        hospital_id: row.try_get("hospital_id")?,
        summary_id: row.try_get("summary_id")?,
        status: decode_text(row, "status")?,
        priority: row.try_get("priority")?,
        doctor_id: row.try_get("doctor_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn listing_from_row(row: &PgRow) -> Result<QueueListing, sqlx::Error> {
    Ok(QueueListing {
        entry: queue_entry_from_row(row)?,
        patient_name: row.try_get("patient_name")?,
        triage_code: decode_text(row, "triage_code")?,
    })
}

fn conflict_on_unique(err: sqlx::Error, message: &str) -> QueueError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return QueueError::Conflict(message.to_string());
        }
    }
    QueueError::Database(err)
}

pub async fn fetch_hospital(
    pool: &PgPool,
    id: HospitalId,
) -> Result<Option<Hospital>, sqlx::Error> {
    let row = sqlx::query("SELECT id, name, address, created_at FROM mediq.hospitals WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(hospital_from_row).transpose()
}

pub async fn fetch_hospitals(pool: &PgPool) -> Result<Vec<Hospital>, sqlx::Error> {
    let rows =
        sqlx::query("SELECT id, name, address, created_at FROM mediq.hospitals ORDER BY name, id")
            .fetch_all(pool)
            .await?;
    rows.iter().map(hospital_from_row).collect()
}

pub async fn insert_hospital(
    pool: &PgPool,
    name: &str,
    address: Option<&str>,
) -> Result<Hospital, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO mediq.hospitals (name, address)
        VALUES ($1, $2)
        RETURNING id, name, address, created_at
        "#,
    )
    .bind(name)
    .bind(address)
    .fetch_one(pool)
    .await?;
    hospital_from_row(&row)
}

/// Deletes the hospital together with its staff, users and queue (FK cascade).
pub async fn delete_hospital(pool: &PgPool, id: HospitalId) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM mediq.hospitals WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn fetch_user(pool: &PgPool, id: UserId) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM mediq.users u WHERE u.id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

pub async fn insert_user(
    pool: &PgPool,
    full_name: &str,
    email: &str,
    role: Role,
    hospital_id: Option<HospitalId>,
) -> Result<User, QueueError> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO mediq.users AS u (full_name, email, role, hospital_id)
        VALUES ($1, $2, $3, $4)
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(full_name)
    .bind(email)
    .bind(role.as_str())
    .bind(hospital_id)
    .fetch_one(pool)
    .await
    .map_err(|err| conflict_on_unique(err, "email is already registered"))?;
    Ok(user_from_row(&row)?)
}

/// Creates the doctor's user account and doctor record in one transaction.
pub async fn insert_doctor(
    pool: &PgPool,
    full_name: &str,
    email: &str,
    hospital_id: HospitalId,
    specialty: Option<&str>,
) -> Result<(User, Doctor), QueueError> {
    let mut tx = pool.begin().await?;

    let user_row = sqlx::query(&format!(
        r#"
        INSERT INTO mediq.users AS u (full_name, email, role, hospital_id)
        VALUES ($1, $2, 'doctor', $3)
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(full_name)
    .bind(email)
    .bind(hospital_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|err| conflict_on_unique(err, "email is already registered"))?;
    let user = user_from_row(&user_row)?;

    let doctor_row = sqlx::query(
        r#"
        INSERT INTO mediq.doctors (user_id, hospital_id, specialty)
        VALUES ($1, $2, $3)
        RETURNING id, user_id, hospital_id, specialty
        "#,
    )
    .bind(user.id)
    .bind(hospital_id)
    .bind(specialty.unwrap_or("General"))
    .fetch_one(&mut *tx)
    .await?;
    let doctor = doctor_from_row(&doctor_row)?;

    tx.commit().await?;
    Ok((user, doctor))
}

pub async fn delete_user(pool: &PgPool, id: UserId) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM mediq.users WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn fetch_doctor(
    pool: &PgPool,
    id: DoctorId,
) -> Result<Option<Doctor>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, user_id, hospital_id, specialty FROM mediq.doctors WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(doctor_from_row).transpose()
}

pub async fn insert_chat_turns(
    pool: &PgPool,
    conversation_id: &str,
    user_id: Option<UserId>,
    turns: &[ChatTurn],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for (index, turn) in turns.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO mediq.chat_turns
            (id, user_id, conversation_id, speaker, message, turn_index)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(conversation_id)
        .bind(turn.speaker.as_str())
        .bind(&turn.text)
        .bind(index as i32)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn fetch_chat_turns(
    pool: &PgPool,
    conversation_id: &str,
) -> Result<Vec<StoredTurn>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, conversation_id, speaker, message, created_at
        FROM mediq.chat_turns
        WHERE conversation_id = $1
        ORDER BY created_at, turn_index
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    let mut turns = Vec::with_capacity(rows.len());
    for row in rows {
        turns.push(StoredTurn {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            conversation_id: row.try_get("conversation_id")?,
            speaker: decode_text(&row, "speaker")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(turns)
}

/// Inserts the summary and its queue entry in one transaction; the entry's
/// priority is derived from the summary's triage code.
pub async fn insert_intake(
    pool: &PgPool,
    intake: &NewIntake,
) -> Result<(Summary, QueueEntry), QueueError> {
    let mut tx = pool.begin().await?;

    let summary_row = sqlx::query(&format!(
        r#"
        INSERT INTO mediq.summaries AS s
        (id, patient_id, guest_name, guest_contact, conversation_id, summary_text,
         triage_code, suggested_next_steps, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'new')
        RETURNING {SUMMARY_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(intake.identity.patient_id())
    .bind(intake.identity.guest_name())
    .bind(intake.identity.guest_contact())
    .bind(&intake.conversation_id)
    .bind(&intake.summary_text)
    .bind(intake.triage_code.as_str())
    .bind(&intake.suggested_next_steps)
    .fetch_one(&mut *tx)
    .await
    .map_err(|err| conflict_on_unique(err, "conversation already has a summary"))?;
    let summary = summary_from_row(&summary_row)?;

    let entry_row = sqlx::query(&format!(
        r#"
        INSERT INTO mediq.queue_entries AS q
        (id, patient_id, guest_name, guest_contact, hospital_id, summary_id, status, priority)
        VALUES ($1, $2, $3, $4, $5, $6, 'waiting', $7)
        RETURNING {QUEUE_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(intake.identity.patient_id())
    .bind(intake.identity.guest_name())
    .bind(intake.identity.guest_contact())
    .bind(intake.hospital_id)
    .bind(summary.id)
    .bind(priority_for(intake.triage_code))
    .fetch_one(&mut *tx)
    .await?;
    let entry = queue_entry_from_row(&entry_row)?;

    tx.commit().await?;
    Ok((summary, entry))
}

pub async fn fetch_queue_entry(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<QueueEntry>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {QUEUE_COLUMNS} FROM mediq.queue_entries q WHERE q.id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(queue_entry_from_row).transpose()
}

pub async fn fetch_queue_entry_for_summary(
    pool: &PgPool,
    summary_id: Uuid,
) -> Result<Option<QueueEntry>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {QUEUE_COLUMNS} FROM mediq.queue_entries q WHERE q.summary_id = $1"
    ))
    .bind(summary_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(queue_entry_from_row).transpose()
}

pub async fn fetch_summary(pool: &PgPool, id: Uuid) -> Result<Option<Summary>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM mediq.summaries s WHERE s.id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(summary_from_row).transpose()
}

pub async fn fetch_summary_for_conversation(
    pool: &PgPool,
    conversation_id: &str,
) -> Result<Option<Summary>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM mediq.summaries s WHERE s.conversation_id = $1"
    ))
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(summary_from_row).transpose()
}

pub async fn update_summary_status(
    pool: &PgPool,
    id: Uuid,
    status: SummaryStatus,
) -> Result<Option<Summary>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "UPDATE mediq.summaries s SET status = $2 WHERE s.id = $1 RETURNING {SUMMARY_COLUMNS}"
    ))
    .bind(id)
    .bind(status.as_str())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(summary_from_row).transpose()
}

pub async fn count_waiting_ahead(pool: &PgPool, entry: &QueueEntry) -> Result<u64, sqlx::Error> {
    let ahead: i64 = sqlx::query(
        r#"
        SELECT COUNT(*) AS ahead
        FROM mediq.queue_entries o
        WHERE o.hospital_id = $1
          AND o.status = 'waiting'
          AND o.id <> $2
          AND (o.priority, o.created_at, o.arrival_seq) < ($3, $4, $5)
        "#,
    )
    .bind(entry.hospital_id)
    .bind(entry.id)
    .bind(entry.priority)
    .bind(entry.created_at)
    .bind(entry.arrival_seq)
    .fetch_one(pool)
    .await?
    .try_get("ahead")?;
    Ok(ahead.max(0) as u64)
}

/// Atomically moves the best-ranked waiting entry to in-progress. Rows locked
/// by a concurrent claimer are skipped, so racing doctors get distinct patients.
pub async fn claim_next_waiting(
    pool: &PgPool,
    hospital_id: HospitalId,
    doctor_id: DoctorId,
) -> Result<Option<QueueEntry>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        WITH next AS (
            SELECT id
            FROM mediq.queue_entries
            WHERE hospital_id = $1 AND status = 'waiting'
            ORDER BY priority, created_at, arrival_seq
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE mediq.queue_entries q
        SET status = 'in-progress', doctor_id = $2, updated_at = clock_timestamp()
        FROM next
        WHERE q.id = next.id AND q.status = 'waiting'
        RETURNING {QUEUE_COLUMNS}
        "#
    ))
    .bind(hospital_id)
    .bind(doctor_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(queue_entry_from_row).transpose()
}

/// Conditional status update. With `head_only`, the row must also still be
/// the best-ranked waiting entry of its hospital when the update runs.
pub async fn apply_transition(
    pool: &PgPool,
    id: Uuid,
    transition: Transition,
) -> Result<Option<QueueEntry>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE mediq.queue_entries q
        SET status = $2,
            doctor_id = COALESCE(q.doctor_id, $3),
            updated_at = clock_timestamp()
        WHERE q.id = $1
          AND q.status = $4
          AND ($5::BIGINT IS NULL OR q.doctor_id = $5)
          AND (NOT $6 OR NOT EXISTS (
              SELECT 1
              FROM mediq.queue_entries o
              WHERE o.hospital_id = q.hospital_id
                AND o.status = 'waiting'
                AND o.id <> q.id
                AND (o.priority, o.created_at, o.arrival_seq)
                    < (q.priority, q.created_at, q.arrival_seq)
          ))
        RETURNING {QUEUE_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(transition.to.as_str())
    .bind(transition.assign_doctor)
    .bind(transition.from.as_str())
    .bind(transition.expected_doctor)
    .bind(transition.head_only)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(queue_entry_from_row).transpose()
}

fn listing_query(filter: &str, order: &str) -> String {
    format!(
        r#"
        SELECT {QUEUE_COLUMNS}, s.triage_code,
               COALESCE(NULLIF(u.full_name, ''), q.guest_name, 'Patient') AS patient_name
        FROM mediq.queue_entries q
        JOIN mediq.summaries s ON s.id = q.summary_id
        LEFT JOIN mediq.users u ON u.id = q.patient_id
        WHERE {filter}
        ORDER BY {order}
        "#
    )
}

pub async fn fetch_active_queue(
    pool: &PgPool,
    hospital_id: HospitalId,
    doctor_id: DoctorId,
) -> Result<Vec<QueueListing>, sqlx::Error> {
    let query = listing_query(
        "q.hospital_id = $1 \
         AND (q.status = 'waiting' OR (q.status = 'in-progress' AND q.doctor_id = $2))",
        "q.priority, q.created_at, q.arrival_seq",
    );
    let rows = sqlx::query(&query)
        .bind(hospital_id)
        .bind(doctor_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(listing_from_row).collect()
}

pub async fn fetch_history(
    pool: &PgPool,
    hospital_id: HospitalId,
    limit: i64,
) -> Result<Vec<QueueListing>, sqlx::Error> {
    let query = format!(
        "{} LIMIT $3",
        listing_query(
            "q.hospital_id = $1 AND q.status = $2",
            "q.updated_at DESC, q.arrival_seq DESC",
        )
    );
    let rows = sqlx::query(&query)
        .bind(hospital_id)
        .bind(QueueStatus::Completed.as_str())
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(listing_from_row).collect()
}
