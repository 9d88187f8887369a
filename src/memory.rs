//! In-process [`QueueStore`] used by tests and local simulations.
//!
//! All tables sit behind one async mutex, so claim-next and conditional
//! transitions are atomic within the process. It gives no guarantees across
//! processes; the Postgres store is the production backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::models::{
    ChatTurn, Doctor, DoctorId, Hospital, HospitalId, NewIntake, QueueEntry, QueueListing,
    QueueStatus, Role, StoredTurn, Summary, SummaryStatus, Transition, User, UserId,
};
use crate::store::QueueStore;
use crate::triage;

#[derive(Default)]
struct Tables {
    hospitals: BTreeMap<HospitalId, Hospital>,
    users: BTreeMap<UserId, User>,
    doctors: BTreeMap<DoctorId, Doctor>,
    summaries: HashMap<Uuid, Summary>,
    entries: HashMap<Uuid, QueueEntry>,
    turns: Vec<StoredTurn>,
    next_id: i64,
    next_arrival: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn listing(&self, entry: &QueueEntry) -> QueueListing {
        let patient_name = entry
            .patient_id
            .and_then(|id| self.users.get(&id))
            .and_then(|user| user.full_name.clone())
            .filter(|name| !name.is_empty())
            .or_else(|| entry.guest_name.clone())
            .unwrap_or_else(|| "Patient".to_string());
        let triage_code = self
            .summaries
            .get(&entry.summary_id)
            .map(|summary| summary.triage_code)
            .unwrap_or_else(|| triage::triage_for_priority(entry.priority));

        QueueListing {
            entry: entry.clone(),
            patient_name,
            triage_code,
        }
    }
}

#[derive(Default)]
pub struct MemoryQueueStore {
    tables: Mutex<Tables>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_hospital(&self, name: &str, address: Option<&str>) -> Hospital {
        let mut tables = self.tables.lock().await;
        let hospital = Hospital {
            id: tables.next_id(),
            name: name.to_string(),
            address: address.map(str::to_string),
            created_at: Utc::now(),
        };
        tables.hospitals.insert(hospital.id, hospital.clone());
        hospital
    }

    pub async fn add_user(
        &self,
        full_name: &str,
        email: &str,
        role: Role,
        hospital_id: Option<HospitalId>,
    ) -> User {
        let mut tables = self.tables.lock().await;
        let user = User {
            id: tables.next_id(),
            full_name: Some(full_name.to_string()),
            email: email.to_string(),
            role,
            hospital_id,
            created_at: Utc::now(),
        };
        tables.users.insert(user.id, user.clone());
        user
    }

    pub async fn add_doctor(&self, full_name: &str, hospital_id: HospitalId) -> Doctor {
        let email = format!("{}@mediq.test", full_name.to_lowercase().replace(' ', "."));
        let user = self
            .add_user(full_name, &email, Role::Doctor, Some(hospital_id))
            .await;
        let mut tables = self.tables.lock().await;
        let doctor = Doctor {
            id: tables.next_id(),
            user_id: user.id,
            hospital_id,
            specialty: "General".to_string(),
        };
        tables.doctors.insert(doctor.id, doctor.clone());
        doctor
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn hospital(&self, id: HospitalId) -> Result<Option<Hospital>> {
        Ok(self.tables.lock().await.hospitals.get(&id).cloned())
    }

    async fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn doctor(&self, id: DoctorId) -> Result<Option<Doctor>> {
        Ok(self.tables.lock().await.doctors.get(&id).cloned())
    }

    async fn save_transcript(
        &self,
        conversation_id: &str,
        user_id: Option<UserId>,
        turns: &[ChatTurn],
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        for turn in turns {
            tables.turns.push(StoredTurn {
                id: Uuid::new_v4(),
                user_id,
                conversation_id: conversation_id.to_string(),
                speaker: turn.speaker,
                message: turn.text.clone(),
                created_at: now,
            });
        }
        Ok(())
    }

    async fn transcript(&self, conversation_id: &str) -> Result<Vec<StoredTurn>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .turns
            .iter()
            .filter(|turn| turn.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn create_intake(&self, intake: NewIntake) -> Result<(Summary, QueueEntry)> {
        let mut tables = self.tables.lock().await;

        if !tables.hospitals.contains_key(&intake.hospital_id) {
            return Err(QueueError::not_found("hospital", intake.hospital_id));
        }
        if tables
            .summaries
            .values()
            .any(|summary| summary.conversation_id == intake.conversation_id)
        {
            return Err(QueueError::Conflict(
                "conversation already has a summary".to_string(),
            ));
        }

        let now = Utc::now();
        let summary = Summary {
            id: Uuid::new_v4(),
            patient_id: intake.identity.patient_id(),
            guest_name: intake.identity.guest_name().map(str::to_string),
            guest_contact: intake.identity.guest_contact().map(str::to_string),
            conversation_id: intake.conversation_id.clone(),
            summary_text: intake.summary_text.clone(),
            triage_code: intake.triage_code,
            suggested_next_steps: intake.suggested_next_steps.clone(),
            status: SummaryStatus::New,
            created_at: now,
        };

        tables.next_arrival += 1;
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            arrival_seq: tables.next_arrival,
            patient_id: summary.patient_id,
            guest_name: summary.guest_name.clone(),
            guest_contact: summary.guest_contact.clone(),
            hospital_id: intake.hospital_id,
            summary_id: summary.id,
            status: QueueStatus::Waiting,
            priority: triage::priority_for(intake.triage_code),
            doctor_id: None,
            created_at: now,
            updated_at: now,
        };

        tables.summaries.insert(summary.id, summary.clone());
        tables.entries.insert(entry.id, entry.clone());
        Ok((summary, entry))
    }

    async fn queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        Ok(self.tables.lock().await.entries.get(&id).cloned())
    }

    async fn queue_entry_for_summary(&self, summary_id: Uuid) -> Result<Option<QueueEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .entries
            .values()
            .find(|entry| entry.summary_id == summary_id)
            .cloned())
    }

    async fn summary(&self, id: Uuid) -> Result<Option<Summary>> {
        Ok(self.tables.lock().await.summaries.get(&id).cloned())
    }

    async fn summary_for_conversation(&self, conversation_id: &str) -> Result<Option<Summary>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .summaries
            .values()
            .find(|summary| summary.conversation_id == conversation_id)
            .cloned())
    }

    async fn set_summary_status(
        &self,
        id: Uuid,
        status: SummaryStatus,
    ) -> Result<Option<Summary>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.summaries.get_mut(&id).map(|summary| {
            summary.status = status;
            summary.clone()
        }))
    }

    async fn count_waiting_ahead(&self, entry: &QueueEntry) -> Result<u64> {
        let tables = self.tables.lock().await;
        Ok(triage::count_waiting_ahead(entry, tables.entries.values()))
    }

    async fn claim_next(
        &self,
        hospital_id: HospitalId,
        doctor_id: DoctorId,
    ) -> Result<Option<QueueEntry>> {
        let mut tables = self.tables.lock().await;
        let next_id = tables
            .entries
            .values()
            .filter(|entry| {
                entry.hospital_id == hospital_id && entry.status == QueueStatus::Waiting
            })
            .min_by(|a, b| triage::compare_rank(a, b))
            .map(|entry| entry.id);

        Ok(next_id.and_then(|id| {
            tables.entries.get_mut(&id).map(|entry| {
                entry.status = QueueStatus::InProgress;
                entry.doctor_id = Some(doctor_id);
                entry.updated_at = Utc::now();
                entry.clone()
            })
        }))
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Option<QueueEntry>> {
        let mut tables = self.tables.lock().await;
        let Some(entry) = tables.entries.get(&id) else {
            return Ok(None);
        };

        if entry.status != transition.from {
            return Ok(None);
        }
        if let Some(expected) = transition.expected_doctor {
            if entry.doctor_id != Some(expected) {
                return Ok(None);
            }
        }
        if transition.head_only && triage::count_waiting_ahead(entry, tables.entries.values()) > 0
        {
            return Ok(None);
        }

        let Some(entry) = tables.entries.get_mut(&id) else {
            return Ok(None);
        };
        entry.status = transition.to;
        if entry.doctor_id.is_none() {
            entry.doctor_id = transition.assign_doctor;
        }
        entry.updated_at = Utc::now();
        Ok(Some(entry.clone()))
    }

    async fn list_active(
        &self,
        hospital_id: HospitalId,
        doctor_id: DoctorId,
    ) -> Result<Vec<QueueListing>> {
        let tables = self.tables.lock().await;
        let mut visible: Vec<&QueueEntry> = tables
            .entries
            .values()
            .filter(|entry| entry.hospital_id == hospital_id)
            .filter(|entry| match entry.status {
                QueueStatus::Waiting => true,
                QueueStatus::InProgress => entry.doctor_id == Some(doctor_id),
                QueueStatus::Completed => false,
            })
            .collect();
        visible.sort_by(|a, b| triage::compare_rank(a, b));
        Ok(visible.into_iter().map(|entry| tables.listing(entry)).collect())
    }

    async fn list_history(
        &self,
        hospital_id: HospitalId,
        limit: i64,
    ) -> Result<Vec<QueueListing>> {
        let tables = self.tables.lock().await;
        let mut completed: Vec<&QueueEntry> = tables
            .entries
            .values()
            .filter(|entry| {
                entry.hospital_id == hospital_id && entry.status == QueueStatus::Completed
            })
            .collect();
        completed.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.arrival_seq.cmp(&a.arrival_seq))
        });
        Ok(completed
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|entry| tables.listing(entry))
            .collect())
    }
}
