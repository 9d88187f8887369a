use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{assess_with_fallback, RetryPolicy, TriageClassifier};
use crate::error::{QueueError, Result};
use crate::models::{
    Doctor, DoctorId, HospitalId, NewIntake, PatientIdentity, QueueEntry, QueueListing,
    QueueStatus, QueueStatusView, Role, SubmissionReceipt, SubmissionRequest, Summary,
    SummaryDetails, SummaryStatus, Transition,
};
use crate::store::QueueStore;
use crate::triage;

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Whether a doctor may pull an arbitrary waiting patient out of order by
/// setting it in-progress directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimPolicy {
    #[default]
    Any,
    NextOnly,
}

impl std::str::FromStr for ClaimPolicy {
    type Err = crate::error::ParseEnumError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "any" => Ok(ClaimPolicy::Any),
            "next-only" => Ok(ClaimPolicy::NextOnly),
            _ => Err(crate::error::ParseEnumError {
                kind: "claim policy",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub minutes_per_patient: u32,
    pub claim_policy: ClaimPolicy,
    pub retry: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            minutes_per_patient: triage::DEFAULT_MINUTES_PER_PATIENT,
            claim_policy: ClaimPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallNextOutcome {
    Assigned(QueueEntry),
    NoPatientsWaiting,
}

#[derive(Debug, Clone)]
pub enum StatusChange {
    Applied(QueueEntry),
    /// The entry was already in the requested state.
    Unchanged(QueueEntry),
}

impl StatusChange {
    pub fn entry(&self) -> &QueueEntry {
        match self {
            StatusChange::Applied(entry) | StatusChange::Unchanged(entry) => entry,
        }
    }
}

/// Patient intake and queue lifecycle for every hospital in the store.
///
/// Identities are passed explicitly on every call; nothing here reads an
/// ambient "current user".
pub struct QueueService {
    store: Arc<dyn QueueStore>,
    classifier: Arc<dyn TriageClassifier>,
    settings: QueueSettings,
}

impl QueueService {
    pub fn new(
        store: Arc<dyn QueueStore>,
        classifier: Arc<dyn TriageClassifier>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            store,
            classifier,
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub async fn submit(&self, request: SubmissionRequest) -> Result<SubmissionReceipt> {
        let intake = request.validate()?;

        if self.store.hospital(intake.hospital_id).await?.is_none() {
            return Err(QueueError::not_found("hospital", intake.hospital_id));
        }
        if let PatientIdentity::Registered(patient_id) = intake.identity {
            let user = self
                .store
                .user(patient_id)
                .await?
                .ok_or_else(|| QueueError::not_found("patient", patient_id))?;
            if user.role != Role::Patient {
                return Err(QueueError::validation(format!(
                    "user {patient_id} is a {}, not a patient",
                    user.role
                )));
            }
        }
        if self
            .store
            .summary_for_conversation(&intake.conversation_id)
            .await?
            .is_some()
        {
            return Err(QueueError::Conflict(
                "conversation already has a summary".to_string(),
            ));
        }

        info!(
            conversation = %intake.conversation_id,
            hospital = intake.hospital_id,
            messages = intake.messages.len(),
            "processing consultation"
        );

        if let Err(err) = self
            .store
            .save_transcript(
                &intake.conversation_id,
                intake.identity.patient_id(),
                &intake.messages,
            )
            .await
        {
            warn!(
                conversation = %intake.conversation_id,
                error = %err,
                "failed to save chat transcript"
            );
        }

        let outcome = assess_with_fallback(
            self.classifier.as_ref(),
            &intake.messages,
            &self.settings.retry,
        )
        .await;
        let assessment = outcome.assessment;

        let (summary, entry) = self
            .store
            .create_intake(NewIntake {
                identity: intake.identity,
                hospital_id: intake.hospital_id,
                conversation_id: intake.conversation_id,
                summary_text: assessment.summary_text,
                triage_code: assessment.triage_code,
                suggested_next_steps: assessment.next_steps,
            })
            .await?;

        let position = self.rank(&entry).await?;
        let estimated_wait_minutes =
            triage::estimate_wait_minutes(position, self.settings.minutes_per_patient);

        info!(
            queue_id = %entry.id,
            triage = %summary.triage_code,
            position,
            estimated_wait_minutes,
            degraded = outcome.degraded,
            "patient queued"
        );

        Ok(SubmissionReceipt {
            queue_id: entry.id,
            summary_id: summary.id,
            position,
            estimated_wait_minutes,
            triage_code: summary.triage_code,
            degraded_triage: outcome.degraded,
        })
    }

    async fn rank(&self, entry: &QueueEntry) -> Result<u32> {
        let ahead = self.store.count_waiting_ahead(entry).await?;
        Ok(triage::position_from_ahead(ahead))
    }

    /// Live 1-based position of a waiting entry; `None` once it has left the line.
    pub async fn position(&self, entry_id: Uuid) -> Result<Option<u32>> {
        let entry = self.entry(entry_id).await?;
        if entry.status != QueueStatus::Waiting {
            return Ok(None);
        }
        Ok(Some(self.rank(&entry).await?))
    }

    pub fn estimate_wait_minutes(&self, position: u32) -> u32 {
        triage::estimate_wait_minutes(position, self.settings.minutes_per_patient)
    }

    pub async fn queue_status(&self, entry_id: Uuid) -> Result<QueueStatusView> {
        let entry = self.entry(entry_id).await?;

        let position = if entry.status == QueueStatus::Waiting {
            Some(self.rank(&entry).await?)
        } else {
            None
        };

        let triage_code = match self.store.summary(entry.summary_id).await? {
            Some(summary) => summary.triage_code,
            None => triage::triage_for_priority(entry.priority),
        };

        let registered_name = match entry.patient_id {
            Some(patient_id) => self
                .store
                .user(patient_id)
                .await?
                .and_then(|user| user.full_name)
                .filter(|name| !name.is_empty()),
            None => None,
        };
        let patient_name = registered_name
            .or_else(|| entry.guest_name.clone())
            .unwrap_or_else(|| "Patient".to_string());

        let hospital = self
            .store
            .hospital(entry.hospital_id)
            .await?
            .ok_or_else(|| QueueError::not_found("hospital", entry.hospital_id))?;

        Ok(QueueStatusView {
            queue_id: entry.id,
            position,
            estimated_wait_minutes: position.map(|p| self.estimate_wait_minutes(p)),
            status: entry.status,
            triage_code,
            patient_name,
            hospital_name: hospital.name,
            hospital_address: hospital.address,
            priority: entry.priority,
        })
    }

    pub async fn call_next(
        &self,
        hospital_id: HospitalId,
        doctor_id: DoctorId,
    ) -> Result<CallNextOutcome> {
        self.authorize_doctor(doctor_id, hospital_id).await?;

        match self.store.claim_next(hospital_id, doctor_id).await? {
            Some(entry) => {
                info!(
                    queue_id = %entry.id,
                    doctor = doctor_id,
                    priority = entry.priority,
                    "patient called"
                );
                Ok(CallNextOutcome::Assigned(entry))
            }
            None => {
                debug!(hospital = hospital_id, doctor = doctor_id, "no patients waiting");
                Ok(CallNextOutcome::NoPatientsWaiting)
            }
        }
    }

    pub async fn set_status(
        &self,
        entry_id: Uuid,
        status: &str,
        doctor_id: DoctorId,
    ) -> Result<StatusChange> {
        let target: QueueStatus = status.parse()?;
        let entry = self.entry(entry_id).await?;
        self.authorize_doctor(doctor_id, entry.hospital_id).await?;

        let transition = match (entry.status, target) {
            (QueueStatus::Waiting, QueueStatus::Waiting)
            | (QueueStatus::Completed, QueueStatus::Completed) => {
                return Ok(StatusChange::Unchanged(entry));
            }
            (QueueStatus::InProgress, QueueStatus::InProgress) => {
                if entry.doctor_id == Some(doctor_id) {
                    return Ok(StatusChange::Unchanged(entry));
                }
                return Err(QueueError::Unauthorized(
                    "patient is already with another doctor".to_string(),
                ));
            }
            (QueueStatus::Waiting, QueueStatus::InProgress) => {
                let head_only = self.settings.claim_policy == ClaimPolicy::NextOnly;
                if head_only && self.rank(&entry).await? != 1 {
                    return Err(out_of_turn());
                }
                Transition {
                    from: QueueStatus::Waiting,
                    to: QueueStatus::InProgress,
                    expected_doctor: None,
                    assign_doctor: Some(doctor_id),
                    head_only,
                }
            }
            (QueueStatus::Waiting, QueueStatus::Completed) => Transition {
                from: QueueStatus::Waiting,
                to: QueueStatus::Completed,
                expected_doctor: None,
                assign_doctor: None,
                head_only: false,
            },
            (QueueStatus::InProgress, QueueStatus::Completed) => {
                if entry.doctor_id != Some(doctor_id) {
                    return Err(QueueError::Unauthorized(
                        "only the assigned doctor can complete this patient".to_string(),
                    ));
                }
                Transition {
                    from: QueueStatus::InProgress,
                    to: QueueStatus::Completed,
                    expected_doctor: Some(doctor_id),
                    assign_doctor: None,
                    head_only: false,
                }
            }
            (from, to) => return Err(QueueError::InvalidTransition { from, to }),
        };

        match self.store.transition(entry_id, transition).await? {
            Some(updated) => {
                info!(
                    queue_id = %entry_id,
                    from = %transition.from,
                    to = %transition.to,
                    doctor = doctor_id,
                    "queue status changed"
                );
                Ok(StatusChange::Applied(updated))
            }
            None => {
                // Lost a race: accept it if the entry already ended up where we wanted.
                let current = self.entry(entry_id).await?;
                let settled = current.status == target
                    && (target != QueueStatus::InProgress
                        || current.doctor_id == Some(doctor_id));
                if settled {
                    Ok(StatusChange::Unchanged(current))
                } else if transition.head_only && current.status == QueueStatus::Waiting {
                    Err(out_of_turn())
                } else {
                    warn!(
                        queue_id = %entry_id,
                        status = %current.status,
                        "concurrent queue update"
                    );
                    Err(QueueError::Conflict(format!(
                        "queue entry changed concurrently and is now {}",
                        current.status
                    )))
                }
            }
        }
    }

    pub async fn list_queue(
        &self,
        hospital_id: HospitalId,
        doctor_id: DoctorId,
    ) -> Result<Vec<QueueListing>> {
        self.authorize_doctor(doctor_id, hospital_id).await?;
        self.store.list_active(hospital_id, doctor_id).await
    }

    pub async fn list_history(
        &self,
        hospital_id: HospitalId,
        doctor_id: DoctorId,
        limit: Option<i64>,
    ) -> Result<Vec<QueueListing>> {
        self.authorize_doctor(doctor_id, hospital_id).await?;
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).max(0);
        self.store.list_history(hospital_id, limit).await
    }

    pub async fn summary_details(
        &self,
        summary_id: Uuid,
        doctor_id: DoctorId,
    ) -> Result<SummaryDetails> {
        let summary = self.summary_for_doctor(summary_id, doctor_id).await?;
        let conversation = self.store.transcript(&summary.conversation_id).await?;
        Ok(SummaryDetails {
            summary,
            conversation,
        })
    }

    pub async fn review_summary(
        &self,
        summary_id: Uuid,
        status: &str,
        doctor_id: DoctorId,
    ) -> Result<Summary> {
        let status: SummaryStatus = status.parse()?;
        self.summary_for_doctor(summary_id, doctor_id).await?;
        self.store
            .set_summary_status(summary_id, status)
            .await?
            .ok_or_else(|| QueueError::not_found("summary", summary_id))
    }

    async fn summary_for_doctor(&self, summary_id: Uuid, doctor_id: DoctorId) -> Result<Summary> {
        let summary = self
            .store
            .summary(summary_id)
            .await?
            .ok_or_else(|| QueueError::not_found("summary", summary_id))?;
        let entry = self
            .store
            .queue_entry_for_summary(summary_id)
            .await?
            .ok_or_else(|| QueueError::not_found("queue entry for summary", summary_id))?;
        self.authorize_doctor(doctor_id, entry.hospital_id).await?;
        Ok(summary)
    }

    async fn entry(&self, entry_id: Uuid) -> Result<QueueEntry> {
        self.store
            .queue_entry(entry_id)
            .await?
            .ok_or_else(|| QueueError::not_found("queue entry", entry_id))
    }

    async fn authorize_doctor(
        &self,
        doctor_id: DoctorId,
        hospital_id: HospitalId,
    ) -> Result<Doctor> {
        let doctor = self
            .store
            .doctor(doctor_id)
            .await?
            .ok_or_else(|| QueueError::not_found("doctor", doctor_id))?;
        if doctor.hospital_id != hospital_id {
            warn!(
                doctor = doctor_id,
                hospital = hospital_id,
                "doctor acting outside their hospital"
            );
            return Err(QueueError::Unauthorized(format!(
                "doctor {doctor_id} does not work at hospital {hospital_id}"
            )));
        }
        Ok(doctor)
    }
}

fn out_of_turn() -> QueueError {
    QueueError::Unauthorized("only the next patient in line may be claimed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::{instant_retries, FlakyClassifier};
    use crate::memory::MemoryQueueStore;
    use crate::models::{ChatTurn, TriageCode};
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: Arc<MemoryQueueStore>,
        hospital: HospitalId,
        doctor: DoctorId,
        other_doctor: DoctorId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryQueueStore::new());
        let hospital = store.add_hospital("MediQ General", Some("12 Harbor Road")).await;
        let doctor = store.add_doctor("Amara Okafor", hospital.id).await;
        let other_doctor = store.add_doctor("Tunde Bello", hospital.id).await;
        Fixture {
            store,
            hospital: hospital.id,
            doctor: doctor.id,
            other_doctor: other_doctor.id,
        }
    }

    fn service(fixture: &Fixture, answer: TriageCode, failures: u32) -> QueueService {
        QueueService::new(
            fixture.store.clone(),
            Arc::new(FlakyClassifier::new(failures, answer)),
            QueueSettings {
                retry: instant_retries(),
                ..QueueSettings::default()
            },
        )
    }

    fn guest(hospital: HospitalId, name: &str) -> SubmissionRequest {
        SubmissionRequest {
            guest_name: Some(name.to_string()),
            guest_contact: Some("+234 800 000 0000".to_string()),
            hospital_id: Some(hospital),
            conversation_id: format!("conv-{}", Uuid::new_v4()),
            messages: vec![
                ChatTurn::assistant("How can I help?"),
                ChatTurn::patient(format!("{name} has a persistent cough")),
            ],
            ..Default::default()
        }
    }

    fn assigned(outcome: CallNextOutcome) -> QueueEntry {
        match outcome {
            CallNextOutcome::Assigned(entry) => entry,
            CallNextOutcome::NoPatientsWaiting => panic!("expected a patient"),
        }
    }

    async fn submit(fixture: &Fixture, code: TriageCode, name: &str) -> SubmissionReceipt {
        service(fixture, code, 0)
            .submit(guest(fixture.hospital, name))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn red_guest_jumps_ahead_of_earlier_greens() {
        let fx = fixture().await;
        submit(&fx, TriageCode::Green, "Green One").await;
        submit(&fx, TriageCode::Green, "Green Two").await;

        let receipt = submit(&fx, TriageCode::Red, "Red Guest").await;
        assert_eq!(receipt.triage_code, TriageCode::Red);
        assert_eq!(receipt.position, 1);
        assert_eq!(receipt.estimated_wait_minutes, 0);
    }

    #[tokio::test]
    async fn green_yellow_green_positions() {
        let fx = fixture().await;
        let first = submit(&fx, TriageCode::Green, "G1").await;
        let second = submit(&fx, TriageCode::Yellow, "Y2").await;
        let third = submit(&fx, TriageCode::Green, "G3").await;

        // Y2 overtakes G1 on arrival, so G3 joins behind both of them.
        assert_eq!(
            (first.position, second.position, third.position),
            (1, 1, 3)
        );
        assert_eq!(third.estimated_wait_minutes, 30);

        let svc = service(&fx, TriageCode::Green, 0);
        let queue = svc.list_queue(fx.hospital, fx.doctor).await.unwrap();
        let order: Vec<Uuid> = queue.iter().map(|row| row.entry.id).collect();
        assert_eq!(order, vec![second.queue_id, first.queue_id, third.queue_id]);

        assert_eq!(svc.position(second.queue_id).await.unwrap(), Some(1));
        assert_eq!(svc.position(first.queue_id).await.unwrap(), Some(2));
        assert_eq!(svc.position(third.queue_id).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn classifier_outage_still_queues_patient_as_yellow() {
        let fx = fixture().await;
        let svc = service(&fx, TriageCode::Red, 3);
        let receipt = svc.submit(guest(fx.hospital, "Outage Guest")).await.unwrap();

        assert!(receipt.degraded_triage);
        assert_eq!(receipt.triage_code, TriageCode::Yellow);
        assert_eq!(receipt.position, 1);

        let summary = fx.store.summary(receipt.summary_id).await.unwrap().unwrap();
        assert!(summary
            .summary_text
            .contains("Outage Guest has a persistent cough"));
        let entry = fx.store.queue_entry(receipt.queue_id).await.unwrap().unwrap();
        assert_eq!(entry.priority, 2);
    }

    #[tokio::test]
    async fn submission_saves_transcript() {
        let fx = fixture().await;
        let request = guest(fx.hospital, "Chatty");
        let conversation_id = request.conversation_id.clone();
        submit_request(&fx, request).await;
        let turns = fx.store.transcript(&conversation_id).await.unwrap();
        assert_eq!(turns.len(), 2);
    }

    async fn submit_request(fx: &Fixture, request: SubmissionRequest) -> SubmissionReceipt {
        service(fx, TriageCode::Green, 0).submit(request).await.unwrap()
    }

    #[tokio::test]
    async fn submission_rejects_unknown_hospital_and_patient() {
        let fx = fixture().await;
        let svc = service(&fx, TriageCode::Green, 0);

        let err = svc.submit(guest(9_999, "Lost")).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound { kind: "hospital", .. }));

        let request = SubmissionRequest {
            patient_id: Some(4_242),
            guest_name: None,
            ..guest(fx.hospital, "unused")
        };
        let err = svc.submit(request).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound { kind: "patient", .. }));
    }

    #[tokio::test]
    async fn duplicate_conversation_is_rejected() {
        let fx = fixture().await;
        let svc = service(&fx, TriageCode::Green, 0);
        let request = guest(fx.hospital, "Twice");
        svc.submit(request.clone()).await.unwrap();
        let err = svc.submit(request).await.unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
    }

    #[tokio::test]
    async fn resubmitted_conversation_keeps_one_transcript() {
        let fx = fixture().await;
        let classifier = Arc::new(FlakyClassifier::new(0, TriageCode::Green));
        let svc = QueueService::new(
            fx.store.clone(),
            classifier.clone(),
            QueueSettings {
                retry: instant_retries(),
                ..QueueSettings::default()
            },
        );
        let request = guest(fx.hospital, "Retry");
        let conversation_id = request.conversation_id.clone();

        svc.submit(request.clone()).await.unwrap();
        let err = svc.submit(request).await.unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));

        let turns = fx.store.transcript(&conversation_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        let queue = svc.list_queue(fx.hospital, fx.doctor).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn staff_accounts_cannot_be_queued_as_patients() {
        let fx = fixture().await;
        let admin = fx
            .store
            .add_user("Desk Admin", "desk@mediq.test", Role::Admin, Some(fx.hospital))
            .await;
        let svc = service(&fx, TriageCode::Green, 0);

        let err = svc
            .submit(SubmissionRequest {
                patient_id: Some(admin.id),
                guest_name: None,
                ..guest(fx.hospital, "unused")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(svc.list_queue(fx.hospital, fx.doctor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_view_reports_names_and_position() {
        let fx = fixture().await;
        let patient = fx
            .store
            .add_user("Ngozi Eze", "ngozi@example.com", Role::Patient, None)
            .await;
        let svc = service(&fx, TriageCode::Yellow, 0);

        let registered = svc
            .submit(SubmissionRequest {
                patient_id: Some(patient.id),
                guest_name: None,
                ..guest(fx.hospital, "unused")
            })
            .await
            .unwrap();
        let view = svc.queue_status(registered.queue_id).await.unwrap();
        assert_eq!(view.patient_name, "Ngozi Eze");
        assert_eq!(view.hospital_name, "MediQ General");
        assert_eq!(view.hospital_address.as_deref(), Some("12 Harbor Road"));
        assert_eq!(view.position, Some(1));
        assert_eq!(view.estimated_wait_minutes, Some(0));
        assert_eq!(view.triage_code, TriageCode::Yellow);
        assert_eq!(view.priority, 2);

        let guest_receipt = submit(&fx, TriageCode::Yellow, "Walk In").await;
        let view = svc.queue_status(guest_receipt.queue_id).await.unwrap();
        assert_eq!(view.patient_name, "Walk In");
        assert_eq!(view.position, Some(2));
        assert_eq!(view.estimated_wait_minutes, Some(15));

        let missing = svc.queue_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(missing, QueueError::NotFound { .. }));
    }

    #[tokio::test]
    async fn call_next_takes_highest_priority_then_oldest() {
        let fx = fixture().await;
        let green = submit(&fx, TriageCode::Green, "G").await;
        let yellow = submit(&fx, TriageCode::Yellow, "Y").await;
        let svc = service(&fx, TriageCode::Green, 0);

        let first = assigned(svc.call_next(fx.hospital, fx.doctor).await.unwrap());
        assert_eq!(first.id, yellow.queue_id);
        assert_eq!(first.status, QueueStatus::InProgress);
        assert_eq!(first.doctor_id, Some(fx.doctor));

        let second = assigned(svc.call_next(fx.hospital, fx.other_doctor).await.unwrap());
        assert_eq!(second.id, green.queue_id);

        assert!(matches!(
            svc.call_next(fx.hospital, fx.doctor).await.unwrap(),
            CallNextOutcome::NoPatientsWaiting
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_call_next_hands_out_distinct_patients() {
        let fx = fixture().await;
        let mut doctors = Vec::new();
        for i in 0..8 {
            doctors.push(fx.store.add_doctor(&format!("Doctor {i}"), fx.hospital).await.id);
        }
        for i in 0..3 {
            submit(&fx, TriageCode::Green, &format!("Patient {i}")).await;
        }

        let svc = Arc::new(service(&fx, TriageCode::Green, 0));
        let mut handles = Vec::new();
        for doctor in doctors {
            let svc = svc.clone();
            let hospital = fx.hospital;
            handles.push(tokio::spawn(async move {
                svc.call_next(hospital, doctor).await.unwrap()
            }));
        }

        let mut claimed = Vec::new();
        let mut empty = 0;
        for handle in handles {
            match handle.await.unwrap() {
                CallNextOutcome::Assigned(entry) => claimed.push(entry.id),
                CallNextOutcome::NoPatientsWaiting => empty += 1,
            }
        }

        assert_eq!(claimed.len(), 3);
        assert_eq!(empty, 5);
        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 3);
    }

    #[tokio::test]
    async fn completing_twice_is_a_no_op() {
        let fx = fixture().await;
        let receipt = submit(&fx, TriageCode::Yellow, "Once").await;
        let svc = service(&fx, TriageCode::Green, 0);
        svc.call_next(fx.hospital, fx.doctor).await.unwrap();

        let first = svc
            .set_status(receipt.queue_id, "completed", fx.doctor)
            .await
            .unwrap();
        assert!(matches!(first, StatusChange::Applied(_)));
        assert_eq!(first.entry().doctor_id, Some(fx.doctor));

        let second = svc
            .set_status(receipt.queue_id, "completed", fx.doctor)
            .await
            .unwrap();
        assert!(matches!(second, StatusChange::Unchanged(_)));

        let history = svc.list_history(fx.hospital, fx.doctor, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].entry.doctor_id, Some(fx.doctor));
    }

    #[tokio::test]
    async fn only_the_assigned_doctor_completes() {
        let fx = fixture().await;
        let receipt = submit(&fx, TriageCode::Red, "Mine").await;
        let svc = service(&fx, TriageCode::Green, 0);
        svc.call_next(fx.hospital, fx.doctor).await.unwrap();

        let err = svc
            .set_status(receipt.queue_id, "completed", fx.other_doctor)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unauthorized(_)));

        let entry = fx.store.queue_entry(receipt.queue_id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::InProgress);
    }

    #[tokio::test]
    async fn doctor_can_claim_a_waiting_patient_directly() {
        let fx = fixture().await;
        submit(&fx, TriageCode::Red, "First").await;
        let later = submit(&fx, TriageCode::Green, "Later").await;
        let svc = service(&fx, TriageCode::Green, 0);

        let change = svc
            .set_status(later.queue_id, "in-progress", fx.other_doctor)
            .await
            .unwrap();
        assert!(matches!(change, StatusChange::Applied(_)));
        assert_eq!(change.entry().doctor_id, Some(fx.other_doctor));

        let err = svc
            .set_status(later.queue_id, "in-progress", fx.doctor)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn next_only_policy_blocks_out_of_order_claims() {
        let fx = fixture().await;
        let head = submit(&fx, TriageCode::Red, "Head").await;
        let tail = submit(&fx, TriageCode::Green, "Tail").await;
        let svc = QueueService::new(
            fx.store.clone(),
            Arc::new(FlakyClassifier::new(0, TriageCode::Green)),
            QueueSettings {
                claim_policy: ClaimPolicy::NextOnly,
                retry: instant_retries(),
                ..QueueSettings::default()
            },
        );

        let err = svc
            .set_status(tail.queue_id, "in-progress", fx.doctor)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unauthorized(_)));
        assert!(svc
            .set_status(head.queue_id, "in-progress", fx.doctor)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn head_only_claim_is_rechecked_by_the_store() {
        let fx = fixture().await;
        let green = submit(&fx, TriageCode::Green, "Was First").await;
        // A red arrival lands between the service's rank check and the update.
        let red = submit(&fx, TriageCode::Red, "Arrived Later").await;
        let claim = Transition {
            from: QueueStatus::Waiting,
            to: QueueStatus::InProgress,
            expected_doctor: None,
            assign_doctor: Some(fx.doctor),
            head_only: true,
        };

        assert!(fx.store.transition(green.queue_id, claim).await.unwrap().is_none());
        let entry = fx.store.queue_entry(green.queue_id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Waiting);

        let claimed = fx.store.transition(red.queue_id, claim).await.unwrap().unwrap();
        assert_eq!(claimed.status, QueueStatus::InProgress);
        assert_eq!(claimed.doctor_id, Some(fx.doctor));
    }

    #[tokio::test]
    async fn waiting_entry_can_be_completed_directly() {
        let fx = fixture().await;
        let receipt = submit(&fx, TriageCode::Green, "Left").await;
        let svc = service(&fx, TriageCode::Green, 0);

        let change = svc
            .set_status(receipt.queue_id, "completed", fx.doctor)
            .await
            .unwrap();
        assert_eq!(change.entry().status, QueueStatus::Completed);
        assert_eq!(change.entry().doctor_id, None);
        assert_eq!(svc.position(receipt.queue_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn backward_and_invalid_statuses_are_rejected() {
        let fx = fixture().await;
        let receipt = submit(&fx, TriageCode::Green, "Back").await;
        let svc = service(&fx, TriageCode::Green, 0);

        let err = svc
            .set_status(receipt.queue_id, "finished", fx.doctor)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        svc.call_next(fx.hospital, fx.doctor).await.unwrap();
        let err = svc
            .set_status(receipt.queue_id, "waiting", fx.doctor)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: QueueStatus::InProgress,
                to: QueueStatus::Waiting
            }
        ));
    }

    #[tokio::test]
    async fn doctors_from_other_hospitals_are_rejected_before_mutation() {
        let fx = fixture().await;
        let receipt = submit(&fx, TriageCode::Red, "Local").await;
        let elsewhere = fx.store.add_hospital("Elsewhere Clinic", None).await;
        let outsider = fx.store.add_doctor("Outside Doctor", elsewhere.id).await;
        let svc = service(&fx, TriageCode::Green, 0);

        let err = svc.call_next(fx.hospital, outsider.id).await.unwrap_err();
        assert!(matches!(err, QueueError::Unauthorized(_)));
        let err = svc
            .set_status(receipt.queue_id, "in-progress", outsider.id)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unauthorized(_)));
        assert!(svc.list_queue(fx.hospital, outsider.id).await.is_err());

        let entry = fx.store.queue_entry(receipt.queue_id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Waiting);
        assert_eq!(entry.doctor_id, None);
    }

    #[tokio::test]
    async fn queue_hides_other_doctors_patients() {
        let fx = fixture().await;
        submit(&fx, TriageCode::Red, "Taken").await;
        submit(&fx, TriageCode::Yellow, "Mine").await;
        submit(&fx, TriageCode::Green, "Waiting").await;
        let svc = service(&fx, TriageCode::Green, 0);

        svc.call_next(fx.hospital, fx.other_doctor).await.unwrap();
        svc.call_next(fx.hospital, fx.doctor).await.unwrap();

        let mine = svc.list_queue(fx.hospital, fx.doctor).await.unwrap();
        let names: Vec<&str> = mine.iter().map(|row| row.patient_name.as_str()).collect();
        assert_eq!(names, vec!["Mine", "Waiting"]);

        let theirs = svc.list_queue(fx.hospital, fx.other_doctor).await.unwrap();
        let names: Vec<&str> = theirs.iter().map(|row| row.patient_name.as_str()).collect();
        assert_eq!(names, vec!["Taken", "Waiting"]);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_bounded() {
        let fx = fixture().await;
        let svc = service(&fx, TriageCode::Green, 0);
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(submit(&fx, TriageCode::Green, &format!("Done {i}")).await.queue_id);
        }
        for _ in 0..4 {
            let entry = assigned(svc.call_next(fx.hospital, fx.doctor).await.unwrap());
            svc.set_status(entry.id, "completed", fx.doctor).await.unwrap();
        }

        let history = svc.list_history(fx.hospital, fx.doctor, Some(3)).await.unwrap();
        let seen: Vec<Uuid> = history.iter().map(|row| row.entry.id).collect();
        assert_eq!(seen, vec![ids[3], ids[2], ids[1]]);
        assert!(svc.list_queue(fx.hospital, fx.doctor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summaries_can_be_reviewed_with_their_conversation() {
        let fx = fixture().await;
        let receipt = submit(&fx, TriageCode::Yellow, "Reviewed").await;
        let svc = service(&fx, TriageCode::Green, 0);

        let details = svc
            .summary_details(receipt.summary_id, fx.doctor)
            .await
            .unwrap();
        assert_eq!(details.conversation.len(), 2);
        assert_eq!(details.summary.status, SummaryStatus::New);

        let updated = svc
            .review_summary(receipt.summary_id, "follow-up", fx.doctor)
            .await
            .unwrap();
        assert_eq!(updated.status, SummaryStatus::FollowUp);
        assert_eq!(updated.triage_code, TriageCode::Yellow);

        assert!(svc
            .review_summary(receipt.summary_id, "archived", fx.doctor)
            .await
            .is_err());
    }
}
