use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ParseEnumError, QueueError};

pub type HospitalId = i64;
pub type UserId = i64;
pub type DoctorId = i64;

/// Urgency assigned by the triage classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageCode {
    Red,
    Yellow,
    Green,
}

impl TriageCode {
    pub const ALL: [TriageCode; 3] = [TriageCode::Red, TriageCode::Yellow, TriageCode::Green];

    pub fn as_str(self) -> &'static str {
        match self {
            TriageCode::Red => "red",
            TriageCode::Yellow => "yellow",
            TriageCode::Green => "green",
        }
    }

    /// Lenient parse used at the classifier boundary: anything that is not a
    /// known code becomes yellow.
    pub fn coerce(value: &str) -> TriageCode {
        value.parse().unwrap_or(TriageCode::Yellow)
    }
}

impl FromStr for TriageCode {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "red" => Ok(TriageCode::Red),
            "yellow" => Ok(TriageCode::Yellow),
            "green" => Ok(TriageCode::Green),
            _ => Err(ParseEnumError {
                kind: "triage code",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for TriageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    Waiting,
    InProgress,
    Completed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Waiting => "waiting",
            QueueStatus::InProgress => "in-progress",
            QueueStatus::Completed => "completed",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "waiting" => Ok(QueueStatus::Waiting),
            "in-progress" => Ok(QueueStatus::InProgress),
            "completed" => Ok(QueueStatus::Completed),
            _ => Err(ParseEnumError {
                kind: "queue status",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SummaryStatus {
    New,
    Reviewed,
    FollowUp,
}

impl SummaryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryStatus::New => "new",
            SummaryStatus::Reviewed => "reviewed",
            SummaryStatus::FollowUp => "follow-up",
        }
    }
}

impl FromStr for SummaryStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "new" => Ok(SummaryStatus::New),
            "reviewed" => Ok(SummaryStatus::Reviewed),
            "follow-up" => Ok(SummaryStatus::FollowUp),
            _ => Err(ParseEnumError {
                kind: "summary status",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Doctor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            "admin" => Ok(Role::Admin),
            _ => Err(ParseEnumError {
                kind: "role",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored a chat turn. Accepts the chat widget's `user`/`bot` labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    #[serde(alias = "user")]
    Patient,
    #[serde(alias = "bot")]
    Assistant,
}

impl Speaker {
    pub fn as_str(self) -> &'static str {
        match self {
            Speaker::Patient => "patient",
            Speaker::Assistant => "assistant",
        }
    }
}

impl FromStr for Speaker {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "patient" | "user" => Ok(Speaker::Patient),
            "assistant" | "bot" => Ok(Speaker::Assistant),
            _ => Err(ParseEnumError {
                kind: "speaker",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    #[serde(alias = "sender")]
    pub speaker: Speaker,
    pub text: String,
}

impl ChatTurn {
    pub fn patient(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Patient,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTurn {
    pub id: Uuid,
    pub user_id: Option<UserId>,
    pub conversation_id: String,
    pub speaker: Speaker,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A queue entry is attributable either to a registered patient or to a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatientIdentity {
    Registered(UserId),
    Guest {
        name: String,
        contact: Option<String>,
    },
}

impl PatientIdentity {
    pub fn patient_id(&self) -> Option<UserId> {
        match self {
            PatientIdentity::Registered(id) => Some(*id),
            PatientIdentity::Guest { .. } => None,
        }
    }

    pub fn guest_name(&self) -> Option<&str> {
        match self {
            PatientIdentity::Registered(_) => None,
            PatientIdentity::Guest { name, .. } => Some(name),
        }
    }

    pub fn guest_contact(&self) -> Option<&str> {
        match self {
            PatientIdentity::Registered(_) => None,
            PatientIdentity::Guest { contact, .. } => contact.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Hospital {
    pub id: HospitalId,
    pub name: String,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub full_name: Option<String>,
    pub email: String,
    pub role: Role,
    pub hospital_id: Option<HospitalId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Doctor {
    pub id: DoctorId,
    pub user_id: UserId,
    pub hospital_id: HospitalId,
    pub specialty: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub id: Uuid,
    pub patient_id: Option<UserId>,
    pub guest_name: Option<String>,
    pub guest_contact: Option<String>,
    pub conversation_id: String,
    pub summary_text: String,
    pub triage_code: TriageCode,
    pub suggested_next_steps: String,
    pub status: SummaryStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: Uuid,
    /// Store-assigned insertion counter; breaks `created_at` ties.
    pub arrival_seq: i64,
    pub patient_id: Option<UserId>,
    pub guest_name: Option<String>,
    pub guest_contact: Option<String>,
    pub hospital_id: HospitalId,
    pub summary_id: Uuid,
    pub status: QueueStatus,
    pub priority: i16,
    pub doctor_id: Option<DoctorId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the store needs to persist one submission's summary and entry.
#[derive(Debug, Clone)]
pub struct NewIntake {
    pub identity: PatientIdentity,
    pub hospital_id: HospitalId,
    pub conversation_id: String,
    pub summary_text: String,
    pub triage_code: TriageCode,
    pub suggested_next_steps: String,
}

/// A conditional status update: applied only while the entry is still in
/// `from` (and, when set, still assigned to `expected_doctor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: QueueStatus,
    pub to: QueueStatus,
    pub expected_doctor: Option<DoctorId>,
    pub assign_doctor: Option<DoctorId>,
    /// Only apply while no other waiting entry in the hospital ranks ahead.
    pub head_only: bool,
}

/// Dashboard row: an entry joined with its patient's display name and triage code.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueListing {
    #[serde(flatten)]
    pub entry: QueueEntry,
    pub patient_name: String,
    pub triage_code: TriageCode,
}

/// Raw submission payload as it arrives from the chat front end.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRequest {
    pub patient_id: Option<UserId>,
    pub guest_name: Option<String>,
    pub guest_contact: Option<String>,
    pub hospital_id: Option<HospitalId>,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
}

/// A submission that passed validation.
#[derive(Debug, Clone)]
pub struct Intake {
    pub identity: PatientIdentity,
    pub hospital_id: HospitalId,
    pub conversation_id: String,
    pub messages: Vec<ChatTurn>,
}

impl SubmissionRequest {
    pub fn validate(self) -> Result<Intake, QueueError> {
        let hospital_id = self
            .hospital_id
            .ok_or_else(|| QueueError::validation("missing hospitalId"))?;

        let guest_name = self
            .guest_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let guest_contact = self
            .guest_contact
            .map(|contact| contact.trim().to_string())
            .filter(|contact| !contact.is_empty());

        let identity = match (self.patient_id, guest_name) {
            (Some(_), Some(_)) => {
                return Err(QueueError::validation(
                    "provide either patientId or guestName, not both",
                ))
            }
            (Some(patient_id), None) => PatientIdentity::Registered(patient_id),
            (None, Some(name)) => PatientIdentity::Guest {
                name,
                contact: guest_contact,
            },
            (None, None) => {
                return Err(QueueError::validation(
                    "either patientId or guestName is required",
                ))
            }
        };

        let conversation_id = self.conversation_id.trim().to_string();
        if conversation_id.is_empty() {
            return Err(QueueError::validation("missing conversationId"));
        }
        if self.messages.is_empty() {
            return Err(QueueError::validation("conversation has no messages"));
        }

        Ok(Intake {
            identity,
            hospital_id,
            conversation_id,
            messages: self.messages,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    pub queue_id: Uuid,
    pub summary_id: Uuid,
    pub position: u32,
    pub estimated_wait_minutes: u32,
    pub triage_code: TriageCode,
    pub degraded_triage: bool,
}

/// Patient-facing status of one queue entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusView {
    pub queue_id: Uuid,
    /// Present only while the entry is waiting.
    pub position: Option<u32>,
    pub estimated_wait_minutes: Option<u32>,
    pub status: QueueStatus,
    pub triage_code: TriageCode,
    pub patient_name: String,
    pub hospital_name: String,
    pub hospital_address: Option<String>,
    pub priority: i16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryDetails {
    pub summary: Summary,
    pub conversation: Vec<StoredTurn>,
}
