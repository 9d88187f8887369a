use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::error::Result;
use crate::models::{
    ChatTurn, Doctor, DoctorId, Hospital, HospitalId, NewIntake, QueueEntry, QueueListing,
    StoredTurn, Summary, SummaryStatus, Transition, User, UserId,
};

/// Persistence seam for the queue lifecycle.
///
/// Implementations must make `claim_next` and `transition` atomic with respect
/// to concurrent callers, and must persist a summary and its queue entry
/// together or not at all.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn hospital(&self, id: HospitalId) -> Result<Option<Hospital>>;

    async fn user(&self, id: UserId) -> Result<Option<User>>;

    async fn doctor(&self, id: DoctorId) -> Result<Option<Doctor>>;

    async fn save_transcript(
        &self,
        conversation_id: &str,
        user_id: Option<UserId>,
        turns: &[ChatTurn],
    ) -> Result<()>;

    async fn transcript(&self, conversation_id: &str) -> Result<Vec<StoredTurn>>;

    async fn create_intake(&self, intake: NewIntake) -> Result<(Summary, QueueEntry)>;

    async fn queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>>;

    async fn queue_entry_for_summary(&self, summary_id: Uuid) -> Result<Option<QueueEntry>>;

    async fn summary(&self, id: Uuid) -> Result<Option<Summary>>;

    async fn summary_for_conversation(&self, conversation_id: &str) -> Result<Option<Summary>>;

    async fn set_summary_status(&self, id: Uuid, status: SummaryStatus)
        -> Result<Option<Summary>>;

    /// Waiting entries in the same hospital ranked ahead of `entry`.
    async fn count_waiting_ahead(&self, entry: &QueueEntry) -> Result<u64>;

    /// Take the head of the hospital's waiting line for `doctor_id`.
    async fn claim_next(
        &self,
        hospital_id: HospitalId,
        doctor_id: DoctorId,
    ) -> Result<Option<QueueEntry>>;

    /// Apply `transition` if its preconditions, including `head_only`, still
    /// hold; `None` otherwise.
    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Option<QueueEntry>>;

    async fn list_active(
        &self,
        hospital_id: HospitalId,
        doctor_id: DoctorId,
    ) -> Result<Vec<QueueListing>>;

    async fn list_history(&self, hospital_id: HospitalId, limit: i64)
        -> Result<Vec<QueueListing>>;
}

#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn hospital(&self, id: HospitalId) -> Result<Option<Hospital>> {
        Ok(db::fetch_hospital(&self.pool, id).await?)
    }

    async fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(db::fetch_user(&self.pool, id).await?)
    }

    async fn doctor(&self, id: DoctorId) -> Result<Option<Doctor>> {
        Ok(db::fetch_doctor(&self.pool, id).await?)
    }

    async fn save_transcript(
        &self,
        conversation_id: &str,
        user_id: Option<UserId>,
        turns: &[ChatTurn],
    ) -> Result<()> {
        Ok(db::insert_chat_turns(&self.pool, conversation_id, user_id, turns).await?)
    }

    async fn transcript(&self, conversation_id: &str) -> Result<Vec<StoredTurn>> {
        Ok(db::fetch_chat_turns(&self.pool, conversation_id).await?)
    }

    async fn create_intake(&self, intake: NewIntake) -> Result<(Summary, QueueEntry)> {
        db::insert_intake(&self.pool, &intake).await
    }

    async fn queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        Ok(db::fetch_queue_entry(&self.pool, id).await?)
    }

    async fn queue_entry_for_summary(&self, summary_id: Uuid) -> Result<Option<QueueEntry>> {
        Ok(db::fetch_queue_entry_for_summary(&self.pool, summary_id).await?)
    }

    async fn summary(&self, id: Uuid) -> Result<Option<Summary>> {
        Ok(db::fetch_summary(&self.pool, id).await?)
    }

    async fn summary_for_conversation(&self, conversation_id: &str) -> Result<Option<Summary>> {
        Ok(db::fetch_summary_for_conversation(&self.pool, conversation_id).await?)
    }

    async fn set_summary_status(
        &self,
        id: Uuid,
        status: SummaryStatus,
    ) -> Result<Option<Summary>> {
        Ok(db::update_summary_status(&self.pool, id, status).await?)
    }

    async fn count_waiting_ahead(&self, entry: &QueueEntry) -> Result<u64> {
        Ok(db::count_waiting_ahead(&self.pool, entry).await?)
    }

    async fn claim_next(
        &self,
        hospital_id: HospitalId,
        doctor_id: DoctorId,
    ) -> Result<Option<QueueEntry>> {
        Ok(db::claim_next_waiting(&self.pool, hospital_id, doctor_id).await?)
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Option<QueueEntry>> {
        Ok(db::apply_transition(&self.pool, id, transition).await?)
    }

    async fn list_active(
        &self,
        hospital_id: HospitalId,
        doctor_id: DoctorId,
    ) -> Result<Vec<QueueListing>> {
        Ok(db::fetch_active_queue(&self.pool, hospital_id, doctor_id).await?)
    }

    async fn list_history(
        &self,
        hospital_id: HospitalId,
        limit: i64,
    ) -> Result<Vec<QueueListing>> {
        Ok(db::fetch_history(&self.pool, hospital_id, limit).await?)
    }
}
