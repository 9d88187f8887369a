//! Administrative mutations: hospitals, staff and user accounts.
//!
//! Every operation takes an [`AdminActor`], which can only be obtained by
//! checking the acting user's role, so authorization happens before any write.

use sqlx::PgPool;
use tracing::{info, warn};

use crate::db;
use crate::error::{QueueError, Result};
use crate::models::{Doctor, Hospital, HospitalId, Role, User, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminActor {
    user_id: UserId,
}

impl AdminActor {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

pub fn require_admin(user: Option<&User>, user_id: UserId) -> Result<AdminActor> {
    match user {
        None => Err(QueueError::not_found("user", user_id)),
        Some(user) if user.role == Role::Admin => Ok(AdminActor { user_id: user.id }),
        Some(user) => Err(QueueError::Unauthorized(format!(
            "user {} is a {}, not an admin",
            user.id, user.role
        ))),
    }
}

pub async fn authorize_admin(pool: &PgPool, user_id: UserId) -> Result<AdminActor> {
    let user = db::fetch_user(pool, user_id).await?;
    require_admin(user.as_ref(), user_id)
}

fn required(value: &str, field: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(QueueError::validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

pub fn validate_email(email: &str) -> Result<String> {
    let email = required(email, "email")?.to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(QueueError::validation(format!("invalid email address: {email}"))),
    }
}

pub async fn create_hospital(
    pool: &PgPool,
    actor: &AdminActor,
    name: &str,
    address: &str,
) -> Result<Hospital> {
    let name = required(name, "name")?;
    let address = required(address, "address")?;
    let hospital = db::insert_hospital(pool, &name, Some(&address)).await?;
    info!(admin = actor.user_id, hospital = hospital.id, "hospital created");
    Ok(hospital)
}

/// Removes the hospital and, through the schema's cascades, its doctors,
/// staff accounts and queue.
pub async fn delete_hospital(pool: &PgPool, actor: &AdminActor, id: HospitalId) -> Result<()> {
    if db::delete_hospital(pool, id).await? == 0 {
        return Err(QueueError::not_found("hospital", id));
    }
    warn!(admin = actor.user_id, hospital = id, "hospital deleted with its staff and queue");
    Ok(())
}

pub async fn create_user(
    pool: &PgPool,
    actor: &AdminActor,
    full_name: &str,
    email: &str,
    role: Role,
    hospital_id: Option<HospitalId>,
) -> Result<User> {
    let full_name = required(full_name, "full name")?;
    let email = validate_email(email)?;
    if role == Role::Doctor {
        return Err(QueueError::validation(
            "doctors must be created with their hospital record",
        ));
    }
    let user = db::insert_user(pool, &full_name, &email, role, hospital_id).await?;
    info!(admin = actor.user_id, user = user.id, role = %role, "user created");
    Ok(user)
}

pub async fn create_doctor(
    pool: &PgPool,
    actor: &AdminActor,
    full_name: &str,
    email: &str,
    hospital_id: HospitalId,
    specialty: Option<&str>,
) -> Result<(User, Doctor)> {
    let full_name = required(full_name, "full name")?;
    let email = validate_email(email)?;
    if db::fetch_hospital(pool, hospital_id).await?.is_none() {
        return Err(QueueError::not_found("hospital", hospital_id));
    }
    let specialty = specialty.map(str::trim).filter(|s| !s.is_empty());
    let (user, doctor) =
        db::insert_doctor(pool, &full_name, &email, hospital_id, specialty).await?;
    info!(admin = actor.user_id, doctor = doctor.id, hospital = hospital_id, "doctor created");
    Ok((user, doctor))
}

pub async fn delete_user(pool: &PgPool, actor: &AdminActor, id: UserId) -> Result<()> {
    if id == actor.user_id {
        return Err(QueueError::validation("admins cannot delete their own account"));
    }
    if db::delete_user(pool, id).await? == 0 {
        return Err(QueueError::not_found("user", id));
    }
    info!(admin = actor.user_id, user = id, "user deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(role: Role) -> User {
        User {
            id: 5,
            full_name: Some("Kemi Ade".to_string()),
            email: "kemi@example.com".to_string(),
            role,
            hospital_id: Some(1),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn only_admins_pass() {
        let admin = require_admin(Some(&user(Role::Admin)), 5).unwrap();
        assert_eq!(admin.user_id(), 5);
        assert!(matches!(
            require_admin(Some(&user(Role::Doctor)), 5),
            Err(QueueError::Unauthorized(_))
        ));
        assert!(matches!(
            require_admin(None, 5),
            Err(QueueError::NotFound { kind: "user", .. })
        ));
    }

    #[test]
    fn emails_are_normalized_and_checked() {
        assert_eq!(validate_email(" Doc@MediQ.health ").unwrap(), "doc@mediq.health");
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("@mediq.health").is_err());
        assert!(validate_email("doc@localhost").is_err());
    }

    #[test]
    fn blank_fields_are_rejected() {
        assert!(required("  ", "name").is_err());
        assert_eq!(required(" St. Luke ", "name").unwrap(), "St. Luke");
    }
}
