//! Patient intake and triage queue for MediQ hospitals.
//!
//! Patients submit a pre-consultation chat, the [`classifier`] assigns a
//! triage code, and [`queue::QueueService`] places them in their hospital's
//! priority queue, where doctors call, claim and complete them.

pub mod admin;
pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod memory;
pub mod models;
pub mod queue;
pub mod report;
pub mod store;
pub mod triage;

pub use error::{QueueError, Result};
