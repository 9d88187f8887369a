use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{Hospital, QueueListing, QueueStatus, TriageCode};
use crate::triage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageMix {
    pub triage_code: TriageCode,
    pub waiting: usize,
}

pub fn summarize_waiting(listings: &[QueueListing]) -> Vec<TriageMix> {
    TriageCode::ALL
        .iter()
        .map(|code| TriageMix {
            triage_code: *code,
            waiting: listings
                .iter()
                .filter(|row| row.entry.status == QueueStatus::Waiting && row.triage_code == *code)
                .count(),
        })
        .collect()
}

/// Markdown snapshot of a doctor's dashboard. `active` must be in queue order.
pub fn build_report(
    hospital: &Hospital,
    generated_at: DateTime<Utc>,
    active: &[QueueListing],
    history: &[QueueListing],
    minutes_per_patient: u32,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Queue Report: {}", hospital.name);
    if let Some(address) = &hospital.address {
        let _ = writeln!(output, "{address}");
    }
    let _ = writeln!(output, "Generated {}", generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Triage Mix");

    let mix = summarize_waiting(active);
    if mix.iter().all(|m| m.waiting == 0) {
        let _ = writeln!(output, "No patients waiting.");
    } else {
        for m in mix.iter() {
            let _ = writeln!(output, "- {}: {} waiting", m.triage_code, m.waiting);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Waiting");

    let waiting: Vec<&QueueListing> = active
        .iter()
        .filter(|row| row.entry.status == QueueStatus::Waiting)
        .collect();
    if waiting.is_empty() {
        let _ = writeln!(output, "Queue is empty.");
    } else {
        for (index, row) in waiting.iter().enumerate() {
            let position = index as u32 + 1;
            let _ = writeln!(
                output,
                "{}. {} [{}] waiting since {} (est. {} min)",
                position,
                row.patient_name,
                row.triage_code,
                row.entry.created_at.format("%H:%M"),
                triage::estimate_wait_minutes(position, minutes_per_patient)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## With You");

    let mut with_doctor = active
        .iter()
        .filter(|row| row.entry.status == QueueStatus::InProgress)
        .peekable();
    if with_doctor.peek().is_none() {
        let _ = writeln!(output, "No patients in progress.");
    } else {
        for row in with_doctor {
            let _ = writeln!(
                output,
                "- {} [{}] since {}",
                row.patient_name,
                row.triage_code,
                row.entry.updated_at.format("%H:%M")
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recently Completed");

    if history.is_empty() {
        let _ = writeln!(output, "No completed consultations yet.");
    } else {
        for row in history.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} [{}] completed {}",
                row.patient_name,
                row.triage_code,
                row.entry.updated_at.format("%Y-%m-%d %H:%M")
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueueEntry;
    use uuid::Uuid;

    fn hospital() -> Hospital {
        Hospital {
            id: 1,
            name: "MediQ General".to_string(),
            address: Some("12 Harbor Road".to_string()),
            created_at: Utc::now(),
        }
    }

    fn listing(name: &str, code: TriageCode, status: QueueStatus, seq: i64) -> QueueListing {
        let now = Utc::now();
        QueueListing {
            entry: QueueEntry {
                id: Uuid::new_v4(),
                arrival_seq: seq,
                patient_id: None,
                guest_name: Some(name.to_string()),
                guest_contact: None,
                hospital_id: 1,
                summary_id: Uuid::new_v4(),
                status,
                priority: triage::priority_for(code),
                doctor_id: None,
                created_at: now,
                updated_at: now,
            },
            patient_name: name.to_string(),
            triage_code: code,
        }
    }

    #[test]
    fn mix_counts_waiting_only() {
        let rows = vec![
            listing("A", TriageCode::Red, QueueStatus::Waiting, 1),
            listing("B", TriageCode::Red, QueueStatus::InProgress, 2),
            listing("C", TriageCode::Green, QueueStatus::Waiting, 3),
        ];
        let mix = summarize_waiting(&rows);
        assert_eq!(mix[0], TriageMix { triage_code: TriageCode::Red, waiting: 1 });
        assert_eq!(mix[1].waiting, 0);
        assert_eq!(mix[2].waiting, 1);
    }

    #[test]
    fn report_lists_positions_and_estimates() {
        let active = vec![
            listing("Ada", TriageCode::Red, QueueStatus::Waiting, 1),
            listing("Bola", TriageCode::Yellow, QueueStatus::InProgress, 2),
            listing("Chidi", TriageCode::Green, QueueStatus::Waiting, 3),
        ];
        let report = build_report(&hospital(), Utc::now(), &active, &[], 15);

        assert!(report.starts_with("# Queue Report: MediQ General"));
        assert!(report.contains("1. Ada [red]"));
        assert!(report.contains("2. Chidi [green]"));
        assert!(report.contains("(est. 15 min)"));
        assert!(report.contains("- Bola [yellow] since"));
        assert!(report.contains("No completed consultations yet."));
    }

    #[test]
    fn empty_dashboard_reports_empty_sections() {
        let report = build_report(&hospital(), Utc::now(), &[], &[], 15);
        assert!(report.contains("No patients waiting."));
        assert!(report.contains("Queue is empty."));
        assert!(report.contains("No patients in progress."));
    }
}
