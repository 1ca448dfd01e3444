//! Phase timeline and time-based progress estimation.
//!
//! Progress is a pure function of the phase table and elapsed time; it
//! never inspects pipeline internals. Each phase owns a fixed percentage
//! band and a duration estimate, and progress interpolates within the
//! band, capped at 99 until the job actually completes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::JobStatus;

/// The six pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    UrlLookup,
    Prescan,
    PortalScan,
    Classification,
    BrowserAgent,
    Results,
}

/// Static descriptor for one phase.
#[derive(Debug, Clone, Copy)]
pub struct Phase {
    pub id: PhaseId,
    pub label: &'static str,
    pub pct_start: u8,
    pub pct_end: u8,
    pub est_secs: u64,
}

pub const PHASES: [Phase; 6] = [
    Phase {
        id: PhaseId::UrlLookup,
        label: "Finding official website",
        pct_start: 0,
        pct_end: 10,
        est_secs: 10,
    },
    Phase {
        id: PhaseId::Prescan,
        label: "Scanning website",
        pct_start: 10,
        pct_end: 35,
        est_secs: 40,
    },
    Phase {
        id: PhaseId::PortalScan,
        label: "Scanning exhibitor portals",
        pct_start: 35,
        pct_end: 50,
        est_secs: 30,
    },
    Phase {
        id: PhaseId::Classification,
        label: "Classifying documents",
        pct_start: 50,
        pct_end: 65,
        est_secs: 25,
    },
    Phase {
        id: PhaseId::BrowserAgent,
        label: "Browser verification",
        pct_start: 65,
        pct_end: 90,
        est_secs: 90,
    },
    Phase {
        id: PhaseId::Results,
        label: "Processing results",
        pct_start: 90,
        pct_end: 100,
        est_secs: 5,
    },
];

pub fn phase(id: PhaseId) -> &'static Phase {
    PHASES
        .iter()
        .find(|p| p.id == id)
        .unwrap_or(&PHASES[0])
}

fn phase_index(id: PhaseId) -> usize {
    PHASES.iter().position(|p| p.id == id).unwrap_or(0)
}

/// Interpolated progress percentage for a job.
///
/// Completed jobs report 100, failed and cancelled jobs 0. Running jobs
/// interpolate within the current phase band and never reach 100.
pub fn progress(status: JobStatus, current_phase: PhaseId, elapsed_in_phase: Duration) -> u8 {
    match status {
        JobStatus::Completed => return 100,
        JobStatus::Failed | JobStatus::Cancelled => return 0,
        JobStatus::Pending | JobStatus::Running => {}
    }

    let phase = phase(current_phase);
    let ratio = (elapsed_in_phase.as_secs_f64() / phase.est_secs.max(1) as f64).min(1.0);
    let pct = phase.pct_start as f64 + ratio * (phase.pct_end - phase.pct_start) as f64;
    (pct as u8).min(99)
}

/// Estimated seconds remaining: the rest of the current phase plus the
/// estimates of every later phase.
pub fn remaining_secs(status: JobStatus, current_phase: PhaseId, elapsed_in_phase: Duration) -> u64 {
    if status.is_terminal() {
        return 0;
    }
    let idx = phase_index(current_phase);
    let current = &PHASES[idx];
    let in_phase = elapsed_in_phase.as_secs();
    let current_remaining = current.est_secs.saturating_sub(in_phase);
    let future: u64 = PHASES[idx + 1..].iter().map(|p| p.est_secs).sum();
    current_remaining + future
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_are_contiguous() {
        for pair in PHASES.windows(2) {
            assert_eq!(pair[0].pct_end, pair[1].pct_start);
        }
        assert_eq!(PHASES[0].pct_start, 0);
        assert_eq!(PHASES[5].pct_end, 100);
    }

    #[test]
    fn progress_is_monotone_within_a_phase() {
        let mut last = 0;
        for secs in 0..120 {
            let pct = progress(
                JobStatus::Running,
                PhaseId::BrowserAgent,
                Duration::from_secs(secs),
            );
            assert!(pct >= last, "progress went backwards at {secs}s");
            last = pct;
        }
    }

    #[test]
    fn progress_is_monotone_across_phase_transitions() {
        // End of one phase never exceeds the start of the next.
        for pair in PHASES.windows(2) {
            let end_of_prev = progress(
                JobStatus::Running,
                pair[0].id,
                Duration::from_secs(pair[0].est_secs * 10),
            );
            let start_of_next = progress(JobStatus::Running, pair[1].id, Duration::ZERO);
            assert!(end_of_prev <= start_of_next);
        }
    }

    #[test]
    fn running_progress_never_reaches_100() {
        let pct = progress(
            JobStatus::Running,
            PhaseId::Results,
            Duration::from_secs(100_000),
        );
        assert_eq!(pct, 99);
    }

    #[test]
    fn terminal_progress() {
        assert_eq!(
            progress(JobStatus::Completed, PhaseId::Results, Duration::ZERO),
            100
        );
        assert_eq!(
            progress(JobStatus::Failed, PhaseId::Prescan, Duration::ZERO),
            0
        );
        assert_eq!(
            progress(JobStatus::Cancelled, PhaseId::Prescan, Duration::ZERO),
            0
        );
    }

    #[test]
    fn remaining_sums_later_phases() {
        // At the start of classification: 25 + 90 + 5 remain.
        let secs = remaining_secs(JobStatus::Running, PhaseId::Classification, Duration::ZERO);
        assert_eq!(secs, 120);

        // Halfway through, the current phase share shrinks.
        let secs = remaining_secs(
            JobStatus::Running,
            PhaseId::Classification,
            Duration::from_secs(10),
        );
        assert_eq!(secs, 110);

        assert_eq!(
            remaining_secs(JobStatus::Completed, PhaseId::Results, Duration::ZERO),
            0
        );
    }
}
