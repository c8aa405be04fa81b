//! Submission state machine: `Idle -> AwaitingScan -> Submitting -> Idle`.
//!
//! Each entry into `AwaitingScan` or `Submitting`, and each cancel or
//! timeout, bumps a generation counter. A [`SubmissionTicket`] carries the
//! generation it was issued under, so a completion arriving after the user
//! cancelled or started over is recognized and dropped.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::api::ApiError;
use crate::eligibility::ensure_available;
use crate::error::PunchError;
use crate::models::{DailyAttendanceRecord, PunchReceipt, PunchType, SubmitOutcome};

/// How long a selected punch waits for a QR code.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(60);

/// Identifies one in-flight submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionTicket {
    generation: u64,
    punch: PunchType,
}

impl SubmissionTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn punch(&self) -> PunchType {
        self.punch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AwaitingScan { punch: PunchType, deadline: Instant },
    Submitting(SubmissionTicket),
}

/// What applying a finished submission did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Server recorded the punch; the record now carries its time.
    Recorded {
        punch: PunchType,
        receipt: PunchReceipt,
    },
    /// Acknowledged offline only. The record is unchanged.
    Pending { punch: PunchType },
    Failed { punch: PunchType, error: ApiError },
    /// The ticket no longer matches the flow; nothing was applied.
    Stale,
}

#[derive(Debug)]
pub struct SubmissionFlow {
    state: FlowState,
    generation: u64,
    scan_timeout: Duration,
}

impl Default for SubmissionFlow {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_TIMEOUT)
    }
}

impl SubmissionFlow {
    pub fn new(scan_timeout: Duration) -> Self {
        Self {
            state: FlowState::Idle,
            generation: 0,
            scan_timeout,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn scan_timeout(&self) -> Duration {
        self.scan_timeout
    }

    pub fn is_idle(&self) -> bool {
        self.state == FlowState::Idle
    }

    /// Punch type waiting for a scan, if any.
    pub fn awaiting(&self) -> Option<PunchType> {
        match self.state {
            FlowState::AwaitingScan { punch, .. } => Some(punch),
            _ => None,
        }
    }

    pub fn in_flight(&self) -> Option<SubmissionTicket> {
        match self.state {
            FlowState::Submitting(ticket) => Some(ticket),
            _ => None,
        }
    }

    /// Time left to scan, or `None` when not waiting.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self.state {
            FlowState::AwaitingScan { deadline, .. } => Some(deadline.saturating_duration_since(now)),
            _ => None,
        }
    }

    fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Choose a punch type. Only Available types are accepted; picking again
    /// while waiting for a scan replaces the previous choice.
    pub fn select(
        &mut self,
        record: &DailyAttendanceRecord,
        punch: PunchType,
    ) -> Result<(), PunchError> {
        self.select_at(record, punch, Instant::now())
    }

    pub fn select_at(
        &mut self,
        record: &DailyAttendanceRecord,
        punch: PunchType,
        now: Instant,
    ) -> Result<(), PunchError> {
        if self.in_flight().is_some() {
            return Err(PunchError::SubmissionInFlight);
        }
        ensure_available(record, punch)?;

        let generation = self.bump();
        self.state = FlowState::AwaitingScan {
            punch,
            deadline: now + self.scan_timeout,
        };
        debug!(punch = %punch, generation, "Awaiting scan");
        Ok(())
    }

    /// A QR code was read. Issues the ticket for the submission.
    ///
    /// An empty code is rejected and the flow keeps waiting. Eligibility is
    /// checked again since the record may have been refreshed meanwhile.
    pub fn scanned(
        &mut self,
        record: &DailyAttendanceRecord,
        code: &str,
    ) -> Result<SubmissionTicket, PunchError> {
        self.scanned_at(record, code, Instant::now())
    }

    pub fn scanned_at(
        &mut self,
        record: &DailyAttendanceRecord,
        code: &str,
        now: Instant,
    ) -> Result<SubmissionTicket, PunchError> {
        let (punch, deadline) = match self.state {
            FlowState::AwaitingScan { punch, deadline } => (punch, deadline),
            FlowState::Submitting(_) => return Err(PunchError::SubmissionInFlight),
            FlowState::Idle => return Err(PunchError::NotAwaitingScan),
        };

        if now >= deadline {
            self.expire_at(now);
            return Err(PunchError::ScanTimedOut);
        }
        if code.trim().is_empty() {
            return Err(PunchError::EmptyCode);
        }
        if let Err(e) = ensure_available(record, punch) {
            self.cancel();
            return Err(e);
        }

        let ticket = SubmissionTicket {
            generation: self.bump(),
            punch,
        };
        self.state = FlowState::Submitting(ticket);
        debug!(punch = %punch, generation = ticket.generation, "Submitting");
        Ok(ticket)
    }

    /// Return to Idle. Any outstanding ticket becomes stale; the request
    /// itself is not aborted. Returns `false` if already idle.
    pub fn cancel(&mut self) -> bool {
        if self.is_idle() {
            return false;
        }
        let generation = self.bump();
        debug!(generation, "Flow cancelled");
        self.state = FlowState::Idle;
        true
    }

    /// Drop a selection whose scan deadline has passed.
    pub fn expire(&mut self) -> bool {
        self.expire_at(Instant::now())
    }

    pub fn expire_at(&mut self, now: Instant) -> bool {
        match self.state {
            FlowState::AwaitingScan { punch, deadline } if now >= deadline => {
                debug!(punch = %punch, "Scan timed out");
                self.cancel()
            }
            _ => false,
        }
    }

    /// Apply the result of a submission. Stale tickets are ignored; otherwise
    /// the flow returns to Idle and a recorded punch is written to `record`.
    pub fn complete(
        &mut self,
        ticket: SubmissionTicket,
        result: Result<SubmitOutcome, ApiError>,
        record: &mut DailyAttendanceRecord,
    ) -> Completion {
        if self.state != FlowState::Submitting(ticket) {
            debug!(generation = ticket.generation, current = self.generation, "Discarding stale completion");
            return Completion::Stale;
        }
        self.state = FlowState::Idle;

        let punch = ticket.punch;
        match result {
            Ok(SubmitOutcome::Recorded(receipt)) => {
                record.record(punch, receipt.time.clone());
                Completion::Recorded { punch, receipt }
            }
            Ok(SubmitOutcome::Pending) => Completion::Pending { punch },
            Err(error) => Completion::Failed { punch, error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::{evaluate, BlockReason, EligibilityResult};
    use crate::models::PunchTime;

    fn receipt(time: &str) -> SubmitOutcome {
        SubmitOutcome::Recorded(PunchReceipt {
            message: "ok".to_string(),
            time: PunchTime::new(time),
            date: None,
        })
    }

    fn entered() -> DailyAttendanceRecord {
        DailyAttendanceRecord::default().with(PunchType::Entry, "08:00:00")
    }

    #[test]
    fn test_happy_path_records_time() {
        let mut record = DailyAttendanceRecord::default();
        let mut flow = SubmissionFlow::default();

        flow.select(&record, PunchType::Entry).expect("entry available");
        assert_eq!(flow.awaiting(), Some(PunchType::Entry));

        let ticket = flow.scanned(&record, "ACME|Lima|001").expect("ticket");
        assert_eq!(flow.in_flight(), Some(ticket));

        let completion = flow.complete(ticket, Ok(receipt("08:00:05")), &mut record);
        assert!(matches!(completion, Completion::Recorded { punch: PunchType::Entry, .. }));
        assert!(flow.is_idle());
        assert_eq!(record.time_for(PunchType::Entry), Some(&PunchTime::new("08:00:05")));
        assert!(evaluate(&record).break_start.is_available());
    }

    #[test]
    fn test_select_rejects_unavailable() {
        let record = DailyAttendanceRecord::default();
        let mut flow = SubmissionFlow::default();

        match flow.select(&record, PunchType::Exit) {
            Err(PunchError::InvalidPunchType { punch, result }) => {
                assert_eq!(punch, PunchType::Exit);
                assert_eq!(result, EligibilityResult::Blocked(BlockReason::NoEntry));
            }
            other => panic!("expected InvalidPunchType, got {:?}", other),
        }
        assert!(flow.is_idle());

        // Completed types are rejected too
        let err = flow.select(&entered(), PunchType::Entry).expect_err("completed");
        assert!(err.is_local());
    }

    #[test]
    fn test_in_flight_guard() {
        let record = entered();
        let mut flow = SubmissionFlow::default();
        flow.select(&record, PunchType::BreakStart).expect("select");
        flow.scanned(&record, "code").expect("ticket");

        assert!(matches!(flow.scanned(&record, "code"), Err(PunchError::SubmissionInFlight)));
        assert!(matches!(
            flow.select(&record, PunchType::Exit),
            Err(PunchError::SubmissionInFlight)
        ));
    }

    #[test]
    fn test_empty_code_keeps_waiting() {
        let record = DailyAttendanceRecord::default();
        let mut flow = SubmissionFlow::default();
        flow.select(&record, PunchType::Entry).expect("select");

        assert!(matches!(flow.scanned(&record, "   "), Err(PunchError::EmptyCode)));
        assert_eq!(flow.awaiting(), Some(PunchType::Entry));
    }

    #[test]
    fn test_scan_without_selection() {
        let mut flow = SubmissionFlow::default();
        assert!(matches!(
            flow.scanned(&DailyAttendanceRecord::default(), "code"),
            Err(PunchError::NotAwaitingScan)
        ));
    }

    #[test]
    fn test_scan_timeout() {
        let record = DailyAttendanceRecord::default();
        let mut flow = SubmissionFlow::new(Duration::from_secs(60));
        let start = Instant::now();
        flow.select_at(&record, PunchType::Entry, start).expect("select");

        assert_eq!(flow.remaining(start + Duration::from_secs(15)), Some(Duration::from_secs(45)));
        assert!(!flow.expire_at(start + Duration::from_secs(59)));
        assert!(flow.expire_at(start + Duration::from_secs(60)));
        assert!(flow.is_idle());

        // A late scan after the deadline also times out
        flow.select_at(&record, PunchType::Entry, start).expect("select again");
        let late = flow.scanned_at(&record, "code", start + Duration::from_secs(61));
        assert!(matches!(late, Err(PunchError::ScanTimedOut)));
        assert!(flow.is_idle());
    }

    #[test]
    fn test_cancel_discards_late_completion() {
        let mut record = DailyAttendanceRecord::default();
        let mut flow = SubmissionFlow::default();
        flow.select(&record, PunchType::Entry).expect("select");
        let ticket = flow.scanned(&record, "code").expect("ticket");

        assert!(flow.cancel());
        assert!(!flow.cancel());

        let completion = flow.complete(ticket, Ok(receipt("08:00:05")), &mut record);
        assert_eq!(completion, Completion::Stale);
        assert!(record.is_empty());
    }

    #[test]
    fn test_old_ticket_stale_after_new_submission() {
        let mut record = DailyAttendanceRecord::default();
        let mut flow = SubmissionFlow::default();
        flow.select(&record, PunchType::Entry).expect("select");
        let first = flow.scanned(&record, "code").expect("first ticket");
        flow.cancel();

        flow.select(&record, PunchType::Entry).expect("select again");
        let second = flow.scanned(&record, "code").expect("second ticket");
        assert!(second.generation() > first.generation());

        assert_eq!(flow.complete(first, Ok(receipt("08:00:01")), &mut record), Completion::Stale);
        assert!(matches!(
            flow.complete(second, Ok(receipt("08:00:09")), &mut record),
            Completion::Recorded { .. }
        ));
        assert_eq!(record.time_for(PunchType::Entry), Some(&PunchTime::new("08:00:09")));
    }

    #[test]
    fn test_failure_and_pending_leave_record_untouched() {
        let mut record = entered();
        let mut flow = SubmissionFlow::default();

        flow.select(&record, PunchType::Exit).expect("select");
        let ticket = flow.scanned(&record, "code").expect("ticket");
        let error = ApiError::Rejected {
            status: 400,
            message: "Fuera de rango".to_string(),
            code: Some("BUSINESS_LOGIC_ERROR".to_string()),
        };
        let completion = flow.complete(ticket, Err(error.clone()), &mut record);
        assert_eq!(completion, Completion::Failed { punch: PunchType::Exit, error });
        assert!(!record.is_set(PunchType::Exit));

        flow.select(&record, PunchType::Exit).expect("select");
        let ticket = flow.scanned(&record, "code").expect("ticket");
        let completion = flow.complete(ticket, Ok(SubmitOutcome::Pending), &mut record);
        assert_eq!(completion, Completion::Pending { punch: PunchType::Exit });
        assert!(!record.is_set(PunchType::Exit));
        assert!(flow.is_idle());
    }

    #[test]
    fn test_scan_rechecks_eligibility() {
        let record = DailyAttendanceRecord::default();
        let mut flow = SubmissionFlow::default();
        flow.select(&record, PunchType::Entry).expect("select");

        // Record refreshed from another device while waiting
        let refreshed = entered();
        assert!(matches!(
            flow.scanned(&refreshed, "code"),
            Err(PunchError::InvalidPunchType { .. })
        ));
        assert!(flow.is_idle());
    }
}
