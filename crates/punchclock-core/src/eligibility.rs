//! Attendance eligibility engine.
//!
//! Given the punches recorded so far today, decides for every [`PunchType`]
//! whether it is already completed, available right now, or blocked (and
//! why). Evaluation is pure: the same record always yields the same result.

use std::ops::Index;

use serde::Serialize;

use crate::error::PunchError;
use crate::models::{DailyAttendanceRecord, PunchTime, PunchType};

/// Why a punch type cannot be submitted right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum BlockReason {
    NoEntry,
    AlreadyExited,
    NoBreakStart,
    BreakInProgress,
    Unavailable,
}

impl BlockReason {
    pub fn message(&self) -> &'static str {
        match self {
            BlockReason::NoEntry => "Entry must be recorded first",
            BlockReason::AlreadyExited => "Exit has already been recorded",
            BlockReason::NoBreakStart => "Break start must be recorded first",
            BlockReason::BreakInProgress => "Finish the break before recording exit",
            BlockReason::Unavailable => "Not available right now",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum EligibilityResult {
    Completed(PunchTime),
    Available,
    Blocked(BlockReason),
}

impl EligibilityResult {
    pub fn is_available(&self) -> bool {
        matches!(self, EligibilityResult::Available)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, EligibilityResult::Completed(_))
    }

    pub fn blocked_reason(&self) -> Option<BlockReason> {
        match self {
            EligibilityResult::Blocked(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            EligibilityResult::Completed(time) => format!("already recorded at {}", time),
            EligibilityResult::Available => "available".to_string(),
            EligibilityResult::Blocked(reason) => reason.message().to_string(),
        }
    }
}

/// Eligibility of all four punch types for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Eligibility {
    pub entry: EligibilityResult,
    pub break_start: EligibilityResult,
    pub break_end: EligibilityResult,
    pub exit: EligibilityResult,
}

impl Eligibility {
    pub fn get(&self, punch: PunchType) -> &EligibilityResult {
        match punch {
            PunchType::Entry => &self.entry,
            PunchType::BreakStart => &self.break_start,
            PunchType::BreakEnd => &self.break_end,
            PunchType::Exit => &self.exit,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PunchType, &EligibilityResult)> + '_ {
        PunchType::ALL.into_iter().map(move |punch| (punch, self.get(punch)))
    }

    /// First available punch in day order, if any.
    pub fn next_available(&self) -> Option<PunchType> {
        self.iter()
            .find(|(_, result)| result.is_available())
            .map(|(punch, _)| punch)
    }
}

impl Index<PunchType> for Eligibility {
    type Output = EligibilityResult;

    fn index(&self, punch: PunchType) -> &Self::Output {
        self.get(punch)
    }
}

pub fn evaluate(record: &DailyAttendanceRecord) -> Eligibility {
    Eligibility {
        entry: evaluate_punch(record, PunchType::Entry),
        break_start: evaluate_punch(record, PunchType::BreakStart),
        break_end: evaluate_punch(record, PunchType::BreakEnd),
        exit: evaluate_punch(record, PunchType::Exit),
    }
}

pub fn evaluate_punch(record: &DailyAttendanceRecord, punch: PunchType) -> EligibilityResult {
    if let Some(time) = record.time_for(punch) {
        return EligibilityResult::Completed(time.clone());
    }

    let entered = record.is_set(PunchType::Entry);
    let break_started = record.is_set(PunchType::BreakStart);
    let break_ended = record.is_set(PunchType::BreakEnd);
    let exited = record.is_set(PunchType::Exit);

    // Rules are checked in priority order; a missing entry always wins.
    let blocked = match punch {
        PunchType::Entry => None,
        PunchType::BreakStart => {
            if !entered {
                Some(BlockReason::NoEntry)
            } else if exited {
                Some(BlockReason::AlreadyExited)
            } else {
                None
            }
        }
        PunchType::BreakEnd => {
            if !entered {
                Some(BlockReason::NoEntry)
            } else if !break_started {
                Some(BlockReason::NoBreakStart)
            } else if exited {
                Some(BlockReason::AlreadyExited)
            } else {
                None
            }
        }
        PunchType::Exit => {
            if !entered {
                Some(BlockReason::NoEntry)
            } else if break_started && !break_ended {
                Some(BlockReason::BreakInProgress)
            } else {
                None
            }
        }
    };

    match blocked {
        Some(reason) => EligibilityResult::Blocked(reason),
        None => EligibilityResult::Available,
    }
}

/// Local guard run before any submission leaves the client.
pub fn ensure_available(record: &DailyAttendanceRecord, punch: PunchType) -> Result<(), PunchError> {
    match evaluate_punch(record, punch) {
        EligibilityResult::Available => Ok(()),
        result => Err(PunchError::InvalidPunchType { punch, result }),
    }
}
