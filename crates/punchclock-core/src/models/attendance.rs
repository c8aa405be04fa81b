use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Punch Type
// ============================================================================

/// One of the four attendance events recorded during a working day.
///
/// The serialized form uses the labels the attendance server expects in
/// `marcationType`; English aliases are accepted when reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum PunchType {
    #[serde(rename = "Ingreso", alias = "entry")]
    Entry,
    #[serde(rename = "Inicio de Refrigerio", alias = "breakStart")]
    BreakStart,
    #[serde(rename = "Salida de Refrigerio", alias = "breakEnd")]
    BreakEnd,
    #[serde(rename = "Salida", alias = "exit")]
    Exit,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unknown punch type: {0}")]
pub struct UnknownPunchType(pub String);

impl PunchType {
    /// All punch types in the order they happen during a day.
    pub const ALL: [PunchType; 4] = [
        PunchType::Entry,
        PunchType::BreakStart,
        PunchType::BreakEnd,
        PunchType::Exit,
    ];

    /// Label sent to the attendance server.
    pub fn wire_label(&self) -> &'static str {
        match self {
            PunchType::Entry => "Ingreso",
            PunchType::BreakStart => "Inicio de Refrigerio",
            PunchType::BreakEnd => "Salida de Refrigerio",
            PunchType::Exit => "Salida",
        }
    }

    /// Command-line friendly name.
    pub fn slug(&self) -> &'static str {
        match self {
            PunchType::Entry => "entry",
            PunchType::BreakStart => "break-start",
            PunchType::BreakEnd => "break-end",
            PunchType::Exit => "exit",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PunchType::Entry => "Entry",
            PunchType::BreakStart => "Break start",
            PunchType::BreakEnd => "Break end",
            PunchType::Exit => "Exit",
        }
    }
}

impl fmt::Display for PunchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for PunchType {
    type Err = UnknownPunchType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['_', ' '], "-");
        PunchType::ALL
            .into_iter()
            .find(|punch| {
                punch.slug() == normalized
                    || punch.wire_label().to_lowercase().replace(' ', "-") == normalized
                    || punch.slug().replace('-', "") == normalized
            })
            .ok_or_else(|| UnknownPunchType(s.to_string()))
    }
}

// ============================================================================
// Punch Time
// ============================================================================

/// Server-local, human-readable time of a recorded punch (e.g. `08:01:32`).
/// Kept as the server's text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PunchTime(String);

impl PunchTime {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_time(time: NaiveTime) -> Self {
        Self(time.format("%H:%M:%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PunchTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PunchTime {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Blank strings count as "not punched"; the server stores empty columns that way.
fn non_empty_time<'de, D>(deserializer: D) -> Result<Option<PunchTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .filter(|s| !s.trim().is_empty())
        .map(PunchTime::new))
}

// ============================================================================
// Daily Attendance Record
// ============================================================================

/// The punches recorded for one person on one calendar day.
///
/// Fields are only ever filled, never cleared. A record for a different day
/// is replaced by an empty one (see [`DailyAttendanceRecord::roll_over`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct DailyAttendanceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date: Option<NaiveDate>,

    #[serde(
        rename = "horaentrada",
        alias = "entryTime",
        default,
        deserialize_with = "non_empty_time"
    )]
    entry_time: Option<PunchTime>,

    #[serde(
        rename = "horaRefrigerioInicio",
        alias = "breakStartTime",
        default,
        deserialize_with = "non_empty_time"
    )]
    break_start_time: Option<PunchTime>,

    #[serde(
        rename = "horaRefrigerioFin",
        alias = "breakEndTime",
        default,
        deserialize_with = "non_empty_time"
    )]
    break_end_time: Option<PunchTime>,

    #[serde(
        rename = "horasalida",
        alias = "exitTime",
        default,
        deserialize_with = "non_empty_time"
    )]
    exit_time: Option<PunchTime>,
}

impl DailyAttendanceRecord {
    /// An empty record for the given day.
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Self::default()
        }
    }

    /// Parse the server's record body. Anything that is not a well-formed
    /// record is treated as an empty day.
    pub fn from_json_lenient(body: &[u8]) -> Self {
        match serde_json::from_slice::<Option<Self>>(body) {
            Ok(Some(record)) => record,
            Ok(None) => Self::default(),
            Err(e) => {
                debug!(error = %e, "Malformed attendance record, treating as empty");
                Self::default()
            }
        }
    }

    /// Builder used when constructing records by hand.
    pub fn with(mut self, punch: PunchType, time: impl Into<PunchTime>) -> Self {
        self.record(punch, time.into());
        self
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    pub fn set_date(&mut self, date: NaiveDate) {
        self.date = Some(date);
    }

    pub fn time_for(&self, punch: PunchType) -> Option<&PunchTime> {
        match punch {
            PunchType::Entry => self.entry_time.as_ref(),
            PunchType::BreakStart => self.break_start_time.as_ref(),
            PunchType::BreakEnd => self.break_end_time.as_ref(),
            PunchType::Exit => self.exit_time.as_ref(),
        }
    }

    pub fn is_set(&self, punch: PunchType) -> bool {
        self.time_for(punch).is_some()
    }

    pub fn is_empty(&self) -> bool {
        PunchType::ALL.iter().all(|punch| !self.is_set(*punch))
    }

    /// Record a punch. Returns `false` (and leaves the record untouched) when
    /// that punch was already recorded.
    pub fn record(&mut self, punch: PunchType, time: PunchTime) -> bool {
        let slot = match punch {
            PunchType::Entry => &mut self.entry_time,
            PunchType::BreakStart => &mut self.break_start_time,
            PunchType::BreakEnd => &mut self.break_end_time,
            PunchType::Exit => &mut self.exit_time,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(time);
        true
    }

    /// Fill any unset fields from `other` without clearing what is already known.
    /// Records for different days are not merged.
    pub fn merge(&mut self, other: &DailyAttendanceRecord) {
        if let (Some(mine), Some(theirs)) = (self.date, other.date) {
            if mine != theirs {
                return;
            }
        }
        if self.date.is_none() {
            self.date = other.date;
        }
        for punch in PunchType::ALL {
            if let Some(time) = other.time_for(punch) {
                self.record(punch, time.clone());
            }
        }
    }

    /// Reset to an empty record when `today` is a different calendar day.
    /// Returns `true` if the record was reset.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        match self.date {
            Some(date) if date == today => false,
            Some(_) => {
                *self = Self::empty(today);
                true
            }
            None => {
                self.date = Some(today);
                false
            }
        }
    }
}
