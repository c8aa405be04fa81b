//! Data models for attendance punches.
//!
//! - `DailyAttendanceRecord`, `PunchTime`: the day's recorded punches
//! - `PunchType`: the four attendance events
//! - `PunchSubmission`, `PunchReceipt`, `SubmitOutcome`: submission wire types
//! - `UserProfile`: the logged-in user
//! - `Registration`, `ServerConfig`, `LocationCheck`: account and location endpoints

pub mod attendance;
pub mod punch;
pub mod server;

pub use attendance::{DailyAttendanceRecord, PunchTime, PunchType, UnknownPunchType};
pub use punch::{
    AccuracyQuality, DeviceLocation, LocationQuery, OfflineAck, PunchReceipt, PunchSubmission,
    SubmitOutcome, UserProfile, DEFAULT_MAX_ACCURACY_METERS,
};
pub use server::{GpsSettings, LocationCheck, Registration, ServerConfig};
