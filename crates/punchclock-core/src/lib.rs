//! Core library for the punchclock attendance client.
//!
//! - [`eligibility`]: which of the four daily punches can be recorded now
//! - [`flow`]: the select / scan / submit state machine
//! - [`router`]: offline-aware request routing over a persistent cache
//! - [`api`]: typed calls to the attendance server
//! - [`controller`]: `PunchSession`, tying the above together for a front end

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod controller;
pub mod eligibility;
pub mod error;
pub mod flow;
pub mod models;
pub mod qr;
pub mod router;

pub use api::{ApiClient, ApiError, HealthStatus};
pub use config::Config;
pub use controller::PunchSession;
pub use eligibility::{evaluate, BlockReason, Eligibility, EligibilityResult};
pub use error::PunchError;
pub use flow::{Completion, SubmissionFlow};
pub use models::{DailyAttendanceRecord, DeviceLocation, PunchTime, PunchType, SubmitOutcome};
pub use router::{HttpFetcher, RequestRouter};
