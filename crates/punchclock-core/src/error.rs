use thiserror::Error;

use crate::api::ApiError;
use crate::eligibility::EligibilityResult;
use crate::models::PunchType;

/// Errors surfaced by the punch workflow.
///
/// Everything except `Api` is raised locally and never reaches the network.
#[derive(Error, Debug)]
pub enum PunchError {
    #[error("{punch} cannot be recorded: {}", .result.describe())]
    InvalidPunchType {
        punch: PunchType,
        result: EligibilityResult,
    },

    #[error("Scanned QR code is empty")]
    EmptyCode,

    #[error("A punch is already being submitted")]
    SubmissionInFlight,

    #[error("No punch type is waiting for a scan")]
    NotAwaitingScan,

    #[error("Timed out waiting for a QR code")]
    ScanTimedOut,

    #[error("Device location is required")]
    LocationRequired,

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl PunchError {
    /// True for errors raised on the client before any request was made.
    pub fn is_local(&self) -> bool {
        !matches!(self, PunchError::Api(_))
    }
}
