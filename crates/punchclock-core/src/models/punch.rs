use serde::{Deserialize, Serialize};

use super::attendance::{PunchTime, PunchType};

/// Worst GPS accuracy accepted before a reading is considered unusable.
pub const DEFAULT_MAX_ACCURACY_METERS: f64 = 600.0;

/// How trustworthy a reported GPS fix is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyQuality {
    /// No accuracy was reported
    Unknown,
    Excellent,
    Good,
    Acceptable,
    /// Worse than the allowed maximum
    Poor,
}

impl AccuracyQuality {
    pub fn classify(accuracy: Option<f64>, max_accuracy: f64) -> Self {
        match accuracy {
            None => AccuracyQuality::Unknown,
            Some(a) if a <= 5.0 => AccuracyQuality::Excellent,
            Some(a) if a <= 20.0 => AccuracyQuality::Good,
            Some(a) if a <= max_accuracy => AccuracyQuality::Acceptable,
            Some(_) => AccuracyQuality::Poor,
        }
    }

    pub fn is_usable(&self) -> bool {
        !matches!(self, AccuracyQuality::Poor)
    }
}

/// Device position reported alongside a punch. The server checks it against
/// the coordinates encoded in the scanned QR code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported GPS accuracy in metres
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl DeviceLocation {
    pub fn accuracy_quality(&self, max_accuracy: f64) -> AccuracyQuality {
        AccuracyQuality::classify(self.accuracy, max_accuracy)
    }
}

/// Body of `POST /api/location/validate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationQuery {
    #[serde(rename = "qrCode")]
    pub code: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl LocationQuery {
    pub fn new(code: impl Into<String>, location: DeviceLocation) -> Self {
        Self {
            code: code.into().trim().to_string(),
            latitude: location.latitude,
            longitude: location.longitude,
            accuracy: location.accuracy,
        }
    }
}

/// Body of `POST /api/attendance/mark`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PunchSubmission {
    #[serde(rename = "qrCode")]
    pub code: String,
    #[serde(rename = "marcationType")]
    pub punch_type: PunchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl PunchSubmission {
    pub fn new(code: impl Into<String>, punch_type: PunchType) -> Self {
        Self {
            code: code.into().trim().to_string(),
            punch_type,
            latitude: None,
            longitude: None,
            accuracy: None,
        }
    }

    pub fn with_location(mut self, location: Option<DeviceLocation>) -> Self {
        if let Some(loc) = location {
            self.latitude = Some(loc.latitude);
            self.longitude = Some(loc.longitude);
            self.accuracy = loc.accuracy;
        }
        self
    }
}

/// Confirmation of a recorded punch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunchReceipt {
    pub message: String,
    pub time: PunchTime,
    pub date: Option<String>,
}

/// What happened to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The server recorded the punch.
    Recorded(PunchReceipt),
    /// The network was unreachable. The punch was acknowledged locally only
    /// and is NOT retried automatically.
    Pending,
}

/// Server success body. Both the nested (`data.time`) and flat (`time`)
/// shapes are accepted.
#[derive(Debug, Deserialize)]
pub(crate) struct ReceiptResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub time: Option<PunchTime>,
    #[serde(default)]
    pub data: Option<ReceiptData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReceiptData {
    #[serde(default)]
    pub time: Option<PunchTime>,
    #[serde(default)]
    pub date: Option<String>,
}

impl ReceiptResponse {
    pub fn into_receipt(self) -> Option<PunchReceipt> {
        let (nested_time, date) = match self.data {
            Some(data) => (data.time, data.date),
            None => (None, None),
        };
        let time = nested_time.or(self.time)?;
        Some(PunchReceipt {
            message: self.message.unwrap_or_default(),
            time,
            date,
        })
    }
}

/// Body synthesized by the router when a submission could not reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineAck {
    pub accepted: bool,
    pub pending: bool,
}

impl OfflineAck {
    pub const QUEUED: OfflineAck = OfflineAck {
        accepted: true,
        pending: true,
    };
}

/// Error body returned by the server on rejection.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

impl ErrorBody {
    /// The server sends codes both as strings and as numeric statuses.
    pub fn code_string(&self) -> Option<String> {
        match &self.code {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Authenticated user, as returned by `/api/login` and `/api/user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(alias = "userName")]
    pub name: String,
    #[serde(alias = "userEmail")]
    pub email: String,
    #[serde(default, alias = "userDni")]
    pub dni: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginResponse {
    pub user: UserProfile,
}
