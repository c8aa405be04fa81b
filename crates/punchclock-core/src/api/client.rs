use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, Utc};
use reqwest::Url;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::models::punch::{LoginResponse, ReceiptResponse};
use crate::models::server::RegisterResponse;
use crate::models::{
    DailyAttendanceRecord, LocationCheck, LocationQuery, OfflineAck, PunchReceipt,
    PunchSubmission, PunchTime, Registration, ServerConfig, SubmitOutcome, UserProfile,
};
use crate::router::{Fetcher, Request, RequestRouter, Response, ResponseSource, TODAY_PATH};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/api/login";
const LOGOUT_PATH: &str = "/api/logout";
const REGISTER_PATH: &str = "/api/register";
const USER_PATH: &str = "/api/user";
const HEALTH_PATH: &str = "/api/health";
const CONFIG_PATH: &str = "/api/config";
const LOCATION_VALIDATE_PATH: &str = "/api/location/validate";

/// Result of a connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Server answered but reported a problem (usually its database)
    Degraded,
    Unreachable,
}

impl HealthStatus {
    pub fn is_online(&self) -> bool {
        !matches!(self, HealthStatus::Unreachable)
    }
}

fn same_account(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Day a fetched record belongs to: the day it was cached, or today if it
/// came straight from the server.
fn record_day(cached_at: Option<DateTime<Utc>>) -> NaiveDate {
    cached_at
        .map(|at| at.with_timezone(&Local).date_naive())
        .unwrap_or_else(|| Local::now().date_naive())
}

/// Client for the attendance API.
/// Clone is cheap - the router is shared.
pub struct ApiClient<F> {
    router: Arc<RequestRouter<F>>,
}

impl<F> Clone for ApiClient<F> {
    fn clone(&self) -> Self {
        Self {
            router: Arc::clone(&self.router),
        }
    }
}

impl<F> ApiClient<F>
where
    F: Fetcher + Send + Sync + 'static,
{
    pub fn new(router: RequestRouter<F>) -> Self {
        Self {
            router: Arc::new(router),
        }
    }

    pub fn router(&self) -> &RequestRouter<F> {
        &self.router
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.router
            .config()
            .resolve(path)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))
    }

    fn post_request<B: Serialize>(&self, path: &str, body: &B) -> Result<Request, ApiError> {
        Request::post_json(self.url(path)?, body)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))
    }

    /// Route a request and turn failure statuses into errors. Synthesized
    /// 503s mean nothing reached the server.
    async fn send(&self, request: Request) -> Result<Response, ApiError> {
        let is_get = request.method == reqwest::Method::GET;
        let path = request.path().to_string();
        let response = self.router.handle(request).await;

        if response.source == ResponseSource::Synthesized && response.status == 503 {
            return Err(if is_get {
                ApiError::CacheMiss(path)
            } else {
                ApiError::Network(format!("{} could not reach the server", path))
            });
        }
        if !response.is_success() {
            let err = ApiError::from_status(response.status, &response.text());
            debug!(path = %path, status = response.status, error = %err, "Request failed");
            return Err(err);
        }
        Ok(response)
    }

    fn parse<T: DeserializeOwned>(response: &Response, what: &str) -> Result<T, ApiError> {
        response
            .parse_json()
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", what, e)))
    }

    // ===== Attendance =====

    /// Today's recorded punches. A malformed body is an empty day; the
    /// record is stamped with the day it describes so stale cached copies
    /// can be rolled over.
    pub async fn fetch_today(&self) -> Result<DailyAttendanceRecord, ApiError> {
        let response = self.send(Request::get(self.url(TODAY_PATH)?)).await?;

        let mut record = DailyAttendanceRecord::from_json_lenient(&response.body);
        record.set_date(record_day(response.cached_at));
        debug!(source = ?response.source, date = ?record.date(), "Fetched today's record");
        Ok(record)
    }

    pub async fn submit(&self, submission: &PunchSubmission) -> Result<SubmitOutcome, ApiError> {
        let request = self.post_request(crate::router::SUBMIT_PATH, submission)?;
        let response = self.send(request).await?;

        if response.status == 202 {
            if let Ok(ack) = response.parse_json::<OfflineAck>() {
                if ack.pending {
                    warn!(punch = %submission.punch_type, "Punch acknowledged offline, not yet recorded by the server");
                    return Ok(SubmitOutcome::Pending);
                }
            }
        }

        let receipt = Self::parse::<ReceiptResponse>(&response, "punch receipt")?
            .into_receipt()
            .unwrap_or_else(|| {
                // Server recorded it but did not echo the time
                warn!(punch = %submission.punch_type, "Receipt without a time, using local clock");
                PunchReceipt {
                    message: String::new(),
                    time: PunchTime::from_time(Local::now().time()),
                    date: None,
                }
            });
        info!(punch = %submission.punch_type, time = %receipt.time, "Punch recorded");
        Ok(SubmitOutcome::Recorded(receipt))
    }

    /// Probe the server. Never served from cache.
    pub async fn check_health(&self) -> HealthStatus {
        let request = match self.url(HEALTH_PATH) {
            Ok(url) => Request::get(url).no_store(),
            Err(e) => {
                warn!(error = %e, "Cannot build health check request");
                return HealthStatus::Unreachable;
            }
        };
        let response = self.router.handle(request).await;
        match response.source {
            ResponseSource::Synthesized => HealthStatus::Unreachable,
            _ if response.is_success() => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        }
    }

    /// Ask the server whether `location` is close enough to the point
    /// encoded in `code`, without recording anything.
    pub async fn validate_location(&self, query: &LocationQuery) -> Result<LocationCheck, ApiError> {
        let request = self.post_request(LOCATION_VALIDATE_PATH, query)?;
        let response = self.send(request).await?;
        let check: LocationCheck = Self::parse(&response, "location check")?;
        debug!(valid = check.valid, summary = ?check.summary, "Location checked");
        Ok(check)
    }

    /// Server-side limits. Served from cache when offline.
    pub async fn fetch_config(&self) -> Result<ServerConfig, ApiError> {
        let response = self.send(Request::get(self.url(CONFIG_PATH)?)).await?;
        Self::parse(&response, "server config")
    }

    // ===== Session =====

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, ApiError> {
        let request = self.post_request(
            LOGIN_PATH,
            &json!({
                "email": email.trim(),
                "password": password,
            }),
        )?;
        let response = self.send(request).await?;
        let login: LoginResponse = Self::parse(&response, "login response")?;
        info!(email = %login.user.email, "Logged in");
        Ok(login.user)
    }

    /// Log in after `previous` held the session. Cached reads belong to one
    /// account, so they are dropped unless both emails name the same one.
    pub async fn switch_user(
        &self,
        previous: Option<&str>,
        email: &str,
        password: &str,
    ) -> Result<UserProfile, ApiError> {
        let user = self.login(email, password).await?;
        if !previous.is_some_and(|p| same_account(p, &user.email)) {
            self.router.invalidate_api_reads();
        }
        Ok(user)
    }

    /// End the server session. Cached reads are dropped even when the
    /// server cannot be reached.
    pub async fn logout(&self) -> Result<(), ApiError> {
        self.router.invalidate_api_reads();
        let request = self.post_request(LOGOUT_PATH, &json!({}))?;
        self.send(request).await?;
        Ok(())
    }

    /// Create an account. Fields are checked locally first so obviously bad
    /// input never reaches the server. Returns the server's message.
    pub async fn register(&self, registration: &Registration) -> Result<String, ApiError> {
        registration.validate().map_err(ApiError::InvalidRequest)?;
        let request = self.post_request(REGISTER_PATH, registration)?;
        let response = self.send(request).await?;
        let registered: RegisterResponse = Self::parse(&response, "registration response")?;
        info!(email = %registration.email, user_id = ?registered.user_id, "Registered");
        Ok(registered.message.unwrap_or_default())
    }

    pub async fn fetch_user(&self) -> Result<UserProfile, ApiError> {
        let response = self.send(Request::get(self.url(USER_PATH)?)).await?;
        Self::parse(&response, "user profile")
    }
}

// ============================================================================
// Tests
// ============================================================================
