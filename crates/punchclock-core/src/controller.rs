//! Punch session controller.
//!
//! `PunchSession` owns everything a front end needs for one user's day:
//! the attendance record, the submission flow, the connectivity indicator,
//! and the device location. Submissions run as background tokio tasks
//! that report back over a channel; `check_background_tasks` applies their
//! results and drops the ones made stale by a cancel.

use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, HealthStatus};
use crate::eligibility::{evaluate, Eligibility};
use crate::error::PunchError;
use crate::flow::{Completion, SubmissionFlow, SubmissionTicket};
use crate::models::{
    AccuracyQuality, DailyAttendanceRecord, DeviceLocation, GpsSettings, LocationCheck,
    LocationQuery, PunchSubmission, PunchType, SubmitOutcome, DEFAULT_MAX_ACCURACY_METERS,
};
use crate::qr::{QrPayload, DEFAULT_MAX_DISTANCE_METERS};
use crate::router::Fetcher;

/// Size of the channel buffer for submission results.
const CHANNEL_BUFFER_SIZE: usize = 8;

/// A finished submission, as reported by its task.
#[derive(Debug)]
struct SubmissionResult {
    ticket: SubmissionTicket,
    result: Result<SubmitOutcome, ApiError>,
}

pub struct PunchSession<F> {
    api: ApiClient<F>,
    record: DailyAttendanceRecord,
    flow: SubmissionFlow,
    online: bool,
    location: Option<DeviceLocation>,
    last_scan: Option<QrPayload>,
    max_distance_meters: f64,
    max_accuracy_meters: f64,

    result_tx: mpsc::Sender<SubmissionResult>,
    result_rx: mpsc::Receiver<SubmissionResult>,

    pub status_message: Option<String>,
}

impl<F> PunchSession<F>
where
    F: Fetcher + Send + Sync + 'static,
{
    pub fn new(api: ApiClient<F>, scan_timeout: Duration) -> Self {
        let (result_tx, result_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        Self {
            api,
            record: DailyAttendanceRecord::empty(Local::now().date_naive()),
            flow: SubmissionFlow::new(scan_timeout),
            online: true,
            location: None,
            last_scan: None,
            max_distance_meters: DEFAULT_MAX_DISTANCE_METERS,
            max_accuracy_meters: DEFAULT_MAX_ACCURACY_METERS,
            result_tx,
            result_rx,
            status_message: None,
        }
    }

    pub fn with_max_distance(mut self, meters: f64) -> Self {
        self.max_distance_meters = meters;
        self
    }

    pub fn with_max_accuracy(mut self, meters: f64) -> Self {
        self.max_accuracy_meters = meters;
        self
    }

    pub fn gps_limits(&self) -> (f64, f64) {
        (self.max_distance_meters, self.max_accuracy_meters)
    }

    /// Adopt the server's published GPS limits. Local limits stay in place
    /// when the server (and its cached copy) cannot be reached.
    pub async fn load_server_limits(&mut self) -> Option<GpsSettings> {
        match self.api.fetch_config().await {
            Ok(config) => {
                let gps = config.gps_settings;
                debug!(max_distance = gps.max_distance_meters, max_accuracy = gps.max_accuracy_meters, "Using server GPS limits");
                self.max_distance_meters = gps.max_distance_meters;
                self.max_accuracy_meters = gps.max_accuracy_meters;
                Some(gps)
            }
            Err(e) => {
                debug!(error = %e, "Server config unavailable, keeping local GPS limits");
                None
            }
        }
    }

    pub fn api(&self) -> &ApiClient<F> {
        &self.api
    }

    pub fn record(&self) -> &DailyAttendanceRecord {
        &self.record
    }

    pub fn eligibility(&self) -> Eligibility {
        evaluate(&self.record)
    }

    pub fn flow(&self) -> &SubmissionFlow {
        &self.flow
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_location(&mut self, location: Option<DeviceLocation>) {
        self.location = location;
    }

    /// Quality of the current GPS fix against the accuracy limit. `None`
    /// without a location.
    pub fn accuracy_quality(&self) -> Option<AccuracyQuality> {
        self.location
            .map(|loc| loc.accuracy_quality(self.max_accuracy_meters))
    }

    /// Ask the server whether the current location may punch at `code`.
    pub async fn check_location(&self, code: &str) -> Result<LocationCheck, PunchError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(PunchError::EmptyCode);
        }
        let location = self.location.ok_or(PunchError::LocationRequired)?;
        Ok(self
            .api
            .validate_location(&LocationQuery::new(code, location))
            .await?)
    }

    pub fn last_scan(&self) -> Option<&QrPayload> {
        self.last_scan.as_ref()
    }

    /// Distance from the device to the last scanned punch point, if both
    /// positions are known.
    pub fn distance_to_point(&self) -> Option<f64> {
        let location = self.location.as_ref()?;
        self.last_scan.as_ref()?.distance_from(location)
    }

    fn roll_over(&mut self) {
        if self.record.roll_over(Local::now().date_naive()) {
            info!("New day, attendance record reset");
        }
    }

    /// Reload today's record. Known punches are never cleared; a record
    /// cached on an earlier day is ignored.
    pub async fn refresh_record(&mut self) -> Result<(), ApiError> {
        self.roll_over();
        match self.api.fetch_today().await {
            Ok(fetched) => {
                if fetched.date() != self.record.date() {
                    debug!(fetched = ?fetched.date(), current = ?self.record.date(), "Ignoring record from another day");
                }
                self.record.merge(&fetched);
                Ok(())
            }
            Err(e) => {
                if e.is_offline() {
                    self.online = false;
                    self.status_message = Some("Offline: attendance record not available".to_string());
                }
                Err(e)
            }
        }
    }

    pub async fn check_health(&mut self) -> HealthStatus {
        let status = self.api.check_health().await;
        self.online = status.is_online();
        status
    }

    pub fn select(&mut self, punch: PunchType) -> Result<(), PunchError> {
        self.roll_over();
        self.flow.select(&self.record, punch)?;
        self.status_message = Some(format!("Scan the QR code to record {}", punch));
        Ok(())
    }

    /// Hand a decoded QR code to the flow and start the submission in the
    /// background.
    pub fn scanned(&mut self, code: &str) -> Result<SubmissionTicket, PunchError> {
        let ticket = match self.flow.scanned(&self.record, code) {
            Ok(ticket) => ticket,
            Err(e) => {
                if matches!(e, PunchError::ScanTimedOut) {
                    self.status_message = Some("Timed out waiting for a QR code".to_string());
                }
                return Err(e);
            }
        };

        self.last_scan = QrPayload::parse(code);
        let poor_fix = self.accuracy_quality() == Some(AccuracyQuality::Poor);
        if poor_fix {
            warn!(max = self.max_accuracy_meters, "GPS accuracy is worse than the server accepts");
        }
        if let Some(distance) = self.distance_to_point() {
            if distance > self.max_distance_meters {
                // The server decides; this is only an early hint
                warn!(distance, max = self.max_distance_meters, "Device appears to be outside the punch area");
            }
        }

        let submission = PunchSubmission::new(code, ticket.punch()).with_location(self.location);
        let api = self.api.clone();
        let tx = self.result_tx.clone();

        tokio::spawn(async move {
            let result = api.submit(&submission).await;
            if tx.send(SubmissionResult { ticket, result }).await.is_err() {
                debug!("Punch session dropped before submission finished");
            }
        });

        self.status_message = Some(if poor_fix {
            format!(
                "Submitting {} with a GPS fix worse than {:.0} m; the server may refuse it...",
                ticket.punch(),
                self.max_accuracy_meters
            )
        } else {
            format!("Submitting {}...", ticket.punch())
        });
        Ok(ticket)
    }

    pub fn cancel(&mut self) -> bool {
        let cancelled = self.flow.cancel();
        if cancelled {
            self.status_message = Some("Cancelled".to_string());
        }
        cancelled
    }

    /// Time out a selection that waited too long for its scan.
    pub fn expire(&mut self) -> bool {
        let expired = self.flow.expire();
        if expired {
            self.status_message = Some("Timed out waiting for a QR code".to_string());
        }
        expired
    }

    /// Apply any finished submissions without waiting.
    pub fn check_background_tasks(&mut self) -> Vec<Completion> {
        let mut results = Vec::new();
        while let Ok(result) = self.result_rx.try_recv() {
            results.push(result);
        }

        results
            .into_iter()
            .map(|result| self.apply(result))
            .collect()
    }

    /// Wait for the in-flight submission to finish. `None` if nothing is in
    /// flight.
    pub async fn wait_for_completion(&mut self) -> Option<Completion> {
        while self.flow.in_flight().is_some() {
            let result = self.result_rx.recv().await?;
            match self.apply(result) {
                Completion::Stale => continue,
                completion => return Some(completion),
            }
        }
        None
    }

    fn apply(&mut self, result: SubmissionResult) -> Completion {
        let completion = self.flow.complete(result.ticket, result.result, &mut self.record);

        match &completion {
            Completion::Recorded { punch, receipt } => {
                self.online = true;
                self.status_message = Some(format!("{} recorded at {}", punch, receipt.time));
            }
            Completion::Pending { punch } => {
                self.online = false;
                self.status_message = Some(format!(
                    "{} saved offline; it is not confirmed by the server and will not be retried",
                    punch
                ));
            }
            Completion::Failed { punch, error } => {
                if error.is_offline() {
                    self.online = false;
                }
                self.status_message = Some(format!("{} failed: {}", punch, error));
            }
            Completion::Stale => {}
        }
        completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use crate::models::PunchTime;
    use crate::router::testing::{test_config, StubFetcher};
    use crate::router::{RequestRouter, SUBMIT_PATH, TODAY_PATH};
    use serde_json::json;

    fn session(fetcher: &StubFetcher, dir: &tempfile::TempDir) -> PunchSession<StubFetcher> {
        let storage = CacheStorage::new(dir.path().to_path_buf()).expect("storage");
        let router = RequestRouter::new(fetcher.clone(), storage, test_config()).expect("router");
        PunchSession::new(ApiClient::new(router), Duration::from_secs(60))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_full_punch_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        fetcher.json("GET", TODAY_PATH, 200, json!({"horaentrada": "08:00:00"}));
        fetcher.json(
            "POST",
            SUBMIT_PATH,
            201,
            json!({"success": true, "message": "ok", "data": {"time": "12:30:00"}}),
        );
        let mut session = session(&fetcher, &dir);

        session.refresh_record().await.expect("refresh");
        assert_eq!(session.eligibility().next_available(), Some(PunchType::BreakStart));

        session.select(PunchType::BreakStart).expect("select");
        session
            .scanned("ACME|Lima|001|-12.0464,-77.0428|EST-1")
            .expect("ticket");
        assert!(session.flow().in_flight().is_some());

        let completion = session.wait_for_completion().await.expect("completion");
        assert!(matches!(completion, Completion::Recorded { punch: PunchType::BreakStart, .. }));
        assert_eq!(
            session.record().time_for(PunchType::BreakStart),
            Some(&PunchTime::new("12:30:00"))
        );
        assert!(session.eligibility().break_end.is_available());
        assert!(session.eligibility().exit.blocked_reason().is_some());
        assert!(session.flow().is_idle());
        assert!(session.last_scan().is_some());
    }

    #[tokio::test]
    async fn test_offline_submission_is_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        fetcher.set_offline(true);
        let mut session = session(&fetcher, &dir);

        session.select(PunchType::Entry).expect("select");
        session.scanned("code").expect("ticket");
        let completion = session.wait_for_completion().await.expect("completion");

        assert_eq!(completion, Completion::Pending { punch: PunchType::Entry });
        assert!(!session.is_online());
        assert!(session.record().is_empty());
        assert!(session
            .status_message
            .as_deref()
            .is_some_and(|m| m.contains("not be retried")));
    }

    #[tokio::test]
    async fn test_cancelled_submission_result_is_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        fetcher.json("POST", SUBMIT_PATH, 201, json!({"message": "ok", "time": "08:00:00"}));
        let mut session = session(&fetcher, &dir);

        session.select(PunchType::Entry).expect("select");
        session.scanned("code").expect("ticket");
        assert!(session.cancel());
        assert!(session.wait_for_completion().await.is_none());

        settle().await;
        assert_eq!(session.check_background_tasks(), vec![Completion::Stale]);
        assert!(session.record().is_empty());
        // The request itself was still sent
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_surfaces_server_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        fetcher.json(
            "POST",
            SUBMIT_PATH,
            400,
            json!({"error": "Está fuera del rango permitido", "code": "BUSINESS_LOGIC_ERROR"}),
        );
        let mut session = session(&fetcher, &dir);

        session.select(PunchType::Entry).expect("select");
        session.scanned("code").expect("ticket");
        match session.wait_for_completion().await {
            Some(Completion::Failed { error, .. }) => {
                assert_eq!(error.to_string(), "Está fuera del rango permitido");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(session.is_online());
        assert!(session.record().is_empty());
    }

    #[tokio::test]
    async fn test_local_validation_never_reaches_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        let mut session = session(&fetcher, &dir);

        assert!(session.select(PunchType::Exit).is_err());
        assert!(matches!(session.scanned("code"), Err(PunchError::NotAwaitingScan)));

        session.select(PunchType::Entry).expect("select");
        assert!(matches!(session.scanned(""), Err(PunchError::EmptyCode)));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_keeps_known_punches_and_tracks_connectivity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        fetcher.json("POST", SUBMIT_PATH, 201, json!({"message": "ok", "time": "08:00:00"}));
        // Server has not caught up yet
        fetcher.json("GET", TODAY_PATH, 200, json!({}));
        let mut session = session(&fetcher, &dir);

        session.select(PunchType::Entry).expect("select");
        session.scanned("code").expect("ticket");
        session.wait_for_completion().await.expect("completion");

        session.refresh_record().await.expect("refresh");
        assert!(session.record().is_set(PunchType::Entry));

        fetcher.set_offline(true);
        assert_eq!(session.check_health().await, HealthStatus::Unreachable);
        assert!(!session.is_online());
    }

    #[tokio::test]
    async fn test_server_limits_replace_local_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        fetcher.json(
            "GET",
            "/api/config",
            200,
            json!({"gps_settings": {"max_distance_meters": 250.0, "max_accuracy_meters": 50.0}}),
        );
        let mut session = session(&fetcher, &dir).with_max_distance(900.0);
        assert_eq!(session.gps_limits(), (900.0, DEFAULT_MAX_ACCURACY_METERS));

        let gps = session.load_server_limits().await.expect("server limits");
        assert_eq!(gps.max_distance_meters, 250.0);
        assert_eq!(session.gps_limits(), (250.0, 50.0));

        session.set_location(Some(DeviceLocation {
            latitude: -12.0,
            longitude: -77.0,
            accuracy: Some(80.0),
        }));
        assert_eq!(session.accuracy_quality(), Some(AccuracyQuality::Poor));
    }

    #[tokio::test]
    async fn test_server_limits_unavailable_keeps_local() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        fetcher.set_offline(true);
        let mut session = session(&fetcher, &dir).with_max_distance(900.0).with_max_accuracy(100.0);

        assert!(session.load_server_limits().await.is_none());
        assert_eq!(session.gps_limits(), (900.0, 100.0));
        assert_eq!(session.accuracy_quality(), None);
    }

    #[tokio::test]
    async fn test_poor_accuracy_warns_but_still_submits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        fetcher.json("POST", SUBMIT_PATH, 201, json!({"message": "ok", "time": "08:00:00"}));
        let mut session = session(&fetcher, &dir);
        session.set_location(Some(DeviceLocation {
            latitude: -12.0,
            longitude: -77.0,
            accuracy: Some(DEFAULT_MAX_ACCURACY_METERS + 1.0),
        }));

        session.select(PunchType::Entry).expect("select");
        session.scanned("code").expect("ticket");
        assert!(session
            .status_message
            .as_deref()
            .is_some_and(|m| m.contains("GPS fix worse than 600 m")));
        let completion = session.wait_for_completion().await.expect("completion");
        assert!(matches!(completion, Completion::Recorded { .. }));
    }

    #[tokio::test]
    async fn test_check_location() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        fetcher.json("POST", "/api/location/validate", 200, json!({"valid": true, "summary": null}));
        let mut session = session(&fetcher, &dir);

        assert!(matches!(
            session.check_location("-12.0464,-77.0428").await,
            Err(PunchError::LocationRequired)
        ));
        session.set_location(Some(DeviceLocation {
            latitude: -12.0465,
            longitude: -77.0428,
            accuracy: None,
        }));
        assert!(matches!(session.check_location("  ").await, Err(PunchError::EmptyCode)));
        assert_eq!(fetcher.calls(), 0);

        let check = session.check_location("-12.0464,-77.0428").await.expect("check");
        assert!(check.valid);
        // A pre-check records nothing
        assert!(session.flow().is_idle());
        assert!(session.record().is_empty());
    }

    #[tokio::test]
    async fn test_distance_to_point() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = StubFetcher::new();
        fetcher.json("POST", SUBMIT_PATH, 201, json!({"message": "ok", "time": "08:00:00"}));
        let mut session = session(&fetcher, &dir);
        session.set_location(Some(DeviceLocation {
            latitude: -12.0474,
            longitude: -77.0428,
            accuracy: Some(5.0),
        }));

        session.select(PunchType::Entry).expect("select");
        session.scanned("-12.0464,-77.0428").expect("ticket");
        let distance = session.distance_to_point().expect("distance");
        assert!((distance - 111.2).abs() < 0.5);

        session.wait_for_completion().await.expect("completion");
        let sent = fetcher.requests().pop().expect("request");
        let body: serde_json::Value =
            serde_json::from_slice(sent.body.as_deref().unwrap_or_default()).expect("json");
        assert_eq!(body["accuracy"], 5.0);
    }
}
