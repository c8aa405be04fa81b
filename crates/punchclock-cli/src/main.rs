//! punchclock - record attendance punches from the terminal.
//!
//! Reads a decoded QR payload (argument or stdin), checks locally that the
//! punch is allowed, and submits it. Works offline from the response cache;
//! a punch made offline is acknowledged as pending and must be repeated.

use std::io;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use punchclock_core::auth::{CredentialStore, Session, SessionData};
use punchclock_core::cache::CacheStorage;
use punchclock_core::qr::{QrFormat, QrPayload};
use punchclock_core::models::Registration;
use punchclock_core::{
    ApiClient, ApiError, Completion, Config, DeviceLocation, EligibilityResult, HealthStatus,
    HttpFetcher, PunchError, PunchSession, PunchType, RequestRouter,
};

// ============================================================================
// Constants
// ============================================================================

/// Directory under the cache dir holding response stores
const RESPONSE_CACHE_DIR: &str = "responses";

/// Prefix of the daily rolling log file
const LOG_FILE_PREFIX: &str = "punchclock.log";

const ENV_PASSWORD: &str = "PUNCHCLOCK_PASSWORD";
const ENV_LOG_DIR: &str = "PUNCHCLOCK_LOG_DIR";

type Api = ApiClient<HttpFetcher>;

#[derive(Parser)]
#[command(name = "punchclock", version, about = "Attendance punch client that keeps working offline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show today's punches and which ones can be recorded
    Status,
    /// Record a punch (entry, break-start, break-end, exit)
    Punch(PunchArgs),
    /// Check whether the server is reachable
    Health,
    /// Log in and remember the password in the OS keychain
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Log out and forget the stored password
    Logout,
    /// Create an account on the server
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// National ID, 8 digits
        #[arg(long)]
        dni: String,
    },
    /// Ask the server whether a punch point is in range, without punching
    CheckLocation(LocationArgs),
    /// Manage the offline response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Args)]
struct PunchArgs {
    punch: PunchType,
    /// Decoded QR payload; read from stdin when omitted
    #[arg(long)]
    code: Option<String>,
    #[arg(long, requires = "lng", allow_negative_numbers = true)]
    lat: Option<f64>,
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    lng: Option<f64>,
    /// GPS accuracy in metres
    #[arg(long, requires = "lat")]
    accuracy: Option<f64>,
}

impl PunchArgs {
    fn location(&self) -> Option<DeviceLocation> {
        Some(DeviceLocation {
            latitude: self.lat?,
            longitude: self.lng?,
            accuracy: self.accuracy,
        })
    }
}

#[derive(Args)]
struct LocationArgs {
    /// Decoded QR payload
    #[arg(long)]
    code: String,
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,
    #[arg(long, allow_negative_numbers = true)]
    lng: f64,
    /// GPS accuracy in metres
    #[arg(long)]
    accuracy: Option<f64>,
}

impl LocationArgs {
    fn location(&self) -> DeviceLocation {
        DeviceLocation {
            latitude: self.lat,
            longitude: self.lng,
            accuracy: self.accuracy,
        }
    }
}

#[derive(Subcommand)]
enum CacheAction {
    /// Download the pages needed to open the app offline
    Install,
    /// Delete stores left over from older cache versions
    Activate,
    /// List cache stores and their entries
    List,
}

/// Initialize the tracing subscriber for logging.
/// Returns the file writer guard, which must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env_overrides();
    info!(server = %config.server_url, "punchclock starting");

    match cli.command {
        Commands::Status => status(&config).await,
        Commands::Punch(args) => punch(&config, args).await,
        Commands::Health => health(&config).await,
        Commands::Login { email } => login(&mut config, email).await,
        Commands::Logout => logout(&config).await,
        Commands::Register { name, email, dni } => register(&config, name, email, dni).await,
        Commands::CheckLocation(args) => check_location(&config, args).await,
        Commands::Cache { action } => cache(&config, action).await,
    }
}

// ============================================================================
// Setup
// ============================================================================

fn build_api(config: &Config) -> Result<Api> {
    let fetcher = HttpFetcher::new(config.request_timeout()).context("Failed to create HTTP client")?;
    let storage = CacheStorage::new(config.cache_dir()?.join(RESPONSE_CACHE_DIR))?;
    let router = RequestRouter::new(fetcher, storage, config.router_config()?)?;
    Ok(ApiClient::new(router))
}

fn load_session(config: &Config) -> Result<Session> {
    let mut session = Session::new(config.cache_dir()?);
    if let Err(e) = session.load() {
        warn!(error = %e, "Ignoring unreadable session file");
    }
    Ok(session)
}

/// Password from the environment, falling back to the keychain.
fn stored_password(email: &str) -> Option<String> {
    std::env::var(ENV_PASSWORD)
        .ok()
        .filter(|p| !p.is_empty())
        .or_else(|| CredentialStore::default().get_password(email).ok())
}

/// Re-establish the server's cookie session from stored credentials.
/// Being offline is not an error; cached data can still be shown.
async fn reauthenticate(api: &Api, config: &Config) -> Result<()> {
    let session = load_session(config)?;
    let email = session
        .email()
        .map(str::to_string)
        .or_else(|| config.last_email.clone());
    let Some(email) = email else {
        bail!("Not logged in. Run `punchclock login` first.");
    };
    let Some(password) = stored_password(&email) else {
        bail!("No stored password for {}. Run `punchclock login` again.", email);
    };

    match api.login(&email, &password).await {
        Ok(user) => {
            debug!(email = %user.email, "Session re-established");
            Ok(())
        }
        Err(e) if e.is_offline() => {
            warn!("Server unreachable, continuing offline");
            Ok(())
        }
        Err(e) => Err(e).context("Login failed"),
    }
}

async fn open_session(config: &Config) -> Result<PunchSession<HttpFetcher>> {
    let api = build_api(config)?;
    reauthenticate(&api, config).await?;

    let mut session = PunchSession::new(api, config.scan_timeout())
        .with_max_distance(config.max_distance_meters)
        .with_max_accuracy(config.max_accuracy_meters);
    if let Err(e) = session.refresh_record().await {
        if !e.is_offline() {
            return Err(e).context("Failed to load today's attendance");
        }
        eprintln!("Offline and no saved attendance for today; showing an empty day.");
    }
    session.load_server_limits().await;
    Ok(session)
}

// ============================================================================
// Commands
// ============================================================================

fn print_eligibility(session: &PunchSession<HttpFetcher>) {
    let eligibility = session.eligibility();
    for (punch, result) in eligibility.iter() {
        let (time, state) = match result {
            EligibilityResult::Completed(time) => (time.to_string(), "done".to_string()),
            EligibilityResult::Available => ("-".to_string(), "available".to_string()),
            EligibilityResult::Blocked(reason) => ("-".to_string(), reason.message().to_string()),
        };
        println!("  {:<12} {:<9} {}", punch.display_name(), time, state);
    }
    if let Some(next) = eligibility.next_available() {
        println!("\nNext: punchclock punch {}", next.slug());
    }
}

async fn status(config: &Config) -> Result<()> {
    let mut session = open_session(config).await?;
    if let Some(data) = load_session(config)?.data {
        let minutes = data.minutes_until_expiry();
        println!(
            "{} <{}>, server session expires in {}h{:02}m",
            data.name,
            data.email,
            minutes / 60,
            minutes % 60
        );
    }
    let health = session.check_health().await;

    let date = session
        .record()
        .date()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    println!(
        "Attendance for {} ({})",
        date,
        if health.is_online() { "online" } else { "offline" }
    );
    print_eligibility(&session);
    Ok(())
}

/// Wait for a QR payload on stdin until the scan deadline. Empty lines are
/// rejected and the wait continues.
async fn scan_from_stdin(session: &mut PunchSession<HttpFetcher>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!(
        "Scan the QR code (waiting {}s)...",
        session.flow().scan_timeout().as_secs()
    );

    loop {
        let remaining = session
            .flow()
            .remaining(Instant::now())
            .unwrap_or(Duration::ZERO);

        let line = match tokio::time::timeout(remaining, lines.next_line()).await {
            Ok(line) => line.context("Failed to read QR code from stdin")?,
            Err(_) => {
                session.expire();
                bail!(PunchError::ScanTimedOut);
            }
        };
        let Some(code) = line else {
            session.cancel();
            bail!("No QR code received");
        };

        match session.scanned(&code) {
            Ok(_) => return Ok(()),
            Err(PunchError::EmptyCode) => eprintln!("Empty QR code, scan again."),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn punch(config: &Config, args: PunchArgs) -> Result<()> {
    let mut session = open_session(config).await?;
    session.set_location(args.location());

    if let Err(e) = session.select(args.punch) {
        print_eligibility(&session);
        return Err(e.into());
    }

    match args.code {
        Some(ref code) => {
            session.scanned(code)?;
        }
        None => scan_from_stdin(&mut session).await?,
    }

    if let Some(scan) = session.last_scan() {
        if scan.format() == QrFormat::Opaque {
            debug!("QR code carries no coordinates");
        }
    }
    if let Some(distance) = session.distance_to_point() {
        println!("Distance to punch point: {:.1} m", distance);
    }

    let completion = session
        .wait_for_completion()
        .await
        .context("Submission did not complete")?;
    if let Some(ref message) = session.status_message {
        println!("{}", message);
    }

    match completion {
        Completion::Recorded { .. } => {
            print_eligibility(&session);
            Ok(())
        }
        Completion::Pending { .. } => Ok(()),
        Completion::Failed { error, .. } => Err(error.into()),
        Completion::Stale => bail!("Submission result was discarded"),
    }
}

async fn health(config: &Config) -> Result<()> {
    let api = build_api(config)?;
    match api.check_health().await {
        HealthStatus::Healthy => println!("Server {} is online", config.server_url),
        HealthStatus::Degraded => println!("Server {} is up but degraded", config.server_url),
        HealthStatus::Unreachable => {
            println!("Server {} is unreachable", config.server_url);
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn login(config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email.trim().to_string(),
        None => bail!("Pass --email or set PUNCHCLOCK_EMAIL"),
    };
    let password = match std::env::var(ENV_PASSWORD).ok().filter(|p| !p.is_empty()) {
        Some(password) => password,
        None => rpassword::prompt_password(format!("Password for {}: ", email))
            .context("Failed to read password")?,
    };

    // Only a live session says whose data is cached; anything else clears it
    let mut session = load_session(config)?;
    let previous = session.email().map(str::to_string);

    let api = build_api(config)?;
    let user = api
        .switch_user(previous.as_deref(), &email, &password)
        .await
        .map_err(|e| match e {
            ApiError::Network(_) => anyhow::anyhow!("Cannot log in while offline"),
            other => anyhow::Error::new(other),
        })?;

    if !CredentialStore::is_persistent() {
        eprintln!("No OS keychain available; set {} for later commands.", ENV_PASSWORD);
    } else if let Err(e) = CredentialStore::default().store(&email, &password) {
        warn!(error = %e, "Password not stored; you will need to log in again next time");
    }

    session.update(SessionData::from_user(&user));
    session.save().context("Failed to save session")?;

    config.last_email = Some(email);
    config.save().context("Failed to save config")?;

    println!("Logged in as {} <{}>", user.name, user.email);
    Ok(())
}

async fn logout(config: &Config) -> Result<()> {
    let mut session = load_session(config)?;
    let email = session
        .email()
        .map(str::to_string)
        .or_else(|| config.last_email.clone());

    let api = build_api(config)?;
    if let Err(e) = api.logout().await {
        // Local state is cleared either way
        debug!(error = %e, "Server logout failed");
    }

    session.clear()?;
    if let Some(email) = email {
        let credentials = CredentialStore::default();
        if credentials.has_credentials(&email) {
            if let Err(e) = credentials.delete(&email) {
                warn!(error = %e, "Stored password could not be removed");
            }
        }
    }
    println!("Logged out");
    Ok(())
}

async fn register(config: &Config, name: String, email: String, dni: String) -> Result<()> {
    let password = match std::env::var(ENV_PASSWORD).ok().filter(|p| !p.is_empty()) {
        Some(password) => password,
        None => {
            let password = rpassword::prompt_password("New password: ")
                .context("Failed to read password")?;
            let confirm = rpassword::prompt_password("Repeat password: ")
                .context("Failed to read password")?;
            if password != confirm {
                bail!("Passwords do not match");
            }
            password
        }
    };

    let registration = Registration::new(name, email, dni, password);
    let api = build_api(config)?;
    let message = api.register(&registration).await.map_err(|e| match e {
        ApiError::Network(_) => anyhow::anyhow!("Cannot register while offline"),
        other => anyhow::Error::new(other),
    })?;

    if !message.is_empty() {
        println!("{}", message);
    }
    println!("Run `punchclock login --email {}` to start punching.", registration.email);
    Ok(())
}

async fn check_location(config: &Config, args: LocationArgs) -> Result<()> {
    let mut session = open_session(config).await?;
    session.set_location(Some(args.location()));

    if let Some(quality) = session.accuracy_quality() {
        if !quality.is_usable() {
            println!("Warning: GPS accuracy is too poor ({:?})", quality);
        }
    }
    let check = session.check_location(&args.code).await?;
    let distance = QrPayload::parse(&args.code).and_then(|qr| qr.distance_from(&args.location()));
    if let Some(distance) = distance {
        println!("Distance to punch point: {:.1} m", distance);
    }
    if check.valid {
        println!("Location accepted");
        Ok(())
    } else {
        bail!(
            "Location refused: {}",
            check.summary.as_deref().unwrap_or("no reason given")
        )
    }
}

async fn cache(config: &Config, action: CacheAction) -> Result<()> {
    let api = build_api(config)?;
    let router = api.router();

    match action {
        CacheAction::Install => {
            let count = router.install().await.context("Cache install failed")?;
            println!("Cached {} entries in {}", count, router.store().name());
        }
        CacheAction::Activate => {
            let purged = router.activate()?;
            if purged.is_empty() {
                println!("No stale cache stores");
            } else {
                for name in purged {
                    println!("Deleted {}", name);
                }
            }
        }
        CacheAction::List => {
            for name in router.storage().list()? {
                let current = name == router.store().name();
                println!("{}{}", name, if current { " (current)" } else { "" });
                if current {
                    for entry in router.store().entries()? {
                        println!("  {:>3}  {:>8}  {:<10} {}", entry.status, entry.size, entry.age, entry.key);
                    }
                }
            }
        }
    }
    Ok(())
}
