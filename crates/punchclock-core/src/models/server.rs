use serde::{Deserialize, Serialize};

use crate::qr::DEFAULT_MAX_DISTANCE_METERS;

use super::punch::DEFAULT_MAX_ACCURACY_METERS;

/// Body of `POST /api/register`.
#[derive(Clone, PartialEq, Serialize)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub dni: String,
    pub password: String,
}

impl Registration {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        dni: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into().trim().to_string(),
            email: email.into().trim().to_lowercase(),
            dni: dni.into().trim().to_string(),
            password: password.into(),
        }
    }

    /// Check the fields the server would reject. Returns the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.chars().count() < 2 {
            return Err("Name must be at least 2 characters".to_string());
        }
        if !is_plausible_email(&self.email) {
            return Err(format!("Not a valid email address: {}", self.email));
        }
        if self.dni.len() != 8 || !self.dni.chars().all(|c| c.is_ascii_digit()) {
            return Err("DNI must be exactly 8 digits".to_string());
        }
        if self.password.chars().count() < 6 {
            return Err("Password must be at least 6 characters".to_string());
        }
        Ok(())
    }
}

/// `local@domain.tld`, with a top-level domain of two or more letters.
fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let allowed = |c: char, extra: &str| c.is_ascii_alphanumeric() || extra.contains(c);
    !local.is_empty()
        && local.chars().all(|c| allowed(c, "._%+-"))
        && !host.is_empty()
        && host.chars().all(|c| allowed(c, ".-"))
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RegisterResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

/// Location limits published by `GET /api/config`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct GpsSettings {
    pub max_distance_meters: f64,
    pub max_accuracy_meters: f64,
    pub timeout_seconds: u64,
}

impl Default for GpsSettings {
    fn default() -> Self {
        Self {
            max_distance_meters: DEFAULT_MAX_DISTANCE_METERS,
            max_accuracy_meters: DEFAULT_MAX_ACCURACY_METERS,
            timeout_seconds: 10,
        }
    }
}

/// Subset of the server's public configuration the client acts on.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub gps_settings: GpsSettings,
}

/// Server verdict from `POST /api/location/validate`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocationCheck {
    pub valid: bool,
    /// Main reason the location was refused, if any
    #[serde(default)]
    pub summary: Option<String>,
}
