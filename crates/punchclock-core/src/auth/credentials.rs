use anyhow::{Context, Result};
use keyring::credential::{CredentialBuilderApi, CredentialPersistence};
use keyring::Entry;

use crate::config::APP_NAME;

/// Passwords in the OS keychain, keyed by lower-cased email.
pub struct CredentialStore {
    service: String,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(APP_NAME)
    }
}

impl CredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Whether stored passwords outlive this process. False when the
    /// platform has no keychain backend and keyring falls back to its
    /// in-memory mock.
    pub fn is_persistent() -> bool {
        let builder = keyring::default::default_credential_builder();
        !matches!(
            builder.persistence(),
            CredentialPersistence::EntryOnly | CredentialPersistence::ProcessOnly
        )
    }

    fn normalize(email: &str) -> String {
        email.trim().to_lowercase()
    }

    fn entry(&self, email: &str) -> Result<Entry> {
        Entry::new(&self.service, &Self::normalize(email)).context("Failed to create keyring entry")
    }

    /// Store email and password in the OS keychain
    pub fn store(&self, email: &str, password: &str) -> Result<()> {
        self.entry(email)?
            .set_password(password)
            .context("Failed to store password in keychain")
    }

    pub fn get_password(&self, email: &str) -> Result<String> {
        self.entry(email)?
            .get_password()
            .context("Failed to retrieve password from keychain")
    }

    pub fn delete(&self, email: &str) -> Result<()> {
        self.entry(email)?
            .delete_credential()
            .context("Failed to delete credential from keychain")
    }

    pub fn has_credentials(&self, email: &str) -> bool {
        self.entry(email)
            .map(|entry| entry.get_password().is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_normalized() {
        assert_eq!(CredentialStore::normalize("  Ana@Example.COM "), "ana@example.com");
    }

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    #[test]
    fn test_backend_outlives_process() {
        assert!(CredentialStore::is_persistent());
    }

    #[test]
    fn test_service_name() {
        assert_eq!(CredentialStore::default().service, "punchclock");
    }
}
