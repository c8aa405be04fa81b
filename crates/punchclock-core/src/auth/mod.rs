//! Local login state.
//!
//! - `Session`: who is logged in, persisted to disk, expiring with the
//!   server's session lifetime
//! - `CredentialStore`: password kept in the OS keychain via keyring
//!
//! The server session itself is a cookie that lives only as long as the
//! HTTP client, so each run logs in again from the stored credentials.

pub mod credentials;
pub mod session;

pub use credentials::CredentialStore;
pub use session::{Session, SessionData};
