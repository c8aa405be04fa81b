//! Typed client for the attendance server.
//!
//! `ApiClient` turns the router's raw responses into domain results:
//! today's record, punch receipts, the user profile. Every call goes through
//! the [`RequestRouter`](crate::router::RequestRouter), so offline behaviour
//! (cached reads, pending submissions) is decided there, not here.
//!
//! Authentication is a server-side session cookie set by `/api/login` and
//! held in the fetcher's cookie store.

pub mod client;
pub mod error;

pub use client::{ApiClient, HealthStatus};
pub use error::ApiError;
