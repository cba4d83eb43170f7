//! HTTP API for the Postline scheduler.
//!
//! This crate exposes the job lifecycle over JSON:
//! - Submitting posts for delayed publication
//! - Listing, inspecting and cancelling pending posts
//! - Reminder projections for the dashboard
//! - Service health

mod error;
mod routes;

pub use error::{ApiError, json_error};
pub use routes::{AppState, create_router};
