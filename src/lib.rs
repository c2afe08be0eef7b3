//! Anonymous polls: create a poll without an account, vote once per network
//! origin, and manage the poll with the token issued at creation.
//!
//! # Layout
//! - [`poll::PollService`] admits or rejects every operation and is the only
//!   caller of the [`store::PollStore`] capability.
//! - [`validation`], [`ordering`] and [`visibility`] are pure rules over
//!   [`models::Poll`].
//! - [`auth`] issues and resolves ownership tokens.
//! - [`rate_limit`] throttles requests per origin.
//! - [`routes::create_router`] wires the HTTP surface; [`db::PgStore`] backs
//!   the store with PostgreSQL.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod ordering;
pub mod poll;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod store;
pub mod validation;
pub mod visibility;

pub use error::{AppError, AppResult};
pub use poll::PollService;
pub use routes::create_router;
pub use state::AppState;
