#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! rider-tracker library: the background location tracking service.
//!
//! - `scheduler` — the tracking loop (poll, lock, sample, report, sleep)
//! - `service` — start/stop/remote-status facade over the task host
//! - `host` — owns the one background task
//! - `state` / `store` — persisted auth, last-sent timestamp, send lock
//! - `switch` / `reporter` / `backend` — rider backend HTTP API
//! - `sampler` / `gps` / `modem` — one-shot GNSS fixes from a Quectel modem
//! - `permission` / `connectivity` — preconditions for starting and sending
//! - `routes` / `auth` — local control API
//! - `supervisor` — restart-on-crash wrapper

pub mod auth;
pub mod backend;
pub mod config;
pub mod connectivity;
pub mod gps;
pub mod host;
pub mod modem;
pub mod permission;
pub mod reporter;
pub mod routes;
pub mod sampler;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod switch;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::BackendClient;
pub use config::Config;
pub use routes::AppState;
pub use scheduler::{Scheduler, TrackerDeps};
pub use service::TrackingService;
pub use switch::Directive;
