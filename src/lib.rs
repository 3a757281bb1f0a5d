#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! agentd library — building blocks for the coding-agent session backend.
//!
//! agentd keeps interactive coding-agent processes alive per output project,
//! streams their terminals to browsers over WebSockets, and reconciles the
//! streaming with durable project state in SQLite:
//!
//! - `agent` — PTY control of the agent process, invocation assembly, and
//!   capture of the agent's own conversation id
//! - `sessions` — registry of live PTY sessions with replay buffers and
//!   idle eviction
//! - `ws` — terminal WebSocket protocol and connection orchestration
//! - `store` — persisted output projects and milestones
//! - `auth` — API key authentication middleware
//! - `config` — configuration loading
//! - `routes` — REST API route handlers

pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod store;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use error::SessionError;
pub use sessions::SessionRegistry;
pub use state::AppState;
pub use store::ProjectStore;
