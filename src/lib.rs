//! # cohort
//!
//! A headless, distributed HTTP session-automation engine. Each worker node
//! maintains hundreds to thousands of fully isolated sessions (own
//! connection pool, cookie jar, ordered headers, pinned browser
//! fingerprint) and drives continuous authenticated traffic against a
//! target origin; a single master node shares hard-won authentication
//! state (cookies, tokens) across the whole cluster the moment any node
//! acquires it.
//!
//! ## Subsystems
//!
//! - Per-node session engine: bounded [`worker::WorkerPool`],
//!   [`scheduler::Scheduler`], [`session::manager::SessionManager`].
//! - Fingerprint stack: [`fingerprint::Profile`] ties the TLS ClientHello
//!   shape, the HTTP/2 prologue, and the ordered header set to one browser
//!   build; [`fingerprint::sensor`] emits synthetic telemetry payloads.
//! - Cluster plane: [`cluster::MasterService`] with the versioned Global
//!   Cookie Jar and streaming fan-out; [`cluster::WorkerClient`] on the
//!   worker side; [`cluster::DistributedLock`] for cross-node exclusion.
//! - Auth maintenance: [`token::TokenManager`] (JWT refresh) and
//!   [`token::heartbeat::HeartbeatManager`] (keep-alives plus the
//!   claimable per-session credential store).
//! - [`payload::SchemaValidator`]: learns an API response's field schema
//!   and flags silent upstream drift.
//! - [`jschallenge`]: in-process JavaScript challenge solving.
//!
//! ## Example
//!
//! ```no_run
//! use cohort::config::Config;
//! use cohort::engine::Engine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(Config::default())?;
//!     engine.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod events;
pub mod fingerprint;
pub mod jschallenge;
pub mod metrics;
pub mod payload;
pub mod proxy;
pub mod scheduler;
pub mod session;
pub mod token;
pub mod worker;

pub use crate::client::headers::OrderedHeaderMap;
pub use crate::cluster::{DistributedLock, InMemoryLock, MasterService, WorkerClient};
pub use crate::config::Config;
pub use crate::engine::{Engine, EngineError};
pub use crate::fingerprint::sensor::SensorPayload;
pub use crate::fingerprint::Profile;
pub use crate::jschallenge::{BoaSolver, Solver};
pub use crate::metrics::Metrics;
pub use crate::payload::{Mismatch, MismatchKind, SchemaValidator};
pub use crate::proxy::ProxyManager;
pub use crate::scheduler::Scheduler;
pub use crate::session::manager::SessionManager;
pub use crate::session::{Session, SessionState};
pub use crate::token::heartbeat::HeartbeatManager;
pub use crate::token::TokenManager;
pub use crate::worker::WorkerPool;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
