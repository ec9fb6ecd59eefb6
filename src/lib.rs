//! opsdeck: a multi-tenant operations toolbox server.
//!
//! The server exposes a catalog of installable toolkit bundles, queues
//! long-running operations as durable jobs, executes them on background
//! workers with cooperative cancellation, schedules periodic latency
//! probes, and fronts everything with JWT-based authentication backed
//! by pluggable identity providers.
//!
//! Two processes share this crate: `opsdeck serve` runs the HTTP API,
//! `opsdeck worker` consumes broker tasks and hosts the probe
//! scheduler. Durable job state lives in Redis; users, sessions, audit
//! rows, and the toolkit registry live in PostgreSQL with a Redis
//! mirror for hot reads.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod http;
pub mod jobs;
pub mod kv;
pub mod scheduler;
pub mod secrets;
pub mod taskbus;
pub mod toolkits;

pub use config::Config;
pub use error::ApiError;
