//! # regsync Server
//!
//! Job orchestration for regsync.
//!
//! This crate provides:
//! - `CoreServer`, the registry of running jobs and owner of the shared
//!   worker pool and time wheel
//! - `Job`, a job configuration with its status channel and collaborators
//! - Discovery and config executors driving a job through its lifecycle
//!
//! # Lifecycle
//!
//! ```text
//! Pending -> Building -> Running -> Stopped
//!    |           |           \----> Crash
//!    |           +--> Stopped | Crash
//!    +--> Stopped | Crash
//! ```
//!
//! Stopped and Crash are final. Reaching either cancels the job token, which
//! ends the sink loop, its watch consumers and the job's heartbeats.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod executor;
mod job;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use executor::{exec, ConfigExecutor, DiscoveryExecutor, Executor, JobParts};
pub use job::Job;
pub use server::CoreServer;
