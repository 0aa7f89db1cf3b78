//! # regsync Model
//!
//! Data model shared by every regsync crate.
//!
//! This crate provides:
//! - `Service`, `Instance` and `ServiceChangeEvent` for registry data
//! - `ConfigFile` and `ConfigChangeEvent` for config-center data
//! - `Request` with its `Action` tag and parameter bag
//! - `JobConf` and the `JobStatus` state machine
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod configfile;
mod discovery;
mod error;
mod job;
mod request;

pub use configfile::{ConfigChangeEvent, ConfigChangeKind, ConfigFile, ConfigFileKey};
pub use discovery::{Instance, Service, ServiceChangeEvent, ServiceKey};
pub use error::{ModelError, ModelResult};
pub use job::{ComponentType, JobConf, JobStatus, JobType, Options};
pub use request::{keys, Action, Params, ReadRequest, Request, WatchRequest, WriteRequest};
