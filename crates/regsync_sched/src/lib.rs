//! # regsync Scheduling Primitives
//!
//! Thread-based scheduling used by the regsync engine.
//!
//! This crate provides:
//! - A bounded worker pool with backpressure and runtime resizing
//! - A hashed time wheel for delayed and repeating tasks
//! - Lazy cancellation handles shared by both
//!
//! ## Key Invariants
//!
//! - A unit submitted to the pool runs at most once
//! - A panicking unit never takes its worker or bucket consumer down
//! - A wheel task never runs before its delay has elapsed
//! - Cancellation is observed before execution, never during it

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod handle;
mod panic;
mod pool;
mod wheel;

pub use config::{PoolConfig, WheelConfig};
pub use error::{SchedError, SchedResult};
pub use handle::CancelHandle;
pub use panic::{payload_message, PanicHandler};
pub use pool::WorkerPool;
pub use wheel::{slot_for, TimeWheel};
