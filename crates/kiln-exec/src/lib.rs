//! kiln-exec: bounded-concurrency executor for the kiln build pipeline.
//!
//! The build pipeline hands the executor a finite, ordered source of work
//! items (files to copy, pages to render) and an async transform. The
//! executor starts the transform for each item in order, keeps at most
//! `limit` operations in flight, and reports the first failure it observes
//! (or all of them, see [`ErrorMode::Collect`]).

mod config;
mod error;
mod executor;
mod in_flight;
mod stats;

pub use config::{
    Admission, ConfigError, DEFAULT_LIMIT, ENV_CONCURRENCY, ENV_ERROR_MODE, ENV_FAIL_FAST,
    ErrorMode, ExecutorConfig, parse_limit,
};
pub use error::{ExecError, OperationFailure};
pub use executor::{Executor, run};
pub use stats::RunStats;
pub use tokio_util::sync::CancellationToken;
