//! kiln: static-site build tool.
//!
//! Build steps that touch many files run through [`kiln_exec::Executor`] so
//! the number of open files and in-flight copies stays bounded.

pub mod assets;
pub mod cli;
mod error;
pub mod logging;

pub use error::Error;
