//! Command-line arguments for the kiln binary.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use kiln_exec::{Admission, ConfigError, ErrorMode, ExecutorConfig, parse_limit};

pub const USAGE: &str = "\
Usage: kiln <src> <dst> [--concurrency N] [--collect-errors] [--fail-fast]

Arguments:
  <src>                Static source directory
  <dst>                Output directory (must not be inside <src>)

Options:
  --concurrency <N>    Maximum files copied at once [env: KILN_CONCURRENCY, default: 8]
  --collect-errors     Wait for in-flight copies and report every failure
  --fail-fast          Stop starting new copies as soon as any copy fails";

/// Why argument parsing stopped without producing [`Options`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CliError {
    #[error("help requested")]
    Help,

    #[error("{0}")]
    Usage(String),
}

impl From<&str> for CliError {
    fn from(msg: &str) -> Self {
        Self::Usage(msg.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub concurrency: Option<NonZeroUsize>,
    pub collect_errors: bool,
    pub fail_fast: bool,
}

impl Options {
    /// Parse `argv`, including the program name at index 0.
    pub fn parse(args: &[String]) -> Result<Self, CliError> {
        let mut positional = Vec::new();
        let mut concurrency = None;
        let mut collect_errors = false;
        let mut fail_fast = false;

        let mut i = 1; // skip argv[0]
        while i < args.len() {
            match args[i].as_str() {
                "--concurrency" | "-j" => {
                    i += 1;
                    let raw = args.get(i).ok_or("--concurrency requires a value")?;
                    concurrency =
                        Some(parse_limit(raw).map_err(|e| CliError::Usage(e.to_string()))?);
                }
                "--collect-errors" => collect_errors = true,
                "--fail-fast" => fail_fast = true,
                "--help" | "-h" => return Err(CliError::Help),
                arg if arg.starts_with('-') => {
                    return Err(CliError::Usage(format!("unknown flag: {arg}")));
                }
                arg => positional.push(PathBuf::from(arg)),
            }
            i += 1;
        }

        let mut positional = positional.into_iter();
        let src = positional.next().ok_or("missing required argument: <src>")?;
        let dst = positional.next().ok_or("missing required argument: <dst>")?;
        if let Some(extra) = positional.next() {
            return Err(CliError::Usage(format!(
                "unexpected argument: {}",
                extra.display()
            )));
        }

        Ok(Self {
            src,
            dst,
            concurrency,
            collect_errors,
            fail_fast,
        })
    }

    /// Executor config: defaults, then environment, then flags.
    pub fn executor_config(&self) -> Result<ExecutorConfig, ConfigError> {
        Ok(self.apply(ExecutorConfig::default().apply_env()?))
    }

    fn apply(&self, mut config: ExecutorConfig) -> ExecutorConfig {
        if let Some(limit) = self.concurrency {
            config.limit = limit;
        }
        if self.collect_errors {
            config.errors = ErrorMode::Collect;
        }
        if self.fail_fast {
            config.admission = Admission::FailFast;
        }
        config
    }
}
