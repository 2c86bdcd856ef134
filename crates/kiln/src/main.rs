use std::process;

use anyhow::Context;
use kiln::cli::{CliError, Options, USAGE};
use kiln_exec::Executor;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match Options::parse(&args) {
        Ok(v) => v,
        Err(CliError::Help) => {
            println!("{USAGE}");
            return;
        }
        Err(CliError::Usage(msg)) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    kiln::logging::init_tracing();

    if let Err(e) = run(&options).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(options: &Options) -> anyhow::Result<()> {
    let config = options
        .executor_config()
        .context("invalid executor configuration")?;

    let report = kiln::assets::copy_tree(&options.src, &options.dst, Executor::new(config))
        .await
        .with_context(|| {
            format!(
                "failed to build {} from {}",
                options.dst.display(),
                options.src.display()
            )
        })?;

    tracing::info!(
        files = report.files(),
        bytes = report.bytes,
        peak_in_flight = report.stats.peak_in_flight,
        "Static assets copied"
    );
    Ok(())
}
