//! Worker process for a single sandbox.
//!
//! Speaks the line protocol on stdin/stdout. Logs go to stderr so they never
//! mix with replies.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use pylet::worker::{self, ProcessLoader, PythonRuntime, DEFAULT_INDEX_URL};

#[derive(Parser, Debug)]
#[clap(name = "pylet-worker")]
#[clap(version, about = "Python execution worker for pylet sandboxes")]
struct Args {
    /// Location the Python runtime is loaded from when `init` names none
    #[clap(long, env = "PYLET_INDEX_URL", default_value = DEFAULT_INDEX_URL)]
    index_url: String,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let runtime = PythonRuntime::new(Arc::new(ProcessLoader), args.index_url);

    worker::serve(tokio::io::stdin(), tokio::io::stdout(), runtime)
        .await
        .context("worker protocol loop failed")?;

    Ok(())
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
