//! jobmesh CLI - inspect and maintain a job coordination store
//!
//! Binary name: `jobmesh`

use std::process;

use jobmesh::cli::handlers::{format_error, run_cli};

#[tokio::main]
async fn main() {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("JOBMESH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run_cli().await {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Error: {}", format_error(&err));
        }

        let code = err
            .downcast_ref::<jobmesh_core::Error>()
            .map_or(1, jobmesh_core::Error::exit_code);

        #[allow(clippy::exit)]
        process::exit(code);
    }
}
