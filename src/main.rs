use anyhow::Result;
use clap::Parser;
use scriptlab::cli::{self, Outcome};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Logs go to stderr so stdout stays the script's output.
    let default_filter = if args.verbose {
        "scriptlab=debug"
    } else {
        "scriptlab=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli::run(args).await {
        Ok(Outcome::Succeeded) => std::process::exit(0),
        Ok(Outcome::Failed) => std::process::exit(1),
        Err(e) => {
            tracing::debug!("cli failed: {e:?}");
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
