use crate::bench::{self, BenchConfig};
use crate::model::{PipelineConfig, PipelineEvent, PipelineState};
use crate::orchestrator::{Pipeline, Session};
use crate::tutorials::{BuiltinTutorials, TutorialProvider};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "scriptlab",
    version,
    about = "Compile and run lab scripts in isolated stages"
)]
pub struct Cli {
    /// Script file to run (`-` reads stdin). Defaults to the hello-world script.
    pub script: Option<PathBuf>,

    /// Load tutorial N (1-based) instead of a script file
    #[arg(long, conflicts_with = "script")]
    pub tutorial: Option<usize>,

    /// List the built-in tutorials and exit
    #[arg(long)]
    pub list_tutorials: bool,

    /// Print the final pipeline state as JSON
    #[arg(long)]
    pub json: bool,

    /// Run silently: suppress all output except errors
    #[arg(long)]
    pub silent: bool,

    /// Print the compiled listing to stderr
    #[arg(long)]
    pub show_compiled: bool,

    /// Output items per runner reply frame (0 = single frame)
    #[arg(long, default_value_t = 256)]
    pub chunk_items: usize,

    /// Report a request that is still compiling or running after this long
    #[arg(long, default_value = "2s")]
    pub busy_notice_after: humantime::Duration,

    /// How long shutdown waits for a stage stuck in user code
    #[arg(long, default_value = "500ms")]
    pub shutdown_grace: humantime::Duration,

    /// Run the result-delivery benchmark instead of a script
    #[arg(long)]
    pub bench: bool,

    /// Output item counts to benchmark
    #[arg(long, value_delimiter = ',', default_value = "1,10,100,1000,10000")]
    pub bench_sizes: Vec<usize>,

    /// Iterations per benchmark size
    #[arg(long, default_value_t = 20)]
    pub bench_iterations: usize,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    pub verbose: bool,
}

/// How a CLI invocation ended; maps to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// Build a `PipelineConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> PipelineConfig {
    PipelineConfig {
        chunk_items: args.chunk_items,
        busy_notice_after: Duration::from(args.busy_notice_after),
        shutdown_grace: Duration::from(args.shutdown_grace),
    }
}

pub async fn run(args: Cli) -> Result<Outcome> {
    if args.silent && args.json {
        bail!("--silent and --json cannot be used together");
    }

    if args.list_tutorials {
        let (out_tx, out_handle) = spawn_output_writer();
        for (i, t) in BuiltinTutorials.list_tutorials().iter().enumerate() {
            let line = format!("Tutorial {}: {}", i + 1, t.description);
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
        drop(out_tx);
        let _ = out_handle.await;
        return Ok(Outcome::Succeeded);
    }

    if args.bench {
        return run_bench(&args).await;
    }

    run_script(args).await
}

fn read_source(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("failed to read script from stdin")?;
        return Ok(source);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn run_script(args: Cli) -> Result<Outcome> {
    let cfg = build_config(&args);
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<PipelineEvent>();

    let pipeline = Pipeline::with_script_stages(cfg, Some(evt_tx))?;
    let mut session = Session::new(pipeline, &BuiltinTutorials);
    if let Some(n) = args.tutorial {
        let index = n.checked_sub(1).context("tutorials are numbered from 1")?;
        let tutorial = session.load_tutorial(index)?;
        if !args.silent && !args.json {
            let _ = out_tx.send(OutputLine::Stderr(format!("== {} ==", tutorial.description)));
        }
    } else if let Some(path) = args.script.as_ref() {
        session.edit(read_source(path)?);
    }

    let request = session.compile_and_run();

    // Relay progress events while waiting for the request to settle.
    let quiet = args.silent || args.json;
    let relay_tx = out_tx.clone();
    let relay = tokio::spawn(async move {
        while let Some(ev) = evt_rx.recv().await {
            if quiet {
                continue;
            }
            if let PipelineEvent::Info(info) = ev {
                let _ = relay_tx.send(OutputLine::Stderr(info.to_message()));
            }
        }
    });

    let settled = tokio::select! {
        state = session.pipeline().settled(request) => Some(state?),
        _ = tokio::signal::ctrl_c() => None,
    };

    let outcome = match settled {
        None => {
            let _ = out_tx.send(OutputLine::Stderr("Interrupted; shutting down".into()));
            Outcome::Failed
        }
        Some(state) => {
            emit_state(&args, &state, &out_tx)?;
            match state {
                PipelineState::Succeeded { .. } => Outcome::Succeeded,
                _ => Outcome::Failed,
            }
        }
    };

    session.shutdown().await?;
    let _ = relay.await;
    drop(out_tx);
    let _ = out_handle.await;
    Ok(outcome)
}

fn emit_state(
    args: &Cli,
    state: &PipelineState,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    if args.json {
        let out = serde_json::to_string_pretty(state).context("failed to serialize state")?;
        let _ = out_tx.send(OutputLine::Stdout(out));
        return Ok(());
    }
    let summary = crate::text_summary::build_text_summary(state, args.show_compiled);
    if args.silent {
        // Errors only.
        if matches!(state, PipelineState::Failed { .. }) {
            for line in summary.stderr {
                let _ = out_tx.send(OutputLine::Stderr(line));
            }
        }
        return Ok(());
    }
    for line in summary.stdout {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    for line in summary.stderr {
        let _ = out_tx.send(OutputLine::Stderr(line));
    }
    Ok(())
}

async fn run_bench(args: &Cli) -> Result<Outcome> {
    if args.bench_iterations == 0 || args.bench_sizes.is_empty() {
        bail!("--bench needs at least one size and one iteration");
    }
    let cfg = BenchConfig {
        sizes: args.bench_sizes.clone(),
        iterations: args.bench_iterations,
        chunk_items: args.chunk_items.max(1),
    };
    let (out_tx, out_handle) = spawn_output_writer();
    let rows = bench::run_bench(&cfg).await?;
    if args.json {
        let out = serde_json::to_string_pretty(&rows)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else if !args.silent {
        for line in bench::format_rows(&rows) {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(Outcome::Succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_from_flags() {
        let args = Cli::parse_from([
            "scriptlab",
            "--chunk-items",
            "8",
            "--busy-notice-after",
            "1s 500ms",
            "--shutdown-grace",
            "2s",
        ]);
        let cfg = build_config(&args);
        assert_eq!(cfg.chunk_items, 8);
        assert_eq!(cfg.busy_notice_after, Duration::from_millis(1500));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_tutorial_conflicts_with_script() {
        assert!(Cli::try_parse_from(["scriptlab", "a.lab", "--tutorial", "1"]).is_err());
        let args = Cli::try_parse_from(["scriptlab", "--bench-sizes", "1,5"]).unwrap();
        assert_eq!(args.bench_sizes, vec![1, 5]);
    }

    #[tokio::test]
    async fn test_run_failing_script_reports_failure() {
        let dir = std::env::temp_dir().join(format!("scriptlab-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.lab");
        std::fs::write(&path, "print(").unwrap();
        let args = Cli::parse_from(["scriptlab", "--silent", path.to_str().unwrap()]);
        assert_eq!(run(args).await.unwrap(), Outcome::Failed);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_silent_json_is_rejected() {
        let args = Cli::parse_from(["scriptlab", "--silent", "--json"]);
        assert!(run(args).await.is_err());
    }
}
