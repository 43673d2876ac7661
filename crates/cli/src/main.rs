use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use xfn_api::{cancellation, Engine, InProcEngine, PipelineSpec, RunRequest};
use xfn_core::{DesiredState, EngineError};

#[derive(Parser, Debug)]
#[command(name = "xfnctl", version, about = "Run composition-function pipelines over JSON documents")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline against a request document (stdin by default)
    Run {
        /// Pipeline definition file (YAML or JSON)
        #[arg(long = "pipeline", short = 'p')]
        pipeline: PathBuf,
        /// Request document file; reads stdin when omitted
        #[arg(long = "input", short = 'i')]
        input: Option<PathBuf>,
        /// Default per-step timeout for steps that set none
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
    },
    /// Check a desired-state document against the engine's invariants
    Validate {
        /// Desired-state document file; reads stdin when omitted
        #[arg(long = "input", short = 'i')]
        input: Option<PathBuf>,
    },
    /// List built-in functions
    Functions,
}

fn init_tracing() {
    let env = std::env::var("XFN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("XFN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid XFN_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_document(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display())),
        None => std::io::read_to_string(std::io::stdin()).context("reading stdin"),
    }
}

fn parse_request(raw: &str) -> Result<RunRequest> {
    let doc: serde_json::Value = serde_json::from_str(raw).context("parsing request document")?;
    xfn_api::guard_input(raw.len(), &doc)?;
    serde_json::from_value(doc).context("decoding request document")
}

fn parse_desired(raw: &str) -> Result<DesiredState> {
    let doc: serde_json::Value = serde_json::from_str(raw).context("parsing desired-state document")?;
    xfn_api::guard_input(raw.len(), &doc)?;
    serde_json::from_value(doc).context("decoding desired-state document")
}

/// Exit code 2 distinguishes bad input from a run that failed (exit 1).
fn input_or_exit<T>(res: Result<T>) -> T {
    match res {
        Ok(v) => v,
        Err(e) => {
            eprintln!("input error: {e:#}");
            std::process::exit(2);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { pipeline, input, timeout_ms } => {
            let definition = input_or_exit(
                std::fs::read_to_string(&pipeline)
                    .with_context(|| format!("reading {}", pipeline.display())),
            );
            let spec = input_or_exit(PipelineSpec::parse(&definition));
            let mut pipeline = input_or_exit(spec.resolve());
            if let Some(ms) = timeout_ms {
                for step in &mut pipeline.steps {
                    step.timeout_ms.get_or_insert(ms);
                }
            }

            let raw = input_or_exit(read_document(input.as_ref()));
            let request = input_or_exit(parse_request(&raw));

            // Ctrl-C aborts the run at the current invocation boundary.
            let (handle, cancel_rx) = cancellation();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling run");
                    handle.cancel();
                }
            });

            let engine = InProcEngine::new();
            match engine.run(&pipeline, request, Some(cancel_rx)).await {
                Ok(response) => match cli.output {
                    Output::Json => println!("{}", serde_json::to_string_pretty(&response)?),
                    Output::Human => {
                        for (key, spec) in &response.desired.state.resources {
                            println!("{} • {}/{}", key, spec.api_version, spec.kind);
                        }
                        for entry in &response.results {
                            println!("[{:?}] {}", entry.severity, entry.message);
                        }
                        if response.desired.state.is_empty() {
                            println!("(no desired resources)");
                        }
                    }
                },
                Err(failure) => {
                    error!(error = %failure.error, class = failure.error.class(), "run failed");
                    for entry in &failure.results {
                        eprintln!("[{:?}] {}", entry.severity, entry.message);
                    }
                    match &failure.error {
                        EngineError::Cancelled => eprintln!("run cancelled"),
                        other => eprintln!("run failed: {}", other),
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Validate { input } => {
            let raw = input_or_exit(read_document(input.as_ref()));
            let desired = input_or_exit(parse_desired(&raw));
            match xfn_validate::validate(&desired) {
                Ok(()) => match cli.output {
                    Output::Json => println!("{}", serde_json::json!({ "valid": true })),
                    Output::Human => println!("valid ({} resources)", desired.len()),
                },
                Err(report) => {
                    match cli.output {
                        Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                        Output::Human => {
                            for v in &report.violations {
                                println!("{}: {}", v.key, v.reason);
                            }
                        }
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Functions => {
            for name in xfn_api::BUILTINS {
                println!("{name}");
            }
        }
    }

    Ok(())
}
