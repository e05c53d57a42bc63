//! Quarry CLI - evaluate analysis queries against a selected database.
//!
//! Usage:
//!   quarry run <file.qry> --database <path> [--source-archive <path>]
//!   quarry quick-eval <file.qry> --database <path> --fragment <text>
//!   quarry upgrade --database <path>
//!   quarry clear-cache --database <path>
//!   quarry metadata <file.qry>
//!
//! The query server binary is resolved from `server.path` in quarry.toml, or
//! searched on disk and `$PATH`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use quarry::config::Settings;
use quarry::database::DatabaseItem;
use quarry::dist::ConfiguredDistribution;
use quarry::eval::{EvaluationInfo, EvaluationOutcome, QueryRunRequest, ResultDisplay};
use quarry::server::protocol::{Fragment, Severity};
use quarry::server::QueryServer;
use quarry::session::ExtensionSession;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Quarry - evaluate analysis queries against a database")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a query
    Run {
        /// Path to the query file
        file: PathBuf,

        /// Path to the target database
        #[arg(short, long)]
        database: PathBuf,

        /// Declared source archive for the database
        #[arg(long)]
        source_archive: Option<PathBuf>,
    },

    /// Compile and run a selected sub-expression as an ad-hoc query
    QuickEval {
        /// Path to the enclosing query file
        file: PathBuf,

        /// Path to the target database
        #[arg(short, long)]
        database: PathBuf,

        /// The selected expression text
        #[arg(short, long)]
        fragment: String,

        /// 1-based line of the selection
        #[arg(long, default_value_t = 1)]
        line: u32,

        /// 1-based column of the selection
        #[arg(long, default_value_t = 1)]
        column: u32,
    },

    /// Upgrade a database to the server's current format
    Upgrade {
        /// Path to the target database
        #[arg(short, long)]
        database: PathBuf,
    },

    /// Clear the evaluation cache for a database
    ClearCache {
        /// Path to the target database
        #[arg(short, long)]
        database: PathBuf,
    },

    /// Print a query's declared metadata
    Metadata {
        /// Path to the query file
        file: PathBuf,
    },
}

/// Renders finished runs to stdout.
struct PrintDisplay;

impl ResultDisplay for PrintDisplay {
    fn display(&self, info: &Arc<EvaluationInfo>) {
        match &info.outcome {
            EvaluationOutcome::Succeeded { results } => {
                println!("results: {}", results.as_path().display());
            }
            EvaluationOutcome::CompileFailed { diagnostics } => {
                println!("compilation failed:");
                for d in diagnostics {
                    let severity = match d.severity {
                        Severity::Error => "error",
                        Severity::Warning => "warning",
                    };
                    match (d.line, d.column) {
                        (Some(line), Some(column)) => {
                            println!("  {severity} at {line}:{column}: {}", d.message)
                        }
                        _ => println!("  {severity}: {}", d.message),
                    }
                }
            }
            EvaluationOutcome::RuntimeFailed { failure } => {
                println!("evaluation failed: {failure}");
            }
            EvaluationOutcome::Cancelled => println!("cancelled"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quarry=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let settings = Settings::load()?;
    let config = settings.server.to_query_server_config()?;
    let dist = Arc::new(ConfiguredDistribution::new(config.server_path.clone()));

    let mut session = ExtensionSession::new(settings, dist, Arc::new(PrintDisplay));
    session.initialize().await?;

    // Ctrl-C cancels the in-flight operation cooperatively; the server is
    // asked to stop and the run still finalizes.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let code = dispatch(&session, cli.command, &cancel).await?;
    session.shutdown().await?;
    Ok(code)
}

async fn dispatch(
    session: &ExtensionSession,
    command: Commands,
    cancel: &CancellationToken,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let client = session.client().ok_or("session is not active")?.clone();
    let evaluator = session.evaluator().ok_or("session is not active")?.clone();

    match command {
        Commands::Run {
            file,
            database,
            source_archive,
        } => {
            select_database(session, database, source_archive);
            let source = std::fs::read_to_string(&file)?;
            let name = query_name(&file);
            let request = QueryRunRequest::new(name, source).with_path(file);
            let info = evaluator.run_query(request, cancel).await?;
            Ok(outcome_code(&info.outcome))
        }

        Commands::QuickEval {
            file,
            database,
            fragment,
            line,
            column,
        } => {
            select_database(session, database, None);
            let source = std::fs::read_to_string(&file)?;
            let name = format!("{} (quick eval)", query_name(&file));
            let request = QueryRunRequest::new(name, source)
                .with_path(file)
                .with_fragment(Fragment {
                    text: fragment,
                    line,
                    column,
                });
            let info = evaluator.run_query(request, cancel).await?;
            Ok(outcome_code(&info.outcome))
        }

        Commands::Upgrade { database } => {
            let item = DatabaseItem::new(database);
            client.run_upgrade(&item, None, cancel).await?;
            println!("database upgraded");
            Ok(ExitCode::SUCCESS)
        }

        Commands::ClearCache { database } => {
            let item = DatabaseItem::new(database);
            let result = client.clear_cache(&item, cancel).await?;
            println!("{}", result.message.as_deref().unwrap_or("cache cleared"));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Metadata { file } => {
            let metadata = client.resolve_metadata(&file, cancel).await?;
            println!("name: {}", metadata.name.as_deref().unwrap_or("-"));
            println!("kind: {}", metadata.kind.as_deref().unwrap_or("-"));
            if let Some(description) = &metadata.description {
                println!("description: {description}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn select_database(session: &ExtensionSession, path: PathBuf, source_archive: Option<PathBuf>) {
    let mut item = DatabaseItem::new(path);
    if let Some(archive) = source_archive {
        item = item.with_source_archive(archive);
    }
    session.databases().set_active(Some(item));
}

fn query_name(file: &std::path::Path) -> String {
    file.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}

fn outcome_code(outcome: &EvaluationOutcome) -> ExitCode {
    match outcome {
        EvaluationOutcome::Succeeded { .. } => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
