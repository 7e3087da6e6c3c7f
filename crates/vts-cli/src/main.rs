//! `vts` - run documents through the orchestrator and verify saved results

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vts_audit::{AuditSigner, AuditSink, MemoryAuditSink};
use vts_core::{DocumentId, FsDocumentLoader, Orchestrator, RunConfig, RunResult, RunStatus};
use vts_gateway::{HttpTransport, ModelGateway};

const API_KEY_ENV: &str = "VTS_API_KEY";

fn cli() -> Command {
    Command::new("vts")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Validation test suite orchestrator")
        .subcommand_required(true)
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("run")
                .about("Run one requirements document and print the RunResult as JSON")
                .arg(
                    Arg::new("document")
                        .long("document")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Requirements document to process"),
                )
                .arg(
                    Arg::new("endpoint")
                        .long("endpoint")
                        .required(true)
                        .help("Model endpoint URL"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML run configuration; defaults apply when omitted"),
                )
                .arg(
                    Arg::new("signing-key")
                        .long("signing-key")
                        .help("Hex ed25519 seed for the audit chain; a fresh key is generated when omitted"),
                )
                .arg(
                    Arg::new("api-key")
                        .long("api-key")
                        .help("Bearer token for the endpoint; falls back to VTS_API_KEY"),
                )
                .arg(
                    Arg::new("validation-mode")
                        .long("validation-mode")
                        .action(ArgAction::SetTrue)
                        .help("Allow bypassable consultations to be suppressed"),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the RunResult here instead of stdout"),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Re-verify the audit chain and suite seal of a saved RunResult")
                .arg(
                    Arg::new("result")
                        .long("result")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate a TOML run configuration")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));

    let outcome = match matches.subcommand() {
        Some(("run", args)) => run(args).await,
        Some(("verify", args)) => verify(args),
        Some(("check-config", args)) => check_config(args),
        _ => Ok(ExitCode::FAILURE),
    };
    outcome.unwrap_or_else(|error| {
        tracing::error!(error = %format!("{error:#}"), "command failed");
        eprintln!("error: {error:#}");
        ExitCode::from(2)
    })
}

async fn run(args: &ArgMatches) -> Result<ExitCode> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RunConfig::default(),
    };
    if args.get_flag("validation-mode") {
        config = config.with_validation_mode(true);
    }

    let signer = match args.get_one::<String>("signing-key") {
        Some(seed) => AuditSigner::from_hex(seed).context("parsing --signing-key")?,
        None => AuditSigner::generate(),
    };

    let endpoint = args
        .get_one::<String>("endpoint")
        .context("--endpoint is required")?;
    let mut transport = HttpTransport::new(endpoint.as_str()).context("building HTTP transport")?;
    let api_key = args
        .get_one::<String>("api-key")
        .cloned()
        .or_else(|| std::env::var(API_KEY_ENV).ok());
    if let Some(key) = api_key {
        transport = transport.with_api_key(key);
    }

    let document = args
        .get_one::<PathBuf>("document")
        .context("--document is required")?;
    let (root, id) = split_document_path(document)?;

    let sink: Arc<dyn AuditSink> = Arc::new(MemoryAuditSink::new());
    let orchestrator = Orchestrator::new(
        config,
        ModelGateway::new(Arc::new(transport)),
        Arc::new(signer),
        sink,
    );
    let result = orchestrator
        .run_from_loader(&FsDocumentLoader::new(root), &id)
        .await
        .context("run aborted: audit chain could not be kept")?;

    let rendered = serde_json::to_string_pretty(&result)?;
    match args.get_one::<PathBuf>("out") {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{rendered}"),
    }
    Ok(exit_code(result.overall_status))
}

fn verify(args: &ArgMatches) -> Result<ExitCode> {
    let path = args
        .get_one::<PathBuf>("result")
        .context("--result is required")?;
    let result = read_result(path)?;
    match result.verify() {
        Ok(()) => {
            println!(
                "verified run {}: {} records, status {:?}, suite {}",
                result.run_id,
                result.audit_chain.len(),
                result.overall_status,
                if result.suite_seal.is_some() { "sealed" } else { "absent" },
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            println!("verification FAILED for run {}: {error}", result.run_id);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn check_config(args: &ArgMatches) -> Result<ExitCode> {
    let path = args
        .get_one::<PathBuf>("config")
        .context("--config is required")?;
    match RunConfig::from_file(path) {
        Ok(config) => {
            println!("{} is valid", path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            println!("{} is invalid: {error}", path.display());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn read_result(path: &Path) -> Result<RunResult> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Loader root and document id for a path on disk
fn split_document_path(path: &Path) -> Result<(PathBuf, DocumentId)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    let root = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((root, DocumentId::new(name)))
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::CompletedWithConsultation => ExitCode::from(3),
        RunStatus::Failed => ExitCode::FAILURE,
    }
}
