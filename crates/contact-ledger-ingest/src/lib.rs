//! Service runner for the contact ledger.
//!
//! Every subcommand prints exactly one JSON document on stdout; logs go to
//! stderr. Embedders can drive the same surface through [`run_cli`], or use
//! [`Ingestor`] and [`submit_delivery`] directly.

use std::io::BufReader;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use contact_ledger_core::{now_utc, ContactId, ErrorKind, LedgerError, MergeEngine, SourceKind};
use contact_ledger_store_sqlite::SqliteRecordStore;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

pub mod config;
pub mod envelope;
pub mod ingest;

pub use config::{ConfigArgs, LedgerConfig, LogFormat};
pub use envelope::{unwrap_envelope, Delivery};
pub use ingest::{
    merge_with_redelivery, partition, submit_delivery, Disposition, IngestReport, Ingestor,
    MergeOutcome, RedeliveryPolicy, DEFAULT_MAX_REDELIVERIES, DEFAULT_WORKERS,
};

#[derive(Debug, Parser)]
#[command(name = "contact-ledger")]
#[command(about = "Merge contact events into per-contact records")]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Merge newline-delimited deliveries from a file or stdin.
    Ingest(IngestArgs),
    /// Merge one delivery given on the command line.
    Submit(SubmitArgs),
    /// Print the stored record for a contact.
    Show(ShowArgs),
    /// Delete records whose expiry has passed.
    Sweep,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_REDELIVERIES)]
    max_redeliveries: u32,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[arg(long)]
    source_kind: SourceKindArg,
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    contact_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceKindArg {
    #[value(name = "contact_flow_log")]
    ContactFlowLog,
    #[value(name = "contact_flow_invocation")]
    ContactFlowInvocation,
    #[value(name = "lifecycle_event")]
    LifecycleEvent,
}

impl From<SourceKindArg> for SourceKind {
    fn from(value: SourceKindArg) -> Self {
        match value {
            SourceKindArg::ContactFlowLog => Self::ContactFlowLog,
            SourceKindArg::ContactFlowInvocation => Self::ContactFlowInvocation,
            SourceKindArg::LifecycleEvent => Self::LifecycleEvent,
        }
    }
}

/// Whether the command reached its goal; drives the process exit status.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RunStatus {
    Success,
    Failure,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorPayload,
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

/// Stable machine code for a ledger error.
#[must_use]
pub fn error_code(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::MalformedEvent => "event.malformed",
        ErrorKind::StoreUnavailable => "store.unavailable",
        ErrorKind::MergeConflict => "merge.conflict",
        ErrorKind::Configuration => "config.invalid",
    }
}

/// # Errors
/// Returns an error only when output cannot be written. Every other failure,
/// configuration and storage included, is reported as an error envelope on
/// stdout with [`RunStatus::Failure`].
pub fn run_cli(cli: Cli) -> Result<RunStatus> {
    let config = match LedgerConfig::from_args(&cli.config) {
        Ok(value) => value,
        Err(err) => return report_error(&err),
    };
    match cli.command {
        Command::Ingest(args) => run_ingest(&config, &args),
        Command::Submit(args) => run_submit(&config, &args),
        Command::Show(args) => run_show(&config, &args),
        Command::Sweep => run_sweep(&config),
    }
}

fn store_unavailable(err: &anyhow::Error) -> LedgerError {
    LedgerError::StoreUnavailable(format!("{err:#}"))
}

fn open_store(config: &LedgerConfig) -> Result<SqliteRecordStore, LedgerError> {
    SqliteRecordStore::open_migrated(&config.db_path).map_err(|err| store_unavailable(&err))
}

fn run_ingest(config: &LedgerConfig, args: &IngestArgs) -> Result<RunStatus> {
    let policy = RedeliveryPolicy {
        max_redeliveries: args.max_redeliveries,
        ..RedeliveryPolicy::default()
    };
    let ingestor = match Ingestor::new(config, args.workers, policy) {
        Ok(value) => value,
        Err(err) => return report_error(&err),
    };

    let outcome = match &args.input {
        Some(path) => match std::fs::File::open(path) {
            Ok(file) => ingestor.run(BufReader::new(file)),
            Err(err) => {
                let err = LedgerError::Configuration(format!(
                    "failed to open input {}: {err}",
                    path.display()
                ));
                return report_error(&err);
            }
        },
        None => ingestor.run(std::io::stdin().lock()),
    };
    let report = match outcome {
        Ok(value) => value,
        Err(err) => return report_error(&store_unavailable(&err)),
    };

    print_json(&report)?;
    if report.failed > 0 {
        return Ok(RunStatus::Failure);
    }
    Ok(RunStatus::Success)
}

fn run_submit(config: &LedgerConfig, args: &SubmitArgs) -> Result<RunStatus> {
    let payload: Value = match serde_json::from_str(&args.payload) {
        Ok(value) => value,
        Err(err) => {
            let err = LedgerError::MalformedEvent(format!("--payload is not JSON: {err}"));
            return report_error(&err);
        }
    };

    let store = match open_store(config) {
        Ok(value) => value,
        Err(err) => return report_error(&err),
    };
    let engine = match MergeEngine::new(&store, config.expiry, config.max_merge_attempts) {
        Ok(value) => value,
        Err(err) => return report_error(&err),
    };
    match submit_delivery(
        &engine,
        &config.field_mappings,
        args.source_kind.into(),
        &payload,
    ) {
        Ok(records) => {
            print_json(&records)?;
            Ok(RunStatus::Success)
        }
        Err(err) => report_error(&err),
    }
}

fn run_show(config: &LedgerConfig, args: &ShowArgs) -> Result<RunStatus> {
    let contact_id = match ContactId::parse(&args.contact_id) {
        Ok(value) => value,
        Err(err) => return report_error(&err),
    };

    let loaded = open_store(config).and_then(|store| {
        store
            .load(&contact_id)
            .map_err(|err| store_unavailable(&err))
    });
    match loaded {
        Ok(Some(record)) => {
            print_json(&record)?;
            Ok(RunStatus::Success)
        }
        Ok(None) => {
            print_json(&ErrorEnvelope {
                error: ErrorPayload {
                    code: "record.not_found",
                    message: format!("no record for contact {contact_id}"),
                    details: Some(json!({ "contact_id": contact_id })),
                },
            })?;
            Ok(RunStatus::Failure)
        }
        Err(err) => report_error(&err),
    }
}

fn run_sweep(config: &LedgerConfig) -> Result<RunStatus> {
    let purged = open_store(config).and_then(|store| {
        store
            .purge_expired(now_utc())
            .map_err(|err| store_unavailable(&err))
    });
    match purged {
        Ok(purged) => {
            print_json(&json!({ "purged": purged }))?;
            Ok(RunStatus::Success)
        }
        Err(err) => report_error(&err),
    }
}

fn report_error(err: &LedgerError) -> Result<RunStatus> {
    warn!(error = %err, kind = err.kind().as_str(), "command failed");
    print_json(&ErrorEnvelope {
        error: ErrorPayload {
            code: error_code(err.kind()),
            message: err.to_string(),
            details: Some(json!({ "retryable": err.is_retryable() })),
        },
    })?;
    Ok(RunStatus::Failure)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
