use std::path::{Path, PathBuf};

use clap::{Args, ValueEnum};
use contact_ledger_core::{ExpiryPolicy, FieldMappings, LedgerError, DEFAULT_MAX_MERGE_ATTEMPTS};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Runner settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[arg(long, env = "CONTACT_LEDGER_DB", default_value = "./contact_ledger.sqlite3")]
    pub db: PathBuf,

    /// Hours a record outlives its latest merge.
    #[arg(long, env = "CONTACT_RETENTION", default_value_t = 24)]
    pub retention_hours: u32,

    #[arg(
        long,
        env = "CONTACT_LEDGER_MAX_MERGE_ATTEMPTS",
        default_value_t = DEFAULT_MAX_MERGE_ATTEMPTS
    )]
    pub max_merge_attempts: u32,

    /// JSON file overriding the per-source field paths.
    #[arg(long, env = "CONTACT_LEDGER_FIELD_MAPPINGS")]
    pub field_mappings: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Validated configuration consumed by the runner.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
    pub expiry: ExpiryPolicy,
    pub max_merge_attempts: u32,
    pub field_mappings: FieldMappings,
}

impl LedgerConfig {
    /// # Errors
    /// Returns [`LedgerError::Configuration`] for a zero retention or
    /// attempt budget, or an unreadable or invalid field mapping file.
    pub fn from_args(args: &ConfigArgs) -> Result<Self, LedgerError> {
        if args.max_merge_attempts == 0 {
            return Err(LedgerError::Configuration(
                "--max-merge-attempts MUST be >= 1".to_string(),
            ));
        }

        let field_mappings = match &args.field_mappings {
            Some(path) => load_field_mappings(path)?,
            None => FieldMappings::default(),
        };

        Ok(Self {
            db_path: args.db.clone(),
            expiry: ExpiryPolicy::from_hours(args.retention_hours)?,
            max_merge_attempts: args.max_merge_attempts,
            field_mappings,
        })
    }
}

/// # Errors
/// Returns [`LedgerError::Configuration`] when the file cannot be read or
/// does not hold valid mappings.
pub fn load_field_mappings(path: &Path) -> Result<FieldMappings, LedgerError> {
    let body = std::fs::read_to_string(path).map_err(|err| {
        LedgerError::Configuration(format!(
            "failed to read field mappings {}: {err}",
            path.display()
        ))
    })?;
    let value: Value = serde_json::from_str(&body).map_err(|err| {
        LedgerError::Configuration(format!(
            "field mappings {} are not valid JSON: {err}",
            path.display()
        ))
    })?;
    FieldMappings::from_json(&value)
}
