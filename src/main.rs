//! `agentbook` command line.
//!
//! Thin wrapper over the library for scripting and for the UI collaborator:
//! every command prints JSON on stdout; failures print an `ErrorPayload` on
//! stderr and exit non-zero. Logging goes through `RUST_LOG`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use agentbook_lib::config::AppConfig;
use agentbook_lib::db::{CrmDb, DbError, HoldFilter};
use agentbook_lib::error::{ErrorPayload, ImportError};
use agentbook_lib::holds::{Correction, Decision, HoldStatus, HoldStore};
use agentbook_lib::import::{ApplyProgress, Importer};
use agentbook_lib::masked::MaskedImporter;
use agentbook_lib::sheet::read_upload;

const CORP_SEARCH_LIMIT: u32 = 200;
const BATCH_LIMIT: u32 = 20;

#[derive(Parser)]
#[command(name = "agentbook")]
#[command(about = "Customer and policy book: spreadsheet import, reconciliation, hold review")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify every row of an upload and sync held rows
    Analyze { file: PathBuf },

    /// Analyze, then write the upload row by row
    Apply {
        file: PathBuf,
        /// Leave rows that change existing customers or contracts alone
        #[arg(long)]
        no_updates: bool,
        /// Re-check rows previewed as unchanged
        #[arg(long)]
        verify_same: bool,
        /// Attempt contracts previewed as ambiguous
        #[arg(long)]
        force_holds: bool,
    },

    /// Attach contracts from a masked-name export to existing customers
    Masked { file: PathBuf },

    /// Record a SKIP for every open hold of an upload
    SkipOpen { file: PathBuf },

    /// List holds with batch and reason summaries
    Holds {
        #[arg(value_enum, default_value = "open")]
        status: StatusArg,
    },

    /// Store a correction on a hold; "-" keeps the current value
    Correct {
        hold_id: i64,
        name: String,
        phone: String,
        birth: String,
    },

    /// Decide a hold
    Decide {
        hold_id: i64,
        #[command(subcommand)]
        decision: DecisionArg,
    },

    /// Search contracts held by corporations
    Corp { query: String },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
enum StatusArg {
    Open,
    Skipped,
    Resolved,
    All,
}

impl StatusArg {
    fn statuses(self) -> Vec<String> {
        let status = match self {
            StatusArg::All => return Vec::new(),
            StatusArg::Open => HoldStatus::Open,
            StatusArg::Skipped => HoldStatus::Skipped,
            StatusArg::Resolved => HoldStatus::Resolved,
        };
        vec![status.as_str().to_string()]
    }
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq, Debug)]
enum DecisionArg {
    /// Bind the row to an existing customer
    Map { customer_id: i64 },
    /// Create a new customer without phone dedupe
    New,
    /// Leave the row out
    Skip,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Map { customer_id } => Decision::MapExisting { customer_id },
            DecisionArg::New => Decision::CreateNew,
            DecisionArg::Skip => Decision::Skip,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            let payload = ErrorPayload::from(&e);
            match serde_json::to_string_pretty(&payload) {
                Ok(json) => eprintln!("{}", json),
                Err(_) => eprintln!("{}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ImportError> {
    let json = serde_json::to_string_pretty(value).map_err(DbError::from)?;
    println!("{}", json);
    Ok(())
}

fn log_progress(p: &ApplyProgress) {
    if p.done == p.total || p.done % 50 == 0 {
        log::info!("{}/{} rows (row {})", p.done, p.total, p.row_no);
    }
}

/// `None` for blank or "-".
fn kept(value: String) -> Option<String> {
    let value = value.trim();
    (!value.is_empty() && value != "-").then(|| value.to_string())
}

fn run(command: Command) -> Result<(), ImportError> {
    let config = AppConfig::load()?;
    let db = config.open_db()?;
    let classifier = config.classifier();
    let actor = config.actor.as_str();
    let importer = Importer::new(&db, &classifier, actor);

    match command {
        Command::Analyze { file } => {
            let (upload, rows) = read_upload(&file)?;
            warn_if_applied(&db, &upload.file_hash, &upload.filename)?;
            let (analysis, synced) = importer.analyze_and_sync(&upload, rows)?;
            log::info!("{} holds synced", synced);
            print_json(&analysis)
        }
        Command::Apply {
            file,
            no_updates,
            verify_same,
            force_holds,
        } => {
            let mut options = config.apply_options();
            options.apply_updates &= !no_updates;
            options.verify_same |= verify_same;
            options.force_holds = force_holds;
            let (upload, rows) = read_upload(&file)?;
            let (analysis, _) = importer.analyze_and_sync(&upload, rows)?;
            let stats = importer.apply(&analysis, &HashMap::new(), &options, &mut log_progress)?;
            print_json(&stats)
        }
        Command::Masked { file } => {
            let (upload, rows) = read_upload(&file)?;
            let stats = MaskedImporter::new(&db).import(&upload, &rows, &mut log_progress)?;
            print_json(&stats)
        }
        Command::SkipOpen { file } => {
            let (upload, rows) = read_upload(&file)?;
            let (analysis, _) = importer.analyze_and_sync(&upload, rows)?;
            let skipped = importer.skip_open_holds(&analysis)?;
            print_json(&serde_json::json!({ "skipped": skipped }))
        }
        Command::Holds { status } => {
            let filter = HoldFilter {
                statuses: status.statuses(),
                ..Default::default()
            };
            let store = HoldStore::new(&db, actor);
            print_json(&serde_json::json!({
                "holds": store.list(&filter)?,
                "batches": store.batches(BATCH_LIMIT)?,
                "reasonCodes": store.reason_codes()?,
            }))
        }
        Command::Correct {
            hold_id,
            name,
            phone,
            birth,
        } => {
            let correction = Correction {
                name: kept(name),
                phone: kept(phone),
                birth_date: kept(birth),
            };
            print_json(&HoldStore::new(&db, actor).correct(hold_id, &correction)?)
        }
        Command::Decide { hold_id, decision } => {
            print_json(&HoldStore::new(&db, actor).decide(hold_id, decision.into())?)
        }
        Command::Corp { query } => {
            print_json(&db.search_corporate_contracts(&query, CORP_SEARCH_LIMIT)?)
        }
    }
}

fn warn_if_applied(db: &CrmDb, file_hash: &str, filename: &str) -> Result<(), ImportError> {
    if db.find_upload(file_hash, "apply")?.is_some() {
        log::warn!("{} was already applied once", filename);
    }
    Ok(())
}
