use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use quiz_core::model::{QuestionId, QuestionStat};
use services::{AggregationError, AggregatorConfig, AttemptAggregator, Clock};
use storage::repository::{CounterStore, Storage, StorageError};

const DB_URL_ENV: &str = "QUIZ_STATS_DB_URL";
const DEFAULT_DB_URL: &str = "sqlite://quiz_stats.sqlite3";
const MAX_DELIVERY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidMaxOps { raw: String },
    InvalidDbUrl { raw: String },
    MissingQuestionId,
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidMaxOps { raw } => write!(f, "invalid --max-ops value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::MissingQuestionId => write!(f, "stat requires a question id"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- ingest [--db <sqlite_url>] [--max-ops <n>] [FILE]");
    eprintln!("  cargo run -p app -- stat <question_id> [--db <sqlite_url>]");
    eprintln!();
    eprintln!("ingest reads one JSON envelope per line from FILE or stdin:");
    eprintln!(r#"  {{"attemptId":"a1","record":{{"results":[{{"questionId":"q1","isCorrect":true}}]}}}}"#);
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db {DEFAULT_DB_URL}");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  {DB_URL_ENV}, QUIZ_STATS_MAX_OPS, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Ingest,
    Stat,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "ingest" => Some(Self::Ingest),
            "stat" => Some(Self::Stat),
            _ => None,
        }
    }
}

struct Args {
    db_url: String,
    max_ops: Option<usize>,
    input: Option<PathBuf>,
    question_id: Option<String>,
}

impl Args {
    fn parse(cmd: Command, args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let db_url = std::env::var(DB_URL_ENV)
            .ok()
            .map_or_else(|| DEFAULT_DB_URL.into(), normalize_sqlite_url);
        let mut parsed = Self {
            db_url,
            max_ops: None,
            input: None,
            question_id: None,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    parsed.db_url = normalize_sqlite_url(value);
                }
                "--max-ops" if cmd == Command::Ingest => {
                    let value = require_value(args, "--max-ops")?;
                    let max = services::config::parse_max_ops(&value)
                        .map_err(|_| ArgsError::InvalidMaxOps { raw: value.clone() })?;
                    parsed.max_ops = Some(max);
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                other if other.starts_with("--") => return Err(ArgsError::UnknownArg(arg)),
                _ => match cmd {
                    Command::Ingest if parsed.input.is_none() => {
                        parsed.input = Some(PathBuf::from(arg));
                    }
                    Command::Stat if parsed.question_id.is_none() => {
                        parsed.question_id = Some(arg);
                    }
                    _ => return Err(ArgsError::UnknownArg(arg)),
                },
            }
        }

        if cmd == Command::Stat && parsed.question_id.is_none() {
            return Err(ArgsError::MissingQuestionId);
        }
        Ok(parsed)
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

//
// ─── INGEST ────────────────────────────────────────────────────────────────────
//

/// One line of ingest input: a new attempt as the submission side stored it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    attempt_id: String,
    record: serde_json::Value,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestSummary {
    applied: usize,
    duplicates: usize,
    malformed: usize,
    failed: usize,
}

/// Deliver one envelope, retrying transient store failures.
///
/// Redelivering after a partial failure is safe: committed chunks carry their
/// own markers and are skipped.
async fn deliver(
    aggregator: &AttemptAggregator,
    envelope: &Envelope,
) -> Result<services::ApplyOutcome, AggregationError> {
    let mut attempt = 1;
    loop {
        match aggregator
            .handle(&envelope.attempt_id, &envelope.record)
            .await
        {
            Err(err) if err.is_retryable() && attempt < MAX_DELIVERY_ATTEMPTS => {
                log_retry(&envelope.attempt_id, attempt, &err);
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// How a retried failure is reported before the next delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryNotice {
    /// Some chunks are committed; the redelivery resumes after them.
    Partial { committed: usize, total: usize },
    Transient,
}

impl RetryNotice {
    fn of(err: &AggregationError) -> Self {
        match err {
            AggregationError::PartialApplyFailure {
                committed, total, ..
            } => Self::Partial {
                committed: *committed,
                total: *total,
            },
            _ => Self::Transient,
        }
    }
}

fn log_retry(attempt_id: &str, attempt: u32, err: &AggregationError) {
    match RetryNotice::of(err) {
        RetryNotice::Partial { committed, total } => tracing::error!(
            attempt_id,
            attempt,
            committed,
            total,
            error = %err,
            "attempt partially applied; redelivering to resume remaining units"
        ),
        RetryNotice::Transient => tracing::warn!(
            attempt_id,
            attempt,
            error = %err,
            "retrying delivery"
        ),
    }
}

async fn ingest(
    aggregator: &AttemptAggregator,
    input: Option<PathBuf>,
) -> Result<IngestSummary, Box<dyn std::error::Error>> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut summary = IngestSummary::default();
    let mut lines = reader.lines();
    let mut line_no = 0_usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let envelope: Envelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(line = line_no, error = %err, "skipping unreadable envelope");
                summary.malformed += 1;
                continue;
            }
        };

        match deliver(aggregator, &envelope).await {
            Ok(outcome) if outcome.is_duplicate() => summary.duplicates += 1,
            Ok(_) => summary.applied += 1,
            Err(AggregationError::MalformedRecord(err)) => {
                eprintln!("line {line_no}: attempt {}: {err}", envelope.attempt_id);
                summary.malformed += 1;
            }
            Err(err) => {
                tracing::error!(line = line_no, attempt_id = %envelope.attempt_id, error = %err, "delivery failed");
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv = std::env::args().skip(1);

    let cmd = match argv.next() {
        None => {
            print_usage();
            return Ok(());
        }
        Some(first) if first == "--help" || first == "-h" => {
            print_usage();
            return Ok(());
        }
        Some(first) => Command::from_arg(&first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };

    let parsed = Args::parse(cmd, &mut argv).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    prepare_sqlite_file(&parsed.db_url)?;

    match cmd {
        Command::Ingest => {
            let mut config = AggregatorConfig::from_env()?;
            if let Some(max_ops) = parsed.max_ops {
                config = config.with_max_ops(max_ops);
            }
            let (_storage, aggregator) =
                AttemptAggregator::sqlite(&parsed.db_url, Clock::default_clock(), config).await?;
            let summary = ingest(&aggregator, parsed.input).await?;
            println!("{}", serde_json::to_string(&summary)?);
            if summary.failed > 0 {
                return Err(format!("{} deliveries failed", summary.failed).into());
            }
            Ok(())
        }
        Command::Stat => {
            let raw = parsed.question_id.unwrap_or_default();
            let question_id = QuestionId::new(raw)?;
            let storage = Storage::sqlite(&parsed.db_url).await?;
            let stat = match storage.counters.get_stat(&question_id).await {
                Ok(stat) => stat,
                Err(StorageError::NotFound) => QuestionStat::zero(question_id),
                Err(err) => return Err(err.into()),
            };
            println!("{}", serde_json::to_string_pretty(&stat)?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
