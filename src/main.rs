use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use efatura::{ClientSettings, Credentials, DateRange, InvalidRangePolicy, PortalSession};

fn prompt_non_empty(prompt: &str) -> Result<String> {
    loop {
        print!("{}", prompt);
        io::stdout()
            .flush()
            .context("Failed to flush stdout while prompting for input")?;

        let mut input = String::new();
        io::stdin()
            .read_line(&mut input)
            .context("Failed to read prompt input")?;

        let trimmed = input.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }

        println!("Input cannot be empty. Please try again.\n");
    }
}

fn resolve_credential(value: Option<String>, env_key: &str, prompt: &str) -> Result<String> {
    if let Some(val) = value {
        let trimmed = val.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    if let Ok(val) = std::env::var(env_key) {
        if !val.trim().is_empty() {
            return Ok(val);
        }
    }
    prompt_non_empty(prompt)
}

/// Reads a line without trimming it. Only the line ending is dropped.
fn prompt_secret(prompt: &str) -> Result<String> {
    loop {
        print!("{}", prompt);
        io::stdout()
            .flush()
            .context("Failed to flush stdout while prompting for input")?;

        let mut input = String::new();
        io::stdin()
            .read_line(&mut input)
            .context("Failed to read prompt input")?;

        let line = input.trim_end_matches(['\r', '\n']);
        if !line.is_empty() {
            return Ok(line.to_string());
        }

        println!("Input cannot be empty. Please try again.\n");
    }
}

/// Flag → env → prompt, like [`resolve_credential`], but passes the value
/// through untouched: leading and trailing spaces are part of a password.
fn resolve_secret(value: Option<String>, env_key: &str, prompt: &str) -> Result<String> {
    if let Some(val) = value.filter(|v| !v.is_empty()) {
        return Ok(val);
    }
    if let Ok(val) = std::env::var(env_key) {
        if !val.is_empty() {
            return Ok(val);
        }
    }
    prompt_secret(prompt)
}

#[derive(Parser)]
#[command(name = "efatura")]
#[command(about = "Fetch invoices from the e-Fatura portal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and print the invoices registered between two dates
    Invoices {
        /// NIF used to log in (falls back to EFATURA_NIF)
        #[arg(long)]
        nif: Option<String>,

        /// Portal password (falls back to EFATURA_PASSWORD)
        #[arg(long)]
        password: Option<String>,

        /// First day, YYYY-MM-DD
        #[arg(long)]
        start: String,

        /// Last day, YYYY-MM-DD
        #[arg(long)]
        end: String,

        /// Fail on an invalid range instead of querying without logging in
        #[arg(long, default_value_t = false)]
        strict_dates: bool,

        /// Issue one query per calendar year and print an array of the responses
        #[arg(long, default_value_t = false)]
        split_years: bool,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        compact: bool,

        #[arg(long)]
        connect_timeout: Option<u64>,

        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Check a date range without contacting the portal
    CheckRange {
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,
    },
}

fn build_settings(connect_timeout: Option<u64>, timeout: Option<u64>) -> Result<ClientSettings> {
    let settings = ClientSettings::from_env().context("Invalid client settings in environment")?;
    let connect = connect_timeout
        .map(Duration::from_secs)
        .unwrap_or(settings.connect_timeout);
    let total = timeout.map(Duration::from_secs).unwrap_or(settings.timeout);
    if connect.is_zero() || total.is_zero() {
        bail!("Timeouts must be greater than zero seconds");
    }
    Ok(settings.with_timeouts(connect, total))
}

async fn fetch_range(
    credentials: &Credentials,
    range: DateRange,
    settings: &ClientSettings,
    policy: InvalidRangePolicy,
) -> Result<Value> {
    info!("Fetching invoices from {} to {}", range.start(), range.end());
    let session = PortalSession::with_settings(credentials.clone(), range, settings.clone())?
        .with_policy(policy);
    let invoices = session
        .fetch_invoices()
        .await
        .context("Failed to fetch invoices from e-Fatura")?;
    Ok(invoices)
}

fn write_output(value: &Value, output: Option<PathBuf>, compact: bool) -> Result<()> {
    let rendered = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };

    match output {
        Some(path) => {
            std::fs::write(&path, rendered)
                .with_context(|| format!("Failed to write invoices to {}", path.display()))?;
            info!("Invoices written to {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenv::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Invoices {
            nif,
            password,
            start,
            end,
            strict_dates,
            split_years,
            output,
            compact,
            connect_timeout,
            timeout,
        } => {
            let start_time = Instant::now();
            let settings = build_settings(connect_timeout, timeout)?;
            let policy = if strict_dates {
                InvalidRangePolicy::Reject
            } else {
                InvalidRangePolicy::SkipLogin
            };

            let nif = resolve_credential(nif, "EFATURA_NIF", "NIF: ")?;
            let password = resolve_secret(password, "EFATURA_PASSWORD", "Password: ")?;
            let credentials = Credentials::new(nif, password);
            let range = DateRange::new(start, end);

            let invoices = if split_years {
                let pieces = range
                    .split_by_year()
                    .context("Cannot split the date range by year")?;
                info!("Splitting query into {} yearly requests", pieces.len());

                let mut responses = Vec::with_capacity(pieces.len());
                for piece in pieces {
                    responses.push(fetch_range(&credentials, piece, &settings, policy).await?);
                }
                Value::Array(responses)
            } else {
                fetch_range(&credentials, range, &settings, policy).await?
            };

            write_output(&invoices, output, compact)?;
            info!("Done in {:.1}s", start_time.elapsed().as_secs_f64());
        }

        Commands::CheckRange { start, end } => {
            let range = DateRange::new(start, end);
            match range.validate() {
                Ok(()) => println!("✅ {} .. {} is a valid range", range.start(), range.end()),
                Err(reason) => {
                    if let Ok(pieces) = range.split_by_year() {
                        println!("Use --split-years to query it as {} ranges:", pieces.len());
                        for piece in pieces {
                            println!("  {} .. {}", piece.start(), piece.end());
                        }
                    }
                    bail!("Invalid range: {}", reason);
                }
            }
        }
    }

    Ok(())
}
