use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use crate::{
    context::{DateRange, ExplicitContext},
    data::parse_day_first_date,
    duplicates::DuplicateMode,
};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Reconcile real-estate transaction scans against reference exports",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Find reference transactions that are missing from a scan file
    Gaps(GapsArgs),
    /// Report duplicate deals in the latest snapshot of a scan file
    Duplicates(DuplicatesArgs),
    /// Normalize a scan file into an upload-ready CSV
    Prepare(PrepareArgs),
    /// Show the date range and location inferred for a reference file
    Infer(InferArgs),
}

/// Flags shared by every command.
#[derive(Debug, Args)]
pub struct SharedArgs {
    /// YAML file with alias, placeholder and export overrides
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of text inputs (detected when omitted)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Character encoding for output files (defaults to utf-8 with BOM)
    #[arg(long = "output-encoding")]
    pub output_encoding: Option<String>,
}

/// Explicit query context; each value overrides the inferred one.
#[derive(Debug, Args, Default)]
pub struct ContextArgs {
    /// First sale date to include (DD/MM/YYYY)
    #[arg(long = "date-from", value_parser = parse_date, requires = "date_to")]
    pub date_from: Option<NaiveDate>,
    /// Last sale date to include (DD/MM/YYYY)
    #[arg(long = "date-to", value_parser = parse_date, requires = "date_from")]
    pub date_to: Option<NaiveDate>,
    /// Area code to filter on; repeat or comma-separate for several
    #[arg(long = "area-code", value_delimiter = ',', action = clap::ArgAction::Append)]
    pub area_codes: Vec<String>,
    /// Location name to filter on (substring match)
    #[arg(long)]
    pub location: Option<String>,
}

impl ContextArgs {
    pub fn to_explicit(&self) -> ExplicitContext {
        let dates = match (self.date_from, self.date_to) {
            (Some(from), Some(to)) => Some(DateRange::new(from, to)),
            _ => None,
        };
        ExplicitContext {
            dates,
            area_codes: self
                .area_codes
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            location_name: self.location.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct GapsArgs {
    /// Scan CSV file holding the transactions already collected
    #[arg(short = 's', long = "scan")]
    pub scan: PathBuf,
    /// Reference export (csv, xls, xlsx, html) or a zip of them; repeatable
    #[arg(short = 'r', long = "reference", required = true, action = clap::ArgAction::Append)]
    pub references: Vec<PathBuf>,
    /// Missing-rows CSV path (overrides --output-dir)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// Directory for the generated missing-rows file
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,
    /// Write per-source and global statistics as JSON
    #[arg(long = "summary-json")]
    pub summary_json: Option<PathBuf>,
    /// Number of missing rows to print
    #[arg(long, default_value_t = 10)]
    pub preview: usize,
    #[command(flatten)]
    pub context: ContextArgs,
    #[command(flatten)]
    pub shared: SharedArgs,
}

#[derive(Debug, Args)]
pub struct DuplicatesArgs {
    /// Scan CSV file to check
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Report one row per group or every duplicated row
    #[arg(long, value_enum, default_value = "summary")]
    pub mode: DuplicateMode,
    /// Output CSV path (overrides --output-dir)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// Directory for the generated duplicates file
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,
    /// Number of result rows to print
    #[arg(long, default_value_t = 10)]
    pub preview: usize,
    #[command(flatten)]
    pub shared: SharedArgs,
}

#[derive(Debug, Args)]
pub struct PrepareArgs {
    /// Scan CSV file to prepare
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Output CSV path (overrides --output-dir)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// Directory for the prepared file
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,
    /// Number of prepared rows to print
    #[arg(long, default_value_t = 0)]
    pub preview: usize,
    #[command(flatten)]
    pub shared: SharedArgs,
}

#[derive(Debug, Args)]
pub struct InferArgs {
    /// Reference export to inspect
    #[arg(short = 'r', long = "reference")]
    pub reference: PathBuf,
    /// Print the context as JSON instead of a table
    #[arg(long)]
    pub json: bool,
    #[command(flatten)]
    pub context: ContextArgs,
    #[command(flatten)]
    pub shared: SharedArgs,
}

pub fn parse_date(value: &str) -> Result<NaiveDate, String> {
    parse_day_first_date(value).map_err(|err| err.to_string())
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
