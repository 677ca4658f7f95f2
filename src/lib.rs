pub mod cli;
pub mod config;
pub mod context;
pub mod data;
pub mod duplicates;
pub mod error;
pub mod filter;
pub mod io_utils;
pub mod markup;
pub mod normalize;
pub mod prepare;
pub mod reader;
pub mod recon;
pub mod table;

use std::{env, path::Path, sync::OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use encoding_rs::Encoding;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{Cli, Commands, InferArgs, SharedArgs},
    config::ReconConfig,
    context::{ContextInferrer, ContextSource, Provenance},
    normalize::Normalizer,
    reader::{SourceTable, TabularReader},
    table::Table,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("deal_recon", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Gaps(args) => recon::execute(&args),
        Commands::Duplicates(args) => duplicates::execute(&args),
        Commands::Prepare(args) => prepare::execute(&args),
        Commands::Infer(args) => handle_infer(&args),
    }
}

/// Configuration and I/O settings resolved once per command.
pub struct Session {
    config: ReconConfig,
    normalizer: Normalizer,
    fallback: &'static Encoding,
    input_encoding: Option<&'static Encoding>,
    output_encoding: &'static Encoding,
    delimiter: Option<u8>,
}

impl Session {
    pub fn new(shared: &SharedArgs) -> Result<Self> {
        let config = ReconConfig::load(shared.config.as_deref())?;
        let fallback = config.fallback_encoding()?;
        let input_encoding = shared
            .input_encoding
            .as_deref()
            .map(|label| io_utils::resolve_encoding(Some(label)))
            .transpose()?;
        let output_encoding = io_utils::resolve_encoding(shared.output_encoding.as_deref())?;
        let normalizer = Normalizer::new(config.alias_table(), config.placeholder_table());
        debug!(
            "Session: fallback encoding {}, output encoding {}, delimiter {:?}",
            fallback.name(),
            output_encoding.name(),
            shared.delimiter.map(printable_delimiter)
        );
        Ok(Self {
            config,
            normalizer,
            fallback,
            input_encoding,
            output_encoding,
            delimiter: shared.delimiter,
        })
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn reader(&self) -> TabularReader<'_> {
        TabularReader::new(self.normalizer.aliases(), self.fallback)
            .with_delimiter(self.delimiter)
            .with_encoding(self.input_encoding)
    }

    pub fn read_source(&self, path: &Path) -> Result<SourceTable> {
        let bytes = io_utils::read_input(path)?;
        let name = source_name(path);
        self.reader()
            .read(&name, &bytes)
            .with_context(|| format!("Reading {path:?}"))
    }

    /// The raw table of `path`, before normalization.
    pub fn read_path(&self, path: &Path) -> Result<Table> {
        Ok(self.read_source(path)?.table)
    }

    pub fn load_normalized(&self, path: &Path) -> Result<Table> {
        let table = self.normalizer.normalize(self.read_path(path)?);
        debug!(
            "Loaded {} row(s) x {} column(s) from {:?}",
            table.len(),
            table.headers.len(),
            path
        );
        Ok(table)
    }

    pub fn output_delimiter(&self) -> u8 {
        self.delimiter.unwrap_or(io_utils::DEFAULT_CSV_DELIMITER)
    }

    pub fn output_encoding(&self) -> &'static Encoding {
        self.output_encoding
    }
}

fn source_name(path: &Path) -> String {
    if io_utils::is_dash(path) {
        return "stdin.csv".to_string();
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("input")
        .to_string()
}

fn handle_infer(args: &InferArgs) -> Result<()> {
    let session = Session::new(&args.shared)?;
    let source = session.read_source(&args.reference)?;
    let name = source_name(&args.reference);
    info!(
        "Inferring context for '{}' ({:?}, {} preamble cell(s))",
        name,
        source.format,
        source.preamble.len()
    );
    let reference = session.normalizer().normalize(source.table);
    let inferrer =
        ContextInferrer::from_config(session.config()).with_explicit(args.context.to_explicit());
    let context = inferrer
        .infer(
            &reference,
            &Provenance {
                file_name: &name,
                preamble: &source.preamble,
            },
        )
        .with_context(|| format!("Inferring context for {:?}", args.reference))?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&context).context("Serializing context")?
        );
        return Ok(());
    }
    let headers = ["dimension", "value", "source"].map(String::from).to_vec();
    let evidence = |source: Option<ContextSource>| {
        source.map(|s| format!("{s:?}")).unwrap_or_else(|| "-".to_string())
    };
    let rows = vec![
        vec![
            "dates".to_string(),
            context
                .dates
                .map(|d| format!("{} .. {}", d.from, d.to))
                .unwrap_or_else(|| "-".to_string()),
            evidence(context.evidence.dates),
        ],
        vec![
            "location".to_string(),
            context
                .location
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string()),
            evidence(context.evidence.location),
        ],
    ];
    table::print_table(&headers, &rows);
    println!("reference rows: {}", reference.len());
    Ok(())
}

pub(crate) fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        b'\n' => "\\n".to_string(),
        other => (other as char).to_string(),
    }
}
