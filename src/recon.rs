//! Reconciliation engine: which reference transactions have no counterpart in
//! the scan dataset.
//!
//! Each reference source runs through the same pipeline in isolation:
//! read → normalize → infer context → filter both sides → key set difference.
//! A failing source is recorded with its error and contributes no rows; it
//! never stops its siblings. Results are merged afterwards.

use std::{
    collections::BTreeSet,
    fs,
    io::{Cursor, Read},
    path::Path,
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use zip::ZipArchive;

use crate::{
    Session,
    cli::GapsArgs,
    context::{ContextInferrer, ContextSource, InferredContext, LocationKind, Provenance},
    data::{ComparableValue, Value},
    error::ReconError,
    filter::{filter_by_dates, filter_by_location, location_from_table},
    io_utils::{self, DateStyle},
    normalize::{Column, Normalizer},
    reader::{SourceFormat, TabularReader},
    table::{self, Table},
};

/// Record identity across datasets. Unlike the duplicate key it leaves out
/// `snapshot_date`, which only the scan carries.
pub const MATCH_KEY: [Column; 8] = [
    Column::ParcelId,
    Column::SaleDate,
    Column::DeclaredProfit,
    Column::SoldFraction,
    Column::LocationName,
    Column::BuildYear,
    Column::FloorArea,
    Column::RoomCount,
];

/// Added to missing rows to name the reference source they came from.
pub const SOURCE_COLUMN: &str = "reference_source";

pub const MULTI_SOURCE_ARTIFACT: &str = "gap_multi_summary.csv";

#[derive(Debug, Clone)]
pub struct ReferenceSource {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub enum SourceEntry {
    Ready(ReferenceSource),
    /// A source that could not even be extracted; reported as an error entry.
    Unreadable { name: String, error: ReconError },
}

pub fn is_archive(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

/// One entry per reference file. Archives are expanded into their supported
/// members, with inner folders flattened into the member name.
pub fn collect_sources(name: &str, bytes: Vec<u8>) -> Vec<SourceEntry> {
    if !is_archive(name) {
        return vec![SourceEntry::Ready(ReferenceSource {
            name: name.to_string(),
            bytes,
        })];
    }
    match expand_archive(name, bytes) {
        Ok(entries) if entries.is_empty() => vec![SourceEntry::Unreadable {
            name: name.to_string(),
            error: ReconError::unsupported(name, "archive contains no supported reference files"),
        }],
        Ok(entries) => entries,
        Err(error) => vec![SourceEntry::Unreadable {
            name: name.to_string(),
            error,
        }],
    }
}

fn expand_archive(name: &str, bytes: Vec<u8>) -> crate::error::Result<Vec<SourceEntry>> {
    let archive_err = |source| ReconError::Archive {
        source_name: name.to_string(),
        source,
    };
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(archive_err)?;
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let listed = archive
            .name_for_index(i)
            .map(|n| n.replace('/', "_"))
            .unwrap_or_else(|| format!("{name}#{i}"));
        // A member that cannot be opened only fails itself.
        let mut file = match archive.by_index(i) {
            Ok(file) => file,
            Err(source) => {
                warn!("Archive member '{listed}' cannot be opened: {source}");
                entries.push(SourceEntry::Unreadable {
                    name: listed,
                    error: archive_err(source),
                });
                continue;
            }
        };
        if !file.is_file() {
            continue;
        }
        let member = file.name().replace('/', "_");
        if SourceFormat::from_extension(&member).is_none() {
            debug!("Skipping archive member '{}'", file.name());
            continue;
        }
        let mut buf = Vec::new();
        match file.read_to_end(&mut buf) {
            Ok(_) => entries.push(SourceEntry::Ready(ReferenceSource {
                name: member,
                bytes: buf,
            })),
            Err(err) => entries.push(SourceEntry::Unreadable {
                name: member,
                error: ReconError::Io(err),
            }),
        }
    }
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub context: Option<InferredContext>,
    pub key_columns: Vec<String>,
    pub reference_rows_total: usize,
    pub reference_rows_filtered: usize,
    pub scan_rows_filtered: usize,
    pub missing_count: usize,
    pub missing_pct_of_source: f64,
    pub missing_pct_of_global: f64,
}

impl SourceReport {
    fn failed(source: String, error: &ReconError) -> Self {
        Self {
            source,
            status: SourceStatus::Error {
                message: error.to_string(),
            },
            context: None,
            key_columns: Vec::new(),
            reference_rows_total: 0,
            reference_rows_filtered: 0,
            scan_rows_filtered: 0,
            missing_count: 0,
            missing_pct_of_source: 0.0,
            missing_pct_of_global: 0.0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SourceStatus::Ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconSummary {
    pub scan_rows_total: usize,
    pub reference_rows_total: usize,
    pub missing_total: usize,
    pub global_missing_pct: f64,
    pub source_count: usize,
    pub ok_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    pub summary: ReconSummary,
    pub sources: Vec<SourceReport>,
    /// Missing reference rows of every healthy source, tagged with
    /// [`SOURCE_COLUMN`]. Not deduplicated across sources.
    #[serde(skip)]
    pub missing: Table,
}

struct SourceOutcome {
    report: SourceReport,
    missing: Table,
}

pub fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 || part == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10_000.0).round() / 100.0
}

pub struct Reconciler<'a> {
    reader: TabularReader<'a>,
    normalizer: &'a Normalizer,
    inferrer: &'a ContextInferrer,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        reader: TabularReader<'a>,
        normalizer: &'a Normalizer,
        inferrer: &'a ContextInferrer,
    ) -> Self {
        Self {
            reader,
            normalizer,
            inferrer,
        }
    }

    pub fn reconcile(&self, scan: &Table, sources: Vec<SourceEntry>) -> ReconciliationResult {
        let mut reports = Vec::with_capacity(sources.len());
        let mut missing = Table::default();
        for entry in sources {
            let (name, outcome) = match entry {
                SourceEntry::Ready(source) => {
                    let outcome = self.reconcile_source(scan, &source);
                    (source.name, outcome)
                }
                SourceEntry::Unreadable { name, error } => (name, Err(error)),
            };
            match outcome {
                Ok(outcome) => {
                    info!(
                        "'{}': {} of {} reference row(s) missing from {} scan row(s)",
                        name,
                        outcome.report.missing_count,
                        outcome.report.reference_rows_filtered,
                        outcome.report.scan_rows_filtered
                    );
                    missing.append(outcome.missing);
                    reports.push(outcome.report);
                }
                Err(error) => {
                    warn!("'{name}' recorded as error: {error}");
                    reports.push(SourceReport::failed(name, &error));
                }
            }
        }

        let reference_rows_total = reports.iter().map(|r| r.reference_rows_total).sum();
        for report in &mut reports {
            report.missing_pct_of_source =
                percentage(report.missing_count, report.reference_rows_filtered);
            report.missing_pct_of_global = percentage(report.missing_count, reference_rows_total);
        }
        let ok_count = reports.iter().filter(|r| r.is_ok()).count();
        let summary = ReconSummary {
            scan_rows_total: scan.len(),
            reference_rows_total,
            missing_total: missing.len(),
            global_missing_pct: percentage(missing.len(), reference_rows_total),
            source_count: reports.len(),
            ok_count,
            error_count: reports.len() - ok_count,
        };
        ReconciliationResult {
            summary,
            sources: reports,
            missing,
        }
    }

    fn reconcile_source(
        &self,
        scan: &Table,
        source: &ReferenceSource,
    ) -> crate::error::Result<SourceOutcome> {
        let raw = self.reader.read(&source.name, &source.bytes)?;
        let reference = self.normalizer.normalize(raw.table);
        let mut context = self.inferrer.infer(
            &reference,
            &Provenance {
                file_name: &source.name,
                preamble: &raw.preamble,
            },
        )?;

        // A reference export is already scoped to its location.
        let reference_filtered = filter_by_dates(&reference, context.dates.as_ref());

        let scan_location = match &context.location {
            Some(explicit) if context.evidence.location == Some(ContextSource::Explicit) => {
                Some(explicit.clone())
            }
            Some(inferred) => {
                location_from_table(&reference_filtered, inferred.kind).or(Some(inferred.clone()))
            }
            None => {
                let derived = location_from_table(&reference_filtered, LocationKind::ByName)
                    .or_else(|| location_from_table(&reference_filtered, LocationKind::ByAreaCode));
                if derived.is_some() {
                    context.location = derived.clone();
                    context.evidence.location = Some(ContextSource::ReferenceTable);
                }
                derived
            }
        };
        let scan_filtered = filter_by_location(
            &filter_by_dates(scan, context.dates.as_ref()),
            scan_location.as_ref(),
        );

        let (key_columns, missing) = missing_rows(&reference_filtered, &scan_filtered)?;
        let mut missing = missing;
        let tags = vec![Some(Value::text(source.name.as_str())); missing.len()];
        missing.push_column(SOURCE_COLUMN, tags);

        Ok(SourceOutcome {
            report: SourceReport {
                source: source.name.clone(),
                status: SourceStatus::Ok,
                context: Some(context),
                key_columns,
                reference_rows_total: reference.len(),
                reference_rows_filtered: reference_filtered.len(),
                scan_rows_filtered: scan_filtered.len(),
                missing_count: missing.len(),
                missing_pct_of_source: 0.0,
                missing_pct_of_global: 0.0,
            },
            missing,
        })
    }
}

/// Reference rows whose match key appears in no scan row. Key columns are the
/// [`MATCH_KEY`] columns both tables carry.
pub fn missing_rows(
    reference: &Table,
    scan: &Table,
) -> crate::error::Result<(Vec<String>, Table)> {
    let in_reference = MATCH_KEY
        .iter()
        .map(|c| c.name())
        .filter(|name| reference.has_column(name))
        .collect::<Vec<_>>();
    if reference.is_empty() {
        return Ok((to_owned(&in_reference), reference.clone()));
    }
    if scan.is_empty() {
        return Ok((to_owned(&in_reference), reference.clone()));
    }
    let shared = in_reference
        .iter()
        .copied()
        .filter(|name| scan.has_column(name))
        .collect::<Vec<_>>();
    let dropped = MATCH_KEY
        .iter()
        .map(|c| c.name())
        .filter(|name| reference.has_column(name) != scan.has_column(name))
        .collect::<Vec<_>>();
    if !dropped.is_empty() {
        warn!("Key column(s) present on one side only, not compared: {dropped:?}");
    }
    if shared.is_empty() {
        return Err(ReconError::MissingKeyColumns {
            table: "reference/scan pair".to_string(),
            expected: MATCH_KEY.iter().map(|c| c.name().to_string()).collect(),
        });
    }
    debug!("Matching on {shared:?}");

    let positions = |table: &Table| {
        shared
            .iter()
            .filter_map(|name| table.column_index(name))
            .collect::<Vec<_>>()
    };
    let scan_key = positions(scan);
    let reference_key = positions(reference);
    let scan_keys = scan
        .rows
        .iter()
        .map(|row| scan.key(row, &scan_key))
        .collect::<BTreeSet<Vec<ComparableValue>>>();
    let missing = reference.filtered(|row| !scan_keys.contains(&reference.key(row, &reference_key)));
    Ok((to_owned(&shared), missing))
}

fn to_owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// `gap_<kind>_<value>_<from>_to_<to>.csv` for a single source.
pub fn single_source_artifact(report: &SourceReport) -> String {
    let context = report.context.as_ref();
    let location = context.and_then(|c| c.location.as_ref());
    let kind = location.map(|l| l.kind.label()).unwrap_or("unknown_filter");
    let value = location
        .map(|l| io_utils::sanitize_file_component(&l.display_value()))
        .unwrap_or_else(|| "unknown".to_string());
    let (from, to) = context
        .and_then(|c| c.dates)
        .map(|d| (d.from.to_string(), d.to.to_string()))
        .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
    format!("gap_{kind}_{value}_{from}_to_{to}.csv")
}

pub fn execute(args: &GapsArgs) -> Result<()> {
    let session = Session::new(&args.shared)?;
    info!(
        "Reconciling {} reference input(s) against '{}'",
        args.references.len(),
        args.scan.display()
    );
    let scan = session.load_normalized(&args.scan)?;

    let mut sources = Vec::new();
    for path in &args.references {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("reference")
            .to_string();
        match io_utils::read_input(path) {
            Ok(bytes) => sources.extend(collect_sources(&name, bytes)),
            Err(err) => sources.push(SourceEntry::Unreadable {
                name,
                error: ReconError::Io(std::io::Error::other(format!("{err:#}"))),
            }),
        }
    }
    let batch = sources.len() > 1 || args.references.iter().any(|p| is_archive(&p.to_string_lossy()));

    let inferrer =
        ContextInferrer::from_config(session.config()).with_explicit(args.context.to_explicit());
    let reconciler = Reconciler::new(session.reader(), session.normalizer(), &inferrer);
    let result = reconciler.reconcile(&scan, sources);

    print_source_reports(&result);
    if !result.missing.is_empty() && args.preview > 0 {
        println!();
        table::print_table(&result.missing.headers, &result.missing.display_rows(args.preview));
    }

    if result.missing.is_empty() {
        info!("No missing reference rows; no artifact written");
    } else {
        let default_name = match (batch, result.sources.first()) {
            (false, Some(report)) => single_source_artifact(report),
            _ => MULTI_SOURCE_ARTIFACT.to_string(),
        };
        let path = io_utils::artifact_path(
            args.output.as_deref(),
            args.output_dir.as_deref(),
            &default_name,
        )?;
        io_utils::write_table(
            Some(&path),
            &result.missing,
            session.output_delimiter(),
            session.output_encoding(),
            DateStyle::Iso,
        )
        .with_context(|| format!("Writing missing rows to {path:?}"))?;
        info!("{} missing row(s) written to {:?}", result.missing.len(), path);
    }

    if let Some(path) = &args.summary_json {
        let json = serde_json::to_string_pretty(&result).context("Serializing summary")?;
        fs::write(path, json).with_context(|| format!("Writing summary to {path:?}"))?;
        info!("Summary written to {path:?}");
    }
    Ok(())
}

fn print_source_reports(result: &ReconciliationResult) {
    let headers = [
        "source", "status", "filter", "from", "to", "ref_total", "ref_filtered", "scan_filtered",
        "missing", "missing_pct",
    ]
    .map(String::from)
    .to_vec();
    let rows = result
        .sources
        .iter()
        .map(|r| {
            let context = r.context.as_ref();
            let (from, to) = context
                .and_then(|c| c.dates)
                .map(|d| (d.from.to_string(), d.to.to_string()))
                .unwrap_or_default();
            let status = match &r.status {
                SourceStatus::Ok => "ok".to_string(),
                SourceStatus::Error { message } => format!("error: {message}"),
            };
            vec![
                r.source.clone(),
                status,
                context
                    .and_then(|c| c.location.as_ref())
                    .map(|l| l.to_string())
                    .unwrap_or_default(),
                from,
                to,
                r.reference_rows_total.to_string(),
                r.reference_rows_filtered.to_string(),
                r.scan_rows_filtered.to_string(),
                r.missing_count.to_string(),
                format!("{:.2}", r.missing_pct_of_source),
            ]
        })
        .collect::<Vec<_>>();
    table::print_table(&headers, &rows);
    let s = &result.summary;
    println!(
        "\nsources: {} ok, {} error | scan rows: {} | reference rows: {} | missing: {} ({:.2}%)",
        s.ok_count,
        s.error_count,
        s.scan_rows_total,
        s.reference_rows_total,
        s.missing_total,
        s.global_missing_pct
    );
}
