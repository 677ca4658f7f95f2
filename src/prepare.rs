//! Export preparation: turns a scan table into an upload-ready CSV.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use log::info;
use serde::Serialize;

use crate::{
    Session,
    cli::PrepareArgs,
    config::ExportConfig,
    data::Value,
    io_utils::{self, DateStyle},
    normalize::{
        CoercionCount, NormalizeReport, Normalizer, coerce_date_column, coerce_numeric_column,
        fold_header,
    },
    table::{self, Table},
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct PrepareReport {
    pub normalize: NormalizeReport,
    /// Counts for the configured extra columns, keyed by column header.
    pub extra_coercions: BTreeMap<String, CoercionCount>,
    pub commas_replaced: usize,
    pub dropped_columns: Vec<String>,
}

/// Header in `table` that names `wanted`, compared after folding.
fn find_header(table: &Table, wanted: &str) -> Option<String> {
    let folded = fold_header(wanted);
    table
        .headers
        .iter()
        .find(|h| h.as_str() == wanted || fold_header(h) == folded)
        .cloned()
}

pub fn prepare_table(
    table: Table,
    normalizer: &Normalizer,
    export: &ExportConfig,
) -> (Table, PrepareReport) {
    let (mut table, normalize) = normalizer.normalize_with_report(table);
    let mut report = PrepareReport {
        normalize,
        ..PrepareReport::default()
    };

    for wanted in &export.extra_numeric_columns {
        if let Some(header) = find_header(&table, wanted)
            && let Some(counts) = coerce_numeric_column(&mut table, &header)
        {
            report.extra_coercions.insert(header, counts);
        }
    }
    for wanted in &export.extra_date_columns {
        if let Some(header) = find_header(&table, wanted)
            && let Some(counts) = coerce_date_column(&mut table, &header)
        {
            report.extra_coercions.insert(header, counts);
        }
    }

    // Commas break the downstream importer even inside quoted fields.
    for row in &mut table.rows {
        for cell in row.iter_mut() {
            if let Some(Value::Text(text)) = cell
                && text.contains(',')
            {
                *text = text.replace(',', " ");
                report.commas_replaced += 1;
            }
        }
    }

    for wanted in &export.drop_columns {
        if let Some(header) = find_header(&table, wanted)
            && table.drop_column(&header)
        {
            report.dropped_columns.push(header);
        }
    }
    (table, report)
}

pub fn execute(args: &PrepareArgs) -> Result<()> {
    let session = Session::new(&args.shared)?;
    info!("Preparing '{}' for export", args.input.display());
    let raw = session.read_path(&args.input)?;
    let (prepared, report) = prepare_table(raw, session.normalizer(), &session.config().export);

    print_report(&report);
    if args.preview > 0 && !prepared.is_empty() {
        println!();
        table::print_table(&prepared.headers, &prepared.display_rows(args.preview));
    }

    let stem = args
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("input");
    let default_name = format!("prepared_{}.csv", io_utils::sanitize_file_component(stem));
    let path = io_utils::artifact_path(
        args.output.as_deref(),
        args.output_dir.as_deref(),
        &default_name,
    )?;
    io_utils::write_table(
        Some(&path),
        &prepared,
        session.output_delimiter(),
        session.output_encoding(),
        DateStyle::DayFirst,
    )
    .with_context(|| format!("Writing prepared table to {path:?}"))?;
    info!("{} row(s) written to {:?}", prepared.len(), path);
    Ok(())
}

fn print_report(report: &PrepareReport) {
    let headers = ["column", "converted", "invalid"].map(String::from).to_vec();
    let rows = report
        .normalize
        .coercions
        .iter()
        .chain(&report.extra_coercions)
        .map(|(name, counts)| {
            vec![
                name.clone(),
                counts.converted.to_string(),
                counts.invalid.to_string(),
            ]
        })
        .collect::<Vec<_>>();
    if !rows.is_empty() {
        table::print_table(&headers, &rows);
    }
    println!(
        "renamed: {} | placeholders replaced: {} | commas replaced: {} | dropped: {}",
        report.normalize.renames.len(),
        report.normalize.placeholders_replaced,
        report.commas_replaced,
        if report.dropped_columns.is_empty() {
            "-".to_string()
        } else {
            report.dropped_columns.join(", ")
        }
    );
}
