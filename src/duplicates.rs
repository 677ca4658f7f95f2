use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::ValueEnum;
use itertools::Itertools;
use log::{debug, info};

use crate::{
    Session,
    cli::DuplicatesArgs,
    data::{ComparableValue, Value},
    error::ReconError,
    io_utils::{self, DateStyle},
    normalize::Column,
    table::{self, Table},
};

/// Record identity within one snapshot of a scan table.
pub const DUPLICATE_KEY: [Column; 9] = [
    Column::ParcelId,
    Column::SaleDate,
    Column::DeclaredProfit,
    Column::SoldFraction,
    Column::LocationName,
    Column::BuildYear,
    Column::FloorArea,
    Column::RoomCount,
    Column::SnapshotDate,
];

pub const COUNT_COLUMN: &str = "count";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum DuplicateMode {
    /// One row per duplicate group with its size
    #[default]
    Summary,
    /// Every row belonging to a duplicate group
    Rows,
}

impl DuplicateMode {
    pub fn label(self) -> &'static str {
        match self {
            DuplicateMode::Summary => "summary",
            DuplicateMode::Rows => "rows",
        }
    }
}

/// Rows whose `snapshot_date` equals the latest value present. Tables without
/// the column are returned whole; a column with no values yields no rows.
pub fn latest_snapshot(table: &Table) -> Table {
    let Some(idx) = table.column_index(Column::SnapshotDate.name()) else {
        return table.clone();
    };
    let latest = table.rows.iter().filter_map(|row| row[idx].as_ref()).max().cloned();
    match latest {
        Some(latest) => table.filtered(|row| row[idx].as_ref() == Some(&latest)),
        None => Table::new(table.headers.clone()),
    }
}

/// Rows whose `sold_fraction` is numerically 1, when the column exists.
pub fn whole_sales(table: &Table) -> Table {
    let Some(idx) = table.column_index(Column::SoldFraction.name()) else {
        return table.clone();
    };
    table.filtered(|row| {
        row[idx]
            .as_ref()
            .and_then(Value::as_number)
            .is_some_and(|n| n == 1.0)
    })
}

pub fn find_duplicates(table: &Table, mode: DuplicateMode) -> crate::error::Result<Table> {
    let base = whole_sales(&latest_snapshot(table));
    let key_columns = DUPLICATE_KEY
        .iter()
        .filter_map(|c| base.column_index(c.name()))
        .collect::<Vec<_>>();
    if key_columns.is_empty() {
        if base.is_empty() {
            return Ok(Table::default());
        }
        return Err(ReconError::MissingKeyColumns {
            table: "input table".to_string(),
            expected: DUPLICATE_KEY.iter().map(|c| c.name().to_string()).collect(),
        });
    }
    debug!(
        "Duplicate key columns [{}] over {} row(s)",
        key_columns.iter().map(|&i| &base.headers[i]).join(", "),
        base.len()
    );

    let mut groups: BTreeMap<Vec<ComparableValue>, Vec<usize>> = BTreeMap::new();
    for (row_idx, row) in base.rows.iter().enumerate() {
        groups
            .entry(base.key(row, &key_columns))
            .or_default()
            .push(row_idx);
    }
    let duplicated = groups
        .into_iter()
        .filter(|(_, rows)| rows.len() > 1)
        .collect::<Vec<_>>();

    Ok(match mode {
        DuplicateMode::Summary => {
            let mut ranked = duplicated;
            // Stable: equal counts keep ascending key order.
            ranked.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
            let mut headers = key_columns
                .iter()
                .map(|&i| base.headers[i].clone())
                .collect::<Vec<_>>();
            headers.push(COUNT_COLUMN.to_string());
            let mut summary = Table::new(headers);
            summary.rows = ranked
                .into_iter()
                .map(|(key, rows)| {
                    key.into_iter()
                        .map(|k| k.0)
                        .chain(std::iter::once(Some(Value::Number(rows.len() as f64))))
                        .collect()
                })
                .collect();
            summary
        }
        DuplicateMode::Rows => {
            let indices = duplicated
                .into_iter()
                .flat_map(|(_, rows)| rows)
                .collect::<Vec<_>>();
            base.select_rows(&indices)
        }
    })
}

pub fn execute(args: &DuplicatesArgs) -> Result<()> {
    let session = Session::new(&args.shared)?;
    info!(
        "Checking '{}' for duplicates ({} mode)",
        args.input.display(),
        args.mode.label()
    );
    let table = session.load_normalized(&args.input)?;
    let result = find_duplicates(&table, args.mode)
        .with_context(|| format!("Finding duplicates in {:?}", args.input))?;

    if result.is_empty() {
        info!("No duplicate groups found");
    } else {
        table::print_table(&result.headers, &result.display_rows(args.preview));
    }

    let stem = args
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("input");
    let default_name = format!(
        "duplicates_{}_{}.csv",
        args.mode.label(),
        io_utils::sanitize_file_component(stem)
    );
    let path = io_utils::artifact_path(
        args.output.as_deref(),
        args.output_dir.as_deref(),
        &default_name,
    )?;
    io_utils::write_table(
        Some(&path),
        &result,
        session.output_delimiter(),
        session.output_encoding(),
        DateStyle::Iso,
    )
    .with_context(|| format!("Writing duplicates to {path:?}"))?;
    info!("{} row(s) written to {:?}", result.len(), path);
    Ok(())
}
