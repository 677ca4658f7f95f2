//! Context filter: restricts a table to a date range and a location.
//!
//! Filtering never fails. A dimension whose column is absent from the table
//! leaves the table unfiltered on that dimension; within a present column,
//! missing or untyped cells never match.

use std::collections::BTreeSet;

use log::debug;

use crate::{
    context::{DateRange, InferredContext, Location, LocationKind},
    data::{Value, area_code_from_parcel},
    normalize::Column,
    table::Table,
};

pub fn apply_context(table: &Table, context: &InferredContext) -> Table {
    let dated = filter_by_dates(table, context.dates.as_ref());
    filter_by_location(&dated, context.location.as_ref())
}

pub fn filter_by_dates(table: &Table, range: Option<&DateRange>) -> Table {
    let (Some(range), Some(idx)) = (range, table.column_index(Column::SaleDate.name())) else {
        return table.clone();
    };
    let filtered = table.filtered(|row| {
        row[idx]
            .as_ref()
            .and_then(Value::as_date)
            .is_some_and(|d| range.contains(d))
    });
    debug!(
        "Date filter {}..={} kept {} of {} row(s)",
        range.from,
        range.to,
        filtered.len(),
        table.len()
    );
    filtered
}

pub fn filter_by_location(table: &Table, location: Option<&Location>) -> Table {
    let Some(location) = location else {
        return table.clone();
    };
    let column = match location.kind {
        LocationKind::ByName => Column::LocationName,
        LocationKind::ByAreaCode => Column::ParcelId,
    };
    let Some(idx) = table.column_index(column.name()) else {
        debug!("No '{}' column; location filter skipped", column.name());
        return table.clone();
    };
    let filtered = table.filtered(|row| {
        let Some(value) = row[idx].as_ref() else {
            return false;
        };
        match location.kind {
            LocationKind::ByName => location.matches_name(&value.as_display()),
            LocationKind::ByAreaCode => area_code_from_parcel(&value.as_display())
                .is_some_and(|code| location.values.contains(&code)),
        }
    });
    debug!(
        "Location filter {} kept {} of {} row(s)",
        location,
        filtered.len(),
        table.len()
    );
    filtered
}

/// Distinct normalised area codes derived from `parcel_id`.
pub fn area_codes(table: &Table) -> BTreeSet<String> {
    table
        .column_values(Column::ParcelId.name())
        .into_iter()
        .filter_map(|v| area_code_from_parcel(&v.as_display()))
        .collect()
}

/// Distinct non-blank `location_name` values.
pub fn location_names(table: &Table) -> BTreeSet<String> {
    table
        .column_values(Column::LocationName.name())
        .into_iter()
        .map(Value::as_display)
        .filter(|name| !name.trim().is_empty())
        .collect()
}

/// The exact value set of `kind` carried by `table`, or `None` when the table
/// lacks the column or has no values in it.
pub fn location_from_table(table: &Table, kind: LocationKind) -> Option<Location> {
    let location = match kind {
        LocationKind::ByName if table.has_column(Column::LocationName.name()) => {
            Location::name_set(location_names(table))
        }
        LocationKind::ByAreaCode if table.has_column(Column::ParcelId.name()) => {
            Location::area_codes(area_codes(table))
        }
        _ => return None,
    };
    (!location.values.is_empty()).then_some(location)
}
