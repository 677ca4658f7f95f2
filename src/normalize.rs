//! Schema normalization: canonical column names, placeholder cleanup and
//! numeric/date coercion.

use std::collections::{BTreeMap, HashSet};

use heck::ToSnakeCase;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    data::{Value, parse_day_first_date, parse_numeric},
    table::Table,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    ParcelId,
    SaleDate,
    DeclaredProfit,
    SaleValue,
    PropertyType,
    SoldFraction,
    LocationName,
    BuildYear,
    FloorArea,
    RoomCount,
    SnapshotDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Numeric,
    Date,
}

impl Column {
    pub const ALL: [Column; 11] = [
        Column::ParcelId,
        Column::SaleDate,
        Column::DeclaredProfit,
        Column::SaleValue,
        Column::PropertyType,
        Column::SoldFraction,
        Column::LocationName,
        Column::BuildYear,
        Column::FloorArea,
        Column::RoomCount,
        Column::SnapshotDate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Column::ParcelId => "parcel_id",
            Column::SaleDate => "sale_date",
            Column::DeclaredProfit => "declared_profit",
            Column::SaleValue => "sale_value",
            Column::PropertyType => "property_type",
            Column::SoldFraction => "sold_fraction",
            Column::LocationName => "location_name",
            Column::BuildYear => "build_year",
            Column::FloorArea => "floor_area",
            Column::RoomCount => "room_count",
            Column::SnapshotDate => "snapshot_date",
        }
    }

    pub fn kind(self) -> ColumnKind {
        match self {
            Column::DeclaredProfit
            | Column::SaleValue
            | Column::SoldFraction
            | Column::BuildYear
            | Column::FloorArea
            | Column::RoomCount => ColumnKind::Numeric,
            Column::SaleDate | Column::SnapshotDate => ColumnKind::Date,
            Column::ParcelId | Column::PropertyType | Column::LocationName => ColumnKind::Text,
        }
    }

    pub fn from_name(name: &str) -> Option<Column> {
        Column::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// Folds a raw header for comparison: bidi marks and BOMs removed,
/// non-breaking spaces treated as spaces, then snake_cased.
pub fn fold_header(raw: &str) -> String {
    let cleaned = raw
        .chars()
        .filter(|c| !matches!(c, '\u{200e}' | '\u{200f}' | '\u{202a}'..='\u{202e}' | '\u{feff}'))
        .map(|c| if c == '\u{a0}' { ' ' } else { c })
        .collect::<String>();
    cleaned.trim().to_snake_case()
}

const BUILTIN_ALIASES: &[(&str, Column)] = &[
    ("גוש חלקה", Column::ParcelId),
    ("יום מכירה", Column::SaleDate),
    ("תמורה מוצהרת בש\"ח", Column::DeclaredProfit),
    ("שווי מכירה בש\"ח", Column::SaleValue),
    ("מהות", Column::PropertyType),
    ("חלק נמכר", Column::SoldFraction),
    ("ישוב", Column::LocationName),
    ("שנת בניה", Column::BuildYear),
    ("שטח", Column::FloorArea),
    ("חדרים", Column::RoomCount),
    ("block lot", Column::ParcelId),
    ("blocklot", Column::ParcelId),
    ("sale day", Column::SaleDate),
    ("sale profit", Column::SaleValue),
    ("sold part", Column::SoldFraction),
    ("city", Column::LocationName),
    ("building mr", Column::FloorArea),
    ("rooms number", Column::RoomCount),
    ("scan date", Column::SnapshotDate),
];

/// Immutable `alias -> canonical column` dictionary. Lookups compare folded
/// headers; earlier entries win.
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: Vec<(String, Column)>,
}

impl AliasTable {
    pub fn builtin() -> Self {
        Self::new(BUILTIN_ALIASES.iter().map(|(alias, column)| (alias.to_string(), *column)))
    }

    pub fn new(entries: impl IntoIterator<Item = (String, Column)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(alias, column)| (fold_header(&alias), column))
                .collect(),
        }
    }

    /// Places `overrides` ahead of the current entries.
    pub fn with_overrides(self, overrides: &BTreeMap<String, Column>) -> Self {
        let mut entries = overrides
            .iter()
            .map(|(alias, column)| (fold_header(alias), *column))
            .collect::<Vec<_>>();
        entries.extend(self.entries);
        Self { entries }
    }

    pub fn lookup(&self, header: &str) -> Option<Column> {
        let folded = fold_header(header);
        self.entries
            .iter()
            .find(|(alias, _)| *alias == folded)
            .map(|(_, column)| *column)
    }

    /// Canonical column a header names directly or through an alias.
    pub fn recognise(&self, header: &str) -> Option<Column> {
        Column::from_name(&fold_header(header)).or_else(|| self.lookup(header))
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::builtin()
    }
}

const BUILTIN_PLACEHOLDERS: &[(&str, Option<&str>)] = &[
    ("--", Some("0")),
    ("nan", None),
    ("NaN", None),
    ("NAN", None),
    ("None", None),
    ("NaT", None),
    ("nat", None),
    ("NAT", None),
    ("null", None),
];

/// Exact-match token replacements applied to every text cell.
#[derive(Debug, Clone)]
pub struct PlaceholderTable {
    entries: Vec<(String, Option<String>)>,
}

impl PlaceholderTable {
    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_PLACEHOLDERS
                .iter()
                .map(|(token, replacement)| (token.to_string(), replacement.map(str::to_string))),
        )
    }

    pub fn new(entries: impl IntoIterator<Item = (String, Option<String>)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn entries(&self) -> &[(String, Option<String>)] {
        &self.entries
    }

    fn replacement(&self, token: &str) -> Option<&Option<String>> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == token)
            .map(|(_, replacement)| replacement)
    }

    /// Replaces placeholder tokens and blanks in text cells. Returns the number
    /// of token replacements made (blank cells are not counted).
    pub fn apply(&self, table: &mut Table) -> usize {
        let mut replaced = 0;
        for row in &mut table.rows {
            for cell in row.iter_mut() {
                let Some(Value::Text(text)) = cell else {
                    continue;
                };
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    *cell = None;
                } else if let Some(replacement) = self.replacement(trimmed) {
                    replaced += 1;
                    *cell = replacement.as_ref().map(|r| Value::text(r.as_str()));
                }
            }
        }
        replaced
    }
}

impl Default for PlaceholderTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoercionCount {
    pub converted: usize,
    pub invalid: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeReport {
    /// `(original header, canonical column)` for every renamed column.
    pub renames: Vec<(String, Column)>,
    pub coercions: BTreeMap<String, CoercionCount>,
    pub placeholders_replaced: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    aliases: AliasTable,
    placeholders: PlaceholderTable,
}

impl Normalizer {
    pub fn new(aliases: AliasTable, placeholders: PlaceholderTable) -> Self {
        Self {
            aliases,
            placeholders,
        }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn normalize(&self, table: Table) -> Table {
        self.normalize_with_report(table).0
    }

    pub fn normalize_with_report(&self, mut table: Table) -> (Table, NormalizeReport) {
        let mut report = NormalizeReport {
            renames: self.rename_columns(&mut table),
            ..NormalizeReport::default()
        };
        for (original, column) in &report.renames {
            debug!("Renamed column '{}' -> '{}'", original, column.name());
        }
        report.placeholders_replaced = self.placeholders.apply(&mut table);

        for column in Column::ALL {
            let counts = match column.kind() {
                ColumnKind::Numeric => coerce_numeric_column(&mut table, column.name()),
                ColumnKind::Date => coerce_date_column(&mut table, column.name()),
                ColumnKind::Text => None,
            };
            if let Some(counts) = counts {
                debug!(
                    "Coerced '{}': {} converted, {} invalid",
                    column.name(),
                    counts.converted,
                    counts.invalid
                );
                report.coercions.insert(column.name().to_string(), counts);
            }
        }
        (table, report)
    }

    fn rename_columns(&self, table: &mut Table) -> Vec<(String, Column)> {
        let mut claimed = HashSet::new();
        let mut assigned: Vec<Option<Column>> = vec![None; table.headers.len()];

        // Columns already bearing a canonical name are never displaced by an alias.
        for (idx, header) in table.headers.iter().enumerate() {
            if let Some(column) = Column::from_name(&fold_header(header))
                && claimed.insert(column)
            {
                assigned[idx] = Some(column);
            }
        }
        for (idx, header) in table.headers.iter().enumerate() {
            if assigned[idx].is_some() {
                continue;
            }
            if let Some(column) = self.aliases.lookup(header)
                && claimed.insert(column)
            {
                assigned[idx] = Some(column);
            }
        }

        let mut renames = Vec::new();
        for (idx, column) in assigned.iter().enumerate() {
            if let Some(column) = column
                && table.headers[idx] != column.name()
            {
                renames.push((table.headers[idx].clone(), *column));
                table.rename_column(idx, column.name());
            }
        }

        let mut seen = HashSet::new();
        for idx in 0..table.headers.len() {
            if !seen.insert(table.headers[idx].clone()) {
                let unique = format!("{}_{}", table.headers[idx], idx + 1);
                seen.insert(unique.clone());
                table.rename_column(idx, unique);
            }
        }
        renames
    }
}

/// Coerces a column to numbers in place; `None` when the column is absent.
pub fn coerce_numeric_column(table: &mut Table, name: &str) -> Option<CoercionCount> {
    let idx = table.column_index(name)?;
    let mut counts = CoercionCount::default();
    for row in &mut table.rows {
        let coerced = match row[idx].take() {
            None => None,
            Some(Value::Number(n)) => Some(n),
            Some(Value::Text(text)) => parse_numeric(&text),
            Some(Value::Date(_)) => None,
        };
        match coerced {
            Some(n) => {
                counts.converted += 1;
                row[idx] = Some(Value::Number(n));
            }
            None => counts.invalid += 1,
        }
    }
    Some(counts)
}

/// Coerces a column to day-first dates in place; malformed values become missing.
pub fn coerce_date_column(table: &mut Table, name: &str) -> Option<CoercionCount> {
    let idx = table.column_index(name)?;
    let mut counts = CoercionCount::default();
    for row in &mut table.rows {
        let coerced = match row[idx].take() {
            None => None,
            Some(Value::Date(d)) => Some(d),
            Some(other) => match parse_day_first_date(&other.as_display()) {
                Ok(date) => Some(date),
                Err(err) => {
                    debug!("Column '{name}': {err}");
                    None
                }
            },
        };
        match coerced {
            Some(d) => {
                counts.converted += 1;
                row[idx] = Some(Value::Date(d));
            }
            None => counts.invalid += 1,
        }
    }
    Some(counts)
}
