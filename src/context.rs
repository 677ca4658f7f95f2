//! Context inference: recovering the implicit date range and location query a
//! reference export was produced with.
//!
//! Inference runs an ordered list of [`ContextRule`]s. Each rule inspects one
//! kind of evidence (explicit overrides, leading metadata cells, the file name,
//! the table's own `sale_date` range) and may yield either dimension. Each
//! dimension is taken from the first rule that yields it.

use std::{collections::BTreeSet, fmt, path::Path, sync::OnceLock};

use chrono::NaiveDate;
use itertools::Itertools;
use log::debug;
use regex::Regex;
use serde::Serialize;

use crate::{
    config::{MetadataCells, ReconConfig},
    data::{expand_year, normalize_area_code},
    error::{ReconError, Result},
    normalize::Column,
    table::Table,
};

/// Inclusive date range; bounds are always ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    /// Builds a range from two bounds in either order.
    pub fn new(a: NaiveDate, b: NaiveDate) -> Self {
        if a <= b {
            Self { from: a, to: b }
        } else {
            Self { from: b, to: a }
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    ByName,
    ByAreaCode,
}

impl LocationKind {
    pub fn label(self) -> &'static str {
        match self {
            LocationKind::ByName => "location",
            LocationKind::ByAreaCode => "area_code",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NameMatching {
    /// Member of the value set.
    Exact,
    /// Case-insensitive substring of any value.
    Contains,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub kind: LocationKind,
    pub values: BTreeSet<String>,
    pub matching: NameMatching,
}

impl Location {
    /// A raw inferred place name, matched loosely.
    pub fn named(value: impl Into<String>) -> Self {
        Self {
            kind: LocationKind::ByName,
            values: BTreeSet::from([value.into()]),
            matching: NameMatching::Contains,
        }
    }

    /// A set of names taken from another table, matched exactly.
    pub fn name_set(values: BTreeSet<String>) -> Self {
        Self {
            kind: LocationKind::ByName,
            values,
            matching: NameMatching::Exact,
        }
    }

    /// Area codes are normalised; entries without digits are dropped.
    pub fn area_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            kind: LocationKind::ByAreaCode,
            values: codes
                .into_iter()
                .filter_map(|c| normalize_area_code(c.as_ref()))
                .collect(),
            matching: NameMatching::Exact,
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        match self.matching {
            NameMatching::Exact => self.values.contains(name),
            NameMatching::Contains => {
                let haystack = name.to_lowercase();
                self.values
                    .iter()
                    .any(|v| haystack.contains(&v.trim().to_lowercase()))
            }
        }
    }

    pub fn display_value(&self) -> String {
        self.values.iter().join(",")
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind.label(), self.display_value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    Explicit,
    MetadataCells,
    FileName,
    Content,
    /// Location derived from the reference rows when no rule supplied one.
    ReferenceTable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Evidence {
    pub dates: Option<ContextSource>,
    pub location: Option<ContextSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InferredContext {
    pub dates: Option<DateRange>,
    pub location: Option<Location>,
    pub evidence: Evidence,
}

/// Where a reference table came from.
#[derive(Debug, Clone, Copy)]
pub struct Provenance<'a> {
    pub file_name: &'a str,
    pub preamble: &'a [String],
}

/// What a single rule could establish. Either dimension may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextClue {
    pub dates: Option<DateRange>,
    pub location: Option<Location>,
}

impl ContextClue {
    fn into_option(self) -> Option<Self> {
        (self.dates.is_some() || self.location.is_some()).then_some(self)
    }
}

pub trait ContextRule: Send + Sync {
    fn source(&self) -> ContextSource;
    fn apply(&self, table: &Table, provenance: &Provenance<'_>) -> Option<ContextClue>;
}

/// User-supplied context; wins over every inferred rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplicitContext {
    pub dates: Option<DateRange>,
    pub area_codes: Vec<String>,
    pub location_name: Option<String>,
}

impl ExplicitContext {
    pub fn is_empty(&self) -> bool {
        self.dates.is_none() && self.area_codes.is_empty() && self.location_name.is_none()
    }

    pub fn location(&self) -> Option<Location> {
        if !self.area_codes.is_empty() {
            let location = Location::area_codes(&self.area_codes);
            return (!location.values.is_empty()).then_some(location);
        }
        self.location_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(Location::named)
    }
}

pub struct ExplicitRule(pub ExplicitContext);

impl ContextRule for ExplicitRule {
    fn source(&self) -> ContextSource {
        ContextSource::Explicit
    }

    fn apply(&self, _table: &Table, _provenance: &Provenance<'_>) -> Option<ContextClue> {
        ContextClue {
            dates: self.0.dates,
            location: self.0.location(),
        }
        .into_option()
    }
}

/// Free-text cells above the table body (the export's title block).
pub struct MetadataCellsRule {
    pub cells: MetadataCells,
    pub markers: Vec<String>,
}

impl ContextRule for MetadataCellsRule {
    fn source(&self) -> ContextSource {
        ContextSource::MetadataCells
    }

    fn apply(&self, _table: &Table, provenance: &Provenance<'_>) -> Option<ContextClue> {
        // Positional window: blank cells still count towards skip and take.
        let cells = provenance
            .preamble
            .iter()
            .skip(self.cells.skip)
            .take(self.cells.take)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>();
        let candidate = cells.first()?;
        let text = cells.join(" ");
        let (dates, remainder) = scan_dates(&text);
        ContextClue {
            dates: date_range(&dates),
            location: classify_location(&remainder, candidate, &self.markers),
        }
        .into_option()
    }
}

/// `<location>-<from>-<to>` style file names.
pub struct FileNameRule {
    pub markers: Vec<String>,
}

impl ContextRule for FileNameRule {
    fn source(&self) -> ContextSource {
        ContextSource::FileName
    }

    fn apply(&self, _table: &Table, provenance: &Provenance<'_>) -> Option<ContextClue> {
        let stem = Path::new(provenance.file_name).file_stem()?.to_str()?;
        let (dates, _) = scan_dates(stem);
        let left = stem.split('-').next().unwrap_or_default().trim();
        let (_, left_remainder) = scan_dates(left);
        let candidate = left_remainder
            .trim_matches(|c: char| c.is_whitespace() || matches!(c, '_' | '.' | '/'));
        ContextClue {
            dates: date_range(&dates),
            location: classify_location(&left_remainder, candidate, &self.markers),
        }
        .into_option()
    }
}

/// Min/max of the table's own `sale_date` values.
pub struct ContentRangeRule;

impl ContextRule for ContentRangeRule {
    fn source(&self) -> ContextSource {
        ContextSource::Content
    }

    fn apply(&self, table: &Table, _provenance: &Provenance<'_>) -> Option<ContextClue> {
        let dates = table
            .column_values(Column::SaleDate.name())
            .into_iter()
            .filter_map(|v| v.as_date())
            .collect::<Vec<_>>();
        let from = dates.iter().min()?;
        let to = dates.iter().max()?;
        Some(ContextClue {
            dates: Some(DateRange::new(*from, *to)),
            location: None,
        })
    }
}

pub struct ContextInferrer {
    rules: Vec<Box<dyn ContextRule>>,
}

impl ContextInferrer {
    pub fn new(rules: Vec<Box<dyn ContextRule>>) -> Self {
        Self { rules }
    }

    /// Metadata cells, then file name, then content range.
    pub fn from_config(config: &ReconConfig) -> Self {
        Self::new(vec![
            Box::new(MetadataCellsRule {
                cells: config.metadata_cells,
                markers: config.area_markers.clone(),
            }),
            Box::new(FileNameRule {
                markers: config.area_markers.clone(),
            }),
            Box::new(ContentRangeRule),
        ])
    }

    /// Puts an explicit rule ahead of the existing ones.
    pub fn with_explicit(mut self, explicit: ExplicitContext) -> Self {
        if !explicit.is_empty() {
            self.rules.insert(0, Box::new(ExplicitRule(explicit)));
        }
        self
    }

    pub fn infer(&self, table: &Table, provenance: &Provenance<'_>) -> Result<InferredContext> {
        let mut context = InferredContext::default();
        for rule in &self.rules {
            if context.dates.is_some() && context.location.is_some() {
                break;
            }
            let Some(clue) = rule.apply(table, provenance) else {
                continue;
            };
            if context.dates.is_none()
                && let Some(dates) = clue.dates
            {
                context.dates = Some(dates);
                context.evidence.dates = Some(rule.source());
            }
            if context.location.is_none()
                && let Some(location) = clue.location
            {
                context.location = Some(location);
                context.evidence.location = Some(rule.source());
            }
        }
        if context.dates.is_none() && context.location.is_none() {
            return Err(ReconError::ContextInference {
                source_name: provenance.file_name.to_string(),
            });
        }
        debug!(
            "Context for '{}': dates {:?} via {:?}, location {:?} via {:?}",
            provenance.file_name,
            context.dates,
            context.evidence.dates,
            context.location.as_ref().map(Location::to_string),
            context.evidence.location
        );
        Ok(context)
    }
}

fn digit_runs() -> &'static Regex {
    static DIGIT_RUNS: OnceLock<Regex> = OnceLock::new();
    DIGIT_RUNS.get_or_init(|| Regex::new(r"[0-9]+").expect("valid digit-run pattern"))
}

fn place_name_script() -> &'static Regex {
    static SCRIPT: OnceLock<Regex> = OnceLock::new();
    SCRIPT.get_or_init(|| Regex::new(r"[\u{0590}-\u{05FF}]").expect("valid script pattern"))
}

/// Finds `d{1,2}<sep>d{1,2}<sep>(d{2}|d{4})` substrings (one separator out of
/// `.`, `/`, `_` used throughout) in reading order. Returns the parsed dates and
/// the text with every date substring blanked out.
pub fn scan_dates(text: &str) -> (Vec<NaiveDate>, String) {
    let runs = digit_runs().find_iter(text).collect::<Vec<_>>();
    let mut dates = Vec::new();
    let mut remainder = text.to_string();
    let mut idx = 0;
    while idx + 2 < runs.len() {
        let (day, month, year) = (runs[idx], runs[idx + 1], runs[idx + 2]);
        let sep_a = &text[day.end()..month.start()];
        let sep_b = &text[month.end()..year.start()];
        let shaped = matches!(sep_a, "." | "/" | "_")
            && sep_a == sep_b
            && day.len() <= 2
            && month.len() <= 2
            && matches!(year.len(), 2 | 4);
        let parsed = shaped
            .then(|| {
                NaiveDate::from_ymd_opt(
                    expand_year(year.as_str())?,
                    month.as_str().parse().ok()?,
                    day.as_str().parse().ok()?,
                )
            })
            .flatten();
        match parsed {
            Some(date) => {
                dates.push(date);
                remainder.replace_range(day.start()..year.end(), &" ".repeat(year.end() - day.start()));
                idx += 3;
            }
            None => idx += 1,
        }
    }
    (dates, remainder)
}

/// The first two dates as a range; a single date is not a range.
fn date_range(dates: &[NaiveDate]) -> Option<DateRange> {
    match dates {
        [first, second, ..] => Some(DateRange::new(*first, *second)),
        _ => None,
    }
}

/// Area-marker digits first, then digits without place-name script, then the
/// candidate itself as a place name.
pub fn classify_location(text: &str, candidate: &str, markers: &[String]) -> Option<Location> {
    let lowered = text.to_lowercase();
    let marker_at = markers
        .iter()
        .map(|m| m.trim().to_lowercase())
        .filter(|m| !m.is_empty())
        .filter_map(|m| lowered.find(&m).map(|pos| pos + m.len()))
        .min();

    if let Some(after) = marker_at {
        let tail = &lowered[after..];
        let list_end = tail
            .find(|c: char| !(c.is_ascii_digit() || c == ',' || c.is_whitespace()))
            .unwrap_or(tail.len());
        let mut codes = collect_runs(&tail[..list_end]);
        if codes.is_empty() {
            codes = collect_runs(&lowered);
        }
        let location = Location::area_codes(codes);
        return (!location.values.is_empty()).then_some(location);
    }

    let codes = collect_runs(&lowered);
    if !codes.is_empty() && !place_name_script().is_match(&lowered) {
        return Some(Location::area_codes(codes));
    }

    let candidate = candidate.trim();
    (!candidate.is_empty()).then(|| Location::named(candidate))
}

fn collect_runs(text: &str) -> Vec<&str> {
    digit_runs().find_iter(text).map(|m| m.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn markers() -> Vec<String> {
        ReconConfig::default().area_markers
    }

    fn infer(file_name: &str, preamble: &[&str], table: &Table) -> Result<InferredContext> {
        let preamble = preamble.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        ContextInferrer::from_config(&ReconConfig::default()).infer(
            table,
            &Provenance {
                file_name,
                preamble: &preamble,
            },
        )
    }

    #[test]
    fn reversed_date_substrings_are_swapped() {
        let (dates, _) = scan_dates("28.05.25 27.01.25");
        assert_eq!(
            date_range(&dates),
            Some(DateRange {
                from: d(2025, 1, 27),
                to: d(2025, 5, 28)
            })
        );
    }

    #[test]
    fn scan_dates_requires_consistent_separator() {
        let (dates, remainder) = scan_dates("3653_01_01_24 to 31/03/2024 and 1.2/24");
        assert_eq!(dates, vec![d(2024, 1, 1), d(2024, 3, 31)]);
        assert!(remainder.starts_with("3653_"));
        assert!(!remainder.contains("31/03"));
    }

    #[test]
    fn single_date_is_not_a_range() {
        let (dates, _) = scan_dates("עד 31.03.24");
        assert_eq!(dates.len(), 1);
        assert_eq!(date_range(&dates), None);
    }

    #[test]
    fn marker_digits_win() {
        let location = classify_location("עסקאות בגוש 6650, 6651 בחיפה", "x", &markers()).unwrap();
        assert_eq!(location.kind, LocationKind::ByAreaCode);
        assert_eq!(
            location.values,
            BTreeSet::from(["6650".to_string(), "6651".to_string()])
        );
        let latin = classify_location("Block 006650 area 12", "x", &markers()).unwrap();
        assert_eq!(latin.values, BTreeSet::from(["6650".to_string()]));
    }

    #[test]
    fn digits_without_script_are_area_codes() {
        let location = classify_location("3653_", "3653_", &markers()).unwrap();
        assert_eq!(location.kind, LocationKind::ByAreaCode);
        assert_eq!(location.display_value(), "3653");
    }

    #[test]
    fn script_text_is_a_place_name() {
        let location = classify_location("חיפה   עסקאות", "חיפה", &markers()).unwrap();
        assert_eq!(location.kind, LocationKind::ByName);
        assert_eq!(location.matching, NameMatching::Contains);
        assert!(location.matches_name("חיפה"));
        assert!(!location.matches_name("עכו"));
    }

    #[test]
    fn metadata_cells_take_priority_over_file_name() {
        let ctx = infer(
            "3653-01.01.23-31.12.23.xls",
            &["עסקאות נדל\"ן", "חיפה", "מתאריך 27.01.25", "עד 28.05.25"],
            &Table::default(),
        )
        .unwrap();
        assert_eq!(ctx.location, Some(Location::named("חיפה")));
        assert_eq!(ctx.dates, Some(DateRange::new(d(2025, 1, 27), d(2025, 5, 28))));
        assert_eq!(ctx.evidence.location, Some(ContextSource::MetadataCells));
        assert_eq!(ctx.evidence.dates, Some(ContextSource::MetadataCells));
    }

    #[test]
    fn blank_title_cell_still_counts_as_skipped() {
        let ctx = infer(
            "export.xls",
            &["", "חיפה", "מתאריך 27.01.25", "עד 28.05.25"],
            &Table::default(),
        )
        .unwrap();
        assert_eq!(ctx.location, Some(Location::named("חיפה")));
        assert_eq!(ctx.evidence.location, Some(ContextSource::MetadataCells));
        assert_eq!(ctx.dates, Some(DateRange::new(d(2025, 1, 27), d(2025, 5, 28))));
    }

    #[test]
    fn file_name_fills_missing_dimensions() {
        let ctx = infer(
            "nested_3653-01.01.24-31.03.24.xls",
            &["title", "title again"],
            &Table::default(),
        )
        .unwrap();
        // "title again" carries no digits, so metadata yields a place name.
        assert_eq!(ctx.evidence.location, Some(ContextSource::MetadataCells));
        assert_eq!(ctx.evidence.dates, Some(ContextSource::FileName));
        assert_eq!(ctx.dates, Some(DateRange::new(d(2024, 1, 1), d(2024, 3, 31))));

        let ctx = infer("3653-01.01.24-31.03.24.xls", &[], &Table::default()).unwrap();
        assert_eq!(ctx.location, Some(Location::area_codes(["3653"])));
        assert_eq!(ctx.evidence.location, Some(ContextSource::FileName));
    }

    #[test]
    fn content_range_is_the_date_fallback() {
        let mut table = Table::new(vec!["sale_date".into()]);
        table.rows = vec![
            vec![Some(Value::Date(d(2024, 5, 1)))],
            vec![None],
            vec![Some(Value::Date(d(2024, 2, 1)))],
        ];
        let ctx = infer("חיפה.xls", &[], &table).unwrap();
        assert_eq!(ctx.dates, Some(DateRange::new(d(2024, 2, 1), d(2024, 5, 1))));
        assert_eq!(ctx.evidence.dates, Some(ContextSource::Content));
        assert_eq!(ctx.location, Some(Location::named("חיפה")));
    }

    #[test]
    fn nothing_usable_is_a_context_inference_error() {
        let err = infer("-.xls", &[], &Table::default()).unwrap_err();
        assert!(matches!(err, ReconError::ContextInference { .. }));
    }

    #[test]
    fn explicit_context_wins() {
        let explicit = ExplicitContext {
            dates: Some(DateRange::new(d(2023, 1, 1), d(2023, 12, 31))),
            area_codes: vec!["028048".into()],
            location_name: None,
        };
        let inferrer = ContextInferrer::from_config(&ReconConfig::default()).with_explicit(explicit);
        let ctx = inferrer
            .infer(
                &Table::default(),
                &Provenance {
                    file_name: "חיפה-01.01.24-31.03.24.xls",
                    preamble: &[],
                },
            )
            .unwrap();
        assert_eq!(ctx.location, Some(Location::area_codes(["28048"])));
        assert_eq!(ctx.evidence.dates, Some(ContextSource::Explicit));
    }
}
