use std::{cmp::Ordering, fmt};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ReconError, Result};

const TWO_DIGIT_YEAR_PIVOT: i32 = 69;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Eq for Value {}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn as_display(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Number(n) => format_number(*n),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    // Mixed columns order numbers before dates before text.
    fn rank(&self) -> u8 {
        match self {
            Value::Number(_) => 0,
            Value::Date(_) => 1,
            Value::Text(_) => 2,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

/// Optional cell with a total order: missing values sort first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComparableValue(pub Option<Value>);

impl Ord for ComparableValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(left), Some(right)) => left.cmp(right),
        }
    }
}

impl PartialOrd for ComparableValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        (value as i64).to_string()
    } else {
        value.to_string()
    }
}

/// Keeps only `[0-9.-]`, dropping thousands separators, spaces (including
/// non-breaking and bidi marks) and currency symbols.
pub fn clean_numeric_token(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect()
}

pub fn parse_numeric(value: &str) -> Option<f64> {
    let cleaned = clean_numeric_token(value);
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Parses a date with day-before-month precedence. ISO `YYYY-MM-DD` input is
/// recognised by its four-digit leading component; any time suffix is ignored.
pub fn parse_day_first_date(value: &str) -> Result<NaiveDate> {
    let trimmed = value.trim();
    let token = trimmed
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()
        .unwrap_or_default();
    parse_date_token(token).ok_or_else(|| ReconError::MalformedDate {
        value: trimmed.to_string(),
    })
}

fn parse_date_token(token: &str) -> Option<NaiveDate> {
    let parts = token.split(['/', '.', '-', '_']).collect::<Vec<_>>();
    if parts.len() != 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    let (day, month, year) = if parts[0].len() == 4 {
        (parts[2], parts[1], parts[0])
    } else {
        (parts[0], parts[1], parts[2])
    };
    if day.len() > 2 || month.len() > 2 {
        return None;
    }
    NaiveDate::from_ymd_opt(expand_year(year)?, month.parse().ok()?, day.parse().ok()?)
}

pub fn expand_year(digits: &str) -> Option<i32> {
    let parsed: i32 = digits.parse().ok()?;
    match digits.len() {
        2 if parsed < TWO_DIGIT_YEAR_PIVOT => Some(2000 + parsed),
        2 => Some(1900 + parsed),
        4 => Some(parsed),
        _ => None,
    }
}

/// Strips leading zeros from a digit run; an all-zero run collapses to `"0"`.
pub fn normalize_area_code(digits: &str) -> Option<String> {
    let only_digits: String = digits.chars().filter(|c| c.is_ascii_digit()).collect();
    if only_digits.is_empty() {
        return None;
    }
    let stripped = only_digits.trim_start_matches('0');
    Some(if stripped.is_empty() {
        "0".to_string()
    } else {
        stripped.to_string()
    })
}

/// Area code of a `BLOCK-LOT-SUB` parcel identifier: the first digit run
/// before the first `-`, leading zeros stripped.
pub fn area_code_from_parcel(parcel_id: &str) -> Option<String> {
    let block = parcel_id.split('-').next().unwrap_or_default();
    let run: String = block
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    normalize_area_code(&run)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_day_first_date_prefers_day_before_month() {
        let expected = NaiveDate::from_ymd_opt(2025, 5, 6).unwrap();
        assert_eq!(parse_day_first_date("06/05/2025").unwrap(), expected);
        assert_eq!(parse_day_first_date("06.05.2025").unwrap(), expected);
        assert_eq!(parse_day_first_date("6.5.25").unwrap(), expected);
        assert_eq!(parse_day_first_date("2025-05-06").unwrap(), expected);
        assert_eq!(parse_day_first_date("2025-05-06 00:00:00").unwrap(), expected);
        assert_eq!(parse_day_first_date("2025-05-06T12:30:00").unwrap(), expected);
    }

    #[test]
    fn parse_day_first_date_rejects_garbage() {
        assert!(matches!(
            parse_day_first_date("not a date"),
            Err(ReconError::MalformedDate { .. })
        ));
        assert!(parse_day_first_date("31/02/2025").is_err());
        assert!(parse_day_first_date("").is_err());
    }

    #[test]
    fn two_digit_years_pivot_at_sixty_nine() {
        assert_eq!(expand_year("25"), Some(2025));
        assert_eq!(expand_year("68"), Some(2068));
        assert_eq!(expand_year("69"), Some(1969));
        assert_eq!(expand_year("2024"), Some(2024));
        assert_eq!(expand_year("202"), None);
    }

    #[test]
    fn parse_numeric_strips_separators_and_marks() {
        assert_eq!(parse_numeric("1,250,000"), Some(1_250_000.0));
        assert_eq!(parse_numeric("\u{200f}1 234.5\u{a0}"), Some(1234.5));
        assert_eq!(parse_numeric("₪ 980,000"), Some(980_000.0));
        assert_eq!(parse_numeric("-12"), Some(-12.0));
        assert_eq!(parse_numeric("nan"), None);
        assert_eq!(parse_numeric("--"), None);
        assert_eq!(parse_numeric(""), None);
    }

    #[test]
    fn area_code_strips_leading_zeros() {
        assert_eq!(
            area_code_from_parcel("028048-0058-010-00").as_deref(),
            Some("28048")
        );
        assert_eq!(area_code_from_parcel("28048-99-1-00").as_deref(), Some("28048"));
        assert_eq!(area_code_from_parcel("000-1-1").as_deref(), Some("0"));
        assert_eq!(area_code_from_parcel("B 6650/2-1").as_deref(), Some("6650"));
        assert_eq!(area_code_from_parcel("-1-1"), None);
    }

    #[test]
    fn numbers_display_without_trailing_fraction() {
        assert_eq!(Value::Number(1.0).as_display(), "1");
        assert_eq!(Value::Number(0.5).as_display(), "0.5");
    }

    #[test]
    fn comparable_value_orders_none_before_some() {
        let none = ComparableValue(None);
        let some = ComparableValue(Some(Value::Number(0.0)));
        assert!(none < some);
        assert!(Value::Number(5.0) < Value::text("a"));
    }
}
