//! Tabular reader: raw bytes plus a source name in, a raw [`Table`] and its
//! preamble out.
//!
//! The format comes from the declared extension and is confirmed by probing
//! the content, so a `.xls` that is really an HTML export is read as markup
//! without trying (and failing) the spreadsheet path first.

use std::{io::Cursor, path::Path};

use calamine::{Data, Reader, open_workbook_auto_from_rs};
use chrono::{Days, NaiveDate};
use encoding_rs::Encoding;
use log::debug;

use crate::{
    data::format_number,
    error::{ReconError, Result},
    io_utils::{decode_text, open_csv_reader, resolve_input_delimiter},
    markup::{extract_tables, largest_table},
    normalize::AliasTable,
    table::Table,
};

const HEADER_SCAN_ROWS: usize = 10;
const MIN_RECOGNISED_HEADERS: usize = 2;
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Delimited,
    SpreadsheetBinary,
    EmbeddedMarkup,
}

impl SourceFormat {
    pub fn from_extension(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "tsv" | "txt" => Some(SourceFormat::Delimited),
            "xls" | "xlsx" | "xlsm" | "xlsb" | "ods" => Some(SourceFormat::SpreadsheetBinary),
            "html" | "htm" => Some(SourceFormat::EmbeddedMarkup),
            _ => None,
        }
    }

    /// Declared extension first, then content probing.
    pub fn detect(name: &str, bytes: &[u8]) -> Result<Self> {
        match Self::from_extension(name) {
            Some(SourceFormat::SpreadsheetBinary) if !has_spreadsheet_magic(bytes) => {
                if looks_like_markup(bytes) {
                    debug!("'{name}' is declared as a spreadsheet but contains markup");
                    Ok(SourceFormat::EmbeddedMarkup)
                } else {
                    Ok(SourceFormat::SpreadsheetBinary)
                }
            }
            Some(format) => Ok(format),
            None if has_spreadsheet_magic(bytes) => Ok(SourceFormat::SpreadsheetBinary),
            None if looks_like_markup(bytes) => Ok(SourceFormat::EmbeddedMarkup),
            None => Err(ReconError::unsupported(
                name,
                "unrecognised extension and content",
            )),
        }
    }
}

fn has_spreadsheet_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(OLE_MAGIC) || bytes.starts_with(ZIP_MAGIC)
}

fn looks_like_markup(bytes: &[u8]) -> bool {
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<')
}

/// A raw table plus the free-text cells found above its header.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub table: Table,
    /// First non-empty cell of each row preceding the header, in reading order.
    pub preamble: Vec<String>,
    pub format: SourceFormat,
}

#[derive(Debug, Clone)]
pub struct TabularReader<'a> {
    aliases: &'a AliasTable,
    delimiter: Option<u8>,
    encoding: Option<&'static Encoding>,
    fallback: &'static Encoding,
}

impl<'a> TabularReader<'a> {
    pub fn new(aliases: &'a AliasTable, fallback: &'static Encoding) -> Self {
        Self {
            aliases,
            delimiter: None,
            encoding: None,
            fallback,
        }
    }

    pub fn with_delimiter(mut self, delimiter: Option<u8>) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_encoding(mut self, encoding: Option<&'static Encoding>) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn read(&self, name: &str, bytes: &[u8]) -> Result<SourceTable> {
        let format = SourceFormat::detect(name, bytes)?;
        debug!("Reading '{name}' as {format:?}");
        let (grid, lead) = match format {
            SourceFormat::Delimited => (self.read_delimited(name, bytes)?, Vec::new()),
            SourceFormat::SpreadsheetBinary => (read_spreadsheet(name, bytes)?, Vec::new()),
            SourceFormat::EmbeddedMarkup => self.read_markup(name, bytes)?,
        };
        let (table, preamble) = self.split_header(grid);
        Ok(SourceTable {
            table,
            preamble: lead.into_iter().chain(preamble).collect(),
            format,
        })
    }

    fn read_delimited(&self, name: &str, bytes: &[u8]) -> Result<Vec<Vec<String>>> {
        let (text, encoding) = decode_text(bytes, self.encoding, self.fallback);
        debug!("Decoded '{name}' as {}", encoding.name());
        let delimiter = resolve_input_delimiter(Path::new(name), self.delimiter);
        let mut reader = open_csv_reader(text.as_bytes(), delimiter, false);
        reader
            .records()
            .map(|record| {
                record
                    .map(|r| r.iter().map(str::to_string).collect())
                    .map_err(|source| ReconError::Csv {
                        source_name: name.to_string(),
                        source,
                    })
            })
            .collect()
    }

    /// Rows of the largest table, plus the rows of smaller tables that come
    /// before it flattened into leading preamble cells.
    fn read_markup(&self, name: &str, bytes: &[u8]) -> Result<(Vec<Vec<String>>, Vec<String>)> {
        let (text, _) = decode_text(bytes, self.encoding, self.fallback);
        let mut tables = extract_tables(&text);
        let body = largest_table(&tables)
            .ok_or_else(|| ReconError::unsupported(name, "no table found in markup"))?;
        debug!(
            "'{name}': {} markup table(s), using #{} ({} cells)",
            tables.len(),
            body + 1,
            tables[body].cell_count()
        );
        let lead = tables[..body]
            .iter()
            .flat_map(|t| t.rows.iter())
            .map(|row| first_non_empty(row).unwrap_or_default())
            .collect();
        Ok((std::mem::take(&mut tables[body].rows), lead))
    }

    /// Picks the header row and returns the table below it with the preamble
    /// above it. Preamble cells stay positional: a blank row above the header
    /// becomes an empty cell.
    fn split_header(&self, mut rows: Vec<Vec<String>>) -> (Table, Vec<String>) {
        let mut filled = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !is_blank(row))
            .map(|(idx, _)| idx)
            .peekable();
        let Some(&first_filled) = filled.peek() else {
            return (Table::default(), Vec::new());
        };
        let header_idx = filled
            .take(HEADER_SCAN_ROWS)
            .find(|&idx| {
                rows[idx]
                    .iter()
                    .filter(|cell| self.aliases.recognise(cell).is_some())
                    .count()
                    >= MIN_RECOGNISED_HEADERS
            })
            .unwrap_or(first_filled);

        let mut body = rows.split_off(header_idx + 1);
        body.retain(|row| !is_blank(row));
        let header_row = rows.pop().unwrap_or_default();
        let preamble = rows
            .iter()
            .map(|row| first_non_empty(row).unwrap_or_default())
            .collect();

        let width = body
            .iter()
            .map(Vec::len)
            .chain(std::iter::once(header_row.len()))
            .max()
            .unwrap_or(0);
        let headers = (0..width)
            .map(|idx| match header_row.get(idx).map(|h| h.trim()) {
                Some(h) if !h.is_empty() => h.to_string(),
                _ => format!("column_{}", idx + 1),
            })
            .collect();
        (Table::from_text_rows(headers, body), preamble)
    }
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

fn first_non_empty(row: &[String]) -> Option<String> {
    row.iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty())
        .map(str::to_string)
}

fn read_spreadsheet(name: &str, bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let spreadsheet_err = |message: String| ReconError::Spreadsheet {
        source_name: name.to_string(),
        message,
    };
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| spreadsheet_err(e.to_string()))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| spreadsheet_err("workbook contains no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| spreadsheet_err(format!("sheet '{sheet}': {e}")))?;
    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect())
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Float(n) => format_number(*n),
        Data::Int(n) => n.to_string(),
        Data::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Data::Error(e) => format!("#{e:?}"),
        Data::DateTime(dt) => serial_to_iso(dt.as_f64()).unwrap_or_else(|| dt.as_f64().to_string()),
    }
}

/// Converts a 1900-system spreadsheet serial to `YYYY-MM-DD`.
fn serial_to_iso(serial: f64) -> Option<String> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch
        .checked_add_days(Days::new(serial.floor() as u64))
        .map(|d| d.format("%Y-%m-%d").to_string())
}
