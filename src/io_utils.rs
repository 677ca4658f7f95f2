//! I/O utilities for text decoding, delimiter resolution and artifact writing.
//!
//! All file I/O in deal-recon flows through this module. It provides:
//!
//! - **Delimiter resolution**: extension-based auto-detection (`.csv` → comma,
//!   `.tsv` → tab) with manual override support.
//! - **Decoding**: BOM sniffing, strict UTF-8, then a configured single-byte
//!   fallback (Hebrew exports are commonly windows-1255).
//! - **Artifact writing**: `write_table` serializes a [`Table`] with
//!   `QuoteStyle::Always`, transcoding via `encoding_rs` and prefixing a BOM
//!   for UTF-8 so spreadsheet tools keep non-Latin text intact.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use csv::QuoteStyle;
use encoding_rs::{Encoding, UTF_8};

use crate::{data::Value, table::Table};

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateStyle {
    /// `YYYY-MM-DD`
    #[default]
    Iso,
    /// `DD/MM/YYYY`
    DayFirst,
}

pub fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

pub fn resolve_input_delimiter(path: &Path, provided: Option<u8>) -> u8 {
    provided.unwrap_or_else(|| match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => DEFAULT_TSV_DELIMITER,
        _ => DEFAULT_CSV_DELIMITER,
    })
}

pub fn read_input(path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if is_dash(path) {
        io::stdin()
            .lock()
            .read_to_end(&mut buf)
            .context("Reading standard input")?;
    } else {
        File::open(path)
            .with_context(|| format!("Opening input file {path:?}"))?
            .read_to_end(&mut buf)
            .with_context(|| format!("Reading input file {path:?}"))?;
    }
    Ok(buf)
}

/// Decodes text bytes. A BOM wins; otherwise a forced encoding is used when
/// given, then strict UTF-8, then `fallback`. Returns the encoding applied.
pub fn decode_text(
    bytes: &[u8],
    forced: Option<&'static Encoding>,
    fallback: &'static Encoding,
) -> (String, &'static Encoding) {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return (text.into_owned(), encoding);
    }
    if let Some(encoding) = forced {
        let (text, _) = encoding.decode_without_bom_handling(bytes);
        return (text.into_owned(), encoding);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), UTF_8),
        Err(_) => {
            let (text, _) = fallback.decode_without_bom_handling(bytes);
            (text.into_owned(), fallback)
        }
    }
}

pub fn open_csv_reader<R>(reader: R, delimiter: u8, has_headers: bool) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(reader)
}

pub fn open_csv_writer(
    path: Option<&Path>,
    delimiter: u8,
    encoding: &'static Encoding,
) -> Result<csv::Writer<Box<dyn Write>>> {
    let mut base: Box<dyn Write> = match path {
        Some(p) if !is_dash(p) => Box::new(BufWriter::new(
            File::create(p).with_context(|| format!("Creating output file {p:?}"))?,
        )),
        _ => Box::new(std::io::stdout()),
    };

    let writer: Box<dyn Write> = if encoding == UTF_8 {
        base.write_all(UTF8_BOM).context("Writing byte order mark")?;
        base
    } else {
        Box::new(TranscodingWriter::new(base, encoding))
    };

    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(delimiter)
        .quote_style(QuoteStyle::Always)
        .double_quote(true);
    Ok(builder.from_writer(writer))
}

pub fn format_cell(value: &Value, dates: DateStyle) -> String {
    match (value, dates) {
        (Value::Date(d), DateStyle::DayFirst) => d.format("%d/%m/%Y").to_string(),
        (other, _) => other.as_display(),
    }
}

pub fn write_table(
    path: Option<&Path>,
    table: &Table,
    delimiter: u8,
    encoding: &'static Encoding,
    dates: DateStyle,
) -> Result<()> {
    let mut writer = open_csv_writer(path, delimiter, encoding)?;
    writer
        .write_record(&table.headers)
        .context("Writing output headers")?;
    for row in &table.rows {
        let record = row
            .iter()
            .map(|cell| cell.as_ref().map(|v| format_cell(v, dates)).unwrap_or_default())
            .collect::<Vec<_>>();
        writer.write_record(&record).context("Writing output row")?;
    }
    writer.flush().context("Flushing output")?;
    Ok(())
}

/// Resolves an artifact path: an explicit `--output` wins, else
/// `<output_dir>/<default_name>` (the directory is created), else the current
/// directory.
pub fn artifact_path(
    output: Option<&Path>,
    output_dir: Option<&Path>,
    default_name: &str,
) -> Result<PathBuf> {
    if let Some(path) = output {
        return Ok(path.to_path_buf());
    }
    let dir = output_dir.unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("Creating output directory {dir:?}"))?;
    Ok(dir.join(default_name))
}

/// Replaces characters that are awkward in file names with `_`.
pub fn sanitize_file_component(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ',' => '_',
            other => other,
        })
        .collect()
}

struct TranscodingWriter<W: Write> {
    inner: W,
    encoding: &'static Encoding,
    buffer: Vec<u8>,
}

impl<W: Write> TranscodingWriter<W> {
    fn new(inner: W, encoding: &'static Encoding) -> Self {
        Self {
            inner,
            encoding,
            buffer: Vec::new(),
        }
    }

    fn flush_buffer(&mut self, force: bool) -> io::Result<()> {
        match std::str::from_utf8(&self.buffer) {
            Ok(valid) => {
                let text = valid.to_owned();
                self.encode_and_write(&text)?;
                self.buffer.clear();
                Ok(())
            }
            Err(err) => {
                if err.error_len().is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Invalid UTF-8 sequence in output stream",
                    ));
                }
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    let text = String::from_utf8_lossy(&self.buffer[..valid_up_to]).into_owned();
                    self.encode_and_write(&text)?;
                    self.buffer.drain(..valid_up_to);
                }
                if force && !self.buffer.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Incomplete UTF-8 sequence at end of output stream",
                    ));
                }
                Ok(())
            }
        }
    }

    fn encode_and_write(&mut self, text: &str) -> io::Result<()> {
        let (encoded, _output_encoding, had_errors) = self.encoding.encode(text);
        if had_errors {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to encode text using {}", self.encoding.name()),
            ));
        }
        self.inner.write_all(encoded.as_ref())
    }
}

impl<W: Write> Write for TranscodingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.flush_buffer(false)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer(true)?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::WINDOWS_1255;

    #[test]
    fn decode_text_prefers_bom_then_utf8_then_fallback() {
        let with_bom = [UTF8_BOM, "ישוב".as_bytes()].concat();
        let (text, enc) = decode_text(&with_bom, None, WINDOWS_1255);
        assert_eq!(text, "ישוב");
        assert_eq!(enc, UTF_8);

        let (encoded, _, _) = WINDOWS_1255.encode("ישוב");
        let (text, enc) = decode_text(&encoded, None, WINDOWS_1255);
        assert_eq!(text, "ישוב");
        assert_eq!(enc, WINDOWS_1255);
    }

    #[test]
    fn sanitize_file_component_replaces_separators() {
        assert_eq!(sanitize_file_component(" תל אביב/יפו "), "תל_אביב_יפו");
        assert_eq!(sanitize_file_component("6650,6651"), "6650_6651");
    }

    #[test]
    fn format_cell_honours_date_style() {
        let date = Value::Date(chrono::NaiveDate::from_ymd_opt(2025, 1, 27).unwrap());
        assert_eq!(format_cell(&date, DateStyle::Iso), "2025-01-27");
        assert_eq!(format_cell(&date, DateStyle::DayFirst), "27/01/2025");
    }

    #[test]
    fn resolve_input_delimiter_uses_extension() {
        assert_eq!(resolve_input_delimiter(Path::new("a.tsv"), None), b'\t');
        assert_eq!(resolve_input_delimiter(Path::new("a.csv"), None), b',');
        assert_eq!(resolve_input_delimiter(Path::new("a.csv"), Some(b';')), b';');
    }
}
