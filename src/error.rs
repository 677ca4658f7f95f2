//! Error taxonomy shared by the reader, normalizer, inferrer and engines.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReconError>;

#[derive(Debug, Error)]
pub enum ReconError {
    /// Bytes or extension not recognised by any tabular reader.
    #[error("unsupported format for '{source_name}': {reason}")]
    UnsupportedFormat { source_name: String, reason: String },

    /// No date range and no location could be established for a reference source.
    #[error("could not infer a date range or location for '{source_name}'")]
    ContextInference { source_name: String },

    /// None of the composite-key columns exist in the table being grouped or compared.
    #[error("{table} has none of the key columns ({})", .expected.join(", "))]
    MissingKeyColumns { table: String, expected: Vec<String> },

    /// A date cell failed to parse. Converted to a missing cell by the normalizer.
    #[error("malformed date '{value}'")]
    MalformedDate { value: String },

    #[error("failed to read spreadsheet '{source_name}': {message}")]
    Spreadsheet { source_name: String, message: String },

    #[error("failed to read archive '{source_name}': {source}")]
    Archive {
        source_name: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("CSV error in '{source_name}': {source}")]
    Csv {
        source_name: String,
        #[source]
        source: csv::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReconError {
    pub fn unsupported(source_name: &str, reason: impl Into<String>) -> Self {
        ReconError::UnsupportedFormat {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }
}
