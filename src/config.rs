//! YAML configuration layered over built-in defaults.
//!
//! Every field is optional. Absent fields keep the defaults returned by
//! [`ReconConfig::default`]; the loaded value is read-only afterwards and
//! handed to the reader, normalizer and inferrer when they are constructed.

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result, anyhow};
use encoding_rs::Encoding;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::normalize::{AliasTable, Column, PlaceholderTable};

pub const DEFAULT_AREA_MARKERS: &[&str] = &["גוש", "block", "gush"];
pub const DEFAULT_FALLBACK_ENCODING: &str = "windows-1255";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReconConfig {
    /// Extra `alias -> canonical column` entries, consulted before built-ins.
    pub aliases: BTreeMap<String, Column>,
    pub area_markers: Vec<String>,
    pub placeholders: Vec<Placeholder>,
    pub metadata_cells: MetadataCells,
    pub fallback_encoding: String,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Placeholder {
    pub token: String,
    /// `None` blanks the cell out.
    #[serde(default)]
    pub replace_with: Option<String>,
}

/// Which preamble cells carry the free-text query description.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetadataCells {
    pub skip: usize,
    pub take: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExportConfig {
    pub extra_numeric_columns: Vec<String>,
    pub extra_date_columns: Vec<String>,
    pub drop_columns: Vec<String>,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            aliases: BTreeMap::new(),
            area_markers: DEFAULT_AREA_MARKERS.iter().map(|m| m.to_string()).collect(),
            placeholders: PlaceholderTable::builtin()
                .entries()
                .iter()
                .map(|(token, replace_with)| Placeholder {
                    token: token.clone(),
                    replace_with: replace_with.clone(),
                })
                .collect(),
            metadata_cells: MetadataCells::default(),
            fallback_encoding: DEFAULT_FALLBACK_ENCODING.to_string(),
            export: ExportConfig::default(),
        }
    }
}

impl Default for MetadataCells {
    fn default() -> Self {
        Self { skip: 1, take: 3 }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            extra_numeric_columns: [
                "full_price",
                "declared_value",
                "declared_value_dollar",
                "estimate_price",
                "estimate_price_dollar",
                "price_per_room",
                "room_num2",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            extra_date_columns: vec!["deal_date".to_string()],
            drop_columns: vec![Column::SnapshotDate.name().to_string()],
        }
    }
}

impl ReconConfig {
    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw =
            fs::read_to_string(path).with_context(|| format!("Opening config file {path:?}"))?;
        let config = Self::from_yaml(&raw).with_context(|| format!("Parsing config {path:?}"))?;
        debug!(
            "Loaded config from {:?}: {} alias override(s), {} placeholder(s)",
            path,
            config.aliases.len(),
            config.placeholders.len()
        );
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        config.fallback_encoding()?;
        Ok(config)
    }

    pub fn fallback_encoding(&self) -> Result<&'static Encoding> {
        Encoding::for_label(self.fallback_encoding.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown fallback encoding '{}'", self.fallback_encoding))
    }

    pub fn alias_table(&self) -> AliasTable {
        AliasTable::builtin().with_overrides(&self.aliases)
    }

    pub fn placeholder_table(&self) -> PlaceholderTable {
        PlaceholderTable::new(
            self.placeholders
                .iter()
                .map(|p| (p.token.clone(), p.replace_with.clone())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = ReconConfig::from_yaml(
            r#"
aliases:
  "שטח בנוי": floor_area
metadata_cells: { skip: 0 }
"#,
        )
        .unwrap();
        assert_eq!(config.aliases.get("שטח בנוי"), Some(&Column::FloorArea));
        assert_eq!(config.metadata_cells, MetadataCells { skip: 0, take: 3 });
        assert_eq!(config.area_markers, ReconConfig::default().area_markers);
        assert_eq!(config.export.drop_columns, vec!["snapshot_date"]);
    }

    #[test]
    fn unknown_canonical_column_is_rejected() {
        assert!(ReconConfig::from_yaml("aliases: { foo: not_a_column }").is_err());
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        assert!(ReconConfig::from_yaml("fallback_encoding: klingon").is_err());
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(ReconConfig::from_yaml("  ").unwrap(), ReconConfig::default());
    }
}
