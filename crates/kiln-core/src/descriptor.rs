//! Agent descriptor (`kiln.toml`) and entrypoint parsing.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{KilnError, Result};
use crate::resolve::shallowest_first;

/// Descriptor file name searched for inside an artifact.
pub const DESCRIPTOR_FILE: &str = "kiln.toml";
/// Dependency manifest, always packaged alongside the descriptor.
pub const DEPENDENCY_FILE: &str = "dependencies.toml";
/// Extension of loadable source modules.
pub const MODULE_EXTENSION: &str = "rhai";

/// `"module:function"`, where `module` is a dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoint {
    pub module: String,
    pub function: String,
}

impl FromStr for Entrypoint {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || KilnError::Configuration("entrypoint must be in format 'module:function'".into());
        let (module, function) = s.split_once(':').ok_or_else(invalid)?;
        let (module, function) = (module.trim(), function.trim());
        if module.is_empty() || function.is_empty() || function.contains(':') {
            return Err(invalid());
        }
        Ok(Entrypoint {
            module: module.to_string(),
            function: function.to_string(),
        })
    }
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.function)
    }
}

/// Parsed `kiln.toml`.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub name: Option<String>,
    /// Raw entrypoint string, not yet split.
    pub entrypoint: String,
    pub framework: Option<String>,
    /// The whole table, persisted as the version's configuration.
    pub table: toml::Table,
}

impl Descriptor {
    pub fn parse(text: &str) -> Result<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|e| KilnError::Configuration(format!("Invalid {DESCRIPTOR_FILE}: {e}")))?;

        let entrypoint = match table.get("entrypoint") {
            // Blank strings fail later as a malformed entrypoint.
            Some(toml::Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(KilnError::Configuration(format!(
                    "entrypoint in {DESCRIPTOR_FILE} must be a string"
                )))
            }
            None => {
                return Err(KilnError::Configuration(format!(
                    "entrypoint not specified in {DESCRIPTOR_FILE}"
                )))
            }
        };
        let string_field = |key: &str| table.get(key).and_then(|v| v.as_str()).map(String::from);

        Ok(Descriptor {
            name: string_field("name"),
            framework: string_field("framework"),
            entrypoint,
            table,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.table)?)
    }
}

/// Locate the descriptor under `root`, shallowest match first.
pub fn find_descriptor(root: &Path) -> Option<PathBuf> {
    let candidates = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == DESCRIPTOR_FILE)
        .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect();
    shallowest_first(candidates).map(|rel| root.join(rel))
}
