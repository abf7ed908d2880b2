//! Per-file line coverage: records as fetched, and per-variant accumulations.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::expr::lookup;

pub const FILE_NAME_FIELD: &str = "source.file.name";
pub const COVERED_FIELD: &str = "source.file.covered";

/// One coverage row: a single (context, source file) pair and the lines it
/// covered.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageRecord {
    pub file_name: String,
    pub covered_lines: BTreeSet<u32>,
}

impl CoverageRecord {
    /// Extract file name and covered lines from a raw `coverage` row.
    ///
    /// Returns `None` for rows with no file name. A row without covered
    /// lines yields an empty set.
    pub fn from_row(row: &Value) -> Option<Self> {
        let file_name = lookup(row, FILE_NAME_FIELD)?.as_str()?.to_string();
        let mut covered_lines = BTreeSet::new();
        if let Some(covered) = lookup(row, COVERED_FIELD) {
            collect_lines(covered, &mut covered_lines);
        }
        Some(CoverageRecord {
            file_name,
            covered_lines,
        })
    }
}

/// Accepts `[1, 2]`, `[{"line": 1}, ...]`, `{"line": 1}` and `{"line": [1, 2]}`.
fn collect_lines(value: &Value, out: &mut BTreeSet<u32>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_lines(item, out);
            }
        }
        Value::Object(obj) => {
            if let Some(line) = obj.get("line") {
                collect_lines(line, out);
            }
        }
        Value::Number(n) => {
            if let Some(line) = n.as_u64().and_then(|l| u32::try_from(l).ok()) {
                out.insert(line);
            }
        }
        _ => {}
    }
}

/// Map from file name to the union of covered lines attributed to one
/// variant. Only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCoverageSet {
    files: BTreeMap<String, BTreeSet<u32>>,
}

impl FileCoverageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `lines` into the entry for `file`.
    pub fn absorb<I>(&mut self, file: &str, lines: I)
    where
        I: IntoIterator<Item = u32>,
    {
        self.files
            .entry(file.to_string())
            .or_default()
            .extend(lines);
    }

    /// Covered lines for `file`; `None` means no record matched.
    pub fn lines(&self, file: &str) -> Option<&BTreeSet<u32>> {
        self.files.get(file)
    }

    /// Files in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<u32>)> {
        self.files.iter().map(|(f, l)| (f.as_str(), l))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<S: Into<String>, I: IntoIterator<Item = u32>> FromIterator<(S, I)> for FileCoverageSet {
    fn from_iter<T: IntoIterator<Item = (S, I)>>(iter: T) -> Self {
        let mut set = FileCoverageSet::new();
        for (file, lines) in iter {
            set.absorb(&file.into(), lines);
        }
        set
    }
}

/// Coverage accumulated for one named variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantCoverage {
    pub variant: String,
    pub files: FileCoverageSet,
}

/// Per-variant coverage, in the order the variants were supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageByVariant {
    pub variants: Vec<VariantCoverage>,
}

impl CoverageByVariant {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CoverageByVariant {
            variants: names
                .into_iter()
                .map(|name| VariantCoverage {
                    variant: name.into(),
                    files: FileCoverageSet::new(),
                })
                .collect(),
        }
    }

    /// Coverage of the variant called `name`.
    pub fn get(&self, name: &str) -> Option<&FileCoverageSet> {
        self.variants
            .iter()
            .find(|v| v.variant == name)
            .map(|v| &v.files)
    }
}
