//! Directional coverage diffing between variants.
//!
//! For every ordered pair `(x, y)` of distinct variants and every file in
//! `x`, the remainder `x[file] - y[file]` is computed. Non-empty remainders
//! become [`DiffRow`]s, grouped per direction and ranked largest first.
//! The two directions of a pair are always reported separately.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::coverage::CoverageByVariant;

/// Rows kept per direction.
pub const DEFAULT_TOP_N: usize = 20;

/// Lines covered under `variant_x` but not under `variant_y` for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRow {
    pub file: String,
    pub variant_x: String,
    pub variant_y: String,
    pub x_size: usize,
    pub y_size: usize,
    pub remainder_size: usize,
    pub remainder: BTreeSet<u32>,
}

impl fmt::Display for DiffRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} additional lines in {}", self.remainder_size, self.file)
    }
}

/// Ranked rows for one direction `(variant_x, variant_y)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffGroup {
    pub variant_x: String,
    pub variant_y: String,
    /// Files with a non-empty remainder, before truncation to the top rows.
    pub files_differing: usize,
    pub rows: Vec<DiffRow>,
}

/// Every direction's ranked rows, in variant pair order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageDiff {
    pub groups: Vec<DiffGroup>,
}

impl CoverageDiff {
    /// The group for direction `(x, y)`.
    pub fn direction(&self, x: &str, y: &str) -> Option<&DiffGroup> {
        self.groups
            .iter()
            .find(|g| g.variant_x == x && g.variant_y == y)
    }

    /// All reported rows, direction by direction.
    pub fn rows(&self) -> impl Iterator<Item = &DiffRow> {
        self.groups.iter().flat_map(|g| g.rows.iter())
    }
}

/// Compute the directional diff of `coverage`, keeping `top_n` rows per
/// direction. Pure; the input is not modified.
pub fn diff(coverage: &CoverageByVariant, top_n: usize) -> CoverageDiff {
    let empty = BTreeSet::new();
    let mut groups = Vec::new();

    for (xi, x) in coverage.variants.iter().enumerate() {
        for (yi, y) in coverage.variants.iter().enumerate() {
            if xi == yi {
                continue;
            }
            let mut rows: Vec<DiffRow> = x
                .files
                .iter()
                .filter_map(|(file, x_lines)| {
                    let y_lines = y.files.lines(file).unwrap_or(&empty);
                    let remainder: BTreeSet<u32> = x_lines.difference(y_lines).copied().collect();
                    (!remainder.is_empty()).then(|| DiffRow {
                        file: file.to_string(),
                        variant_x: x.variant.clone(),
                        variant_y: y.variant.clone(),
                        x_size: x_lines.len(),
                        y_size: y_lines.len(),
                        remainder_size: remainder.len(),
                        remainder,
                    })
                })
                .collect();

            // stable: ties keep file-name order
            rows.sort_by(|a, b| b.remainder_size.cmp(&a.remainder_size));
            let files_differing = rows.len();
            rows.truncate(top_n);

            groups.push(DiffGroup {
                variant_x: x.variant.clone(),
                variant_y: y.variant.clone(),
                files_differing,
                rows,
            });
        }
    }
    CoverageDiff { groups }
}
