//! Join result rows and the collector that accumulates them.

use hhj_types::{Row, RowId, Value};

use crate::{JoinOutputMode, JoinSpecification, OutputOrder};

/// One result row.
///
/// `values` holds the projected left columns followed by the projected right
/// columns. In split mode, unmatched rows carry only their own side's columns.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputRow {
    pub left_row_id: Option<RowId>,
    pub right_row_id: Option<RowId>,
    pub values: Vec<Value>,
}

/// Result streams of a join in [`JoinOutputMode::Split`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplitOutput {
    pub matches: Vec<OutputRow>,
    pub left_unmatched: Vec<OutputRow>,
    pub right_unmatched: Vec<OutputRow>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JoinOutput {
    Combined(Vec<OutputRow>),
    Split(SplitOutput),
}

impl JoinOutput {
    /// Total rows across all streams.
    pub fn len(&self) -> usize {
        match self {
            JoinOutput::Combined(rows) => rows.len(),
            JoinOutput::Split(split) => {
                split.matches.len() + split.left_unmatched.len() + split.right_unmatched.len()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every row, matches first in split mode.
    pub fn rows(&self) -> Box<dyn Iterator<Item = &OutputRow> + '_> {
        match self {
            JoinOutput::Combined(rows) => Box::new(rows.iter()),
            JoinOutput::Split(split) => Box::new(
                split
                    .matches
                    .iter()
                    .chain(&split.left_unmatched)
                    .chain(&split.right_unmatched),
            ),
        }
    }

    pub fn into_combined(self) -> Option<Vec<OutputRow>> {
        match self {
            JoinOutput::Combined(rows) => Some(rows),
            JoinOutput::Split(_) => None,
        }
    }

    pub fn into_split(self) -> Option<SplitOutput> {
        match self {
            JoinOutput::Split(split) => Some(split),
            JoinOutput::Combined(_) => None,
        }
    }
}

/// Accumulates rows reported in build/probe terms as left/right output rows.
pub(crate) struct OutputCollector {
    mode: JoinOutputMode,
    order: OutputOrder,
    build_is_left: bool,
    left_columns: Vec<usize>,
    right_columns: Vec<usize>,
    combined: Vec<OutputRow>,
    split: SplitOutput,
}

impl OutputCollector {
    pub(crate) fn new(
        spec: &JoinSpecification,
        build_is_left: bool,
        left_width: usize,
        right_width: usize,
    ) -> Self {
        Self {
            mode: spec.output_mode,
            order: spec.output_order,
            build_is_left,
            left_columns: spec
                .left_columns
                .clone()
                .unwrap_or_else(|| (0..left_width).collect()),
            right_columns: spec
                .right_columns
                .clone()
                .unwrap_or_else(|| (0..right_width).collect()),
            combined: Vec::new(),
            split: SplitOutput::default(),
        }
    }

    pub(crate) fn matched(&mut self, build: &Row, probe: &Row) {
        let (left, right) = if self.build_is_left {
            (build, probe)
        } else {
            (probe, build)
        };
        let mut values = project(left, &self.left_columns);
        values.extend(project(right, &self.right_columns));
        let row = OutputRow {
            left_row_id: Some(left.id),
            right_row_id: Some(right.id),
            values,
        };
        match self.mode {
            JoinOutputMode::Combined => self.combined.push(row),
            JoinOutputMode::Split => self.split.matches.push(row),
        }
    }

    pub(crate) fn build_unmatched(&mut self, row: &Row) {
        if self.build_is_left {
            self.left_unmatched(row);
        } else {
            self.right_unmatched(row);
        }
    }

    pub(crate) fn probe_unmatched(&mut self, row: &Row) {
        if self.build_is_left {
            self.right_unmatched(row);
        } else {
            self.left_unmatched(row);
        }
    }

    fn left_unmatched(&mut self, row: &Row) {
        let mut values = project(row, &self.left_columns);
        match self.mode {
            JoinOutputMode::Combined => {
                values.resize(values.len() + self.right_columns.len(), Value::Null);
                self.combined.push(OutputRow {
                    left_row_id: Some(row.id),
                    right_row_id: None,
                    values,
                });
            }
            JoinOutputMode::Split => self.split.left_unmatched.push(OutputRow {
                left_row_id: Some(row.id),
                right_row_id: None,
                values,
            }),
        }
    }

    fn right_unmatched(&mut self, row: &Row) {
        let right = project(row, &self.right_columns);
        match self.mode {
            JoinOutputMode::Combined => {
                let mut values = vec![Value::Null; self.left_columns.len()];
                values.extend(right);
                self.combined.push(OutputRow {
                    left_row_id: None,
                    right_row_id: Some(row.id),
                    values,
                });
            }
            JoinOutputMode::Split => self.split.right_unmatched.push(OutputRow {
                left_row_id: None,
                right_row_id: Some(row.id),
                values: right,
            }),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.combined.len()
            + self.split.matches.len()
            + self.split.left_unmatched.len()
            + self.split.right_unmatched.len()
    }

    pub(crate) fn finish(mut self) -> JoinOutput {
        if self.order == OutputOrder::Stable {
            // Left-bearing rows first by left id, then right-only rows by right id.
            self.combined
                .sort_by_key(|r| (r.left_row_id.is_none(), r.left_row_id, r.right_row_id));
            self.split
                .matches
                .sort_by_key(|r| (r.left_row_id, r.right_row_id));
            self.split.left_unmatched.sort_by_key(|r| r.left_row_id);
            self.split.right_unmatched.sort_by_key(|r| r.right_row_id);
        }
        match self.mode {
            JoinOutputMode::Combined => JoinOutput::Combined(self.combined),
            JoinOutputMode::Split => JoinOutput::Split(self.split),
        }
    }
}

fn project(row: &Row, columns: &[usize]) -> Vec<Value> {
    columns
        .iter()
        .map(|&c| row.value(c).cloned().unwrap_or(Value::Null))
        .collect()
}
