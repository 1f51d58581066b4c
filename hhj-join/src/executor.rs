//! In-memory join of one bucket pair.
//!
//! A [`HashIndex`] owns the build rows of a single bucket, keyed by their
//! join-key tuple with duplicates preserved. Probe rows are looked up one at
//! a time; candidate pairs pass through the residual predicate before they
//! are emitted. Build rows matched at least once are remembered so the
//! unmatched ones can be emitted after the last probe row of the bucket.

use hhj_result::{Error, Result as HhjResult};
use hhj_types::Row;
use rustc_hash::FxHashMap;

use crate::hashing::HashKey;
use crate::output::OutputCollector;
use crate::plan::JoinPlan;

/// Hash table over the build rows of one bucket.
pub(crate) struct HashIndex {
    rows: Vec<Row>,
    table: FxHashMap<HashKey, Vec<usize>>,
    matched: Vec<bool>,
}

impl HashIndex {
    /// Index every row. All rows must carry a matchable key; unmatchable rows
    /// are routed around buckets before they get here.
    pub(crate) fn build(rows: Vec<Row>, plan: &JoinPlan) -> HhjResult<Self> {
        let mut table: FxHashMap<HashKey, Vec<usize>> = FxHashMap::default();
        for (idx, row) in rows.iter().enumerate() {
            let key = plan.build_key(row)?.ok_or_else(|| {
                Error::Internal(format!("build row {} without a matchable key in a bucket", row.id))
            })?;
            table.entry(key).or_default().push(idx);
        }
        let matched = vec![false; rows.len()];
        Ok(Self {
            rows,
            table,
            matched,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    /// Join one probe row against the index, emitting matches in build
    /// insertion order. Returns whether any candidate survived the residual.
    pub(crate) fn probe(
        &mut self,
        probe: &Row,
        key: &HashKey,
        plan: &JoinPlan,
        out: &mut OutputCollector,
    ) -> bool {
        let Some(candidates) = self.table.get(key) else {
            return false;
        };
        let mut any = false;
        for &idx in candidates {
            let build = &self.rows[idx];
            if !plan.accepts(build, probe) {
                continue;
            }
            any = true;
            self.matched[idx] = true;
            if plan.emit_matches {
                out.matched(build, probe);
            }
        }
        any
    }

    /// Probe, then emit the probe row as unmatched if nothing survived.
    pub(crate) fn probe_row(
        &mut self,
        probe: &Row,
        plan: &JoinPlan,
        out: &mut OutputCollector,
    ) -> HhjResult<()> {
        let matched = match plan.probe_key(probe)? {
            Some(key) => self.probe(probe, &key, plan, out),
            None => false,
        };
        if !matched && plan.emit_probe_unmatched {
            out.probe_unmatched(probe);
        }
        Ok(())
    }

    /// Emit build rows never matched, consuming the index.
    pub(crate) fn finish(self, plan: &JoinPlan, out: &mut OutputCollector) {
        if !plan.emit_build_unmatched {
            return;
        }
        for (row, matched) in self.rows.iter().zip(&self.matched) {
            if !matched {
                out.build_unmatched(row);
            }
        }
    }
}
