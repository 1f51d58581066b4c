//! A specification bound to a build/probe orientation.

use hhj_result::Result as HhjResult;
use hhj_types::Row;

use crate::hashing::{HashKey, extract_key};
use crate::{JoinSpecification, ResidualPredicate};

/// Key columns and policies seen from the build/probe point of view.
///
/// Everything downstream of build-side selection works in build/probe terms;
/// the plan translates back to left/right where the caller can observe it.
pub(crate) struct JoinPlan {
    build_keys: Vec<usize>,
    probe_keys: Vec<usize>,
    null_safe: Vec<bool>,
    residual: Option<ResidualPredicate>,
    pub(crate) build_is_left: bool,
    pub(crate) emit_matches: bool,
    pub(crate) emit_build_unmatched: bool,
    pub(crate) emit_probe_unmatched: bool,
}

impl JoinPlan {
    pub(crate) fn new(spec: &JoinSpecification, build_is_left: bool) -> Self {
        let left_keys: Vec<usize> = spec.keys.iter().map(|k| k.left_column).collect();
        let right_keys: Vec<usize> = spec.keys.iter().map(|k| k.right_column).collect();
        let (build_keys, probe_keys) = if build_is_left {
            (left_keys, right_keys)
        } else {
            (right_keys, left_keys)
        };
        let (emit_build_unmatched, emit_probe_unmatched) = if build_is_left {
            (spec.include_left_unmatched, spec.include_right_unmatched)
        } else {
            (spec.include_right_unmatched, spec.include_left_unmatched)
        };
        Self {
            build_keys,
            probe_keys,
            null_safe: spec.keys.iter().map(|k| k.null_equals_null).collect(),
            residual: spec.residual.clone(),
            build_is_left,
            emit_matches: spec.include_matches,
            emit_build_unmatched,
            emit_probe_unmatched,
        }
    }

    pub(crate) fn build_key(&self, row: &Row) -> HhjResult<Option<HashKey>> {
        extract_key(row, &self.build_keys, &self.null_safe)
    }

    pub(crate) fn probe_key(&self, row: &Row) -> HhjResult<Option<HashKey>> {
        extract_key(row, &self.probe_keys, &self.null_safe)
    }

    /// Apply the residual predicate to a key-equal pair, in left/right order.
    pub(crate) fn accepts(&self, build: &Row, probe: &Row) -> bool {
        match &self.residual {
            None => true,
            Some(predicate) if self.build_is_left => predicate(build, probe),
            Some(predicate) => predicate(probe, build),
        }
    }
}
