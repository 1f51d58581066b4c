//! Integration tests for the disk paths: forced spilling, recursive
//! re-partitioning, the block-nested-loop fallback, cancellation and the
//! open-file budget. Results are compared against a nested-loop oracle.

use std::path::Path;

use hhj_join::{
    BuildSide, CancellationToken, HybridHashJoin, JoinConfig, JoinKey, JoinOutcome, JoinOutput,
    JoinOutputMode, JoinSpecification, JoinState, JoinType, MemoryProbe, ProgressSink,
};
use hhj_test_utils::{init_tracing_for_tests, keyed_rows, keyed_source};
use hhj_types::{Row, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Probe reporting an idle process, so only the overrides cause spilling.
struct IdleProbe;

impl MemoryProbe for IdleProbe {
    fn used_bytes(&mut self) -> Option<u64> {
        Some(0)
    }
}

fn forced_spill_config(spill_dir: &Path) -> JoinConfig {
    JoinConfig::default()
        .with_num_partitions(8)
        .with_pressure_check_rows(1)
        .with_assume_memory_low(true)
        .with_spill_dir(spill_dir)
}

fn engine(config: JoinConfig) -> HybridHashJoin {
    init_tracing_for_tests();
    HybridHashJoin::new(config).with_memory_probe(Box::new(IdleProbe))
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

fn render_row(values: &[Value]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn combined(output: &JoinOutput) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = output.rows().map(|r| render_row(&r.values)).collect();
    rows.sort();
    rows
}

/// Nested-loop reference join over `(key, payload)` rows.
fn oracle(left: &[Row], right: &[Row], join_type: JoinType, null_safe: bool) -> Vec<Vec<String>> {
    oracle_with_residual(left, right, join_type, null_safe, |_, _| true)
}

fn oracle_with_residual(
    left: &[Row],
    right: &[Row],
    join_type: JoinType,
    null_safe: bool,
    residual: impl Fn(&Row, &Row) -> bool,
) -> Vec<Vec<String>> {
    let keys_match = |l: &Value, r: &Value| match (l, r) {
        (Value::Null, Value::Null) => null_safe,
        (Value::Null, _) | (_, Value::Null) => false,
        (l, r) => l == r,
    };
    let mut rows = Vec::new();
    let mut right_matched = vec![false; right.len()];
    for l in left {
        let mut matched = false;
        for (ri, r) in right.iter().enumerate() {
            if keys_match(&l.values[0], &r.values[0]) && residual(l, r) {
                matched = true;
                right_matched[ri] = true;
                let mut values = l.values.clone();
                values.extend(r.values.iter().cloned());
                rows.push(render_row(&values));
            }
        }
        if !matched && matches!(join_type, JoinType::Left | JoinType::Full) {
            let mut values = l.values.clone();
            values.extend([Value::Null, Value::Null]);
            rows.push(render_row(&values));
        }
    }
    if matches!(join_type, JoinType::Right | JoinType::Full) {
        for (r, matched) in right.iter().zip(right_matched) {
            if !matched {
                let mut values = vec![Value::Null, Value::Null];
                values.extend(r.values.iter().cloned());
                rows.push(render_row(&values));
            }
        }
    }
    rows.sort();
    rows
}

fn random_side(rng: &mut StdRng, n: usize, key_domain: i64, prefix: &str) -> Vec<(Option<i64>, String)> {
    (0..n)
        .map(|i| {
            let key = if rng.random_bool(0.05) {
                None
            } else {
                Some(rng.random_range(0..key_domain))
            };
            (key, format!("{prefix}{i}"))
        })
        .collect()
}

fn source(pairs: &[(Option<i64>, String)]) -> hhj_types::VecRowSource {
    let borrowed: Vec<(Option<i64>, &str)> = pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
    keyed_source("k", "v", &borrowed)
}

fn rows(pairs: &[(Option<i64>, String)]) -> Vec<Row> {
    let borrowed: Vec<(Option<i64>, &str)> = pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
    keyed_rows(&borrowed)
}

#[test]
fn test_forced_spill_matches_in_memory_run() {
    let scratch = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let left = random_side(&mut rng, 400, 50, "l");
    let right = random_side(&mut rng, 300, 50, "r");
    let spec = JoinSpecification::full(vec![JoinKey::new(0, 0)]);

    let in_memory = engine(JoinConfig::default())
        .join(&spec, source(&left), source(&right))
        .unwrap();

    let mut spilling = engine(forced_spill_config(scratch.path()));
    let on_disk = spilling.join(&spec, source(&left), source(&right)).unwrap();

    assert_eq!(combined(&in_memory), combined(&on_disk));
    assert_eq!(
        combined(&on_disk),
        oracle(&rows(&left), &rows(&right), JoinType::Full, false)
    );

    let stats = spilling.monitor().snapshot();
    assert_eq!(stats.state, JoinState::Completed);
    assert!(stats.buckets_spilled > 0);
    assert!(stats.probe_rows_from_disk > 0);
    // The right input is smaller, so it is the build side.
    assert_eq!(stats.build_rows, 300);
    assert_eq!(stats.probe_rows, 400);
    assert!(dir_is_empty(scratch.path()));
}

#[test]
fn test_desired_spilled_buckets_override() {
    let scratch = tempfile::tempdir().unwrap();
    let config = JoinConfig::default()
        .with_num_partitions(16)
        .with_pressure_check_rows(1)
        .with_desired_spilled_buckets(3)
        .with_spill_dir(scratch.path());
    let pairs: Vec<(Option<i64>, String)> = (0..200).map(|i| (Some(i), format!("v{i}"))).collect();
    let spec = JoinSpecification::inner(vec![JoinKey::new(0, 0)]);

    let mut engine = engine(config);
    let output = engine.join(&spec, source(&pairs), source(&pairs)).unwrap();
    assert_eq!(output.len(), 200);

    let stats = engine.monitor().snapshot();
    assert_eq!(stats.buckets_spilled, 3);
    assert!(stats.probe_rows_in_memory > 0);
    assert!(stats.probe_rows_from_disk > 0);
    assert_eq!(stats.probe_rows_in_memory + stats.probe_rows_from_disk, 200);
}

#[test]
fn test_oversized_buckets_are_repartitioned() {
    let scratch = tempfile::tempdir().unwrap();
    let config = forced_spill_config(scratch.path())
        .with_num_partitions(2)
        .with_resident_bucket_rows(20)
        .with_recursion_fanout(4);
    let mut rng = StdRng::seed_from_u64(11);
    let left = random_side(&mut rng, 300, 1000, "l");
    let right = random_side(&mut rng, 300, 1000, "r");
    let spec = JoinSpecification::left(vec![JoinKey::new(0, 0)]);

    let mut engine = engine(config);
    let output = engine.join(&spec, source(&left), source(&right)).unwrap();
    assert_eq!(
        combined(&output),
        oracle(&rows(&left), &rows(&right), JoinType::Left, false)
    );

    let stats = engine.monitor().snapshot();
    assert!(stats.repartitioned_buckets >= 2);
    assert!(stats.max_depth_reached >= 1);
    assert!(dir_is_empty(scratch.path()));
}

#[test]
fn test_skewed_key_falls_back_and_terminates() {
    let scratch = tempfile::tempdir().unwrap();
    let config = forced_spill_config(scratch.path())
        .with_num_partitions(4)
        .with_resident_bucket_rows(16)
        .with_max_recursion_depth(2)
        .with_recursion_fanout(4);

    let mut left: Vec<(Option<i64>, String)> = (0..200).map(|i| (Some(7), format!("l{i}"))).collect();
    left.extend((0..10).map(|i| (Some(100 + i), format!("u{i}"))));
    let right: Vec<(Option<i64>, String)> = (0..50).map(|i| (Some(7), format!("r{i}"))).collect();
    let spec = JoinSpecification::full(vec![JoinKey::new(0, 0)]);

    let mut engine = engine(config);
    let output = engine.join(&spec, source(&left), source(&right)).unwrap();
    // 200 x 50 matches plus the 10 unmatched left rows.
    assert_eq!(output.len(), 10_010);
    assert_eq!(
        combined(&output),
        oracle(&rows(&left), &rows(&right), JoinType::Full, false)
    );

    let stats = engine.monitor().snapshot();
    assert!(stats.recursion_fallbacks >= 1);
    assert_eq!(stats.max_depth_reached, 2);
    assert!(stats.build_bucket_cv() > 0.0);
    assert!(dir_is_empty(scratch.path()));
}

#[test]
fn test_oversized_children_spill_without_memory_pressure() {
    let scratch = tempfile::tempdir().unwrap();
    // Only the first bucket is forced out; the process itself looks idle.
    let config = JoinConfig::default()
        .with_num_partitions(1)
        .with_desired_spilled_buckets(1)
        .with_resident_bucket_rows(16)
        .with_max_recursion_depth(2)
        .with_spill_dir(scratch.path());

    let mut left: Vec<(Option<i64>, String)> = (0..200).map(|i| (Some(7), format!("l{i}"))).collect();
    left.extend((0..100).map(|i| (Some(1000 + i), format!("u{i}"))));
    let mut right: Vec<(Option<i64>, String)> = (0..5).map(|i| (Some(7), format!("r{i}"))).collect();
    right.extend((0..20).map(|i| (Some(1000 + i * 7), format!("s{i}"))));
    let spec = JoinSpecification::left(vec![JoinKey::new(0, 0)]).with_build_side(BuildSide::Left);

    let mut engine = engine(config);
    let output = engine.join(&spec, source(&left), source(&right)).unwrap();
    assert_eq!(
        combined(&output),
        oracle(&rows(&left), &rows(&right), JoinType::Left, false)
    );

    let stats = engine.monitor().snapshot();
    assert_eq!(stats.build_rows, 300);
    assert_eq!(stats.recursion_fallbacks, 1);
    assert_eq!(stats.max_depth_reached, 2);
    assert!(stats.repartitioned_buckets >= 2);
    // Only the block-nested-loop bucket was joined above the resident limit.
    let oversized = stats.build_bucket_rows.iter().filter(|&&rows| rows > 16).count();
    assert_eq!(oversized as u64, stats.recursion_fallbacks);
    assert!(stats.spill_io.files_created > 0);
    assert!(stats.spill_io.bytes_read > 0);
    assert!(dir_is_empty(scratch.path()));
}

#[test]
fn test_residual_predicate_on_disk_paths() {
    let scratch = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(41);
    let residual = |l: &Row, r: &Row| (l.id + r.id) % 3 != 0;

    for join_type in [JoinType::Inner, JoinType::Full] {
        let left = random_side(&mut rng, 180, 12, "l");
        let right = random_side(&mut rng, 120, 12, "r");
        let spec = JoinSpecification::new(join_type, vec![JoinKey::new(0, 0)]).with_residual(residual);
        let expected = oracle_with_residual(&rows(&left), &rows(&right), join_type, false, residual);

        let configs = [
            JoinConfig::default(),
            forced_spill_config(scratch.path()),
            forced_spill_config(scratch.path())
                .with_num_partitions(2)
                .with_resident_bucket_rows(7)
                .with_max_recursion_depth(0),
        ];
        for config in configs {
            let mut engine = engine(config.clone());
            let output = engine.join(&spec, source(&left), source(&right)).unwrap();
            assert_eq!(combined(&output), expected, "{join_type}, {config:?}");
        }
    }
    assert!(dir_is_empty(scratch.path()));
}

#[test]
fn test_rejected_candidates_are_unmatched_once() {
    let scratch = tempfile::tempdir().unwrap();
    let config = forced_spill_config(scratch.path())
        .with_num_partitions(2)
        .with_resident_bucket_rows(8)
        .with_max_recursion_depth(1)
        .with_recursion_fanout(2);
    let left: Vec<(Option<i64>, String)> = (0..60).map(|i| (Some(7), format!("l{i}"))).collect();
    let right: Vec<(Option<i64>, String)> = (0..30).map(|i| (Some(7), format!("r{i}"))).collect();
    let spec = JoinSpecification::full(vec![JoinKey::new(0, 0)]).with_residual(|_, _| false);

    let mut engine = engine(config);
    let output = engine.join(&spec, source(&left), source(&right)).unwrap();
    assert_eq!(output.len(), 90);
    assert_eq!(
        combined(&output),
        oracle_with_residual(&rows(&left), &rows(&right), JoinType::Full, false, |_, _| false)
    );

    // The smaller right side builds and is joined in blocks of 8, so every
    // left row is re-read four times before it is known to be unmatched.
    let stats = engine.monitor().snapshot();
    assert_eq!(stats.build_rows, 30);
    assert_eq!(stats.recursion_fallbacks, 1);
    assert!(output.rows().all(|r| r.left_row_id.is_none() || r.right_row_id.is_none()));
    assert!(dir_is_empty(scratch.path()));
}

#[test]
fn test_two_file_budget_still_completes() {
    let scratch = tempfile::tempdir().unwrap();
    let config = forced_spill_config(scratch.path())
        .with_num_partitions(16)
        .with_resident_bucket_rows(8)
        .with_recursion_fanout(3);
    let mut rng = StdRng::seed_from_u64(23);
    let left = random_side(&mut rng, 250, 40, "l");
    let right = random_side(&mut rng, 250, 40, "r");
    let spec = JoinSpecification::full(vec![JoinKey::new(0, 0)]).with_max_open_files(2);

    let output = engine(config)
        .join(&spec, source(&left), source(&right))
        .unwrap();
    assert_eq!(
        combined(&output),
        oracle(&rows(&left), &rows(&right), JoinType::Full, false)
    );
    assert!(dir_is_empty(scratch.path()));
}

#[test]
fn test_randomized_runs_agree_with_oracle() {
    let scratch = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let join_types = [JoinType::Inner, JoinType::Left, JoinType::Right, JoinType::Full];

    for round in 0..12 {
        let left_rows = rng.random_range(0..150);
        let left = random_side(&mut rng, left_rows, 30, "l");
        let right_rows = rng.random_range(0..150);
        let right = random_side(&mut rng, right_rows, 30, "r");
        let join_type = join_types[round % join_types.len()];
        let null_safe = round % 3 == 0;
        let key = if null_safe {
            JoinKey::null_safe(0, 0)
        } else {
            JoinKey::new(0, 0)
        };
        let spec = JoinSpecification::new(join_type, vec![key]);
        let expected = oracle(&rows(&left), &rows(&right), join_type, null_safe);

        let configs = [
            JoinConfig::default(),
            forced_spill_config(scratch.path()),
            forced_spill_config(scratch.path())
                .with_num_partitions(3)
                .with_resident_bucket_rows(5)
                .with_max_recursion_depth(1),
        ];
        for config in configs {
            let output = engine(config.clone())
                .join(&spec, source(&left), source(&right))
                .unwrap();
            assert_eq!(
                combined(&output),
                expected,
                "round {round}, {join_type}, null_safe {null_safe}, {config:?}"
            );
        }
    }
    assert!(dir_is_empty(scratch.path()));
}

#[test]
fn test_split_mode_survives_spilling() {
    let scratch = tempfile::tempdir().unwrap();
    let left = keyed_source("k", "lv", &[(Some(1), "a"), (Some(2), "b"), (None, "n")]);
    let right = keyed_source("k", "rv", &[(Some(1), "x"), (Some(3), "y")]);
    let spec = JoinSpecification::full(vec![JoinKey::new(0, 0)])
        .with_output_mode(JoinOutputMode::Split);
    let split = engine(forced_spill_config(scratch.path()))
        .join(&spec, left, right)
        .unwrap()
        .into_split()
        .unwrap();
    assert_eq!(split.matches.len(), 1);
    assert_eq!(split.left_unmatched.len(), 2);
    assert_eq!(split.right_unmatched.len(), 1);
}

/// Cancels the join the first time progress is reported.
struct CancelOnProgress {
    token: CancellationToken,
    updates: usize,
}

impl ProgressSink for CancelOnProgress {
    fn set_progress(&mut self, _fraction: f64) {
        self.updates += 1;
        self.token.cancel();
    }
}

#[test]
fn test_cancellation_mid_run_leaves_nothing_behind() {
    let scratch = tempfile::tempdir().unwrap();
    let config = forced_spill_config(scratch.path()).with_cancel_check_rows(10);
    let pairs: Vec<(Option<i64>, String)> = (0..500).map(|i| (Some(i % 37), format!("v{i}"))).collect();
    let spec = JoinSpecification::inner(vec![JoinKey::new(0, 0)]);

    let token = CancellationToken::new();
    let mut sink = CancelOnProgress {
        token: token.clone(),
        updates: 0,
    };
    let mut engine = engine(config);
    let outcome = engine
        .run(&spec, source(&pairs), source(&pairs), &token, &mut sink)
        .unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.statistics().state, JoinState::Cancelled);
    assert!(outcome.statistics().buckets_spilled > 0);
    assert!(outcome.into_output().is_none());
    assert_eq!(sink.updates, 1);
    assert_eq!(engine.monitor().state(), JoinState::Cancelled);
    assert!(dir_is_empty(scratch.path()));
}

#[test]
fn test_cancelled_before_start() {
    let scratch = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let spec = JoinSpecification::inner(vec![JoinKey::new(0, 0)]);
    let mut engine = engine(forced_spill_config(scratch.path()));
    let outcome = engine
        .run(
            &spec,
            keyed_source("k", "v", &[(Some(1), "a")]),
            keyed_source("k", "v", &[(Some(1), "b")]),
            &token,
            &mut hhj_join::NoopProgress,
        )
        .unwrap();
    assert!(matches!(outcome, JoinOutcome::Cancelled { .. }));
    assert_eq!(outcome.statistics().build_rows, 0);
    assert!(dir_is_empty(scratch.path()));
}
