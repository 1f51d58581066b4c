use std::sync::Once;

use hhj_types::{ColumnDef, Row, RowSchema, Value, ValueType, VecRowSource};

static INIT: Once = Once::new();

/// Initialize tracing for test binaries. Safe to call multiple times.
pub fn init_tracing_for_tests() {
    INIT.call_once(|| {
        use tracing_subscriber::filter::EnvFilter;
        use tracing_subscriber::fmt;
        let env = std::env::var("RUST_LOG").ok();
        let filter = match env {
            Some(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            None => EnvFilter::new("info"),
        };
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_test_writer()
            .init();
    });
}

#[cfg(feature = "auto-init")]
mod auto {
    // Use ctor to run at binary init time to avoid having to call init in every test.
    use ctor::ctor;

    #[ctor]
    fn init() {
        super::init_tracing_for_tests();
    }
}

/// Two-column schema: an `Int64` key and a `Utf8` payload, both nullable.
pub fn keyed_schema(key: &str, payload: &str) -> RowSchema {
    RowSchema::new(vec![
        ColumnDef::new(key, ValueType::Int64, true),
        ColumnDef::new(payload, ValueType::Utf8, true),
    ])
}

/// Rows `(key, payload)` numbered `0..n` in order; `None` keys become nulls.
pub fn keyed_rows(pairs: &[(Option<i64>, &str)]) -> Vec<Row> {
    pairs
        .iter()
        .enumerate()
        .map(|(idx, (key, payload))| {
            Row::new(idx as u64, vec![Value::from(*key), Value::from(*payload)])
        })
        .collect()
}

/// In-memory source over [`keyed_rows`] with [`keyed_schema`].
pub fn keyed_source(key: &str, payload: &str, pairs: &[(Option<i64>, &str)]) -> VecRowSource {
    VecRowSource::new(keyed_schema(key, payload), keyed_rows(pairs))
}
