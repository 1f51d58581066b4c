use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use hhj::csv::{CsvOptions, open_csv};
use hhj::types::{RowSchema, RowSource};
use hhj::{
    CancellationToken, Error as HhjError, HybridHashJoin, JoinConfig, JoinKey, JoinOutcome,
    JoinOutput, JoinOutputMode, JoinSpecification, JoinStatistics, JoinType, NoopProgress,
    OutputOrder, OutputRow,
};

#[derive(Parser)]
#[command(
    name = "hhj",
    version,
    about = "Join two CSV files with a hybrid hash join"
)]
struct Cli {
    /// Left input file.
    #[arg(long, value_name = "CSV")]
    left: PathBuf,
    /// Right input file.
    #[arg(long, value_name = "CSV")]
    right: PathBuf,
    /// Join column of the left input, by name.
    #[arg(long, value_name = "COLUMN")]
    left_key: String,
    /// Join column of the right input, by name.
    #[arg(long, value_name = "COLUMN")]
    right_key: String,
    #[arg(long = "join", value_enum, default_value_t = CliJoinType::Inner)]
    join_type: CliJoinType,
    /// Print matches and unmatched rows as separate sections.
    #[arg(long)]
    split: bool,
    /// Sort output by row position instead of processing order.
    #[arg(long)]
    stable: bool,
    /// Treat NULL keys as equal to each other.
    #[arg(long)]
    null_equals_null: bool,
    #[arg(long, value_name = "N")]
    max_open_files: Option<usize>,
    /// Parent directory for the temporary spill directory.
    #[arg(long, value_name = "DIR")]
    spill_dir: Option<PathBuf>,
    /// Spill every bucket regardless of memory usage.
    #[arg(long)]
    force_spill: bool,
    /// Print join statistics to stderr.
    #[arg(long)]
    stats: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliJoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl From<CliJoinType> for JoinType {
    fn from(value: CliJoinType) -> Self {
        match value {
            CliJoinType::Inner => JoinType::Inner,
            CliJoinType::Left => JoinType::Left,
            CliJoinType::Right => JoinType::Right,
            CliJoinType::Full => JoinType::Full,
        }
    }
}

fn main() {
    // Initialize tracing subscriber to respect RUST_LOG environment variable
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("hhj: {err}");
        process::exit(1);
    }
}

fn key_column(schema: &RowSchema, name: &str, side: &str) -> Result<usize, HhjError> {
    schema.index_of(name).ok_or_else(|| {
        HhjError::configuration(format!("{side} input has no column named '{name}'"))
    })
}

fn run(cli: Cli) -> Result<(), HhjError> {
    let options = CsvOptions::default();
    let left = open_csv(&cli.left, &options)?;
    let right = open_csv(&cli.right, &options)?;
    let left_schema = left.schema().clone();
    let right_schema = right.schema().clone();

    let key = JoinKey::new(
        key_column(&left_schema, &cli.left_key, "left")?,
        key_column(&right_schema, &cli.right_key, "right")?,
    );
    let key = if cli.null_equals_null {
        JoinKey::null_safe(key.left_column, key.right_column)
    } else {
        key
    };

    let mut spec = JoinSpecification::new(cli.join_type.into(), vec![key]);
    if cli.split {
        spec = spec.with_output_mode(JoinOutputMode::Split);
    }
    if cli.stable {
        spec = spec.with_output_order(OutputOrder::Stable);
    }
    if let Some(n) = cli.max_open_files {
        spec = spec.with_max_open_files(n);
    }

    let mut config = JoinConfig::from_env();
    if cli.force_spill {
        config = config.with_assume_memory_low(true);
    }
    if let Some(dir) = cli.spill_dir {
        config = config.with_spill_dir(dir);
    }

    let mut engine = HybridHashJoin::new(config);
    let token = CancellationToken::new();
    let outcome = engine.run(&spec, left, right, &token, &mut NoopProgress)?;
    let statistics = outcome.statistics().clone();
    let JoinOutcome::Completed { output, .. } = outcome else {
        return Err(HhjError::Cancelled);
    };

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    write_output(&mut out, &output, &left_schema, &right_schema)?;
    out.flush()?;

    if cli.stats {
        print_statistics(&statistics);
    }
    Ok(())
}

fn header(schemas: &[&RowSchema]) -> String {
    schemas
        .iter()
        .flat_map(|schema| schema.columns().iter().map(|c| c.name.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

fn write_rows<'a>(
    out: &mut impl Write,
    rows: impl IntoIterator<Item = &'a OutputRow>,
) -> io::Result<()> {
    for row in rows {
        let line = row
            .values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        writeln!(out, "{line}")?;
    }
    Ok(())
}

fn write_output(
    out: &mut impl Write,
    output: &JoinOutput,
    left: &RowSchema,
    right: &RowSchema,
) -> io::Result<()> {
    match output {
        JoinOutput::Combined(rows) => {
            writeln!(out, "{}", header(&[left, right]))?;
            write_rows(out, rows)
        }
        JoinOutput::Split(split) => {
            writeln!(out, "# matches")?;
            writeln!(out, "{}", header(&[left, right]))?;
            write_rows(out, &split.matches)?;
            writeln!(out, "# left unmatched")?;
            writeln!(out, "{}", header(&[left]))?;
            write_rows(out, &split.left_unmatched)?;
            writeln!(out, "# right unmatched")?;
            writeln!(out, "{}", header(&[right]))?;
            write_rows(out, &split.right_unmatched)
        }
    }
}

fn print_statistics(stats: &JoinStatistics) {
    eprintln!("Join statistics:");
    eprintln!(
        "  Buckets {:>6} | spilled {:>6} | repartitioned {:>4} | fallbacks {:>4} | max depth {}",
        stats.num_buckets,
        stats.buckets_spilled,
        stats.repartitioned_buckets,
        stats.recursion_fallbacks,
        stats.max_depth_reached,
    );
    eprintln!(
        "  Build rows {:>10} | probe rows {:>10} ({} in memory, {} from disk)",
        stats.build_rows, stats.probe_rows, stats.probe_rows_in_memory, stats.probe_rows_from_disk,
    );
    eprintln!(
        "  Bucket rows: build mean {:.1} cv {:.2} | probe mean {:.1} cv {:.2}",
        stats.build_bucket_mean(),
        stats.build_bucket_cv(),
        stats.probe_bucket_mean(),
        stats.probe_bucket_cv(),
    );
    let io = &stats.spill_io;
    eprintln!(
        "  Spill files {:>5} | written {} B | read {} B | writer evictions {} | reopens {}",
        io.files_created, io.bytes_written, io.bytes_read, io.writer_evictions, io.writer_reopens,
    );
    eprintln!("  Rows emitted {}", stats.rows_emitted);
}
