//! CSV input for the join, via the Arrow CSV reader.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use arrow::csv::reader::{Format, Reader, ReaderBuilder};
use hhj_result::{Error, Result};
use hhj_types::RecordBatchRowSource;

/// Row source streaming a CSV file batch by batch.
pub type CsvRowSource = RecordBatchRowSource<Reader<File>>;

#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub has_header: bool,
    pub delimiter: u8,
    pub batch_size: Option<usize>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            has_header: true,
            delimiter: b',',
            batch_size: None,
        }
    }
}

impl CsvOptions {
    fn to_format(&self) -> Format {
        let mut format = Format::default().with_header(self.has_header);
        if self.delimiter != b',' {
            format = format.with_delimiter(self.delimiter);
        }
        format
    }
}

/// Open `path` as a row source.
///
/// The schema is inferred from the whole file, which also yields an exact
/// row count for build-side selection and progress reporting.
pub fn open_csv(path: &Path, options: &CsvOptions) -> Result<CsvRowSource> {
    let mut file = File::open(path).map_err(|e| {
        Error::configuration(format!("cannot open {}: {e}", path.display()))
    })?;
    let format = options.to_format();
    let (schema, records) = format.infer_schema(&mut file, None)?;
    file.seek(SeekFrom::Start(0))?;

    let schema = Arc::new(schema);
    let mut builder = ReaderBuilder::new(Arc::clone(&schema)).with_format(format);
    if let Some(batch_size) = options.batch_size {
        builder = builder.with_batch_size(batch_size);
    }
    let reader = builder.build(file)?;

    tracing::debug!(path = %path.display(), rows = records, columns = schema.fields().len(), "opened csv input");
    Ok(RecordBatchRowSource::new(schema, reader)?.with_estimated_rows(records as u64))
}
