use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use crate::datafile::{DEFAULT_CHUNK_SIZE, DataFile};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::fs_util;

const SHARD_PREFIX: &str = "chunk_";

/// Accepts an unbounded stream of frames, spilling each to a numbered shard
/// in a working directory and unioning their schemas, then merges the shards
/// atomically into one output file.
pub struct ChunkedWriter {
    output: DataFile,
    work_dir: Utf8PathBuf,
    columns: Vec<String>,
    next_index: usize,
}

impl ChunkedWriter {
    pub fn new(output: DataFile, work_dir: impl Into<Utf8PathBuf>) -> Result<Self, PipelineError> {
        if output.format().extension().is_none() {
            return Err(PipelineError::UnsupportedFormat {
                format: output.format().to_string(),
                operation: "chunked write".to_string(),
            });
        }
        Ok(Self {
            output,
            work_dir: work_dir.into(),
            columns: Vec::new(),
            next_index: 0,
        })
    }

    pub fn output(&self) -> &DataFile {
        &self.output
    }

    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn shard_count(&self) -> usize {
        self.next_index
    }

    fn shard_extension(&self) -> &'static str {
        self.output.format().extension().unwrap_or("csv")
    }

    fn shard_path(&self, index: usize) -> Utf8PathBuf {
        self.work_dir
            .join(format!("{SHARD_PREFIX}{index}.{}", self.shard_extension()))
    }

    fn union_columns(&mut self, columns: &[String]) {
        for name in columns {
            if !self.columns.contains(name) {
                self.columns.push(name.clone());
            }
        }
    }

    /// Adopt shards already present in the working directory, so an
    /// interrupted run can resume where it stopped. Shard indices continue
    /// after the highest one found.
    pub fn populate_from_folder(&mut self) -> Result<(), PipelineError> {
        if !self.work_dir.as_std_path().exists() {
            return Ok(());
        }
        let mut indices = Vec::new();
        let entries = std::fs::read_dir(self.work_dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|_| PipelineError::Filesystem("non-utf8 shard path".into()))?;
            let Some(stem) = path.file_stem() else {
                continue;
            };
            let Some(index) = stem
                .strip_prefix(SHARD_PREFIX)
                .and_then(|tail| tail.parse::<usize>().ok())
            else {
                continue;
            };
            indices.push(index);
        }
        indices.sort_unstable();
        for index in &indices {
            let shard = DataFile::new(self.shard_path(*index));
            self.union_columns(&shard.columns()?);
        }
        self.next_index = indices.last().map(|last| last + 1).unwrap_or(0);
        debug!(
            shards = self.next_index,
            dir = %self.work_dir,
            "adopted existing shards"
        );
        Ok(())
    }

    /// Spill one frame to the next numbered shard.
    pub fn write(&mut self, frame: &Frame) -> Result<Utf8PathBuf, PipelineError> {
        fs_util::ensure_dir(&self.work_dir)?;
        let path = self.shard_path(self.next_index);
        DataFile::new(path.clone()).write(frame)?;
        self.union_columns(frame.columns());
        self.next_index += 1;
        Ok(path)
    }

    /// Merge all shards into the output file. Zero shards produce no output;
    /// one shard is renamed (or cross-format-moved) byte-for-byte; several
    /// shards are streamed in shard order onto the unioned schema, written to
    /// a sibling temp file and renamed into place.
    pub fn combine(mut self, remove_parts: bool) -> Result<Option<DataFile>, PipelineError> {
        if self.next_index == 0 {
            warn!(output = %self.output.path(), "no data written; skipping combine");
            return Ok(None);
        }

        if self.next_index == 1 {
            let shard = DataFile::new(self.shard_path(0));
            let merged = shard.move_to(self.output.path())?;
            if remove_parts {
                fs_util::remove_path(&self.work_dir)?;
            }
            return Ok(Some(merged));
        }

        let staging = self
            .work_dir
            .join(format!("merged.{}", self.shard_extension()));
        let staged = DataFile::new(staging.clone());

        let columns = std::mem::take(&mut self.columns);
        let shard_paths: Vec<Utf8PathBuf> =
            (0..self.next_index).map(|i| self.shard_path(i)).collect();
        let header = Frame::new(columns);
        let chunks = std::iter::once(Ok(header)).chain(
            shard_paths
                .iter()
                .map(|path| DataFile::new(path.clone()).read_chunks(DEFAULT_CHUNK_SIZE))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .flatten(),
        );
        staged.sink(chunks)?;
        fs_util::atomic_rename(&staging, self.output.path())?;

        if remove_parts {
            fs_util::remove_path(&self.work_dir)?;
        }
        Ok(Some(DataFile::new(self.output.path().to_path_buf())))
    }
}

/// Buffers loose records and spills them as a shard whenever the row
/// threshold is crossed. `combine` flushes the residual buffer first.
pub struct RecordWriter {
    inner: ChunkedWriter,
    buffer: Vec<Vec<(String, String)>>,
    threshold: usize,
}

impl RecordWriter {
    pub fn new(
        output: DataFile,
        work_dir: impl Into<Utf8PathBuf>,
        threshold: usize,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            inner: ChunkedWriter::new(output, work_dir)?,
            buffer: Vec::new(),
            threshold: threshold.max(1),
        })
    }

    pub fn populate_from_folder(&mut self) -> Result<(), PipelineError> {
        self.inner.populate_from_folder()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn has_rows(&self) -> bool {
        !self.buffer.is_empty() || self.inner.shard_count() > 0
    }

    pub fn write_record(&mut self, record: Vec<(String, String)>) -> Result<(), PipelineError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Append one frame's rows as records.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        for row in frame.iter_rows() {
            let record = frame
                .columns()
                .iter()
                .zip(&row)
                .filter_map(|(name, cell)| cell.map(|value| (name.clone(), value.to_string())))
                .collect();
            self.write_record(record)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), PipelineError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let records: Vec<&[(String, String)]> =
            self.buffer.iter().map(|record| record.as_slice()).collect();
        let frame = Frame::from_records(records.into_iter());
        self.inner.write(&frame)?;
        self.buffer.clear();
        Ok(())
    }

    pub fn combine(mut self, remove_parts: bool) -> Result<Option<DataFile>, PipelineError> {
        self.flush()?;
        self.inner.combine(remove_parts)
    }
}
