use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use camino::{Utf8Path, Utf8PathBuf};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};

use crate::domain::{Event, FileFormat};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::fs_util;

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Column name carrying the per-file key when a stacked directory is read
/// back as one frame.
pub const STACKED_KEY_COLUMN: &str = "event";

/// Bounded property map for tabular files.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TableProperties {
    #[serde(deserialize_with = "deserialize_separator")]
    pub separator: Option<u8>,
    pub encoding: Option<String>,
    pub header: bool,
}

/// Config files spell the separator as a one-character string.
fn deserialize_separator<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(text) => match text.as_bytes() {
            [byte] => Ok(Some(*byte)),
            _ => Err(serde::de::Error::custom(format!(
                "separator must be a single character, got '{text}'"
            ))),
        },
    }
}

impl Default for TableProperties {
    fn default() -> Self {
        Self {
            separator: None,
            encoding: None,
            header: true,
        }
    }
}

/// Handle to one tabular file on disk. The format is inferred from the path
/// suffix at construction and decides which operations are available;
/// callers never select it explicitly.
#[derive(Debug, Clone)]
pub struct DataFile {
    path: Utf8PathBuf,
    format: FileFormat,
    properties: TableProperties,
}

impl DataFile {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        let format = FileFormat::from_path(&path);
        Self {
            path,
            format,
            properties: TableProperties::default(),
        }
    }

    pub fn with_properties(path: impl Into<Utf8PathBuf>, properties: TableProperties) -> Self {
        let mut file = Self::new(path);
        file.properties = properties;
        file
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    pub fn file_name(&self) -> &str {
        self.path.file_name().unwrap_or_default()
    }

    pub fn exists(&self) -> bool {
        self.path.as_std_path().exists()
    }

    pub fn delete(&self) -> Result<(), PipelineError> {
        fs_util::remove_path(&self.path)
    }

    /// Rename within the same format. Cross-format conversion must go
    /// through [`DataFile::move_to`].
    pub fn rename(&self, to: &Utf8Path) -> Result<DataFile, PipelineError> {
        let target_format = FileFormat::from_path(to);
        if target_format != self.format {
            return Err(PipelineError::UnsupportedFormat {
                format: self.format.to_string(),
                operation: format!("rename to {target_format}"),
            });
        }
        fs_util::atomic_rename(&self.path, to)?;
        Ok(DataFile::with_properties(
            to.to_path_buf(),
            self.properties.clone(),
        ))
    }

    /// Move to `to`. Same format is a rename; a different format streams the
    /// contents through bounded chunks and deletes the source on success.
    pub fn move_to(&self, to: &Utf8Path) -> Result<DataFile, PipelineError> {
        let target_format = FileFormat::from_path(to);
        if target_format == self.format {
            return self.rename(to);
        }
        let dest = DataFile::new(to.to_path_buf());
        dest.sink(self.read_chunks(DEFAULT_CHUNK_SIZE)?)?;
        self.delete()?;
        Ok(dest)
    }

    pub fn backup_path(&self) -> Utf8PathBuf {
        let stem = self.path.file_stem().unwrap_or_default();
        let name = match self.path.extension() {
            Some(ext) => format!("{stem}_backup.{ext}"),
            None => format!("{stem}_backup"),
        };
        match self.path.parent() {
            Some(parent) => parent.join(name),
            None => Utf8PathBuf::from(name),
        }
    }

    pub fn backup_exists(&self) -> bool {
        self.backup_path().as_std_path().exists()
    }

    /// Rename this file aside as `<stem>_backup.<ext>`. At most one backup
    /// may exist; pass `overwrite` to replace a stale one.
    pub fn backup(&self, overwrite: bool) -> Result<(), PipelineError> {
        let backup = self.backup_path();
        if backup.as_std_path().exists() && !overwrite {
            return Err(PipelineError::Filesystem(format!(
                "backup already exists: {backup}"
            )));
        }
        fs_util::atomic_rename(&self.path, &backup)
    }

    /// Drop whatever currently sits at the path and bring the backup back.
    pub fn restore_backup(&self) -> Result<(), PipelineError> {
        let backup = self.backup_path();
        if !backup.as_std_path().exists() {
            return Err(PipelineError::FileNotFound(backup.to_string()));
        }
        fs_util::remove_path(&self.path)?;
        fs_util::atomic_rename(&backup, &self.path)
    }

    pub fn delete_backup(&self) -> Result<(), PipelineError> {
        fs_util::remove_path(&self.backup_path())
    }

    fn delimiter(&self) -> u8 {
        self.properties
            .separator
            .or(self.format.delimiter())
            .unwrap_or(b',')
    }

    fn require_exists(&self) -> Result<(), PipelineError> {
        if !self.exists() {
            return Err(PipelineError::FileNotFound(self.path.to_string()));
        }
        Ok(())
    }

    fn unsupported(&self, operation: &str) -> PipelineError {
        PipelineError::UnsupportedFormat {
            format: self.format.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Whole-file read. Stacked directories come back as the concatenation
    /// of their children with a per-file key column.
    pub fn read(&self) -> Result<Frame, PipelineError> {
        self.require_exists()?;
        match self.format {
            FileFormat::Csv | FileFormat::Tsv => self.read_delimited(),
            FileFormat::Parquet => self.read_parquet(),
            FileFormat::Stacked => self.read_stacked(),
            FileFormat::Unknown => Err(self.unsupported("read")),
        }
    }

    /// Pull-based cursor over the file in bounded chunks.
    pub fn read_chunks(&self, chunk_size: usize) -> Result<ChunkCursor, PipelineError> {
        self.require_exists()?;
        let chunk_size = chunk_size.max(1);
        match self.format {
            FileFormat::Csv | FileFormat::Tsv => {
                let mut reader = csv::ReaderBuilder::new()
                    .delimiter(self.delimiter())
                    .has_headers(self.properties.header)
                    .flexible(true)
                    .from_path(self.path.as_std_path())
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                let columns = if self.properties.header {
                    reader
                        .headers()
                        .map_err(|err| PipelineError::Filesystem(err.to_string()))?
                        .iter()
                        .map(str::to_string)
                        .collect()
                } else {
                    Vec::new()
                };
                Ok(ChunkCursor {
                    inner: CursorInner::Delimited { reader, columns },
                    chunk_size,
                    done: false,
                })
            }
            FileFormat::Parquet => {
                let file = fs::File::open(self.path.as_std_path())
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                let reader = ParquetRecordBatchReaderBuilder::try_new(file)
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?
                    .with_batch_size(chunk_size)
                    .build()
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                Ok(ChunkCursor {
                    inner: CursorInner::Parquet(reader),
                    chunk_size,
                    done: false,
                })
            }
            _ => Err(self.unsupported("read_chunks")),
        }
    }

    fn read_delimited(&self) -> Result<Frame, PipelineError> {
        let mut frame = Frame::default();
        for chunk in self.read_chunks(DEFAULT_CHUNK_SIZE)? {
            let chunk = chunk?;
            if frame.columns().is_empty() {
                frame = chunk;
            } else {
                frame.vstack(&chunk);
            }
        }
        if frame.columns().is_empty() {
            // Header-only file still carries its schema.
            frame = Frame::new(self.columns()?);
        }
        Ok(frame)
    }

    fn read_parquet(&self) -> Result<Frame, PipelineError> {
        let mut frame = Frame::default();
        for chunk in self.read_chunks(DEFAULT_CHUNK_SIZE)? {
            let chunk = chunk?;
            if frame.columns().is_empty() {
                frame = chunk;
            } else {
                frame.vstack(&chunk);
            }
        }
        Ok(frame)
    }

    fn read_stacked(&self) -> Result<Frame, PipelineError> {
        let mut frame = Frame::default();
        for child in self.stacked_children()? {
            let stem = child.path.file_stem().unwrap_or_default().to_string();
            let mut part = child.read()?;
            let key = stem.replace('_', " ");
            part.set_column(
                STACKED_KEY_COLUMN,
                vec![Some(key); part.n_rows()],
            );
            if frame.columns().is_empty() {
                frame = part;
            } else {
                frame.vstack(&part);
            }
        }
        Ok(frame)
    }

    /// Child files of a stacked directory, name-sorted.
    pub fn stacked_children(&self) -> Result<Vec<DataFile>, PipelineError> {
        if self.format != FileFormat::Stacked {
            return Err(self.unsupported("stacked_children"));
        }
        self.require_exists()?;
        let entries = fs::read_dir(self.path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|_| PipelineError::Filesystem("non-utf8 path in stacked dir".into()))?;
            if path.is_file() && FileFormat::from_path(&path).is_tabular() {
                children.push(DataFile::with_properties(path, self.properties.clone()));
            }
        }
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    /// Whole-frame write, replacing any existing file.
    pub fn write(&self, frame: &Frame) -> Result<(), PipelineError> {
        match self.format {
            FileFormat::Csv | FileFormat::Tsv => self.write_delimited(frame),
            FileFormat::Parquet => {
                let file = self.create_output()?;
                let schema = utf8_schema(frame.columns());
                let mut writer = ArrowWriter::try_new(file, schema.clone(), None)
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                if !frame.is_empty() {
                    let batch = frame_to_batch(frame, &schema)?;
                    writer
                        .write(&batch)
                        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                }
                writer
                    .close()
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                Ok(())
            }
            _ => Err(self.unsupported("write")),
        }
    }

    fn write_delimited(&self, frame: &Frame) -> Result<(), PipelineError> {
        let file = self.create_output()?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter())
            .from_writer(file);
        if self.properties.header {
            writer
                .write_record(frame.columns())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        for row in frame.iter_rows() {
            writer
                .write_record(row.iter().map(|cell| cell.unwrap_or("")))
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        writer
            .flush()
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn create_output(&self) -> Result<fs::File, PipelineError> {
        if let Some(parent) = self.path.parent() {
            fs_util::ensure_dir(parent)?;
        }
        fs::File::create(self.path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("create {}: {err}", self.path)))
    }

    /// Streaming write: drains `chunks` into the file without holding more
    /// than one chunk in memory. The first chunk fixes the schema; later
    /// chunks are aligned onto it. Returns the number of rows written.
    pub fn sink<I>(&self, chunks: I) -> Result<usize, PipelineError>
    where
        I: IntoIterator<Item = Result<Frame, PipelineError>>,
    {
        match self.format {
            FileFormat::Csv | FileFormat::Tsv => {
                let file = self.create_output()?;
                let mut writer = csv::WriterBuilder::new()
                    .delimiter(self.delimiter())
                    .from_writer(file);
                let mut columns: Vec<String> = Vec::new();
                let mut started = false;
                let mut rows = 0usize;
                for chunk in chunks {
                    let chunk = chunk?;
                    if !started {
                        columns = chunk.columns().to_vec();
                        if self.properties.header {
                            writer
                                .write_record(&columns)
                                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                        }
                        started = true;
                    }
                    let aligned = chunk.reindex(&columns);
                    for row in aligned.iter_rows() {
                        writer
                            .write_record(row.iter().map(|cell| cell.unwrap_or("")))
                            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                        rows += 1;
                    }
                }
                writer
                    .flush()
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                Ok(rows)
            }
            FileFormat::Parquet => {
                let mut writer: Option<(ArrowWriter<fs::File>, Arc<Schema>, Vec<String>)> = None;
                let mut rows = 0usize;
                for chunk in chunks {
                    let chunk = chunk?;
                    if writer.is_none() {
                        let schema = utf8_schema(chunk.columns());
                        let file = self.create_output()?;
                        let inner = ArrowWriter::try_new(file, schema.clone(), None)
                            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                        writer = Some((inner, schema, chunk.columns().to_vec()));
                    }
                    let Some((inner, schema, columns)) = writer.as_mut() else {
                        continue;
                    };
                    let aligned = chunk.reindex(columns);
                    rows += aligned.n_rows();
                    let batch = frame_to_batch(&aligned, schema)?;
                    inner
                        .write(&batch)
                        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                }
                match writer {
                    Some((inner, _, _)) => {
                        inner
                            .close()
                            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                    }
                    None => {
                        // No chunks: still materialize an empty file.
                        self.write(&Frame::default())?;
                    }
                }
                Ok(rows)
            }
            _ => Err(self.unsupported("sink")),
        }
    }

    /// Write a per-event group map as a stacked directory, one child file per
    /// group, named after the event.
    pub fn write_stacked(&self, groups: &BTreeMap<Event, Frame>) -> Result<(), PipelineError> {
        if self.format != FileFormat::Stacked {
            return Err(self.unsupported("write_stacked"));
        }
        fs_util::ensure_dir(&self.path)?;
        for (event, frame) in groups {
            let child = self.path.join(format!("{}.csv", event.file_stem()));
            DataFile::new(child).write(frame)?;
        }
        Ok(())
    }

    pub fn columns(&self) -> Result<Vec<String>, PipelineError> {
        self.require_exists()?;
        match self.format {
            FileFormat::Csv | FileFormat::Tsv => {
                let mut reader = csv::ReaderBuilder::new()
                    .delimiter(self.delimiter())
                    .has_headers(self.properties.header)
                    .from_path(self.path.as_std_path())
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                if !self.properties.header {
                    return Ok(Vec::new());
                }
                Ok(reader
                    .headers()
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?
                    .iter()
                    .map(str::to_string)
                    .collect())
            }
            FileFormat::Parquet => {
                let file = fs::File::open(self.path.as_std_path())
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                let builder = ParquetRecordBatchReaderBuilder::try_new(file)
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                Ok(builder
                    .schema()
                    .fields()
                    .iter()
                    .map(|field| field.name().clone())
                    .collect())
            }
            FileFormat::Stacked => {
                let mut columns = Vec::new();
                for child in self.stacked_children()? {
                    for name in child.columns()? {
                        if !columns.contains(&name) {
                            columns.push(name);
                        }
                    }
                }
                Ok(columns)
            }
            FileFormat::Unknown => Err(self.unsupported("columns")),
        }
    }

    /// Column schema. Every column the pipeline writes is string-typed.
    pub fn schema(&self) -> Result<Vec<(String, &'static str)>, PipelineError> {
        Ok(self
            .columns()?
            .into_iter()
            .map(|name| (name, "str"))
            .collect())
    }
}

pub struct ChunkCursor {
    inner: CursorInner,
    chunk_size: usize,
    done: bool,
}

enum CursorInner {
    Delimited {
        reader: csv::Reader<fs::File>,
        columns: Vec<String>,
    },
    Parquet(ParquetRecordBatchReader),
}

impl Iterator for ChunkCursor {
    type Item = Result<Frame, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match &mut self.inner {
            CursorInner::Delimited { reader, columns } => {
                let mut record = csv::StringRecord::new();
                let mut frame: Option<Frame> = None;
                for _ in 0..self.chunk_size {
                    match reader.read_record(&mut record) {
                        Ok(true) => {
                            if columns.is_empty() {
                                *columns =
                                    (0..record.len()).map(|i| format!("column_{i}")).collect();
                            }
                            let frame = frame
                                .get_or_insert_with(|| Frame::new(columns.clone()));
                            let mut row: Vec<Option<String>> = record
                                .iter()
                                .map(|cell| {
                                    if cell.is_empty() {
                                        None
                                    } else {
                                        Some(cell.to_string())
                                    }
                                })
                                .collect();
                            row.resize(columns.len(), None);
                            row.truncate(columns.len());
                            if let Err(err) = frame.push_row(row) {
                                self.done = true;
                                return Some(Err(err));
                            }
                        }
                        Ok(false) => {
                            self.done = true;
                            break;
                        }
                        Err(err) => {
                            self.done = true;
                            return Some(Err(PipelineError::Filesystem(err.to_string())));
                        }
                    }
                }
                frame.map(Ok)
            }
            CursorInner::Parquet(reader) => match reader.next() {
                Some(Ok(batch)) => Some(batch_to_frame(&batch)),
                Some(Err(err)) => {
                    self.done = true;
                    Some(Err(PipelineError::Filesystem(err.to_string())))
                }
                None => {
                    self.done = true;
                    None
                }
            },
        }
    }
}

fn utf8_schema(columns: &[String]) -> Arc<Schema> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect();
    Arc::new(Schema::new(fields))
}

fn frame_to_batch(frame: &Frame, schema: &Arc<Schema>) -> Result<RecordBatch, PipelineError> {
    let arrays: Vec<ArrayRef> = frame
        .columns()
        .iter()
        .map(|name| {
            let values: Vec<Option<&str>> = frame.column_values(name);
            Arc::new(StringArray::from(values)) as ArrayRef
        })
        .collect();
    RecordBatch::try_new(schema.clone(), arrays)
        .map_err(|err| PipelineError::IncompatibleUnion(err.to_string()))
}

fn batch_to_frame(batch: &RecordBatch) -> Result<Frame, PipelineError> {
    let columns: Vec<String> = batch
        .schema()
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect();
    let mut frame = Frame::new(columns.clone());
    let arrays: Vec<&StringArray> = batch
        .columns()
        .iter()
        .map(|array| {
            array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| PipelineError::UnsupportedFormat {
                    format: "parquet".to_string(),
                    operation: "non-utf8 column".to_string(),
                })
        })
        .collect::<Result<_, _>>()?;
    for row in 0..batch.num_rows() {
        let cells = arrays
            .iter()
            .map(|array| {
                if array.is_null(row) {
                    None
                } else {
                    let value = array.value(row);
                    if value.is_empty() {
                        None
                    } else {
                        Some(value.to_string())
                    }
                }
            })
            .collect();
        frame.push_row(cells)?;
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    fn sample_frame() -> Frame {
        let mut frame = Frame::new(vec!["a", "b"]);
        frame
            .push_row(vec![Some("1".to_string()), Some("2".to_string())])
            .unwrap();
        frame.push_row(vec![Some("3".to_string()), None]).unwrap();
        frame
    }

    #[test]
    fn csv_roundtrip_null_normalized() {
        let (_temp, root) = temp_root();
        let file = DataFile::new(root.join("out.csv"));
        file.write(&sample_frame()).unwrap();
        let back = file.read().unwrap();
        assert_eq!(back, sample_frame());
    }

    #[test]
    fn tsv_uses_tab_delimiter() {
        let (_temp, root) = temp_root();
        let file = DataFile::new(root.join("out.tsv"));
        file.write(&sample_frame()).unwrap();
        let raw = fs::read_to_string(file.path().as_std_path()).unwrap();
        assert!(raw.starts_with("a\tb\n"));
        assert_eq!(file.read().unwrap(), sample_frame());
    }

    #[test]
    fn parquet_roundtrip() {
        let (_temp, root) = temp_root();
        let file = DataFile::new(root.join("out.parquet"));
        file.write(&sample_frame()).unwrap();
        assert_eq!(file.read().unwrap(), sample_frame());
        assert_eq!(file.columns().unwrap(), vec!["a", "b"]);
        assert_eq!(
            file.schema().unwrap(),
            vec![("a".to_string(), "str"), ("b".to_string(), "str")]
        );
    }

    #[test]
    fn chunked_read_splits_rows() {
        let (_temp, root) = temp_root();
        let file = DataFile::new(root.join("out.csv"));
        file.write(&sample_frame()).unwrap();

        let chunks: Vec<Frame> = file
            .read_chunks(1)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].n_rows(), 1);
        assert_eq!(chunks[1].get(0, "a"), Some("3"));
    }

    #[test]
    fn read_missing_reports_not_found() {
        let (_temp, root) = temp_root();
        let file = DataFile::new(root.join("absent.csv"));
        assert_matches!(file.read(), Err(PipelineError::FileNotFound(_)));
    }

    #[test]
    fn backup_restore_is_byte_exact() {
        let (_temp, root) = temp_root();
        let path = root.join("data.csv");
        fs::write(path.as_std_path(), "a,b\n1,2\n").unwrap();
        let file = DataFile::new(path.clone());

        file.backup(false).unwrap();
        assert!(!file.exists());
        assert!(file.backup_exists());
        assert_matches!(
            DataFile::new(path.clone()).backup(false),
            Err(PipelineError::Filesystem(_))
        );

        fs::write(path.as_std_path(), "garbage").unwrap();
        file.restore_backup().unwrap();
        assert!(!file.backup_exists());
        assert_eq!(fs::read_to_string(path.as_std_path()).unwrap(), "a,b\n1,2\n");
    }

    #[test]
    fn cross_format_move_deletes_source() {
        let (_temp, root) = temp_root();
        let csv_file = DataFile::new(root.join("data.csv"));
        csv_file.write(&sample_frame()).unwrap();

        let moved = csv_file.move_to(&root.join("data.parquet")).unwrap();
        assert_eq!(moved.format(), FileFormat::Parquet);
        assert!(!csv_file.exists());
        assert_eq!(moved.read().unwrap(), sample_frame());
    }

    #[test]
    fn stacked_write_and_read_groups() {
        let (_temp, root) = temp_root();
        let stacked = DataFile::new(root.join("aus-ala"));
        let mut groups = BTreeMap::new();
        let mut collection = Frame::new(vec!["scientific_name"]);
        collection
            .push_row(vec![Some("Apis mellifera".to_string())])
            .unwrap();
        groups.insert(Event::Collection, collection);
        let mut prep = Frame::new(vec!["preparation_type"]);
        prep.push_row(vec![Some("pinned".to_string())]).unwrap();
        groups.insert(Event::SamplePrep, prep);

        stacked.write_stacked(&groups).unwrap();
        assert!(root.join("aus-ala/collection.csv").as_std_path().exists());
        assert!(root.join("aus-ala/sample_prep.csv").as_std_path().exists());

        let back = stacked.read().unwrap();
        assert!(back.has_column(STACKED_KEY_COLUMN));
        assert_eq!(back.n_rows(), 2);
        let keys: Vec<Option<&str>> = back.column_values(STACKED_KEY_COLUMN);
        assert!(keys.contains(&Some("collection")));
        assert!(keys.contains(&Some("sample prep")));
    }

    #[test]
    fn unknown_format_rejects_tabular_ops() {
        let (_temp, root) = temp_root();
        let path = root.join("blob.xlsx");
        fs::write(path.as_std_path(), b"x").unwrap();
        let file = DataFile::new(path);
        assert_matches!(
            file.read(),
            Err(PipelineError::UnsupportedFormat { .. })
        );
    }
}
