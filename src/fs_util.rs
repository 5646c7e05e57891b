use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::Utf8Path;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::PipelineError;

pub fn ensure_dir(path: &Utf8Path) -> Result<(), PipelineError> {
    fs::create_dir_all(path.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("create {path}: {err}")))
}

/// Whole-file replace via tmp sibling + rename.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn atomic_rename(from: &Utf8Path, to: &Utf8Path) -> Result<(), PipelineError> {
    if let Some(parent) = to.parent() {
        ensure_dir(parent)?;
    }
    if to.as_std_path().exists() {
        remove_path(to)?;
    }
    fs::rename(from.as_std_path(), to.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("rename {from} -> {to}: {err}")))
}

pub fn remove_path(path: &Utf8Path) -> Result<(), PipelineError> {
    let std_path = path.as_std_path();
    if !std_path.exists() {
        return Ok(());
    }
    let result = if std_path.is_dir() {
        fs::remove_dir_all(std_path)
    } else {
        fs::remove_file(std_path)
    };
    result.map_err(|err| PipelineError::Filesystem(format!("remove {path}: {err}")))
}

pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

/// Total size in bytes of all files below `root`. Missing root counts as zero.
pub fn dir_size(root: &Utf8Path) -> Result<u64, PipelineError> {
    if !root.as_std_path().exists() {
        return Ok(0);
    }
    let mut total = 0u64;
    for path in walk_dir(root.as_std_path())? {
        if path.is_file() {
            let meta =
                fs::metadata(&path).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            total += meta.len();
        }
    }
    Ok(total)
}

/// Archive every file under `dir` into a zip at `archive_path`, with entry
/// names relative to `dir`.
pub fn compress_dir_to_zip(dir: &Utf8Path, archive_path: &Utf8Path) -> Result<(), PipelineError> {
    if let Some(parent) = archive_path.parent() {
        ensure_dir(parent)?;
    }
    let file = fs::File::create(archive_path.as_std_path())
        .map_err(|err| PipelineError::Archive(format!("create {archive_path}: {err}")))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for path in walk_dir(dir.as_std_path())? {
        if !path.is_file() {
            continue;
        }
        let relative = path
            .strip_prefix(dir.as_std_path())
            .map_err(|err| PipelineError::Archive(err.to_string()))?;
        let name = relative.to_string_lossy().replace('\\', "/");
        writer
            .start_file(name, options)
            .map_err(|err| PipelineError::Archive(err.to_string()))?;
        let mut input =
            fs::File::open(&path).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        io::copy(&mut input, &mut writer)
            .map_err(|err| PipelineError::Archive(err.to_string()))?;
    }
    writer
        .finish()
        .map_err(|err| PipelineError::Archive(err.to_string()))?;
    Ok(())
}
