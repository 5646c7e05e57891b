use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde_json::Map;
use tracing::{info, warn};

use crate::domain::SourceId;
use crate::error::PipelineError;
use crate::fs_util;
use crate::metadata::StageRunner;

/// Files bundled into one dated archive.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub files: Vec<Utf8PathBuf>,
}

/// Owns `data/compiled/` and one task per manifest: stage the declared
/// files into a temp subfolder, zip it, put everything back.
pub struct CompileManager {
    stage_dir: Utf8PathBuf,
    manifests: Vec<Manifest>,
}

impl CompileManager {
    pub fn new(stage_dir: Utf8PathBuf) -> Self {
        Self {
            stage_dir,
            manifests: Vec::new(),
        }
    }

    pub fn stage_dir(&self) -> &Utf8Path {
        &self.stage_dir
    }

    pub fn manifests(&self) -> &[Manifest] {
        &self.manifests
    }

    fn archive_path(&self, manifest: &Manifest) -> Utf8PathBuf {
        let date = Utc::now().format("%Y-%m-%d");
        self.stage_dir.join(format!("{}_{date}.zip", manifest.name))
    }

    pub fn outputs(&self) -> Vec<Utf8PathBuf> {
        self.manifests
            .iter()
            .map(|manifest| self.archive_path(manifest))
            .collect()
    }

    /// One manifest covering the conversion stage's outputs, named after
    /// the source.
    pub fn prepare(
        &mut self,
        id: &SourceId,
        inputs: &[Utf8PathBuf],
    ) -> Result<(), PipelineError> {
        self.manifests.clear();
        if inputs.is_empty() {
            return Err(PipelineError::StageOrder {
                stage: "compile".to_string(),
                missing: "conversion".to_string(),
            });
        }
        fs_util::ensure_dir(&self.stage_dir)?;
        self.manifests.push(Manifest {
            name: id.to_string(),
            files: inputs.to_vec(),
        });
        Ok(())
    }

    pub fn run(
        &self,
        runner: &mut StageRunner<'_>,
        overwrite: bool,
    ) -> Result<(), PipelineError> {
        for manifest in &self.manifests {
            let archive = self.archive_path(manifest);
            runner.run_task(Some(archive.to_string()), || {
                if archive.as_std_path().exists() && !overwrite {
                    let mut custom = Map::new();
                    custom.insert("skipped".to_string(), true.into());
                    return (true, custom);
                }
                match self.compile_one(manifest, &archive) {
                    Ok(bytes) => {
                        info!(archive = %archive, bytes, "compiled");
                        let mut custom = Map::new();
                        custom.insert("bytes".to_string(), bytes.into());
                        (true, custom)
                    }
                    Err(err) => {
                        warn!(manifest = %manifest.name, error = %err, "compile failed");
                        (false, Map::new())
                    }
                }
            });
        }
        Ok(())
    }

    fn compile_one(
        &self,
        manifest: &Manifest,
        archive: &Utf8Path,
    ) -> Result<u64, PipelineError> {
        let staging = self.stage_dir.join(format!("{}_staging", manifest.name));
        fs_util::ensure_dir(&staging)?;

        let mut moved: Vec<(Utf8PathBuf, Utf8PathBuf)> = Vec::new();
        let mut move_error = None;
        for file in &manifest.files {
            let Some(name) = file.file_name() else {
                move_error = Some(PipelineError::Filesystem(format!(
                    "manifest entry has no file name: {file}"
                )));
                break;
            };
            let staged = staging.join(name);
            match fs_util::atomic_rename(file, &staged) {
                Ok(()) => moved.push((file.clone(), staged)),
                Err(err) => {
                    move_error = Some(err);
                    break;
                }
            }
        }

        let result = match move_error {
            Some(err) => Err(err),
            None => fs_util::compress_dir_to_zip(&staging, archive).and_then(|()| {
                std::fs::metadata(archive.as_std_path())
                    .map(|meta| meta.len())
                    .map_err(|err| PipelineError::Filesystem(err.to_string()))
            }),
        };

        // Originals go back whether or not compression worked.
        for (original, staged) in moved.into_iter().rev() {
            if let Err(err) = fs_util::atomic_rename(&staged, &original) {
                warn!(file = %original, error = %err, "failed to restore staged file");
            }
        }
        if let Err(err) = fs_util::remove_path(&staging) {
            warn!(dir = %staging, error = %err, "failed to remove staging dir");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;
    use assert_matches::assert_matches;

    fn stacked_input(root: &Utf8Path) -> Utf8PathBuf {
        let dir = root.join("data/converted/loc-db");
        std::fs::create_dir_all(dir.as_std_path()).unwrap();
        std::fs::write(dir.join("collection.csv").as_std_path(), "scientific_name\nApis\n")
            .unwrap();
        std::fs::write(dir.join("assembly.csv").as_std_path(), "assembly_id\nASM1\n").unwrap();
        dir
    }

    #[test]
    fn archives_and_restores_inputs() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let input = stacked_input(&root);

        let mut manager = CompileManager::new(root.join("data/compiled"));
        let id = SourceId::new("loc", "db", None);
        manager.prepare(&id, &[input.clone()]).unwrap();

        let mut store = MetadataStore::load(&root);
        let mut runner = StageRunner::new(&mut store, "compile");
        manager.run(&mut runner, false).unwrap();
        assert!(runner.finish().unwrap());

        // Stacked dir is back in place with its children.
        assert!(input.join("collection.csv").as_std_path().exists());

        let archive = manager.outputs().pop().unwrap();
        assert!(archive.as_std_path().exists());
        let file = std::fs::File::open(archive.as_std_path()).unwrap();
        let mut zip = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["loc-db/assembly.csv", "loc-db/collection.csv"]
        );

        // Recorded byte count is the archive's size, not the staged inputs'.
        let task = &store.stage("compile").unwrap().tasks[0];
        assert_eq!(
            task.custom.get("bytes").and_then(|value| value.as_u64()),
            Some(std::fs::metadata(archive.as_std_path()).unwrap().len())
        );
    }

    #[test]
    fn archive_name_carries_the_date() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let input = stacked_input(&root);
        let mut manager = CompileManager::new(root.join("data/compiled"));
        let id = SourceId::new("loc", "db", None);
        manager.prepare(&id, &[input]).unwrap();
        let archive = manager.outputs().pop().unwrap();
        let expected = format!("loc-db_{}.zip", Utc::now().format("%Y-%m-%d"));
        assert_eq!(archive.file_name(), Some(expected.as_str()));
    }

    #[test]
    fn missing_manifest_file_fails_and_restores_the_rest() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let input = stacked_input(&root);
        let missing = root.join("data/converted/absent");

        let mut manager = CompileManager::new(root.join("data/compiled"));
        let id = SourceId::new("loc", "db", None);
        manager.prepare(&id, &[input.clone(), missing]).unwrap();

        let mut store = MetadataStore::load(&root);
        let mut runner = StageRunner::new(&mut store, "compile");
        manager.run(&mut runner, false).unwrap();
        assert!(!runner.finish().unwrap());

        // The real input was moved for staging and put back on failure.
        assert!(input.join("collection.csv").as_std_path().exists());
        assert!(manager.outputs().iter().all(|a| !a.as_std_path().exists()));
    }

    #[test]
    fn empty_inputs_fail_prepare() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut manager = CompileManager::new(root.join("data/compiled"));
        let id = SourceId::new("loc", "db", None);
        assert_matches!(
            manager.prepare(&id, &[]),
            Err(PipelineError::StageOrder { .. })
        );
    }

    #[test]
    fn existing_archive_skips_without_overwrite() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let input = stacked_input(&root);
        let mut manager = CompileManager::new(root.join("data/compiled"));
        let id = SourceId::new("loc", "db", None);
        manager.prepare(&id, &[input]).unwrap();

        let archive = manager.outputs().pop().unwrap();
        std::fs::create_dir_all(archive.parent().unwrap().as_std_path()).unwrap();
        std::fs::write(archive.as_std_path(), b"old").unwrap();

        let mut store = MetadataStore::load(&root);
        let mut runner = StageRunner::new(&mut store, "compile");
        manager.run(&mut runner, false).unwrap();
        assert!(runner.finish().unwrap());
        assert_eq!(std::fs::read(archive.as_std_path()).unwrap(), b"old");
    }
}
