use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Map;
use tracing::warn;

use crate::config::SourceConfig;
use crate::dag::{NodeTask, ProcessingDag};
use crate::datafile::DataFile;
use crate::error::PipelineError;
use crate::fs_util;
use crate::metadata::StageRunner;
use crate::script::{OutputScript, Script, ScriptContext, ScriptInvoker, ScriptSpec};

/// Owns `data/processing/` and the per-source node graph built from the
/// config's specific/perFile/final step lists.
pub struct ProcessingManager {
    stage_dir: Utf8PathBuf,
    invoker: Arc<dyn ScriptInvoker>,
    dag: ProcessingDag,
}

impl ProcessingManager {
    pub fn new(stage_dir: Utf8PathBuf, invoker: Arc<dyn ScriptInvoker>) -> Self {
        Self {
            stage_dir,
            invoker,
            dag: ProcessingDag::new(),
        }
    }

    pub fn stage_dir(&self) -> &Utf8Path {
        &self.stage_dir
    }

    pub fn dag(&self) -> &ProcessingDag {
        &self.dag
    }

    /// Outputs of the graph's current tails. When the graph is empty the
    /// download files pass through untouched.
    pub fn outputs(&self) -> Result<Vec<Utf8PathBuf>, PipelineError> {
        self.dag
            .tails()
            .iter()
            .map(|&tail| Ok(self.dag.node(tail)?.output().to_path_buf()))
            .collect()
    }

    fn step(&self, spec: &ScriptSpec, output_name: &str) -> Result<OutputScript, PipelineError> {
        let script = Script::from_spec(spec)?;
        let output = DataFile::new(self.stage_dir.join(output_name));
        Ok(OutputScript::new(script, output))
    }

    fn declared_output(spec: &ScriptSpec) -> Result<&str, PipelineError> {
        spec.outputs
            .first()
            .map(String::as_str)
            .ok_or_else(|| PipelineError::Script {
                script: format!("{}:{}", spec.path, spec.function),
                message: "processing step declares no output".to_string(),
            })
    }

    /// Build the graph: one root per download file with its index-specific
    /// chain, then the perFile steps on every tail, then the final join.
    pub fn prepare(
        &mut self,
        config: &SourceConfig,
        download_outputs: &[Utf8PathBuf],
    ) -> Result<(), PipelineError> {
        fs_util::ensure_dir(&self.stage_dir)?;
        self.dag = ProcessingDag::new();

        for (index, file) in download_outputs.iter().enumerate() {
            let mut steps = Vec::new();
            for spec in config.processing.specific_for(index) {
                steps.push(self.step(spec, Self::declared_output(spec)?)?);
            }
            self.dag.register_file(file.clone(), steps);
        }

        for spec in &config.processing.per_file {
            let declared = Utf8PathBuf::from(Self::declared_output(spec)?);
            let stage_dir = self.stage_dir.clone();
            let invoker_step = |tail: &crate::dag::Node| -> Result<Vec<OutputScript>, PipelineError> {
                let stem = tail.output().file_stem().unwrap_or("file");
                let name = match declared.extension() {
                    Some(ext) => format!("{stem}_{}.{ext}", declared.file_stem().unwrap_or("out")),
                    None => format!("{stem}_{}", declared.file_stem().unwrap_or("out")),
                };
                let script = Script::from_spec(spec)?;
                let output = DataFile::new(stage_dir.join(name));
                Ok(vec![OutputScript::new(script, output)])
            };
            self.dag.add_all_processing(invoker_step)?;
        }

        if !config.processing.final_steps.is_empty() {
            let mut steps = Vec::new();
            for spec in &config.processing.final_steps {
                steps.push(self.step(spec, Self::declared_output(spec)?)?);
            }
            self.dag.add_final_processing(steps);
        }
        Ok(())
    }

    /// Execute the topologically ordered node queue. Roots are no-ops that
    /// only assert their file exists; failures continue the queue.
    pub fn run(
        &self,
        runner: &mut StageRunner<'_>,
        base_ctx: &ScriptContext,
        overwrite: bool,
    ) -> Result<(), PipelineError> {
        let queue = self.dag.task_queue()?;
        for index in queue {
            let node = self.dag.node(index)?;
            let output = node.output().to_string();
            match &node.task {
                NodeTask::Root(path) => {
                    let exists = path.as_std_path().exists();
                    if !exists {
                        warn!(file = %path, "registered download file is missing");
                    }
                    runner.run_task(Some(output), || {
                        let mut custom = Map::new();
                        custom.insert("root".to_string(), true.into());
                        (exists, custom)
                    });
                }
                NodeTask::Script(script) => {
                    let inputs = self.dag.parent_outputs(index)?;
                    let mut ctx = base_ctx.clone();
                    ctx.inputs = inputs;
                    runner.run_task(Some(output), || {
                        let outcome = script.run(&ctx, self.invoker.as_ref(), overwrite);
                        let custom = match outcome.value {
                            Some(serde_json::Value::Object(map)) => map,
                            _ => Map::new(),
                        };
                        (outcome.success, custom)
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessingConfig, RetrieveType, SourceConfig};
    use crate::metadata::MetadataStore;
    use crate::script::{ScriptOutcome, ScriptRequest};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct WritingInvoker {
        calls: Mutex<Vec<ScriptRequest>>,
    }

    impl WritingInvoker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ScriptInvoker for WritingInvoker {
        fn invoke(&self, request: &ScriptRequest) -> Result<ScriptOutcome, PipelineError> {
            self.calls.lock().unwrap().push(request.clone());
            // Simulate the script creating its first declared output.
            if let Some(output) = request
                .payload
                .get("outputs")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
            {
                std::fs::write(output, b"made").unwrap();
            }
            Ok(ScriptOutcome::succeeded(None))
        }
    }

    fn spec(name: &str, output: &str) -> ScriptSpec {
        ScriptSpec {
            path: format!("./{name}.sh"),
            function: "run".to_string(),
            args: vec!["{IN-PATH}".to_string()],
            kwargs: BTreeMap::new(),
            outputs: vec![output.to_string()],
            parallel: false,
        }
    }

    fn config(processing: ProcessingConfig) -> SourceConfig {
        SourceConfig {
            retrieve_type: RetrieveType::Url,
            dataset_id: "ds".to_string(),
            auth: None,
            downloading: Default::default(),
            processing,
            conversion: None,
            update: None,
            directories: BTreeMap::new(),
        }
    }

    fn setup(root: &Utf8Path, names: &[&str]) -> Vec<Utf8PathBuf> {
        let download = root.join("data/download");
        std::fs::create_dir_all(download.as_std_path()).unwrap();
        names
            .iter()
            .map(|name| {
                let path = download.join(name);
                std::fs::write(path.as_std_path(), b"data").unwrap();
                path
            })
            .collect()
    }

    fn ctx(root: &Utf8Path) -> ScriptContext {
        ScriptContext::new(
            root.to_path_buf(),
            root.join("data/download"),
            root.join("data/processing"),
        )
    }

    #[test]
    fn per_file_steps_fan_out_over_downloads() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let downloads = setup(&root, &["a.csv", "b.csv"]);

        let invoker = Arc::new(WritingInvoker::new());
        let mut manager = ProcessingManager::new(root.join("data/processing"), invoker.clone());
        let config = config(ProcessingConfig {
            specific: BTreeMap::new(),
            per_file: vec![spec("clean", "clean.csv")],
            final_steps: Vec::new(),
        });
        manager.prepare(&config, &downloads).unwrap();

        assert_eq!(
            manager.outputs().unwrap(),
            vec![
                root.join("data/processing/a_clean.csv"),
                root.join("data/processing/b_clean.csv"),
            ]
        );

        let mut store = MetadataStore::load(&root);
        let mut runner = StageRunner::new(&mut store, "processing");
        manager.run(&mut runner, &ctx(&root), false).unwrap();
        assert!(runner.finish().unwrap());
        assert_eq!(invoker.calls.lock().unwrap().len(), 2);
        assert!(root.join("data/processing/a_clean.csv").as_std_path().exists());
    }

    #[test]
    fn final_steps_join_all_tails() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let downloads = setup(&root, &["a.csv", "b.csv"]);

        let invoker = Arc::new(WritingInvoker::new());
        let mut manager = ProcessingManager::new(root.join("data/processing"), invoker.clone());
        let config = config(ProcessingConfig {
            specific: BTreeMap::new(),
            per_file: Vec::new(),
            final_steps: vec![spec("merge", "merged.csv")],
        });
        manager.prepare(&config, &downloads).unwrap();

        assert_eq!(
            manager.outputs().unwrap(),
            vec![root.join("data/processing/merged.csv")]
        );

        let mut store = MetadataStore::load(&root);
        let mut runner = StageRunner::new(&mut store, "processing");
        manager.run(&mut runner, &ctx(&root), false).unwrap();
        assert!(runner.finish().unwrap());

        // The join script received both download files as inputs.
        let calls = invoker.calls.lock().unwrap();
        let merged_call = calls.last().unwrap();
        let inputs = merged_call.payload.get("inputs").unwrap().as_array().unwrap();
        assert_eq!(inputs.len(), 2);
    }

    #[test]
    fn specific_steps_attach_to_one_file() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let downloads = setup(&root, &["a.csv", "b.csv"]);

        let mut specific = BTreeMap::new();
        specific.insert("1".to_string(), vec![spec("fix", "b_fixed.csv")]);
        let invoker = Arc::new(WritingInvoker::new());
        let mut manager = ProcessingManager::new(root.join("data/processing"), invoker.clone());
        let config = config(ProcessingConfig {
            specific,
            per_file: Vec::new(),
            final_steps: Vec::new(),
        });
        manager.prepare(&config, &downloads).unwrap();

        assert_eq!(
            manager.outputs().unwrap(),
            vec![
                root.join("data/download/a.csv"),
                root.join("data/processing/b_fixed.csv"),
            ]
        );
    }

    #[test]
    fn missing_root_fails_its_task_but_queue_continues() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut downloads = setup(&root, &["a.csv"]);
        downloads.push(root.join("data/download/missing.csv"));

        let invoker = Arc::new(WritingInvoker::new());
        let mut manager = ProcessingManager::new(root.join("data/processing"), invoker);
        let config = config(ProcessingConfig::default());
        manager.prepare(&config, &downloads).unwrap();

        let mut store = MetadataStore::load(&root);
        let mut runner = StageRunner::new(&mut store, "processing");
        manager.run(&mut runner, &ctx(&root), false).unwrap();
        assert!(!runner.finish().unwrap());

        let stage = store.stage("processing").unwrap();
        assert!(stage.tasks[0].success);
        assert!(!stage.tasks[1].success);
    }
}
