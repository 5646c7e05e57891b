use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8PathBuf;
use chrono::Utc;
use tracing::{info, warn};

use crate::compile::CompileManager;
use crate::config::{SourceConfig, SourceEntry};
use crate::convert::ConversionManager;
use crate::domain::Stage;
use crate::download::{DownloadManager, FileFetcher};
use crate::error::PipelineError;
use crate::metadata::{MetadataStore, StageRunner};
use crate::processing::ProcessingManager;
use crate::script::{ScriptContext, ScriptInvoker};

/// Cooperative cancellation token, checked between prepare phases and at
/// every task boundary inside a running stage.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Rebuild stage tasks from scratch, discarding crawl progress.
    pub re_prepare: bool,
    /// Overwrite outputs that already exist.
    pub overwrite: bool,
    /// Run only when the source's update policy says it is due.
    pub only_if_due: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutcome {
    /// False when the update policy skipped the run.
    pub ran: bool,
    pub success: bool,
}

/// Drives one source through its stages: prepare walks forward from
/// Download, execute runs only the requested stage.
pub struct SourceOrchestrator {
    entry: SourceEntry,
    config: SourceConfig,
    store: MetadataStore,
    ctx: ScriptContext,
    cancel: CancelFlag,
    download: DownloadManager,
    processing: ProcessingManager,
    conversion: ConversionManager,
    compile: CompileManager,
}

impl SourceOrchestrator {
    pub fn new(
        entry: SourceEntry,
        config: SourceConfig,
        maps_dir: Utf8PathBuf,
        fetcher: Arc<dyn FileFetcher>,
        invoker: Arc<dyn ScriptInvoker>,
        cancel: CancelFlag,
    ) -> Self {
        let store = MetadataStore::load(&entry.dir);
        let mut ctx = ScriptContext::new(
            entry.dir.clone(),
            entry.stage_dir(Stage::Download),
            entry.stage_dir(Stage::Processing),
        );
        for (alias, target) in &config.directories {
            let path = Utf8PathBuf::from(target);
            let resolved = if path.is_absolute() {
                path
            } else {
                entry.dir.join(path)
            };
            ctx.aliases.insert(alias.clone(), resolved);
        }

        let download = DownloadManager::new(
            entry.stage_dir(Stage::Download),
            entry.progress_dir(),
            fetcher,
            invoker.clone(),
        );
        let processing =
            ProcessingManager::new(entry.stage_dir(Stage::Processing), invoker.clone());
        let conversion =
            ConversionManager::new(entry.stage_dir(Stage::Conversion), maps_dir, invoker);
        let compile = CompileManager::new(entry.stage_dir(Stage::Compile));

        Self {
            entry,
            config,
            store,
            ctx,
            cancel,
            download,
            processing,
            conversion,
            compile,
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn entry(&self) -> &SourceEntry {
        &self.entry
    }

    /// Whether the source's update policy says it is due. Sources without
    /// an update section are always due.
    pub fn update_due(&self) -> Result<bool, PipelineError> {
        match &self.config.update {
            None => Ok(true),
            Some(update) => {
                let policy = update.policy()?;
                Ok(policy.update_ready(self.store.latest_success(), Utc::now()))
            }
        }
    }

    /// Expected outputs of a stage, used both for wiring stages together
    /// and for the fail-fast ordering check.
    fn stage_outputs(&self, stage: Stage) -> Result<Vec<Utf8PathBuf>, PipelineError> {
        match stage {
            Stage::Download => Ok(self.download.outputs()),
            Stage::Processing => {
                // An empty graph passes the download files through.
                if self.processing.dag().is_empty() {
                    Ok(self.download.outputs())
                } else {
                    self.processing.outputs()
                }
            }
            Stage::Conversion => Ok(self.conversion.outputs()),
            Stage::Compile => Ok(self.compile.outputs()),
        }
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Build task lists for every stage from Download through `target`.
    pub fn prepare(&mut self, target: Stage, ignore_progress: bool) -> Result<(), PipelineError> {
        for stage in target.chain() {
            self.check_cancelled()?;
            match stage {
                Stage::Download => {
                    self.download
                        .prepare(&self.entry.dir, &self.config, ignore_progress)?;
                }
                Stage::Processing => {
                    self.processing
                        .prepare(&self.config, &self.download.outputs())?;
                }
                Stage::Conversion => {
                    let inputs = self.stage_outputs(Stage::Processing)?;
                    self.conversion
                        .prepare(&self.entry.id, &self.config, &inputs)?;
                }
                Stage::Compile => {
                    let inputs = self.stage_outputs(Stage::Conversion)?;
                    self.compile.prepare(&self.entry.id, &inputs)?;
                }
            }
        }
        Ok(())
    }

    /// Fail fast when a stage's predecessor has not produced its outputs.
    fn enforce_order(&self, stage: Stage) -> Result<(), PipelineError> {
        let Some(predecessor) = stage.predecessor() else {
            return Ok(());
        };
        let outputs = self.stage_outputs(predecessor)?;
        let missing = outputs.is_empty()
            || outputs
                .iter()
                .any(|path| !path.as_std_path().exists());
        if missing {
            return Err(PipelineError::StageOrder {
                stage: stage.to_string(),
                missing: predecessor.to_string(),
            });
        }
        Ok(())
    }

    /// Run only `target`'s task list, recording metadata per task. A cancel
    /// mid-stage records the remaining tasks as failed and returns cleanly
    /// with the metadata saved.
    pub fn execute(&mut self, target: Stage, overwrite: bool) -> Result<bool, PipelineError> {
        self.enforce_order(target)?;
        let mut runner = StageRunner::with_cancel(
            &mut self.store,
            &target.to_string(),
            self.cancel.clone(),
        );
        let result = match target {
            Stage::Download => self.download.run(&mut runner, &self.ctx, overwrite),
            Stage::Processing => self.processing.run(&mut runner, &self.ctx, overwrite),
            Stage::Conversion => self.conversion.run(&mut runner, &self.ctx, overwrite),
            Stage::Compile => self.compile.run(&mut runner, overwrite),
        };
        match result {
            Ok(()) => runner.finish(),
            Err(err) => {
                runner.abort()?;
                Err(err)
            }
        }
    }

    /// Prepare through `target`, then execute it. A cancel during prepare
    /// stops before any task runs; a cancel during execute surfaces as a
    /// failed stage with the metadata captured so far retained.
    pub fn run(&mut self, target: Stage, options: RunOptions) -> Result<StageOutcome, PipelineError> {
        if options.only_if_due && !self.update_due()? {
            info!(source = %self.entry.id, "update policy says not due; skipping");
            return Ok(StageOutcome {
                ran: false,
                success: true,
            });
        }

        self.prepare(target, options.re_prepare)?;
        let success = self.execute(target, options.overwrite)?;
        if !success {
            warn!(source = %self.entry.id, stage = %target, "stage finished with failed tasks");
        }
        Ok(StageOutcome { ran: true, success })
    }
}
