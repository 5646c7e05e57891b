use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Map;
use tracing::{debug, info, warn};

use crate::config::{ConversionConfig, SourceConfig};
use crate::datafile::DataFile;
use crate::domain::{Event, SourceId};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::fs_util;
use crate::metadata::StageRunner;
use crate::remap::{Mapping, Remapper};
use crate::script::{Script, ScriptContext, ScriptInvoker};
use crate::writer::ChunkedWriter;

/// Everything one conversion run needs, resolved at prepare time.
#[derive(Debug, Clone)]
struct ConversionPlan {
    input: DataFile,
    output_dir: Utf8PathBuf,
    location: String,
    dataset_id: String,
    conversion: ConversionConfig,
}

/// Owns `data/converted/` and the single streaming conversion task: source
/// file in, stacked per-event directory out.
pub struct ConversionManager {
    stage_dir: Utf8PathBuf,
    maps_dir: Utf8PathBuf,
    invoker: Arc<dyn ScriptInvoker>,
    plan: Option<ConversionPlan>,
}

impl ConversionManager {
    pub fn new(
        stage_dir: Utf8PathBuf,
        maps_dir: Utf8PathBuf,
        invoker: Arc<dyn ScriptInvoker>,
    ) -> Self {
        Self {
            stage_dir,
            maps_dir,
            invoker,
            plan: None,
        }
    }

    pub fn stage_dir(&self) -> &Utf8Path {
        &self.stage_dir
    }

    pub fn outputs(&self) -> Vec<Utf8PathBuf> {
        self.plan
            .iter()
            .map(|plan| plan.output_dir.clone())
            .collect()
    }

    /// Pick the conversion input from the previous stage's outputs and pin
    /// down the stacked output directory, named after the source id.
    pub fn prepare(
        &mut self,
        id: &SourceId,
        config: &SourceConfig,
        inputs: &[Utf8PathBuf],
    ) -> Result<(), PipelineError> {
        self.plan = None;
        let Some(conversion) = config.conversion.clone() else {
            debug!(source = %id, "no conversion section; stage has no tasks");
            return Ok(());
        };
        let input = inputs.first().ok_or_else(|| PipelineError::StageOrder {
            stage: "conversion".to_string(),
            missing: "processing".to_string(),
        })?;
        if inputs.len() > 1 {
            warn!(
                count = inputs.len(),
                chosen = %input,
                "conversion expects one source file; using the first"
            );
        }
        fs_util::ensure_dir(&self.stage_dir)?;
        self.plan = Some(ConversionPlan {
            input: DataFile::new(input.clone()),
            output_dir: self.stage_dir.join(id.to_string()),
            location: id.location().to_string(),
            dataset_id: config.dataset_id.clone(),
            conversion,
        });
        Ok(())
    }

    pub fn run(
        &self,
        runner: &mut StageRunner<'_>,
        base_ctx: &ScriptContext,
        overwrite: bool,
    ) -> Result<(), PipelineError> {
        let Some(plan) = &self.plan else {
            return Ok(());
        };
        let output = plan.output_dir.to_string();
        runner.run_task(Some(output), || {
            if plan.output_dir.as_std_path().exists() && !overwrite {
                let mut custom = Map::new();
                custom.insert("skipped".to_string(), true.into());
                return (true, custom);
            }
            match self.convert(plan, base_ctx) {
                Ok(custom) => (true, custom),
                Err(err) => {
                    warn!(input = %plan.input.path(), error = %err, "conversion failed");
                    (false, Map::new())
                }
            }
        });
        Ok(())
    }

    fn convert(
        &self,
        plan: &ConversionPlan,
        base_ctx: &ScriptContext,
    ) -> Result<Map<String, serde_json::Value>, PipelineError> {
        let conversion = &plan.conversion;
        let primary = Mapping::load(&self.maps_dir, &conversion.map_id)?;
        let overlay = conversion
            .custom_map_id
            .as_deref()
            .map(|id| Mapping::load(&self.maps_dir, id))
            .transpose()?;
        let remapper = Remapper::new(
            primary,
            overlay,
            &plan.location,
            conversion.preserve_dwc,
            conversion.prefix_unmapped,
        );

        let columns = plan.input.columns()?;
        let mut table = remapper.build_table(&columns, &conversion.skip_remap);
        if !table.all_unique() {
            if conversion.force_unique {
                table.force_unique();
            } else {
                let description = table
                    .non_unique()
                    .iter()
                    .map(|((event, canonical), sources)| {
                        format!("({event}, {canonical}) <- [{}]", sources.join(", "))
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(PipelineError::NonUniqueMapping(description));
            }
        }
        let unmapped = table.unmapped_count();

        // Validate fill rules up front so a bad event name fails before any
        // shard is written.
        let fill_rules: Vec<(Event, Event)> = conversion
            .fill_na
            .iter()
            .map(|(target, source)| Ok((target.parse()?, source.parse()?)))
            .collect::<Result<_, PipelineError>>()?;

        fs_util::ensure_dir(&plan.output_dir)?;
        let shards_root = self.stage_dir.join("shards");
        let mut writers: BTreeMap<Event, ChunkedWriter> = BTreeMap::new();
        let mut rows = 0usize;

        for chunk in plan.input.read_chunks(conversion.chunk_size)? {
            let mut chunk = chunk?;
            chunk.null_sentinels(&conversion.set_na);
            let n = chunk.n_rows();
            let mut grouped = table.apply(&chunk)?;

            let record = grouped.entry(Event::RecordLevel).or_insert_with(|| {
                let mut frame = Frame::new(Vec::<String>::new());
                for _ in 0..n {
                    let _ = frame.push_row(Vec::new());
                }
                frame
            });
            record.set_column(
                "dataset_id",
                vec![Some(plan.dataset_id.clone()); n],
            );
            let entity_ids = (rows..rows + n)
                .map(|ordinal| Some(format!("{}_{ordinal}", plan.dataset_id)))
                .collect();
            record.set_column("entity_id", entity_ids);

            for (target, source) in &fill_rules {
                if target == source {
                    continue;
                }
                let Some(source_frame) = grouped.get(source).cloned() else {
                    continue;
                };
                if let Some(target_frame) = grouped.get_mut(target) {
                    target_frame.fill_null_from(&source_frame);
                }
            }

            for (event, frame) in &grouped {
                if frame.columns().is_empty() {
                    continue;
                }
                if !writers.contains_key(event) {
                    let target = plan.output_dir.join(format!("{}.csv", event.file_stem()));
                    let writer = ChunkedWriter::new(
                        DataFile::new(target),
                        shards_root.join(event.file_stem()),
                    )?;
                    writers.insert(*event, writer);
                }
                if let Some(writer) = writers.get_mut(event) {
                    writer.write(frame)?;
                }
            }
            rows += n;
        }

        let mut total_columns = 0usize;
        for (_, writer) in writers {
            total_columns += writer.columns().len();
            writer.combine(true)?;
        }
        fs_util::remove_path(&shards_root)?;

        for spec in &conversion.augment {
            let script = Script::from_spec(spec)?;
            let mut ctx = base_ctx.clone();
            ctx.inputs = vec![plan.output_dir.clone()];
            ctx.outputs = vec![plan.output_dir.clone()];
            let outcome = script.run(&ctx, self.invoker.as_ref());
            if !outcome.success {
                return Err(PipelineError::Script {
                    script: script.identifier(),
                    message: "augment script failed".to_string(),
                });
            }
        }

        info!(rows, columns = total_columns, unmapped, "conversion finished");
        let mut custom = Map::new();
        custom.insert("rows".to_string(), rows.into());
        custom.insert("columns".to_string(), total_columns.into());
        custom.insert("unmappedColumns".to_string(), unmapped.into());
        Ok(custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrieveType;
    use crate::metadata::MetadataStore;
    use crate::script::ProcessInvoker;
    use assert_matches::assert_matches;

    fn write_map(maps_dir: &Utf8Path, id: &str, rows: &[(&str, &str, &str)]) {
        std::fs::create_dir_all(maps_dir.as_std_path()).unwrap();
        let mut body = String::from("original_name,event,canonical_name\n");
        for (original, event, canonical) in rows {
            body.push_str(&format!("{original},{event},{canonical}\n"));
        }
        std::fs::write(maps_dir.join(format!("{id}.csv")).as_std_path(), body).unwrap();
    }

    fn conversion(map_id: &str) -> ConversionConfig {
        ConversionConfig {
            map_id: map_id.to_string(),
            custom_map_id: None,
            chunk_size: 2,
            set_na: Vec::new(),
            fill_na: BTreeMap::new(),
            skip_remap: Vec::new(),
            preserve_dwc: false,
            prefix_unmapped: true,
            force_unique: false,
            augment: Vec::new(),
        }
    }

    fn source_config(conversion: ConversionConfig) -> SourceConfig {
        SourceConfig {
            retrieve_type: RetrieveType::Url,
            dataset_id: "ds7".to_string(),
            auth: None,
            downloading: Default::default(),
            processing: Default::default(),
            conversion: Some(conversion),
            update: None,
            directories: BTreeMap::new(),
        }
    }

    struct Fixture {
        root: Utf8PathBuf,
        manager: ConversionManager,
        input: Utf8PathBuf,
        _temp: tempfile::TempDir,
    }

    fn fixture(input_body: &str, config: &SourceConfig) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        write_map(
            &root.join("maps"),
            "dwc",
            &[
                ("a", "collection", "scientific_name"),
                ("b", "assembly", "assembly_id"),
            ],
        );
        let input = root.join("data/processing/source.csv");
        std::fs::create_dir_all(input.parent().unwrap().as_std_path()).unwrap();
        std::fs::write(input.as_std_path(), input_body).unwrap();

        let mut manager = ConversionManager::new(
            root.join("data/converted"),
            root.join("maps"),
            Arc::new(ProcessInvoker),
        );
        let id = SourceId::new("loc", "db", None);
        manager.prepare(&id, config, &[input.clone()]).unwrap();
        Fixture {
            root,
            manager,
            input,
            _temp: temp,
        }
    }

    fn run(fixture: &Fixture, overwrite: bool) -> (bool, MetadataStore) {
        let mut store = MetadataStore::load(&fixture.root);
        let ctx = ScriptContext::new(
            fixture.root.clone(),
            fixture.root.join("data/download"),
            fixture.root.join("data/processing"),
        );
        let mut runner = StageRunner::new(&mut store, "conversion");
        fixture.manager.run(&mut runner, &ctx, overwrite).unwrap();
        let ok = runner.finish().unwrap();
        (ok, store)
    }

    #[test]
    fn routes_events_into_stacked_directory() {
        let config = source_config(conversion("dwc"));
        let fixture = fixture("a,b,c\nApis,ASM1,x\nBombus,ASM2,y\nVespa,ASM3,z\n", &config);
        let (ok, store) = run(&fixture, false);
        assert!(ok);

        let out = fixture.root.join("data/converted/loc-db");
        let collection = std::fs::read_to_string(out.join("collection.csv").as_std_path()).unwrap();
        assert_eq!(collection, "scientific_name\nApis\nBombus\nVespa\n");
        let assembly = std::fs::read_to_string(out.join("assembly.csv").as_std_path()).unwrap();
        assert_eq!(assembly, "assembly_id\nASM1\nASM2\nASM3\n");
        let unmapped = std::fs::read_to_string(out.join("unmapped.csv").as_std_path()).unwrap();
        assert_eq!(unmapped, "loc_c\nx\ny\nz\n");

        // Entity ids keep their ordinal across the chunk boundary.
        let record = std::fs::read_to_string(out.join("record_level.csv").as_std_path()).unwrap();
        assert_eq!(record, "dataset_id,entity_id\nds7,ds7_0\nds7,ds7_1\nds7,ds7_2\n");

        let stage = store.stage("conversion").unwrap();
        assert_eq!(stage.tasks[0].custom.get("rows"), Some(&3.into()));
        assert_eq!(stage.tasks[0].custom.get("unmappedColumns"), Some(&1.into()));
    }

    #[test]
    fn set_na_normalizes_sentinels() {
        let mut conv = conversion("dwc");
        conv.set_na = vec!["NA".to_string()];
        let config = source_config(conv);
        let fixture = fixture("a,b\nApis,NA\nBombus,ASM2\n", &config);
        let (ok, _) = run(&fixture, false);
        assert!(ok);
        let assembly = DataFile::new(fixture.root.join("data/converted/loc-db/assembly.csv"))
            .read()
            .unwrap();
        assert_eq!(assembly.get(0, "assembly_id"), None);
        assert_eq!(assembly.get(1, "assembly_id"), Some("ASM2"));
    }

    #[test]
    fn non_unique_targets_fail_unless_forced() {
        let config = source_config(conversion("dup"));
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        write_map(
            &root.join("maps"),
            "dup",
            &[
                ("a", "collection", "scientific_name"),
                ("b", "collection", "scientific_name"),
            ],
        );
        let input = root.join("in.csv");
        std::fs::write(input.as_std_path(), "a,b\nx,y\n").unwrap();

        let mut manager = ConversionManager::new(
            root.join("data/converted"),
            root.join("maps"),
            Arc::new(ProcessInvoker),
        );
        let id = SourceId::new("loc", "db", None);
        manager
            .prepare(&id, &config, &[input.clone()])
            .unwrap();
        let ctx = ScriptContext::new(root.clone(), root.clone(), root.clone());
        let plan = manager.plan.as_ref().unwrap();
        assert_matches!(
            manager.convert(plan, &ctx),
            Err(PipelineError::NonUniqueMapping(_))
        );

        // forceUnique keeps the first claimant and proceeds.
        let mut forced = conversion("dup");
        forced.force_unique = true;
        manager
            .prepare(&id, &source_config(forced), &[input])
            .unwrap();
        let plan = manager.plan.as_ref().unwrap();
        assert!(manager.convert(plan, &ctx).is_ok());
        let collection = std::fs::read_to_string(
            root.join("data/converted/loc-db/collection.csv").as_std_path(),
        )
        .unwrap();
        assert_eq!(collection, "scientific_name\nx\n");
    }

    #[test]
    fn missing_input_fails_prepare() {
        let config = source_config(conversion("dwc"));
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut manager = ConversionManager::new(
            root.join("data/converted"),
            root.join("maps"),
            Arc::new(ProcessInvoker),
        );
        let id = SourceId::new("loc", "db", None);
        assert_matches!(
            manager.prepare(&id, &config, &[]),
            Err(PipelineError::StageOrder { .. })
        );
    }

    #[test]
    fn existing_output_is_skipped_without_overwrite() {
        let config = source_config(conversion("dwc"));
        let fixture = fixture("a,b\nApis,ASM1\n", &config);
        std::fs::create_dir_all(
            fixture.root.join("data/converted/loc-db").as_std_path(),
        )
        .unwrap();
        let (ok, store) = run(&fixture, false);
        assert!(ok);
        let stage = store.stage("conversion").unwrap();
        assert_eq!(stage.tasks[0].custom.get("skipped"), Some(&true.into()));
        // Nothing was written into the pre-existing directory.
        assert!(
            !fixture
                .root
                .join("data/converted/loc-db/collection.csv")
                .as_std_path()
                .exists()
        );
    }

    #[test]
    fn fill_na_copies_between_events() {
        let mut conv = conversion("dwc");
        conv.set_na = vec!["NA".to_string()];
        // Nulls in collection columns are filled from the assembly frame;
        // no shared column names here, so this stays a no-op, while the
        // self-target rule is skipped outright.
        conv.fill_na
            .insert("collection".to_string(), "collection".to_string());
        let config = source_config(conv);
        let fixture = fixture("a,b\nNA,ASM1\n", &config);
        let (ok, _) = run(&fixture, false);
        assert!(ok);
        let collection = DataFile::new(fixture.root.join("data/converted/loc-db/collection.csv"))
            .read()
            .unwrap();
        assert_eq!(collection.get(0, "scientific_name"), None);
    }
}
