use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::datafile::TableProperties;
use crate::domain::{SourceHint, SourceId};
use crate::error::PipelineError;
use crate::fs_util;
use crate::policy::UpdatePolicy;
use crate::script::ScriptSpec;

pub const DATA_DIR: &str = "data";
pub const CRAWLER_PROGRESS_DIR: &str = "crawlerProgress";
const CONFIG_STEMS: [&str; 2] = ["config.toml", "config.json"];

/// How the download stage obtains its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieveType {
    Url,
    Crawl,
    Script,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UrlEntry {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub properties: TableProperties,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrawlConfig {
    pub entry_url: String,
    #[serde(default)]
    pub filter: Option<String>,
    /// -1 means unbounded.
    #[serde(default = "default_max_depth")]
    pub max_depth: i64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_max_depth() -> i64 {
    -1
}

fn default_workers() -> usize {
    10
}

fn default_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadingConfig {
    #[serde(default)]
    pub urls: Vec<UrlEntry>,
    #[serde(default)]
    pub crawl: Option<CrawlConfig>,
    #[serde(default)]
    pub script: Option<ScriptSpec>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingConfig {
    /// Steps applied only to the download file at the given 0-based index.
    #[serde(default)]
    pub specific: BTreeMap<String, Vec<ScriptSpec>>,
    #[serde(default)]
    pub per_file: Vec<ScriptSpec>,
    #[serde(default, rename = "final")]
    pub final_steps: Vec<ScriptSpec>,
}

impl ProcessingConfig {
    pub fn is_empty(&self) -> bool {
        self.specific.is_empty() && self.per_file.is_empty() && self.final_steps.is_empty()
    }

    pub fn specific_for(&self, index: usize) -> &[ScriptSpec] {
        self.specific
            .get(&index.to_string())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn default_chunk_size() -> usize {
    crate::datafile::DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversionConfig {
    #[serde(rename = "mapID")]
    pub map_id: String,
    #[serde(default, rename = "customMapID")]
    pub custom_map_id: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Sentinel strings normalized to null on the way in.
    #[serde(default)]
    pub set_na: Vec<String>,
    /// Null-fill rules `target event -> source event`: nulls in the target
    /// frame's columns are filled from same-named columns of the source
    /// frame.
    #[serde(default)]
    pub fill_na: BTreeMap<String, String>,
    #[serde(default)]
    pub skip_remap: Vec<String>,
    #[serde(default, rename = "preserveDwC")]
    pub preserve_dwc: bool,
    #[serde(default)]
    pub prefix_unmapped: bool,
    #[serde(default)]
    pub force_unique: bool,
    #[serde(default)]
    pub augment: Vec<ScriptSpec>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub repeat_freq: Option<u32>,
    #[serde(default)]
    pub repeat_day: Option<String>,
    #[serde(default)]
    pub repeat_date: Option<u32>,
}

impl UpdateConfig {
    pub fn policy(&self) -> Result<UpdatePolicy, PipelineError> {
        UpdatePolicy::parse(
            &self.kind,
            self.repeat_freq,
            self.repeat_day.as_deref(),
            self.repeat_date,
        )
    }
}

/// Per-source configuration, merged from `config.toml` or `config.json` in
/// the source directory.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub retrieve_type: RetrieveType,
    #[serde(rename = "datasetID")]
    pub dataset_id: String,
    /// Relative path to a two-line `user\npassword` auth file.
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub downloading: DownloadingConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub conversion: Option<ConversionConfig>,
    #[serde(default)]
    pub update: Option<UpdateConfig>,
    /// Named-directory aliases usable in script arguments as `.<alias>/x`.
    #[serde(default)]
    pub directories: BTreeMap<String, String>,
}

impl SourceConfig {
    /// Load from the source directory, preferring TOML over JSON when both
    /// exist.
    pub fn load(source_dir: &Utf8Path) -> Result<Self, PipelineError> {
        for stem in CONFIG_STEMS {
            let path = source_dir.join(stem);
            if !path.as_std_path().exists() {
                continue;
            }
            let text = std::fs::read_to_string(path.as_std_path())
                .map_err(|_| PipelineError::ConfigRead(path.clone().into_std_path_buf()))?;
            let config: SourceConfig = if stem.ends_with(".toml") {
                toml::from_str(&text)
                    .map_err(|err| PipelineError::ConfigParse(err.to_string()))?
            } else {
                serde_json::from_str(&text)
                    .map_err(|err| PipelineError::ConfigParse(err.to_string()))?
            };
            config.validate()?;
            debug!(path = %path, "loaded source config");
            return Ok(config);
        }
        Err(PipelineError::MissingConfig(
            source_dir.to_path_buf().into_std_path_buf(),
        ))
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.dataset_id.trim().is_empty() {
            return Err(PipelineError::ConfigParse(
                "datasetID must be non-empty".to_string(),
            ));
        }
        match self.retrieve_type {
            RetrieveType::Url if self.downloading.urls.is_empty() => Err(
                PipelineError::ConfigParse("retrieveType=url requires downloading.urls".into()),
            ),
            RetrieveType::Crawl if self.downloading.crawl.is_none() => Err(
                PipelineError::ConfigParse("retrieveType=crawl requires downloading.crawl".into()),
            ),
            RetrieveType::Script if self.downloading.script.is_none() => {
                Err(PipelineError::ConfigParse(
                    "retrieveType=script requires downloading.script".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// One discovered source: its identity and absolute directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEntry {
    pub id: SourceId,
    pub dir: Utf8PathBuf,
}

impl SourceEntry {
    pub fn data_dir(&self) -> Utf8PathBuf {
        self.dir.join(DATA_DIR)
    }

    pub fn stage_dir(&self, stage: crate::domain::Stage) -> Utf8PathBuf {
        self.data_dir().join(stage.dir_name())
    }

    pub fn progress_dir(&self) -> Utf8PathBuf {
        self.dir.join(CRAWLER_PROGRESS_DIR)
    }
}

/// The on-disk catalog of sources below a root directory. A directory is a
/// source iff it holds a config file; sources may sit at
/// `<root>/<loc>/<db>` or `<root>/<loc>/<db>/<sub>`.
#[derive(Debug, Clone)]
pub struct Catalog {
    root: Utf8PathBuf,
    entries: Vec<SourceEntry>,
}

fn has_config(dir: &Utf8Path) -> bool {
    CONFIG_STEMS
        .iter()
        .any(|stem| dir.join(stem).as_std_path().exists())
}

fn subdirs(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, PipelineError> {
    let mut out = Vec::new();
    let entries = std::fs::read_dir(dir.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if path.is_dir() {
            let path = Utf8PathBuf::from_path_buf(path)
                .map_err(|bad| PipelineError::Filesystem(format!("non-UTF-8 path: {bad:?}")))?;
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

impl Catalog {
    pub fn scan(root: &Utf8Path) -> Result<Self, PipelineError> {
        let mut entries = Vec::new();
        if root.as_std_path().exists() {
            for location_dir in subdirs(root)? {
                let location = location_dir.file_name().unwrap_or_default().to_string();
                for database_dir in subdirs(&location_dir)? {
                    let database = database_dir.file_name().unwrap_or_default().to_string();
                    if has_config(&database_dir) {
                        entries.push(SourceEntry {
                            id: SourceId::new(&location, &database, None),
                            dir: database_dir.clone(),
                        });
                        continue;
                    }
                    for subsection_dir in subdirs(&database_dir)? {
                        if !has_config(&subsection_dir) {
                            continue;
                        }
                        let subsection =
                            subsection_dir.file_name().unwrap_or_default().to_string();
                        entries.push(SourceEntry {
                            id: SourceId::new(&location, &database, Some(&subsection)),
                            dir: subsection_dir,
                        });
                    }
                }
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    pub fn matching(&self, hint: &SourceHint) -> Vec<&SourceEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.id.matches_hint(hint))
            .collect()
    }

    /// Resolve a hint to exactly one source.
    pub fn find(&self, hint: &SourceHint) -> Result<&SourceEntry, PipelineError> {
        let matches = self.matching(hint);
        match matches.len() {
            0 => Err(PipelineError::SourceNotFound(format_hint(hint))),
            1 => Ok(matches[0]),
            _ => Err(PipelineError::AmbiguousSource {
                hint: format_hint(hint),
                candidates: matches
                    .iter()
                    .map(|entry| entry.id.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Create the skeleton for a new source: directories plus a config stub
    /// the user fills in. Fails if the source already exists.
    pub fn create(&mut self, id: &SourceId) -> Result<SourceEntry, PipelineError> {
        let dir = self.root.join(id.relative_dir());
        if has_config(&dir) {
            return Err(PipelineError::ConfigParse(format!(
                "source {id} already exists at {dir}"
            )));
        }
        for stage in crate::domain::Stage::ALL {
            fs_util::ensure_dir(&dir.join(DATA_DIR).join(stage.dir_name()))?;
        }
        let stub = concat!(
            "retrieveType = \"url\"\n",
            "datasetID = \"\"\n\n",
            "[[downloading.urls]]\n",
            "url = \"\"\n",
            "name = \"\"\n",
        );
        fs_util::write_bytes_atomic(&dir.join("config.toml"), stub.as_bytes())?;
        let entry = SourceEntry {
            id: id.clone(),
            dir,
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Delete a source's generated data, keeping config and metadata.
    pub fn purge_data(&self, entry: &SourceEntry) -> Result<(), PipelineError> {
        fs_util::remove_path(&entry.data_dir())?;
        fs_util::remove_path(&entry.progress_dir())?;
        Ok(())
    }

    /// Remove one stage's working directory. Crawl checkpoints belong to the
    /// download stage and go with it.
    pub fn purge_stage(
        &self,
        entry: &SourceEntry,
        stage: crate::domain::Stage,
    ) -> Result<(), PipelineError> {
        fs_util::remove_path(&entry.stage_dir(stage))?;
        if stage == crate::domain::Stage::Download {
            fs_util::remove_path(&entry.progress_dir())?;
        }
        Ok(())
    }
}

fn format_hint(hint: &SourceHint) -> String {
    let mut out = hint.location.clone();
    if let Some(db) = &hint.database {
        out.push('-');
        out.push_str(db);
    }
    if let Some(sub) = &hint.subsection {
        out.push('-');
        out.push_str(sub);
    }
    out
}
