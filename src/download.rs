use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Map;
use tracing::{info, warn};

use crate::config::{CrawlConfig, RetrieveType, SourceConfig};
use crate::crawler::{
    CrawlSettings, Crawler, Credentials, HttpPageFetcher, is_retryable_error, is_retryable_status,
    output_name,
};
use crate::datafile::DataFile;
use crate::error::PipelineError;
use crate::fs_util;
use crate::script::{OutputScript, Script, ScriptContext, ScriptInvoker};

/// Read a two-line `user\npassword` auth file.
pub fn load_auth(path: &Utf8Path) -> Result<Credentials, PipelineError> {
    let text = std::fs::read_to_string(path.as_std_path())
        .map_err(|err| PipelineError::Filesystem(format!("auth file {path}: {err}")))?;
    let mut lines = text.lines();
    let user = lines.next().unwrap_or_default().trim().to_string();
    let password = lines.next().unwrap_or_default().trim().to_string();
    if user.is_empty() || password.is_empty() {
        return Err(PipelineError::ConfigParse(format!(
            "auth file {path} must hold user and password on two lines"
        )));
    }
    Ok(Credentials { user, password })
}

pub trait FileFetcher: Send + Sync {
    fn fetch_to(
        &self,
        url: &str,
        auth: Option<&Credentials>,
        dest: &Utf8Path,
    ) -> Result<u64, PipelineError>;
}

/// Streams a URL to disk through a temp sibling, with the same retry policy
/// as page fetches.
pub struct HttpFileFetcher {
    client: Client,
    retries: usize,
}

impl HttpFileFetcher {
    pub fn new(retries: usize) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("biopipe/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PipelineError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| PipelineError::Http(err.to_string()))?;
        Ok(Self { client, retries })
    }
}

impl FileFetcher for HttpFileFetcher {
    fn fetch_to(
        &self,
        url: &str,
        auth: Option<&Credentials>,
        dest: &Utf8Path,
    ) -> Result<u64, PipelineError> {
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(auth) = auth {
                request = request.basic_auth(&auth.user, Some(&auth.password));
            }
            match request.send() {
                Ok(mut response) => {
                    let status = response.status().as_u16();
                    if !response.status().is_success() {
                        if attempt < self.retries && is_retryable_status(status) {
                            thread::sleep(Duration::from_millis(
                                BASE_DELAY_MS * (attempt as u64 + 1),
                            ));
                            attempt += 1;
                            continue;
                        }
                        return Err(PipelineError::HttpStatus {
                            status,
                            url: url.to_string(),
                        });
                    }
                    if let Some(parent) = dest.parent() {
                        fs_util::ensure_dir(parent)?;
                    }
                    let tmp = dest.with_extension("part");
                    let mut file = std::fs::File::create(tmp.as_std_path())
                        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
                    let written = response
                        .copy_to(&mut file)
                        .map_err(|err| PipelineError::Http(err.to_string()))?;
                    drop(file);
                    fs_util::atomic_rename(&tmp, dest)?;
                    return Ok(written);
                }
                Err(err) => {
                    if attempt < self.retries && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(PipelineError::Http(err.to_string()));
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum DownloadTask {
    Url { url: String, dest: DataFile },
    Script(OutputScript),
}

impl DownloadTask {
    pub fn output(&self) -> &Utf8Path {
        match self {
            DownloadTask::Url { dest, .. } => dest.path(),
            DownloadTask::Script(script) => script.output.path(),
        }
    }
}

/// Owns `data/download/` and the ordered download task list.
pub struct DownloadManager {
    stage_dir: Utf8PathBuf,
    progress_dir: Utf8PathBuf,
    auth: Option<Credentials>,
    fetcher: Arc<dyn FileFetcher>,
    invoker: Arc<dyn ScriptInvoker>,
    tasks: Vec<DownloadTask>,
}

impl DownloadManager {
    pub fn new(
        stage_dir: Utf8PathBuf,
        progress_dir: Utf8PathBuf,
        fetcher: Arc<dyn FileFetcher>,
        invoker: Arc<dyn ScriptInvoker>,
    ) -> Self {
        Self {
            stage_dir,
            progress_dir,
            auth: None,
            fetcher,
            invoker,
            tasks: Vec::new(),
        }
    }

    pub fn stage_dir(&self) -> &Utf8Path {
        &self.stage_dir
    }

    pub fn tasks(&self) -> &[DownloadTask] {
        &self.tasks
    }

    /// Expected output paths, in task order. These feed the processing DAG.
    pub fn outputs(&self) -> Vec<Utf8PathBuf> {
        self.tasks
            .iter()
            .map(|task| task.output().to_path_buf())
            .collect()
    }

    /// Build the task list from the source config. For crawl sources this
    /// runs the crawl itself, so prepare may take a while and leaves depth
    /// checkpoints behind.
    pub fn prepare(
        &mut self,
        source_dir: &Utf8Path,
        config: &SourceConfig,
        ignore_progress: bool,
    ) -> Result<(), PipelineError> {
        self.tasks.clear();
        self.auth = config
            .auth
            .as_deref()
            .map(|rel| load_auth(&source_dir.join(rel)))
            .transpose()?;
        fs_util::ensure_dir(&self.stage_dir)?;

        match config.retrieve_type {
            RetrieveType::Url => {
                for entry in &config.downloading.urls {
                    let dest = DataFile::with_properties(
                        self.stage_dir.join(&entry.name),
                        entry.properties.clone(),
                    );
                    self.tasks.push(DownloadTask::Url {
                        url: entry.url.clone(),
                        dest,
                    });
                }
            }
            RetrieveType::Crawl => {
                let crawl = config
                    .downloading
                    .crawl
                    .as_ref()
                    .ok_or_else(|| PipelineError::ConfigParse("missing crawl section".into()))?;
                let result = self.run_crawl(crawl, ignore_progress)?;
                info!(
                    files = result.files.len(),
                    depths = result.depths,
                    errors = result.error_folders.len(),
                    "crawl finished"
                );
                for file in result.files {
                    let name = output_name(&crawl.entry_url, &file);
                    let dest = DataFile::new(self.stage_dir.join(name));
                    self.tasks.push(DownloadTask::Url { url: file, dest });
                }
            }
            RetrieveType::Script => {
                let spec = config
                    .downloading
                    .script
                    .as_ref()
                    .ok_or_else(|| PipelineError::ConfigParse("missing script section".into()))?;
                let script = Script::from_spec(spec)?;
                let declared = spec.outputs.first().ok_or_else(|| PipelineError::Script {
                    script: script.identifier(),
                    message: "download script declares no output".to_string(),
                })?;
                let output = DataFile::new(self.stage_dir.join(declared));
                self.tasks.push(DownloadTask::Script(OutputScript::new(script, output)));
            }
        }
        Ok(())
    }

    fn run_crawl(
        &self,
        crawl: &CrawlConfig,
        ignore_progress: bool,
    ) -> Result<crate::crawler::CrawlResult, PipelineError> {
        let filter = crawl
            .filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|err| PipelineError::ConfigParse(format!("bad crawl filter: {err}")))?;
        let settings = CrawlSettings {
            entry_url: crawl.entry_url.clone(),
            filter,
            max_depth: usize::try_from(crawl.max_depth).ok(),
            auth: self.auth.clone(),
            workers: crawl.workers,
            retries: crawl.retries as usize,
        };
        let fetcher = HttpPageFetcher::new(crawl.retries as usize)?;
        Crawler::new(settings, self.progress_dir.clone(), fetcher).run(ignore_progress)
    }

    /// Execute the task list under the given metadata runner scope.
    pub fn run(
        &self,
        runner: &mut crate::metadata::StageRunner<'_>,
        ctx: &ScriptContext,
        overwrite: bool,
    ) -> Result<(), PipelineError> {
        for (index, task) in self.tasks.iter().enumerate() {
            let output = task.output().to_string();
            match task {
                DownloadTask::Url { url, dest } => {
                    runner.run_task(Some(output), || {
                        if dest.exists() && !overwrite {
                            let mut custom = Map::new();
                            custom.insert("skipped".to_string(), true.into());
                            return (true, custom);
                        }
                        match self.fetcher.fetch_to(url, self.auth.as_ref(), dest.path()) {
                            Ok(bytes) => {
                                let mut custom = Map::new();
                                custom.insert("bytes".to_string(), bytes.into());
                                (true, custom)
                            }
                            Err(err) => {
                                warn!(task = index, url = %url, error = %err, "download failed");
                                (false, Map::new())
                            }
                        }
                    });
                }
                DownloadTask::Script(script) => {
                    runner.run_task(Some(output), || {
                        let outcome = script.run(ctx, self.invoker.as_ref(), overwrite);
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
    use crate::config::{DownloadingConfig, UrlEntry};
    use crate::metadata::{MetadataStore, StageRunner};
    use crate::script::{ProcessInvoker, ScriptSpec};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct MockFetcher {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MockFetcher {
        fn new(fail: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    impl FileFetcher for MockFetcher {
        fn fetch_to(
            &self,
            url: &str,
            _auth: Option<&Credentials>,
            dest: &Utf8Path,
        ) -> Result<u64, PipelineError> {
            self.calls.lock().unwrap().push(url.to_string());
            if self.fail {
                return Err(PipelineError::HttpStatus {
                    status: 500,
                    url: url.to_string(),
                });
            }
            std::fs::write(dest.as_std_path(), b"payload").unwrap();
            Ok(7)
        }
    }

    fn url_config(urls: Vec<UrlEntry>) -> SourceConfig {
        SourceConfig {
            retrieve_type: RetrieveType::Url,
            dataset_id: "ds".to_string(),
            auth: None,
            downloading: DownloadingConfig {
                urls,
                crawl: None,
                script: None,
            },
            processing: Default::default(),
            conversion: None,
            update: None,
            directories: BTreeMap::new(),
        }
    }

    fn entry(url: &str, name: &str) -> UrlEntry {
        UrlEntry {
            url: url.to_string(),
            name: name.to_string(),
            properties: Default::default(),
        }
    }

    fn manager(root: &Utf8Path, fetcher: Arc<dyn FileFetcher>) -> DownloadManager {
        DownloadManager::new(
            root.join("data/download"),
            root.join("crawlerProgress"),
            fetcher,
            Arc::new(ProcessInvoker),
        )
    }

    fn ctx(root: &Utf8Path) -> ScriptContext {
        ScriptContext::new(
            root.to_path_buf(),
            root.join("data/download"),
            root.join("data/processing"),
        )
    }

    #[test]
    fn url_tasks_download_and_record() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let fetcher = Arc::new(MockFetcher::new(false));
        let mut manager = manager(&root, fetcher.clone());
        let config = url_config(vec![entry("https://x.org/a.csv", "a.csv")]);
        manager.prepare(&root, &config, false).unwrap();

        let mut store = MetadataStore::load(&root);
        let mut runner = StageRunner::new(&mut store, "download");
        manager.run(&mut runner, &ctx(&root), false).unwrap();
        assert!(runner.finish().unwrap());

        assert!(root.join("data/download/a.csv").as_std_path().exists());
        assert_eq!(fetcher.calls.lock().unwrap().len(), 1);
        let stage = store.stage("download").unwrap();
        assert_eq!(stage.tasks[0].custom.get("bytes"), Some(&7.into()));
    }

    #[test]
    fn existing_file_is_skipped_unless_overwrite() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("data/download").as_std_path()).unwrap();
        std::fs::write(root.join("data/download/a.csv").as_std_path(), b"old").unwrap();

        let fetcher = Arc::new(MockFetcher::new(false));
        let mut manager = manager(&root, fetcher.clone());
        let config = url_config(vec![entry("https://x.org/a.csv", "a.csv")]);
        manager.prepare(&root, &config, false).unwrap();

        let mut store = MetadataStore::load(&root);
        let mut runner = StageRunner::new(&mut store, "download");
        manager.run(&mut runner, &ctx(&root), false).unwrap();
        runner.finish().unwrap();
        assert!(fetcher.calls.lock().unwrap().is_empty());

        let mut runner = StageRunner::new(&mut store, "download");
        manager.run(&mut runner, &ctx(&root), true).unwrap();
        runner.finish().unwrap();
        assert_eq!(fetcher.calls.lock().unwrap().len(), 1);
        assert_eq!(
            std::fs::read(root.join("data/download/a.csv").as_std_path()).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn failed_download_marks_task_and_continues() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let fetcher = Arc::new(MockFetcher::new(true));
        let mut manager = manager(&root, fetcher.clone());
        let config = url_config(vec![
            entry("https://x.org/a.csv", "a.csv"),
            entry("https://x.org/b.csv", "b.csv"),
        ]);
        manager.prepare(&root, &config, false).unwrap();

        let mut store = MetadataStore::load(&root);
        let mut runner = StageRunner::new(&mut store, "download");
        manager.run(&mut runner, &ctx(&root), false).unwrap();
        assert!(!runner.finish().unwrap());

        // Both URLs were attempted despite the first failing.
        assert_eq!(fetcher.calls.lock().unwrap().len(), 2);
        let stage = store.stage("download").unwrap();
        assert!(!stage.tasks[0].success);
        assert!(!stage.tasks[1].success);
    }

    #[test]
    fn auth_file_parsing() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let path = root.join("auth.txt");
        std::fs::write(path.as_std_path(), "alice\nsecret\n").unwrap();
        let auth = load_auth(&path).unwrap();
        assert_eq!(auth.user, "alice");
        assert_eq!(auth.password, "secret");

        std::fs::write(path.as_std_path(), "alice\n").unwrap();
        assert!(load_auth(&path).is_err());
    }

    #[test]
    fn script_source_builds_one_output_task() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut config = url_config(Vec::new());
        config.retrieve_type = RetrieveType::Script;
        config.downloading.script = Some(ScriptSpec {
            path: "./fetch.sh".to_string(),
            function: "fetch".to_string(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            outputs: vec!["dump.csv".to_string()],
            parallel: false,
        });

        let mut manager = manager(&root, Arc::new(MockFetcher::new(false)));
        manager.prepare(&root, &config, false).unwrap();
        assert_eq!(manager.tasks().len(), 1);
        assert_eq!(
            manager.outputs(),
            vec![root.join("data/download/dump.csv")]
        );
    }
}
