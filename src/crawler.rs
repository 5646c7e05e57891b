use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use rayon::ThreadPoolBuilder;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::fs_util;

const CHECKPOINT_PREFIX: &str = "crawler_depth_";

/// HTTP basic credentials used by authenticated crawls and URL downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// One completed breadth layer, persisted as `crawler_depth_<d>.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlLayer {
    pub folders: Vec<String>,
    pub files: Vec<String>,
    #[serde(rename = "errorFolders")]
    pub error_folders: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub entry_url: String,
    /// Anchor hrefs that do not end in `/` are kept only when this matches.
    pub filter: Option<Regex>,
    /// `None` crawls without a depth bound.
    pub max_depth: Option<usize>,
    pub auth: Option<Credentials>,
    pub workers: usize,
    pub retries: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CrawlResult {
    pub files: Vec<String>,
    pub depths: usize,
    pub error_folders: Vec<String>,
}

/// Links harvested from one fetched folder page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageLinks {
    pub folders: Vec<String>,
    pub files: Vec<String>,
}

pub trait PageFetcher: Send + Sync {
    fn fetch(&self, url: &str, auth: Option<&Credentials>) -> Result<String, PipelineError>;
}

#[derive(Clone)]
pub struct HttpPageFetcher {
    client: Client,
    retries: usize,
}

impl HttpPageFetcher {
    pub fn new(retries: usize) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("biopipe/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PipelineError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| PipelineError::Http(err.to_string()))?;
        Ok(Self { client, retries })
    }
}

impl PageFetcher for HttpPageFetcher {
    fn fetch(&self, url: &str, auth: Option<&Credentials>) -> Result<String, PipelineError> {
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(auth) = auth {
                request = request.basic_auth(&auth.user, Some(&auth.password));
            }
            match request.send() {
                Ok(response) => {
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
                    return response
                        .text()
                        .map_err(|err| PipelineError::Http(err.to_string()));
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

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub(crate) fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Breadth-first link harvester with per-depth on-disk checkpoints. A depth
/// layer is fanned out over a bounded worker pool, and its checkpoint file is
/// written only after every worker of that layer has finished, so an
/// interrupted crawl resumes at the first incomplete layer.
pub struct Crawler<F: PageFetcher> {
    settings: CrawlSettings,
    progress_dir: Utf8PathBuf,
    fetcher: F,
}

impl<F: PageFetcher> Crawler<F> {
    pub fn new(settings: CrawlSettings, progress_dir: impl Into<Utf8PathBuf>, fetcher: F) -> Self {
        Self {
            settings,
            progress_dir: progress_dir.into(),
            fetcher,
        }
    }

    fn checkpoint_path(&self, depth: usize) -> Utf8PathBuf {
        self.progress_dir
            .join(format!("{CHECKPOINT_PREFIX}{depth}.json"))
    }

    /// Completed layers on disk, ascending from depth 0 until the first gap.
    pub fn load_layers(&self) -> Result<Vec<CrawlLayer>, PipelineError> {
        let mut layers = Vec::new();
        loop {
            let path = self.checkpoint_path(layers.len());
            if !path.as_std_path().exists() {
                break;
            }
            let content = std::fs::read_to_string(path.as_std_path())
                .map_err(|err| PipelineError::CheckpointRead(err.to_string()))?;
            let layer: CrawlLayer = serde_json::from_str(&content)
                .map_err(|err| PipelineError::CheckpointRead(format!("{path}: {err}")))?;
            layers.push(layer);
        }
        Ok(layers)
    }

    pub fn purge_progress(&self) -> Result<(), PipelineError> {
        fs_util::remove_path(&self.progress_dir)
    }

    pub fn run(&self, ignore_progress: bool) -> Result<CrawlResult, PipelineError> {
        if ignore_progress {
            self.purge_progress()?;
        }
        let completed = self.load_layers();
        let completed = match completed {
            Ok(layers) => layers,
            Err(err) => {
                warn!(error = %err, "discarding unreadable crawl checkpoints");
                self.purge_progress()?;
                Vec::new()
            }
        };

        let mut result = CrawlResult::default();
        let mut pending: Vec<String> = vec![self.settings.entry_url.clone()];
        let mut depth = 0usize;
        for layer in &completed {
            result.files.extend(layer.files.iter().cloned());
            result.error_folders.extend(layer.error_folders.iter().cloned());
            pending = layer.folders.clone();
            depth += 1;
        }
        result.depths = depth;
        if depth > 0 {
            info!(depth, "resuming crawl from checkpoint");
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.settings.workers.max(1))
            .build()
            .map_err(|err| PipelineError::Http(err.to_string()))?;

        while !pending.is_empty() {
            if let Some(max) = self.settings.max_depth {
                if depth > max {
                    break;
                }
            }
            debug!(depth, urls = pending.len(), "crawling layer");

            let fetched: Vec<(String, Result<String, PipelineError>)> = pool.install(|| {
                use rayon::prelude::*;
                pending
                    .par_iter()
                    .map(|url| {
                        let body = self.fetcher.fetch(url, self.settings.auth.as_ref());
                        (url.clone(), body)
                    })
                    .collect()
            });

            let mut layer = CrawlLayer::default();
            for (url, body) in fetched {
                match body {
                    Ok(body) => {
                        let links = classify_links(&url, &body, self.settings.filter.as_ref())?;
                        layer.folders.extend(links.folders);
                        layer.files.extend(links.files);
                    }
                    Err(err) => {
                        warn!(url = %url, error = %err, "folder fetch failed");
                        layer.error_folders.push(url);
                    }
                }
            }

            let content = serde_json::to_vec_pretty(&layer)
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            fs_util::write_bytes_atomic(&self.checkpoint_path(depth), &content)?;

            result.files.extend(layer.files.iter().cloned());
            result.error_folders.extend(layer.error_folders.iter().cloned());
            pending = layer.folders;
            result.depths = depth + 1;

            if self.settings.max_depth == Some(depth) {
                break;
            }
            depth += 1;
        }

        Ok(result)
    }
}

/// Parse anchors out of a folder listing page. An href ending in `/` is a
/// subfolder relative to the page; anything else is a file candidate, kept
/// only when it passes the filter.
pub fn classify_links(
    page_url: &str,
    body: &str,
    filter: Option<&Regex>,
) -> Result<PageLinks, PipelineError> {
    let document = Html::parse_document(body);
    let selector =
        Selector::parse("a[href]").map_err(|err| PipelineError::Http(err.to_string()))?;
    let mut links = PageLinks::default();
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with('?')
            || href.starts_with("mailto:")
            || href.starts_with("../")
            || href == "./"
            || href == "/"
        {
            continue;
        }
        if href.ends_with('/') {
            links.folders.push(resolve_href(page_url, href));
        } else if filter.map(|regex| regex.is_match(href)).unwrap_or(true) {
            links.files.push(resolve_href(page_url, href));
        }
    }
    Ok(links)
}

fn resolve_href(page_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(tail) = href.strip_prefix('/') {
        if let Some(scheme_end) = page_url.find("://") {
            if let Some(host_end) = page_url[scheme_end + 3..].find('/') {
                return format!("{}/{}", &page_url[..scheme_end + 3 + host_end], tail);
            }
        }
        return format!("{}/{}", page_url.trim_end_matches('/'), tail);
    }
    format!("{}/{}", page_url.trim_end_matches('/'), href)
}

/// Output file name for a crawled URL: the URL path below the entry URL,
/// joined with underscores.
pub fn output_name(entry_url: &str, file_url: &str) -> String {
    let tail = file_url
        .strip_prefix(entry_url.trim_end_matches('/'))
        .unwrap_or(file_url)
        .trim_start_matches('/');
    if tail.is_empty() {
        return file_url
            .rsplit('/')
            .next()
            .unwrap_or(file_url)
            .to_string();
    }
    tail.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockFetcher {
        pages: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl MockFetcher {
        fn new(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PageFetcher for MockFetcher {
        fn fetch(&self, url: &str, _auth: Option<&Credentials>) -> Result<String, PipelineError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| PipelineError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                })
        }
    }

    fn progress_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().join("crawlerProgress")).unwrap();
        (temp, dir)
    }

    fn settings(max_depth: Option<usize>) -> CrawlSettings {
        CrawlSettings {
            entry_url: "https://host/data/".to_string(),
            filter: None,
            max_depth,
            auth: None,
            workers: 4,
            retries: 0,
        }
    }

    const ROOT_PAGE: &str = r#"<html><body>
        <a href="A/">A</a>
        <a href="B/">B</a>
        <a href="readme.txt">readme</a>
        <a href="../">up</a>
    </body></html>"#;

    #[test]
    fn classify_splits_folders_and_files() {
        let links = classify_links("https://host/data/", ROOT_PAGE, None).unwrap();
        assert_eq!(
            links.folders,
            vec!["https://host/data/A/", "https://host/data/B/"]
        );
        assert_eq!(links.files, vec!["https://host/data/readme.txt"]);
    }

    #[test]
    fn filter_applies_to_files_only() {
        let regex = Regex::new(r"\.csv$").unwrap();
        let body = r#"<a href="A/">a</a><a href="x.csv">x</a><a href="y.txt">y</a>"#;
        let links = classify_links("https://host/", body, Some(&regex)).unwrap();
        assert_eq!(links.folders.len(), 1);
        assert_eq!(links.files, vec!["https://host/x.csv"]);
    }

    #[test]
    fn max_depth_zero_records_entry_children_only() {
        let (_temp, dir) = progress_dir();
        let fetcher = MockFetcher::new(&[("https://host/data/", ROOT_PAGE)]);
        let crawler = Crawler::new(settings(Some(0)), dir.clone(), fetcher);

        let result = crawler.run(false).unwrap();
        assert_eq!(result.files, vec!["https://host/data/readme.txt"]);
        assert!(dir.join("crawler_depth_0.json").as_std_path().exists());
        assert!(!dir.join("crawler_depth_1.json").as_std_path().exists());
    }

    #[test]
    fn failed_folders_go_to_error_layer() {
        let (_temp, dir) = progress_dir();
        let fetcher = MockFetcher::new(&[
            ("https://host/data/", ROOT_PAGE),
            ("https://host/data/A/", r#"<a href="a.csv">a</a>"#),
            // B intentionally missing.
        ]);
        let crawler = Crawler::new(settings(None), dir.clone(), fetcher);

        let result = crawler.run(false).unwrap();
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.error_folders, vec!["https://host/data/B/"]);

        let layers = crawler.load_layers().unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[1].error_folders, vec!["https://host/data/B/"]);
    }

    #[test]
    fn resume_skips_completed_layers() {
        let (_temp, dir) = progress_dir();
        let depth0 = CrawlLayer {
            folders: vec![
                "https://host/data/A/".to_string(),
                "https://host/data/B/".to_string(),
            ],
            files: vec!["https://host/data/readme.txt".to_string()],
            error_folders: Vec::new(),
        };
        fs_util::write_bytes_atomic(
            &dir.join("crawler_depth_0.json"),
            &serde_json::to_vec(&depth0).unwrap(),
        )
        .unwrap();

        let fetcher = MockFetcher::new(&[
            ("https://host/data/A/", r#"<a href="a.csv">a</a>"#),
            ("https://host/data/B/", r#"<a href="b.csv">b</a>"#),
        ]);
        let crawler = Crawler::new(settings(None), dir, fetcher);
        let result = crawler.run(false).unwrap();

        // Entry URL was never re-fetched; only depth-1 folders were visited.
        let mut calls = crawler.fetcher.calls();
        calls.sort();
        assert_eq!(
            calls,
            vec!["https://host/data/A/", "https://host/data/B/"]
        );
        assert!(result.files.contains(&"https://host/data/readme.txt".to_string()));
        assert_eq!(result.files.len(), 3);
    }

    #[test]
    fn ignore_progress_purges_checkpoints() {
        let (_temp, dir) = progress_dir();
        fs_util::write_bytes_atomic(
            &dir.join("crawler_depth_0.json"),
            &serde_json::to_vec(&CrawlLayer::default()).unwrap(),
        )
        .unwrap();

        let fetcher = MockFetcher::new(&[("https://host/data/", ROOT_PAGE)]);
        let crawler = Crawler::new(settings(Some(0)), dir, fetcher);
        let result = crawler.run(true).unwrap();
        assert_eq!(result.files.len(), 1);
        assert_eq!(crawler.fetcher.calls(), vec!["https://host/data/"]);
    }

    #[test]
    fn output_name_joins_path_tail() {
        assert_eq!(
            output_name("https://host/data/", "https://host/data/A/x.csv"),
            "A_x.csv"
        );
        assert_eq!(
            output_name("https://host/data", "https://host/data/y.csv"),
            "y.csv"
        );
        assert_eq!(
            output_name("https://host/data/", "https://other/z.csv"),
            "https:__other_z.csv"
        );
    }
}
