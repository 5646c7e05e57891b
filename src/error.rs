use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("invalid source specifier: {0}")]
    InvalidSource(String),

    #[error("no source in catalog matches '{0}'")]
    SourceNotFound(String),

    #[error("source hint '{hint}' is ambiguous: {candidates}")]
    AmbiguousSource { hint: String, candidates: String },

    #[error("missing config file in source directory {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("invalid update policy: {0}")]
    InvalidPolicy(String),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    #[error("non-unique mapping targets: {0}")]
    NonUniqueMapping(String),

    #[error("mapping table not found: {0}")]
    MappingNotFound(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("server returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("data file not found: {0}")]
    FileNotFound(String),

    #[error("operation not supported for {format} files: {operation}")]
    UnsupportedFormat { format: String, operation: String },

    #[error("incompatible union: {0}")]
    IncompatibleUnion(String),

    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("script '{script}' failed: {message}")]
    Script { script: String, message: String },

    #[error("script '{script}' did not create declared output {output}")]
    MissingScriptOutput { script: String, output: String },

    #[error("stage {stage} requires outputs from {missing}; run it first")]
    StageOrder { stage: String, missing: String },

    #[error("processing graph has no node at index {0}")]
    UnknownNode(usize),

    #[error("processing graph cycle involving node {0}")]
    GraphCycle(usize),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("crawl checkpoint unreadable: {0}")]
    CheckpointRead(String),

    #[error("run cancelled")]
    Cancelled,
}
